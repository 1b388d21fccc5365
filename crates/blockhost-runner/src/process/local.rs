use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_model::{ServerIo, ServerOutput};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ProcessExit, ProcessStreams, ServerProcess, Subscription};

/// How long stdout/stderr readers may keep draining once the process has exited.
const READER_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Executable, arguments and working directory of a local server process.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// A server running as a child of this process, in its own process group.
pub struct LocalProcess {
    streams: Arc<ProcessStreams>,
    input: mpsc::UnboundedSender<String>,
    kill_tx: mpsc::UnboundedSender<()>,
    pgid: Option<i32>,
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // Take the server down with us if this process dies without stopping it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> Option<i32> {
    status.code()
}

impl LocalProcess {
    pub fn spawn(launch: &LaunchCommand, replay_max: usize) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(&launch.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "spawn {} (cwd {})",
                launch.program,
                launch.cwd.display()
            )
        })?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        tracing::info!(
            pid = ?pid,
            program = %launch.program,
            cwd = %launch.cwd.display(),
            "server process spawned"
        );

        let streams = Arc::new(ProcessStreams::new(replay_max));
        let (input, input_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let writer = child
            .stdin
            .take()
            .map(|stdin| spawn_writer(stdin, input_rx, streams.clone()));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, streams.clone(), ServerOutput::Log));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, streams.clone(), ServerOutput::Error));
        }

        tokio::spawn(wait_and_finish(
            child,
            kill_rx,
            writer,
            readers,
            streams.clone(),
        ));

        Ok(Self {
            streams,
            input,
            kill_tx,
            pgid,
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: i32) {
        if self.streams.exit().is_some() {
            return;
        }
        if let Some(pgid) = self.pgid {
            unsafe {
                libc::kill(-pgid, signal);
            }
        }
    }
}

fn spawn_writer(
    mut stdin: ChildStdin,
    mut input_rx: mpsc::UnboundedReceiver<String>,
    streams: Arc<ProcessStreams>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = input_rx.recv().await {
            streams.emit_input(line.clone());
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if let Err(e) = stdin.write_all(&bytes).await {
                tracing::warn!(error = %e, "write to server stdin failed");
                continue;
            }
            if let Err(e) = stdin.flush().await {
                tracing::warn!(error = %e, "flush server stdin failed");
            }
        }
    })
}

fn spawn_reader<R>(
    reader: R,
    streams: Arc<ProcessStreams>,
    wrap: fn(String) -> ServerOutput,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    streams.emit_output(wrap(line));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "read server output failed");
                    break;
                }
            }
        }
    })
}

async fn wait_and_finish(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    writer: Option<JoinHandle<()>>,
    mut readers: Vec<JoinHandle<()>>,
    streams: Arc<ProcessStreams>,
) {
    let mut kill_open = true;
    let status = loop {
        tokio::select! {
            res = child.wait() => break res,
            msg = kill_rx.recv(), if kill_open => match msg {
                Some(()) => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "kill server process");
                    }
                }
                None => kill_open = false,
            },
        }
    };

    let code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            tracing::warn!(error = %e, "wait for server process failed");
            None
        }
    };

    let drained = tokio::time::timeout(READER_DRAIN_GRACE, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("output readers still busy after exit; cancelling");
    }
    for reader in &readers {
        reader.abort();
    }
    if let Some(writer) = writer {
        writer.abort();
    }

    tracing::info!(exit_code = ?code, "server process exited");
    streams.finish(ProcessExit { code });
}

#[async_trait]
impl ServerProcess for LocalProcess {
    fn input(&self) -> mpsc::UnboundedSender<String> {
        self.input.clone()
    }

    fn output(&self) -> Subscription<ServerOutput> {
        self.streams.output()
    }

    fn interleaved_io(&self) -> Subscription<ServerIo> {
        self.streams.interleaved()
    }

    fn exit(&self) -> Option<ProcessExit> {
        self.streams.exit()
    }

    async fn wait_for_exit(&self) -> ProcessExit {
        self.streams.wait_for_exit().await
    }

    async fn request_graceful_stop(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGTERM);
        #[cfg(not(unix))]
        tracing::warn!("graceful stop is not supported on this platform");
    }

    async fn request_forcible_stop(&self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        let _ = self.kill_tx.send(());
    }
}
