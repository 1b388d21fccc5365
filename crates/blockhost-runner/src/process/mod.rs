//! Unified handle over a running Minecraft server, local or remote.

use std::time::Duration;

use async_trait::async_trait;
use blockhost_model::{ServerIo, ServerOutput};
use tokio::sync::{mpsc, watch};

mod local;
mod pod;
mod stream;

pub use local::{LaunchCommand, LocalProcess};
pub use pod::{MonitorEndpoint, PodProcess};
pub use stream::{Broadcaster, Subscription};

/// How a process ended. `code` is `None` when the exit status is unknown
/// (always the case for pod-backed processes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

#[async_trait]
pub trait ServerProcess: Send + Sync {
    /// Line sink for the server console.
    fn input(&self) -> mpsc::UnboundedSender<String>;

    /// Log and error lines, terminated by one `End`.
    fn output(&self) -> Subscription<ServerOutput>;

    /// Input and output in best-effort chronological order, terminated by one `End`.
    fn interleaved_io(&self) -> Subscription<ServerIo>;

    /// Exit status, if the process has already ended.
    fn exit(&self) -> Option<ProcessExit>;

    async fn wait_for_exit(&self) -> ProcessExit;

    async fn request_graceful_stop(&self);

    async fn request_forcible_stop(&self);

    /// Graceful stop, escalating to a forcible one after `soft`.
    ///
    /// `None` means neither deadline was met and the process state is unknown.
    async fn stop(&self, soft: Duration, forcible: Duration) -> Option<ProcessExit> {
        if let Some(exit) = self.exit() {
            return Some(exit);
        }

        self.request_graceful_stop().await;
        if let Ok(exit) = tokio::time::timeout(soft, self.wait_for_exit()).await {
            return Some(exit);
        }

        tracing::warn!(
            soft_ms = soft.as_millis() as u64,
            "process ignored graceful stop; killing"
        );
        self.request_forcible_stop().await;
        match tokio::time::timeout(forcible, self.wait_for_exit()).await {
            Ok(exit) => Some(exit),
            Err(_) => {
                tracing::error!(
                    forcible_ms = forcible.as_millis() as u64,
                    "process survived forcible stop"
                );
                None
            }
        }
    }
}

/// Output plumbing shared by the process adapters.
pub struct ProcessStreams {
    output: Broadcaster<ServerOutput>,
    interleaved: Broadcaster<ServerIo>,
    exit: watch::Sender<Option<ProcessExit>>,
}

impl ProcessStreams {
    pub fn new(replay_max: usize) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            output: Broadcaster::new(replay_max),
            interleaved: Broadcaster::new(replay_max),
            exit,
        }
    }

    pub fn emit_output(&self, line: ServerOutput) {
        self.output.emit(line.clone());
        self.interleaved.emit(ServerIo::Output(line));
    }

    pub fn emit_input(&self, line: String) {
        self.interleaved.emit(ServerIo::Input(line));
    }

    pub fn finish(&self, exit: ProcessExit) {
        self.output.finish(exit.code);
        self.interleaved.finish(exit.code);
        self.exit.send_replace(Some(exit));
    }

    pub fn output(&self) -> Subscription<ServerOutput> {
        self.output.subscribe()
    }

    pub fn interleaved(&self) -> Subscription<ServerIo> {
        self.interleaved.subscribe()
    }

    pub fn exit(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub async fn wait_for_exit(&self) -> ProcessExit {
        let mut rx = self.exit.subscribe();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit.unwrap_or_default()
    }
}
