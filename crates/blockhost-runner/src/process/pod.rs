use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use blockhost_model::{ConsoleMessage, RuntimeEnvironment, ServerIo, ServerOutput};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Message as WsMessage, client::IntoClientRequest};
use tracing::{Instrument, info_span};

use super::{ProcessExit, ProcessStreams, ServerProcess, Subscription};

/// Address and credential of a monitor sidecar.
#[derive(Debug, Clone)]
pub struct MonitorEndpoint {
    /// `http://host:port` of the monitor, without a trailing slash.
    pub base_url: String,
    pub token: String,
}

impl MonitorEndpoint {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    pub fn status_url(&self) -> String {
        format!("{}/status", self.base_url)
    }

    pub fn kill_url(&self) -> String {
        format!("{}/kill", self.base_url)
    }

    pub fn log_url(&self) -> String {
        format!("{}/log", self.base_url)
    }

    pub fn io_url(&self, runtime: &RuntimeEnvironment) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!(
            "{ws_base}/io?port={}&max_heap_mb={}&min_heap_mb={}",
            runtime.port, runtime.max_heap_mb, runtime.min_heap_mb
        )
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// `true` when the monitor answers `/status` with `pong`.
    pub async fn is_alive(&self, http: &reqwest::Client) -> bool {
        let res = http
            .get(self.status_url())
            .header("Authorization", self.bearer())
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => resp
                .text()
                .await
                .map(|body| body.trim() == "pong")
                .unwrap_or(false),
            Ok(resp) => {
                tracing::debug!(status = %resp.status(), "monitor status probe rejected");
                false
            }
            Err(e) => {
                tracing::debug!(error = %e, "monitor status probe failed");
                false
            }
        }
    }

    /// Last lines of the server's own log file, as kept by the monitor.
    pub async fn fetch_log(&self, http: &reqwest::Client) -> anyhow::Result<Vec<String>> {
        http.get(self.log_url())
            .header("Authorization", self.bearer())
            .send()
            .await
            .context("fetch monitor log")?
            .error_for_status()
            .context("fetch monitor log (status)")?
            .json::<Vec<String>>()
            .await
            .context("parse monitor log")
    }
}

/// A server running inside a monitor pod, driven over the monitor's `/io` socket.
///
/// The monitor reports no exit status, so every exit of a pod process has
/// `code == None`.
pub struct PodProcess {
    streams: Arc<ProcessStreams>,
    input: mpsc::UnboundedSender<String>,
    endpoint: MonitorEndpoint,
    http: reqwest::Client,
}

impl PodProcess {
    /// Opens the console session. The monitor starts the server on connect
    /// if it is not already running.
    pub async fn connect(
        endpoint: MonitorEndpoint,
        runtime: &RuntimeEnvironment,
        http: reqwest::Client,
        replay_max: usize,
    ) -> anyhow::Result<Self> {
        let url = endpoint.io_url(runtime);
        let mut req = url.as_str().into_client_request()?;
        req.headers_mut()
            .insert("Authorization", endpoint.bearer().parse()?);

        let (ws, _) = tokio_tungstenite::connect_async(req)
            .await
            .with_context(|| format!("connect monitor console {}", endpoint.base_url))?;
        let (mut sink, mut stream) = ws.split();

        let streams = Arc::new(ProcessStreams::new(replay_max));
        let (input, mut input_rx) = mpsc::unbounded_channel::<String>();

        let span = info_span!("pod_console", monitor = %endpoint.base_url);
        let session_streams = streams.clone();
        tokio::spawn(
            async move {
                let streams = session_streams;
                let mut input_open = true;
                loop {
                    tokio::select! {
                        line = input_rx.recv(), if input_open => match line {
                            Some(text) => {
                                streams.emit_input(text.clone());
                                let frame = ConsoleMessage::Input { text };
                                let json = match serde_json::to_string(&frame) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        tracing::warn!(error = %e, "encode console frame");
                                        continue;
                                    }
                                };
                                if let Err(e) = sink.send(WsMessage::Text(json.into())).await {
                                    tracing::warn!(error = %e, "send console frame failed");
                                    break;
                                }
                            }
                            None => input_open = false,
                        },
                        msg = stream.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<ConsoleMessage>(&text) {
                                    Ok(ConsoleMessage::Input { text }) => streams.emit_input(text),
                                    Ok(ConsoleMessage::Log { text }) => {
                                        streams.emit_output(ServerOutput::Log(text))
                                    }
                                    Ok(ConsoleMessage::Error { text }) => {
                                        streams.emit_output(ServerOutput::Error(text))
                                    }
                                    Err(e) => tracing::debug!(error = %e, "ignoring malformed console frame"),
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::warn!(error = %e, "monitor console failed");
                                break;
                            }
                        },
                    }
                }
                let _ = sink.close().await;
                tracing::info!("monitor console closed");
                streams.finish(ProcessExit { code: None });
            }
            .instrument(span),
        );

        Ok(Self {
            streams,
            input,
            endpoint,
            http,
        })
    }
}

#[async_trait]
impl ServerProcess for PodProcess {
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
        if self.input.send("stop".to_string()).is_err() {
            tracing::debug!("console already closed; skipping stop command");
        }
    }

    async fn request_forcible_stop(&self) {
        let res = self
            .http
            .post(self.endpoint.kill_url())
            .header("Authorization", self.endpoint.bearer())
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(e) = res {
            tracing::warn!(error = %e, monitor = %self.endpoint.base_url, "monitor kill failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use blockhost_model::ProcessMessage;
    use tokio::net::TcpListener;

    use super::*;

    /// One-shot monitor: echoes the first input line as a log line, then hangs up.
    async fn echo_monitor() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    let frame: ConsoleMessage = serde_json::from_str(&text).unwrap();
                    if let ConsoleMessage::Input { text } = frame {
                        let reply = ConsoleMessage::Log {
                            text: format!("echo: {text}"),
                        };
                        let json = serde_json::to_string(&reply).unwrap();
                        ws.send(WsMessage::Text(json.into())).await.unwrap();
                        ws.close(None).await.unwrap();
                    }
                }
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn io_url_carries_runtime() {
        let endpoint = MonitorEndpoint::new("http://mc-1.games.svc:8080/", "t");
        assert_eq!(
            endpoint.io_url(&RuntimeEnvironment::default()),
            "ws://mc-1.games.svc:8080/io?port=25565&max_heap_mb=2048&min_heap_mb=1024"
        );
        assert_eq!(endpoint.kill_url(), "http://mc-1.games.svc:8080/kill");
    }

    #[tokio::test]
    async fn console_round_trip_and_unknown_exit() {
        let base = echo_monitor().await;
        let p = PodProcess::connect(
            MonitorEndpoint::new(base, "secret"),
            &RuntimeEnvironment::default(),
            reqwest::Client::new(),
            100,
        )
        .await
        .unwrap();
        let mut io = p.interleaved_io();
        p.input().send("list".to_string()).unwrap();

        assert_eq!(
            io.recv().await,
            Some(ProcessMessage::Io(ServerIo::Input("list".to_string())))
        );
        assert_eq!(
            io.recv().await,
            Some(ProcessMessage::Io(ServerIo::Output(ServerOutput::Log(
                "echo: list".to_string()
            ))))
        );
        assert_eq!(io.recv().await, Some(ProcessMessage::End { exit_code: None }));
        assert_eq!(p.wait_for_exit().await, ProcessExit { code: None });
    }

    #[tokio::test]
    async fn unreachable_monitor_fails_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let res = PodProcess::connect(
            MonitorEndpoint::new(format!("http://{addr}"), "secret"),
            &RuntimeEnvironment::default(),
            reqwest::Client::new(),
            100,
        )
        .await;
        assert!(res.is_err());
    }
}
