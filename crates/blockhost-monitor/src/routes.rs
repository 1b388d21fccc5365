use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use blockhost_model::{ConsoleMessage, ProcessMessage, RunOverrides, ServerIo};
use blockhost_runner::format_error_chain;
use blockhost_runner::process::{LocalProcess, ServerProcess};
use futures_util::{SinkExt, StreamExt};
use tracing::Instrument;

use crate::host::ServerHost;

pub fn router(host: Arc<ServerHost>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/io", get(io))
        .route("/kill", post(kill))
        .route("/log", get(log))
        .with_state(host)
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|presented| presented.trim() == token)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "unauthorized").into_response()
}

async fn status() -> &'static str {
    "pong"
}

async fn io(
    State(host): State<Arc<ServerHost>>,
    headers: HeaderMap,
    Query(overrides): Query<RunOverrides>,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&headers, &host.config().token) {
        return unauthorized();
    }
    let runtime = overrides.resolve();
    let process = match host.attach_or_start(&runtime).await {
        Ok(process) => process,
        Err(e) => {
            let msg = format_error_chain(&e);
            tracing::error!(error = %msg, "start server failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response();
        }
    };
    ws.on_upgrade(move |socket| bridge(host, process, socket))
        .into_response()
}

/// Server output goes out as `Log`/`Error` frames; `Input` frames come in.
/// Input is not echoed back. A console that goes away takes the server with it.
async fn bridge(host: Arc<ServerHost>, process: Arc<LocalProcess>, socket: WebSocket) {
    let span = tracing::info_span!("console_bridge");
    async move {
        let (mut sender, mut receiver) = socket.split();
        let mut output = process.output();
        let input = process.input();
        let mut server_ended = false;

        loop {
            tokio::select! {
                msg = output.recv() => match msg {
                    Some(ProcessMessage::Io(line)) => {
                        let frame = ConsoleMessage::from(ServerIo::Output(line));
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::warn!(error = %e, "encode console frame");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Some(ProcessMessage::End { exit_code }) => {
                        tracing::info!(exit_code = ?exit_code, "server exited");
                        server_ended = true;
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => {
                        server_ended = true;
                        break;
                    }
                },
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ConsoleMessage>(&text) {
                        Ok(ConsoleMessage::Input { text }) => {
                            if input.send(text).is_err() {
                                tracing::debug!("server input closed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(error = %e, "ignoring malformed console frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "console socket failed");
                        break;
                    }
                },
            }
        }

        if !server_ended {
            tracing::warn!("console disconnected; stopping server");
            let budget = host.config().stop_timeout;
            if process.stop(budget, budget).await.is_none() {
                tracing::error!("server survived stop after console loss");
            }
        }
    }
    .instrument(span)
    .await
}

async fn kill(State(host): State<Arc<ServerHost>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &host.config().token) {
        return unauthorized();
    }
    if host.kill().await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "no server running").into_response()
    }
}

async fn log(State(host): State<Arc<ServerHost>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &host.config().token) {
        return unauthorized();
    }
    Json(host.latest_log().await).into_response()
}
