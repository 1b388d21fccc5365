use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use blockhost_model::{
    ConsoleMessage, CurrentRunInfo, MinecraftServer, PastRun, ProcessMessage, RunOverrides,
    RunnerInfo,
};
use blockhost_runner::CurrentRun;
use futures_util::{SinkExt, StreamExt};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::service::{CreateServer, Service};

type ApiResult<T> = Result<Json<T>, ServiceError>;

pub fn router(service: Service) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/runners", get(list_runners))
        .route("/api/servers", get(list_servers).post(create_server))
        .route(
            "/api/servers/:id",
            get(get_server).patch(rename_server).delete(delete_server),
        )
        .route(
            "/api/servers/:id/run",
            get(current_run_of_server)
                .post(start_run)
                .delete(stop_run_of_server),
        )
        .route("/api/servers/:id/past-runs", get(past_runs_of_server))
        .route("/api/runs/current", get(list_current_runs))
        .route("/api/runs/current/:id", delete(stop_run))
        .route("/api/runs/current/:id/console", get(console))
        .route("/api/runs/past", get(list_past_runs))
        .route("/api/runs/past/:id", get(get_past_run))
        .with_state(service)
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    runners: usize,
}

async fn healthz(State(svc): State<Service>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        runners: svc.registry().all().len(),
    })
}

async fn list_runners(State(svc): State<Service>) -> Json<Vec<RunnerInfo>> {
    Json(svc.get_runners())
}

async fn list_servers(State(svc): State<Service>) -> ApiResult<Vec<MinecraftServer>> {
    Ok(Json(svc.get_all_servers().await?))
}

async fn create_server(
    State(svc): State<Service>,
    Json(req): Json<CreateServer>,
) -> Result<(StatusCode, Json<MinecraftServer>), ServiceError> {
    Ok((StatusCode::CREATED, Json(svc.create_server(req).await?)))
}

async fn get_server(State(svc): State<Service>, Path(id): Path<Uuid>) -> ApiResult<MinecraftServer> {
    Ok(Json(svc.get_server(id).await?))
}

#[derive(serde::Deserialize)]
struct Rename {
    name: String,
}

async fn rename_server(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
    Json(req): Json<Rename>,
) -> ApiResult<MinecraftServer> {
    Ok(Json(svc.rename_server(id, &req.name).await?))
}

async fn delete_server(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    svc.delete_server(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn current_run_of_server(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
) -> ApiResult<CurrentRunInfo> {
    Ok(Json(svc.get_current_run_by_server(id)?))
}

async fn start_run(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
    Json(overrides): Json<RunOverrides>,
) -> Result<(StatusCode, Json<CurrentRunInfo>), ServiceError> {
    Ok((
        StatusCode::CREATED,
        Json(svc.create_current_run(id, overrides).await?),
    ))
}

async fn stop_run_of_server(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ServiceError> {
    svc.stop_current_run_by_server(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn past_runs_of_server(State(svc): State<Service>, Path(id): Path<Uuid>) -> ApiResult<Vec<PastRun>> {
    Ok(Json(svc.get_past_runs_by_server(id).await?))
}

async fn list_current_runs(State(svc): State<Service>) -> Json<Vec<CurrentRunInfo>> {
    Json(svc.get_all_current_runs())
}

async fn stop_run(State(svc): State<Service>, Path(id): Path<Uuid>) -> Result<StatusCode, ServiceError> {
    svc.stop_current_run(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_past_runs(State(svc): State<Service>) -> ApiResult<Vec<PastRun>> {
    Ok(Json(svc.get_all_past_runs().await?))
}

async fn get_past_run(State(svc): State<Service>, Path(id): Path<Uuid>) -> ApiResult<PastRun> {
    Ok(Json(svc.get_past_run(id).await?))
}

async fn console(
    State(svc): State<Service>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServiceError> {
    let run = svc.get_current_run(id)?;
    Ok(ws
        .on_upgrade(move |socket| console_session(run, socket))
        .into_response())
}

/// Outgoing frames carry the interleaved stream; incoming text is console input,
/// either as a raw line or as an `Input` frame.
async fn console_session(run: Arc<CurrentRun>, socket: WebSocket) {
    let span = tracing::info_span!("console", run = %run.uuid);
    async move {
        let (mut sender, mut receiver) = socket.split();
        let mut io = run.interleaved_io();
        let input = run.input();

        loop {
            tokio::select! {
                msg = io.recv() => match msg {
                    Some(ProcessMessage::Io(line)) => {
                        let json = match serde_json::to_string(&ConsoleMessage::from(line)) {
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
                    Some(ProcessMessage::End { .. }) | None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                frame = receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let line = match serde_json::from_str::<ConsoleMessage>(&text) {
                            Ok(ConsoleMessage::Input { text }) => text,
                            Ok(_) => continue,
                            Err(_) => text,
                        };
                        if input.send(line).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "console socket failed");
                        break;
                    }
                },
            }
        }
        tracing::debug!("console closed");
    }
    .instrument(span)
    .await
}
