use std::sync::Arc;
use std::time::Duration;

use blockhost_control::config::ControlConfig;
use blockhost_control::registry::{RunnerRegistry, runner_deps};
use blockhost_control::routes;
use blockhost_control::servers::ServerRepository;
use blockhost_control::service::Service;
use blockhost_runner::repository::CurrentRunRecordRepository;
use sea_orm_migration::MigratorTrait;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

/// How long shutdown waits for stopped runs to be archived.
const ARCHIVE_GRACE: Duration = Duration::from_secs(15);

fn init_tracing(config: &ControlConfig) -> Option<WorkerGuard> {
    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "blockhost-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn wait_for_archives(records: &dyn CurrentRunRecordRepository) {
    let drained = tokio::time::timeout(ARCHIVE_GRACE, async {
        loop {
            match records.all().await {
                Ok(left) if left.is_empty() => return,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "list run records");
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("runs still unarchived at exit; they will be recovered on next start");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControlConfig::from_env()?;
    let _log_guard = init_tracing(&config);

    let db = blockhost_db::connect(&config.database_url).await?;
    // Apply migrations on boot (idempotent).
    blockhost_migration::Migrator::up(&db, None).await?;

    let deps = runner_deps(&db);
    let registry = Arc::new(RunnerRegistry::from_config(&config, &db, &deps)?);
    let recovered = registry.init_all(&deps).await;

    let service = Service::new(
        Arc::new(ServerRepository::new(db.clone())),
        registry.clone(),
        deps.current_runs.clone(),
        deps.past_runs.clone(),
    );
    let app = routes::router(service);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, recovered, "blockhost-control HTTP listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "listen for ctrl-c");
            }
        })
        .await?;

    tracing::info!("shutting down; stopping all runs");
    if !registry.stop_all().await {
        tracing::warn!("some runs did not stop in time");
    }
    wait_for_archives(&*deps.records).await;
    Ok(())
}
