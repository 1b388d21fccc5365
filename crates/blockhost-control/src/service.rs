//! Frontend-facing operations. Every core outcome (booleans, options,
//! runner errors) is folded into `Result<_, ServiceError>` here.

use std::sync::Arc;

use blockhost_model::{
    CurrentRunInfo, MinecraftServer, PastRun, RunOverrides, RunnerInfo, ServerVersion, VersionType,
};
use blockhost_runner::CurrentRun;
use blockhost_runner::repository::{CurrentRunRepository, PastRunRepository};
use chrono::Utc;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::registry::RunnerRegistry;
use crate::servers::ServerRepository;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateServer {
    pub name: String,
    pub version: String,
    /// Inferred from `version` when absent.
    #[serde(default)]
    pub version_type: Option<VersionType>,
    pub runner_uuid: Uuid,
}

#[derive(Clone)]
pub struct Service {
    servers: Arc<ServerRepository>,
    registry: Arc<RunnerRegistry>,
    current_runs: Arc<CurrentRunRepository>,
    past_runs: Arc<dyn PastRunRepository>,
}

impl Service {
    pub fn new(
        servers: Arc<ServerRepository>,
        registry: Arc<RunnerRegistry>,
        current_runs: Arc<CurrentRunRepository>,
        past_runs: Arc<dyn PastRunRepository>,
    ) -> Self {
        Self {
            servers,
            registry,
            current_runs,
            past_runs,
        }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub async fn create_server(&self, req: CreateServer) -> Result<MinecraftServer, ServiceError> {
        let runner = self
            .registry
            .get(req.runner_uuid)
            .ok_or_else(|| ServiceError::not_found("runner", req.runner_uuid))?;
        let version = match req.version_type {
            Some(ty) => ServerVersion::parse(&req.version, ty),
            None => ServerVersion::infer(&req.version),
        }
        .map_err(|e| ServiceError::invalid(e.to_string()))?;
        let server = MinecraftServer {
            uuid: Uuid::new_v4(),
            name: req.name,
            version,
            runner_uuid: req.runner_uuid,
            creation_time: Utc::now(),
        };

        self.servers.create(&server).await?;
        let initialized = runner.initialize_server(&server).await;
        match initialized {
            Ok(true) => {
                tracing::info!(server = %server.uuid, version = %server.version, "server created");
                Ok(server)
            }
            Ok(false) => {
                self.servers.delete(server.uuid).await?;
                Err(ServiceError::unknown(format!(
                    "could not prepare an environment for server {}",
                    server.uuid
                )))
            }
            Err(e) => {
                self.servers.delete(server.uuid).await?;
                Err(e.into())
            }
        }
    }

    pub async fn get_all_servers(&self) -> Result<Vec<MinecraftServer>, ServiceError> {
        Ok(self.servers.all().await?)
    }

    pub async fn get_server(&self, uuid: Uuid) -> Result<MinecraftServer, ServiceError> {
        self.servers
            .get(uuid)
            .await?
            .ok_or_else(|| ServiceError::not_found("server", uuid))
    }

    pub async fn rename_server(&self, uuid: Uuid, name: &str) -> Result<MinecraftServer, ServiceError> {
        self.servers
            .rename(uuid, name)
            .await?
            .ok_or_else(|| ServiceError::not_found("server", uuid))
    }

    /// Removes the server's environment (stopping it if needed), then the server.
    pub async fn delete_server(&self, uuid: Uuid) -> Result<(), ServiceError> {
        let server = self.get_server(uuid).await?;
        if let Some(runner) = self.registry.get(server.runner_uuid) {
            if !runner.remove_server(uuid).await? {
                return Err(ServiceError::unknown(format!(
                    "environment of server {uuid} could not be removed"
                )));
            }
        } else {
            tracing::warn!(server = %uuid, runner = %server.runner_uuid, "runner gone; deleting server only");
        }
        self.servers.delete(uuid).await?;
        tracing::info!(server = %uuid, "server deleted");
        Ok(())
    }

    pub async fn create_current_run(
        &self,
        server_uuid: Uuid,
        overrides: RunOverrides,
    ) -> Result<CurrentRunInfo, ServiceError> {
        let server = self.get_server(server_uuid).await?;
        let runner = self
            .registry
            .get(server.runner_uuid)
            .ok_or_else(|| ServiceError::not_found("runner", server.runner_uuid))?;
        runner
            .run_server(server_uuid, overrides)
            .await?
            .map(|run| run.info())
            .ok_or_else(|| ServiceError::unknown(format!("server {server_uuid} failed to start")))
    }

    pub fn get_all_current_runs(&self) -> Vec<CurrentRunInfo> {
        self.current_runs.all().iter().map(|run| run.info()).collect()
    }

    pub fn get_current_run(&self, run_uuid: Uuid) -> Result<Arc<CurrentRun>, ServiceError> {
        self.current_runs
            .get(run_uuid)
            .ok_or_else(|| ServiceError::not_found("current run", run_uuid))
    }

    pub fn get_current_run_by_server(&self, server_uuid: Uuid) -> Result<CurrentRunInfo, ServiceError> {
        self.current_runs
            .get_by_server(server_uuid)
            .map(|run| run.info())
            .ok_or_else(|| ServiceError::not_found("current run for server", server_uuid))
    }

    pub async fn stop_current_run(&self, run_uuid: Uuid) -> Result<(), ServiceError> {
        let run = self.get_current_run(run_uuid)?;
        let runner = self
            .registry
            .get(run.runner_uuid)
            .ok_or_else(|| ServiceError::not_found("runner", run.runner_uuid))?;
        if runner.stop_run(run_uuid).await? {
            Ok(())
        } else {
            Err(ServiceError::unknown(format!("run {run_uuid} did not stop in time")))
        }
    }

    /// A server with nothing running counts as stopped.
    pub async fn stop_current_run_by_server(&self, server_uuid: Uuid) -> Result<(), ServiceError> {
        let server = self.get_server(server_uuid).await?;
        let Some(runner) = self.registry.get(server.runner_uuid) else {
            return Ok(());
        };
        if runner.stop_run_by_server(server_uuid).await? {
            Ok(())
        } else {
            Err(ServiceError::unknown(format!(
                "server {server_uuid} did not stop in time"
            )))
        }
    }

    pub async fn get_all_past_runs(&self) -> Result<Vec<PastRun>, ServiceError> {
        Ok(self.past_runs.all().await?)
    }

    pub async fn get_past_run(&self, uuid: Uuid) -> Result<PastRun, ServiceError> {
        self.past_runs
            .get(uuid)
            .await?
            .ok_or_else(|| ServiceError::not_found("past run", uuid))
    }

    pub async fn get_past_runs_by_server(&self, server_uuid: Uuid) -> Result<Vec<PastRun>, ServiceError> {
        Ok(self.past_runs.by_server(server_uuid).await?)
    }

    pub fn get_runners(&self) -> Vec<RunnerInfo> {
        self.registry.infos()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use blockhost_model::RunnerKind;
    use blockhost_runner::repository::DbPastRunRepository;
    use blockhost_runner::{MinecraftServerRunner, RunnerError};

    use super::*;
    use crate::servers::test_db;

    /// Accepts or refuses servers on demand; never runs anything.
    struct StubRunner {
        uuid: Uuid,
        accept: bool,
        environments: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl MinecraftServerRunner for StubRunner {
        fn uuid(&self) -> Uuid {
            self.uuid
        }
        fn name(&self) -> &str {
            "stub"
        }
        fn kind(&self) -> RunnerKind {
            RunnerKind::Local
        }
        async fn init(&self) -> usize {
            0
        }
        async fn initialize_server(&self, server: &MinecraftServer) -> Result<bool, RunnerError> {
            let mut envs = self.environments.lock().unwrap();
            if envs.contains(&server.uuid) {
                return Err(RunnerError::already_exists("environment for server", server.uuid));
            }
            if self.accept {
                envs.push(server.uuid);
            }
            Ok(self.accept)
        }
        async fn remove_server(&self, server_uuid: Uuid) -> Result<bool, RunnerError> {
            self.environments.lock().unwrap().retain(|s| *s != server_uuid);
            Ok(true)
        }
        async fn run_server(
            &self,
            server_uuid: Uuid,
            _: RunOverrides,
        ) -> Result<Option<Arc<CurrentRun>>, RunnerError> {
            Err(RunnerError::not_found("environment for server", server_uuid))
        }
        async fn stop_run(&self, run_uuid: Uuid) -> Result<bool, RunnerError> {
            Err(RunnerError::not_found("current run", run_uuid))
        }
        async fn stop_run_by_server(&self, _: Uuid) -> Result<bool, RunnerError> {
            Ok(true)
        }
        async fn stop_all_runs(&self) -> bool {
            true
        }
        fn has_environment(&self, server_uuid: Uuid) -> bool {
            self.environments.lock().unwrap().contains(&server_uuid)
        }
    }

    async fn service(dir: &std::path::Path, accept: bool) -> (Service, Arc<StubRunner>) {
        let db = test_db(dir).await;
        let runner = Arc::new(StubRunner {
            uuid: Uuid::new_v4(),
            accept,
            environments: Mutex::new(Vec::new()),
        });
        let as_dyn: Arc<dyn MinecraftServerRunner> = runner.clone();
        let registry = RunnerRegistry::new(vec![as_dyn]);
        let svc = Service::new(
            Arc::new(ServerRepository::new(db.clone())),
            Arc::new(registry),
            Arc::new(CurrentRunRepository::new()),
            Arc::new(DbPastRunRepository::new(db)),
        );
        (svc, runner)
    }

    fn request(runner_uuid: Uuid) -> CreateServer {
        CreateServer {
            name: "survival".to_string(),
            version: "1.20.4".to_string(),
            version_type: None,
            runner_uuid,
        }
    }

    #[tokio::test]
    async fn create_rename_delete_server() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, runner) = service(dir.path(), true).await;

        let server = svc.create_server(request(runner.uuid)).await.unwrap();
        assert_eq!(server.version, ServerVersion::release(1, 20, 4));
        assert!(runner.has_environment(server.uuid));
        assert_eq!(svc.get_all_servers().await.unwrap().len(), 1);

        let renamed = svc.rename_server(server.uuid, "creative").await.unwrap();
        assert_eq!(renamed.name, "creative");

        assert!(matches!(
            svc.get_current_run_by_server(server.uuid),
            Err(ServiceError::NotFound { .. })
        ));
        svc.stop_current_run_by_server(server.uuid).await.unwrap();
        assert!(matches!(
            svc.create_current_run(server.uuid, RunOverrides::default()).await,
            Err(ServiceError::NotFound { .. })
        ));

        svc.delete_server(server.uuid).await.unwrap();
        assert!(!runner.has_environment(server.uuid));
        assert!(matches!(
            svc.get_server(server.uuid).await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn failures_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let (svc, runner) = service(dir.path(), false).await;

        assert!(matches!(
            svc.create_server(request(Uuid::new_v4())).await,
            Err(ServiceError::NotFound { what: "runner", .. })
        ));
        assert!(matches!(
            svc.create_server(request(runner.uuid)).await,
            Err(ServiceError::Unknown(_))
        ));
        assert!(svc.get_all_servers().await.unwrap().is_empty());

        let bad = CreateServer {
            version_type: Some(VersionType::Beta),
            ..request(runner.uuid)
        };
        assert!(matches!(svc.create_server(bad).await, Err(ServiceError::Invalid(_))));

        let unreadable = CreateServer {
            version: "../escape".to_string(),
            version_type: None,
            ..request(runner.uuid)
        };
        assert!(matches!(
            svc.create_server(unreadable).await,
            Err(ServiceError::Invalid(_))
        ));
        assert!(svc.get_all_servers().await.unwrap().is_empty());

        assert!(matches!(
            svc.stop_current_run(Uuid::new_v4()).await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(matches!(
            svc.get_past_run(Uuid::new_v4()).await,
            Err(ServiceError::NotFound { .. })
        ));
        assert!(svc.get_all_past_runs().await.unwrap().is_empty());
        assert_eq!(svc.get_runners().len(), 1);
    }
}
