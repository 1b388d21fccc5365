use std::sync::Arc;

use blockhost_model::RunnerInfo;
use blockhost_runner::jar::{JarApiChain, JarResourceManager};
use blockhost_runner::repository::{
    CurrentRunRepository, DbCurrentRunRecordRepository, DbEnvironmentRecordStore,
    DbJarReferenceRepository, DbPastRunRepository,
};
use blockhost_runner::{
    KubernetesBackend, LocalBackend, MinecraftServerRunner, Runner, RunnerDeps, RunnerSettings,
    recover_orphaned_runs,
};
use futures_util::future::join_all;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::config::ControlConfig;

/// Runner identities must survive restarts so crash recovery finds their records.
pub const LOCAL_RUNNER_UUID: Uuid = Uuid::from_u128(0x0b10_c4a5_7000_4000_8000_00000000_0001);
pub const KUBERNETES_RUNNER_UUID: Uuid = Uuid::from_u128(0x0b10_c4a5_7000_4000_8000_00000000_0002);

pub fn runner_deps(db: &DatabaseConnection) -> RunnerDeps {
    RunnerDeps {
        current_runs: Arc::new(CurrentRunRepository::new()),
        records: Arc::new(DbCurrentRunRecordRepository::new(db.clone())),
        past_runs: Arc::new(DbPastRunRepository::new(db.clone())),
        environments: Arc::new(DbEnvironmentRecordStore::new(db.clone())),
    }
}

/// The runners this control plane drives, fixed at startup.
#[derive(Clone)]
pub struct RunnerRegistry {
    runners: Vec<Arc<dyn MinecraftServerRunner>>,
}

impl RunnerRegistry {
    pub fn new(runners: Vec<Arc<dyn MinecraftServerRunner>>) -> Self {
        Self { runners }
    }

    /// The local runner, plus the Kubernetes runner when enabled.
    pub fn from_config(
        config: &ControlConfig,
        db: &DatabaseConnection,
        deps: &RunnerDeps,
    ) -> anyhow::Result<Self> {
        let settings = RunnerSettings::from_config(&config.runner);
        let jars = Arc::new(JarResourceManager::new(
            config.runner.jar_cache_dir(),
            Arc::new(JarApiChain::from_env()?),
            Arc::new(DbJarReferenceRepository::new(db.clone())),
        ));

        let mut runners: Vec<Arc<dyn MinecraftServerRunner>> = vec![Arc::new(Runner::new(
            LOCAL_RUNNER_UUID,
            "local",
            LocalBackend::from_config(&config.runner, jars),
            deps.clone(),
            settings,
        ))];
        if config.kubernetes {
            runners.push(Arc::new(Runner::new(
                KUBERNETES_RUNNER_UUID,
                "kubernetes",
                KubernetesBackend::from_env(&config.runner)?,
                deps.clone(),
                settings,
            )));
        }
        Ok(Self::new(runners))
    }

    pub fn get(&self, uuid: Uuid) -> Option<Arc<dyn MinecraftServerRunner>> {
        self.runners.iter().find(|r| r.uuid() == uuid).cloned()
    }

    pub fn all(&self) -> &[Arc<dyn MinecraftServerRunner>] {
        &self.runners
    }

    pub fn infos(&self) -> Vec<RunnerInfo> {
        self.runners.iter().map(|r| r.info()).collect()
    }

    /// Runs every runner's startup recovery, then archives records of runners
    /// not registered this time. Returns the number of recovered runs.
    pub async fn init_all(&self, deps: &RunnerDeps) -> usize {
        let mut recovered = 0;
        for runner in &self.runners {
            recovered += runner.init().await;
        }
        let known: Vec<Uuid> = self.runners.iter().map(|r| r.uuid()).collect();
        recovered + recover_orphaned_runs(deps, &known).await
    }

    pub async fn stop_all(&self) -> bool {
        join_all(self.runners.iter().map(|r| r.stop_all_runs()))
            .await
            .into_iter()
            .all(|stopped| stopped)
    }
}

#[cfg(test)]
mod tests {
    use blockhost_model::CurrentRunRecord;
    use chrono::Utc;

    use super::*;
    use crate::servers::test_db;

    #[tokio::test]
    async fn init_all_leaves_no_run_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = test_db(dir.path()).await;
        let deps = runner_deps(&db);
        let record = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            runner_uuid: KUBERNETES_RUNNER_UUID,
            start_time: Utc::now(),
        };
        deps.records.add(&record).await.unwrap();

        let registry = RunnerRegistry::new(Vec::new());
        assert_eq!(registry.init_all(&deps).await, 1);
        assert!(deps.records.all().await.unwrap().is_empty());
        let past = deps.past_runs.get(record.run_uuid).await.unwrap().unwrap();
        assert!(past.stop_time.is_none());
    }
}
