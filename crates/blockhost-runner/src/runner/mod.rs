//! Shared orchestration over runner-specific backends.
//!
//! [`Runner`] enforces one environment per server, records every run durably
//! before acknowledging it, archives runs when their process ends and
//! recovers runs left behind by an unclean shutdown. What an environment is
//! and how it gets provisioned is up to the [`RunnerBackend`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blockhost_model::{
    CurrentRunRecord, MinecraftServer, PastRun, ProcessMessage, RunOverrides, RunnerInfo,
    RunnerKind, RuntimeEnvironment, ServerIo,
};
use chrono::Utc;
use futures_util::future::join_all;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{RunnerConfig, format_error_chain};
use crate::environment::Environment;
use crate::error::RunnerError;
use crate::process::{ServerProcess, Subscription};
use crate::repository::{
    CurrentRunRecordRepository, CurrentRunRepository, EnvironmentRecord, EnvironmentRecordStore,
    EnvironmentRepository, PastRunRepository,
};
use crate::run::CurrentRun;

mod kubernetes;
mod local;

pub use kubernetes::KubernetesBackend;
pub use local::LocalBackend;

/// Removal stops a running server with a fixed budget, independent of the
/// configured stop timeouts.
const REMOVE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for an environment's slot to empty after its process exited.
const SLOT_CLEAR_GRACE: Duration = Duration::from_secs(2);

/// Runner-specific provisioning hooks.
#[async_trait]
pub trait RunnerBackend: Send + Sync + 'static {
    type Env: Environment;

    fn kind(&self) -> RunnerKind;

    /// Called once from [`MinecraftServerRunner::init`] before anything is restored.
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Provisions a fresh environment. `None` on failure, with anything
    /// partially created already rolled back.
    async fn prepare_environment(
        &self,
        server: &MinecraftServer,
        environment_uuid: Uuid,
        runner_uuid: Uuid,
    ) -> Option<Arc<Self::Env>>;

    async fn cleanup_environment(&self, env: &Self::Env) -> bool;

    /// Rebuilds a live environment from its persisted record.
    async fn restore_environment(&self, record: &EnvironmentRecord)
    -> anyhow::Result<Arc<Self::Env>>;

    /// Best-effort log of a run that ended while nobody was watching.
    async fn get_log(&self, record: &CurrentRunRecord, env: Option<&Self::Env>) -> Vec<String>;

    /// Where players connect to a run started with `runtime`.
    fn address(&self, env: &Self::Env, runtime: &RuntimeEnvironment) -> String;

    /// Adjusts the resolved runtime to what the backend can honour.
    fn effective_runtime(&self, runtime: RuntimeEnvironment) -> RuntimeEnvironment {
        runtime
    }
}

/// Stores shared by every runner in the process.
#[derive(Clone)]
pub struct RunnerDeps {
    pub current_runs: Arc<CurrentRunRepository>,
    pub records: Arc<dyn CurrentRunRecordRepository>,
    pub past_runs: Arc<dyn PastRunRepository>,
    pub environments: Arc<dyn EnvironmentRecordStore>,
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub stop_soft_timeout: Duration,
    pub stop_force_timeout: Duration,
    pub remove_soft_timeout: Duration,
    pub remove_force_timeout: Duration,
    pub past_run_max_lines: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            stop_soft_timeout: config.stop_soft_timeout,
            stop_force_timeout: config.stop_force_timeout,
            remove_soft_timeout: REMOVE_STOP_TIMEOUT,
            remove_force_timeout: REMOVE_STOP_TIMEOUT,
            past_run_max_lines: config.past_run_max_lines,
        }
    }
}

/// Object-safe view of a runner, whatever its backend.
#[async_trait]
pub trait MinecraftServerRunner: Send + Sync {
    fn uuid(&self) -> Uuid;

    fn name(&self) -> &str;

    fn kind(&self) -> RunnerKind;

    fn info(&self) -> RunnerInfo {
        RunnerInfo {
            uuid: self.uuid(),
            name: self.name().to_string(),
            kind: self.kind(),
        }
    }

    /// Startup: restores environments and archives runs a crash left
    /// behind. Never fails; returns how many runs were recovered.
    async fn init(&self) -> usize;

    /// `Ok(false)` on ordinary provisioning failure; `AlreadyExists` if the
    /// server already has an environment here.
    async fn initialize_server(&self, server: &MinecraftServer) -> Result<bool, RunnerError>;

    /// Idempotent. `Ok(false)` if a running server could not be stopped or
    /// cleanup failed; the environment is then left in place.
    async fn remove_server(&self, server_uuid: Uuid) -> Result<bool, RunnerError>;

    async fn run_server(
        &self,
        server_uuid: Uuid,
        overrides: RunOverrides,
    ) -> Result<Option<Arc<CurrentRun>>, RunnerError>;

    /// `Ok(false)` when the stop outcome is indeterminate.
    async fn stop_run(&self, run_uuid: Uuid) -> Result<bool, RunnerError>;

    /// Like [`stop_run`](Self::stop_run), but a server with no run counts as stopped.
    async fn stop_run_by_server(&self, server_uuid: Uuid) -> Result<bool, RunnerError>;

    async fn stop_all_runs(&self) -> bool;

    fn has_environment(&self, server_uuid: Uuid) -> bool;
}

pub struct Runner<B: RunnerBackend> {
    uuid: Uuid,
    name: String,
    backend: B,
    environments: EnvironmentRepository<B::Env>,
    environments_mutex: tokio::sync::Mutex<()>,
    /// Serialises run starts against removal of the same server.
    server_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    deps: RunnerDeps,
    settings: RunnerSettings,
}

impl<B: RunnerBackend> Runner<B> {
    pub fn new(
        uuid: Uuid,
        name: impl Into<String>,
        backend: B,
        deps: RunnerDeps,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            uuid,
            name: name.into(),
            backend,
            environments: EnvironmentRepository::new(deps.environments.clone()),
            environments_mutex: tokio::sync::Mutex::new(()),
            server_locks: Mutex::new(HashMap::new()),
            deps,
            settings,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn environment(&self, server_uuid: Uuid) -> Option<Arc<B::Env>> {
        self.environments.get(server_uuid)
    }

    fn server_lock(&self, server_uuid: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.server_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(server_uuid).or_default().clone()
    }

    fn forget_server_lock(&self, server_uuid: Uuid) {
        let mut locks = self.server_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&server_uuid);
    }

    async fn restore_environments(&self) {
        let records = match self.environments.records(self.uuid).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(runner = %self.uuid, error = %format_error_chain(&e), "list environments failed");
                return;
            }
        };
        for record in records {
            if record.kind != self.backend.kind().as_str() {
                tracing::warn!(environment = %record.uuid, kind = %record.kind, "environment of another runner type; skipping");
                continue;
            }
            match self.backend.restore_environment(&record).await {
                Ok(env) => self.environments.restore(env),
                Err(e) => tracing::error!(
                    environment = %record.uuid,
                    server = %record.server_uuid,
                    error = %format_error_chain(&e),
                    "restore environment failed"
                ),
            }
        }
    }

    async fn recover_runs(&self) -> usize {
        let records = match self.deps.records.all_for_runner(self.uuid).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(runner = %self.uuid, error = %format_error_chain(&e), "list run records failed");
                return 0;
            }
        };

        let mut recovered = 0;
        for record in records {
            if self.deps.current_runs.get(record.run_uuid).is_some() {
                continue;
            }
            let env = self.environments.get(record.server_uuid);
            let log = self.backend.get_log(&record, env.as_deref()).await;
            let past = PastRun::from_record(&record, None, log);
            match archive(&*self.deps.past_runs, &*self.deps.records, &past).await {
                Ok(()) => {
                    tracing::info!(run = %record.run_uuid, server = %record.server_uuid, "recovered run left by unclean shutdown");
                    recovered += 1;
                }
                Err(e) => tracing::error!(
                    run = %record.run_uuid,
                    error = %format_error_chain(&e),
                    "recover run failed"
                ),
            }
        }
        recovered
    }

    fn spawn_archiver(&self, record: CurrentRunRecord, mut io: Subscription<ServerIo>) {
        let current_runs = self.deps.current_runs.clone();
        let records = self.deps.records.clone();
        let past_runs = self.deps.past_runs.clone();
        let max_lines = self.settings.past_run_max_lines;
        let span = tracing::info_span!("archive_run", run = %record.run_uuid, server = %record.server_uuid);

        tokio::spawn(
            async move {
                let mut log = VecDeque::new();
                let mut exit_code = None;
                while let Some(msg) = io.recv().await {
                    match msg {
                        ProcessMessage::Io(line) => {
                            if log.len() >= max_lines {
                                log.pop_front();
                            }
                            log.push_back(line.render());
                        }
                        ProcessMessage::End { exit_code: code } => {
                            exit_code = code;
                            break;
                        }
                    }
                }

                current_runs.remove(record.run_uuid);
                let past = PastRun::from_record(&record, Some(Utc::now()), Vec::from(log));
                match archive(&*past_runs, &*records, &past).await {
                    Ok(()) => tracing::info!(exit_code = ?exit_code, lines = past.log.len(), "run archived"),
                    // the record stays so the next startup recovers the run
                    Err(e) => tracing::error!(error = %format_error_chain(&e), "archive run failed"),
                }
            }
            .instrument(span),
        );
    }

    async fn stop_process(&self, process: &dyn ServerProcess, soft: Duration, force: Duration) -> bool {
        process.stop(soft, force).await.is_some()
    }
}

/// Saves the past run, then drops its record. The record survives any failure.
async fn archive(
    past_runs: &dyn PastRunRepository,
    records: &dyn CurrentRunRecordRepository,
    past: &PastRun,
) -> anyhow::Result<()> {
    past_runs.add(past).await?;
    records.remove(past.uuid).await?;
    Ok(())
}

/// Archives records left by runners that are not among `known_runners`.
///
/// Nothing can observe or stop such runs any more, so they are closed with no
/// stop time and an empty log. Returns how many were archived.
pub async fn recover_orphaned_runs(deps: &RunnerDeps, known_runners: &[Uuid]) -> usize {
    let records = match deps.records.all().await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(error = %format_error_chain(&e), "list run records failed");
            return 0;
        }
    };

    let mut recovered = 0;
    for record in records
        .into_iter()
        .filter(|r| !known_runners.contains(&r.runner_uuid))
    {
        let past = PastRun::from_record(&record, None, Vec::new());
        match archive(&*deps.past_runs, &*deps.records, &past).await {
            Ok(()) => {
                tracing::warn!(
                    run = %record.run_uuid,
                    runner = %record.runner_uuid,
                    "archived run of an unregistered runner"
                );
                recovered += 1;
            }
            Err(e) => tracing::error!(
                run = %record.run_uuid,
                error = %format_error_chain(&e),
                "recover orphaned run failed"
            ),
        }
    }
    recovered
}

async fn wait_slot_empty<E: Environment>(env: &E, grace: Duration) -> bool {
    let mut slot = env.process_slot().subscribe();
    let emptied = async {
        loop {
            if slot.borrow_and_update().is_none() {
                return true;
            }
            if slot.changed().await.is_err() {
                return false;
            }
        }
    };
    tokio::time::timeout(grace, emptied).await.unwrap_or(false)
}

#[async_trait]
impl<B: RunnerBackend> MinecraftServerRunner for Runner<B> {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RunnerKind {
        self.backend.kind()
    }

    async fn init(&self) -> usize {
        if let Err(e) = self.backend.start().await {
            tracing::error!(runner = %self.uuid, error = %format_error_chain(&e), "runner backend start failed");
        }
        self.restore_environments().await;
        let recovered = self.recover_runs().await;
        tracing::info!(
            runner = %self.uuid,
            kind = self.backend.kind().as_str(),
            environments = self.environments.all().len(),
            recovered,
            "runner initialized"
        );
        recovered
    }

    async fn initialize_server(&self, server: &MinecraftServer) -> Result<bool, RunnerError> {
        let _guard = self.environments_mutex.lock().await;

        if self.environments.get(server.uuid).is_some() {
            return Err(RunnerError::already_exists("environment for server", server.uuid));
        }

        let environment_uuid = Uuid::new_v4();
        let Some(env) = self
            .backend
            .prepare_environment(server, environment_uuid, self.uuid)
            .await
        else {
            tracing::warn!(server = %server.uuid, runner = %self.uuid, "prepare environment failed");
            return Ok(false);
        };

        if let Err(e) = self.environments.add(env.clone(), self.backend.kind().as_str()).await {
            tracing::warn!(server = %server.uuid, error = %e, "persist environment failed; cleaning up");
            if !self.backend.cleanup_environment(&env).await {
                tracing::error!(environment = %environment_uuid, "cleanup of unpersisted environment failed");
            }
            return Ok(false);
        }

        tracing::info!(server = %server.uuid, environment = %environment_uuid, "environment ready");
        Ok(true)
    }

    async fn remove_server(&self, server_uuid: Uuid) -> Result<bool, RunnerError> {
        let _guard = self.environments_mutex.lock().await;
        let server_lock = self.server_lock(server_uuid);
        let _server_guard = server_lock.lock().await;

        let Some(env) = self.environments.get(server_uuid) else {
            return Ok(true);
        };

        if let Some(process) = env.current_process() {
            let stopped = self
                .stop_process(
                    &*process,
                    self.settings.remove_soft_timeout,
                    self.settings.remove_force_timeout,
                )
                .await;
            if !stopped {
                tracing::warn!(server = %server_uuid, "running server did not stop; keeping environment");
                return Ok(false);
            }
        }
        if !wait_slot_empty(&*env, SLOT_CLEAR_GRACE).await {
            tracing::warn!(server = %server_uuid, "process still attached; keeping environment");
            return Ok(false);
        }

        if !self.backend.cleanup_environment(&env).await {
            tracing::warn!(server = %server_uuid, environment = %env.uuid(), "cleanup environment failed");
            return Ok(false);
        }
        if env.current_process().is_some() {
            tracing::error!(server = %server_uuid, environment = %env.uuid(), "process attached during cleanup; keeping environment record");
            return Ok(false);
        }
        self.environments.remove(server_uuid).await?;
        self.forget_server_lock(server_uuid);
        tracing::info!(server = %server_uuid, environment = %env.uuid(), "environment removed");
        Ok(true)
    }

    async fn run_server(
        &self,
        server_uuid: Uuid,
        overrides: RunOverrides,
    ) -> Result<Option<Arc<CurrentRun>>, RunnerError> {
        let server_lock = self.server_lock(server_uuid);
        let _server_guard = server_lock.lock().await;

        let env = self
            .environments
            .get(server_uuid)
            .ok_or_else(|| RunnerError::not_found("environment for server", server_uuid))?;
        if self.deps.current_runs.get_by_server(server_uuid).is_some() {
            return Err(RunnerError::already_exists("current run for server", server_uuid));
        }

        let runtime = self.backend.effective_runtime(overrides.resolve());
        let Some(process) = env.run_server(&runtime).await else {
            tracing::warn!(server = %server_uuid, "server failed to start");
            return Ok(None);
        };
        // subscribe before anything else can observe the process ending
        let io = process.interleaved_io();

        let run = Arc::new(CurrentRun::new(
            Uuid::new_v4(),
            server_uuid,
            self.uuid,
            env.uuid(),
            runtime,
            self.backend.address(&env, &runtime),
            Utc::now(),
            process.clone(),
        ));
        let record = run.record();

        if let Err(e) = self.deps.records.add(&record).await {
            tracing::error!(
                run = %run.uuid,
                error = %format_error_chain(&e),
                "could not record run; stopping it"
            );
            self.stop_process(
                &*process,
                self.settings.stop_soft_timeout,
                self.settings.stop_force_timeout,
            )
            .await;
            return Ok(None);
        }

        if let Err(e) = self.deps.current_runs.add(run.clone()) {
            // the archiver still turns the record into a past run once the process is gone
            self.spawn_archiver(record, io);
            self.stop_process(
                &*process,
                self.settings.stop_soft_timeout,
                self.settings.stop_force_timeout,
            )
            .await;
            return Err(e);
        }
        self.spawn_archiver(record, io);

        tracing::info!(
            run = %run.uuid,
            server = %server_uuid,
            address = %run.address,
            port = runtime.port,
            "run started"
        );
        Ok(Some(run))
    }

    async fn stop_run(&self, run_uuid: Uuid) -> Result<bool, RunnerError> {
        let run = self
            .deps
            .current_runs
            .get(run_uuid)
            .filter(|run| run.runner_uuid == self.uuid)
            .ok_or_else(|| RunnerError::not_found("current run", run_uuid))?;

        let Some(process) = self
            .environments
            .get(run.server_uuid)
            .and_then(|env| env.current_process())
        else {
            return Ok(true);
        };
        let stopped = self
            .stop_process(
                &*process,
                self.settings.stop_soft_timeout,
                self.settings.stop_force_timeout,
            )
            .await;
        if !stopped {
            tracing::warn!(run = %run_uuid, "stop outcome indeterminate");
        }
        Ok(stopped)
    }

    async fn stop_run_by_server(&self, server_uuid: Uuid) -> Result<bool, RunnerError> {
        let run = self
            .deps
            .current_runs
            .get_by_server(server_uuid)
            .filter(|run| run.runner_uuid == self.uuid);
        match run {
            Some(run) => self.stop_run(run.uuid).await,
            None => Ok(true),
        }
    }

    async fn stop_all_runs(&self) -> bool {
        let processes: Vec<_> = self
            .environments
            .all()
            .into_iter()
            .filter_map(|env| env.current_process())
            .collect();
        let results = join_all(processes.iter().map(|p| {
            self.stop_process(
                &**p,
                self.settings.stop_soft_timeout,
                self.settings.stop_force_timeout,
            )
        }))
        .await;
        results.into_iter().all(|stopped| stopped)
    }

    fn has_environment(&self, server_uuid: Uuid) -> bool {
        self.environments.get(server_uuid).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use blockhost_model::{DEFAULT_PORT, ServerOutput, ServerVersion};

    use super::*;
    use crate::environment::ProcessSlot;
    use crate::process::testing::FakeProcess;
    use crate::repository::{
        DbCurrentRunRecordRepository, DbEnvironmentRecordStore, DbPastRunRepository, test_db,
    };

    struct FakeEnvironment {
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        stubborn: bool,
        slot: ProcessSlot,
        last: Mutex<Option<Arc<FakeProcess>>>,
    }

    #[async_trait]
    impl Environment for FakeEnvironment {
        fn uuid(&self) -> Uuid {
            self.uuid
        }
        fn server_uuid(&self) -> Uuid {
            self.server_uuid
        }
        fn runner_uuid(&self) -> Uuid {
            self.runner_uuid
        }
        fn payload(&self) -> serde_json::Result<serde_json::Value> {
            Ok(serde_json::json!({ "stubborn": self.stubborn }))
        }
        fn process_slot(&self) -> &ProcessSlot {
            &self.slot
        }
        async fn run_server(&self, _: &RuntimeEnvironment) -> Option<Arc<dyn ServerProcess>> {
            if self.slot.current().is_some() {
                return None;
            }
            let p = FakeProcess::new(!self.stubborn, !self.stubborn);
            *self.last.lock().unwrap() = Some(p.clone());
            self.slot.publish(p.clone());
            Some(p)
        }
    }

    #[derive(Default)]
    struct FakeBackend {
        stubborn: bool,
        fail_prepare: AtomicBool,
        cleanup_delay: Duration,
        prepared: AtomicUsize,
        cleaned: AtomicUsize,
    }

    #[async_trait]
    impl RunnerBackend for FakeBackend {
        type Env = FakeEnvironment;

        fn kind(&self) -> RunnerKind {
            RunnerKind::Local
        }

        async fn prepare_environment(
            &self,
            server: &MinecraftServer,
            environment_uuid: Uuid,
            runner_uuid: Uuid,
        ) -> Option<Arc<FakeEnvironment>> {
            // widen the window for racing initializers
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_prepare.load(Ordering::SeqCst) {
                return None;
            }
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(FakeEnvironment {
                uuid: environment_uuid,
                server_uuid: server.uuid,
                runner_uuid,
                stubborn: self.stubborn,
                slot: ProcessSlot::new(),
                last: Mutex::new(None),
            }))
        }

        async fn cleanup_environment(&self, _: &FakeEnvironment) -> bool {
            tokio::time::sleep(self.cleanup_delay).await;
            self.cleaned.fetch_add(1, Ordering::SeqCst);
            true
        }

        async fn restore_environment(
            &self,
            record: &EnvironmentRecord,
        ) -> anyhow::Result<Arc<FakeEnvironment>> {
            Ok(Arc::new(FakeEnvironment {
                uuid: record.uuid,
                server_uuid: record.server_uuid,
                runner_uuid: record.runner_uuid,
                stubborn: record.payload["stubborn"].as_bool().unwrap_or(false),
                slot: ProcessSlot::new(),
                last: Mutex::new(None),
            }))
        }

        async fn get_log(&self, record: &CurrentRunRecord, _: Option<&FakeEnvironment>) -> Vec<String> {
            vec![format!("recovered {}", record.run_uuid)]
        }

        fn address(&self, _: &FakeEnvironment, runtime: &RuntimeEnvironment) -> String {
            format!("localhost:{}", runtime.port)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        deps: RunnerDeps,
        runner_uuid: Uuid,
    }

    impl Harness {
        async fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = test_db(dir.path()).await;
            let deps = RunnerDeps {
                current_runs: Arc::new(CurrentRunRepository::new()),
                records: Arc::new(DbCurrentRunRecordRepository::new(db.clone())),
                past_runs: Arc::new(DbPastRunRepository::new(db.clone())),
                environments: Arc::new(DbEnvironmentRecordStore::new(db)),
            };
            Self {
                _dir: dir,
                deps,
                runner_uuid: Uuid::new_v4(),
            }
        }

        fn runner(&self, backend: FakeBackend) -> Arc<Runner<FakeBackend>> {
            let settings = RunnerSettings {
                stop_soft_timeout: Duration::from_millis(200),
                stop_force_timeout: Duration::from_millis(200),
                remove_soft_timeout: Duration::from_millis(50),
                remove_force_timeout: Duration::from_millis(50),
                past_run_max_lines: 100,
            };
            Arc::new(Runner::new(
                self.runner_uuid,
                "test",
                backend,
                self.deps.clone(),
                settings,
            ))
        }
    }

    fn server(runner_uuid: Uuid) -> MinecraftServer {
        MinecraftServer {
            uuid: Uuid::new_v4(),
            name: "s".to_string(),
            version: ServerVersion::release(1, 20, 0),
            runner_uuid,
            creation_time: Utc::now(),
        }
    }

    async fn wait_archived(deps: &RunnerDeps, run_uuid: Uuid) -> PastRun {
        for _ in 0..250 {
            if let Some(past) = deps.past_runs.get(run_uuid).await.unwrap() {
                if deps.records.get(run_uuid).await.unwrap().is_none() {
                    return past;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run {run_uuid} was never archived");
    }

    #[tokio::test]
    async fn concurrent_initialize_yields_one_environment() {
        let h = Harness::new().await;
        let runner = h.runner(FakeBackend::default());
        let s = server(h.runner_uuid);

        let attempts = (0..8).map(|_| {
            let runner = runner.clone();
            let s = s.clone();
            tokio::spawn(async move { runner.initialize_server(&s).await })
        });
        let results: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let ok = results.iter().filter(|r| matches!(r, Ok(true))).count();
        let exists = results
            .iter()
            .filter(|r| matches!(r, Err(RunnerError::AlreadyExists { .. })))
            .count();
        assert_eq!((ok, exists), (1, 7));
        assert_eq!(runner.backend().prepared.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.deps.environments.all_for_runner(h.runner_uuid).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_prepare_is_not_an_error() {
        let h = Harness::new().await;
        let backend = FakeBackend::default();
        backend.fail_prepare.store(true, Ordering::SeqCst);
        let runner = h.runner(backend);
        let s = server(h.runner_uuid);

        assert!(!runner.initialize_server(&s).await.unwrap());
        assert!(!runner.has_environment(s.uuid));
        assert!(matches!(
            runner.run_server(s.uuid, RunOverrides::default()).await,
            Err(RunnerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn run_stop_archive() {
        let h = Harness::new().await;
        let runner = h.runner(FakeBackend::default());
        let s = server(h.runner_uuid);
        assert!(runner.initialize_server(&s).await.unwrap());

        let run = runner
            .run_server(s.uuid, RunOverrides::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.runtime.port, DEFAULT_PORT);
        assert_eq!(run.address, "localhost:25565");
        assert!(h.deps.records.get(run.uuid).await.unwrap().is_some());
        assert!(matches!(
            runner.run_server(s.uuid, RunOverrides::default()).await,
            Err(RunnerError::AlreadyExists { .. })
        ));

        let mut io = run.interleaved_io();
        run.input().send("say hi".to_string()).unwrap();
        loop {
            match io.recv().await.unwrap() {
                ProcessMessage::Io(ServerIo::Output(ServerOutput::Log(line))) if line == "echo: say hi" => {
                    break;
                }
                ProcessMessage::End { .. } => panic!("ended early"),
                _ => {}
            }
        }

        assert!(runner.stop_run(run.uuid).await.unwrap());
        let past = wait_archived(&h.deps, run.uuid).await;
        assert!(past.stop_time.is_some());
        assert_eq!(past.server_uuid, s.uuid);
        assert!(past.log.contains(&"> say hi".to_string()));
        assert!(past.log.contains(&"echo: say hi".to_string()));
        assert!(h.deps.current_runs.get(run.uuid).is_none());

        assert!(matches!(
            runner.stop_run(run.uuid).await,
            Err(RunnerError::NotFound { .. })
        ));
        assert!(runner.stop_run_by_server(s.uuid).await.unwrap());
    }

    #[tokio::test]
    async fn overrides_apply_per_run() {
        let h = Harness::new().await;
        let runner = h.runner(FakeBackend::default());
        let s = server(h.runner_uuid);
        runner.initialize_server(&s).await.unwrap();

        let run = runner
            .run_server(
                s.uuid,
                RunOverrides {
                    port: Some(25570),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.runtime.port, 25570);
        assert!(runner.stop_all_runs().await);
        wait_archived(&h.deps, run.uuid).await;
        let env = runner.environment(s.uuid).unwrap();
        assert!(wait_slot_empty(&*env, Duration::from_secs(2)).await);

        let run = runner
            .run_server(s.uuid, RunOverrides::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.runtime.port, DEFAULT_PORT);
        assert!(runner.stop_run_by_server(s.uuid).await.unwrap());
        wait_archived(&h.deps, run.uuid).await;
    }

    #[tokio::test]
    async fn remove_refuses_while_process_survives() {
        let h = Harness::new().await;
        let runner = h.runner(FakeBackend {
            stubborn: true,
            ..Default::default()
        });
        let s = server(h.runner_uuid);
        runner.initialize_server(&s).await.unwrap();
        let run = runner
            .run_server(s.uuid, RunOverrides::default())
            .await
            .unwrap()
            .unwrap();

        assert!(!runner.remove_server(s.uuid).await.unwrap());
        assert!(runner.has_environment(s.uuid));
        assert_eq!(runner.backend().cleaned.load(Ordering::SeqCst), 0);
        assert_eq!(
            h.deps.environments.all_for_runner(h.runner_uuid).await.unwrap().len(),
            1
        );

        let env = runner.environment(s.uuid).unwrap();
        let process = env.last.lock().unwrap().clone().unwrap();
        process.honours_graceful.store(true, Ordering::SeqCst);

        assert!(runner.remove_server(s.uuid).await.unwrap());
        assert!(!runner.has_environment(s.uuid));
        assert_eq!(runner.backend().cleaned.load(Ordering::SeqCst), 1);
        assert!(runner.remove_server(s.uuid).await.unwrap());
        wait_archived(&h.deps, run.uuid).await;
    }

    #[tokio::test]
    async fn run_cannot_start_while_server_is_being_removed() {
        let h = Harness::new().await;
        let runner = h.runner(FakeBackend {
            cleanup_delay: Duration::from_millis(300),
            ..Default::default()
        });
        let s = server(h.runner_uuid);
        assert!(runner.initialize_server(&s).await.unwrap());
        let env = runner.environment(s.uuid).unwrap();

        let removal = {
            let runner = runner.clone();
            let server_uuid = s.uuid;
            tokio::spawn(async move { runner.remove_server(server_uuid).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = runner.run_server(s.uuid, RunOverrides::default()).await;
        assert!(
            matches!(started, Err(RunnerError::NotFound { .. })),
            "run started against a server under removal"
        );
        assert!(removal.await.unwrap().unwrap());

        assert!(!runner.has_environment(s.uuid));
        assert!(env.current_process().is_none());
        assert!(env.last.lock().unwrap().is_none());
        assert!(h.deps.current_runs.get_by_server(s.uuid).is_none());
        assert!(h.deps.environments.all_for_runner(h.runner_uuid).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn crash_recovery_archives_leftovers_once() {
        let h = Harness::new().await;
        let server_uuid = Uuid::new_v4();
        let mut uuids = Vec::new();
        for _ in 0..3 {
            let record = CurrentRunRecord {
                run_uuid: Uuid::new_v4(),
                server_uuid,
                runner_uuid: h.runner_uuid,
                start_time: Utc::now(),
            };
            h.deps.records.add(&record).await.unwrap();
            uuids.push(record.run_uuid);
        }

        let runner = h.runner(FakeBackend::default());
        assert_eq!(runner.init().await, 3);
        for uuid in &uuids {
            let past = h.deps.past_runs.get(*uuid).await.unwrap().unwrap();
            assert!(past.stop_time.is_none());
            assert_eq!(past.log, vec![format!("recovered {uuid}")]);
        }
        assert!(h.deps.records.all_for_runner(h.runner_uuid).await.unwrap().is_empty());

        assert_eq!(runner.init().await, 0);
        assert_eq!(h.deps.past_runs.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn orphaned_records_are_archived_without_log() {
        let h = Harness::new().await;
        let gone_runner = Uuid::new_v4();
        let orphan = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            runner_uuid: gone_runner,
            start_time: Utc::now(),
        };
        let owned = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            runner_uuid: h.runner_uuid,
            ..orphan.clone()
        };
        h.deps.records.add(&orphan).await.unwrap();
        h.deps.records.add(&owned).await.unwrap();

        assert_eq!(recover_orphaned_runs(&h.deps, &[h.runner_uuid]).await, 1);
        let past = h.deps.past_runs.get(orphan.run_uuid).await.unwrap().unwrap();
        assert!(past.stop_time.is_none());
        assert!(past.log.is_empty());
        assert!(h.deps.records.get(orphan.run_uuid).await.unwrap().is_none());
        assert!(h.deps.records.get(owned.run_uuid).await.unwrap().is_some());

        assert_eq!(recover_orphaned_runs(&h.deps, &[h.runner_uuid]).await, 0);
    }

    #[tokio::test]
    async fn environments_survive_restart() {
        let h = Harness::new().await;
        let s = server(h.runner_uuid);
        {
            let runner = h.runner(FakeBackend::default());
            assert!(runner.initialize_server(&s).await.unwrap());
        }

        let restarted = h.runner(FakeBackend::default());
        assert!(!restarted.has_environment(s.uuid));
        restarted.init().await;
        assert!(restarted.has_environment(s.uuid));
        assert!(matches!(
            restarted.initialize_server(&s).await,
            Err(RunnerError::AlreadyExists { .. })
        ));
    }
}
