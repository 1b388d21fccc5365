use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::RunnerError;
use crate::run::CurrentRun;

/// Immutable view of the live runs, indexed by run, server and environment.
#[derive(Clone, Default)]
pub struct RunIndex {
    by_run: HashMap<Uuid, Arc<CurrentRun>>,
    by_server: HashMap<Uuid, Uuid>,
    by_environment: HashMap<Uuid, Uuid>,
}

impl RunIndex {
    pub fn get(&self, run_uuid: Uuid) -> Option<&Arc<CurrentRun>> {
        self.by_run.get(&run_uuid)
    }

    pub fn by_server(&self, server_uuid: Uuid) -> Option<&Arc<CurrentRun>> {
        self.by_server
            .get(&server_uuid)
            .and_then(|run| self.by_run.get(run))
    }

    pub fn by_environment(&self, environment_uuid: Uuid) -> Option<&Arc<CurrentRun>> {
        self.by_environment
            .get(&environment_uuid)
            .and_then(|run| self.by_run.get(run))
    }

    pub fn runs(&self) -> impl Iterator<Item = &Arc<CurrentRun>> {
        self.by_run.values()
    }

    pub fn len(&self) -> usize {
        self.by_run.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_run.is_empty()
    }
}

/// In-memory store of live runs. Every change publishes a new [`RunIndex`].
pub struct CurrentRunRepository {
    state: watch::Sender<Arc<RunIndex>>,
}

impl Default for CurrentRunRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl CurrentRunRepository {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Arc::new(RunIndex::default()));
        Self { state }
    }

    /// Fails if the run uuid is taken or its server already has a live run.
    pub fn add(&self, run: Arc<CurrentRun>) -> Result<(), RunnerError> {
        let mut conflict = None;
        self.state.send_if_modified(|index| {
            if index.by_run.contains_key(&run.uuid) {
                conflict = Some(RunnerError::already_exists("run", run.uuid));
                return false;
            }
            if index.by_server.contains_key(&run.server_uuid) {
                conflict = Some(RunnerError::already_exists(
                    "run for server",
                    run.server_uuid,
                ));
                return false;
            }
            let index = Arc::make_mut(index);
            index.by_server.insert(run.server_uuid, run.uuid);
            index.by_environment.insert(run.environment_uuid, run.uuid);
            index.by_run.insert(run.uuid, run.clone());
            true
        });
        match conflict {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn remove(&self, run_uuid: Uuid) -> Option<Arc<CurrentRun>> {
        let mut removed = None;
        self.state.send_if_modified(|index| {
            if !index.by_run.contains_key(&run_uuid) {
                return false;
            }
            let index = Arc::make_mut(index);
            let run = index.by_run.remove(&run_uuid);
            if let Some(run) = &run {
                index.by_server.remove(&run.server_uuid);
                index.by_environment.remove(&run.environment_uuid);
            }
            removed = run;
            true
        });
        removed
    }

    pub fn snapshot(&self) -> Arc<RunIndex> {
        self.state.borrow().clone()
    }

    pub fn get(&self, run_uuid: Uuid) -> Option<Arc<CurrentRun>> {
        self.snapshot().get(run_uuid).cloned()
    }

    pub fn get_by_server(&self, server_uuid: Uuid) -> Option<Arc<CurrentRun>> {
        self.snapshot().by_server(server_uuid).cloned()
    }

    pub fn get_by_environment(&self, environment_uuid: Uuid) -> Option<Arc<CurrentRun>> {
        self.snapshot().by_environment(environment_uuid).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CurrentRun>> {
        let mut runs: Vec<_> = self.snapshot().runs().cloned().collect();
        runs.sort_by_key(|r| r.start_time);
        runs
    }

    pub fn all_for_runner(&self, runner_uuid: Uuid) -> Vec<Arc<CurrentRun>> {
        self.all()
            .into_iter()
            .filter(|r| r.runner_uuid == runner_uuid)
            .collect()
    }

    /// Receiver that sees every later snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RunIndex>> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use blockhost_model::RuntimeEnvironment;
    use chrono::Utc;

    use super::*;
    use crate::process::testing::FakeProcess;

    fn run(server_uuid: Uuid, runner_uuid: Uuid) -> Arc<CurrentRun> {
        Arc::new(CurrentRun::new(
            Uuid::new_v4(),
            server_uuid,
            runner_uuid,
            Uuid::new_v4(),
            RuntimeEnvironment::default(),
            "localhost:25565".to_string(),
            Utc::now(),
            FakeProcess::new(true, true),
        ))
    }

    #[tokio::test]
    async fn lookups_by_every_key() {
        let repo = CurrentRunRepository::new();
        let runner = Uuid::new_v4();
        let a = run(Uuid::new_v4(), runner);
        let b = run(Uuid::new_v4(), Uuid::new_v4());
        repo.add(a.clone()).unwrap();
        repo.add(b.clone()).unwrap();

        assert_eq!(repo.get(a.uuid).unwrap().uuid, a.uuid);
        assert_eq!(repo.get_by_server(b.server_uuid).unwrap().uuid, b.uuid);
        assert_eq!(repo.get_by_environment(a.environment_uuid).unwrap().uuid, a.uuid);
        assert_eq!(repo.all().len(), 2);
        assert_eq!(repo.all_for_runner(runner).len(), 1);

        assert!(repo.remove(a.uuid).is_some());
        assert!(repo.remove(a.uuid).is_none());
        assert!(repo.get_by_server(a.server_uuid).is_none());
        assert!(repo.get_by_environment(a.environment_uuid).is_none());
    }

    #[tokio::test]
    async fn one_live_run_per_server() {
        let repo = CurrentRunRepository::new();
        let server = Uuid::new_v4();
        repo.add(run(server, Uuid::new_v4())).unwrap();
        let second = repo.add(run(server, Uuid::new_v4()));
        assert!(matches!(second, Err(RunnerError::AlreadyExists { .. })));
        assert_eq!(repo.all().len(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let repo = CurrentRunRepository::new();
        let mut rx = repo.subscribe();
        let r = run(Uuid::new_v4(), Uuid::new_v4());
        repo.add(r.clone()).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().len(), 1);

        repo.remove(r.uuid);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_empty());
    }
}
