use anyhow::Context;
use async_trait::async_trait;
use blockhost_db::entities::past_runs;
use blockhost_model::PastRun;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{from_db_time, to_db_time};

/// Append-only run history.
#[async_trait]
pub trait PastRunRepository: Send + Sync {
    /// Saves `run`. Saving a uuid that is already stored is a successful no-op;
    /// the return value tells whether a row was written.
    async fn add(&self, run: &PastRun) -> anyhow::Result<bool>;

    async fn get(&self, uuid: Uuid) -> anyhow::Result<Option<PastRun>>;

    async fn all(&self) -> anyhow::Result<Vec<PastRun>>;

    async fn by_server(&self, server_uuid: Uuid) -> anyhow::Result<Vec<PastRun>>;

    /// Runs saved from now on.
    fn subscribe(&self) -> broadcast::Receiver<PastRun>;
}

pub struct DbPastRunRepository {
    db: DatabaseConnection,
    updates: broadcast::Sender<PastRun>,
}

impl DbPastRunRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self { db, updates }
    }
}

fn from_model(m: past_runs::Model) -> anyhow::Result<PastRun> {
    let log: Vec<String> = serde_json::from_str(&m.log_json)
        .with_context(|| format!("decode log of past run {}", m.uuid))?;
    Ok(PastRun {
        uuid: m.uuid,
        server_uuid: m.server_uuid,
        runner_uuid: m.runner_uuid,
        start_time: from_db_time(m.start_time),
        stop_time: m.stop_time.map(from_db_time),
        log,
    })
}

#[async_trait]
impl PastRunRepository for DbPastRunRepository {
    async fn add(&self, run: &PastRun) -> anyhow::Result<bool> {
        let existing = past_runs::Entity::find_by_id(run.uuid)
            .one(&self.db)
            .await
            .context("check existing past run")?;
        if existing.is_some() {
            tracing::debug!(run = %run.uuid, "past run already saved");
            return Ok(false);
        }

        let model = past_runs::ActiveModel {
            uuid: Set(run.uuid),
            server_uuid: Set(run.server_uuid),
            runner_uuid: Set(run.runner_uuid),
            start_time: Set(to_db_time(run.start_time)),
            stop_time: Set(run.stop_time.map(to_db_time)),
            log_json: Set(serde_json::to_string(&run.log).context("encode past run log")?),
        };
        past_runs::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .with_context(|| format!("insert past run {}", run.uuid))?;

        let _ = self.updates.send(run.clone());
        Ok(true)
    }

    async fn get(&self, uuid: Uuid) -> anyhow::Result<Option<PastRun>> {
        past_runs::Entity::find_by_id(uuid)
            .one(&self.db)
            .await
            .context("load past run")?
            .map(from_model)
            .transpose()
    }

    async fn all(&self) -> anyhow::Result<Vec<PastRun>> {
        past_runs::Entity::find()
            .order_by_asc(past_runs::Column::StartTime)
            .all(&self.db)
            .await
            .context("list past runs")?
            .into_iter()
            .map(from_model)
            .collect()
    }

    async fn by_server(&self, server_uuid: Uuid) -> anyhow::Result<Vec<PastRun>> {
        past_runs::Entity::find()
            .filter(past_runs::Column::ServerUuid.eq(server_uuid))
            .order_by_asc(past_runs::Column::StartTime)
            .all(&self.db)
            .await
            .context("list past runs for server")?
            .into_iter()
            .map(from_model)
            .collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<PastRun> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::repository::test_db;

    fn sample(server_uuid: Uuid, stop: bool) -> PastRun {
        let start = Utc::now();
        PastRun {
            uuid: Uuid::new_v4(),
            server_uuid,
            runner_uuid: Uuid::new_v4(),
            start_time: start,
            stop_time: stop.then(|| start + chrono::Duration::seconds(5)),
            log: vec!["Starting minecraft server".to_string(), "> stop".to_string()],
        }
    }

    #[tokio::test]
    async fn re_adding_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DbPastRunRepository::new(test_db(dir.path()).await);
        let mut updates = repo.subscribe();
        let run = sample(Uuid::new_v4(), true);

        assert!(repo.add(&run).await.unwrap());
        assert!(!repo.add(&run).await.unwrap());
        assert_eq!(repo.all().await.unwrap().len(), 1);
        assert_eq!(updates.recv().await.unwrap().uuid, run.uuid);
        assert!(updates.try_recv().is_err());
    }

    #[tokio::test]
    async fn log_and_null_stop_time_survive_storage() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DbPastRunRepository::new(test_db(dir.path()).await);
        let server = Uuid::new_v4();
        let crashed = sample(server, false);
        repo.add(&crashed).await.unwrap();
        repo.add(&sample(Uuid::new_v4(), true)).await.unwrap();

        let loaded = repo.get(crashed.uuid).await.unwrap().unwrap();
        assert!(loaded.stop_time.is_none());
        assert_eq!(loaded.log, crashed.log);

        let for_server = repo.by_server(server).await.unwrap();
        assert_eq!(for_server.len(), 1);
        assert_eq!(for_server[0].uuid, crashed.uuid);
    }
}
