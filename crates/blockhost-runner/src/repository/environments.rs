use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use blockhost_db::entities::environments;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use super::to_db_time;
use crate::environment::Environment;
use crate::error::RunnerError;

/// Persisted form of an environment. `kind` names the runner type that
/// understands `payload`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentRecord {
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait EnvironmentRecordStore: Send + Sync {
    async fn insert(&self, record: &EnvironmentRecord) -> anyhow::Result<()>;

    /// `false` when no record existed for `uuid`.
    async fn delete(&self, uuid: Uuid) -> anyhow::Result<bool>;

    async fn all_for_runner(&self, runner_uuid: Uuid) -> anyhow::Result<Vec<EnvironmentRecord>>;
}

pub struct DbEnvironmentRecordStore {
    db: DatabaseConnection,
}

impl DbEnvironmentRecordStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn from_model(m: environments::Model) -> anyhow::Result<EnvironmentRecord> {
    let payload = serde_json::from_str(&m.payload)
        .with_context(|| format!("decode payload of environment {}", m.uuid))?;
    Ok(EnvironmentRecord {
        uuid: m.uuid,
        server_uuid: m.server_uuid,
        runner_uuid: m.runner_uuid,
        kind: m.kind,
        payload,
    })
}

#[async_trait]
impl EnvironmentRecordStore for DbEnvironmentRecordStore {
    async fn insert(&self, record: &EnvironmentRecord) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&record.payload).context("encode environment payload")?;
        let model = environments::ActiveModel {
            uuid: Set(record.uuid),
            server_uuid: Set(record.server_uuid),
            runner_uuid: Set(record.runner_uuid),
            kind: Set(record.kind.clone()),
            payload: Set(payload),
            created_at: Set(to_db_time(Utc::now())),
        };
        environments::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .with_context(|| format!("insert environment {}", record.uuid))?;
        Ok(())
    }

    async fn delete(&self, uuid: Uuid) -> anyhow::Result<bool> {
        let res = environments::Entity::delete_by_id(uuid)
            .exec(&self.db)
            .await
            .with_context(|| format!("delete environment {uuid}"))?;
        Ok(res.rows_affected > 0)
    }

    async fn all_for_runner(&self, runner_uuid: Uuid) -> anyhow::Result<Vec<EnvironmentRecord>> {
        let rows = environments::Entity::find()
            .filter(environments::Column::RunnerUuid.eq(runner_uuid))
            .order_by_asc(environments::Column::CreatedAt)
            .all(&self.db)
            .await
            .context("list environments for runner")?;
        rows.into_iter().map(from_model).collect()
    }
}

/// A runner's live environments, keyed by server, mirrored to a record store.
pub struct EnvironmentRepository<E> {
    store: Arc<dyn EnvironmentRecordStore>,
    live: RwLock<HashMap<Uuid, Arc<E>>>,
}

impl<E: Environment> EnvironmentRepository<E> {
    pub fn new(store: Arc<dyn EnvironmentRecordStore>) -> Self {
        Self {
            store,
            live: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<E>>> {
        self.live.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<E>>> {
        self.live.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, server_uuid: Uuid) -> Option<Arc<E>> {
        self.read().get(&server_uuid).cloned()
    }

    pub fn get_by_uuid(&self, environment_uuid: Uuid) -> Option<Arc<E>> {
        self.read()
            .values()
            .find(|e| e.uuid() == environment_uuid)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<E>> {
        self.read().values().cloned().collect()
    }

    /// Persists then publishes. Fails without side effects if the server
    /// already has an environment.
    pub async fn add(&self, env: Arc<E>, kind: &str) -> Result<(), RunnerError> {
        let server_uuid = env.server_uuid();
        if self.get(server_uuid).is_some() {
            return Err(RunnerError::already_exists("environment for server", server_uuid));
        }
        let payload = env.payload().context("encode environment payload")?;
        let record = EnvironmentRecord {
            uuid: env.uuid(),
            server_uuid,
            runner_uuid: env.runner_uuid(),
            kind: kind.to_string(),
            payload,
        };
        self.store.insert(&record).await?;
        self.write().insert(server_uuid, env);
        Ok(())
    }

    /// Publishes an environment rebuilt from an existing record.
    pub fn restore(&self, env: Arc<E>) {
        self.write().insert(env.server_uuid(), env);
    }

    /// Drops the record first; the live entry only goes once that succeeded.
    pub async fn remove(&self, server_uuid: Uuid) -> anyhow::Result<Option<Arc<E>>> {
        let Some(env) = self.get(server_uuid) else {
            return Ok(None);
        };
        if !self.store.delete(env.uuid()).await? {
            tracing::warn!(environment = %env.uuid(), "environment record already gone");
        }
        Ok(self.write().remove(&server_uuid))
    }

    pub async fn records(&self, runner_uuid: Uuid) -> anyhow::Result<Vec<EnvironmentRecord>> {
        self.store.all_for_runner(runner_uuid).await
    }
}

#[cfg(test)]
mod tests {
    use blockhost_model::RuntimeEnvironment;

    use super::*;
    use crate::environment::ProcessSlot;
    use crate::process::ServerProcess;
    use crate::repository::test_db;

    struct Dummy {
        uuid: Uuid,
        server_uuid: Uuid,
        runner_uuid: Uuid,
        slot: ProcessSlot,
    }

    #[async_trait]
    impl Environment for Dummy {
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
            Ok(serde_json::json!({ "n": 1 }))
        }
        fn process_slot(&self) -> &ProcessSlot {
            &self.slot
        }
        async fn run_server(&self, _: &RuntimeEnvironment) -> Option<Arc<dyn ServerProcess>> {
            None
        }
    }

    fn dummy(server_uuid: Uuid, runner_uuid: Uuid) -> Arc<Dummy> {
        Arc::new(Dummy {
            uuid: Uuid::new_v4(),
            server_uuid,
            runner_uuid,
            slot: ProcessSlot::new(),
        })
    }

    #[tokio::test]
    async fn one_environment_per_server_and_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DbEnvironmentRecordStore::new(test_db(dir.path()).await));
        let repo = EnvironmentRepository::<Dummy>::new(store.clone());
        let runner = Uuid::new_v4();
        let server = Uuid::new_v4();

        let first = dummy(server, runner);
        repo.add(first.clone(), "local").await.unwrap();
        let err = repo.add(dummy(server, runner), "local").await.unwrap_err();
        assert!(matches!(err, RunnerError::AlreadyExists { .. }));
        assert_eq!(repo.get_by_uuid(first.uuid).unwrap().server_uuid, server);

        let records = repo.records(runner).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uuid, first.uuid);
        assert_eq!(records[0].kind, "local");
        assert_eq!(records[0].payload["n"], 1);
        assert!(store.all_for_runner(Uuid::new_v4()).await.unwrap().is_empty());

        assert!(repo.remove(server).await.unwrap().is_some());
        assert!(repo.remove(server).await.unwrap().is_none());
        assert!(repo.records(runner).await.unwrap().is_empty());
        assert!(repo.all().is_empty());
    }
}
