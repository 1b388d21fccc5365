use anyhow::Context;
use async_trait::async_trait;
use blockhost_db::entities::current_run_records;
use blockhost_model::CurrentRunRecord;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};
use uuid::Uuid;

use super::{from_db_time, to_db_time};

/// Durable markers of runs that were live when last seen.
#[async_trait]
pub trait CurrentRunRecordRepository: Send + Sync {
    async fn add(&self, record: &CurrentRunRecord) -> anyhow::Result<()>;

    /// `false` when no record existed for `run_uuid`.
    async fn remove(&self, run_uuid: Uuid) -> anyhow::Result<bool>;

    async fn get(&self, run_uuid: Uuid) -> anyhow::Result<Option<CurrentRunRecord>>;

    async fn all(&self) -> anyhow::Result<Vec<CurrentRunRecord>>;

    async fn all_for_runner(&self, runner_uuid: Uuid) -> anyhow::Result<Vec<CurrentRunRecord>>;
}

pub struct DbCurrentRunRecordRepository {
    db: DatabaseConnection,
}

impl DbCurrentRunRecordRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn from_model(m: current_run_records::Model) -> CurrentRunRecord {
    CurrentRunRecord {
        run_uuid: m.run_uuid,
        server_uuid: m.server_uuid,
        runner_uuid: m.runner_uuid,
        start_time: from_db_time(m.start_time),
    }
}

#[async_trait]
impl CurrentRunRecordRepository for DbCurrentRunRecordRepository {
    async fn add(&self, record: &CurrentRunRecord) -> anyhow::Result<()> {
        let model = current_run_records::ActiveModel {
            run_uuid: Set(record.run_uuid),
            server_uuid: Set(record.server_uuid),
            runner_uuid: Set(record.runner_uuid),
            start_time: Set(to_db_time(record.start_time)),
        };
        current_run_records::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .with_context(|| format!("insert current run record {}", record.run_uuid))?;
        Ok(())
    }

    async fn remove(&self, run_uuid: Uuid) -> anyhow::Result<bool> {
        let res = current_run_records::Entity::delete_by_id(run_uuid)
            .exec(&self.db)
            .await
            .with_context(|| format!("delete current run record {run_uuid}"))?;
        Ok(res.rows_affected > 0)
    }

    async fn get(&self, run_uuid: Uuid) -> anyhow::Result<Option<CurrentRunRecord>> {
        let row = current_run_records::Entity::find_by_id(run_uuid)
            .one(&self.db)
            .await
            .context("load current run record")?;
        Ok(row.map(from_model))
    }

    async fn all(&self) -> anyhow::Result<Vec<CurrentRunRecord>> {
        let rows = current_run_records::Entity::find()
            .order_by_asc(current_run_records::Column::StartTime)
            .all(&self.db)
            .await
            .context("list current run records")?;
        Ok(rows.into_iter().map(from_model).collect())
    }

    async fn all_for_runner(&self, runner_uuid: Uuid) -> anyhow::Result<Vec<CurrentRunRecord>> {
        let rows = current_run_records::Entity::find()
            .filter(current_run_records::Column::RunnerUuid.eq(runner_uuid))
            .order_by_asc(current_run_records::Column::StartTime)
            .all(&self.db)
            .await
            .context("list current run records for runner")?;
        Ok(rows.into_iter().map(from_model).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::repository::test_db;

    #[tokio::test]
    async fn add_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DbCurrentRunRecordRepository::new(test_db(dir.path()).await);
        let runner = Uuid::new_v4();
        let mine = CurrentRunRecord {
            run_uuid: Uuid::new_v4(),
            server_uuid: Uuid::new_v4(),
            runner_uuid: runner,
            start_time: Utc::now(),
        };
        let other = CurrentRunRecord {
            runner_uuid: Uuid::new_v4(),
            run_uuid: Uuid::new_v4(),
            ..mine.clone()
        };
        repo.add(&mine).await.unwrap();
        repo.add(&other).await.unwrap();
        assert!(repo.add(&mine).await.is_err());

        let for_runner = repo.all_for_runner(runner).await.unwrap();
        assert_eq!(for_runner.len(), 1);
        assert_eq!(for_runner[0].run_uuid, mine.run_uuid);
        assert_eq!(repo.all().await.unwrap().len(), 2);

        assert!(repo.remove(mine.run_uuid).await.unwrap());
        assert!(!repo.remove(mine.run_uuid).await.unwrap());
        assert!(repo.get(mine.run_uuid).await.unwrap().is_none());
    }
}
