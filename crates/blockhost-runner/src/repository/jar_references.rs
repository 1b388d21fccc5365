use anyhow::Context;
use async_trait::async_trait;
use blockhost_db::entities::jar_references;
use chrono::Utc;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set,
    TransactionTrait,
};

/// Who still needs which cached jar. Keys are [`ServerVersion::cache_key`]s.
///
/// [`ServerVersion::cache_key`]: blockhost_model::ServerVersion::cache_key
#[async_trait]
pub trait JarReferenceRepository: Send + Sync {
    /// Registers `accessor`; registering twice is a no-op.
    async fn add(&self, version_key: &str, accessor: &str) -> anyhow::Result<()>;

    /// Drops `accessor`'s reference and returns how many remain for the
    /// version, or `None` if `accessor` held no reference.
    async fn remove_and_count(&self, version_key: &str, accessor: &str)
    -> anyhow::Result<Option<u64>>;

    async fn count(&self, version_key: &str) -> anyhow::Result<u64>;
}

pub struct DbJarReferenceRepository {
    db: DatabaseConnection,
}

impl DbJarReferenceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JarReferenceRepository for DbJarReferenceRepository {
    async fn add(&self, version_key: &str, accessor: &str) -> anyhow::Result<()> {
        let txn = self.db.begin().await?;
        let existing =
            jar_references::Entity::find_by_id((version_key.to_string(), accessor.to_string()))
                .one(&txn)
                .await
                .context("load jar reference")?;
        if existing.is_none() {
            let model = jar_references::ActiveModel {
                version_key: Set(version_key.to_string()),
                accessor: Set(accessor.to_string()),
                created_at: Set(Utc::now().into()),
            };
            jar_references::Entity::insert(model)
                .exec_without_returning(&txn)
                .await
                .context("insert jar reference")?;
        }
        txn.commit().await?;
        Ok(())
    }

    async fn remove_and_count(
        &self,
        version_key: &str,
        accessor: &str,
    ) -> anyhow::Result<Option<u64>> {
        let txn = self.db.begin().await?;
        let res =
            jar_references::Entity::delete_by_id((version_key.to_string(), accessor.to_string()))
                .exec(&txn)
                .await
                .context("delete jar reference")?;
        if res.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }
        let remaining = jar_references::Entity::find()
            .filter(jar_references::Column::VersionKey.eq(version_key))
            .count(&txn)
            .await
            .context("count jar references")?;
        txn.commit().await?;
        Ok(Some(remaining))
    }

    async fn count(&self, version_key: &str) -> anyhow::Result<u64> {
        jar_references::Entity::find()
            .filter(jar_references::Column::VersionKey.eq(version_key))
            .count(&self.db)
            .await
            .context("count jar references")
    }
}
