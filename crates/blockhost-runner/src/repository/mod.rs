//! Run bookkeeping: live runs in memory, records and history in the database.

mod current_runs;
mod environments;
mod jar_references;
mod past_runs;
mod records;

pub use current_runs::{CurrentRunRepository, RunIndex};
pub use environments::{
    DbEnvironmentRecordStore, EnvironmentRecord, EnvironmentRecordStore, EnvironmentRepository,
};
pub use jar_references::{DbJarReferenceRepository, JarReferenceRepository};
pub use past_runs::{DbPastRunRepository, PastRunRepository};
pub use records::{CurrentRunRecordRepository, DbCurrentRunRecordRepository};

use chrono::{DateTime, FixedOffset, Utc};

fn to_db_time(t: DateTime<Utc>) -> DateTime<FixedOffset> {
    t.into()
}

fn from_db_time(t: DateTime<FixedOffset>) -> DateTime<Utc> {
    t.with_timezone(&Utc)
}

#[cfg(test)]
pub(crate) async fn test_db(dir: &std::path::Path) -> sea_orm::DatabaseConnection {
    use sea_orm_migration::MigratorTrait;

    let url = format!("sqlite://{}?mode=rwc", dir.join("blockhost.db").display());
    let db = blockhost_db::connect(&url).await.unwrap();
    blockhost_migration::Migrator::up(&db, None).await.unwrap();
    db
}
