use sea_orm_migration::prelude::*;

mod m0001_create_servers;
mod m0002_create_environments;
mod m0003_create_current_run_records;
mod m0004_create_past_runs;
mod m0005_create_jar_references;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m0001_create_servers::Migration),
            Box::new(m0002_create_environments::Migration),
            Box::new(m0003_create_current_run_records::Migration),
            Box::new(m0004_create_past_runs::Migration),
            Box::new(m0005_create_jar_references::Migration),
        ]
    }
}
