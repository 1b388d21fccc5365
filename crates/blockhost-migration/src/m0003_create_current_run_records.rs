use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(CurrentRunRecords::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CurrentRunRecords::RunUuid)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CurrentRunRecords::ServerUuid).uuid().not_null())
                    .col(ColumnDef::new(CurrentRunRecords::RunnerUuid).uuid().not_null())
                    .col(
                        ColumnDef::new(CurrentRunRecords::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_current_run_records_runner_uuid")
                    .table(CurrentRunRecords::Table)
                    .col(CurrentRunRecords::RunnerUuid)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_current_run_records_runner_uuid")
                    .table(CurrentRunRecords::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(CurrentRunRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum CurrentRunRecords {
    Table,
    RunUuid,
    ServerUuid,
    RunnerUuid,
    StartTime,
}
