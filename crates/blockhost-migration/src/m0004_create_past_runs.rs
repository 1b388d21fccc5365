use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PastRuns::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(PastRuns::Uuid).uuid().not_null().primary_key())
                    .col(ColumnDef::new(PastRuns::ServerUuid).uuid().not_null())
                    .col(ColumnDef::new(PastRuns::RunnerUuid).uuid().not_null())
                    .col(
                        ColumnDef::new(PastRuns::StartTime)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PastRuns::StopTime)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(PastRuns::LogJson).text().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_past_runs_server_uuid")
                    .table(PastRuns::Table)
                    .col(PastRuns::ServerUuid)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_past_runs_server_uuid")
                    .table(PastRuns::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(PastRuns::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PastRuns {
    Table,
    Uuid,
    ServerUuid,
    RunnerUuid,
    StartTime,
    StopTime,
    LogJson,
}
