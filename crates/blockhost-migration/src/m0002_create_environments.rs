use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Environments::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Environments::Uuid)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Environments::ServerUuid).uuid().not_null())
                    .col(ColumnDef::new(Environments::RunnerUuid).uuid().not_null())
                    .col(ColumnDef::new(Environments::Kind).string().not_null())
                    .col(ColumnDef::new(Environments::Payload).text().not_null())
                    .col(
                        ColumnDef::new(Environments::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // At most one environment per server per runner.
        manager
            .create_index(
                Index::create()
                    .name("idx_environments_runner_server_unique")
                    .table(Environments::Table)
                    .col(Environments::RunnerUuid)
                    .col(Environments::ServerUuid)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_environments_runner_server_unique")
                    .table(Environments::Table)
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(Environments::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Environments {
    Table,
    Uuid,
    ServerUuid,
    RunnerUuid,
    Kind,
    Payload,
    CreatedAt,
}
