use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JarReferences::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(JarReferences::VersionKey).string().not_null())
                    .col(ColumnDef::new(JarReferences::Accessor).string().not_null())
                    .col(
                        ColumnDef::new(JarReferences::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(JarReferences::VersionKey)
                            .col(JarReferences::Accessor),
                    )
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JarReferences::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JarReferences {
    Table,
    VersionKey,
    Accessor,
    CreatedAt,
}
