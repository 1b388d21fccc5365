use sea_orm::entity::prelude::*;

/// A cached jar stays on disk while at least one row references its version.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jar_references")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub version_key: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub accessor: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
