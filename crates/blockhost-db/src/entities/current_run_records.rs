use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "current_run_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub run_uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub start_time: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
