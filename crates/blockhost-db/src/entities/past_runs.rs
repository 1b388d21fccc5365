use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "past_runs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uuid: Uuid,
    pub server_uuid: Uuid,
    pub runner_uuid: Uuid,
    pub start_time: DateTimeWithTimeZone,
    pub stop_time: Option<DateTimeWithTimeZone>,
    /// JSON array of log lines, in order.
    #[sea_orm(column_type = "Text")]
    pub log_json: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
