//! Entity для таблицы node_installs: результат последней автоустановки узла.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_installs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub node_id: i32,

    pub success: bool,

    pub failed_step: Option<String>,

    /// Типизированная причина сбоя: timeout, ssh_connect, command_failed
    pub error_code: Option<String>,

    /// JSON-массив шагов установки
    #[sea_orm(column_type = "Text")]
    pub steps: String,

    #[sea_orm(column_type = "Text")]
    pub logs: String,

    pub started_at: String,

    pub finished_at: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
