//! Entity для таблицы node_tokens.
//!
//! Первичный ключ node_id: у узла не может быть двух строк токена.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "node_tokens")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub node_id: i32,

    /// SHA-256 (hex) от значения токена
    #[sea_orm(unique)]
    #[serde(skip_serializing)]
    pub token_hash: String,

    pub issued_at: String,

    /// NULL, пока токен действует
    pub revoked_at: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
