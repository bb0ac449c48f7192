//! Entity для таблицы nodes.

use crate::enums::{NodeStatus, SyncStatus};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Отображаемое имя (уникальность не требуется)
    pub name: String,

    /// Произвольная метка региона
    pub region: String,

    /// Хост узла
    pub address: String,

    /// Порт сервиса (1–65535)
    pub port: i32,

    /// Вес для пропорционального распределения нагрузки
    pub weight: i32,

    /// Лимит пользователей, 0 = без ограничений
    pub max_users: i32,

    /// Включён ли узел администратором
    pub enabled: bool,

    pub status: NodeStatus,

    /// Задержка TCP-пробы, мс
    pub latency_ms: i32,

    /// Последний heartbeat (RFC 3339)
    pub last_seen_at: Option<String>,

    pub sync_status: SyncStatus,

    /// Момент последнего перехода в synced (RFC 3339)
    pub synced_at: Option<String>,

    /// Ревизия конфигурации, которую узел должен применить
    pub config_revision: i64,

    /// Ревизия, о применении которой сообщил агент
    pub applied_revision: i64,

    /// Ошибка синхронизации от агента или установщика
    pub sync_error: Option<String>,

    /// JSON-массив тегов
    pub tags: String,

    /// JSON-массив IP/CIDR
    pub ip_whitelist: String,

    pub created_at: String,

    pub updated_at: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn tag_list(&self) -> Vec<String> {
        serde_json::from_str(&self.tags).unwrap_or_default()
    }

    pub fn ip_whitelist_list(&self) -> Vec<String> {
        serde_json::from_str(&self.ip_whitelist).unwrap_or_default()
    }
}
