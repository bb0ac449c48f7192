//! Перечисления, хранимые в БД строками.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Состояние здоровья узла. Пишется только реконсилером.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[sea_orm(string_value = "online")]
    Online,
    #[sea_orm(string_value = "offline")]
    Offline,
    #[sea_orm(string_value = "unhealthy")]
    Unhealthy,
}

/// Совпадает ли конфигурация узла с последней опубликованной ревизией.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[sea_orm(string_value = "synced")]
    Synced,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "failed")]
    Failed,
}

/// Политика балансировки группы. Панель только хранит её имя,
/// сама маршрутизация выполняется data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "kebab-case")]
pub enum GroupStrategy {
    #[sea_orm(string_value = "round-robin")]
    RoundRobin,
    #[sea_orm(string_value = "least-connections")]
    LeastConnections,
    #[sea_orm(string_value = "weighted")]
    Weighted,
    #[sea_orm(string_value = "geographic")]
    Geographic,
}
