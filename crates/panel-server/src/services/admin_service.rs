//! Административный сервис: сводная статистика панели.

use crate::error::AppError;
use crate::services::assignment_service;
use panel_entities::node_groups::Entity as GroupEntity;
use panel_entities::nodes::Entity as NodeEntity;
use panel_entities::{NodeStatus, SyncStatus};
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait};
use serde::Serialize;

/// Статистика реестра узлов.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub total_nodes: u64,
    pub online: u64,
    pub unhealthy: u64,
    pub offline: u64,
    pub sync_failed: u64,
    pub groups: u64,
    pub assigned_users: i64,
}

/// Получить статистику по узлам.
pub async fn get_stats<C: ConnectionTrait>(db: &C) -> Result<Stats, AppError> {
    let nodes = NodeEntity::find().all(db).await?;
    let mut stats = Stats {
        total_nodes: nodes.len() as u64,
        groups: GroupEntity::find().count(db).await?,
        assigned_users: assignment_service::user_counts(db).await?.values().sum(),
        ..Default::default()
    };

    for node in &nodes {
        match node.status {
            NodeStatus::Online => stats.online += 1,
            NodeStatus::Unhealthy => stats.unhealthy += 1,
            NodeStatus::Offline => stats.offline += 1,
        }
        if node.sync_status == SyncStatus::Failed {
            stats.sync_failed += 1;
        }
    }

    Ok(stats)
}
