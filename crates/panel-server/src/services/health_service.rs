//! Реконсилер здоровья и синхронизации узлов.
//!
//! Агенты присылают heartbeat с применённой ревизией; раз в тик
//! реконсилер пересчитывает status, latency и sync_status каждого узла.
//! Только он пишет эти поля.

use crate::config::ReconcilerConfig;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use panel_entities::nodes::{ActiveModel, Column, Entity as NodeEntity, Model};
use panel_entities::{NodeStatus, SyncStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Отчёт агента.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HeartbeatReport {
    pub applied_revision: i64,
    pub sync_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatAck {
    pub config_revision: i64,
}

/// Принять heartbeat агента. Статусы здесь не меняются, их пересчитывает
/// реконсилер на следующем тике.
pub async fn record_heartbeat<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    report: HeartbeatReport,
) -> Result<HeartbeatAck, AppError> {
    let node = NodeEntity::find_by_id(node_id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Узел не найден: {node_id}")))?;
    let config_revision = node.config_revision;

    let mut model: ActiveModel = node.into();
    model.last_seen_at = Set(Some(Utc::now().to_rfc3339()));
    model.applied_revision = Set(report.applied_revision);
    model.sync_error = Set(report.sync_error.filter(|e| !e.trim().is_empty()));
    model.update(db).await?;

    tracing::debug!(
        "Heartbeat: узел {node_id} (ревизия {}/{config_revision})",
        report.applied_revision
    );
    Ok(HeartbeatAck { config_revision })
}

/// Статус здоровья по свежести heartbeat и результату TCP-пробы.
/// `probe`: None, если проба не выполнялась; Some(None), если провалена;
/// Some(Some(ms)) при успехе.
pub fn evaluate_health(
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    probe: Option<Option<u32>>,
    cfg: &ReconcilerConfig,
) -> NodeStatus {
    let Some(last_seen) = last_seen else {
        return NodeStatus::Offline;
    };
    let age = now
        .signed_duration_since(last_seen)
        .to_std()
        .unwrap_or(Duration::ZERO);

    if age > cfg.offline_after {
        NodeStatus::Offline
    } else if age > cfg.unhealthy_after || matches!(probe, Some(None)) {
        NodeStatus::Unhealthy
    } else {
        NodeStatus::Online
    }
}

/// Состояние синхронизации по ревизиям и ошибке агента.
pub fn evaluate_sync(node: &Model) -> SyncStatus {
    if node.sync_error.is_some() {
        SyncStatus::Failed
    } else if node.applied_revision == node.config_revision {
        SyncStatus::Synced
    } else {
        SyncStatus::Pending
    }
}

/// TCP-проба address:port, возвращает задержку в мс.
pub async fn probe(address: &str, port: i32, timeout: Duration) -> Option<u32> {
    let started = Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect((address, port as u16))).await {
        Ok(Ok(_)) => Some(started.elapsed().as_millis().min(u32::MAX as u128) as u32),
        _ => None,
    }
}

fn parse_time(value: &Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Записать оценку узла одним условным UPDATE: запись проходит, только
/// если ревизии узла не изменились с момента снимка. false, если узел
/// удалён или обновлён администратором/агентом после снимка.
pub async fn apply_evaluation<C: ConnectionTrait>(
    db: &C,
    snapshot: &Model,
    status: NodeStatus,
    sync_status: SyncStatus,
    latency: i32,
    now: DateTime<Utc>,
) -> Result<bool, sea_orm::DbErr> {
    let mut update = NodeEntity::update_many()
        .col_expr(Column::Status, Expr::value(status))
        .col_expr(Column::SyncStatus, Expr::value(sync_status))
        .col_expr(Column::LatencyMs, Expr::value(latency));
    if sync_status == SyncStatus::Synced && snapshot.sync_status != SyncStatus::Synced {
        update = update.col_expr(Column::SyncedAt, Expr::value(now.to_rfc3339()));
    }

    let result = update
        .filter(Column::Id.eq(snapshot.id))
        .filter(Column::ConfigRevision.eq(snapshot.config_revision))
        .filter(Column::AppliedRevision.eq(snapshot.applied_revision))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Один проход реконсилера. Возвращает число изменённых узлов.
pub async fn reconcile_once(
    db: &DatabaseConnection,
    cfg: &ReconcilerConfig,
    now: DateTime<Utc>,
) -> Result<usize, sea_orm::DbErr> {
    let nodes = NodeEntity::find().all(db).await?;

    let probes: Vec<Option<Option<u32>>> = if cfg.probe_enabled {
        join_all(nodes.iter().map(|n| async move {
            if n.enabled && n.last_seen_at.is_some() {
                Some(probe(&n.address, n.port, cfg.probe_timeout).await)
            } else {
                None
            }
        }))
        .await
    } else {
        vec![None; nodes.len()]
    };

    let mut changed = 0;
    for (node, probe) in nodes.into_iter().zip(probes) {
        let status = evaluate_health(parse_time(&node.last_seen_at), now, probe, cfg);
        // Узел, который ни разу не выходил на связь после неудачной установки,
        // остаётся failed до первого heartbeat.
        let sync_status = if node.last_seen_at.is_none() {
            node.sync_status
        } else {
            evaluate_sync(&node)
        };
        let latency = match (status, probe) {
            (NodeStatus::Online, Some(Some(ms))) => ms as i32,
            (NodeStatus::Online, None) => node.latency_ms,
            _ => 0,
        };

        if status == node.status && sync_status == node.sync_status && latency == node.latency_ms {
            continue;
        }

        if !apply_evaluation(db, &node, status, sync_status, latency, now).await? {
            tracing::debug!(
                "Узел {} удалён или изменён после снимка, оценка отложена до следующего тика",
                node.id
            );
            continue;
        }
        if status != node.status {
            tracing::info!("Узел {}: {:?} → {:?}", node.id, node.status, status);
        }
        changed += 1;
    }

    Ok(changed)
}

/// Бесконечный цикл реконсилера.
pub async fn run_reconcile_loop(db: DatabaseConnection, cfg: ReconcilerConfig) {
    let mut interval = tokio::time::interval(cfg.interval);
    loop {
        interval.tick().await;
        match reconcile_once(&db, &cfg, Utc::now()).await {
            Ok(0) => {}
            Ok(changed) => tracing::debug!("Реконсилер: обновлено узлов {changed}"),
            Err(e) => tracing::error!("Ошибка реконсилера: {e}"),
        }
    }
}
