//! Закрепление пользователей за узлами и фоновое переназначение
//! пользователей удалённых узлов.

use crate::error::AppError;
use chrono::Utc;
use panel_entities::node_assignments::{self, Column, Entity as AssignmentEntity};
use panel_entities::node_group_members::{self, Entity as MemberEntity};
use panel_entities::nodes::{self, Entity as NodeEntity};
use panel_entities::NodeStatus;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, TransactionTrait,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Число закреплённых пользователей по узлам. Считается при каждом чтении.
pub async fn user_counts<C: ConnectionTrait>(db: &C) -> Result<HashMap<i32, i64>, AppError> {
    let all = AssignmentEntity::find().all(db).await?;
    let mut counts = HashMap::new();
    for a in all {
        *counts.entry(a.node_id).or_insert(0) += 1;
    }
    Ok(counts)
}

pub async fn user_count<C: ConnectionTrait>(db: &C, node_id: i32) -> Result<i64, AppError> {
    use sea_orm::PaginatorTrait;
    let count = AssignmentEntity::find()
        .filter(Column::NodeId.eq(node_id))
        .count(db)
        .await?;
    Ok(count as i64)
}

/// Может ли узел принять ещё одного пользователя.
pub fn accepts_users(node: &nodes::Model, current_users: i64) -> bool {
    node.enabled
        && node.status != NodeStatus::Offline
        && (node.max_users == 0 || current_users < node.max_users as i64)
}

/// Закрепить пользователя за узлом (с переносом с предыдущего узла).
///
/// Вызывающий обязан держать `membership_lock`: проверка ёмкости и вставка
/// должны быть атомарны относительно других назначений.
pub async fn assign<C>(db: &C, node_id: i32, user_id: &str) -> Result<node_assignments::Model, AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(AppError::Validation("user_id обязателен".into()));
    }

    let txn = db.begin().await?;

    let node = NodeEntity::find_by_id(node_id)
        .one(&txn)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Узел не найден: {node_id}")))?;

    let existing = AssignmentEntity::find_by_id(user_id.to_string())
        .one(&txn)
        .await?;
    if let Some(a) = &existing {
        if a.node_id == node_id {
            return Ok(a.clone());
        }
    }

    if !node.enabled {
        return Err(AppError::Conflict(format!("Узел {node_id} отключён")));
    }
    if node.status == NodeStatus::Offline {
        return Err(AppError::Conflict(format!(
            "Узел {node_id} offline и не принимает пользователей"
        )));
    }
    let current = user_count(&txn, node_id).await?;
    if !accepts_users(&node, current) {
        return Err(AppError::Conflict(format!(
            "Узел {node_id} заполнен ({current}/{})",
            node.max_users
        )));
    }

    let now = Utc::now().to_rfc3339();
    let model = match existing {
        Some(a) => {
            let mut model: node_assignments::ActiveModel = a.into();
            model.node_id = Set(node_id);
            model.assigned_at = Set(now);
            model.update(&txn).await?
        }
        None => {
            node_assignments::ActiveModel {
                user_id: Set(user_id.to_string()),
                node_id: Set(node_id),
                assigned_at: Set(now),
            }
            .insert(&txn)
            .await?
        }
    };

    txn.commit().await?;
    tracing::debug!("Пользователь {user_id} закреплён за узлом {node_id}");
    Ok(model)
}

/// Открепить пользователя.
pub async fn unassign<C: ConnectionTrait>(db: &C, user_id: &str) -> Result<(), AppError> {
    let result = AssignmentEntity::delete_by_id(user_id.to_string())
        .exec(db)
        .await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound(format!(
            "Пользователь {user_id} ни за кем не закреплён"
        )));
    }
    Ok(())
}

// ── Переназначение ───────────────────────────────────────────────────────────

/// Задание на переназначение пользователей удалённого узла.
#[derive(Debug, Clone)]
pub struct ReassignJob {
    pub from_node: i32,
    /// Группы, в которых состоял удалённый узел
    pub group_ids: Vec<i32>,
    pub user_ids: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReassignReport {
    pub moved: Vec<(String, i32)>,
    pub unplaced: Vec<String>,
}

/// Выбрать узел для пользователя: сначала узлы из тех же групп, затем
/// минимальная нагрузка current_users / weight.
pub fn pick_target(
    candidates: &[nodes::Model],
    counts: &HashMap<i32, i64>,
    preferred: &HashSet<i32>,
) -> Option<i32> {
    candidates
        .iter()
        .filter(|n| n.status == NodeStatus::Online)
        .filter(|n| accepts_users(n, counts.get(&n.id).copied().unwrap_or(0)))
        .min_by(|a, b| {
            let load = |n: &nodes::Model| {
                counts.get(&n.id).copied().unwrap_or(0) as f64 / n.weight.max(1) as f64
            };
            let pref = |n: &nodes::Model| !preferred.contains(&n.id);
            pref(a)
                .cmp(&pref(b))
                .then(load(a).total_cmp(&load(b)))
                .then(a.id.cmp(&b.id))
        })
        .map(|n| n.id)
}

/// Переназначить пользователей задания. Best-effort: пользователи, для
/// которых нет подходящего узла, остаются откреплёнными.
pub async fn reassign_users(db: &DatabaseConnection, job: &ReassignJob) -> Result<ReassignReport, AppError> {
    let candidates = NodeEntity::find()
        .filter(nodes::Column::Enabled.eq(true))
        .filter(nodes::Column::Status.eq(NodeStatus::Online))
        .all(db)
        .await?;

    let preferred: HashSet<i32> = if job.group_ids.is_empty() {
        HashSet::new()
    } else {
        MemberEntity::find()
            .filter(node_group_members::Column::GroupId.is_in(job.group_ids.clone()))
            .all(db)
            .await?
            .into_iter()
            .map(|m| m.node_id)
            .collect()
    };

    let mut counts = user_counts(db).await?;
    let mut report = ReassignReport::default();

    for user_id in &job.user_ids {
        let Some(target) = pick_target(&candidates, &counts, &preferred) else {
            report.unplaced.push(user_id.clone());
            continue;
        };
        match assign(db, target, user_id).await {
            Ok(_) => {
                *counts.entry(target).or_insert(0) += 1;
                report.moved.push((user_id.clone(), target));
            }
            Err(e) => {
                tracing::warn!("Не удалось переназначить пользователя {user_id} на узел {target}: {e}");
                report.unplaced.push(user_id.clone());
            }
        }
    }

    Ok(report)
}

/// Канал к фоновому воркеру переназначения.
#[derive(Clone)]
pub struct Reassigner {
    tx: mpsc::UnboundedSender<ReassignJob>,
}

impl Reassigner {
    /// Запустить воркер. Задания обрабатываются последовательно под
    /// `membership_lock`.
    pub fn spawn(db: DatabaseConnection, membership_lock: Arc<Mutex<()>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ReassignJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let _guard = membership_lock.lock().await;
                match reassign_users(&db, &job).await {
                    Ok(report) => {
                        tracing::info!(
                            "Переназначение пользователей узла {}: перенесено {}, без узла {}",
                            job.from_node,
                            report.moved.len(),
                            report.unplaced.len()
                        );
                        if !report.unplaced.is_empty() {
                            tracing::warn!(
                                "Нет подходящего узла для пользователей: {:?}",
                                report.unplaced
                            );
                        }
                    }
                    Err(e) => tracing::error!(
                        "Ошибка переназначения пользователей узла {}: {e}",
                        job.from_node
                    ),
                }
            }
        });
        Self { tx }
    }

    /// Поставить задание в очередь. Возвращается сразу.
    pub fn signal(&self, job: ReassignJob) {
        if job.user_ids.is_empty() {
            return;
        }
        if self.tx.send(job).is_err() {
            tracing::error!("Воркер переназначения остановлен, задание потеряно");
        }
    }
}
