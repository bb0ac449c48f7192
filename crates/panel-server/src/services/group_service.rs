//! Группы узлов: CRUD, членство и агрегаты, вычисляемые при чтении.

use crate::error::AppError;
use crate::services::assignment_service;
use crate::services::node_service::find_node;
use crate::services::validation;
use chrono::Utc;
use panel_entities::node_group_members::{self, Entity as MemberEntity};
use panel_entities::node_groups::{self, ActiveModel, Entity as GroupEntity, Model};
use panel_entities::nodes::{self, Entity as NodeEntity};
use panel_entities::{GroupStrategy, NodeStatus};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region: String,
    #[serde(default = "default_strategy")]
    pub strategy: GroupStrategy,
}

fn default_strategy() -> GroupStrategy {
    GroupStrategy::RoundRobin
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub region: Option<String>,
    pub strategy: Option<GroupStrategy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub id: i32,
    pub name: String,
    pub description: String,
    pub region: String,
    pub strategy: GroupStrategy,
    pub node_ids: Vec<i32>,
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub total_users: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Агрегаты группы по текущим узлам-участникам.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rollup {
    pub total_nodes: u64,
    pub healthy_nodes: u64,
    pub total_users: i64,
}

pub fn rollup(members: &[&nodes::Model], counts: &HashMap<i32, i64>) -> Rollup {
    members.iter().fold(Rollup::default(), |mut acc, n| {
        acc.total_nodes += 1;
        if n.status == NodeStatus::Online {
            acc.healthy_nodes += 1;
        }
        acc.total_users += counts.get(&n.id).copied().unwrap_or(0);
        acc
    })
}

/// Собрать представления групп, агрегаты считаются заново по живым данным.
async fn build_views<C: ConnectionTrait>(db: &C, groups: Vec<Model>) -> Result<Vec<GroupView>, AppError> {
    let group_ids: Vec<i32> = groups.iter().map(|g| g.id).collect();
    let memberships = MemberEntity::find()
        .filter(node_group_members::Column::GroupId.is_in(group_ids))
        .all(db)
        .await?;
    let nodes: HashMap<i32, nodes::Model> = NodeEntity::find()
        .all(db)
        .await?
        .into_iter()
        .map(|n| (n.id, n))
        .collect();
    let counts = assignment_service::user_counts(db).await?;

    let mut by_group: HashMap<i32, Vec<i32>> = HashMap::new();
    for m in memberships {
        by_group.entry(m.group_id).or_default().push(m.node_id);
    }

    Ok(groups
        .into_iter()
        .map(|g| {
            let mut node_ids = by_group.remove(&g.id).unwrap_or_default();
            node_ids.sort_unstable();
            let members: Vec<&nodes::Model> =
                node_ids.iter().filter_map(|id| nodes.get(id)).collect();
            let r = rollup(&members, &counts);
            GroupView {
                id: g.id,
                name: g.name,
                description: g.description,
                region: g.region,
                strategy: g.strategy,
                node_ids,
                total_nodes: r.total_nodes,
                healthy_nodes: r.healthy_nodes,
                total_users: r.total_users,
                created_at: g.created_at,
                updated_at: g.updated_at,
            }
        })
        .collect())
}

async fn find_group<C: ConnectionTrait>(db: &C, id: i32) -> Result<Model, AppError> {
    GroupEntity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Группа не найдена: {id}")))
}

pub async fn list_groups<C: ConnectionTrait>(db: &C) -> Result<Vec<GroupView>, AppError> {
    let groups = GroupEntity::find()
        .order_by_asc(node_groups::Column::Id)
        .all(db)
        .await?;
    build_views(db, groups).await
}

pub async fn get_group<C: ConnectionTrait>(db: &C, id: i32) -> Result<GroupView, AppError> {
    let group = find_group(db, id).await?;
    let mut views = build_views(db, vec![group]).await?;
    views
        .pop()
        .ok_or_else(|| AppError::Internal(format!("Группа {id} пропала при чтении")))
}

pub async fn create_group<C: ConnectionTrait>(db: &C, req: CreateGroupRequest) -> Result<GroupView, AppError> {
    let now = Utc::now().to_rfc3339();
    let model = ActiveModel {
        name: Set(validation::validate_name(&req.name)?),
        description: Set(req.description.trim().to_string()),
        region: Set(req.region.trim().to_string()),
        strategy: Set(req.strategy),
        created_at: Set(now.clone()),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    tracing::info!("Создана группа {} ({})", model.id, model.name);
    get_group(db, model.id).await
}

pub async fn update_group<C: ConnectionTrait>(db: &C, id: i32, patch: GroupPatch) -> Result<GroupView, AppError> {
    let group = find_group(db, id).await?;
    let mut model: ActiveModel = group.into();
    if let Some(name) = &patch.name {
        model.name = Set(validation::validate_name(name)?);
    }
    if let Some(description) = &patch.description {
        model.description = Set(description.trim().to_string());
    }
    if let Some(region) = &patch.region {
        model.region = Set(region.trim().to_string());
    }
    if let Some(strategy) = patch.strategy {
        model.strategy = Set(strategy);
    }
    model.updated_at = Set(Utc::now().to_rfc3339());
    model.update(db).await?;
    get_group(db, id).await
}

/// Удалить группу вместе с её членством. Узлы не затрагиваются.
pub async fn delete_group<C>(db: &C, id: i32) -> Result<(), AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    find_group(&txn, id).await?;
    MemberEntity::delete_many()
        .filter(node_group_members::Column::GroupId.eq(id))
        .exec(&txn)
        .await?;
    GroupEntity::delete_by_id(id).exec(&txn).await?;
    txn.commit().await?;
    tracing::info!("Группа {id} удалена");
    Ok(())
}

/// Добавить узел в группу. Повторное добавление ничего не меняет.
///
/// Вызывающий обязан держать `membership_lock`, чтобы добавление не
/// пересеклось с удалением узла.
pub async fn add_member<C>(db: &C, group_id: i32, node_id: i32) -> Result<GroupView, AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    find_group(&txn, group_id).await?;
    find_node(&txn, node_id).await?;

    let exists = MemberEntity::find_by_id((group_id, node_id))
        .one(&txn)
        .await?
        .is_some();
    if !exists {
        node_group_members::ActiveModel {
            group_id: Set(group_id),
            node_id: Set(node_id),
            added_at: Set(Utc::now().to_rfc3339()),
        }
        .insert(&txn)
        .await?;
        tracing::info!("Узел {node_id} добавлен в группу {group_id}");
    }
    txn.commit().await?;
    get_group(db, group_id).await
}

pub async fn remove_member<C: ConnectionTrait>(db: &C, group_id: i32, node_id: i32) -> Result<GroupView, AppError> {
    let result = MemberEntity::delete_by_id((group_id, node_id)).exec(db).await?;
    if result.rows_affected == 0 {
        return Err(AppError::NotFound(format!(
            "Узел {node_id} не состоит в группе {group_id}"
        )));
    }
    tracing::info!("Узел {node_id} удалён из группы {group_id}");
    get_group(db, group_id).await
}
