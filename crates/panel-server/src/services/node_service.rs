//! Реестр узлов: создание (вручную или с автоустановкой), обновление,
//! удаление с каскадом, чтение с вычисляемыми полями.

use crate::config::InstallConfig;
use crate::error::AppError;
use crate::services::assignment_service::{self, ReassignJob};
use crate::services::install_service::{self, InstallPlan, InstallResult, RemoteShell, SshCredentials};
use crate::services::token_service::{self, TokenState};
use crate::services::validation;
use chrono::Utc;
use panel_entities::node_assignments::{self, Entity as AssignmentEntity};
use panel_entities::node_group_members::{self, Entity as MemberEntity};
use panel_entities::node_installs::{self, Entity as InstallEntity};
use panel_entities::node_tokens::{self, Entity as TokenEntity};
use panel_entities::nodes::{ActiveModel, Column, Entity as NodeEntity, Model};
use panel_entities::{NodeStatus, SyncStatus};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Поля, которыми владеет реконсилер. Их нельзя передавать в патче.
pub const RECONCILER_FIELDS: &[&str] = &[
    "status",
    "sync_status",
    "latency",
    "latency_ms",
    "last_seen_at",
    "synced_at",
    "current_users",
    "applied_revision",
    "sync_error",
];

/// Порт узла по умолчанию при автоустановке.
pub const DEFAULT_AUTO_PORT: i64 = 443;

// ── Запросы и представления ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateMode {
    #[default]
    Manual,
    AutoInstall,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    #[serde(default)]
    pub region: String,
    pub address: Option<String>,
    pub port: Option<i64>,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default)]
    pub max_users: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ip_whitelist: Vec<String>,
    #[serde(default)]
    pub mode: CreateMode,
    pub ssh: Option<SshCredentials>,
    pub panel_url: Option<String>,
}

fn default_weight() -> i64 {
    1
}

/// Патч администратора: только поля идентичности, ёмкости и метаданных.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodePatch {
    pub name: Option<String>,
    pub region: Option<String>,
    pub address: Option<String>,
    pub port: Option<i64>,
    pub weight: Option<i64>,
    pub max_users: Option<i64>,
    pub enabled: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub ip_whitelist: Option<Vec<String>>,
}

/// Запрос повторной установки.
#[derive(Debug, Clone, Deserialize)]
pub struct InstallRequest {
    pub ssh: SshCredentials,
    pub panel_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub region: Option<String>,
    pub keyword: Option<String>,
    pub group_id: Option<i32>,
}

/// Узел в том виде, в каком его видит администратор.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: i32,
    pub name: String,
    pub region: String,
    pub address: String,
    pub port: i32,
    pub weight: i32,
    pub max_users: i32,
    pub current_users: i64,
    pub enabled: bool,
    pub status: NodeStatus,
    pub latency: i32,
    pub last_seen_at: Option<String>,
    pub sync_status: SyncStatus,
    pub synced_at: Option<String>,
    pub sync_error: Option<String>,
    pub config_revision: i64,
    pub applied_revision: i64,
    pub tags: Vec<String>,
    pub ip_whitelist: Vec<String>,
    pub token_state: TokenState,
    pub created_at: String,
    pub updated_at: String,
}

impl NodeView {
    pub fn new(node: Model, current_users: i64, token_state: TokenState) -> Self {
        let tags = node.tag_list();
        let ip_whitelist = node.ip_whitelist_list();
        Self {
            id: node.id,
            name: node.name,
            region: node.region,
            address: node.address,
            port: node.port,
            weight: node.weight,
            max_users: node.max_users,
            current_users,
            enabled: node.enabled,
            status: node.status,
            latency: node.latency_ms,
            last_seen_at: node.last_seen_at,
            sync_status: node.sync_status,
            synced_at: node.synced_at,
            sync_error: node.sync_error,
            config_revision: node.config_revision,
            applied_revision: node.applied_revision,
            tags,
            ip_whitelist,
            token_state,
            created_at: node.created_at,
            updated_at: node.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateNodeResponse {
    pub node: NodeView,
    pub install_result: Option<InstallResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteNodeResponse {
    pub id: i32,
    /// Сколько пользователей отправлено на переназначение
    pub reassigning_users: usize,
}

// ── Чтение ───────────────────────────────────────────────────────────────────

pub async fn find_node<C: ConnectionTrait>(db: &C, id: i32) -> Result<Model, AppError> {
    NodeEntity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Узел не найден: {id}")))
}

async fn token_states<C: ConnectionTrait>(db: &C) -> Result<HashMap<i32, TokenState>, AppError> {
    let tokens = TokenEntity::find().all(db).await?;
    Ok(tokens
        .into_iter()
        .map(|t| {
            let state = if t.revoked_at.is_some() {
                TokenState::Revoked
            } else {
                TokenState::Issued
            };
            (t.node_id, state)
        })
        .collect())
}

pub async fn get_node<C: ConnectionTrait>(db: &C, id: i32) -> Result<NodeView, AppError> {
    let node = find_node(db, id).await?;
    let users = assignment_service::user_count(db, id).await?;
    let token = token_service::token_info(db, id).await?;
    Ok(NodeView::new(node, users, token.state))
}

pub async fn list_nodes<C: ConnectionTrait>(db: &C, filter: &NodeFilter) -> Result<Vec<NodeView>, AppError> {
    let mut query = NodeEntity::find().order_by_asc(Column::Id);
    if let Some(status) = filter.status {
        query = query.filter(Column::Status.eq(status));
    }
    if let Some(region) = filter.region.as_deref().filter(|r| !r.is_empty()) {
        query = query.filter(Column::Region.eq(region));
    }
    if let Some(keyword) = filter.keyword.as_deref().filter(|k| !k.is_empty()) {
        query = query.filter(
            sea_orm::Condition::any()
                .add(Column::Name.contains(keyword))
                .add(Column::Address.contains(keyword)),
        );
    }
    if let Some(group_id) = filter.group_id {
        let member_ids: Vec<i32> = MemberEntity::find()
            .filter(node_group_members::Column::GroupId.eq(group_id))
            .all(db)
            .await?
            .into_iter()
            .map(|m| m.node_id)
            .collect();
        query = query.filter(Column::Id.is_in(member_ids));
    }

    let nodes = query.all(db).await?;
    let counts = assignment_service::user_counts(db).await?;
    let tokens = token_states(db).await?;

    Ok(nodes
        .into_iter()
        .map(|n| {
            let users = counts.get(&n.id).copied().unwrap_or(0);
            let token = tokens.get(&n.id).copied().unwrap_or(TokenState::None);
            NodeView::new(n, users, token)
        })
        .collect())
}

// ── Создание ─────────────────────────────────────────────────────────────────

struct ValidatedNode {
    name: String,
    region: String,
    address: String,
    port: i32,
    weight: i32,
    max_users: i32,
    tags: Vec<String>,
    ip_whitelist: Vec<String>,
}

fn validate_create(req: &CreateNodeRequest) -> Result<ValidatedNode, AppError> {
    let name = validation::validate_name(&req.name)?;
    let (address, port) = match req.mode {
        CreateMode::Manual => {
            let address = req
                .address
                .as_deref()
                .ok_or_else(|| AppError::Validation("address обязателен".into()))?;
            let port = req
                .port
                .ok_or_else(|| AppError::Validation("port обязателен".into()))?;
            (validation::validate_address(address)?, validation::validate_port(port)?)
        }
        CreateMode::AutoInstall => {
            let ssh = req
                .ssh
                .as_ref()
                .ok_or_else(|| AppError::Validation("ssh обязателен для auto_install".into()))?;
            let address = req.address.as_deref().unwrap_or(&ssh.host);
            (
                validation::validate_address(address)?,
                validation::validate_port(req.port.unwrap_or(DEFAULT_AUTO_PORT))?,
            )
        }
    };
    Ok(ValidatedNode {
        name,
        region: req.region.trim().to_string(),
        address,
        port,
        weight: validation::validate_weight(req.weight)?,
        max_users: validation::validate_max_users(req.max_users)?,
        tags: validation::normalize_tags(&req.tags)?,
        ip_whitelist: validation::normalize_ip_whitelist(&req.ip_whitelist)?,
    })
}

async fn insert_node<C: ConnectionTrait>(db: &C, v: ValidatedNode) -> Result<Model, AppError> {
    let now = Utc::now().to_rfc3339();
    let model = ActiveModel {
        name: Set(v.name),
        region: Set(v.region),
        address: Set(v.address),
        port: Set(v.port),
        weight: Set(v.weight),
        max_users: Set(v.max_users),
        enabled: Set(true),
        status: Set(NodeStatus::Offline),
        latency_ms: Set(0),
        last_seen_at: Set(None),
        sync_status: Set(SyncStatus::Pending),
        synced_at: Set(None),
        config_revision: Set(1),
        applied_revision: Set(0),
        sync_error: Set(None),
        tags: Set(serde_json::to_string(&v.tags)?),
        ip_whitelist: Set(serde_json::to_string(&v.ip_whitelist)?),
        created_at: Set(now.clone()),
        updated_at: Set(now),
        ..Default::default()
    };
    Ok(model.insert(db).await?)
}

/// Создать узел. В режиме auto_install запись и токен создаются до
/// установки; при сбое установки узел остаётся с sync_status = failed.
pub async fn create_node(
    db: &DatabaseConnection,
    shell: &dyn RemoteShell,
    install_cfg: &InstallConfig,
    req: CreateNodeRequest,
) -> Result<CreateNodeResponse, AppError> {
    let validated = validate_create(&req)?;

    let install = match req.mode {
        CreateMode::Manual => None,
        CreateMode::AutoInstall => {
            let ssh = req
                .ssh
                .as_ref()
                .ok_or_else(|| AppError::Validation("ssh обязателен для auto_install".into()))?;
            let target = ssh.validate()?;
            let panel_url = req
                .panel_url
                .as_deref()
                .ok_or_else(|| AppError::Validation("panel_url обязателен для auto_install".into()))?;
            let panel_url = validation::validate_panel_url(panel_url)?;
            Some((target, panel_url))
        }
    };

    let node = insert_node(db, validated).await?;
    tracing::info!("Создан узел {} ({}:{})", node.id, node.address, node.port);

    let install_result = match install {
        None => None,
        Some((target, panel_url)) => {
            Some(install_node(db, shell, install_cfg, &node, &target, &panel_url).await?)
        }
    };

    let view = get_node(db, node.id).await?;
    Ok(CreateNodeResponse {
        node: view,
        install_result,
    })
}

/// Выпустить токен и установить агента на узел. Результат сохраняется,
/// состояние синхронизации узла отражает исход установки.
pub async fn install_node(
    db: &DatabaseConnection,
    shell: &dyn RemoteShell,
    install_cfg: &InstallConfig,
    node: &Model,
    target: &install_service::SshTarget,
    panel_url: &str,
) -> Result<InstallResult, AppError> {
    let token = token_service::generate(db, node.id).await?;
    let plan = InstallPlan {
        node_id: node.id,
        node_port: node.port,
        panel_url: panel_url.to_string(),
        token,
    };

    let result = install_service::run_install(shell, target, &plan, install_cfg).await;
    install_service::save_result(db, node.id, &result).await?;

    let mut model: ActiveModel = find_node(db, node.id).await?.into();
    match &result.failed_step {
        None => {
            model.sync_status = Set(SyncStatus::Pending);
            model.sync_error = Set(None);
            tracing::info!("Агент установлен на узел {}", node.id);
        }
        Some(step) => {
            model.sync_status = Set(SyncStatus::Failed);
            model.sync_error = Set(Some(format!("install failed at step {step}")));
            tracing::warn!("Установка на узел {} провалена на шаге {step}", node.id);
        }
    }
    model.updated_at = Set(Utc::now().to_rfc3339());
    model.update(db).await?;

    Ok(result)
}

// ── Обновление ───────────────────────────────────────────────────────────────

/// Разобрать патч из JSON, отклонив поля реконсилера.
pub fn parse_patch(body: serde_json::Value) -> Result<NodePatch, AppError> {
    let obj = body
        .as_object()
        .ok_or_else(|| AppError::Validation("Ожидается JSON-объект".into()))?;
    let forbidden: Vec<&str> = RECONCILER_FIELDS
        .iter()
        .copied()
        .filter(|f| obj.contains_key(*f))
        .collect();
    if !forbidden.is_empty() {
        return Err(AppError::Validation(format!(
            "Поля управляются реконсилером и не могут быть изменены: {}",
            forbidden.join(", ")
        )));
    }
    serde_json::from_value(body).map_err(|e| AppError::Validation(format!("Некорректный патч: {e}")))
}

/// Применить патч. Изменения, которые узел должен применить у себя
/// (всё, что входит в конфигурацию агента), увеличивают config_revision
/// и переводят узел в pending.
pub async fn update_node<C>(db: &C, id: i32, patch: NodePatch) -> Result<NodeView, AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    let node = find_node(&txn, id).await?;
    let mut needs_sync = false;
    let mut model: ActiveModel = node.clone().into();

    if let Some(name) = &patch.name {
        // Имя входит в конфигурацию агента
        let name = validation::validate_name(name)?;
        needs_sync |= name != node.name;
        model.name = Set(name);
    }
    if let Some(region) = &patch.region {
        model.region = Set(region.trim().to_string());
    }
    if let Some(address) = &patch.address {
        let address = validation::validate_address(address)?;
        needs_sync |= address != node.address;
        model.address = Set(address);
    }
    if let Some(port) = patch.port {
        let port = validation::validate_port(port)?;
        needs_sync |= port != node.port;
        model.port = Set(port);
    }
    if let Some(weight) = patch.weight {
        model.weight = Set(validation::validate_weight(weight)?);
    }
    if let Some(max_users) = patch.max_users {
        let max_users = validation::validate_max_users(max_users)?;
        let current = assignment_service::user_count(&txn, id).await?;
        if max_users > 0 && current > max_users as i64 {
            return Err(AppError::Conflict(format!(
                "max_users ({max_users}) меньше числа закреплённых пользователей ({current})"
            )));
        }
        needs_sync |= max_users != node.max_users;
        model.max_users = Set(max_users);
    }
    if let Some(enabled) = patch.enabled {
        model.enabled = Set(enabled);
    }
    if let Some(tags) = &patch.tags {
        let tags = validation::normalize_tags(tags)?;
        needs_sync |= tags != node.tag_list();
        model.tags = Set(serde_json::to_string(&tags)?);
    }
    if let Some(whitelist) = &patch.ip_whitelist {
        let whitelist = validation::normalize_ip_whitelist(whitelist)?;
        needs_sync |= whitelist != node.ip_whitelist_list();
        model.ip_whitelist = Set(serde_json::to_string(&whitelist)?);
    }

    if needs_sync {
        model.config_revision = Set(node.config_revision + 1);
        model.sync_status = Set(SyncStatus::Pending);
    }
    model.updated_at = Set(Utc::now().to_rfc3339());
    model.update(&txn).await?;
    txn.commit().await?;

    tracing::info!("Узел {id} обновлён (новая ревизия: {needs_sync})");
    get_node(db, id).await
}

/// Включить или выключить узел. Идемпотентно.
pub async fn set_enabled<C: ConnectionTrait>(db: &C, id: i32, enabled: bool) -> Result<NodeView, AppError> {
    let node = find_node(db, id).await?;
    if node.enabled != enabled {
        let mut model: ActiveModel = node.into();
        model.enabled = Set(enabled);
        model.updated_at = Set(Utc::now().to_rfc3339());
        model.update(db).await?;
        tracing::info!("Узел {id}: enabled = {enabled}");
    }
    get_node(db, id).await
}

// ── Удаление ─────────────────────────────────────────────────────────────────

/// Удалить узел: членство в группах, токен, закрепления и результат
/// установки удаляются в той же транзакции. Возвращает задание на
/// переназначение вытесненных пользователей.
///
/// Вызывающий обязан держать `membership_lock`.
pub async fn delete_node<C>(db: &C, id: i32) -> Result<ReassignJob, AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let txn = db.begin().await?;
    find_node(&txn, id).await?;

    let group_ids: Vec<i32> = MemberEntity::find()
        .filter(node_group_members::Column::NodeId.eq(id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|m| m.group_id)
        .collect();
    let user_ids: Vec<String> = AssignmentEntity::find()
        .filter(node_assignments::Column::NodeId.eq(id))
        .all(&txn)
        .await?
        .into_iter()
        .map(|a| a.user_id)
        .collect();

    MemberEntity::delete_many()
        .filter(node_group_members::Column::NodeId.eq(id))
        .exec(&txn)
        .await?;
    TokenEntity::delete_many()
        .filter(node_tokens::Column::NodeId.eq(id))
        .exec(&txn)
        .await?;
    AssignmentEntity::delete_many()
        .filter(node_assignments::Column::NodeId.eq(id))
        .exec(&txn)
        .await?;
    InstallEntity::delete_many()
        .filter(node_installs::Column::NodeId.eq(id))
        .exec(&txn)
        .await?;
    NodeEntity::delete_by_id(id).exec(&txn).await?;

    txn.commit().await?;
    tracing::info!(
        "Узел {id} удалён (групп: {}, пользователей к переназначению: {})",
        group_ids.len(),
        user_ids.len()
    );

    Ok(ReassignJob {
        from_node: id,
        group_ids,
        user_ids,
    })
}
