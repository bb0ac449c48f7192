//! Административные маршруты узлов: CRUD, токены, установка, закрепления.

use crate::api::middleware::AdminUser;
use crate::api::{ok, ApiJson, ApiPath, ApiQuery, ApiResult, AppState};
use crate::error::AppError;
use crate::services::install_service::{self, InstallResult};
use crate::services::node_service::{
    self, CreateNodeRequest, CreateNodeResponse, DeleteNodeResponse, InstallRequest, NodeFilter,
    NodeView,
};
use crate::services::token_service::{self, RevokeOutcome, TokenInfo};
use crate::services::{assignment_service, validation};
use axum::extract::State;
use axum::routing::{get, post, put};
use axum::Router;
use panel_entities::node_assignments;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub user_id: String,
}

/// Значение токена отдаётся только в этом ответе.
#[derive(Debug, Serialize)]
pub struct IssuedToken {
    pub node_id: i32,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub node_id: i32,
    pub already_revoked: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/nodes", get(list_nodes).post(create_node))
        .route(
            "/nodes/{id}",
            get(get_node).put(update_node).delete(delete_node),
        )
        .route("/nodes/{id}/enabled", put(set_enabled))
        .route(
            "/nodes/{id}/token",
            get(token_info).post(generate_token).delete(revoke_token),
        )
        .route("/nodes/{id}/token/rotate", post(rotate_token))
        .route("/nodes/{id}/install", get(install_result).post(reinstall))
        .route("/nodes/{id}/assignments", post(assign_user))
}

// ── CRUD ─────────────────────────────────────────────────────────────────────

/// GET /api/admin/nodes — список узлов с фильтрами status, region, keyword, group_id.
async fn list_nodes(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiQuery(filter): ApiQuery<NodeFilter>,
) -> ApiResult<Vec<NodeView>> {
    Ok(ok(node_service::list_nodes(&state.db, &filter).await?))
}

/// POST /api/admin/nodes — создание узла (manual или auto_install).
async fn create_node(
    State(state): State<AppState>,
    AdminUser(claims): AdminUser,
    ApiJson(req): ApiJson<CreateNodeRequest>,
) -> ApiResult<CreateNodeResponse> {
    tracing::info!("{} создаёт узел {} ({:?})", claims.sub, req.name, req.mode);
    let created =
        node_service::create_node(&state.db, state.shell.as_ref(), &state.install, req).await?;
    Ok(ok(created))
}

async fn get_node(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<NodeView> {
    Ok(ok(node_service::get_node(&state.db, id).await?))
}

/// PUT /api/admin/nodes/{id} — патч идентичности, ёмкости и метаданных.
async fn update_node(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(body): ApiJson<serde_json::Value>,
) -> ApiResult<NodeView> {
    let patch = node_service::parse_patch(body)?;
    // max_users сверяется с числом закреплений под тем же замком, что и назначения
    let _guard = state.membership_lock.lock().await;
    Ok(ok(node_service::update_node(&state.db, id, patch).await?))
}

/// PUT /api/admin/nodes/{id}/enabled — идемпотентное включение/выключение.
async fn set_enabled(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(req): ApiJson<EnabledRequest>,
) -> ApiResult<NodeView> {
    Ok(ok(node_service::set_enabled(&state.db, id, req.enabled).await?))
}

/// DELETE /api/admin/nodes/{id} — удаление с каскадом. Переназначение
/// пользователей идёт асинхронно после ответа.
async fn delete_node(
    State(state): State<AppState>,
    AdminUser(claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<DeleteNodeResponse> {
    let job = {
        let _guard = state.membership_lock.lock().await;
        node_service::delete_node(&state.db, id).await?
    };
    let reassigning_users = job.user_ids.len();
    state.reassigner.signal(job);
    tracing::info!("{} удалил узел {id}", claims.sub);

    Ok(ok(DeleteNodeResponse {
        id,
        reassigning_users,
    }))
}

// ── Токены ───────────────────────────────────────────────────────────────────

async fn token_info(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<TokenInfo> {
    node_service::find_node(&state.db, id).await?;
    Ok(ok(token_service::token_info(&state.db, id).await?))
}

/// POST /api/admin/nodes/{id}/token — выпуск (или замена) токена.
async fn generate_token(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<IssuedToken> {
    let token = token_service::generate(&state.db, id).await?;
    Ok(ok(IssuedToken { node_id: id, token }))
}

/// POST /api/admin/nodes/{id}/token/rotate — ротация активного токена.
async fn rotate_token(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<IssuedToken> {
    node_service::find_node(&state.db, id).await?;
    let token = token_service::rotate(&state.db, id).await?;
    Ok(ok(IssuedToken { node_id: id, token }))
}

/// DELETE /api/admin/nodes/{id}/token — отзыв токена, повторный отзыв успешен.
async fn revoke_token(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<RevokeResponse> {
    node_service::find_node(&state.db, id).await?;
    let outcome = token_service::revoke(&state.db, id).await?;
    Ok(ok(RevokeResponse {
        node_id: id,
        already_revoked: outcome == RevokeOutcome::AlreadyRevoked,
    }))
}

// ── Установка ────────────────────────────────────────────────────────────────

/// GET /api/admin/nodes/{id}/install — результат последней установки.
async fn install_result(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<InstallResult> {
    node_service::find_node(&state.db, id).await?;
    install_service::load_result(&state.db, id)
        .await?
        .map(ok)
        .ok_or_else(|| AppError::NotFound(format!("Узел {id} не устанавливался автоматически")))
}

/// POST /api/admin/nodes/{id}/install — повторная установка агента.
async fn reinstall(
    State(state): State<AppState>,
    AdminUser(claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(req): ApiJson<InstallRequest>,
) -> ApiResult<InstallResult> {
    let node = node_service::find_node(&state.db, id).await?;
    let target = req.ssh.validate()?;
    let panel_url = validation::validate_panel_url(&req.panel_url)?;
    tracing::info!("{} запускает повторную установку узла {id}", claims.sub);

    let result = node_service::install_node(
        &state.db,
        state.shell.as_ref(),
        &state.install,
        &node,
        &target,
        &panel_url,
    )
    .await?;
    Ok(ok(result))
}

// ── Закрепления ──────────────────────────────────────────────────────────────

/// POST /api/admin/nodes/{id}/assignments — закрепить пользователя за узлом.
async fn assign_user(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(req): ApiJson<AssignRequest>,
) -> ApiResult<node_assignments::Model> {
    let _guard = state.membership_lock.lock().await;
    Ok(ok(assignment_service::assign(&state.db, id, &req.user_id).await?))
}
