//! Административные маршруты групп узлов.

use crate::api::middleware::AdminUser;
use crate::api::{ok, ApiJson, ApiPath, ApiResult, AppState};
use crate::services::group_service::{self, CreateGroupRequest, GroupPatch, GroupView};
use axum::extract::State;
use axum::routing::{delete, get, post};
use axum::Router;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub node_id: i32,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/groups", get(list_groups).post(create_group))
        .route(
            "/groups/{id}",
            get(get_group).put(update_group).delete(delete_group),
        )
        .route("/groups/{id}/nodes", post(add_member))
        .route("/groups/{id}/nodes/{node_id}", delete(remove_member))
}

/// GET /api/admin/groups — группы с агрегатами по живым данным.
async fn list_groups(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> ApiResult<Vec<GroupView>> {
    Ok(ok(group_service::list_groups(&state.db).await?))
}

async fn create_group(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiJson(req): ApiJson<CreateGroupRequest>,
) -> ApiResult<GroupView> {
    Ok(ok(group_service::create_group(&state.db, req).await?))
}

async fn get_group(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<GroupView> {
    Ok(ok(group_service::get_group(&state.db, id).await?))
}

async fn update_group(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(patch): ApiJson<GroupPatch>,
) -> ApiResult<GroupView> {
    Ok(ok(group_service::update_group(&state.db, id, patch).await?))
}

async fn delete_group(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
) -> ApiResult<serde_json::Value> {
    let _guard = state.membership_lock.lock().await;
    group_service::delete_group(&state.db, id).await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

/// POST /api/admin/groups/{id}/nodes — добавить узел в группу.
async fn add_member(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(id): ApiPath<i32>,
    ApiJson(req): ApiJson<AddMemberRequest>,
) -> ApiResult<GroupView> {
    let _guard = state.membership_lock.lock().await;
    Ok(ok(group_service::add_member(&state.db, id, req.node_id).await?))
}

/// DELETE /api/admin/groups/{id}/nodes/{node_id} — убрать узел из группы.
async fn remove_member(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath((id, node_id)): ApiPath<(i32, i32)>,
) -> ApiResult<GroupView> {
    let _guard = state.membership_lock.lock().await;
    Ok(ok(group_service::remove_member(&state.db, id, node_id).await?))
}
