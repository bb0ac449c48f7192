//! Прочие административные маршруты: статистика, открепление пользователей.

use crate::api::middleware::AdminUser;
use crate::api::{ok, ApiPath, ApiResult, AppState};
use crate::services::admin_service::{self, Stats};
use crate::services::assignment_service;
use axum::extract::State;
use axum::routing::{delete, get};
use axum::Router;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/assignments/{user_id}", delete(unassign_user))
}

/// GET /api/admin/stats — сводка по узлам (требует admin JWT).
async fn get_stats(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
) -> ApiResult<Stats> {
    Ok(ok(admin_service::get_stats(&state.db).await?))
}

/// DELETE /api/admin/assignments/{user_id} — открепить пользователя.
async fn unassign_user(
    State(state): State<AppState>,
    AdminUser(_claims): AdminUser,
    ApiPath(user_id): ApiPath<String>,
) -> ApiResult<serde_json::Value> {
    let _guard = state.membership_lock.lock().await;
    assignment_service::unassign(&state.db, &user_id).await?;
    Ok(ok(serde_json::json!({ "user_id": user_id })))
}
