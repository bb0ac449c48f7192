//! Маршруты агентов узлов: heartbeat, конфигурация, бинарник агента.
//! Все требуют действующий токен узла.

use crate::api::middleware::AuthenticatedNode;
use crate::api::{ok, ApiJson, ApiResult, AppState};
use crate::error::AppError;
use crate::services::health_service::{self, HeartbeatAck, HeartbeatReport};
use crate::services::node_service;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;
use tower::ServiceExt;
use tower_http::services::ServeFile;

/// Желаемая конфигурация узла.
#[derive(Debug, Serialize)]
pub struct AgentConfig {
    pub node_id: i32,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub max_users: i32,
    pub config_revision: i64,
    pub tags: Vec<String>,
    pub ip_whitelist: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/heartbeat", post(heartbeat))
        .route("/config", get(config))
        .route("/binary", get(binary))
}

/// POST /api/agent/heartbeat — отчёт агента о применённой ревизии.
async fn heartbeat(
    State(state): State<AppState>,
    AuthenticatedNode(node_id): AuthenticatedNode,
    ApiJson(report): ApiJson<HeartbeatReport>,
) -> ApiResult<HeartbeatAck> {
    Ok(ok(health_service::record_heartbeat(&state.db, node_id, report).await?))
}

/// GET /api/agent/config — конфигурация, которую узел должен применить.
async fn config(
    State(state): State<AppState>,
    AuthenticatedNode(node_id): AuthenticatedNode,
) -> ApiResult<AgentConfig> {
    let node = node_service::find_node(&state.db, node_id).await?;
    let tags = node.tag_list();
    let ip_whitelist = node.ip_whitelist_list();
    Ok(ok(AgentConfig {
        node_id: node.id,
        name: node.name,
        address: node.address,
        port: node.port,
        max_users: node.max_users,
        config_revision: node.config_revision,
        tags,
        ip_whitelist,
    }))
}

/// GET /api/agent/binary — бинарник агента для шага download_agent.
/// Файл отдаётся потоком, Range-запросы поддерживаются.
async fn binary(
    State(state): State<AppState>,
    AuthenticatedNode(node_id): AuthenticatedNode,
    request: Request,
) -> Result<Response, AppError> {
    let path = state
        .agent_binary
        .as_ref()
        .ok_or_else(|| AppError::NotFound("Бинарник агента не настроен".into()))?;
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| AppError::Internal(format!("Не удалось прочитать {}: {e}", path.display())))?;
    tracing::info!("Узел {node_id} скачивает агента ({} байт)", meta.len());

    let response = ServeFile::new(path)
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    Ok(response.map(Body::new))
}
