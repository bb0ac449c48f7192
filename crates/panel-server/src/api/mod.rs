//! HTTP API: маршрутизация, состояние приложения и единый конверт ответа.

pub mod admin_routes;
pub mod agent_routes;
pub mod auth_routes;
pub mod group_routes;
pub mod middleware;
pub mod node_routes;
pub mod rate_limit;

use crate::config::InstallConfig;
use crate::error::AppError;
use crate::services::assignment_service::Reassigner;
use crate::services::install_service::RemoteShell;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, State};
use axum::routing::get;
use axum::{Json, Router};
use rate_limit::RateLimiter;
use sea_orm::{ConnectionTrait, DatabaseConnection};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Общее состояние приложения.
#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub jwt_secret: String,
    pub admin_username: String,
    pub admin_password_hash: String,
    pub rate_limiter: RateLimiter,
    /// Удалённое выполнение для автоустановки
    pub shell: Arc<dyn RemoteShell>,
    pub install: InstallConfig,
    /// Бинарник агента для шага download_agent
    pub agent_binary: Option<PathBuf>,
    pub reassigner: Reassigner,
    /// Сериализует проверки ёмкости, членство в группах и удаление узлов
    pub membership_lock: Arc<Mutex<()>>,
}

/// Конверт успешного ответа: `{ code, message, data }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: &'static str,
    pub data: T,
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

pub fn ok<T>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        code: 200,
        message: "success",
        data,
    })
}

/// JSON-тело с ошибками разбора в едином конверте.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct ApiPath<T>(pub T);

#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::Validation(e.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(e: PathRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(e: QueryRejection) -> Self {
        AppError::BadRequest(e.body_text())
    }
}

/// Построить маршрутизатор Axum.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Rate limiter защищает маршруты агентов
    let limiter = state.rate_limiter.clone();

    let agent_routes = agent_routes::routes().layer(axum::middleware::from_fn(move |req, next| {
        let limiter = limiter.clone();
        rate_limit::rate_limit_middleware(limiter, req, next)
    }));

    let admin_routes = Router::new()
        .merge(node_routes::routes())
        .merge(group_routes::routes())
        .merge(admin_routes::routes());

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/auth", auth_routes::routes())
        .nest("/api/admin", admin_routes)
        .nest("/api/agent", agent_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health — проверка работоспособности панели.
async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<serde_json::Value>> {
    let db_ok = state.db.execute_unprepared("SELECT 1").await.is_ok();
    ok(serde_json::json!({
        "status": if db_ok { "ok" } else { "error" },
        "database": db_ok,
        "service": "panel-server"
    }))
}
