//! Маршруты аутентификации: логин администратора.

use crate::api::{middleware, ok, ApiJson, ApiResult, AppState};
use crate::config::verify_password;
use crate::error::AppError;
use axum::extract::State;
use axum::routing::post;
use axum::Router;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/login", post(login))
}

/// POST /api/auth/login — авторизация администратора.
async fn login(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> ApiResult<LoginResponse> {
    let password_ok = verify_password(&req.password, &state.admin_password_hash);
    if req.username != state.admin_username || !password_ok {
        tracing::warn!("Неудачная попытка входа для пользователя: {}", req.username);
        return Err(AppError::Unauthorized("Неверные учётные данные".into()));
    }

    let token = middleware::create_admin_token(&req.username, &state.jwt_secret)?;
    tracing::info!("Администратор {} вошёл в систему", req.username);

    Ok(ok(LoginResponse { token }))
}
