//! Экстракторы аутентификации: администратор (JWT) и узел (токен узла).

use crate::api::AppState;
use crate::error::AppError;
use crate::services::token_service;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

/// Время жизни JWT администратора.
const ADMIN_TOKEN_TTL_SECS: usize = 24 * 3600;

/// Claims JWT-токена администратора.
#[derive(Debug, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
}

/// Экстрактор аутентифицированного администратора.
pub struct AdminUser(pub AdminClaims);

/// Экстрактор узла, предъявившего действующий токен. Содержит node_id.
pub struct AuthenticatedNode(pub i32);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        let key = jsonwebtoken::DecodingKey::from_secret(state.jwt_secret.as_bytes());
        let claims = jsonwebtoken::decode::<AdminClaims>(token, &key, &jsonwebtoken::Validation::default())
            .map(|d| d.claims)
            .map_err(|e| AppError::Unauthorized(format!("Невалидный токен: {e}")))?;
        Ok(AdminUser(claims))
    }
}

impl FromRequestParts<AppState> for AuthenticatedNode {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;
        match token_service::authenticate(&state.db, token).await? {
            Some(node_id) => Ok(AuthenticatedNode(node_id)),
            None => Err(AppError::Unauthorized(
                "Токен узла недействителен или отозван".into(),
            )),
        }
    }
}

/// Создать JWT-токен администратора.
pub fn create_admin_token(username: &str, jwt_secret: &str) -> Result<String, AppError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = AdminClaims {
        sub: username.to_string(),
        exp: now + ADMIN_TOKEN_TTL_SECS,
        iat: now,
    };
    let key = jsonwebtoken::EncodingKey::from_secret(jwt_secret.as_bytes());
    jsonwebtoken::encode(&jsonwebtoken::Header::default(), &claims, &key)
        .map_err(|e| AppError::Internal(format!("Ошибка создания токена: {e}")))
}

fn bearer_token(parts: &Parts) -> Result<&str, AppError> {
    parts
        .headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("Отсутствует заголовок Authorization".into()))?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AppError::Unauthorized("Ожидается Bearer токен".into()))
}
