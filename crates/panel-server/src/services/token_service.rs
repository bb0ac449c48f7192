//! Жизненный цикл токенов узлов: выпуск, ротация, отзыв, аутентификация.
//!
//! В БД хранится только SHA-256 от значения. Значение отдаётся клиенту
//! один раз, в ответе generate/rotate.

use crate::error::AppError;
use chrono::Utc;
use panel_entities::node_tokens::{self, Column, Entity as TokenEntity};
use panel_entities::nodes::Entity as NodeEntity;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ActiveValue::Set, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, TransactionTrait,
};
use serde::Serialize;

/// Состояние токена узла.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    None,
    Issued,
    Revoked,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenInfo {
    pub state: TokenState,
    pub issued_at: Option<String>,
    pub revoked_at: Option<String>,
}

/// Результат revoke: отозван сейчас или был отозван ранее.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
}

/// Сгенерировать новое непрозрачное значение токена (32 случайных байта, hex).
pub fn new_token_value() -> Result<String, AppError> {
    let mut buf = [0u8; 32];
    getrandom::fill(&mut buf)
        .map_err(|e| AppError::Internal(format!("Ошибка генерации токена: {e}")))?;
    Ok(hex::encode(buf))
}

/// SHA-256 hex от значения токена.
pub fn hash_token(token: &str) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Выпустить токен узлу. Существующий токен (активный или отозванный)
/// заменяется; старое значение перестаёт действовать в той же записи.
pub async fn generate<C>(db: &C, node_id: i32) -> Result<String, AppError>
where
    C: ConnectionTrait + TransactionTrait,
{
    let token = new_token_value()?;
    let txn = db.begin().await?;

    if NodeEntity::find_by_id(node_id).one(&txn).await?.is_none() {
        return Err(AppError::NotFound(format!("Узел не найден: {node_id}")));
    }

    let model = node_tokens::ActiveModel {
        node_id: Set(node_id),
        token_hash: Set(hash_token(&token)),
        issued_at: Set(Utc::now().to_rfc3339()),
        revoked_at: Set(None),
    };
    TokenEntity::insert(model)
        .on_conflict(
            OnConflict::column(Column::NodeId)
                .update_columns([Column::TokenHash, Column::IssuedAt, Column::RevokedAt])
                .to_owned(),
        )
        .exec_without_returning(&txn)
        .await?;

    txn.commit().await?;
    tracing::info!("Выпущен токен для узла {node_id}");
    Ok(token)
}

/// Ротация: новое значение заменяет активное одним условным UPDATE,
/// поэтому старое значение недействительно с момента возврата.
pub async fn rotate<C: ConnectionTrait>(db: &C, node_id: i32) -> Result<String, AppError> {
    let token = new_token_value()?;

    let result = TokenEntity::update_many()
        .col_expr(Column::TokenHash, Expr::value(hash_token(&token)))
        .col_expr(Column::IssuedAt, Expr::value(Utc::now().to_rfc3339()))
        .filter(Column::NodeId.eq(node_id))
        .filter(Column::RevokedAt.is_null())
        .exec(db)
        .await?;

    if result.rows_affected == 0 {
        return Err(AppError::NotFound(format!(
            "У узла {node_id} нет активного токена для ротации"
        )));
    }

    tracing::info!("Токен узла {node_id} ротирован");
    Ok(token)
}

/// Отзыв токена. Повторный отзыв успешен и ничего не меняет.
pub async fn revoke<C: ConnectionTrait>(db: &C, node_id: i32) -> Result<RevokeOutcome, AppError> {
    let result = TokenEntity::update_many()
        .col_expr(Column::RevokedAt, Expr::value(Utc::now().to_rfc3339()))
        .filter(Column::NodeId.eq(node_id))
        .filter(Column::RevokedAt.is_null())
        .exec(db)
        .await?;

    if result.rows_affected > 0 {
        tracing::info!("Токен узла {node_id} отозван");
        return Ok(RevokeOutcome::Revoked);
    }

    match TokenEntity::find_by_id(node_id).one(db).await? {
        Some(_) => Ok(RevokeOutcome::AlreadyRevoked),
        None => Err(AppError::NotFound(format!(
            "У узла {node_id} нет токена для отзыва"
        ))),
    }
}

/// Текущее состояние токена узла (значение не раскрывается).
pub async fn token_info<C: ConnectionTrait>(db: &C, node_id: i32) -> Result<TokenInfo, AppError> {
    let info = match TokenEntity::find_by_id(node_id).one(db).await? {
        None => TokenInfo {
            state: TokenState::None,
            issued_at: None,
            revoked_at: None,
        },
        Some(t) => TokenInfo {
            state: if t.revoked_at.is_some() {
                TokenState::Revoked
            } else {
                TokenState::Issued
            },
            issued_at: Some(t.issued_at),
            revoked_at: t.revoked_at,
        },
    };
    Ok(info)
}

/// Найти узел по предъявленному токену. Отозванные и заменённые значения
/// не находятся.
pub async fn authenticate<C: ConnectionTrait>(db: &C, token: &str) -> Result<Option<i32>, AppError> {
    let record = TokenEntity::find()
        .filter(Column::TokenHash.eq(hash_token(token)))
        .filter(Column::RevokedAt.is_null())
        .one(db)
        .await?;
    Ok(record.map(|t| t.node_id))
}
