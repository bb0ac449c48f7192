//! In-memory rate limiter для маршрутов агентов: фиксированное окно на IP.

use crate::error::AppError;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Размер таблицы, после которого вычищаются истёкшие окна.
const SWEEP_THRESHOLD: usize = 1000;

struct Window {
    hits: u32,
    opened_at: Instant,
}

/// Не более `limit` запросов с одного IP за `window`.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    /// Учесть запрос. false, если лимит исчерпан.
    pub async fn check(&self, key: &str) -> bool {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.opened_at) < self.window);
        }

        let w = windows.entry(key.to_string()).or_insert(Window {
            hits: 0,
            opened_at: now,
        });
        if now.duration_since(w.opened_at) >= self.window {
            w.hits = 0;
            w.opened_at = now;
        }
        w.hits += 1;
        w.hits <= self.limit
    }
}

pub async fn rate_limit_middleware(
    limiter: RateLimiter,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&req);
    if !limiter.check(&ip).await {
        tracing::warn!("Rate limit превышен для IP: {ip}");
        return Err(AppError::TooManyRequests);
    }
    Ok(next.run(req).await)
}

/// IP клиента: первый адрес X-Forwarded-For, иначе адрес соединения.
pub fn client_ip<B>(req: &Request<B>) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}
