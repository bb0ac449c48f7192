//! Панель управления прокси-узлами: реестр узлов, токены узлов, группы,
//! реконсилер здоровья и автоустановка агентов.

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod tls;

#[cfg(test)]
mod tests;

use api::rate_limit::RateLimiter;
use api::AppState;
use config::ServerConfig;
use panel_migration::{Migrator, MigratorTrait};
use sea_orm::{Database, DatabaseConnection};
use services::assignment_service::Reassigner;
use services::install_service::SshCommandShell;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Запустить панель.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    // rustls собран без провайдера по умолчанию
    let _ = rustls::crypto::ring::default_provider().install_default();

    // 1. Подключение к БД
    info!("Подключение к базе данных: {}", config.db_url);
    let db: DatabaseConnection = Database::connect(&config.db_url).await?;

    // 2. Автоматические миграции
    info!("Выполнение миграций...");
    Migrator::up(&db, None).await?;

    // 3. Состояние приложения и воркер переназначения
    let membership_lock = Arc::new(Mutex::new(()));
    let state = AppState {
        db: db.clone(),
        jwt_secret: config.jwt_secret.clone(),
        admin_username: config.admin_username.clone(),
        admin_password_hash: config.admin_password_hash.clone(),
        rate_limiter: RateLimiter::new(120, Duration::from_secs(60)),
        shell: Arc::new(SshCommandShell {
            connect_timeout: config.install.connect_timeout,
        }),
        install: config.install.clone(),
        agent_binary: config.agent_binary.clone(),
        reassigner: Reassigner::spawn(db.clone(), membership_lock.clone()),
        membership_lock,
    };
    if config.agent_binary.is_none() {
        tracing::warn!("--agent-binary не задан: автоустановка не сможет скачать агента");
    }

    // 4. Маршрутизатор
    let app = api::build_router(state);

    // 5. Реконсилер здоровья и синхронизации
    let db_bg = db.clone();
    let reconciler = config.reconciler.clone();
    tokio::spawn(async move {
        services::health_service::run_reconcile_loop(db_bg, reconciler).await;
    });

    // 6. Graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Получен сигнал завершения, останавливаю панель...");
        let _ = shutdown_tx.send(true);
    });

    // 7. Запуск сервера
    info!("Панель запущена (TLS: {})", config.tls_mode);
    tls::serve(&config, app, shutdown_rx).await?;

    info!("Панель остановлена");
    Ok(())
}
