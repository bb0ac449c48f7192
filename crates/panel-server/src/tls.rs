//! TLS: без TLS, самоподписанный сертификат или PEM-файлы с перезагрузкой.

use crate::config::{ServerConfig, TlsMode};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// Период перечитывания PEM-файлов в режиме cert.
const CERT_RELOAD_PERIOD: Duration = Duration::from_secs(12 * 3600);

/// Запустить сервер в нужном TLS-режиме.
pub async fn serve(
    config: &ServerConfig,
    app: Router,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config.listen.parse()?;
    match &config.tls_mode {
        TlsMode::None => serve_plain(addr, app, shutdown_rx).await,
        TlsMode::SelfSigned => {
            info!("Запуск HTTPS на {addr} (самоподписанный сертификат)");
            let names = vec![config.domain.clone(), "localhost".to_string()];
            let certified = rcgen::generate_simple_self_signed(names)
                .map_err(|e| anyhow::anyhow!("Ошибка генерации сертификата: {e}"))?;
            let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
                certified.cert.pem().into_bytes(),
                certified.signing_key.serialize_pem().into_bytes(),
            )
            .await?;
            serve_rustls(addr, app, rustls_config, shutdown_rx).await
        }
        TlsMode::Cert => {
            info!(
                "Запуск HTTPS на {addr} (сертификат: {}, ключ: {})",
                config.tls_cert, config.tls_key
            );
            let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &config.tls_cert,
                &config.tls_key,
            )
            .await?;
            spawn_cert_reload(rustls_config.clone(), config.tls_cert.clone(), config.tls_key.clone());
            serve_rustls(addr, app, rustls_config, shutdown_rx).await
        }
    }
}

async fn wait_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow_and_update() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
}

/// Запуск без TLS (HTTP).
async fn serve_plain(
    addr: SocketAddr,
    app: Router,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    info!("Запуск HTTP на {addr} (без TLS)");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(wait_shutdown(shutdown_rx))
    .await?;
    Ok(())
}

async fn serve_rustls(
    addr: SocketAddr,
    app: Router,
    rustls_config: axum_server::tls_rustls::RustlsConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let handle = axum_server::Handle::new();
    let handle_shutdown = handle.clone();
    tokio::spawn(async move {
        wait_shutdown(shutdown_rx).await;
        handle_shutdown.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Фоновая перезагрузка сертификатов (например, после продления acme.sh).
fn spawn_cert_reload(
    rustls_config: axum_server::tls_rustls::RustlsConfig,
    cert: String,
    key: String,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CERT_RELOAD_PERIOD);
        interval.tick().await; // первый тик срабатывает сразу
        loop {
            interval.tick().await;
            match rustls_config.reload_from_pem_file(&cert, &key).await {
                Ok(()) => tracing::info!("TLS сертификаты перезагружены"),
                Err(e) => tracing::error!("Ошибка перезагрузки TLS сертификатов: {e}"),
            }
        }
    });
}
