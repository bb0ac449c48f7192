//! Точка входа панели управления узлами.

use clap::Parser;
use panel_server::config::{
    hash_password, InstallConfig, ReconcilerConfig, ServerConfig, TlsMode,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "panel-server",
    about = "Панель управления прокси-узлами: реестр, токены, группы, реконсилер"
)]
struct Cli {
    /// Адрес для прослушивания (host:port)
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// URL базы данных
    #[arg(long, default_value = "sqlite:./panel.db?mode=rwc", env = "DATABASE_URL")]
    db_url: String,

    /// Режим TLS: none, self-signed, cert
    #[arg(long, default_value = "none")]
    tls_mode: String,

    /// Домен для SAN самоподписанного сертификата
    #[arg(long, default_value = "panel.local")]
    domain: String,

    /// PEM-сертификат для режима cert
    #[arg(long, default_value = "/etc/panel/cert.pem")]
    tls_cert: String,

    /// PEM-ключ для режима cert
    #[arg(long, default_value = "/etc/panel/key.pem")]
    tls_key: String,

    /// Секрет JWT (случайный если не задан)
    #[arg(long, env = "JWT_SECRET")]
    jwt_secret: Option<String>,

    /// Имя пользователя администратора
    #[arg(long, default_value = "admin")]
    admin_username: String,

    /// Пароль администратора
    #[arg(long, env = "ADMIN_PASSWORD")]
    admin_password: Option<String>,

    /// Бинарник агента, раздаваемый узлам при установке
    #[arg(long, env = "AGENT_BINARY")]
    agent_binary: Option<PathBuf>,

    /// Период реконсилера, сек
    #[arg(long, default_value_t = 15)]
    reconcile_interval: u64,

    /// Heartbeat старше N сек: узел unhealthy
    #[arg(long, default_value_t = 45)]
    unhealthy_after: u64,

    /// Heartbeat старше N сек: узел offline
    #[arg(long, default_value_t = 120)]
    offline_after: u64,

    /// Таймаут TCP-пробы узла, сек
    #[arg(long, default_value_t = 3)]
    probe_timeout: u64,

    /// Отключить TCP-пробы узлов
    #[arg(long)]
    no_probe: bool,

    /// Общий таймаут автоустановки, сек
    #[arg(long, default_value_t = 300)]
    install_timeout: u64,

    /// Таймаут SSH-соединения, сек
    #[arg(long, default_value_t = 15)]
    ssh_connect_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Инициализация логгера
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let tls_mode: TlsMode = cli
        .tls_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    if cli.unhealthy_after >= cli.offline_after {
        anyhow::bail!("--unhealthy-after должен быть меньше --offline-after");
    }

    // JWT secret: из аргумента или генерируем случайный
    let jwt_secret = match cli.jwt_secret {
        Some(secret) => secret,
        None => {
            let mut buf = [0u8; 32];
            getrandom::fill(&mut buf)
                .map_err(|e| anyhow::anyhow!("Ошибка генерации JWT secret: {e}"))?;
            hex::encode(buf)
        }
    };

    let admin_password = cli.admin_password.unwrap_or_else(|| {
        tracing::warn!("Пароль администратора не задан, используется 'admin' (небезопасно!)");
        "admin".to_string()
    });

    let config = ServerConfig {
        listen: cli.listen,
        db_url: cli.db_url,
        tls_mode,
        domain: cli.domain,
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
        jwt_secret,
        admin_username: cli.admin_username,
        admin_password_hash: hash_password(&admin_password),
        agent_binary: cli.agent_binary,
        reconciler: ReconcilerConfig {
            interval: Duration::from_secs(cli.reconcile_interval.max(1)),
            unhealthy_after: Duration::from_secs(cli.unhealthy_after),
            offline_after: Duration::from_secs(cli.offline_after),
            probe_timeout: Duration::from_secs(cli.probe_timeout.max(1)),
            probe_enabled: !cli.no_probe,
        },
        install: InstallConfig {
            timeout: Duration::from_secs(cli.install_timeout),
            connect_timeout: Duration::from_secs(cli.ssh_connect_timeout),
            ..InstallConfig::default()
        },
    };

    panel_server::run(config).await
}
