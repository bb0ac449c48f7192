//! Конфигурация панели управления узлами.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Адрес для прослушивания (например "0.0.0.0:8443")
    pub listen: String,

    /// URL подключения к БД (sqlite или postgres)
    pub db_url: String,

    /// Режим TLS
    pub tls_mode: TlsMode,

    /// Домен для SAN самоподписанного сертификата
    pub domain: String,

    /// PEM-сертификат (режим cert)
    pub tls_cert: String,

    /// PEM-ключ (режим cert)
    pub tls_key: String,

    /// Секрет JWT администратора
    pub jwt_secret: String,

    /// Имя пользователя администратора
    pub admin_username: String,

    /// Хэш пароля администратора (SHA-256 hex)
    pub admin_password_hash: String,

    /// Бинарник агента, который отдаётся узлам при установке
    pub agent_binary: Option<PathBuf>,

    pub reconciler: ReconcilerConfig,

    pub install: InstallConfig,
}

/// Параметры фонового реконсилера здоровья и синхронизации.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Период тика
    pub interval: Duration,

    /// Порог heartbeat для unhealthy
    pub unhealthy_after: Duration,

    /// Порог heartbeat (или его отсутствие) для offline
    pub offline_after: Duration,

    /// Таймаут одной TCP-пробы
    pub probe_timeout: Duration,

    /// Выполнять ли TCP-пробы адреса узла
    pub probe_enabled: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            unhealthy_after: Duration::from_secs(45),
            offline_after: Duration::from_secs(120),
            probe_timeout: Duration::from_secs(3),
            probe_enabled: true,
        }
    }
}

/// Параметры автоустановки агента по SSH.
#[derive(Debug, Clone)]
pub struct InstallConfig {
    /// Общий бюджет времени на все шаги установки
    pub timeout: Duration,

    /// Таймаут установления SSH-соединения
    pub connect_timeout: Duration,

    /// Путь агента на удалённом узле
    pub remote_binary_path: String,

    /// Имя systemd-сервиса агента
    pub service_name: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(15),
            remote_binary_path: "/usr/local/bin/node-agent".to_string(),
            service_name: "node-agent".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TlsMode {
    None,
    SelfSigned,
    Cert,
}

impl std::str::FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(TlsMode::None),
            "self-signed" | "selfsigned" => Ok(TlsMode::SelfSigned),
            "cert" => Ok(TlsMode::Cert),
            other => Err(format!(
                "Неизвестный режим TLS: {other}. Допустимые: none, self-signed, cert"
            )),
        }
    }
}

impl std::fmt::Display for TlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsMode::None => write!(f, "none"),
            TlsMode::SelfSigned => write!(f, "self-signed"),
            TlsMode::Cert => write!(f, "cert"),
        }
    }
}

/// Хэшировать пароль (SHA-256 hex).
pub fn hash_password(password: &str) -> String {
    use sha2::{Digest, Sha256};
    let hash = Sha256::digest(password.as_bytes());
    hex::encode(hash)
}

/// Проверить пароль по хэшу (сравнение за постоянное время).
pub fn verify_password(password: &str, hash: &str) -> bool {
    use subtle::ConstantTimeEq;
    hash_password(password).as_bytes().ct_eq(hash.as_bytes()).into()
}
