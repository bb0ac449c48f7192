//! Автоустановка агента на удалённый узел по SSH.
//!
//! Шаги выполняются строго по порядку: connect → download_agent →
//! configure → start_service. Сбой шага останавливает установку, уже
//! применённые шаги не откатываются.

use crate::config::InstallConfig;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use panel_entities::node_installs::{self, Column, Entity as InstallEntity};
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ConnectionTrait, EntityTrait};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;

pub const STEP_CONNECT: &str = "connect";
pub const STEP_DOWNLOAD: &str = "download_agent";
pub const STEP_CONFIGURE: &str = "configure";
pub const STEP_START: &str = "start_service";

// ── Типы ─────────────────────────────────────────────────────────────────────

/// SSH-учётные данные из запроса администратора.
#[derive(Debug, Clone, Deserialize)]
pub struct SshCredentials {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: i64,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
}

fn default_ssh_port() -> i64 {
    22
}

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    Key(PathBuf),
}

/// Провалидированная цель SSH.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

impl SshCredentials {
    pub fn validate(&self) -> Result<SshTarget, AppError> {
        let host = ssh_word("ssh.host", &self.host)?;
        let port = crate::services::validation::validate_port(self.port)? as u16;
        let username = ssh_word("ssh.username", &self.username)?;
        let auth = match (&self.password, &self.private_key_path) {
            (Some(p), _) if !p.is_empty() => SshAuth::Password(p.clone()),
            (_, Some(k)) if !k.trim().is_empty() => SshAuth::Key(PathBuf::from(k.trim())),
            _ => {
                return Err(AppError::Validation(
                    "Нужен ssh.password или ssh.private_key_path".into(),
                ))
            }
        };
        Ok(SshTarget {
            host: host.to_string(),
            port,
            username: username.to_string(),
            auth,
        })
    }
}

/// Хост или имя пользователя SSH: непустое слово, которое ssh не примет за опцию.
fn ssh_word<'a>(field: &str, value: &'a str) -> Result<&'a str, AppError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::Validation(format!("{field} обязателен")));
    }
    if value.starts_with('-') || value.contains(char::is_whitespace) || value.contains('@') {
        return Err(AppError::Validation(format!("Некорректный {field}: {value}")));
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStep {
    pub name: String,
    pub status: StepStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub success: bool,
    pub steps: Vec<InstallStep>,
    pub logs: String,
    pub failed_step: Option<String>,
    pub last_completed_step: Option<String>,
    /// timeout | ssh_connect | command_failed
    pub error_code: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

/// Что именно установить на узел.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub node_id: i32,
    pub node_port: i32,
    pub panel_url: String,
    pub token: String,
}

// ── Удалённое выполнение ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("SSH-соединение не установлено: {0}")]
    Connect(String),

    #[error("Команда завершилась с кодом {code}: {stderr}")]
    Failed { code: i32, stderr: String },

    #[error("Ошибка запуска ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

impl ShellError {
    fn code(&self) -> &'static str {
        match self {
            ShellError::Connect(_) => "ssh_connect",
            ShellError::Failed { .. } | ShellError::Spawn(_) => "command_failed",
        }
    }
}

/// Выполнение shell-скрипта на удалённом узле.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, target: &SshTarget, script: &str) -> Result<ShellOutput, ShellError>;
}

/// Реализация через системный клиент ssh (sshpass -e для пароля).
/// Скрипт передаётся через stdin в `sh -s`.
pub struct SshCommandShell {
    pub connect_timeout: Duration,
}

#[async_trait]
impl RemoteShell for SshCommandShell {
    async fn exec(&self, target: &SshTarget, script: &str) -> Result<ShellOutput, ShellError> {
        let mut cmd = match &target.auth {
            SshAuth::Password(password) => {
                let mut c = Command::new("sshpass");
                c.arg("-e").arg("ssh").env("SSHPASS", password);
                c
            }
            SshAuth::Key(path) => {
                let mut c = Command::new("ssh");
                c.arg("-i").arg(path).arg("-o").arg("BatchMode=yes");
                c
            }
        };
        cmd.arg("-p")
            .arg(target.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .arg("--")
            .arg(format!("{}@{}", target.username, target.host))
            .arg("sh -s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        match output.status.code() {
            Some(0) => Ok(ShellOutput { stdout, stderr }),
            // ssh возвращает 255 при ошибке соединения или аутентификации
            Some(255) | None => Err(ShellError::Connect(stderr.trim().to_string())),
            Some(code) => Err(ShellError::Failed {
                code,
                stderr: stderr.trim().to_string(),
            }),
        }
    }
}

// ── Установка ────────────────────────────────────────────────────────────────

/// Экранировать строку для POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Скрипты шагов установки в порядке выполнения.
pub fn build_steps(plan: &InstallPlan, cfg: &InstallConfig) -> Vec<(&'static str, String)> {
    let bin = shell_quote(&cfg.remote_binary_path);
    let download_url = shell_quote(&format!("{}/api/agent/binary", plan.panel_url));
    let auth_header = shell_quote(&format!("Authorization: Bearer {}", plan.token));

    let agent_config = serde_json::json!({
        "panel_url": plan.panel_url,
        "node_id": plan.node_id,
        "token": plan.token,
        "listen_port": plan.node_port,
    });
    let config_dir = format!("/etc/{}", cfg.service_name);

    let unit = format!(
        "[Unit]\nDescription=Proxy node agent\nAfter=network-online.target\n\n\
         [Service]\nExecStart={} --config {}/config.json\nRestart=always\nRestartSec=5\n\n\
         [Install]\nWantedBy=multi-user.target",
        cfg.remote_binary_path, config_dir
    );

    vec![
        (STEP_CONNECT, "uname -sm && id -u".to_string()),
        (
            STEP_DOWNLOAD,
            format!(
                "set -e\ncurl -fsSL --retry 3 -H {auth_header} {download_url} -o {bin}.tmp\n\
                 chmod 755 {bin}.tmp\nmv {bin}.tmp {bin}\n"
            ),
        ),
        (
            STEP_CONFIGURE,
            format!(
                "set -e\numask 077\nmkdir -p {dir}\ncat > {dir}/config.json <<'AGENT_CONFIG'\n{agent_config}\nAGENT_CONFIG\n",
                dir = shell_quote(&config_dir),
            ),
        ),
        (
            STEP_START,
            format!(
                "set -e\ncat > /etc/systemd/system/{svc}.service <<'AGENT_UNIT'\n{unit}\nAGENT_UNIT\n\
                 systemctl daemon-reload\nsystemctl enable {svc}\nsystemctl restart {svc}\nsystemctl is-active {svc}\n",
                svc = cfg.service_name,
            ),
        ),
    ]
}

/// Выполнить установку. Каждый шаг получает остаток общего бюджета
/// времени; по истечении бюджета текущий шаг помечается failed,
/// а последующие остаются pending.
pub async fn run_install(
    shell: &dyn RemoteShell,
    target: &SshTarget,
    plan: &InstallPlan,
    cfg: &InstallConfig,
) -> InstallResult {
    let started_at = Utc::now().to_rfc3339();
    let scripts = build_steps(plan, cfg);
    let mut steps: Vec<InstallStep> = scripts
        .iter()
        .map(|(name, _)| InstallStep {
            name: name.to_string(),
            status: StepStatus::Pending,
            message: None,
        })
        .collect();

    let mut logs = String::new();
    let mut failed_step = None;
    let mut last_completed_step = None;
    let mut error_code = None;
    let deadline = Instant::now() + cfg.timeout;

    for (i, (name, script)) in scripts.iter().enumerate() {
        steps[i].status = StepStatus::Running;
        logs.push_str(&format!("==> {name}\n"));
        tracing::info!("Установка на {}: шаг {name}", target.host);

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, shell.exec(target, script)).await {
            Ok(Ok(out)) => {
                logs.push_str(&out.stdout);
                logs.push_str(&out.stderr);
                steps[i].status = StepStatus::Success;
                last_completed_step = Some(name.to_string());
            }
            Ok(Err(e)) => {
                logs.push_str(&format!("{e}\n"));
                tracing::warn!("Установка на {}: шаг {name} провален: {e}", target.host);
                steps[i].status = StepStatus::Failed;
                steps[i].message = Some(e.to_string());
                failed_step = Some(name.to_string());
                error_code = Some(e.code().to_string());
                break;
            }
            Err(_) => {
                let msg = format!(
                    "Превышен общий таймаут установки ({} сек)",
                    cfg.timeout.as_secs()
                );
                logs.push_str(&format!("{msg}\n"));
                tracing::warn!("Установка на {}: таймаут на шаге {name}", target.host);
                steps[i].status = StepStatus::Failed;
                steps[i].message = Some(msg);
                failed_step = Some(name.to_string());
                error_code = Some("timeout".to_string());
                break;
            }
        }
    }

    InstallResult {
        success: failed_step.is_none(),
        steps,
        logs,
        failed_step,
        last_completed_step,
        error_code,
        started_at,
        finished_at: Utc::now().to_rfc3339(),
    }
}

/// Сохранить результат последней установки узла.
pub async fn save_result<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
    result: &InstallResult,
) -> Result<(), AppError> {
    let model = node_installs::ActiveModel {
        node_id: Set(node_id),
        success: Set(result.success),
        failed_step: Set(result.failed_step.clone()),
        error_code: Set(result.error_code.clone()),
        steps: Set(serde_json::to_string(&result.steps)?),
        logs: Set(result.logs.clone()),
        started_at: Set(result.started_at.clone()),
        finished_at: Set(result.finished_at.clone()),
    };
    InstallEntity::insert(model)
        .on_conflict(
            OnConflict::column(Column::NodeId)
                .update_columns([
                    Column::Success,
                    Column::FailedStep,
                    Column::ErrorCode,
                    Column::Steps,
                    Column::Logs,
                    Column::StartedAt,
                    Column::FinishedAt,
                ])
                .to_owned(),
        )
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Загрузить результат последней установки узла.
pub async fn load_result<C: ConnectionTrait>(
    db: &C,
    node_id: i32,
) -> Result<Option<InstallResult>, AppError> {
    let Some(record) = InstallEntity::find_by_id(node_id).one(db).await? else {
        return Ok(None);
    };
    let steps: Vec<InstallStep> = serde_json::from_str(&record.steps)?;
    let last_completed_step = steps
        .iter()
        .take_while(|s| s.status == StepStatus::Success)
        .last()
        .map(|s| s.name.clone());
    Ok(Some(InstallResult {
        success: record.success,
        steps,
        logs: record.logs,
        failed_step: record.failed_step,
        last_completed_step,
        error_code: record.error_code,
        started_at: record.started_at,
        finished_at: record.finished_at,
    }))
}
