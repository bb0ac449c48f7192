//! Тесты: валидация, жизненный цикл токенов, ёмкость узлов, каскадное
//! удаление, автоустановка, реконсилер, интеграционные тесты HTTP.

#[cfg(test)]
mod tests {
    use crate::api::rate_limit::RateLimiter;
    use crate::api::{build_router, AppState};
    use crate::config::{hash_password, InstallConfig, ReconcilerConfig};
    use crate::error::AppError;
    use crate::services::assignment_service::{self, ReassignJob, Reassigner};
    use crate::services::group_service::{self, CreateGroupRequest};
    use crate::services::health_service::{self, HeartbeatReport};
    use crate::services::install_service::{
        RemoteShell, ShellError, ShellOutput, SshCredentials, SshTarget, StepStatus,
    };
    use crate::services::node_service::{self, CreateMode, CreateNodeRequest, NodePatch};
    use crate::services::token_service::{self, RevokeOutcome, TokenState};
    use crate::services::validation;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use panel_entities::nodes::{self, ActiveModel as NodeActiveModel};
    use panel_entities::{GroupStrategy, NodeStatus, SyncStatus};
    use panel_migration::{Migrator, MigratorTrait};
    use sea_orm::{ActiveModelTrait, ActiveValue::Set, Database, DatabaseConnection};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    // ── Вспомогательные функции ───────────────────────────────────────────────

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    /// Удалённая оболочка с заранее заданным поведением.
    #[derive(Default)]
    struct ScriptedShell {
        /// Номер вызова (с нуля), на котором вернуть ошибку соединения
        fail_at: Option<usize>,
        /// Задержка каждого вызова
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn exec(&self, _target: &SshTarget, _script: &str) -> Result<ShellOutput, ShellError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_at == Some(n) {
                return Err(ShellError::Connect("connect to host 198.51.100.7 port 22: No route to host".into()));
            }
            Ok(ShellOutput {
                stdout: format!("step {n} ok\n"),
                stderr: String::new(),
            })
        }
    }

    fn manual_request(name: &str, address: &str, port: i64, max_users: i64) -> CreateNodeRequest {
        CreateNodeRequest {
            name: name.to_string(),
            region: "hk".to_string(),
            address: Some(address.to_string()),
            port: Some(port),
            weight: 5,
            max_users,
            tags: vec![],
            ip_whitelist: vec![],
            mode: CreateMode::Manual,
            ssh: None,
            panel_url: None,
        }
    }

    fn auto_request(panel_url: &str) -> CreateNodeRequest {
        CreateNodeRequest {
            name: "sg-auto".to_string(),
            region: "sg".to_string(),
            address: None,
            port: None,
            weight: 1,
            max_users: 0,
            tags: vec![],
            ip_whitelist: vec![],
            mode: CreateMode::AutoInstall,
            ssh: Some(SshCredentials {
                host: "198.51.100.7".to_string(),
                port: 22,
                username: "root".to_string(),
                password: Some("secret".to_string()),
                private_key_path: None,
            }),
            panel_url: Some(panel_url.to_string()),
        }
    }

    async fn create_manual(db: &DatabaseConnection, name: &str, max_users: i64) -> nodes::Model {
        let shell = ScriptedShell::default();
        let created = node_service::create_node(
            db,
            &shell,
            &InstallConfig::default(),
            manual_request(name, "1.2.3.4", 18443, max_users),
        )
        .await
        .unwrap();
        node_service::find_node(db, created.node.id).await.unwrap()
    }

    /// Перевести узел в online, как это сделал бы реконсилер.
    async fn force_status(db: &DatabaseConnection, node: &nodes::Model, status: NodeStatus) {
        let mut model: NodeActiveModel = node_service::find_node(db, node.id).await.unwrap().into();
        model.status = Set(status);
        model.update(db).await.unwrap();
    }

    // ── Валидация ─────────────────────────────────────────────────────────────

    #[test]
    fn test_panel_url_rejects_loopback() {
        for url in [
            "http://localhost:8080",
            "http://127.0.0.1:9000",
            "https://LOCALHOST/",
            "http://[::1]:8080",
            "http://0.0.0.0:80",
            "http://127.8.8.8",
            "http://localhost.:8080",
            "http://api.localhost./",
            "http://[::ffff:127.0.0.1]:8080",
            "http://[::ffff:0.0.0.0]/",
            "http://[::]:8080",
        ] {
            assert!(
                matches!(validation::validate_panel_url(url), Err(AppError::Validation(_))),
                "{url} должен быть отклонён"
            );
        }
    }

    #[test]
    fn test_panel_url_accepts_public_address() {
        let url = validation::validate_panel_url("http://203.0.113.5:8080").unwrap();
        assert_eq!(url, "http://203.0.113.5:8080");
        assert!(validation::validate_panel_url("https://panel.example.com/").is_ok());
        assert!(validation::validate_panel_url("ftp://203.0.113.5").is_err());
        assert!(validation::validate_panel_url("not a url").is_err());
    }

    #[test]
    fn test_ip_whitelist_normalization() {
        let list = validation::normalize_ip_whitelist(&[
            "10.0.0.0/8".to_string(),
            " 203.0.113.5 ".to_string(),
            "10.0.0.0/8".to_string(),
            "2001:db8::/32".to_string(),
        ])
        .unwrap();
        assert_eq!(list, vec!["10.0.0.0/8", "2001:db8::/32", "203.0.113.5"]);

        assert!(validation::validate_ip_entry("10.0.0.0/33").is_err());
        assert!(validation::validate_ip_entry("example.com").is_err());
        assert!(validation::validate_ip_entry("10.0.0.1/abc").is_err());
    }

    #[test]
    fn test_port_and_name_validation() {
        assert!(validation::validate_port(0).is_err());
        assert!(validation::validate_port(65536).is_err());
        assert_eq!(validation::validate_port(18443).unwrap(), 18443);
        assert!(validation::validate_name("   ").is_err());
        assert_eq!(validation::validate_name(" hk-1 ").unwrap(), "hk-1");
    }

    #[test]
    fn test_patch_rejects_reconciler_fields() {
        let err = node_service::parse_patch(serde_json::json!({
            "name": "renamed",
            "status": "online",
            "latency": 10
        }))
        .unwrap_err();
        match err {
            AppError::Validation(msg) => {
                assert!(msg.contains("status") && msg.contains("latency"));
            }
            other => panic!("Ожидалась ошибка валидации, получено {other:?}"),
        }

        let patch = node_service::parse_patch(serde_json::json!({ "weight": 3 })).unwrap();
        assert_eq!(patch.weight, Some(3));
        assert!(node_service::parse_patch(serde_json::json!({ "bogus": 1 })).is_err());
    }

    #[test]
    fn test_password_hash_and_verify() {
        use crate::config::verify_password;

        let hash = hash_password("SuperSecret123!");
        assert!(verify_password("SuperSecret123!", &hash));
        assert!(!verify_password("WrongPassword", &hash));
    }

    #[test]
    fn test_ssh_credentials_reject_option_like_values() {
        let creds = |host: &str, username: &str| SshCredentials {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            password: Some("secret".to_string()),
            private_key_path: None,
        };

        for (host, username) in [
            ("198.51.100.7", "-oProxyCommand=touch /tmp/x"),
            ("-oProxyCommand=id", "root"),
            ("198.51.100.7", "root admin"),
            ("198.51.100.7 -v", "root"),
            ("198.51.100.7", "root@evil"),
        ] {
            assert!(
                matches!(creds(host, username).validate(), Err(AppError::Validation(_))),
                "{username}@{host} должен быть отклонён"
            );
        }

        let target = creds(" 198.51.100.7 ", " root ").validate().unwrap();
        assert_eq!(target.host, "198.51.100.7");
        assert_eq!(target.username, "root");
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        use crate::services::install_service::shell_quote;
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    // ── Реконсилер: чистые функции ────────────────────────────────────────────

    #[test]
    fn test_evaluate_health_thresholds() {
        let cfg = ReconcilerConfig::default();
        let now = Utc::now();

        assert_eq!(
            health_service::evaluate_health(None, now, None, &cfg),
            NodeStatus::Offline,
            "Узел без heartbeat должен быть offline"
        );
        assert_eq!(
            health_service::evaluate_health(Some(now - ChronoDuration::seconds(5)), now, Some(Some(12)), &cfg),
            NodeStatus::Online
        );
        assert_eq!(
            health_service::evaluate_health(Some(now - ChronoDuration::seconds(5)), now, Some(None), &cfg),
            NodeStatus::Unhealthy,
            "Проваленная проба при свежем heartbeat даёт unhealthy"
        );
        assert_eq!(
            health_service::evaluate_health(Some(now - ChronoDuration::seconds(60)), now, None, &cfg),
            NodeStatus::Unhealthy
        );
        assert_eq!(
            health_service::evaluate_health(Some(now - ChronoDuration::seconds(600)), now, Some(Some(1)), &cfg),
            NodeStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_evaluate_sync() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;

        assert_eq!(health_service::evaluate_sync(&node), SyncStatus::Pending);
        let synced = nodes::Model {
            applied_revision: node.config_revision,
            ..node.clone()
        };
        assert_eq!(health_service::evaluate_sync(&synced), SyncStatus::Synced);
        let failed = nodes::Model {
            sync_error: Some("xray: bad config".into()),
            ..synced
        };
        assert_eq!(health_service::evaluate_sync(&failed), SyncStatus::Failed);
    }

    // ── Реестр узлов ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_manual_create_without_install() {
        let db = setup_db().await;
        let shell = ScriptedShell::default();

        let created = node_service::create_node(
            &db,
            &shell,
            &InstallConfig::default(),
            manual_request("hk-1", "1.2.3.4", 18443, 0),
        )
        .await
        .unwrap();

        assert!(created.install_result.is_none(), "Ручной режим не запускает установку");
        assert_eq!(shell.calls.load(Ordering::SeqCst), 0);
        assert_eq!(created.node.name, "hk-1");
        assert_eq!(created.node.port, 18443);
        assert_eq!(created.node.weight, 5);
        assert_eq!(created.node.max_users, 0);
        assert_eq!(created.node.current_users, 0);
        assert_eq!(created.node.status, NodeStatus::Offline);
        assert_eq!(created.node.sync_status, SyncStatus::Pending);
        assert_eq!(created.node.token_state, TokenState::None);
    }

    #[tokio::test]
    async fn test_manual_create_requires_address_and_port() {
        let db = setup_db().await;
        let shell = ScriptedShell::default();
        let mut req = manual_request("hk-1", "1.2.3.4", 18443, 0);
        req.port = None;

        let err = node_service::create_node(&db, &shell, &InstallConfig::default(), req)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(node_service::list_nodes(&db, &Default::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_bumps_revision_only_for_node_config() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;

        let view = node_service::update_node(
            &db,
            node.id,
            NodePatch {
                region: Some("asia".into()),
                weight: Some(9),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(view.config_revision, node.config_revision, "Регион и вес не требуют синхронизации");

        let view = node_service::update_node(
            &db,
            node.id,
            NodePatch {
                name: Some("hk-renamed".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            view.config_revision,
            node.config_revision + 1,
            "Имя входит в конфигурацию агента"
        );
        let node = node_service::find_node(&db, node.id).await.unwrap();

        let view = node_service::update_node(
            &db,
            node.id,
            NodePatch {
                ip_whitelist: Some(vec!["203.0.113.0/24".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(view.config_revision, node.config_revision + 1);
        assert_eq!(view.sync_status, SyncStatus::Pending);
        assert_eq!(view.ip_whitelist, vec!["203.0.113.0/24"]);
    }

    // ── Токены ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_rotate_without_token_is_not_found() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;

        assert!(matches!(
            token_service::rotate(&db, node.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            token_service::revoke(&db, node.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            token_service::generate(&db, 9999).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rotate_invalidates_previous_token() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;

        let first = token_service::generate(&db, node.id).await.unwrap();
        assert_eq!(token_service::authenticate(&db, &first).await.unwrap(), Some(node.id));

        let second = token_service::rotate(&db, node.id).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            token_service::authenticate(&db, &first).await.unwrap(),
            None,
            "Старый токен должен быть отклонён сразу после ротации"
        );
        assert_eq!(token_service::authenticate(&db, &second).await.unwrap(), Some(node.id));
    }

    #[tokio::test]
    async fn test_concurrent_rotations_leave_one_valid_token() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        token_service::generate(&db, node.id).await.unwrap();

        let (a, b) = tokio::join!(
            token_service::rotate(&db, node.id),
            token_service::rotate(&db, node.id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let valid_a = token_service::authenticate(&db, &a).await.unwrap().is_some();
        let valid_b = token_service::authenticate(&db, &b).await.unwrap().is_some();
        assert!(valid_a ^ valid_b, "Ровно один из токенов должен действовать");
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_generate_reenters() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        let token = token_service::generate(&db, node.id).await.unwrap();

        assert_eq!(token_service::revoke(&db, node.id).await.unwrap(), RevokeOutcome::Revoked);
        assert_eq!(
            token_service::revoke(&db, node.id).await.unwrap(),
            RevokeOutcome::AlreadyRevoked
        );
        assert_eq!(token_service::authenticate(&db, &token).await.unwrap(), None);
        assert_eq!(
            token_service::token_info(&db, node.id).await.unwrap().state,
            TokenState::Revoked
        );
        assert!(
            matches!(token_service::rotate(&db, node.id).await, Err(AppError::NotFound(_))),
            "Отозванный токен нельзя ротировать"
        );

        let fresh = token_service::generate(&db, node.id).await.unwrap();
        assert_eq!(token_service::authenticate(&db, &fresh).await.unwrap(), Some(node.id));
        assert_eq!(
            token_service::token_info(&db, node.id).await.unwrap().state,
            TokenState::Issued
        );
    }

    // ── Ёмкость и закрепления ─────────────────────────────────────────────────

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 2).await;
        force_status(&db, &node, NodeStatus::Online).await;

        for user in ["u1", "u2", "u3", "u4"] {
            let _ = assignment_service::assign(&db, node.id, user).await;
            let view = node_service::get_node(&db, node.id).await.unwrap();
            assert!(view.current_users <= view.max_users as i64);
        }
        assert!(matches!(
            assignment_service::assign(&db, node.id, "u5").await,
            Err(AppError::Conflict(_))
        ));
        assert_eq!(node_service::get_node(&db, node.id).await.unwrap().current_users, 2);

        // Повторное закрепление того же пользователя ничего не меняет
        assignment_service::assign(&db, node.id, "u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_offline_node_rejects_assignments() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;

        assert!(matches!(
            assignment_service::assign(&db, node.id, "u1").await,
            Err(AppError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_max_users_cannot_drop_below_current() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        force_status(&db, &node, NodeStatus::Online).await;
        for user in ["u1", "u2", "u3"] {
            assignment_service::assign(&db, node.id, user).await.unwrap();
        }

        let err = node_service::update_node(
            &db,
            node.id,
            NodePatch {
                max_users: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn test_pick_target_prefers_group_then_load() {
        let base = nodes::Model {
            id: 0,
            name: String::new(),
            region: String::new(),
            address: "1.2.3.4".into(),
            port: 443,
            weight: 1,
            max_users: 0,
            enabled: true,
            status: NodeStatus::Online,
            latency_ms: 0,
            last_seen_at: None,
            sync_status: SyncStatus::Synced,
            synced_at: None,
            config_revision: 1,
            applied_revision: 1,
            sync_error: None,
            tags: "[]".into(),
            ip_whitelist: "[]".into(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let a = nodes::Model { id: 1, ..base.clone() };
        let b = nodes::Model { id: 2, weight: 4, ..base.clone() };
        let c = nodes::Model { id: 3, max_users: 1, ..base.clone() };
        let candidates = vec![a, b, c];
        let counts = HashMap::from([(1, 2), (2, 4), (3, 1)]);

        // 1: 2/1, 2: 4/4, выигрывает менее нагруженный по весу
        assert_eq!(
            assignment_service::pick_target(&candidates, &counts, &HashSet::new()),
            Some(2)
        );
        // Узел из той же группы предпочтительнее
        assert_eq!(
            assignment_service::pick_target(&candidates, &counts, &HashSet::from([1])),
            Some(1)
        );
        // Заполненный узел не выбирается даже из группы
        assert_eq!(
            assignment_service::pick_target(&candidates, &counts, &HashSet::from([3])),
            Some(2)
        );
    }

    // ── Группы и каскадное удаление ───────────────────────────────────────────

    #[tokio::test]
    async fn test_delete_node_updates_group_rollups() {
        let db = setup_db().await;
        let n1 = create_manual(&db, "hk-1", 0).await;
        let n2 = create_manual(&db, "hk-2", 0).await;
        force_status(&db, &n1, NodeStatus::Online).await;
        force_status(&db, &n2, NodeStatus::Online).await;
        assignment_service::assign(&db, n1.id, "u1").await.unwrap();

        let group = group_service::create_group(
            &db,
            CreateGroupRequest {
                name: "asia".into(),
                description: String::new(),
                region: "hk".into(),
                strategy: GroupStrategy::LeastConnections,
            },
        )
        .await
        .unwrap();
        group_service::add_member(&db, group.id, n1.id).await.unwrap();
        let view = group_service::add_member(&db, group.id, n2.id).await.unwrap();
        assert_eq!((view.total_nodes, view.healthy_nodes, view.total_users), (2, 2, 1));

        let job = node_service::delete_node(&db, n1.id).await.unwrap();
        assert_eq!(job.user_ids, vec!["u1".to_string()]);
        assert_eq!(job.group_ids, vec![group.id]);

        let view = group_service::get_group(&db, group.id).await.unwrap();
        assert_eq!(view.node_ids, vec![n2.id]);
        assert_eq!((view.total_nodes, view.healthy_nodes, view.total_users), (1, 1, 0));
        assert!(matches!(
            node_service::get_node(&db, n1.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            group_service::add_member(&db, group.id, n1.id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_node_invalidates_token() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        let token = token_service::generate(&db, node.id).await.unwrap();

        node_service::delete_node(&db, node.id).await.unwrap();
        assert_eq!(token_service::authenticate(&db, &token).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reassign_users_after_delete() {
        let db = setup_db().await;
        let gone = create_manual(&db, "gone", 0).await;
        let same_group = create_manual(&db, "same-group", 0).await;
        let other = create_manual(&db, "other", 0).await;
        for n in [&gone, &same_group, &other] {
            force_status(&db, n, NodeStatus::Online).await;
        }
        let group = group_service::create_group(
            &db,
            CreateGroupRequest {
                name: "g".into(),
                description: String::new(),
                region: String::new(),
                strategy: GroupStrategy::Weighted,
            },
        )
        .await
        .unwrap();
        group_service::add_member(&db, group.id, gone.id).await.unwrap();
        group_service::add_member(&db, group.id, same_group.id).await.unwrap();
        assignment_service::assign(&db, gone.id, "u1").await.unwrap();
        assignment_service::assign(&db, gone.id, "u2").await.unwrap();

        let job = node_service::delete_node(&db, gone.id).await.unwrap();
        let report = assignment_service::reassign_users(&db, &job).await.unwrap();

        assert!(report.unplaced.is_empty());
        assert!(report.moved.iter().all(|(_, node)| *node == same_group.id));
        assert_eq!(node_service::get_node(&db, same_group.id).await.unwrap().current_users, 2);
        assert_eq!(node_service::get_node(&db, other.id).await.unwrap().current_users, 0);
    }

    #[tokio::test]
    async fn test_reassign_without_eligible_nodes_leaves_users_unplaced() {
        let db = setup_db().await;
        let report = assignment_service::reassign_users(
            &db,
            &ReassignJob {
                from_node: 42,
                group_ids: vec![],
                user_ids: vec!["u1".into()],
            },
        )
        .await
        .unwrap();
        assert_eq!(report.unplaced, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn test_stats_and_member_removal() {
        use crate::services::admin_service;

        let db = setup_db().await;
        let n1 = create_manual(&db, "hk-1", 0).await;
        let n2 = create_manual(&db, "hk-2", 0).await;
        force_status(&db, &n1, NodeStatus::Online).await;
        assignment_service::assign(&db, n1.id, "u1").await.unwrap();
        let group = group_service::create_group(
            &db,
            CreateGroupRequest {
                name: "eu".into(),
                description: String::new(),
                region: String::new(),
                strategy: GroupStrategy::RoundRobin,
            },
        )
        .await
        .unwrap();
        group_service::add_member(&db, group.id, n1.id).await.unwrap();

        let stats = admin_service::get_stats(&db).await.unwrap();
        assert_eq!(stats.total_nodes, 2);
        assert_eq!(stats.online, 1);
        assert_eq!(stats.offline, 1);
        assert_eq!(stats.groups, 1);
        assert_eq!(stats.assigned_users, 1);

        assert!(matches!(
            group_service::remove_member(&db, group.id, n2.id).await,
            Err(AppError::NotFound(_))
        ));
        let view = group_service::remove_member(&db, group.id, n1.id).await.unwrap();
        assert_eq!(view.total_nodes, 0);
        assert_eq!(view.total_users, 0);
    }

    // ── Автоустановка ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_auto_install_success() {
        let db = setup_db().await;
        let shell = ScriptedShell::default();

        let created = node_service::create_node(
            &db,
            &shell,
            &InstallConfig::default(),
            auto_request("http://203.0.113.5:8080"),
        )
        .await
        .unwrap();

        let result = created.install_result.expect("Ожидался install_result");
        assert!(result.success);
        assert_eq!(result.steps.len(), 4);
        assert!(result.steps.iter().all(|s| s.status == StepStatus::Success));
        assert_eq!(result.last_completed_step.as_deref(), Some("start_service"));
        assert!(result.logs.contains("step 3 ok"));
        assert_eq!(created.node.address, "198.51.100.7");
        assert_eq!(created.node.port, 443);
        assert_eq!(created.node.sync_status, SyncStatus::Pending);
        assert_eq!(created.node.token_state, TokenState::Issued);
    }

    #[tokio::test]
    async fn test_auto_install_unreachable_host_reports_failed_step() {
        let db = setup_db().await;
        let shell = ScriptedShell {
            fail_at: Some(0),
            ..Default::default()
        };

        let created = node_service::create_node(
            &db,
            &shell,
            &InstallConfig::default(),
            auto_request("http://203.0.113.5:8080"),
        )
        .await
        .unwrap();

        let result = created.install_result.expect("Ожидался install_result");
        assert!(!result.success);
        assert!(!result.steps.is_empty());
        assert_eq!(result.steps[0].status, StepStatus::Failed);
        assert!(result.steps[1..].iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(result.failed_step.as_deref(), Some("connect"));
        assert_eq!(result.error_code.as_deref(), Some("ssh_connect"));
        assert_eq!(result.last_completed_step, None);
        assert_eq!(
            created.node.sync_status,
            SyncStatus::Failed,
            "Узел после неудачной установки явно помечен failed"
        );

        let stored = crate::services::install_service::load_result(&db, created.node.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.failed_step.as_deref(), Some("connect"));
    }

    #[tokio::test]
    async fn test_auto_install_failure_keeps_applied_steps() {
        let db = setup_db().await;
        let shell = ScriptedShell {
            fail_at: Some(2),
            ..Default::default()
        };

        let created = node_service::create_node(
            &db,
            &shell,
            &InstallConfig::default(),
            auto_request("http://203.0.113.5:8080"),
        )
        .await
        .unwrap();

        let result = created.install_result.unwrap();
        let statuses: Vec<StepStatus> = result.steps.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::Success, StepStatus::Success, StepStatus::Failed, StepStatus::Pending]
        );
        assert_eq!(result.last_completed_step.as_deref(), Some("download_agent"));
        assert_eq!(shell.calls.load(Ordering::SeqCst), 3, "После сбоя шаги не повторяются");
    }

    #[tokio::test]
    async fn test_auto_install_timeout_reports_last_completed_step() {
        let db = setup_db().await;
        let shell = ScriptedShell {
            delay: Some(Duration::from_millis(120)),
            ..Default::default()
        };
        let cfg = InstallConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        };

        let created = node_service::create_node(&db, &shell, &cfg, auto_request("http://203.0.113.5:8080"))
            .await
            .unwrap();

        let result = created.install_result.unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("timeout"));
        assert_eq!(result.failed_step.as_deref(), Some("download_agent"));
        assert_eq!(result.last_completed_step.as_deref(), Some("connect"));
    }

    #[tokio::test]
    async fn test_auto_install_rejects_localhost_panel_url() {
        let db = setup_db().await;
        let shell = ScriptedShell::default();

        for url in ["http://localhost:8080", "http://127.0.0.1:9000"] {
            let err = node_service::create_node(&db, &shell, &InstallConfig::default(), auto_request(url))
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Validation(_)));
        }
        assert_eq!(shell.calls.load(Ordering::SeqCst), 0);
        assert!(
            node_service::list_nodes(&db, &Default::default()).await.unwrap().is_empty(),
            "Узел не должен создаваться при невалидном panel_url"
        );
    }

    // ── Реконсилер ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_reconcile_marks_node_online_and_synced() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        let cfg = ReconcilerConfig {
            probe_enabled: false,
            ..Default::default()
        };

        health_service::record_heartbeat(
            &db,
            node.id,
            HeartbeatReport {
                applied_revision: node.config_revision,
                sync_error: None,
            },
        )
        .await
        .unwrap();
        let changed = health_service::reconcile_once(&db, &cfg, Utc::now()).await.unwrap();
        assert_eq!(changed, 1);

        let view = node_service::get_node(&db, node.id).await.unwrap();
        assert_eq!(view.status, NodeStatus::Online);
        assert_eq!(view.sync_status, SyncStatus::Synced);
        assert!(view.synced_at.is_some());

        // Через 10 минут без heartbeat узел offline
        health_service::reconcile_once(&db, &cfg, Utc::now() + ChronoDuration::minutes(10))
            .await
            .unwrap();
        let view = node_service::get_node(&db, node.id).await.unwrap();
        assert_eq!(view.status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_reconcile_write_skips_node_deleted_after_snapshot() {
        let db = setup_db().await;
        let gone = create_manual(&db, "gone", 0).await;
        let kept = create_manual(&db, "kept", 0).await;
        for n in [&gone, &kept] {
            health_service::record_heartbeat(
                &db,
                n.id,
                HeartbeatReport {
                    applied_revision: n.config_revision,
                    sync_error: None,
                },
            )
            .await
            .unwrap();
        }

        let snapshot = node_service::find_node(&db, gone.id).await.unwrap();
        node_service::delete_node(&db, gone.id).await.unwrap();
        let written = health_service::apply_evaluation(
            &db,
            &snapshot,
            NodeStatus::Online,
            SyncStatus::Synced,
            0,
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!written, "Запись по удалённому узлу пропускается без ошибки");

        // Проход по оставшимся узлам не прерывается
        let cfg = ReconcilerConfig {
            probe_enabled: false,
            ..Default::default()
        };
        assert_eq!(health_service::reconcile_once(&db, &cfg, Utc::now()).await.unwrap(), 1);
        let view = node_service::get_node(&db, kept.id).await.unwrap();
        assert_eq!(view.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_reconcile_write_does_not_overwrite_newer_revision() {
        let db = setup_db().await;
        let node = create_manual(&db, "hk-1", 0).await;
        health_service::record_heartbeat(
            &db,
            node.id,
            HeartbeatReport {
                applied_revision: node.config_revision,
                sync_error: None,
            },
        )
        .await
        .unwrap();

        // Снимок реконсилера: ревизии совпадают, узел выглядит synced
        let snapshot = node_service::find_node(&db, node.id).await.unwrap();
        assert_eq!(health_service::evaluate_sync(&snapshot), SyncStatus::Synced);

        // Администратор меняет порт до записи реконсилера
        node_service::update_node(
            &db,
            node.id,
            NodePatch {
                port: Some(20443),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let written = health_service::apply_evaluation(
            &db,
            &snapshot,
            NodeStatus::Online,
            SyncStatus::Synced,
            0,
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(!written);

        let view = node_service::get_node(&db, node.id).await.unwrap();
        assert_eq!(view.config_revision, node.config_revision + 1);
        assert_eq!(view.sync_status, SyncStatus::Pending, "Новая ревизия ещё не применена");
        assert!(view.synced_at.is_none());
    }

    // ── HTTP интеграционные тесты ─────────────────────────────────────────────

    mod integration {
        use super::*;
        use crate::api::middleware::create_admin_token;
        use axum::body::Body;
        use axum::http::{Request, StatusCode};
        use tower::ServiceExt;

        const JWT_SECRET: &str = "test-secret";

        async fn build_test_app() -> (axum::Router, DatabaseConnection) {
            build_test_app_with(None).await
        }

        async fn build_test_app_with(
            agent_binary: Option<std::path::PathBuf>,
        ) -> (axum::Router, DatabaseConnection) {
            let db = setup_db().await;
            let membership_lock = Arc::new(Mutex::new(()));
            let state = AppState {
                db: db.clone(),
                jwt_secret: JWT_SECRET.to_string(),
                admin_username: "admin".to_string(),
                admin_password_hash: hash_password("admin123"),
                rate_limiter: RateLimiter::new(100, Duration::from_secs(60)),
                shell: Arc::new(ScriptedShell::default()),
                install: InstallConfig::default(),
                agent_binary,
                reassigner: Reassigner::spawn(db.clone(), membership_lock.clone()),
                membership_lock,
            };
            (build_router(state), db)
        }

        fn admin_token() -> String {
            create_admin_token("admin", JWT_SECRET).unwrap()
        }

        async fn call(
            app: &axum::Router,
            method: &str,
            uri: &str,
            token: Option<&str>,
            body: Option<serde_json::Value>,
        ) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header("Authorization", format!("Bearer {token}"));
            }
            let request = match body {
                Some(json) => builder
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
            (status, json)
        }

        #[tokio::test]
        async fn test_health_check() {
            let (app, _db) = build_test_app().await;
            let (status, body) = call(&app, "GET", "/health", None, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["code"], 200);
            assert_eq!(body["data"]["database"], true);
        }

        #[tokio::test]
        async fn test_admin_routes_require_jwt() {
            let (app, _db) = build_test_app().await;
            let (status, body) = call(&app, "GET", "/api/admin/nodes", None, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["error"], "unauthorized");
            assert_eq!(body["code"], 401);
        }

        #[tokio::test]
        async fn test_login() {
            let (app, _db) = build_test_app().await;
            let (status, body) = call(
                &app,
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({ "username": "admin", "password": "admin123" })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(body["data"]["token"].as_str().is_some());

            let (status, _) = call(
                &app,
                "POST",
                "/api/auth/login",
                None,
                Some(serde_json::json!({ "username": "admin", "password": "nope" })),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn test_create_and_patch_node_over_http() {
            let (app, _db) = build_test_app().await;
            let token = admin_token();

            let (status, body) = call(
                &app,
                "POST",
                "/api/admin/nodes",
                Some(&token),
                Some(serde_json::json!({
                    "name": "hk-1",
                    "address": "1.2.3.4",
                    "port": 18443,
                    "weight": 5,
                    "max_users": 0
                })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["message"], "success");
            assert!(body["data"]["install_result"].is_null());
            let id = body["data"]["node"]["id"].as_i64().unwrap();

            let (status, body) = call(
                &app,
                "PUT",
                &format!("/api/admin/nodes/{id}"),
                Some(&token),
                Some(serde_json::json!({ "status": "online" })),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "validation_failed");

            let (status, body) = call(
                &app,
                "PUT",
                &format!("/api/admin/nodes/{id}/enabled"),
                Some(&token),
                Some(serde_json::json!({ "enabled": false })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["enabled"], false);

            let (status, body) = call(&app, "GET", "/api/admin/nodes/9999", Some(&token), None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "not_found");
        }

        #[tokio::test]
        async fn test_rotate_without_token_returns_not_found() {
            let (app, db) = build_test_app().await;
            let node = create_manual(&db, "hk-1", 0).await;

            let (status, body) = call(
                &app,
                "POST",
                &format!("/api/admin/nodes/{}/token/rotate", node.id),
                Some(&admin_token()),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "not_found");
        }

        #[tokio::test]
        async fn test_agent_heartbeat_and_token_rotation() {
            let (app, db) = build_test_app().await;
            let node = create_manual(&db, "hk-1", 0).await;
            let admin = admin_token();

            let (_, body) = call(
                &app,
                "POST",
                &format!("/api/admin/nodes/{}/token", node.id),
                Some(&admin),
                None,
            )
            .await;
            let node_token = body["data"]["token"].as_str().unwrap().to_string();

            let heartbeat = serde_json::json!({ "applied_revision": 1 });
            let (status, body) = call(
                &app,
                "POST",
                "/api/agent/heartbeat",
                Some(&node_token),
                Some(heartbeat.clone()),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["config_revision"], 1);

            let (status, _) = call(
                &app,
                "POST",
                &format!("/api/admin/nodes/{}/token/rotate", node.id),
                Some(&admin),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);

            let (status, body) = call(
                &app,
                "POST",
                "/api/agent/heartbeat",
                Some(&node_token),
                Some(heartbeat),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "Старый токен отклоняется");
            assert_eq!(body["error"], "unauthorized");

            let (status, body) = call(
                &app,
                "DELETE",
                &format!("/api/admin/nodes/{}/token", node.id),
                Some(&admin),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["already_revoked"], false);
        }

        #[tokio::test]
        async fn test_delete_node_over_http_cascades_groups() {
            let (app, db) = build_test_app().await;
            let node = create_manual(&db, "hk-1", 0).await;
            let admin = admin_token();

            let (_, body) = call(
                &app,
                "POST",
                "/api/admin/groups",
                Some(&admin),
                Some(serde_json::json!({ "name": "asia", "strategy": "geographic" })),
            )
            .await;
            let group_id = body["data"]["id"].as_i64().unwrap();
            assert_eq!(body["data"]["strategy"], "geographic");

            let (status, body) = call(
                &app,
                "POST",
                &format!("/api/admin/groups/{group_id}/nodes"),
                Some(&admin),
                Some(serde_json::json!({ "node_id": node.id })),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["data"]["total_nodes"], 1);

            let (status, _) = call(
                &app,
                "DELETE",
                &format!("/api/admin/nodes/{}", node.id),
                Some(&admin),
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);

            let (_, body) = call(
                &app,
                "GET",
                &format!("/api/admin/groups/{group_id}"),
                Some(&admin),
                None,
            )
            .await;
            assert_eq!(body["data"]["total_nodes"], 0);
            assert_eq!(body["data"]["healthy_nodes"], 0);
            assert_eq!(body["data"]["node_ids"], serde_json::json!([]));
        }

        #[tokio::test]
        async fn test_concurrent_add_member_and_delete_node() {
            use panel_entities::node_group_members::{self, Entity as MemberEntity};
            use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};

            let (app, db) = build_test_app().await;
            let admin = admin_token();
            let group = group_service::create_group(
                &db,
                CreateGroupRequest {
                    name: "race".into(),
                    description: String::new(),
                    region: String::new(),
                    strategy: GroupStrategy::RoundRobin,
                },
            )
            .await
            .unwrap();

            for i in 0..10 {
                let node = create_manual(&db, &format!("n-{i}"), 0).await;
                let add_uri = format!("/api/admin/groups/{}/nodes", group.id);
                let delete_uri = format!("/api/admin/nodes/{}", node.id);

                let ((add_status, add_body), (delete_status, _)) = tokio::join!(
                    call(
                        &app,
                        "POST",
                        &add_uri,
                        Some(&admin),
                        Some(serde_json::json!({ "node_id": node.id })),
                    ),
                    call(&app, "DELETE", &delete_uri, Some(&admin), None),
                );

                assert_eq!(delete_status, StatusCode::OK);
                assert!(
                    add_status == StatusCode::OK
                        || (add_status == StatusCode::NOT_FOUND && add_body["error"] == "not_found"),
                    "Добавление либо успешно, либо not_found, получено {add_status}: {add_body}"
                );

                let dangling = MemberEntity::find()
                    .filter(node_group_members::Column::NodeId.eq(node.id))
                    .all(&db)
                    .await
                    .unwrap();
                assert!(dangling.is_empty(), "Членство удалённого узла не должно остаться");
            }

            let view = group_service::get_group(&db, group.id).await.unwrap();
            assert_eq!(view.total_nodes, 0);
        }

        #[tokio::test]
        async fn test_agent_binary_download() {
            let path = std::env::temp_dir().join(format!("node-agent-test-{}.bin", std::process::id()));
            let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
            tokio::fs::write(&path, &payload).await.unwrap();

            let (app, db) = build_test_app_with(Some(path.clone())).await;
            let node = create_manual(&db, "hk-1", 0).await;
            let token = token_service::generate(&db, node.id).await.unwrap();

            let request = Request::builder()
                .uri("/api/agent/binary")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(bytes.as_ref(), payload.as_slice());

            // Без токена узла бинарник не отдаётся
            let request = Request::builder()
                .uri("/api/agent/binary")
                .body(Body::empty())
                .unwrap();
            let response = app.oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

            tokio::fs::remove_file(&path).await.ok();
        }

        #[tokio::test]
        async fn test_agent_binary_not_configured() {
            let (app, db) = build_test_app().await;
            let node = create_manual(&db, "hk-1", 0).await;
            let token = token_service::generate(&db, node.id).await.unwrap();

            let (status, body) = call(&app, "GET", "/api/agent/binary", Some(&token), None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["error"], "not_found");
        }
    }
}
