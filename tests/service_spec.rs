use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use release_registry::audit::AuditSink;
use release_registry::collaborators::*;
use release_registry::config::ReleaseConfig;
use release_registry::db::Database;
use release_registry::error::ReleaseError;
use release_registry::models::*;
use release_registry::pipeline::{
    Precondition, ReleaseAction, StateMachine, TransitionRule, TransitionTable,
};
use release_registry::registry::{MemoryRegistryStore, RegistryStore, RegistrySync};
use release_registry::service::{Collaborators, ReleaseService};
use uuid::Uuid;

use ReleaseAction::*;

struct Harness {
    service: ReleaseService,
    db: Database,
    artifacts: Arc<MemoryArtifactStore>,
}

fn collaborators(artifacts: Arc<dyn ArtifactStore>) -> Collaborators {
    Collaborators {
        artifacts,
        permissions: Arc::new(AllowAll),
        notifier: Arc::new(LogNotifier),
    }
}

fn build(
    store: Arc<dyn RegistryStore>,
    config: ReleaseConfig,
    customize: impl FnOnce(&mut Collaborators),
) -> Harness {
    build_with_machine(StateMachine::standard(), store, config, customize)
}

fn build_with_machine(
    machine: StateMachine,
    store: Arc<dyn RegistryStore>,
    config: ReleaseConfig,
    customize: impl FnOnce(&mut Collaborators),
) -> Harness {
    let db = Database::open_memory().expect("Failed to create database");
    db.migrate().expect("Failed to migrate");

    let registry = Arc::new(RegistrySync::new(db.clone(), store, &config));
    let (audit, _worker) = AuditSink::spawn(db.clone(), config.audit_retention);
    let artifacts = Arc::new(MemoryArtifactStore::new());

    let mut parts = collaborators(artifacts.clone());
    customize(&mut parts);

    let service = ReleaseService::new(
        db.clone(),
        machine,
        registry,
        audit,
        parts,
        &config,
    );
    Harness {
        service,
        db,
        artifacts,
    }
}

fn setup() -> Harness {
    build(
        Arc::new(MemoryRegistryStore::new()),
        ReleaseConfig::default(),
        |_| {},
    )
}

fn attested() -> SelfChecklist {
    SelfChecklist {
        assets_licensed: true,
        no_external_tracking: true,
        runs_offline: true,
        content_age_appropriate: true,
        tested_on_target_devices: true,
    }
}

fn create_game(h: &Harness, slug: &str) -> Game {
    h.service
        .create_game(
            CreateGameInput {
                slug: slug.to_string(),
                title: format!("Title of {}", slug),
                owner_id: "studio-7".to_string(),
                runtime: None,
                capabilities: vec![],
                icon_url: None,
                min_client_version: None,
                rollout_percentage: Some(100),
            },
            "dev",
        )
        .expect("Failed to create game")
}

fn create_version(h: &Harness, game: &Game, number: &str) -> Version {
    h.service
        .create_version(
            game.id,
            CreateVersionInput {
                version: number.to_string(),
                storage_path: format!("{}/{}", game.slug, number),
                release_notes: None,
                self_checklist: Some(attested()),
            },
            "dev",
        )
        .expect("Failed to create version")
}

async fn advance(h: &Harness, version: &Version, actions: &[ReleaseAction]) -> Version {
    let mut current = version.clone();
    for action in actions {
        current = h
            .service
            .transition(version.id, *action, "reviewer")
            .await
            .unwrap_or_else(|e| panic!("{} failed: {}", action, e));
    }
    current
}

async fn published(h: &Harness, game: &Game, number: &str) -> Version {
    let version = create_version(h, game, number);
    h.artifacts.insert(version.storage_path.clone());
    advance(h, &version, &[Submit, StartReview, Pass, Approve, Publish]).await
}

mod transitions {
    use super::*;

    #[tokio::test]
    async fn rejects_every_action_outside_the_table_without_touching_status() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");

        for action in ReleaseAction::ALL {
            if action == Submit {
                continue;
            }
            match h.service.transition(version.id, action, "reviewer").await {
                Err(ReleaseError::InvalidTransition { status, valid, .. }) => {
                    assert_eq!(status, VersionStatus::Draft);
                    assert_eq!(valid, vec![Submit]);
                }
                other => panic!("{} from draft: expected InvalidTransition, got {:?}", action, other),
            }
        }

        let stored = h.service.get_version(version.id).unwrap();
        assert_eq!(stored.status, VersionStatus::Draft);
    }

    #[tokio::test]
    async fn incomplete_checklist_blocks_submit_until_attested() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = h
            .service
            .create_version(
                game.id,
                CreateVersionInput {
                    version: "1.0.0".to_string(),
                    storage_path: "space-miner/1.0.0".to_string(),
                    release_notes: None,
                    self_checklist: Some(SelfChecklist {
                        assets_licensed: true,
                        ..Default::default()
                    }),
                },
                "dev",
            )
            .unwrap();

        let err = h.service.transition(version.id, Submit, "dev").await.unwrap_err();
        assert!(matches!(err, ReleaseError::PreconditionFailed(_)));
        assert_eq!(
            h.service.get_version(version.id).unwrap().status,
            VersionStatus::Draft
        );

        h.service
            .update_version(
                version.id,
                UpdateVersionInput {
                    self_checklist: Some(attested()),
                    ..Default::default()
                },
                "dev",
            )
            .unwrap();

        let submitted = h.service.transition(version.id, Submit, "dev").await.unwrap();
        assert_eq!(submitted.status, VersionStatus::Uploaded);
        assert!(submitted.submitted_at.is_some());
    }

    #[tokio::test]
    async fn publish_with_artifact_goes_live_and_reaches_the_registry() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        h.artifacts.insert("space-miner/1.0.0");

        let approved = advance(&h, &version, &[Submit, StartReview, Pass, Approve]).await;
        assert_eq!(approved.status, VersionStatus::Approved);

        let live = h.service.transition(version.id, Publish, "lead").await.unwrap();
        assert_eq!(live.status, VersionStatus::Published);

        let game = h.service.get_game(game.id).unwrap();
        assert_eq!(game.live_version_id, Some(version.id));

        let snapshot = h.service.registry_snapshot();
        let entry = snapshot.entry("space-miner").expect("entry missing");
        assert_eq!(entry.version, "1.0.0");
    }

    #[tokio::test]
    async fn publish_without_artifact_is_a_precondition_failure() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        advance(&h, &version, &[Submit, StartReview, Pass, Approve]).await;

        let err = h.service.transition(version.id, Publish, "lead").await.unwrap_err();
        assert!(matches!(err, ReleaseError::PreconditionFailed(_)));
        assert_eq!(
            h.service.get_version(version.id).unwrap().status,
            VersionStatus::Approved
        );
        assert!(h.service.get_game(game.id).unwrap().live_version_id.is_none());
    }

    struct HangingStore;

    #[async_trait]
    impl ArtifactStore for HangingStore {
        async fn exists(&self, _storage_path: &str) -> anyhow::Result<bool> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn slow_artifact_store_times_out_as_precondition_failure() {
        let config = ReleaseConfig {
            artifact_timeout: Duration::from_millis(50),
            ..ReleaseConfig::default()
        };
        let h = build(Arc::new(MemoryRegistryStore::new()), config, |parts| {
            parts.artifacts = Arc::new(HangingStore);
        });
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        advance(&h, &version, &[Submit, StartReview, Pass, Approve]).await;

        let err = h.service.transition(version.id, Publish, "lead").await.unwrap_err();
        assert!(matches!(err, ReleaseError::PreconditionFailed(msg) if msg.contains("timed out")));
    }

    #[tokio::test]
    async fn valid_actions_follow_the_new_status() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");

        let passed = advance(&h, &version, &[Submit, StartReview, Pass]).await;
        assert_eq!(h.service.valid_actions(passed.status), vec![Approve, Reject]);
        assert!(h.service.can_transition(passed.status, Reject));
        assert!(!h.service.can_transition(passed.status, Publish));
    }

    #[tokio::test]
    async fn retrying_a_completed_transition_is_invalid() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        advance(&h, &version, &[Submit]).await;

        let err = h.service.transition(version.id, Submit, "dev").await.unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::InvalidTransition {
                status: VersionStatus::Uploaded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn rejected_version_can_be_fixed_and_resubmitted() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");

        let failed = advance(&h, &version, &[Submit, StartReview, Pass, Reject]).await;
        assert_eq!(failed.status, VersionStatus::QcFailed);

        h.service
            .update_version(
                version.id,
                UpdateVersionInput {
                    release_notes: Some("Fixed the crash on level 3".to_string()),
                    ..Default::default()
                },
                "dev",
            )
            .unwrap();

        let again = advance(&h, &version, &[Submit]).await;
        assert_eq!(again.status, VersionStatus::Uploaded);
    }

    /// Holds every artifact check until released, so a second transition can
    /// land while the first one is waiting.
    #[derive(Default)]
    struct GatedStore {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ArtifactStore for GatedStore {
        async fn exists(&self, _storage_path: &str) -> anyhow::Result<bool> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(true)
        }
    }

    fn gated() -> (Harness, Arc<GatedStore>) {
        gated_with_machine(StateMachine::standard())
    }

    fn gated_with_machine(machine: StateMachine) -> (Harness, Arc<GatedStore>) {
        let gate = Arc::new(GatedStore::default());
        let store = gate.clone();
        let h = build_with_machine(
            machine,
            Arc::new(MemoryRegistryStore::new()),
            ReleaseConfig::default(),
            |parts| parts.artifacts = store,
        );
        (h, gate)
    }

    #[tokio::test]
    async fn publish_overtaken_by_reject_reports_invalid_transition() {
        let (h, gate) = gated();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        advance(&h, &version, &[Submit, StartReview, Pass, Approve]).await;

        let (publish, reject) = tokio::join!(
            h.service.transition(version.id, Publish, "lead"),
            async {
                gate.entered.notified().await;
                let rejected = h.service.transition(version.id, Reject, "reviewer").await;
                gate.release.notify_one();
                rejected
            }
        );

        assert_eq!(reject.unwrap().status, VersionStatus::QcFailed);
        match publish {
            Err(ReleaseError::InvalidTransition { status, valid, .. }) => {
                assert_eq!(status, VersionStatus::QcFailed);
                assert_eq!(valid, vec![Submit]);
            }
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
        assert!(h.service.get_game(game.id).unwrap().live_version_id.is_none());
    }

    #[tokio::test]
    async fn publish_overtaken_by_a_still_publishable_change_reports_conflict() {
        use VersionStatus::{Approved, Published, QcPassed};

        let artifact_present = Precondition::new("artifact_exists", |facts| {
            if facts.artifact_present == Some(true) {
                Ok(())
            } else {
                Err("artifact missing".to_string())
            }
        })
        .probing_artifact();
        let machine = StateMachine::new(
            TransitionTable::new()
                .with_rule(TransitionRule::new(Approve, &[QcPassed], Approved))
                .with_rule(
                    TransitionRule::new(Publish, &[QcPassed, Approved], Published)
                        .guarded(artifact_present),
                ),
        );

        let (h, gate) = gated_with_machine(machine);
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        h.db.update_version_status(version.id, VersionStatus::Draft, QcPassed)
            .unwrap()
            .expect("Write should apply");

        let (publish, approve) = tokio::join!(
            h.service.transition(version.id, Publish, "lead"),
            async {
                gate.entered.notified().await;
                let approved = h.service.transition(version.id, Approve, "reviewer").await;
                gate.release.notify_one();
                approved
            }
        );

        assert_eq!(approve.unwrap().status, Approved);
        assert!(matches!(publish, Err(ReleaseError::Conflict(_))));
        assert_eq!(h.service.get_version(version.id).unwrap().status, Approved);
    }

    #[tokio::test]
    async fn unknown_version_is_not_found() {
        let h = setup();
        let err = h
            .service
            .transition(Uuid::new_v4(), Submit, "dev")
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotFound { kind: "version", .. }));
    }
}

mod live_pointer {
    use super::*;

    #[tokio::test]
    async fn archive_takes_the_game_offline_and_republish_restores_it() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;

        advance(&h, &version, &[Archive]).await;
        assert!(h.service.get_game(game.id).unwrap().live_version_id.is_none());
        assert!(h.service.registry_snapshot().entry("space-miner").is_none());

        advance(&h, &version, &[Republish]).await;
        assert_eq!(
            h.service.get_game(game.id).unwrap().live_version_id,
            Some(version.id)
        );
        assert!(h.service.registry_snapshot().entry("space-miner").is_some());
    }

    #[tokio::test]
    async fn republish_is_refused_while_the_game_is_disabled() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;
        advance(&h, &version, &[Archive]).await;
        h.service.set_disabled(game.id, true, "ops").await.unwrap();

        let err = h
            .service
            .transition(version.id, Republish, "lead")
            .await
            .unwrap_err();
        assert!(matches!(err, ReleaseError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn activate_rolls_back_to_an_earlier_published_version() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let first = published(&h, &game, "1.0.0").await;
        let second = published(&h, &game, "1.1.0").await;
        assert_eq!(
            h.service.get_game(game.id).unwrap().live_version_id,
            Some(second.id)
        );

        let game = h.service.activate(game.id, first.id, "lead").await.unwrap();
        assert_eq!(game.live_version_id, Some(first.id));
        assert_eq!(
            h.service.registry_snapshot().entry("space-miner").unwrap().version,
            "1.0.0"
        );
    }

    #[tokio::test]
    async fn activate_refuses_unpublished_versions() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let draft = create_version(&h, &game, "1.0.0");

        let err = h.service.activate(game.id, draft.id, "lead").await.unwrap_err();
        assert!(matches!(err, ReleaseError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn reset_clears_the_live_version() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;

        let game = h.service.reset(game.id, "ops").await.unwrap();
        assert!(game.live_version_id.is_none());
        assert!(h.service.registry_snapshot().entries.is_empty());
        assert_eq!(
            h.service.get_version(version.id).unwrap().status,
            VersionStatus::Published
        );
    }

    #[tokio::test]
    async fn deleting_the_live_version_takes_the_game_offline() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;

        h.service.delete_version(version.id, "lead").await.unwrap();
        assert!(h.service.get_game(game.id).unwrap().live_version_id.is_none());
        assert!(h.service.registry_snapshot().entries.is_empty());
        assert!(matches!(
            h.service.get_version(version.id),
            Err(ReleaseError::NotFound { .. })
        ));
    }
}

mod registry {
    use super::*;

    #[tokio::test]
    async fn disabling_hides_the_game_without_changing_version_status() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;
        assert_eq!(h.service.registry_snapshot().entries.len(), 1);

        h.service.set_disabled(game.id, true, "ops").await.unwrap();
        assert!(h.service.registry_snapshot().entries.is_empty());
        assert_eq!(
            h.db.get_version(version.id).unwrap().unwrap().status,
            VersionStatus::Published
        );

        h.service.set_disabled(game.id, false, "ops").await.unwrap();
        assert_eq!(h.service.registry_snapshot().entries.len(), 1);
    }

    #[tokio::test]
    async fn rollout_zero_hides_and_hundred_shows_for_every_consumer() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        published(&h, &game, "1.0.0").await;

        h.service.update_rollout(game.id, 0, "ops").unwrap();
        for n in 0..200 {
            assert!(h.service.registry_for_consumer(&format!("player-{}", n)).is_empty());
        }

        h.service.update_rollout(game.id, 100, "ops").unwrap();
        for n in 0..200 {
            assert_eq!(h.service.registry_for_consumer(&format!("player-{}", n)).len(), 1);
        }
    }

    #[tokio::test]
    async fn rollout_above_hundred_is_rejected() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let err = h.service.update_rollout(game.id, 101, "ops").unwrap_err();
        assert!(matches!(err, ReleaseError::Validation(_)));
    }

    #[tokio::test]
    async fn deleting_a_game_removes_its_entry() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        published(&h, &game, "1.0.0").await;
        let other = create_game(&h, "tiny-golf");
        published(&h, &other, "0.3.0").await;

        h.service.delete_game(game.id, "ops").unwrap();
        let snapshot = h.service.registry_snapshot();
        assert!(snapshot.entry("space-miner").is_none());
        assert!(snapshot.entry("tiny-golf").is_some());
    }

    #[tokio::test]
    async fn renaming_a_live_game_refreshes_its_entry() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        published(&h, &game, "1.0.0").await;

        h.service
            .update_game(
                game.id,
                UpdateGameInput {
                    title: Some("Space Miner Deluxe".to_string()),
                    ..Default::default()
                },
                "dev",
            )
            .unwrap();

        assert_eq!(
            h.service.registry_snapshot().entry("space-miner").unwrap().title,
            "Space Miner Deluxe"
        );
    }

    #[tokio::test]
    async fn rollout_change_matches_what_a_full_sync_projects() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        published(&h, &game, "1.0.0").await;

        let updated = h.service.update_rollout(game.id, 30, "ops").unwrap();
        let entry = h
            .service
            .registry_snapshot()
            .entry("space-miner")
            .unwrap()
            .clone();
        assert_eq!(entry.rollout_percentage, 30);
        assert_eq!(entry.updated_at, updated.updated_at);

        let synced = h.service.sync_registry().await.unwrap();
        assert_eq!(synced.entry("space-miner"), Some(&entry));
    }

    struct BrokenStore;

    impl RegistryStore for BrokenStore {
        fn load(&self) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        fn replace(&self, _body: &str) -> anyhow::Result<()> {
            anyhow::bail!("bucket unreachable")
        }
    }

    #[tokio::test]
    async fn sync_failure_does_not_fail_the_transition() {
        let h = build(Arc::new(BrokenStore), ReleaseConfig::default(), |_| {});
        let game = create_game(&h, "space-miner");
        let version = published(&h, &game, "1.0.0").await;

        assert_eq!(version.status, VersionStatus::Published);
        assert!(matches!(
            h.service.sync_registry().await,
            Err(ReleaseError::StorageUnavailable(_))
        ));
    }
}

mod collaborators {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn actor_without_grant_is_forbidden() {
        let h = build(
            Arc::new(MemoryRegistryStore::new()),
            ReleaseConfig::default(),
            |parts| {
                parts.permissions = Arc::new(GrantTable::new(HashMap::from([
                    ("dev".to_string(), vec!["*".to_string()]),
                    ("qa".to_string(), vec!["release:start_review".to_string()]),
                ])));
            },
        );
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        h.service.transition(version.id, Submit, "dev").await.unwrap();

        let err = h.service.transition(version.id, Pass, "qa").await.unwrap_err();
        assert!(matches!(
            err,
            ReleaseError::Forbidden { ref permission, .. } if permission == "release:pass"
        ));

        let reviewing = h.service.transition(version.id, StartReview, "qa").await.unwrap();
        assert_eq!(reviewing.status, VersionStatus::QcProcessing);
    }

    struct FailingNotifier;

    #[async_trait]
    impl NotificationService for FailingNotifier {
        async fn notify(&self, _owner_id: &str, _event: &ReleaseNotification) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_the_transition() {
        let h = build(
            Arc::new(MemoryRegistryStore::new()),
            ReleaseConfig::default(),
            |parts| parts.notifier = Arc::new(FailingNotifier),
        );
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");

        let submitted = h.service.transition(version.id, Submit, "dev").await.unwrap();
        assert_eq!(submitted.status, VersionStatus::Uploaded);
    }
}

mod audit {
    use super::*;

    #[tokio::test]
    async fn accepted_transitions_are_audited_newest_first() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        let version = create_version(&h, &game, "1.0.0");
        advance(&h, &version, &[Submit, StartReview]).await;
        let _ = h.service.transition(version.id, Publish, "reviewer").await;
        h.service.audit().flush().await;

        let entries = h
            .service
            .audit_log(&AuditQuery {
                target_id: Some(version.id),
                ..Default::default()
            })
            .unwrap();

        let actions: Vec<_> = entries.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["start_review", "submit", "create_version"]);
        assert_eq!(entries[0].before_status.as_deref(), Some("uploaded"));
        assert_eq!(entries[0].after_status.as_deref(), Some("qc_processing"));
    }

    #[tokio::test]
    async fn audit_log_filters_by_actor() {
        let h = setup();
        let game = create_game(&h, "space-miner");
        h.service.set_disabled(game.id, true, "ops").await.unwrap();
        h.service.audit().flush().await;

        let by_ops = h
            .service
            .audit_log(&AuditQuery {
                actor_id: Some("ops".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_ops.len(), 1);
        assert_eq!(by_ops[0].action, "disable");
        assert_eq!(by_ops[0].target_id, game.id);
    }
}
