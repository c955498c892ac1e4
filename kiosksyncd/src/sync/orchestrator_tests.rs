use std::sync::{OnceLock, Weak};

use super::*;
use crate::sync::entry::{Operation, PRIORITY_OPTIONAL};
use crate::sync::queue_store::NewEntry;
use crate::sync::scheduler::BandwidthMode;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MB: u64 = 1024 * 1024;

async fn make_store() -> QueueStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = QueueStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        backoff: Backoff::new(Duration::ZERO, Duration::ZERO, false),
        ..OrchestratorConfig::default()
    }
}

fn make_orchestrator(
    server: &MockServer,
    store: &QueueStore,
    config: OrchestratorConfig,
) -> SyncOrchestrator {
    let backend = BackendClient::with_base_url(&server.uri(), "test-key").unwrap();
    SyncOrchestrator::new(store.clone(), backend, config)
}

fn unrestricted() -> SyncPolicy {
    SyncPolicy {
        bandwidth_mode: BandwidthMode::Unrestricted,
        ..SyncPolicy::default()
    }
}

async fn run(orchestrator: &SyncOrchestrator, policy: &SyncPolicy) -> SyncReport {
    match orchestrator
        .run_pass(policy, NetworkType::Wifi)
        .await
        .unwrap()
    {
        PassOutcome::Completed(report) => report,
        other => panic!("unexpected pass outcome: {other:?}"),
    }
}

async fn enqueue_verification(store: &QueueStore, contract: &str) -> i64 {
    store
        .enqueue(
            NewEntry::new(
                EntityKind::Verification,
                Operation::Insert,
                &json!({"contract_number": contract, "status": "verified"}),
            )
            .unwrap(),
        )
        .await
        .unwrap()
}

async fn enqueue_location(store: &QueueStore) -> i64 {
    store
        .enqueue(
            NewEntry::new(
                EntityKind::Location,
                Operation::Insert,
                &json!({"device_id": "tab-01", "latitude": 59.9, "longitude": 30.3}),
            )
            .unwrap(),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn verification_succeeds_after_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/verification-checks"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/verification-checks"))
        .and(header("x-sync-operation", "insert"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = enqueue_verification(&store, "1066026808001").await;
    let orchestrator = make_orchestrator(
        &server,
        &store,
        OrchestratorConfig {
            max_retries: 4,
            ..test_config()
        },
    );

    let report = run(&orchestrator, &unrestricted()).await;

    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Succeeded);
    assert_eq!(entry.attempt_count, 3);
    assert!(entry.last_error.is_none());
    assert!(entry.completed_at.is_some());
    assert_eq!(report.retried, 3);
    assert_eq!(report.succeeded, 1);
    assert_eq!(orchestrator.last_report(), Some(report));
}

#[tokio::test]
async fn retry_ceiling_marks_failed_until_reset() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());

    let report = run(&orchestrator, &unrestricted()).await;
    assert_eq!(report.failed, 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempt_count, 3);
    assert!(entry.last_error.as_deref().unwrap().contains("503"));

    let second = run(&orchestrator, &unrestricted()).await;
    assert_eq!(second.attempted, 0);

    assert_eq!(store.reset_failed().await.unwrap(), 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.attempt_count, 0);
}

#[tokio::test]
async fn retry_after_header_gates_next_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());
    let before = now_millis();

    let report = run(&orchestrator, &unrestricted()).await;

    assert_eq!(report.retried, 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.next_attempt_at.unwrap() >= before + 120_000);
}

#[tokio::test]
async fn malformed_payload_fails_without_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = make_store().await;
    let missing_field = store
        .enqueue(
            NewEntry::new(
                EntityKind::Location,
                Operation::Insert,
                &json!({"device_id": "tab-01", "latitude": 1.0}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let not_object = store
        .enqueue(
            NewEntry::new(
                EntityKind::table("visits").unwrap(),
                Operation::Insert,
                &json!([1, 2, 3]),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let orchestrator = make_orchestrator(&server, &store, test_config());

    let report = run(&orchestrator, &unrestricted()).await;

    assert_eq!(report.failed, 2);
    for id in [missing_field, not_object] {
        let entry = store.get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert_eq!(entry.attempt_count, 1);
    }
}

#[tokio::test]
async fn permanent_rejection_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(422).set_body_string("bad contract"))
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = enqueue_verification(&store, "42").await;
    let orchestrator = make_orchestrator(&server, &store, test_config());
    run(&orchestrator, &unrestricted()).await;

    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Failed);
    assert_eq!(entry.attempt_count, 1);
    assert!(entry.last_error.unwrap().contains("bad contract"));
}

#[tokio::test]
async fn auth_errors_keep_retry_budget_and_stop_the_pass() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());

    let report = run(&orchestrator, &unrestricted()).await;

    assert!(report.auth_required);
    assert_eq!(report.failed, 0);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert_eq!(entry.attempt_count, 0);
    assert!(entry.last_error.is_some());
}

#[tokio::test]
async fn records_post_to_their_routes_with_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/visits"))
        .and(header("x-sync-operation", "update"))
        .and(|req: &wiremock::Request| {
            req.headers
                .get("x-idempotency-key")
                .and_then(|value| value.to_str().ok())
                .is_some_and(|key| key.starts_with("table:visits:"))
        })
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let store = make_store().await;
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::table("visits").unwrap(),
                Operation::Update,
                &json!({"id": 7, "note": "checked"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let orchestrator = make_orchestrator(&server, &store, test_config());
    run(&orchestrator, &unrestricted()).await;

    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        EntryStatus::Succeeded
    );
}

#[tokio::test]
async fn cancelling_upload_mid_transfer_keeps_confirmed_progress() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/storage/v1/object/uploads/scan.bin"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("scan.bin");
    std::fs::write(&source, vec![7u8; (10 * MB) as usize]).unwrap();

    let store = make_store().await;
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::FileUpload,
                Operation::Upload,
                &FileUploadPayload {
                    local_path: source,
                    upload_url: "storage/v1/object/uploads/scan.bin".into(),
                    mime_type: "application/octet-stream".into(),
                    metadata: json!({}),
                },
            )
            .unwrap()
            .with_total_bytes((10 * MB) as i64),
        )
        .await
        .unwrap();

    let handle: Arc<OnceLock<Weak<SyncOrchestrator>>> = Arc::new(OnceLock::new());
    let observer: ProgressObserver = {
        let handle = handle.clone();
        Arc::new(move |entry_id, sent, _total| {
            if sent >= 3 * MB
                && let Some(orchestrator) = handle.get().and_then(Weak::upgrade)
            {
                orchestrator.request_cancel(entry_id);
            }
        })
    };
    let orchestrator = Arc::new(
        make_orchestrator(&server, &store, test_config()).with_progress_observer(observer),
    );
    let _ = handle.set(Arc::downgrade(&orchestrator));

    let report = run(&orchestrator, &unrestricted()).await;

    assert_eq!(report.cancelled, 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Cancelled);
    assert!(entry.progress_bytes <= (3 * MB) as i64);
    assert_eq!(entry.attempt_count, 0);
}

#[tokio::test]
async fn pausing_upload_mid_transfer_holds_it_without_an_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/storage/v1/object/uploads/photo.jpg"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let source = dir.path().join("photo.jpg");
    std::fs::write(&source, vec![3u8; (4 * MB) as usize]).unwrap();

    let store = make_store().await;
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::FileUpload,
                Operation::Upload,
                &FileUploadPayload {
                    local_path: source,
                    upload_url: "storage/v1/object/uploads/photo.jpg".into(),
                    mime_type: "image/jpeg".into(),
                    metadata: json!({}),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();

    let handle: Arc<OnceLock<Weak<SyncOrchestrator>>> = Arc::new(OnceLock::new());
    let observer: ProgressObserver = {
        let handle = handle.clone();
        Arc::new(move |entry_id, sent, _total| {
            if sent >= MB
                && let Some(orchestrator) = handle.get().and_then(Weak::upgrade)
            {
                orchestrator.request_pause(entry_id);
            }
        })
    };
    let orchestrator = Arc::new(
        make_orchestrator(&server, &store, test_config()).with_progress_observer(observer),
    );
    let _ = handle.set(Arc::downgrade(&orchestrator));

    let report = run(&orchestrator, &unrestricted()).await;

    assert_eq!(report.released, 1);
    assert_eq!(report.cancelled, 0);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Pending);
    assert!(entry.paused);
    assert_eq!(entry.attempt_count, 0);

    assert!(store.set_paused(id, false).await.unwrap());
    let resumed = make_orchestrator(&server, &store, test_config());
    let report = run(&resumed, &unrestricted()).await;
    assert_eq!(report.succeeded, 1);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Succeeded);
    assert_eq!(entry.progress_bytes, (4 * MB) as i64);
}

#[tokio::test]
async fn concurrent_orchestrators_on_one_database_send_an_entry_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/device-location"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(800)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let daemon_store = QueueStore::open(&db_path).await.unwrap();
    let id = enqueue_location(&daemon_store).await;
    let cli_store = QueueStore::open(&db_path).await.unwrap();

    let daemon = Arc::new(make_orchestrator(&server, &daemon_store, test_config()));
    let cli = make_orchestrator(&server, &cli_store, test_config());

    let first = {
        let daemon = daemon.clone();
        tokio::spawn(async move { run(&daemon, &unrestricted()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = run(&cli, &unrestricted()).await;
    let first = first.await.unwrap();

    assert_eq!(second.recovered, 0);
    assert_eq!(second.attempted, 0);
    assert_eq!(first.succeeded, 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    assert_eq!(
        cli_store.get(id).await.unwrap().unwrap().status,
        EntryStatus::Succeeded
    );
}

#[tokio::test]
async fn interrupted_download_resumes_to_identical_file() {
    let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/catalog.bin"))
        .and(header("range", "bytes=400-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 400-999/1000")
                .set_body_bytes(content[400..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let dest = dir.path().join("catalog.bin");
    std::fs::write(super::super::transfer::partial_path(&dest), &content[..400]).unwrap();

    let store = make_store().await;
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::FileDownload,
                Operation::Download,
                &FileDownloadPayload {
                    url: "files/catalog.bin".into(),
                    dest_path: dest.clone(),
                    name: "catalog.bin".into(),
                    expected_md5: Some(format!("{:x}", md5::compute(&content))),
                },
            )
            .unwrap(),
        )
        .await
        .unwrap();
    // State left behind by an earlier attempt that confirmed 400 bytes.
    store.mark_in_progress(id, now_millis()).await.unwrap();
    store.update_progress(id, 400, Some(1000)).await.unwrap();
    store.release(id, Some("connection reset")).await.unwrap();

    let orchestrator = make_orchestrator(
        &server,
        &store,
        OrchestratorConfig {
            checkpoint_bytes: 128,
            ..test_config()
        },
    );
    run(&orchestrator, &unrestricted()).await;

    assert_eq!(std::fs::read(&dest).unwrap(), content);
    let entry = store.get(id).await.unwrap().unwrap();
    assert_eq!(entry.status, EntryStatus::Succeeded);
    assert_eq!(entry.progress_bytes, 1000);
    assert_eq!(entry.total_bytes, Some(1000));
}

#[tokio::test]
async fn overlapping_triggers_process_each_entry_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_millis(100)))
        .expect(5)
        .mount(&server)
        .await;

    let store = make_store().await;
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(enqueue_location(&store).await);
    }
    let orchestrator = Arc::new(make_orchestrator(&server, &store, test_config()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .run_pass(&unrestricted(), NetworkType::Wifi)
                .await
                .unwrap()
        }));
    }
    let mut succeeded = 0;
    let mut coalesced = 0;
    for handle in handles {
        match handle.await.unwrap() {
            PassOutcome::Completed(report) => succeeded += report.succeeded,
            PassOutcome::Coalesced => coalesced += 1,
            PassOutcome::Stopped => panic!("orchestrator was not shut down"),
        }
    }

    assert_eq!(succeeded, 5);
    assert!(coalesced > 0);
    for id in ids {
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            EntryStatus::Succeeded
        );
    }
    assert!(!orchestrator.is_running());
}

#[tokio::test]
async fn pass_purges_entries_past_retention() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let store = make_store().await;
    let old = enqueue_location(&store).await;
    let fresh = enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());
    let first = run(&orchestrator, &unrestricted()).await;
    assert_eq!(first.succeeded, 2);
    assert_eq!(first.purged, 0);

    let eight_days = 8 * 24 * 60 * 60 * 1000;
    sqlx::query("UPDATE queue_entries SET completed_at = completed_at - ?1 WHERE id = ?2")
        .bind(eight_days)
        .bind(old)
        .execute(store.pool())
        .await
        .unwrap();

    let second = run(&orchestrator, &unrestricted()).await;
    assert_eq!(second.purged, 1);
    assert!(store.get(old).await.unwrap().is_none());
    assert!(store.get(fresh).await.unwrap().is_some());
}

#[tokio::test]
async fn constrained_policy_defers_optional_entries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/device-location"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/device-status"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = make_store().await;
    let status = store
        .enqueue(
            NewEntry::new(
                EntityKind::DeviceStatus,
                Operation::Insert,
                &json!({"device_id": "tab-01", "battery_percent": 80}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let location = enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());
    let policy = SyncPolicy {
        bandwidth_mode: BandwidthMode::ConstrainedOnly,
        ..SyncPolicy::default()
    };

    let report = run(&orchestrator, &policy).await;

    assert_eq!(report.deferred, 1);
    assert_eq!(
        store.get(location).await.unwrap().unwrap().status,
        EntryStatus::Succeeded
    );
    let deferred = store.get(status).await.unwrap().unwrap();
    assert_eq!(deferred.status, EntryStatus::Pending);
    assert_eq!(deferred.priority, PRIORITY_OPTIONAL);
    assert_eq!(deferred.attempt_count, 0);
}

#[tokio::test]
async fn shut_down_orchestrator_runs_nothing() {
    let server = MockServer::start().await;
    let store = make_store().await;
    enqueue_location(&store).await;
    let orchestrator = make_orchestrator(&server, &store, test_config());
    orchestrator.shutdown();

    let outcome = orchestrator
        .run_pass(&unrestricted(), NetworkType::Wifi)
        .await
        .unwrap();
    assert_eq!(outcome, PassOutcome::Stopped);
    assert_eq!(store.count_pending().await.unwrap(), 1);
}

#[test]
fn dispositions_follow_error_taxonomy() {
    assert_eq!(
        SyncError::Validation("x".into()).disposition(),
        Disposition::Fatal
    );
    assert_eq!(
        SyncError::Backend(BackendError::MissingCredential).disposition(),
        Disposition::Auth
    );
    assert_eq!(
        SyncError::Transfer(TransferError::TimedOut).disposition(),
        Disposition::Retry
    );
    assert_eq!(SyncError::ClaimLost.disposition(), Disposition::Cancelled);
    assert_eq!(
        SyncError::Transfer(TransferError::Cancelled).disposition(),
        Disposition::Cancelled
    );
    assert_eq!(
        SyncError::Transfer(TransferError::MissingSource("/x".into())).disposition(),
        Disposition::Fatal
    );
}
