use super::*;
use crate::sync::entry::{EntityKind, Operation};
use crate::sync::queue_store::NewEntry;
use serde_json::json;
use std::collections::HashMap;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_from(vars: &[(&str, &str)]) -> anyhow::Result<DaemonConfig> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    DaemonConfig::from_lookup(|name| vars.get(name).cloned())
}

#[test]
fn backend_url_is_required() {
    let err = config_from(&[("KIOSK_DB_PATH", "/tmp/q.db")]).unwrap_err();
    assert!(err.to_string().contains("KIOSK_BACKEND_URL"));
}

#[test]
fn reads_defaults() {
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
    ])
    .unwrap();
    assert_eq!(config.device_id, "unknown-device");
    assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
    assert_eq!(config.sync_interval, Duration::from_secs(15 * 60));
    assert_eq!(config.bandwidth_mode, BandwidthMode::Auto);
    assert_eq!(config.network, NetworkType::Unknown);
    assert_eq!(config.worker_count, 2);
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.backoff_base, Duration::from_millis(5_000));
    assert_eq!(config.backoff_max, Duration::from_secs(900));
    assert_eq!(config.retention, Duration::from_secs(7 * DAY_SECS));
    assert_eq!(config.audit_retention, Duration::from_secs(30 * DAY_SECS));
    assert_eq!(config.history_retention, Duration::from_secs(30 * DAY_SECS));
    assert!(config.cert_pins.is_empty());
    assert!(config.kiosk_locked);
    assert_eq!(config.routes, RecordRoutes::default());
    let transfer = config.transfer_config();
    assert_eq!(transfer.upload_concurrency, 2);
    assert_eq!(transfer.download_concurrency, 2);
}

#[test]
fn reads_overrides() {
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
        ("KIOSK_DEVICE_ID", "tab-07"),
        ("KIOSK_SYNC_INTERVAL_MINUTES", "5"),
        ("KIOSK_BANDWIDTH_MODE", "wifi_only"),
        ("KIOSK_NETWORK_TYPE", "cellular"),
        ("KIOSK_SYNC_WORKERS", "16"),
        ("KIOSK_MAX_RETRIES", "6"),
        ("KIOSK_CALL_TIMEOUT_SECS", "10"),
        ("KIOSK_CONNECT_TIMEOUT_SECS", "5"),
        ("KIOSK_LOCKED", "no"),
        ("KIOSK_ROUTE_VERIFICATION", "functions/v1/checks"),
        ("KIOSK_ROUTE_TABLE_PREFIX", "api/"),
    ])
    .unwrap();
    assert_eq!(config.device_id, "tab-07");
    assert_eq!(config.sync_interval, Duration::from_secs(300));
    assert_eq!(config.bandwidth_mode, BandwidthMode::WifiOnly);
    assert_eq!(config.network, NetworkType::Cellular);
    assert_eq!(config.worker_count, 4);
    assert!(!config.kiosk_locked);
    assert_eq!(config.routes.verification, "functions/v1/checks");
    assert_eq!(config.routes.table_prefix, "api/");
    assert_eq!(config.routes.location, RecordRoutes::default().location);

    let orchestrator = config.orchestrator_config();
    assert_eq!(orchestrator.max_retries, 6);
    assert_eq!(orchestrator.attempt_timeout, Duration::from_secs(15));
    assert_eq!(config.policy().bandwidth_mode, BandwidthMode::WifiOnly);

    let backend = config.backend_config("key".to_string());
    assert_eq!(backend.call_timeout, Duration::from_secs(10));
    assert_eq!(backend.base_url, "https://api.example.test");
}

#[test]
fn reads_transfer_concurrency() {
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
        ("KIOSK_UPLOAD_CONCURRENCY", "1"),
        ("KIOSK_DOWNLOAD_CONCURRENCY", "6"),
    ])
    .unwrap();
    let transfer = config.transfer_config();
    assert_eq!(transfer.upload_concurrency, 1);
    assert_eq!(transfer.download_concurrency, 6);

    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
        ("KIOSK_UPLOAD_CONCURRENCY", "0"),
    ])
    .unwrap();
    assert_eq!(config.upload_concurrency, 2);
}

#[test]
fn huge_durations_saturate_instead_of_overflowing() {
    let max = u64::MAX.to_string();
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
        ("KIOSK_SYNC_INTERVAL_MINUTES", max.as_str()),
        ("KIOSK_RETENTION_DAYS", max.as_str()),
        ("KIOSK_AUDIT_RETENTION_DAYS", max.as_str()),
        ("KIOSK_CALL_TIMEOUT_SECS", max.as_str()),
        ("KIOSK_CONNECT_TIMEOUT_SECS", max.as_str()),
    ])
    .unwrap();
    assert_eq!(config.sync_interval, Duration::from_secs(u64::MAX));
    assert_eq!(config.retention, Duration::from_secs(u64::MAX));
    assert_eq!(config.audit_retention, Duration::from_secs(u64::MAX));

    let orchestrator = config.orchestrator_config();
    assert_eq!(orchestrator.attempt_timeout, Duration::MAX);
    assert_eq!(orchestrator.claim_lease(), Duration::MAX);
}

#[test]
fn rejects_unknown_modes_and_bad_pins() {
    let base = [
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
    ];
    let mut vars = base.to_vec();
    vars.push(("KIOSK_BANDWIDTH_MODE", "turbo"));
    assert!(config_from(&vars).is_err());

    let mut vars = base.to_vec();
    vars.push(("KIOSK_CERT_PINS", "md5/abc"));
    assert!(config_from(&vars).is_err());
}

#[test]
fn expands_tilde_in_db_path() {
    let home = PathBuf::from("/tmp/home-kiosk");
    assert_eq!(
        expand_with_home("~/sync/queue.db", Some(&home)),
        PathBuf::from("/tmp/home-kiosk/sync/queue.db")
    );
    assert_eq!(expand_with_home("~", Some(&home)), home);
    assert_eq!(
        expand_with_home("~/queue.db", None),
        PathBuf::from("~/queue.db")
    );
}

#[test]
fn reads_numbers_and_flags_or_default() {
    assert_eq!(read_u64_env(None, 42), 42);
    assert_eq!(read_u64_env(Some("0".into()), 42), 42);
    assert_eq!(read_u64_env(Some("x".into()), 42), 42);
    assert_eq!(read_u64_env(Some(" 7 ".into()), 42), 7);
    assert!(read_bool_env(None, true));
    assert!(read_bool_env(Some("ON".into()), false));
    assert!(!read_bool_env(Some("0".into()), true));
}

#[test]
fn startup_status_reflects_network() {
    let mut config = config_from(&[
        ("KIOSK_BACKEND_URL", "https://api.example.test"),
        ("KIOSK_DB_PATH", "/tmp/q.db"),
        ("KIOSK_DEVICE_ID", "tab-01"),
        ("KIOSK_NETWORK_TYPE", "offline"),
    ])
    .unwrap();
    let status = startup_status(&config);
    assert_eq!(status.device_id, "tab-01");
    assert_eq!(status.connectivity, "offline");

    config.network = NetworkType::Wifi;
    let status = startup_status(&config);
    assert_eq!(status.network_type, "wifi");
    assert_eq!(status.connectivity, "online");
}

#[tokio::test]
async fn status_and_reset_work_on_database_alone() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let store = QueueStore::open(&db_path).await.unwrap();
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::Verification,
                Operation::Insert,
                &json!({"contract_number": "42"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    let now = crate::sync::queue_store::now_millis();
    assert!(store.mark_in_progress(id, now).await.unwrap());
    assert!(store.mark_failed(id, "rejected", None).await.unwrap());
    drop(store);

    let status = queue_status(&db_path, 10).await.unwrap();
    assert_eq!(status.counts.failed, 1);
    assert_eq!(status.entries.len(), 1);
    assert_eq!(status.entries[0].last_error.as_deref(), Some("rejected"));

    assert_eq!(reset_failed(&db_path).await.unwrap(), 1);
    let status = queue_status(&db_path, 10).await.unwrap();
    assert_eq!(status.counts.pending, 1);
}

#[tokio::test]
async fn sync_once_uses_configured_routes_and_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/device-status"))
        .and(header("apikey", "kiosk-key"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/functions/v1/checks"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let uri = server.uri();
    let db = db_path.to_string_lossy().into_owned();
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", uri.as_str()),
        ("KIOSK_DB_PATH", db.as_str()),
        ("KIOSK_NETWORK_TYPE", "wifi"),
        ("KIOSK_ROUTE_VERIFICATION", "functions/v1/checks"),
    ])
    .unwrap();
    let runtime = DaemonRuntime::with_api_key(config.clone(), "kiosk-key".to_string())
        .await
        .unwrap();
    runtime
        .service()
        .enqueue_device_status(&startup_status(&config))
        .await
        .unwrap();
    runtime
        .service()
        .enqueue_verification(&json!({"contract_number": "1066"}))
        .await
        .unwrap();

    let report = runtime.sync_once().await.unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(runtime.service().pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn bootstrap_recovers_interrupted_entries() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let store = QueueStore::open(&db_path).await.unwrap();
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::GeofenceEvent,
                Operation::Insert,
                &json!({"device_id": "tab-01"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    // Claimed long ago by a process that never came back.
    assert!(store.mark_in_progress(id, 1).await.unwrap());
    drop(store);

    let db = db_path.to_string_lossy().into_owned();
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "http://127.0.0.1:9"),
        ("KIOSK_DB_PATH", db.as_str()),
    ])
    .unwrap();
    let runtime = DaemonRuntime::with_api_key(config, "key".to_string())
        .await
        .unwrap();
    let counts = runtime.service().queue_counts().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.in_progress, 0);
}

#[tokio::test]
async fn bootstrap_leaves_fresh_claims_of_another_process() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("queue.db");
    let store = QueueStore::open(&db_path).await.unwrap();
    let id = store
        .enqueue(
            NewEntry::new(
                EntityKind::GeofenceEvent,
                Operation::Insert,
                &json!({"device_id": "tab-01"}),
            )
            .unwrap(),
        )
        .await
        .unwrap();
    assert!(store.mark_in_progress(id, now_millis()).await.unwrap());

    let db = db_path.to_string_lossy().into_owned();
    let config = config_from(&[
        ("KIOSK_BACKEND_URL", "http://127.0.0.1:9"),
        ("KIOSK_DB_PATH", db.as_str()),
    ])
    .unwrap();
    let runtime = DaemonRuntime::with_api_key(config, "key".to_string())
        .await
        .unwrap();
    let counts = runtime.service().queue_counts().await.unwrap();
    assert_eq!(counts.in_progress, 1);
    assert_eq!(counts.pending, 0);

    assert!(store.mark_succeeded(id).await.unwrap());
}
