use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use kiosk_core::{BackendClient, BackendConfig, DeviceStatusReport, PinSet};
use serde::Serialize;

use crate::storage::{CredentialStore, StorageError};
use crate::sync::backoff::Backoff;
use crate::sync::entry::QueueEntrySummary;
use crate::sync::orchestrator::{OrchestratorConfig, PassOutcome, RecordRoutes, SyncReport};
use crate::sync::queue_store::{QueueCounts, QueueStore, default_db_path};
use crate::sync::queue_store::now_millis;
use crate::sync::scheduler::{BandwidthMode, NetworkType, SyncPolicy};
use crate::sync::transfer::{DEFAULT_TRANSFER_CONCURRENCY, TransferConfig, TransferWorker};
use crate::sync::{SyncOrchestrator, SyncService};

const DEFAULT_DEVICE_ID: &str = "unknown-device";
const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 15;
const DEFAULT_SYNC_WORKERS: u64 = 2;
const DEFAULT_MAX_RETRIES: u64 = 3;
const DEFAULT_BACKOFF_BASE_MS: u64 = 5_000;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 900;
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_AUDIT_RETENTION_DAYS: u64 = 30;
const DEFAULT_HISTORY_RETENTION_DAYS: u64 = 30;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 600;
const DAY_SECS: u64 = 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub backend_url: String,
    pub device_id: String,
    pub db_path: PathBuf,
    pub sync_interval: Duration,
    pub bandwidth_mode: BandwidthMode,
    pub network: NetworkType,
    pub worker_count: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub retention: Duration,
    pub audit_retention: Duration,
    /// Local location history older than this is dropped at startup.
    pub history_retention: Duration,
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
    pub upload_concurrency: usize,
    pub download_concurrency: usize,
    pub kiosk_locked: bool,
    pub cert_pins: PinSet,
    pub routes: RecordRoutes,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = lookup("KIOSK_BACKEND_URL")
            .filter(|value| !value.trim().is_empty())
            .context("KIOSK_BACKEND_URL is not set")?;
        let device_id = lookup("KIOSK_DEVICE_ID")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let db_path = resolve_db_path(lookup("KIOSK_DB_PATH"))?;
        let bandwidth_mode = match lookup("KIOSK_BANDWIDTH_MODE") {
            Some(value) => BandwidthMode::parse(&value)
                .with_context(|| format!("unknown KIOSK_BANDWIDTH_MODE: {value}"))?,
            None => BandwidthMode::default(),
        };
        let network = match lookup("KIOSK_NETWORK_TYPE") {
            Some(value) => NetworkType::parse(&value)
                .with_context(|| format!("unknown KIOSK_NETWORK_TYPE: {value}"))?,
            None => NetworkType::default(),
        };
        let cert_pins = match lookup("KIOSK_CERT_PINS") {
            Some(value) => PinSet::parse(&value).context("invalid KIOSK_CERT_PINS")?,
            None => PinSet::default(),
        };

        let read_u64 = |name: &str, default: u64| read_u64_env(lookup(name), default);
        let read_usize = |name: &str| {
            usize::try_from(read_u64(name, DEFAULT_TRANSFER_CONCURRENCY as u64))
                .unwrap_or(DEFAULT_TRANSFER_CONCURRENCY)
        };
        Ok(Self {
            backend_url,
            device_id,
            db_path,
            sync_interval: Duration::from_secs(
                read_u64("KIOSK_SYNC_INTERVAL_MINUTES", DEFAULT_SYNC_INTERVAL_MINUTES)
                    .saturating_mul(60),
            ),
            bandwidth_mode,
            network,
            worker_count: read_u64("KIOSK_SYNC_WORKERS", DEFAULT_SYNC_WORKERS).clamp(1, 4) as usize,
            max_retries: u32::try_from(read_u64("KIOSK_MAX_RETRIES", DEFAULT_MAX_RETRIES))
                .unwrap_or(u32::MAX),
            backoff_base: Duration::from_millis(read_u64(
                "KIOSK_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_secs(read_u64(
                "KIOSK_BACKOFF_MAX_SECS",
                DEFAULT_BACKOFF_MAX_SECS,
            )),
            retention: Duration::from_secs(
                read_u64("KIOSK_RETENTION_DAYS", DEFAULT_RETENTION_DAYS).saturating_mul(DAY_SECS),
            ),
            audit_retention: Duration::from_secs(
                read_u64("KIOSK_AUDIT_RETENTION_DAYS", DEFAULT_AUDIT_RETENTION_DAYS)
                    .saturating_mul(DAY_SECS),
            ),
            history_retention: Duration::from_secs(
                read_u64("KIOSK_HISTORY_RETENTION_DAYS", DEFAULT_HISTORY_RETENTION_DAYS)
                    .saturating_mul(DAY_SECS),
            ),
            call_timeout: Duration::from_secs(read_u64(
                "KIOSK_CALL_TIMEOUT_SECS",
                DEFAULT_CALL_TIMEOUT_SECS,
            )),
            connect_timeout: Duration::from_secs(read_u64(
                "KIOSK_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            transfer_timeout: Duration::from_secs(read_u64(
                "KIOSK_TRANSFER_TIMEOUT_SECS",
                DEFAULT_TRANSFER_TIMEOUT_SECS,
            )),
            upload_concurrency: read_usize("KIOSK_UPLOAD_CONCURRENCY"),
            download_concurrency: read_usize("KIOSK_DOWNLOAD_CONCURRENCY"),
            kiosk_locked: read_bool_env(lookup("KIOSK_LOCKED"), true),
            cert_pins,
            routes: routes_from(&lookup),
        })
    }

    pub fn policy(&self) -> SyncPolicy {
        SyncPolicy {
            bandwidth_mode: self.bandwidth_mode,
            ..SyncPolicy::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_retries: self.max_retries,
            backoff: Backoff::new(self.backoff_base, self.backoff_max, true),
            worker_count: self.worker_count,
            attempt_timeout: self.call_timeout.saturating_add(self.connect_timeout),
            transfer_timeout: self.transfer_timeout,
            retention: self.retention,
            audit_retention: self.audit_retention,
            routes: self.routes.clone(),
            ..OrchestratorConfig::default()
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            upload_concurrency: self.upload_concurrency,
            download_concurrency: self.download_concurrency,
            ..TransferConfig::default()
        }
    }

    pub fn backend_config(&self, api_key: String) -> BackendConfig {
        BackendConfig {
            call_timeout: self.call_timeout,
            connect_timeout: self.connect_timeout,
            pins: self.cert_pins.clone(),
            ..BackendConfig::new(self.backend_url.clone(), api_key)
        }
    }
}

/// Queue counts plus the newest entries, as printed by `--status`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub counts: QueueCounts,
    pub entries: Vec<QueueEntrySummary>,
}

/// Reads queue state without a backend or credential.
pub async fn queue_status(db_path: &Path, limit: usize) -> anyhow::Result<QueueStatus> {
    let store = open_store(db_path).await?;
    let counts = store.counts().await.context("failed to count queue entries")?;
    let entries = store
        .snapshot(limit)
        .await
        .context("failed to read queue snapshot")?
        .iter()
        .map(|entry| entry.summary())
        .collect();
    Ok(QueueStatus { counts, entries })
}

pub async fn reset_failed(db_path: &Path) -> anyhow::Result<u64> {
    let store = open_store(db_path).await?;
    store
        .reset_failed()
        .await
        .context("failed to reset failed entries")
}

/// `KIOSK_DB_PATH`, or the default location under the data directory.
pub fn db_path_from_env() -> anyhow::Result<PathBuf> {
    resolve_db_path(std::env::var("KIOSK_DB_PATH").ok())
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    service: SyncService,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let api_key = resolve_api_key()?;
        Self::with_api_key(config, api_key).await
    }

    pub async fn with_api_key(config: DaemonConfig, api_key: String) -> anyhow::Result<Self> {
        let backend = BackendClient::new(config.backend_config(api_key))
            .context("failed to build backend client")?;
        let store = open_store(&config.db_path).await?;
        let orchestrator_config = config.orchestrator_config();
        // Claims renewed within the lease may belong to a live `--sync-once`.
        let stale_before = now_millis().saturating_sub(
            i64::try_from(orchestrator_config.claim_lease().as_millis()).unwrap_or(i64::MAX),
        );
        let recovered = store
            .requeue_interrupted(stale_before)
            .await
            .context("failed to recover interrupted entries")?;
        if recovered > 0 {
            tracing::info!(recovered, "interrupted entries returned to the queue");
        }
        let transfer = TransferWorker::with_config(backend.clone(), config.transfer_config());
        let orchestrator = SyncOrchestrator::new(store, backend, orchestrator_config)
            .with_transfer(transfer);
        let service = SyncService::new(orchestrator, config.policy(), config.network);
        Ok(Self { config, service })
    }

    pub fn service(&self) -> &SyncService {
        &self.service
    }

    pub async fn sync_once(&self) -> anyhow::Result<SyncReport> {
        match self.service.run_sync_pass().await? {
            PassOutcome::Completed(report) => Ok(report),
            PassOutcome::Coalesced => anyhow::bail!("another sync pass is already running"),
            PassOutcome::Stopped => anyhow::bail!("sync was shut down"),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            device_id = %self.config.device_id,
            backend = %self.config.backend_url,
            db = %self.config.db_path.display(),
            interval_secs = self.config.sync_interval.as_secs(),
            bandwidth_mode = self.config.bandwidth_mode.as_str(),
            pinned = !self.config.cert_pins.is_empty(),
            "kiosksyncd started"
        );

        if let Err(err) = self
            .service
            .enqueue_device_status(&startup_status(&self.config))
            .await
        {
            tracing::warn!(error = %err, "failed to queue startup device status");
        }
        if let Err(err) = self
            .service
            .cleanup_location_history(self.config.history_retention)
            .await
        {
            tracing::warn!(error = %err, "failed to clean up location history");
        }

        let mut reports = self.service.subscribe_reports();
        let report_handle = tokio::spawn(async move {
            while reports.changed().await.is_ok() {
                let report = reports.borrow_and_update().clone();
                if let Some(report) = report {
                    log_report(&report);
                }
            }
        });

        self.service.start_periodic_sync(self.config.sync_interval);

        let shutdown = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        self.service.shutdown();
        report_handle.abort();
        shutdown.context("failed waiting for shutdown signal")?;
        Ok(())
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
