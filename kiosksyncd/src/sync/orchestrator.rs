use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures_util::{StreamExt, stream};
use kiosk_core::{ApiErrorClass, BackendClient, BackendError, RecordMeta};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::backoff::Backoff;
use super::entry::{EntityKind, EntryStatus, FileDownloadPayload, FileUploadPayload, QueueEntry};
use super::queue_store::{EntryFilter, QueueError, QueueOrder, QueueStore, now_millis};
use super::scheduler::{NetworkType, SyncPolicy, select_batch};
use super::transfer::{DownloadRequest, TransferError, TransferWorker, UploadProgress, UploadRequest};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MAX_WORKERS: usize = 4;
const CLAIM_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] QueueError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("entry was superseded or reclaimed while in flight")]
    ClaimLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Auth,
    Fatal,
    Cancelled,
}

impl SyncError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SyncError::Storage(_) => Disposition::Retry,
            SyncError::Validation(_) => Disposition::Fatal,
            SyncError::ClaimLost => Disposition::Cancelled,
            SyncError::Backend(err) | SyncError::Transfer(TransferError::Backend(err)) => {
                backend_disposition(err)
            }
            SyncError::Transfer(TransferError::Cancelled) => Disposition::Cancelled,
            SyncError::Transfer(err) if err.is_retryable() => Disposition::Retry,
            SyncError::Transfer(_) => Disposition::Fatal,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Backend(err) | SyncError::Transfer(TransferError::Backend(err)) => {
                err.retry_after()
            }
            _ => None,
        }
    }
}

fn backend_disposition(err: &BackendError) -> Disposition {
    match err.classification() {
        ApiErrorClass::Auth => Disposition::Auth,
        ApiErrorClass::RateLimit | ApiErrorClass::Transient => Disposition::Retry,
        ApiErrorClass::Permanent => Disposition::Fatal,
    }
}

/// Backend endpoints for record kinds, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRoutes {
    pub location: String,
    pub device_status: String,
    pub verification: String,
    pub geofence_event: String,
    /// `table:<name>` records go to `<table_prefix><name>`.
    pub table_prefix: String,
}

impl Default for RecordRoutes {
    fn default() -> Self {
        Self {
            location: "functions/v1/device-location".to_string(),
            device_status: "functions/v1/device-status".to_string(),
            verification: "functions/v1/verification-checks".to_string(),
            geofence_event: "functions/v1/geofence-events".to_string(),
            table_prefix: "rest/v1/".to_string(),
        }
    }
}

impl RecordRoutes {
    pub fn endpoint(&self, kind: &EntityKind) -> Option<String> {
        match kind {
            EntityKind::Location => Some(self.location.clone()),
            EntityKind::DeviceStatus => Some(self.device_status.clone()),
            EntityKind::Verification => Some(self.verification.clone()),
            EntityKind::GeofenceEvent => Some(self.geofence_event.clone()),
            EntityKind::Table(name) => Some(format!("{}{name}", self.table_prefix)),
            EntityKind::FileUpload | EntityKind::FileDownload => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Concurrent entries per batch, clamped to 1..=4.
    pub worker_count: usize,
    /// Deadline for one record POST.
    pub attempt_timeout: Duration,
    /// Deadline for one file transfer attempt.
    pub transfer_timeout: Duration,
    pub retention: Duration,
    pub audit_retention: Duration,
    /// Download bytes between durable progress checkpoints.
    pub checkpoint_bytes: u64,
    pub routes: RecordRoutes,
}

impl OrchestratorConfig {
    /// How long an in-flight claim may go unrenewed before another
    /// orchestrator treats it as orphaned.
    pub fn claim_lease(&self) -> Duration {
        self.attempt_timeout
            .max(self.transfer_timeout)
            .saturating_add(CLAIM_GRACE)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            worker_count: 2,
            attempt_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(600),
            retention: 7 * DAY,
            audit_retention: 30 * DAY,
            checkpoint_bytes: 256 * 1024,
            routes: RecordRoutes::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub started_at: i64,
    pub finished_at: i64,
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub released: usize,
    pub deferred: usize,
    pub recovered: u64,
    pub purged: u64,
    pub auth_required: bool,
    pub aborted: bool,
}

impl SyncReport {
    fn record(&mut self, outcome: EntryOutcome) {
        if outcome != EntryOutcome::Skipped {
            self.attempted += 1;
        }
        match outcome {
            EntryOutcome::Succeeded => self.succeeded += 1,
            EntryOutcome::Retried => self.retried += 1,
            EntryOutcome::Failed => self.failed += 1,
            EntryOutcome::Cancelled => self.cancelled += 1,
            EntryOutcome::Released => self.released += 1,
            EntryOutcome::AuthRequired => {
                self.released += 1;
                self.auth_required = true;
            }
            EntryOutcome::Skipped => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(SyncReport),
    /// Another pass was already running.
    Coalesced,
    /// The orchestrator has been shut down.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Succeeded,
    Retried,
    Failed,
    Cancelled,
    Released,
    AuthRequired,
    Skipped,
}

/// Receives (entry id, confirmed or sent bytes, total bytes).
pub type ProgressObserver = Arc<dyn Fn(i64, u64, Option<u64>) + Send + Sync>;

struct InFlight {
    token: CancellationToken,
    requested: Arc<OnceLock<Interruption>>,
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator {
    store: QueueStore,
    backend: BackendClient,
    transfer: TransferWorker,
    config: OrchestratorConfig,
    running: AtomicBool,
    shutdown: CancellationToken,
    pass_token: Mutex<Option<CancellationToken>>,
    in_flight: Mutex<HashMap<i64, InFlight>>,
    reports: watch::Sender<Option<SyncReport>>,
    observer: Option<ProgressObserver>,
}

impl SyncOrchestrator {
    /// Claims made by this orchestrator carry their own owner, even when
    /// `store` is shared with another one.
    pub fn new(store: QueueStore, backend: BackendClient, config: OrchestratorConfig) -> Self {
        let (reports, _) = watch::channel(None);
        Self {
            transfer: TransferWorker::new(backend.clone()),
            store: store.with_new_owner(),
            backend,
            config,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            pass_token: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            reports,
            observer: None,
        }
    }

    pub fn with_transfer(mut self, transfer: TransferWorker) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_progress_observer(mut self, observer: ProgressObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<SyncReport>> {
        self.reports.subscribe()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.reports.borrow().clone()
    }

    /// Cancels one entry in flight. Returns false when it is not running.
    pub fn request_cancel(&self, id: i64) -> bool {
        self.interrupt(id, Interruption::Cancelled)
    }

    /// Stops one entry in flight and returns it to PENDING without counting
    /// an attempt. Returns false when it is not running.
    pub fn request_pause(&self, id: i64) -> bool {
        self.interrupt(id, Interruption::Paused)
    }

    fn interrupt(&self, id: i64, interruption: Interruption) -> bool {
        let in_flight = lock(&self.in_flight);
        match in_flight.get(&id) {
            Some(entry) => {
                let _ = entry.requested.set(interruption);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops the active pass. Entries in flight go back to PENDING.
    pub fn abort_pass(&self) {
        if let Some(token) = lock(&self.pass_token).as_ref() {
            token.cancel();
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Runs one sync pass. A call made while another pass is active
    /// returns [`PassOutcome::Coalesced`] without doing anything.
    pub async fn run_pass(
        &self,
        policy: &SyncPolicy,
        network: NetworkType,
    ) -> Result<PassOutcome, SyncError> {
        if self.shutdown.is_cancelled() {
            return Ok(PassOutcome::Stopped);
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync pass already running; trigger coalesced");
            return Ok(PassOutcome::Coalesced);
        }
        let _guard = RunGuard(&self.running);

        let pass = self.shutdown.child_token();
        *lock(&self.pass_token) = Some(pass.clone());
        let result = self.drive_pass(policy, network, &pass).await;
        *lock(&self.pass_token) = None;
        let report = result?;

        tracing::info!(
            network = network.as_str(),
            attempted = report.attempted,
            succeeded = report.succeeded,
            retried = report.retried,
            failed = report.failed,
            cancelled = report.cancelled,
            deferred = report.deferred,
            purged = report.purged,
            auth_required = report.auth_required,
            aborted = report.aborted,
            "sync pass finished"
        );
        self.reports.send_replace(Some(report.clone()));
        Ok(PassOutcome::Completed(report))
    }

    async fn drive_pass(
        &self,
        policy: &SyncPolicy,
        network: NetworkType,
        pass: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport {
            started_at: now_millis(),
            ..SyncReport::default()
        };
        let stale_before =
            now_millis().saturating_sub(duration_millis(self.config.claim_lease()));
        report.recovered = self.store.requeue_interrupted(stale_before).await?;
        if report.recovered > 0 {
            tracing::warn!(
                count = report.recovered,
                "requeued entries left in flight by an interrupted pass"
            );
        }
        let workers = self.config.worker_count.clamp(1, MAX_WORKERS);

        loop {
            if pass.is_cancelled() {
                report.aborted = true;
                break;
            }
            let remaining = policy
                .max_entries_per_pass
                .saturating_sub(report.attempted);
            if remaining == 0 {
                break;
            }
            let candidates = self
                .store
                .dequeue_batch(
                    &EntryFilter::ready(now_millis()),
                    policy.candidate_window,
                    QueueOrder::Priority,
                )
                .await?;
            let mut plan = select_batch(&candidates, policy, network);
            report.deferred = plan.deferred;
            plan.selected.truncate(remaining);
            if plan.is_empty() {
                break;
            }

            let outcomes: Vec<EntryOutcome> = stream::iter(plan.selected)
                .map(|entry| self.process_entry(entry, pass))
                .buffer_unordered(workers)
                .collect()
                .await;
            let claimed = outcomes
                .iter()
                .any(|outcome| *outcome != EntryOutcome::Skipped);
            for outcome in outcomes {
                report.record(outcome);
            }
            if report.auth_required {
                tracing::warn!("backend credential rejected; pass stopped until it is refreshed");
                break;
            }
            if !claimed {
                break;
            }
        }
        if pass.is_cancelled() {
            report.aborted = true;
        }

        report.purged = self.purge_settled().await;
        report.finished_at = now_millis();
        Ok(report)
    }

    async fn purge_settled(&self) -> u64 {
        let now = now_millis();
        let mut purged = 0;
        for (status, keep) in [
            (EntryStatus::Succeeded, self.config.retention),
            (EntryStatus::Cancelled, self.config.audit_retention),
        ] {
            let cutoff = now.saturating_sub(duration_millis(keep));
            match self.store.purge_older_than(cutoff, status).await {
                Ok(removed) => purged += removed,
                Err(err) => {
                    tracing::warn!(status = status.as_str(), error = %err, "queue cleanup failed");
                }
            }
        }
        purged
    }

    async fn process_entry(&self, entry: QueueEntry, pass: &CancellationToken) -> EntryOutcome {
        let span = tracing::info_span!(
            "sync_entry",
            entry_id = entry.id,
            kind = %entry.entity_kind,
            attempt = entry.attempt_count + 1
        );
        async {
            match self.store.mark_in_progress(entry.id, now_millis()).await {
                Ok(true) => {}
                Ok(false) => return EntryOutcome::Skipped,
                Err(err) => {
                    tracing::warn!(error = %err, "cannot claim entry");
                    return EntryOutcome::Skipped;
                }
            }

            let token = pass.child_token();
            let requested = Arc::new(OnceLock::new());
            lock(&self.in_flight).insert(
                entry.id,
                InFlight {
                    token: token.clone(),
                    requested: requested.clone(),
                },
            );
            let result = self.execute(&entry, &token).await;
            lock(&self.in_flight).remove(&entry.id);

            let interruption = requested
                .get()
                .copied()
                .or_else(|| token.is_cancelled().then_some(Interruption::Aborted));
            match self.reconcile(&entry, result, interruption).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "cannot record sync outcome");
                    EntryOutcome::Skipped
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, entry: &QueueEntry, token: &CancellationToken) -> Result<(), SyncError> {
        let deadline = if entry.entity_kind.is_transfer() {
            self.config.transfer_timeout
        } else {
            self.config.attempt_timeout
        };
        let work = async {
            match entry.entity_kind {
                EntityKind::FileUpload => self.execute_upload(entry, token).await,
                EntityKind::FileDownload => self.execute_download(entry, token).await,
                _ => self.execute_record(entry, token).await,
            }
        };
        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::TimedOut.into()),
        }
    }

    async fn execute_record(
        &self,
        entry: &QueueEntry,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        if !entry.operation.is_record() {
            return Err(SyncError::Validation(format!(
                "operation {} is not valid for {}",
                entry.operation.as_str(),
                entry.entity_kind
            )));
        }
        let payload = entry
            .payload_json()
            .map_err(|err| SyncError::Validation(format!("payload is not valid JSON: {err}")))?;
        validate_payload(&entry.entity_kind, &payload)?;
        let endpoint = self
            .config
            .routes
            .endpoint(&entry.entity_kind)
            .ok_or_else(|| SyncError::Validation(format!("no route for {}", entry.entity_kind)))?;
        let key = idempotency_key(entry);
        let meta = RecordMeta {
            operation: Some(entry.operation.as_str()),
            idempotency_key: Some(&key),
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Cancelled.into()),
            result = self.backend.post_record(&endpoint, &payload, meta) => Ok(result?),
        }
    }

    async fn execute_upload(
        &self,
        entry: &QueueEntry,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let payload: FileUploadPayload = entry
            .payload_as()
            .map_err(|err| SyncError::Validation(format!("bad upload payload: {err}")))?;
        let total = match tokio::fs::metadata(&payload.local_path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransferError::MissingSource(payload.local_path).into());
            }
            Err(err) => return Err(TransferError::Io(err).into()),
        };
        // Nothing is confirmed until the server accepts the whole body.
        self.record_progress(entry.id, 0, Some(bytes_i64(total)))
            .await?;

        let id = entry.id;
        let observer = self.observer.clone();
        let progress: UploadProgress = Arc::new(move |sent, total| {
            if let Some(observer) = &observer {
                observer(id, sent, Some(total));
            }
        });
        let request = UploadRequest {
            local_path: payload.local_path,
            url: payload.upload_url,
            mime_type: payload.mime_type,
        };
        let sent = self.transfer.upload(&request, token, progress).await?;
        self.record_progress(entry.id, bytes_i64(sent), Some(bytes_i64(sent)))
            .await
    }

    /// Fails with [`SyncError::ClaimLost`] once the entry is no longer
    /// ours to advance, which stops a worker still moving bytes for a
    /// superseded payload.
    async fn record_progress(
        &self,
        id: i64,
        progress: i64,
        total: Option<i64>,
    ) -> Result<(), SyncError> {
        if self.store.update_progress(id, progress, total).await? {
            Ok(())
        } else {
            Err(SyncError::ClaimLost)
        }
    }

    async fn execute_download(
        &self,
        entry: &QueueEntry,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        let payload: FileDownloadPayload = entry
            .payload_as()
            .map_err(|err| SyncError::Validation(format!("bad download payload: {err}")))?;
        let request = DownloadRequest {
            url: payload.url,
            dest_path: payload.dest_path,
        };
        let resume_from = u64::try_from(entry.progress_bytes).unwrap_or(0);
        let mut session = self
            .transfer
            .start_download(&request, resume_from, token)
            .await?;
        if session.offset() != resume_from {
            tracing::debug!(
                from = resume_from,
                to = session.offset(),
                "download restarted at a different offset"
            );
        }
        self.persist_progress(entry.id, session.offset(), session.total())
            .await?;

        let mut unconfirmed = 0u64;
        while let Some(written) = session.next_chunk(token).await? {
            unconfirmed += written as u64;
            if unconfirmed >= self.config.checkpoint_bytes {
                let confirmed = session.checkpoint().await?;
                self.persist_progress(entry.id, confirmed, session.total())
                    .await?;
                unconfirmed = 0;
            }
        }
        let total = session.finish(payload.expected_md5.as_deref()).await?;
        self.persist_progress(entry.id, total, Some(total)).await?;
        Ok(())
    }

    async fn persist_progress(
        &self,
        id: i64,
        confirmed: u64,
        total: Option<u64>,
    ) -> Result<(), SyncError> {
        self.record_progress(id, bytes_i64(confirmed), total.map(bytes_i64))
            .await?;
        if let Some(observer) = &self.observer {
            observer(id, confirmed, total);
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        entry: &QueueEntry,
        result: Result<(), SyncError>,
        interruption: Option<Interruption>,
    ) -> Result<EntryOutcome, QueueError> {
        let id = entry.id;
        let err = match result {
            Ok(()) => {
                return Ok(if self.store.mark_succeeded(id).await? {
                    tracing::debug!("entry synced");
                    EntryOutcome::Succeeded
                } else {
                    EntryOutcome::Skipped
                });
            }
            Err(err) => err,
        };

        match interruption {
            Some(Interruption::Cancelled) => {
                self.store.mark_cancelled(id).await?;
                tracing::info!("entry cancelled in flight");
                return Ok(EntryOutcome::Cancelled);
            }
            Some(Interruption::Paused) => {
                self.store.set_paused(id, true).await?;
                self.store.release(id, None).await?;
                tracing::info!("entry paused in flight");
                return Ok(EntryOutcome::Released);
            }
            Some(Interruption::Aborted) => {
                self.store.release(id, None).await?;
                return Ok(EntryOutcome::Released);
            }
            None => {}
        }

        let reason = err.to_string();
        let attempt = entry.attempt_count + 1;
        match err.disposition() {
            Disposition::Cancelled => Ok(if self.store.release(id, None).await? {
                EntryOutcome::Released
            } else {
                tracing::debug!(error = %err, "entry left to its current holder");
                EntryOutcome::Skipped
            }),
            Disposition::Auth => {
                self.store.release(id, Some(&reason)).await?;
                tracing::warn!(error = %err, "backend credential missing or rejected");
                Ok(EntryOutcome::AuthRequired)
            }
            Disposition::Retry if attempt < self.config.max_retries => {
                if matches!(err, SyncError::Transfer(TransferError::IntegrityMismatch { .. })) {
                    self.store.update_progress(id, 0, None).await?;
                }
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| self.config.backoff.delay(entry.attempt_count));
                let retry_at = now_millis().saturating_add(duration_millis(delay));
                self.store.mark_failed(id, &reason, Some(retry_at)).await?;
                tracing::warn!(
                    attempts = attempt,
                    retry_in_ms = duration_millis(delay),
                    error = %err,
                    "sync attempt failed; will retry"
                );
                Ok(EntryOutcome::Retried)
            }
            Disposition::Retry | Disposition::Fatal => {
                self.store.mark_failed(id, &reason, None).await?;
                tracing::error!(attempts = attempt, error = %err, "entry failed permanently");
                Ok(EntryOutcome::Failed)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Cancelled,
    Paused,
    Aborted,
}

fn validate_payload(kind: &EntityKind, payload: &Value) -> Result<(), SyncError> {
    let Some(object) = payload.as_object() else {
        return Err(SyncError::Validation(format!(
            "{kind} payload must be a JSON object"
        )));
    };
    for field in kind.required_fields() {
        if object.get(*field).is_none_or(Value::is_null) {
            return Err(SyncError::Validation(format!(
                "{kind} payload is missing `{field}`"
            )));
        }
    }
    Ok(())
}

/// Stable per payload version, so retries of one write share a key.
fn idempotency_key(entry: &QueueEntry) -> String {
    let digest = Sha256::digest(entry.payload.as_bytes());
    let prefix: String = digest[..8].iter().map(|byte| format!("{byte:02x}")).collect();
    format!("{}:{}:{prefix}", entry.entity_kind, entry.id)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn bytes_i64(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
