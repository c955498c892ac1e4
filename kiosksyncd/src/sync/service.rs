use std::path::{Component, Path};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use kiosk_core::{DeviceStatusReport, LocationReport};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::location::{
    Geofence, GeofenceEvent, GeofenceEventRecord, GeofenceTracker, LocationHistory,
    LocationPoint, LocationStats, NearbyGeofence, TimeRange,
};

use super::entry::{
    EntityKind, FileDownloadPayload, FileUploadPayload, Operation, QueueEntrySummary,
    mime_type_for,
};
use super::orchestrator::{PassOutcome, SyncError, SyncOrchestrator, SyncReport};
use super::queue_store::{NewEntry, QueueCounts, QueueStore, now_millis};
use super::scheduler::{BandwidthMode, NetworkType, SyncPolicy};

const MIN_WAKE: Duration = Duration::from_secs(1);

struct PeriodicTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Queue entries created for one location fix.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub entry_id: i64,
    pub geofence_events: Vec<QueuedGeofenceEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedGeofenceEvent {
    pub entry_id: i64,
    pub event: GeofenceEvent,
}

/// Entry point the surrounding app uses to queue work and drive sync.
#[derive(Clone)]
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
    policy: Arc<RwLock<SyncPolicy>>,
    network: Arc<watch::Sender<NetworkType>>,
    periodic: Arc<Mutex<Option<PeriodicTask>>>,
    geofences: Arc<Mutex<GeofenceTracker>>,
    history: LocationHistory,
}

impl SyncService {
    pub fn new(orchestrator: SyncOrchestrator, policy: SyncPolicy, network: NetworkType) -> Self {
        let (network, _) = watch::channel(network);
        Self {
            history: LocationHistory::new(orchestrator.store()),
            geofences: Arc::new(Mutex::new(GeofenceTracker::default())),
            orchestrator: Arc::new(orchestrator),
            policy: Arc::new(RwLock::new(policy)),
            network: Arc::new(network),
            periodic: Arc::new(Mutex::new(None)),
        }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    fn store(&self) -> &QueueStore {
        self.orchestrator.store()
    }

    pub async fn enqueue_record<P: Serialize + ?Sized>(
        &self,
        kind: EntityKind,
        operation: Operation,
        data: &P,
    ) -> Result<i64, SyncError> {
        if kind.is_transfer() || !operation.is_record() {
            return Err(SyncError::Validation(format!(
                "{} is not a record operation for {kind}",
                operation.as_str()
            )));
        }
        let id = self
            .store()
            .enqueue(NewEntry::new(kind, operation, data)?)
            .await?;
        tracing::debug!(entry_id = id, "record queued");
        Ok(id)
    }

    pub async fn enqueue_location(&self, report: &LocationReport) -> Result<i64, SyncError> {
        self.enqueue_record(EntityKind::Location, Operation::Insert, report)
            .await
    }

    pub async fn enqueue_device_status(
        &self,
        report: &DeviceStatusReport,
    ) -> Result<i64, SyncError> {
        self.enqueue_record(EntityKind::DeviceStatus, Operation::Insert, report)
            .await
    }

    /// Verification records collapse per contract number until synced.
    pub async fn enqueue_verification(&self, record: &Value) -> Result<i64, SyncError> {
        self.enqueue_record(EntityKind::Verification, Operation::Insert, record)
            .await
    }

    pub async fn enqueue_geofence_event<P: Serialize + ?Sized>(
        &self,
        event: &P,
    ) -> Result<i64, SyncError> {
        self.enqueue_record(EntityKind::GeofenceEvent, Operation::Insert, event)
            .await
    }

    /// Queues a fix, keeps it in local history, and queues every geofence
    /// transition it causes.
    pub async fn record_location(&self, fix: &LocationReport) -> Result<LocationUpdate, SyncError> {
        let at = OffsetDateTime::parse(&fix.recorded_at, &Rfc3339).map_err(|err| {
            SyncError::Validation(format!("bad recorded_at {:?}: {err}", fix.recorded_at))
        })?;
        let at_millis = i64::try_from(at.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX);

        let entry_id = self.enqueue_location(fix).await?;
        self.history.record_location(fix, at_millis).await?;

        let events = self
            .geofences
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .evaluate(&fix.device_id, fix.latitude, fix.longitude, at);
        let mut geofence_events = Vec::with_capacity(events.len());
        for event in events {
            self.history.record_geofence_event(&event, at_millis).await?;
            let entry_id = self.enqueue_geofence_event(&event).await?;
            tracing::info!(
                entry_id,
                geofence = %event.geofence_id,
                transition = event.event_type.as_str(),
                "geofence transition queued"
            );
            geofence_events.push(QueuedGeofenceEvent { entry_id, event });
        }
        Ok(LocationUpdate {
            entry_id,
            geofence_events,
        })
    }

    pub async fn enqueue_file_upload(
        &self,
        path: &Path,
        upload_url: &str,
        metadata: Value,
    ) -> Result<i64, SyncError> {
        let local_path = tokio::fs::canonicalize(path).await.map_err(|err| {
            SyncError::Validation(format!("cannot read {}: {err}", path.display()))
        })?;
        let meta = tokio::fs::metadata(&local_path).await.map_err(|err| {
            SyncError::Validation(format!("cannot read {}: {err}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(SyncError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let payload = FileUploadPayload {
            mime_type: mime_type_for(&local_path).to_string(),
            local_path,
            upload_url: upload_url.to_string(),
            metadata,
        };
        let total = i64::try_from(meta.len()).unwrap_or(i64::MAX);
        let entry = NewEntry::new(EntityKind::FileUpload, Operation::Upload, &payload)?
            .with_total_bytes(total);
        let id = self.store().enqueue(entry).await?;
        tracing::debug!(entry_id = id, bytes = total, "upload queued");
        Ok(id)
    }

    pub async fn enqueue_file_download(
        &self,
        url: &str,
        dest_dir: &Path,
        name: &str,
    ) -> Result<i64, SyncError> {
        self.enqueue_download(url, dest_dir, name, None).await
    }

    /// Like [`Self::enqueue_file_download`], verifying the finished file's MD5.
    pub async fn enqueue_file_download_checked(
        &self,
        url: &str,
        dest_dir: &Path,
        name: &str,
        expected_md5: &str,
    ) -> Result<i64, SyncError> {
        self.enqueue_download(url, dest_dir, name, Some(expected_md5.to_string()))
            .await
    }

    async fn enqueue_download(
        &self,
        url: &str,
        dest_dir: &Path,
        name: &str,
        expected_md5: Option<String>,
    ) -> Result<i64, SyncError> {
        if !is_plain_file_name(name) {
            return Err(SyncError::Validation(format!(
                "download name must be a plain file name: {name:?}"
            )));
        }
        let payload = FileDownloadPayload {
            url: url.to_string(),
            dest_path: dest_dir.join(name),
            name: name.to_string(),
            expected_md5,
        };
        let id = self
            .store()
            .enqueue(NewEntry::new(
                EntityKind::FileDownload,
                Operation::Download,
                &payload,
            )?)
            .await?;
        tracing::debug!(entry_id = id, "download queued");
        Ok(id)
    }

    /// Runs one pass on the calling task with the current policy and network.
    pub async fn run_sync_pass(&self) -> Result<PassOutcome, SyncError> {
        let policy = self.policy();
        let network = self.network();
        self.orchestrator.run_pass(&policy, network).await
    }

    pub fn trigger_sync_now(&self) -> JoinHandle<Result<PassOutcome, SyncError>> {
        let service = self.clone();
        tokio::spawn(async move { service.run_sync_pass().await })
    }

    /// Runs a pass now and then every `interval`, waking earlier when a
    /// backoff gate falls due. Replaces any running schedule.
    pub fn start_periodic_sync(&self, interval: Duration) {
        self.stop_periodic();
        let token = CancellationToken::new();
        let service = self.clone();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            loop {
                if let Err(err) = service.run_sync_pass().await {
                    tracing::warn!(error = %err, "periodic sync pass failed");
                }
                let wait = service.next_wake(interval).await;
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        });
        *self.periodic.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(PeriodicTask { token, handle });
        tracing::info!(interval_secs = interval.as_secs(), "periodic sync started");
    }

    async fn next_wake(&self, interval: Duration) -> Duration {
        let now = now_millis();
        match self.store().next_due_at(now).await {
            Ok(Some(due)) => {
                let until_due = Duration::from_millis(u64::try_from(due - now).unwrap_or(0));
                until_due.clamp(MIN_WAKE, interval.max(MIN_WAKE))
            }
            Ok(None) => interval,
            Err(err) => {
                tracing::warn!(error = %err, "cannot read next retry time");
                interval
            }
        }
    }

    fn stop_periodic(&self) -> bool {
        let task = self
            .periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.token.cancel();
                drop(task.handle);
                true
            }
            None => false,
        }
    }

    pub fn is_periodic_running(&self) -> bool {
        self.periodic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stops the periodic schedule and aborts the active pass. Entries in
    /// flight return to PENDING.
    pub fn cancel_all_sync(&self) {
        if self.stop_periodic() {
            tracing::info!("periodic sync stopped");
        }
        self.orchestrator.abort_pass();
    }

    /// Records the new network. Coming online (or switching network)
    /// triggers a pass; going offline aborts the active one.
    pub fn notify_connectivity_changed(
        &self,
        network: NetworkType,
    ) -> Option<JoinHandle<Result<PassOutcome, SyncError>>> {
        let previous = self.network.send_replace(network);
        if previous == network {
            return None;
        }
        tracing::info!(
            from = previous.as_str(),
            to = network.as_str(),
            "connectivity changed"
        );
        if network.is_online() {
            Some(self.trigger_sync_now())
        } else {
            self.orchestrator.abort_pass();
            None
        }
    }

    pub fn set_bandwidth_mode(&self, mode: BandwidthMode) {
        self.policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .bandwidth_mode = mode;
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn network(&self) -> NetworkType {
        *self.network.borrow()
    }

    pub async fn pending_count(&self) -> Result<i64, SyncError> {
        Ok(self.store().count_pending().await?)
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, SyncError> {
        Ok(self.store().counts().await?)
    }

    /// Most recent entries first.
    pub async fn queue_snapshot(&self, limit: usize) -> Result<Vec<QueueEntrySummary>, SyncError> {
        let entries = self.store().snapshot(limit).await?;
        Ok(entries.iter().map(|entry| entry.summary()).collect())
    }

    pub async fn reset_failed_entries(&self) -> Result<u64, SyncError> {
        let count = self.store().reset_failed().await?;
        if count > 0 {
            tracing::info!(count, "failed entries reset");
        }
        Ok(count)
    }

    /// Cancels a pending entry, or one in flight. Returns false when the
    /// entry had already settled.
    pub async fn cancel_entry(&self, id: i64) -> Result<bool, SyncError> {
        let in_flight = self.orchestrator.request_cancel(id);
        let stored = self.store().mark_cancelled(id).await?;
        Ok(in_flight || stored)
    }

    /// Holds an entry back from sync, stopping it if it is in flight.
    /// A paused transfer keeps its confirmed progress and is not charged
    /// an attempt. Returns false when the entry had already settled.
    pub async fn pause_entry(&self, id: i64) -> Result<bool, SyncError> {
        let held = self.store().set_paused(id, true).await?;
        let in_flight = self.orchestrator.request_pause(id);
        if held || in_flight {
            tracing::info!(entry_id = id, "entry paused");
        }
        Ok(held || in_flight)
    }

    /// Lets a paused entry sync again and starts a pass for it.
    pub async fn resume_entry(&self, id: i64) -> Result<bool, SyncError> {
        let resumed = self.store().set_paused(id, false).await?;
        if resumed {
            tracing::info!(entry_id = id, "entry resumed");
            drop(self.trigger_sync_now());
        }
        Ok(resumed)
    }

    pub fn set_geofences(&self, fences: Vec<Geofence>) {
        self.tracker().replace_all(fences);
    }

    pub fn add_geofence(&self, fence: Geofence) {
        self.tracker().add(fence);
    }

    pub fn remove_geofence(&self, id: &str) -> bool {
        self.tracker().remove(id)
    }

    pub fn geofences(&self) -> Vec<Geofence> {
        self.tracker().geofences().to_vec()
    }

    /// Fences the device was inside at the last recorded fix.
    pub fn current_geofences(&self) -> Vec<Geofence> {
        self.tracker().current().into_iter().cloned().collect()
    }

    pub fn nearby_geofences(
        &self,
        latitude: f64,
        longitude: f64,
        max_distance_meters: f64,
    ) -> Vec<NearbyGeofence> {
        self.tracker()
            .find_nearby(latitude, longitude, max_distance_meters)
    }

    fn tracker(&self) -> MutexGuard<'_, GeofenceTracker> {
        self.geofences.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn location_history(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<LocationPoint>, SyncError> {
        Ok(self.history.locations(device_id, range, limit).await?)
    }

    pub async fn geofence_history(
        &self,
        device_id: &str,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<GeofenceEventRecord>, SyncError> {
        Ok(self.history.geofence_events(device_id, range, limit).await?)
    }

    pub async fn location_stats(
        &self,
        device_id: &str,
        range: TimeRange,
    ) -> Result<LocationStats, SyncError> {
        Ok(self.history.stats(device_id, range).await?)
    }

    /// Drops local history older than `keep`. Queued entries are untouched.
    pub async fn cleanup_location_history(&self, keep: Duration) -> Result<u64, SyncError> {
        let keep_ms = i64::try_from(keep.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(keep_ms);
        let removed = self.history.cleanup_older_than(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "old location history removed");
        }
        Ok(removed)
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.orchestrator.last_report()
    }

    pub fn subscribe_reports(&self) -> watch::Receiver<Option<SyncReport>> {
        self.orchestrator.subscribe_reports()
    }

    pub fn shutdown(&self) {
        self.cancel_all_sync();
        self.orchestrator.shutdown();
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}
