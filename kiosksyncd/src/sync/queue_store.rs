use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;
use sqlx::{
    QueryBuilder, Row, Sqlite, SqlitePool,
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow},
};
use thiserror::Error;
use time::OffsetDateTime;

use super::entry::{EntityKind, EntryStatus, Operation, QueueEntry};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DB_DIR: &str = "kiosk-sync";
const DB_FILENAME: &str = "queue.db";
const ENTRY_COLUMNS: &str = "id, entity_kind, operation, payload, status, priority, dedup_key, \
     created_at, updated_at, completed_at, attempt_count, last_error, progress_bytes, \
     total_bytes, next_attempt_at, dirty, paused";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("payload cannot be serialized: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid entity kind: {0}")]
    InvalidEntityKind(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("progress {progress} exceeds total {total}")]
    InvalidProgress { progress: i64, total: i64 },
}

/// A write waiting to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub entity_kind: EntityKind,
    pub operation: Operation,
    pub payload: Value,
    pub priority: i64,
    pub total_bytes: Option<i64>,
}

impl NewEntry {
    pub fn new<P: Serialize + ?Sized>(
        entity_kind: EntityKind,
        operation: Operation,
        payload: &P,
    ) -> Result<Self, QueueError> {
        let payload = serde_json::to_value(payload)?;
        let priority = entity_kind.default_priority();
        Ok(Self {
            entity_kind,
            operation,
            payload,
            priority,
            total_bytes: None,
        })
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_total_bytes(mut self, total_bytes: i64) -> Self {
        self.total_bytes = Some(total_bytes);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryFilter {
    pub statuses: Vec<EntryStatus>,
    /// Only entries whose backoff gate has passed at this instant.
    pub due_at: Option<i64>,
    pub entity_kind: Option<EntityKind>,
    pub skip_paused: bool,
}

impl EntryFilter {
    pub fn status(status: EntryStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    pub fn any_status() -> Self {
        Self {
            statuses: vec![
                EntryStatus::Pending,
                EntryStatus::InProgress,
                EntryStatus::Succeeded,
                EntryStatus::Failed,
                EntryStatus::Cancelled,
            ],
            ..Self::default()
        }
    }

    /// Pending, unpaused entries that may be attempted at `now`.
    pub fn ready(now: i64) -> Self {
        Self {
            skip_paused: true,
            ..Self::status(EntryStatus::Pending).due(now)
        }
    }

    pub fn due(mut self, now: i64) -> Self {
        self.due_at = Some(now);
        self
    }

    pub fn kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = Some(kind);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    #[default]
    Priority,
    Oldest,
    Newest,
}

impl QueueOrder {
    fn sql(&self) -> &'static str {
        match self {
            QueueOrder::Priority => "priority ASC, created_at ASC, id ASC",
            QueueOrder::Oldest => "created_at ASC, id ASC",
            QueueOrder::Newest => "id DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Handle to the queue database.
///
/// Every handle carries a claim owner. Entries it moves to IN_PROGRESS are
/// stamped with that owner, and only the same owner may settle them, so
/// two processes sharing one database never finish each other's work.
#[derive(Clone)]
pub struct QueueStore {
    pool: SqlitePool,
    owner: Arc<str>,
}

impl QueueStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            owner: new_owner(),
        }
    }

    /// Same database, separate claim owner.
    pub fn with_new_owner(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            owner: new_owner(),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub async fn new(database_url: &str) -> Result<Self, QueueError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, QueueError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn open(db_path: &Path) -> Result<Self, QueueError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), QueueError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stores a new PENDING entry and returns its id.
    ///
    /// For kinds with a natural key the write collapses into the unsynced
    /// entry for that key: a pending entry takes the new payload, an entry
    /// in flight takes it too and is flagged dirty so it is sent again, and
    /// a failed entry is cancelled in favour of a fresh one.
    pub async fn enqueue(&self, entry: NewEntry) -> Result<i64, QueueError> {
        let payload = serde_json::to_string(&entry.payload)?;
        let dedup_key = entry.entity_kind.dedup_key(&entry.payload);
        let kind = entry.entity_kind.as_str();
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        if let Some(key) = dedup_key.as_deref() {
            let superseded = sqlx::query(
                "UPDATE queue_entries
                 SET progress_bytes = CASE
                         WHEN status = 'pending' AND payload <> ?1 THEN 0
                         ELSE progress_bytes
                     END,
                     dirty = CASE WHEN status = 'in_progress' THEN 1 ELSE dirty END,
                     payload = ?1,
                     operation = ?2,
                     priority = ?3,
                     total_bytes = COALESCE(?4, total_bytes),
                     updated_at = ?5
                 WHERE entity_kind = ?6
                   AND dedup_key = ?7
                   AND status IN ('pending', 'in_progress')
                 RETURNING id",
            )
            .bind(&payload)
            .bind(entry.operation.as_str())
            .bind(entry.priority)
            .bind(entry.total_bytes)
            .bind(now)
            .bind(kind.as_ref())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = superseded {
                let id: i64 = row.try_get("id")?;
                tx.commit().await?;
                return Ok(id);
            }

            sqlx::query(
                "UPDATE queue_entries SET status = 'cancelled', updated_at = ?1
                 WHERE entity_kind = ?2 AND dedup_key = ?3 AND status = 'failed'",
            )
            .bind(now)
            .bind(kind.as_ref())
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }

        let result = sqlx::query(
            "INSERT INTO queue_entries (
                 entity_kind, operation, payload, status, priority, dedup_key,
                 created_at, updated_at, total_bytes
             )
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?6, ?7)",
        )
        .bind(kind.as_ref())
        .bind(entry.operation.as_str())
        .bind(&payload)
        .bind(entry.priority)
        .bind(dedup_key.as_deref())
        .bind(now)
        .bind(entry.total_bytes)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(result.last_insert_rowid())
    }

    /// Reads entries matching `filter`. Never mutates state.
    pub async fn dequeue_batch(
        &self,
        filter: &EntryFilter,
        limit: usize,
        order: QueueOrder,
    ) -> Result<Vec<QueueEntry>, QueueError> {
        if filter.statuses.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE status IN ("));
        let mut statuses = query.separated(", ");
        for status in &filter.statuses {
            statuses.push_bind(status.as_str());
        }
        statuses.push_unseparated(")");
        if let Some(now) = filter.due_at {
            query
                .push(" AND (next_attempt_at IS NULL OR next_attempt_at <= ")
                .push_bind(now)
                .push(")");
        }
        if filter.skip_paused {
            query.push(" AND paused = 0");
        }
        if let Some(kind) = &filter.entity_kind {
            query
                .push(" AND entity_kind = ")
                .push_bind(kind.as_str().into_owned());
        }
        query
            .push(" ORDER BY ")
            .push(order.sql())
            .push(" LIMIT ")
            .push_bind(i64::try_from(limit).unwrap_or(i64::MAX));

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueEntry>, QueueError> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    pub async fn snapshot(&self, limit: usize) -> Result<Vec<QueueEntry>, QueueError> {
        self.dequeue_batch(&EntryFilter::any_status(), limit, QueueOrder::Newest)
            .await
    }

    /// PENDING -> IN_PROGRESS, claimed by this handle's owner. Returns false
    /// when the entry is no longer pending, is paused, or its backoff gate
    /// has not passed.
    pub async fn mark_in_progress(&self, id: i64, now: i64) -> Result<bool, QueueError> {
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'in_progress', claimed_by = ?3, claimed_at = ?2, updated_at = ?2
             WHERE id = ?1
               AND status = 'pending'
               AND paused = 0
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)",
        )
        .bind(id)
        .bind(now)
        .bind(self.owner.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// IN_PROGRESS -> SUCCEEDED, or back to PENDING when a newer payload
    /// arrived while the entry was in flight.
    pub async fn mark_succeeded(&self, id: i64) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = CASE WHEN dirty = 1 THEN 'pending' ELSE 'succeeded' END,
                 completed_at = CASE WHEN dirty = 1 THEN NULL ELSE ?2 END,
                 progress_bytes = CASE WHEN dirty = 1 THEN 0 ELSE progress_bytes END,
                 last_error = NULL,
                 next_attempt_at = NULL,
                 dirty = 0,
                 paused = CASE WHEN dirty = 1 THEN paused ELSE 0 END,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 updated_at = ?2
             WHERE id = ?1 AND status = 'in_progress' AND claimed_by = ?3",
        )
        .bind(id)
        .bind(now)
        .bind(self.owner.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a failed attempt. With `retry_at` the entry goes back to
    /// PENDING gated until then; without it the entry becomes FAILED.
    /// Progress made against a superseded payload is discarded.
    pub async fn mark_failed(
        &self,
        id: i64,
        reason: &str,
        retry_at: Option<i64>,
    ) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET attempt_count = attempt_count + 1,
                 status = CASE WHEN ?3 IS NULL THEN 'failed' ELSE 'pending' END,
                 next_attempt_at = ?3,
                 last_error = ?2,
                 progress_bytes = CASE WHEN dirty = 1 THEN 0 ELSE progress_bytes END,
                 dirty = 0,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 updated_at = ?4
             WHERE id = ?1 AND status = 'in_progress' AND claimed_by = ?5",
        )
        .bind(id)
        .bind(reason)
        .bind(retry_at)
        .bind(now)
        .bind(self.owner.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// IN_PROGRESS -> PENDING without counting an attempt.
    pub async fn release(&self, id: i64, reason: Option<&str>) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'pending',
                 last_error = COALESCE(?2, last_error),
                 progress_bytes = CASE WHEN dirty = 1 THEN 0 ELSE progress_bytes END,
                 dirty = 0,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 updated_at = ?3
             WHERE id = ?1 AND status = 'in_progress' AND claimed_by = ?4",
        )
        .bind(id)
        .bind(reason)
        .bind(now)
        .bind(self.owner.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cancels an unsynced entry whoever holds it.
    pub async fn mark_cancelled(&self, id: i64) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'cancelled', dirty = 0, claimed_by = NULL, claimed_at = NULL,
                 updated_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'in_progress')",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records confirmed transfer progress for an entry in flight and
    /// renews its claim. Returns false when this handle no longer holds the
    /// claim or the entry was superseded by a newer payload.
    pub async fn update_progress(
        &self,
        id: i64,
        progress_bytes: i64,
        total_bytes: Option<i64>,
    ) -> Result<bool, QueueError> {
        if let Some(total) = total_bytes
            && (progress_bytes > total || progress_bytes < 0)
        {
            return Err(QueueError::InvalidProgress {
                progress: progress_bytes,
                total,
            });
        }
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET progress_bytes = ?2,
                 total_bytes = COALESCE(?3, total_bytes),
                 claimed_at = ?4,
                 updated_at = ?4
             WHERE id = ?1
               AND status = 'in_progress'
               AND claimed_by = ?5
               AND dirty = 0
               AND (COALESCE(?3, total_bytes) IS NULL OR ?2 <= COALESCE(?3, total_bytes))",
        )
        .bind(id)
        .bind(progress_bytes)
        .bind(total_bytes)
        .bind(now)
        .bind(self.owner.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_pending(&self) -> Result<i64, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_entries WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM queue_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match EntryStatus::parse(&status)? {
                EntryStatus::Pending => counts.pending = n,
                EntryStatus::InProgress => counts.in_progress = n,
                EntryStatus::Succeeded => counts.succeeded = n,
                EntryStatus::Failed => counts.failed = n,
                EntryStatus::Cancelled => counts.cancelled = n,
            }
        }
        Ok(counts)
    }

    /// Earliest backoff gate among pending entries that is still ahead of `after`.
    pub async fn next_due_at(&self, after: i64) -> Result<Option<i64>, QueueError> {
        let row = sqlx::query(
            "SELECT MIN(next_attempt_at) AS due FROM queue_entries
             WHERE status = 'pending' AND paused = 0 AND next_attempt_at > ?1",
        )
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("due")?)
    }

    /// Deletes `status` entries that settled before `cutoff`.
    pub async fn purge_older_than(
        &self,
        cutoff: i64,
        status: EntryStatus,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "DELETE FROM queue_entries
             WHERE status = ?1 AND COALESCE(completed_at, updated_at) < ?2",
        )
        .bind(status.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// FAILED -> PENDING with a fresh retry budget.
    pub async fn reset_failed(&self) -> Result<u64, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'pending', attempt_count = 0, next_attempt_at = NULL, updated_at = ?1
             WHERE status = 'failed'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Returns orphaned IN_PROGRESS entries to PENDING: those claimed by
    /// this handle's owner, and those whose claim was last renewed before
    /// `stale_before`. Claims another live owner renewed recently are left
    /// alone.
    pub async fn requeue_interrupted(&self, stale_before: i64) -> Result<u64, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries
             SET status = 'pending',
                 progress_bytes = CASE WHEN dirty = 1 THEN 0 ELSE progress_bytes END,
                 dirty = 0,
                 claimed_by = NULL,
                 claimed_at = NULL,
                 updated_at = ?1
             WHERE status = 'in_progress'
               AND (claimed_by IS NULL
                    OR claimed_by = ?2
                    OR COALESCE(claimed_at, 0) < ?3)",
        )
        .bind(now)
        .bind(self.owner.as_ref())
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Holds an unsynced entry back from passes, or lets it run again.
    /// Returns false when the entry is settled or already in that state.
    pub async fn set_paused(&self, id: i64, paused: bool) -> Result<bool, QueueError> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE queue_entries SET paused = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'in_progress') AND paused <> ?2",
        )
        .bind(id)
        .bind(paused)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry, QueueError> {
    let entity_kind: String = row.try_get("entity_kind")?;
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let attempt_count: i64 = row.try_get("attempt_count")?;
    let dirty: i64 = row.try_get("dirty")?;
    let paused: i64 = row.try_get("paused")?;
    Ok(QueueEntry {
        id: row.try_get("id")?,
        entity_kind: EntityKind::parse(&entity_kind)?,
        operation: Operation::parse(&operation)?,
        payload: row.try_get("payload")?,
        status: EntryStatus::parse(&status)?,
        priority: row.try_get("priority")?,
        dedup_key: row.try_get("dedup_key")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        progress_bytes: row.try_get("progress_bytes")?,
        total_bytes: row.try_get("total_bytes")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        dirty: dirty != 0,
        paused: paused != 0,
    })
}

fn new_owner() -> Arc<str> {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>()).into()
}

pub fn now_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

pub fn default_db_path() -> Result<PathBuf, QueueError> {
    let mut path = dirs::data_dir().ok_or(QueueError::MissingDataDir)?;
    path.push(DB_DIR);
    path.push(DB_FILENAME);
    Ok(path)
}

#[cfg(test)]
#[path = "queue_store_tests.rs"]
mod tests;
