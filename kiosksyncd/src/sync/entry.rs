use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue_store::QueueError;

pub const PRIORITY_CRITICAL: i64 = 1;
pub const PRIORITY_IMPORTANT: i64 = 2;
pub const PRIORITY_OPTIONAL: i64 = 3;

const TABLE_PREFIX: &str = "table:";

/// Logical stream a queue entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Verification,
    Location,
    DeviceStatus,
    GeofenceEvent,
    FileUpload,
    FileDownload,
    /// Generic offline record for a backend table.
    Table(String),
}

impl EntityKind {
    pub fn table(name: &str) -> Result<Self, QueueError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Ok(EntityKind::Table(name.to_string()))
        } else {
            Err(QueueError::InvalidEntityKind(format!("{TABLE_PREFIX}{name}")))
        }
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            EntityKind::Verification => Cow::Borrowed("verification"),
            EntityKind::Location => Cow::Borrowed("location"),
            EntityKind::DeviceStatus => Cow::Borrowed("device_status"),
            EntityKind::GeofenceEvent => Cow::Borrowed("geofence_event"),
            EntityKind::FileUpload => Cow::Borrowed("file_upload"),
            EntityKind::FileDownload => Cow::Borrowed("file_download"),
            EntityKind::Table(name) => Cow::Owned(format!("{TABLE_PREFIX}{name}")),
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueError> {
        match value {
            "verification" => Ok(EntityKind::Verification),
            "location" => Ok(EntityKind::Location),
            "device_status" => Ok(EntityKind::DeviceStatus),
            "geofence_event" => Ok(EntityKind::GeofenceEvent),
            "file_upload" => Ok(EntityKind::FileUpload),
            "file_download" => Ok(EntityKind::FileDownload),
            other => match other.strip_prefix(TABLE_PREFIX) {
                Some(name) => Self::table(name),
                None => Err(QueueError::InvalidEntityKind(other.to_string())),
            },
        }
    }

    pub fn default_priority(&self) -> i64 {
        match self {
            EntityKind::Verification => PRIORITY_CRITICAL,
            EntityKind::Location
            | EntityKind::GeofenceEvent
            | EntityKind::FileUpload
            | EntityKind::Table(_) => PRIORITY_IMPORTANT,
            EntityKind::DeviceStatus | EntityKind::FileDownload => PRIORITY_OPTIONAL,
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self, EntityKind::FileUpload | EntityKind::FileDownload)
    }

    /// Natural unique key, for kinds that collapse unsynced writes.
    pub fn dedup_key(&self, payload: &Value) -> Option<String> {
        let raw = match self {
            EntityKind::Verification => payload.get("contract_number")?,
            EntityKind::FileDownload => payload.get("dest_path")?,
            _ => return None,
        };
        let key = match raw {
            Value::String(value) => value.trim().to_string(),
            Value::Number(value) => value.to_string(),
            _ => return None,
        };
        (!key.is_empty()).then_some(key)
    }

    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Verification => &["contract_number"],
            EntityKind::Location => &["device_id", "latitude", "longitude"],
            EntityKind::DeviceStatus | EntityKind::GeofenceEvent => &["device_id"],
            EntityKind::FileUpload => &["local_path", "upload_url"],
            EntityKind::FileDownload => &["url", "dest_path"],
            EntityKind::Table(_) => &[],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Upload => "upload",
            Operation::Download => "download",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueError> {
        match value.to_ascii_lowercase().as_str() {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "upload" => Ok(Operation::Upload),
            "download" => Ok(Operation::Download),
            _ => Err(QueueError::InvalidOperation(value.to_string())),
        }
    }

    pub fn is_record(&self) -> bool {
        matches!(self, Operation::Insert | Operation::Update | Operation::Delete)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::InProgress => "in_progress",
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::Failed => "failed",
            EntryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QueueError> {
        match value {
            "pending" => Ok(EntryStatus::Pending),
            "in_progress" => Ok(EntryStatus::InProgress),
            "succeeded" => Ok(EntryStatus::Succeeded),
            "failed" => Ok(EntryStatus::Failed),
            "cancelled" => Ok(EntryStatus::Cancelled),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Succeeded | EntryStatus::Failed | EntryStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub operation: Operation,
    /// Serialized JSON body.
    pub payload: String,
    pub status: EntryStatus,
    pub priority: i64,
    pub dedup_key: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub progress_bytes: i64,
    pub total_bytes: Option<i64>,
    pub next_attempt_at: Option<i64>,
    pub dirty: bool,
    /// Held back from passes until resumed.
    pub paused: bool,
}

impl QueueEntry {
    pub fn payload_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    pub fn summary(&self) -> QueueEntrySummary {
        QueueEntrySummary {
            id: self.id,
            entity_kind: self.entity_kind.to_string(),
            operation: self.operation.as_str().to_string(),
            status: self.status.as_str().to_string(),
            priority: self.priority,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            progress_bytes: self.progress_bytes,
            total_bytes: self.total_bytes,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            paused: self.paused,
        }
    }
}

/// What the surrounding app sees in a queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntrySummary {
    pub id: i64,
    pub entity_kind: String,
    pub operation: String,
    pub status: String,
    pub priority: i64,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub progress_bytes: i64,
    pub total_bytes: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    #[serde(default)]
    pub paused: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileUploadPayload {
    pub local_path: PathBuf,
    pub upload_url: String,
    pub mime_type: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDownloadPayload {
    pub url: String,
    pub dest_path: PathBuf,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_md5: Option<String>,
}

pub fn mime_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}
