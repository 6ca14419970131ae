use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod auth;
pub mod liveness;
pub mod outbound;
pub mod reconcile;

pub use auth::{AuthPolicy, GateDecision, PolicyFailureAction};
pub use liveness::{LinkState, LivenessMachine, LivenessPhase, LivenessTransition};
pub use outbound::{OutboundFile, OutboundQueue};
pub use reconcile::{DeliveryPlan, DisplayedRows, ReconcilerPhase, SeenFiles};

pub const HEARTBEAT_PATH: &str = "/api/heartbeat";
pub const AUTH_CONFIG_PATH: &str = "/api/auth-config";
pub const PENDING_FILES_PATH: &str = "/api/pending-files";
pub const DOWNLOAD_PATH_PREFIX: &str = "/api/download";
pub const CONNECTED_DEVICES_PATH: &str = "/api/connected-devices";
pub const UPLOAD_ANNOUNCE_PATH: &str = "/api/upload/announce";
pub const UPLOAD_PATH: &str = "/api/upload";
pub const UPLOAD_FIELD_NAME: &str = "files[]";
pub const CACHE_BUST_PARAM: &str = "t";

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

pub type DeviceAddress = String;
pub type UnixMillis = u64;

/// Identity of a transferred file.
///
/// Server-side indices shift as the pending queue drains, so files are keyed by content
/// metadata instead of position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub name: String,
    pub size: u64,
}

impl FileKey {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.size)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingFile {
    pub index: u32,
    pub name: String,
    pub size: u64,
}

impl PendingFile {
    pub fn key(&self) -> FileKey {
        FileKey::new(self.name.clone(), self.size)
    }

    pub fn matches(&self, key: &FileKey) -> bool {
        self.name == key.name && self.size == key.size
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PendingFilesResponse {
    #[serde(default)]
    pub files: Vec<PendingFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectedDevicesResponse {
    #[serde(default)]
    pub devices: Vec<DeviceAddress>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UploadAnnounce {
    pub filename: String,
    pub size: u64,
}

/// Metadata of a selected file. Payload bytes are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeclaredFile {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// The single durable record kept between runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub authenticated: bool,
    #[serde(default)]
    pub session_start_time: Option<UnixMillis>,
    #[serde(default)]
    pub file_manifest: Vec<DeclaredFile>,
}

/// In-memory session; lives across reconnects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub authenticated: bool,
    pub started_at: Option<UnixMillis>,
}

impl Session {
    /// Restores the start time only; authentication is re-established against the server.
    pub fn resume_from(record: &SessionRecord) -> Self {
        Self {
            authenticated: false,
            started_at: record.session_start_time,
        }
    }

    /// Returns the start time, stamping `now` if the session has none yet.
    pub fn start_clock(&mut self, now: UnixMillis) -> UnixMillis {
        *self.started_at.get_or_insert(now)
    }

    /// Only authenticated sessions are written to durable storage.
    pub fn to_record(&self, manifest: Vec<DeclaredFile>) -> Option<SessionRecord> {
        if !self.authenticated {
            return None;
        }
        Some(SessionRecord {
            authenticated: true,
            session_start_time: self.started_at,
            file_manifest: manifest,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: Option<u64>,
}

impl TransferProgress {
    pub fn new(transferred: u64, total: Option<u64>) -> Self {
        Self { transferred, total }
    }

    pub fn complete(total: u64) -> Self {
        Self {
            transferred: total,
            total: Some(total),
        }
    }

    /// Whole percentage, or `None` when the length is unknown.
    pub fn percent(&self) -> Option<u8> {
        let total = self.total?;
        if total == 0 {
            return Some(100);
        }
        let pct = self.transferred.saturating_mul(100) / total;
        Some(pct.min(100) as u8)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid credentials")]
    CredentialsRejected,
    #[error("authentication is not enabled on this appliance")]
    AuthNotEnabled,
    #[error("declared password digest is not valid hex sha256")]
    InvalidDigest,
    #[error("file {0} is already selected")]
    DuplicateFile(FileKey),
    #[error("no selected file at position {index} (have {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// Formats a session duration as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_elapsed(elapsed_ms: u64) -> String {
    let hours = elapsed_ms / 3_600_000;
    let minutes = (elapsed_ms % 3_600_000) / 60_000;
    let seconds = (elapsed_ms % 60_000) / 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_owned();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}
