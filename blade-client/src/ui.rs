use std::path::PathBuf;

use blade_core::{DeclaredFile, DeviceAddress, FileKey, LinkState, PendingFile, TransferProgress};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// The client downloads the file itself.
    Automatic,
    /// The user has to start the download (one row with a button per file).
    Manual,
}

/// State transitions the runtime publishes for whatever renders them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Link(LinkState),
    SessionClock(String),
    LoginRequired,
    ConnectionError(String),
    Dashboard,
    Devices(Vec<DeviceAddress>),
    IncomingFile {
        file: PendingFile,
        mode: ReceiveMode,
    },
    IncomingProgress {
        key: FileKey,
        progress: TransferProgress,
    },
    IncomingComplete {
        key: FileKey,
        path: PathBuf,
    },
    IncomingFailed {
        key: FileKey,
        error: String,
    },
    Selection(Vec<DeclaredFile>),
    OutgoingProgress {
        index: usize,
        key: FileKey,
        progress: TransferProgress,
    },
    OutgoingFinished {
        sent: usize,
        failed: usize,
    },
    Notice {
        level: NoticeLevel,
        message: String,
    },
}

impl UiEvent {
    pub fn notice(level: NoticeLevel, message: impl Into<String>) -> Self {
        UiEvent::Notice {
            level,
            message: message.into(),
        }
    }
}

pub trait UiSink: Send + Sync {
    fn emit(&self, event: UiEvent);
}

// A closed receiver means nobody is rendering anymore; events are dropped.
impl UiSink for mpsc::UnboundedSender<UiEvent> {
    fn emit(&self, event: UiEvent) {
        let _ = self.send(event);
    }
}

impl UiSink for std::sync::mpsc::Sender<UiEvent> {
    fn emit(&self, event: UiEvent) {
        let _ = self.send(event);
    }
}
