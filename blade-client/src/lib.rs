use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod backend;
pub mod config;
pub mod console;
pub mod files;
pub mod http;
pub mod inbound;
pub mod logging;
pub mod outbound;
pub mod runtime;
pub mod session_store;
pub mod ui;

pub use backend::{Backend, BackendError};
pub use config::{ClientConfig, Timings};
pub use http::HttpBackend;
pub use inbound::PassOutcome;
pub use outbound::SendReport;
pub use runtime::{BladeClient, ClientError, GateOutcome};
pub use session_store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use ui::{NoticeLevel, ReceiveMode, UiEvent, UiSink};

pub fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as u64
}
