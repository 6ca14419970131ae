use std::{
    io::{self, Write},
    time::Duration,
};

use blade_core::{DisplayedRows, FileKey, format_file_size};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    runtime::{BladeClient, ClientError},
    ui::{NoticeLevel, ReceiveMode, UiEvent},
};

/// Wait before asking again when a reconciliation pass holds the downloader.
const MANUAL_RETRY: Duration = Duration::from_millis(250);

/// What the console answers a login prompt with.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: String,
}

/// Why [`ConsoleUi::drive`] gave up.
#[derive(Debug, Error)]
pub enum ConsoleExit {
    #[error("appliance requires a login; pass --password")]
    LoginRequired,
    #[error("login rejected: {0}")]
    LoginRejected(#[source] ClientError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowStatus {
    Waiting,
    InProgress(Option<u8>),
    Saved(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRow {
    pub name: String,
    pub size: u64,
    pub mode: ReceiveMode,
    pub status: RowStatus,
}

/// Line-oriented renderer for the `blade` binary.
pub struct ConsoleUi<W> {
    out: W,
    rows: DisplayedRows<IncomingRow>,
    clock: String,
}

impl ConsoleUi<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsoleUi<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            rows: DisplayedRows::new(),
            clock: "00:00:00".to_string(),
        }
    }

    pub fn rows(&self) -> &DisplayedRows<IncomingRow> {
        &self.rows
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Renders events until the channel closes and acts on the ones that need an
    /// answer: files surfaced for manual download are fetched one at a time, and a login
    /// prompt is answered with `credentials` unless the session is already up.
    pub async fn drive(
        mut self,
        client: BladeClient,
        mut events: mpsc::UnboundedReceiver<UiEvent>,
        credentials: Option<Credentials>,
    ) -> Result<Self, ConsoleExit> {
        let (manual_tx, manual_rx) = mpsc::unbounded_channel();
        let downloader = tokio::spawn(download_in_order(client.clone(), manual_rx));

        let outcome = loop {
            let Some(event) = events.recv().await else {
                break Ok(());
            };
            if let Err(err) = self.render(&event) {
                debug!(error = %err, "console write failed");
            }
            match event {
                UiEvent::IncomingFile {
                    file,
                    mode: ReceiveMode::Manual,
                } => {
                    let _ = manual_tx.send(file.key());
                }
                UiEvent::LoginRequired if !client.is_authenticated() => {
                    let Some(credentials) = &credentials else {
                        break Err(ConsoleExit::LoginRequired);
                    };
                    info!("appliance asked for a login; answering");
                    if let Err(err) =
                        client.login(credentials.username.as_deref(), &credentials.password)
                    {
                        break Err(ConsoleExit::LoginRejected(err));
                    }
                }
                _ => {}
            }
        };

        downloader.abort();
        outcome.map(|()| self)
    }

    pub fn render(&mut self, event: &UiEvent) -> io::Result<()> {
        match event {
            UiEvent::Link(link) => writeln!(self.out, "[{}] {}", self.clock, link.label()),
            // Printing every second would drown everything else.
            UiEvent::SessionClock(elapsed) => {
                self.clock.clone_from(elapsed);
                Ok(())
            }
            UiEvent::LoginRequired => writeln!(self.out, "login required"),
            UiEvent::ConnectionError(message) => writeln!(self.out, "error: {message}"),
            UiEvent::Dashboard => writeln!(self.out, "[{}] session ready", self.clock),
            UiEvent::Devices(devices) => {
                if devices.is_empty() {
                    writeln!(self.out, "no devices connected")
                } else {
                    writeln!(self.out, "devices: {}", devices.join(", "))
                }
            }
            UiEvent::IncomingFile { file, mode } => {
                let key = file.key();
                let added = self.rows.insert_once(&key, || IncomingRow {
                    name: file.name.clone(),
                    size: file.size,
                    mode: *mode,
                    status: RowStatus::Waiting,
                });
                if let Some(row) = self.rows.get_mut(&key) {
                    row.mode = *mode;
                }
                if added && *mode == ReceiveMode::Manual {
                    writeln!(
                        self.out,
                        "ready: {} ({})",
                        file.name,
                        format_file_size(file.size)
                    )
                } else {
                    Ok(())
                }
            }
            UiEvent::IncomingProgress { key, progress } => {
                self.update_row(key, RowStatus::InProgress(progress.percent()));
                Ok(())
            }
            UiEvent::IncomingComplete { key, path } => {
                self.update_row(key, RowStatus::Saved(path.display().to_string()));
                writeln!(self.out, "received: {} -> {}", key.name, path.display())
            }
            UiEvent::IncomingFailed { key, error } => {
                self.update_row(key, RowStatus::Failed(error.clone()));
                writeln!(self.out, "failed: {} ({error})", key.name)
            }
            UiEvent::Selection(files) => {
                if files.is_empty() {
                    Ok(())
                } else {
                    let total: u64 = files.iter().map(|file| file.size).sum();
                    writeln!(
                        self.out,
                        "selected {} file(s), {}",
                        files.len(),
                        format_file_size(total)
                    )
                }
            }
            UiEvent::OutgoingProgress { key, progress, .. } => match progress.percent() {
                Some(100) => writeln!(self.out, "sent: {}", key.name),
                _ => Ok(()),
            },
            UiEvent::OutgoingFinished { sent, failed } => {
                writeln!(self.out, "upload finished: {sent} sent, {failed} failed")
            }
            UiEvent::Notice { level, message } => match level {
                NoticeLevel::Error => writeln!(self.out, "error: {message}"),
                NoticeLevel::Info | NoticeLevel::Success => Ok(()),
            },
        }
    }

    fn update_row(&mut self, key: &FileKey, status: RowStatus) {
        if let Some(row) = self.rows.get_mut(key) {
            row.status = status;
        }
    }
}

async fn download_in_order(client: BladeClient, mut keys: mpsc::UnboundedReceiver<FileKey>) {
    while let Some(key) = keys.recv().await {
        loop {
            match client.download_surfaced(&key).await {
                Err(ClientError::Busy) => tokio::time::sleep(MANUAL_RETRY).await,
                Err(err) => {
                    warn!(file = %key, error = %err, "manual download failed");
                    break;
                }
                Ok(_) => break,
            }
        }
    }
}
