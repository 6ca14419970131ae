//! Sending files: the selection the user builds up and the sequential upload run.

use std::sync::Arc;

use blade_core::{DeclaredFile, FileKey, OutboundFile, TransferProgress};
use tracing::{info, warn};

use crate::{
    backend::bounded,
    runtime::{BladeClient, ClientError},
    ui::{NoticeLevel, UiEvent},
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    pub sent: usize,
    pub failed: Vec<(FileKey, String)>,
}

/// Clears the sending flag however the run ends.
struct SendGuard {
    client: BladeClient,
}

impl Drop for SendGuard {
    fn drop(&mut self) {
        self.client.state().sending = false;
    }
}

impl BladeClient {
    pub fn selected(&self) -> Vec<DeclaredFile> {
        self.state().outbound.manifest()
    }

    /// Adds files to the selection, skipping any already selected (same name and size).
    /// Returns how many were added.
    pub fn select_files(&self, files: Vec<OutboundFile>) -> usize {
        let (added, manifest) = {
            let mut state = self.state();
            let added = state.outbound.extend(files);
            (added, state.outbound.manifest())
        };
        self.emit(UiEvent::Selection(manifest));
        self.persist_session();
        added
    }

    pub fn remove_selected(&self, index: usize) -> Result<OutboundFile, ClientError> {
        let (removed, manifest) = {
            let mut state = self.state();
            let removed = state.outbound.remove(index)?;
            (removed, state.outbound.manifest())
        };
        self.emit(UiEvent::Selection(manifest));
        self.persist_session();
        Ok(removed)
    }

    /// Uploads the current selection one file at a time. A failed file does not stop the
    /// run; the attempted files leave the selection once every one has been tried.
    pub async fn send_selected(&self) -> Result<SendReport, ClientError> {
        let files = {
            let mut state = self.state();
            if state.outbound.is_empty() {
                return Err(ClientError::NothingToSend);
            }
            if state.sending {
                return Err(ClientError::SendInProgress);
            }
            state.sending = true;
            state.outbound.files().to_vec()
        };
        let _sending = SendGuard {
            client: self.clone(),
        };

        let timings = &self.inner.config.timings;
        let mut report = SendReport::default();
        for (index, file) in files.iter().enumerate() {
            let key = file.key();
            info!(file = %key, index, "uploading");

            if let Err(err) = bounded(
                timings.request_timeout,
                self.inner.backend.announce_upload(&file.announce()),
            )
            .await
            {
                warn!(file = %key, error = %err, "upload announce failed; uploading anyway");
            }

            let ui = Arc::clone(&self.inner.ui);
            let progress_key = key.clone();
            let progress = move |progress: TransferProgress| {
                ui.emit(UiEvent::OutgoingProgress {
                    index,
                    key: progress_key.clone(),
                    progress,
                });
            };

            match self.inner.backend.upload(file, &progress).await {
                Ok(()) => {
                    report.sent += 1;
                    self.emit(UiEvent::OutgoingProgress {
                        index,
                        key,
                        progress: TransferProgress::complete(file.size()),
                    });
                }
                Err(err) => {
                    warn!(file = %key, error = %err, "upload failed");
                    self.notify(NoticeLevel::Error, format!("Failed to upload: {}", file.name));
                    report.failed.push((key, err.to_string()));
                }
            }
        }

        let attempted: Vec<FileKey> = files.iter().map(OutboundFile::key).collect();
        let manifest = {
            let mut state = self.state();
            state.outbound.forget(&attempted);
            state.outbound.manifest()
        };
        self.emit(UiEvent::Selection(manifest));
        self.emit(UiEvent::OutgoingFinished {
            sent: report.sent,
            failed: report.failed.len(),
        });
        if report.failed.is_empty() {
            self.notify(NoticeLevel::Success, "All files uploaded!");
        }
        self.persist_session();
        Ok(report)
    }
}
