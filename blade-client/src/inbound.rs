//! Receiving files: reconciliation passes over the pending-files listing and the
//! downloads they start.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use blade_core::{
    DeliveryPlan, FileKey, PendingFile, TransferProgress,
    reconcile::{find_by_key, new_arrivals, plan_delivery, remap_remaining},
};
use tracing::{debug, info, warn};

use crate::{
    backend::bounded,
    files::{sanitize_file_name, unique_destination},
    runtime::{BladeClient, ClientError},
    ui::{NoticeLevel, ReceiveMode, UiEvent},
};

/// Result of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was in flight.
    Skipped,
    ListingFailed,
    NothingNew,
    /// Files were surfaced for manual download.
    Surfaced(usize),
    Downloaded { completed: usize, failed: usize },
}

/// Holds the reconciler in `Reconciling`; dropping it (including on abort) releases it.
struct PassGuard {
    client: BladeClient,
}

impl PassGuard {
    fn begin(client: &BladeClient) -> Option<Self> {
        client.state().reconciler.try_begin().then(|| Self {
            client: client.clone(),
        })
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.client.state().reconciler.finish();
    }
}

const NO_PERCENT: u8 = u8::MAX;

impl BladeClient {
    /// Fetches the pending listing once and delivers whatever is new.
    pub async fn reconcile_now(&self) -> PassOutcome {
        let Some(_pass) = PassGuard::begin(self) else {
            debug!("reconciliation pass already in flight");
            return PassOutcome::Skipped;
        };

        let timings = &self.inner.config.timings;
        let request = self.inner.backend.pending_files();
        let listing = match bounded(timings.request_timeout, request).await {
            Ok(listing) => listing,
            Err(err) => {
                debug!(error = %err, "failed to check pending files");
                return PassOutcome::ListingFailed;
            }
        };

        let plan = {
            let state = self.state();
            plan_delivery(
                new_arrivals(&listing, &state.seen),
                self.inner.config.supports_multi_auto_download,
            )
        };

        match plan {
            DeliveryPlan::Nothing => PassOutcome::NothingNew,
            DeliveryPlan::Manual(files) => {
                PassOutcome::Surfaced(self.surface_for_manual_download(files))
            }
            DeliveryPlan::Sequential(files) => self.download_sequentially(files).await,
        }
    }

    fn surface_for_manual_download(&self, files: Vec<PendingFile>) -> usize {
        let surfaced: Vec<PendingFile> = {
            let mut state = self.state();
            files
                .into_iter()
                .filter(|file| state.seen.mark(file.key()))
                .collect()
        };
        if surfaced.is_empty() {
            return 0;
        }

        info!(count = surfaced.len(), "files waiting for manual download");
        for file in &surfaced {
            self.emit(UiEvent::IncomingFile {
                file: file.clone(),
                mode: ReceiveMode::Manual,
            });
        }
        self.notify(
            NoticeLevel::Info,
            format!("{} files ready to download. Tap each to download.", surfaced.len()),
        );
        surfaced.len()
    }

    /// One file at a time; between files, wait for the server to dequeue and re-resolve
    /// the remaining files' indices by name and size.
    async fn download_sequentially(&self, files: Vec<PendingFile>) -> PassOutcome {
        let timings = &self.inner.config.timings;
        let mut queue: VecDeque<PendingFile> = files.into();
        let (mut completed, mut failed) = (0, 0);

        while let Some(file) = queue.pop_front() {
            let first_sighting = self.state().seen.mark(file.key());
            if !first_sighting {
                continue;
            }

            match self.download_one(&file).await {
                Ok(_) => completed += 1,
                Err(_) => failed += 1,
            }

            if queue.is_empty() {
                break;
            }

            tokio::time::sleep(timings.settle_delay).await;
            match bounded(timings.request_timeout, self.inner.backend.pending_files()).await {
                Ok(fresh) => {
                    let remaining: Vec<PendingFile> = queue.drain(..).collect();
                    queue = remap_remaining(&remaining, &fresh).into();
                }
                Err(err) => {
                    warn!(error = %err, "failed to refresh pending files; keeping previous indices");
                }
            }
        }

        PassOutcome::Downloaded { completed, failed }
    }

    /// Downloads a file surfaced for manual download. Its current index is looked up
    /// again since earlier downloads may have shifted the queue.
    pub async fn download_surfaced(&self, key: &FileKey) -> Result<PathBuf, ClientError> {
        let Some(_pass) = PassGuard::begin(self) else {
            return Err(ClientError::Busy);
        };

        let timings = &self.inner.config.timings;
        let listing = bounded(timings.request_timeout, self.inner.backend.pending_files()).await?;
        let Some(file) = find_by_key(&listing, key).cloned() else {
            self.notify(NoticeLevel::Error, format!("{} is no longer available", key.name));
            return Err(ClientError::FileNoLongerPending(key.clone()));
        };
        self.state().seen.mark(key.clone());
        self.download_one(&file).await
    }

    async fn download_one(&self, file: &PendingFile) -> Result<PathBuf, ClientError> {
        let key = file.key();
        info!(file = %key, index = file.index, "downloading");
        self.emit(UiEvent::IncomingFile {
            file: file.clone(),
            mode: ReceiveMode::Automatic,
        });
        self.notify(NoticeLevel::Info, format!("Downloading: {}", file.name));

        match self.fetch_to_disk(file).await {
            Ok((path, written)) => {
                info!(file = %key, path = %path.display(), bytes = written, "download complete");
                self.emit(UiEvent::IncomingProgress {
                    key: key.clone(),
                    progress: TransferProgress::complete(written),
                });
                self.emit(UiEvent::IncomingComplete {
                    key,
                    path: path.clone(),
                });
                Ok(path)
            }
            Err(err) => {
                warn!(file = %key, error = %err, "download failed");
                self.emit(UiEvent::IncomingFailed {
                    key,
                    error: err.to_string(),
                });
                self.notify(NoticeLevel::Error, format!("Failed to download: {}", file.name));
                Err(err)
            }
        }
    }

    /// Streams into `<name>.part` and renames to a free name once complete.
    async fn fetch_to_disk(&self, file: &PendingFile) -> Result<(PathBuf, u64), ClientError> {
        let dir = &self.inner.config.download_dir;
        tokio::fs::create_dir_all(dir).await?;
        let safe = sanitize_file_name(&file.name);
        let part_path = dir.join(format!("{safe}.part"));
        let mut out = tokio::fs::File::create(&part_path).await?;

        let ui = Arc::clone(&self.inner.ui);
        let key = file.key();
        let last_percent = AtomicU8::new(NO_PERCENT);
        let progress = move |progress: TransferProgress| {
            let percent = progress.percent().unwrap_or(0);
            if last_percent.swap(percent, Ordering::Relaxed) != percent {
                ui.emit(UiEvent::IncomingProgress {
                    key: key.clone(),
                    progress,
                });
            }
        };

        let result = self.inner.backend.download(file, &mut out, &progress).await;
        drop(out);

        match result {
            Ok(written) => {
                let dest = unique_destination(dir, &safe);
                tokio::fs::rename(&part_path, &dest).await?;
                Ok((dest, written))
            }
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&part_path).await {
                    debug!(error = %remove_err, "failed to remove partial download");
                }
                Err(err.into())
            }
        }
    }
}
