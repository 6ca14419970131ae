//! The seam between the session runtime and the appliance.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use blade_core::{AuthPolicy, DeviceAddress, OutboundFile, PendingFile, TransferProgress, UploadAnnounce};
use thiserror::Error;
use tokio::io::AsyncWrite;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(String),
    #[error("appliance returned HTTP {status}")]
    Http { status: u16 },
    #[error("response decode failed: {0}")]
    Decode(String),
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Progress callback for a single transfer.
pub type ProgressFn<'a> = &'a (dyn Fn(TransferProgress) + Send + Sync);

/// Every request the client makes against the appliance.
///
/// Implementations do not retry; the runtime owns retry cadence and wraps each call in
/// [`bounded`].
#[async_trait]
pub trait Backend: Send + Sync {
    async fn heartbeat(&self) -> Result<(), BackendError>;

    async fn auth_config(&self) -> Result<AuthPolicy, BackendError>;

    async fn pending_files(&self) -> Result<Vec<PendingFile>, BackendError>;

    async fn connected_devices(&self) -> Result<Vec<DeviceAddress>, BackendError>;

    /// Streams the file body into `sink`, returning the number of bytes written.
    async fn download(
        &self,
        file: &PendingFile,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: ProgressFn<'_>,
    ) -> Result<u64, BackendError>;

    async fn announce_upload(&self, announce: &UploadAnnounce) -> Result<(), BackendError>;

    async fn upload(&self, file: &OutboundFile, progress: ProgressFn<'_>) -> Result<(), BackendError>;
}

/// Runs `fut`, turning an elapsed deadline into [`BackendError::Timeout`].
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BackendError::Timeout(limit))?
}
