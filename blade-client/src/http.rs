use std::time::Duration;

use async_trait::async_trait;
use blade_core::{
    AUTH_CONFIG_PATH, AuthPolicy, CACHE_BUST_PARAM, CONNECTED_DEVICES_PATH, ConnectedDevicesResponse,
    DOWNLOAD_PATH_PREFIX, DeviceAddress, HEARTBEAT_PATH, OutboundFile, PENDING_FILES_PATH, PendingFile,
    PendingFilesResponse, TransferProgress, UPLOAD_ANNOUNCE_PATH, UPLOAD_FIELD_NAME, UPLOAD_PATH,
    UploadAnnounce,
};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use tokio::{io::AsyncWrite, io::AsyncWriteExt, sync::mpsc};
use url::Url;

use crate::{
    backend::{Backend, BackendError, ProgressFn},
    now_unix_ms,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// [`Backend`] speaking the appliance's HTTP API.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base: Url,
    http: reqwest::Client,
    request_timeout: Duration,
    idle_timeout: Duration,
    upload_timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base = normalize_base_url(base_url)?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| BackendError::Request(error.to_string()))?;
        Ok(Self {
            base,
            http,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Longest gap between two body chunks before a download is abandoned.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|error| BackendError::InvalidUrl(error.to_string()))
    }

    /// `endpoint` plus a `t=<unix ms>` parameter so no cache serves a stale answer.
    /// Used for every GET except downloads.
    pub fn cache_busted(&self, path: &str) -> Result<Url, BackendError> {
        let mut url = self.endpoint(path)?;
        url.query_pairs_mut()
            .append_pair(CACHE_BUST_PARAM, &now_unix_ms().to_string());
        Ok(url)
    }

    /// `/api/download/<index>/<percent-encoded name>`.
    pub fn download_url(&self, file: &PendingFile) -> Result<Url, BackendError> {
        let mut url = self.endpoint(DOWNLOAD_PATH_PREFIX)?;
        url.path_segments_mut()
            .map_err(|()| BackendError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .push(&file.index.to_string())
            .push(&file.name);
        Ok(url)
    }

    async fn get_json<T>(&self, url: Url, no_store: bool) -> Result<T, BackendError>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let mut request = self.http.get(url).timeout(self.request_timeout);
        request = if no_store {
            request
                .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(PRAGMA, "no-cache")
                .header(EXPIRES, "0")
        } else {
            request.header(CACHE_CONTROL, "no-cache")
        };
        let response = request.send().await.map_err(request_error)?;
        let response = check_status(response)?;
        let bytes = response.bytes().await.map_err(request_error)?;
        serde_json::from_slice::<T>(&bytes).map_err(|error| BackendError::Decode(error.to_string()))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn heartbeat(&self) -> Result<(), BackendError> {
        let url = self.cache_busted(HEARTBEAT_PATH)?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(request_error)?;
        check_status(response).map(|_| ())
    }

    async fn auth_config(&self) -> Result<AuthPolicy, BackendError> {
        let url = self.cache_busted(AUTH_CONFIG_PATH)?;
        self.get_json(url, true).await
    }

    async fn pending_files(&self) -> Result<Vec<PendingFile>, BackendError> {
        let url = self.cache_busted(PENDING_FILES_PATH)?;
        let listing: PendingFilesResponse = self.get_json(url, false).await?;
        Ok(listing.files)
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceAddress>, BackendError> {
        let url = self.cache_busted(CONNECTED_DEVICES_PATH)?;
        let response: ConnectedDevicesResponse = self.get_json(url, false).await?;
        Ok(response.devices)
    }

    async fn download(
        &self,
        file: &PendingFile,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: ProgressFn<'_>,
    ) -> Result<u64, BackendError> {
        let url = self.download_url(file)?;
        let response = self.http.get(url).send().await.map_err(request_error)?;
        let response = check_status(response)?;

        let total = response.content_length().or(Some(file.size));
        let mut body = response.bytes_stream();
        let mut written = 0_u64;
        progress(TransferProgress::new(0, total));

        loop {
            let next = tokio::time::timeout(self.idle_timeout, body.next())
                .await
                .map_err(|_| BackendError::Timeout(self.idle_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(request_error)?;
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress(TransferProgress::new(written, total));
        }

        sink.flush().await?;
        Ok(written)
    }

    async fn announce_upload(&self, announce: &UploadAnnounce) -> Result<(), BackendError> {
        let url = self.endpoint(UPLOAD_ANNOUNCE_PATH)?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(announce)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response).map(|_| ())
    }

    async fn upload(&self, file: &OutboundFile, progress: ProgressFn<'_>) -> Result<(), BackendError> {
        let url = self.endpoint(UPLOAD_PATH)?;
        let total = file.size();

        // The body stream is 'static, so chunk counts come back over a channel.
        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<u64>();
        let chunks: Vec<Bytes> = file
            .bytes
            .chunks(UPLOAD_CHUNK_BYTES)
            .map(|chunk| file.bytes.slice_ref(chunk))
            .collect();
        let body = futures::stream::iter(chunks.into_iter().map(move |chunk| {
            let _ = sent_tx.send(chunk.len() as u64);
            Ok::<Bytes, std::io::Error>(chunk)
        }));

        let kind = if file.kind.is_empty() {
            "application/octet-stream"
        } else {
            file.kind.as_str()
        };
        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
            .file_name(file.name.clone())
            .mime_str(kind)
            .map_err(request_error)?;
        let form = reqwest::multipart::Form::new().part(UPLOAD_FIELD_NAME, part);

        progress(TransferProgress::new(0, Some(total)));
        let send = self
            .http
            .post(url)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send();
        tokio::pin!(send);

        let mut sent = 0_u64;
        let response = loop {
            tokio::select! {
                result = &mut send => break result,
                Some(len) = sent_rx.recv() => {
                    sent += len;
                    progress(TransferProgress::new(sent, Some(total)));
                }
            }
        };

        check_status(response.map_err(request_error)?)?;
        progress(TransferProgress::complete(total));
        Ok(())
    }
}

fn normalize_base_url(base_url: &str) -> Result<Url, BackendError> {
    let trimmed = base_url.trim();
    let mut url = Url::parse(trimmed)
        .map_err(|error| BackendError::InvalidUrl(format!("{trimmed}: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BackendError::InvalidUrl(format!(
            "{trimmed}: scheme must be http or https"
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(BackendError::Http {
            status: status.as_u16(),
        })
    }
}

fn request_error(error: reqwest::Error) -> BackendError {
    BackendError::Request(error.to_string())
}
