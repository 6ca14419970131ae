#![allow(dead_code)]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use blade_client::{
    Backend, BackendError, BladeClient, ClientConfig, MemorySessionStore, SessionStore, UiEvent,
    UiSink, backend::ProgressFn,
};
use blade_core::{
    AuthPolicy, DeviceAddress, OutboundFile, PendingFile, SessionRecord, TransferProgress,
    UploadAnnounce,
};
use tokio::{
    io::AsyncWrite,
    io::AsyncWriteExt,
    sync::{
        Notify,
        mpsc::{self, UnboundedReceiver},
    },
};

/// Scripted appliance. Every knob can be flipped while a client is running.
#[derive(Default)]
pub struct MockBackend {
    pub alive: AtomicBool,
    /// `None` makes the auth-config request fail.
    pub policy: Mutex<Option<AuthPolicy>>,
    pub listing: Mutex<Vec<PendingFile>>,
    pub devices: Mutex<Vec<DeviceAddress>>,
    /// Remove a file from the listing once downloaded and renumber the rest.
    pub dequeue_on_download: AtomicBool,
    pub failing_downloads: Mutex<HashSet<String>>,
    pub failing_uploads: Mutex<HashSet<String>>,
    pub contents: Mutex<HashMap<String, Vec<u8>>>,
    /// When set, downloads wait for a permit before returning.
    pub download_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, each upload waits for a permit before completing.
    pub upload_gate: Mutex<Option<Arc<Notify>>>,

    pub heartbeats: AtomicUsize,
    pub auth_calls: AtomicUsize,
    pub listing_calls: AtomicUsize,
    pub downloads: Mutex<Vec<(u32, String)>>,
    pub announces: Mutex<Vec<UploadAnnounce>>,
    pub uploads: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn open() -> Arc<Self> {
        let backend = Self::default();
        backend.alive.store(true, Ordering::SeqCst);
        *backend.policy.lock().unwrap() = Some(AuthPolicy::default());
        Arc::new(backend)
    }

    pub fn with_password(password: &str) -> Arc<Self> {
        let backend = Self::open();
        *backend.policy.lock().unwrap() = Some(AuthPolicy {
            auth_enabled: true,
            password: Some(password.to_string()),
            ..AuthPolicy::default()
        });
        backend
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_listing(&self, files: &[(&str, u64)]) {
        *self.listing.lock().unwrap() = files
            .iter()
            .enumerate()
            .map(|(index, (name, size))| PendingFile {
                index: index as u32,
                name: (*name).to_string(),
                size: *size,
            })
            .collect();
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    pub fn auth_count(&self) -> usize {
        self.auth_calls.load(Ordering::SeqCst)
    }

    pub fn downloaded(&self) -> Vec<(u32, String)> {
        self.downloads.lock().unwrap().clone()
    }

    pub fn uploaded(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    fn check_alive(&self) -> Result<(), BackendError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Request("connection refused".to_string()))
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn heartbeat(&self) -> Result<(), BackendError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.check_alive()
    }

    async fn auth_config(&self) -> Result<AuthPolicy, BackendError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        self.check_alive()?;
        self.policy
            .lock()
            .unwrap()
            .clone()
            .ok_or(BackendError::Http { status: 500 })
    }

    async fn pending_files(&self) -> Result<Vec<PendingFile>, BackendError> {
        self.listing_calls.fetch_add(1, Ordering::SeqCst);
        self.check_alive()?;
        Ok(self.listing.lock().unwrap().clone())
    }

    async fn connected_devices(&self) -> Result<Vec<DeviceAddress>, BackendError> {
        self.check_alive()?;
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn download(
        &self,
        file: &PendingFile,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        progress: ProgressFn<'_>,
    ) -> Result<u64, BackendError> {
        self.check_alive()?;
        self.downloads
            .lock()
            .unwrap()
            .push((file.index, file.name.clone()));

        let gate = self.download_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        // The appliance serves whatever currently sits at the index.
        let served = self
            .listing
            .lock()
            .unwrap()
            .get(file.index as usize)
            .map(|entry| entry.name.clone());
        if served.as_deref() != Some(file.name.as_str())
            || self.failing_downloads.lock().unwrap().contains(&file.name)
        {
            return Err(BackendError::Http { status: 404 });
        }

        let body = self
            .contents
            .lock()
            .unwrap()
            .get(&file.name)
            .cloned()
            .unwrap_or_else(|| file.name.as_bytes().to_vec());
        let total = body.len() as u64;
        let (head, tail) = body.split_at(body.len() / 2);
        sink.write_all(head).await?;
        progress(TransferProgress::new(head.len() as u64, Some(total)));
        sink.write_all(tail).await?;
        progress(TransferProgress::complete(total));
        sink.flush().await?;

        if self.dequeue_on_download.load(Ordering::SeqCst) {
            let mut listing = self.listing.lock().unwrap();
            listing.retain(|entry| entry.name != file.name);
            for (index, entry) in listing.iter_mut().enumerate() {
                entry.index = index as u32;
            }
        }
        Ok(total)
    }

    async fn announce_upload(&self, announce: &UploadAnnounce) -> Result<(), BackendError> {
        self.check_alive()?;
        self.announces.lock().unwrap().push(announce.clone());
        Ok(())
    }

    async fn upload(&self, file: &OutboundFile, progress: ProgressFn<'_>) -> Result<(), BackendError> {
        self.check_alive()?;
        self.uploads.lock().unwrap().push(file.name.clone());
        let gate = self.upload_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.failing_uploads.lock().unwrap().contains(&file.name) {
            return Err(BackendError::Http { status: 413 });
        }
        progress(TransferProgress::new(file.size() / 2, Some(file.size())));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingUi {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingUi {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&UiEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }
}

impl UiSink for RecordingUi {
    fn emit(&self, event: UiEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub struct Harness {
    pub client: BladeClient,
    pub backend: Arc<MockBackend>,
    pub ui: Arc<RecordingUi>,
    pub store: Arc<MemorySessionStore>,
    pub downloads: tempfile::TempDir,
}

impl Harness {
    pub fn new(backend: Arc<MockBackend>) -> Self {
        Self::build(backend, MemorySessionStore::new(), true)
    }

    pub fn with_session(backend: Arc<MockBackend>, record: SessionRecord) -> Self {
        Self::build(backend, MemorySessionStore::with_record(record), true)
    }

    pub fn manual(backend: Arc<MockBackend>) -> Self {
        Self::build(backend, MemorySessionStore::new(), false)
    }

    fn build(backend: Arc<MockBackend>, store: MemorySessionStore, multi: bool) -> Self {
        let downloads = tempfile::tempdir().expect("create download dir");
        let mut config = ClientConfig::new(downloads.path());
        config.supports_multi_auto_download = multi;
        let ui = Arc::new(RecordingUi::default());
        let store = Arc::new(store);
        let client = BladeClient::new(
            backend.clone(),
            ui.clone(),
            store.clone() as Arc<dyn SessionStore>,
            config,
        );
        Self {
            client,
            backend,
            ui,
            store,
            downloads,
        }
    }
}

/// Client whose UI events arrive on a channel, the way the console consumes them.
pub fn channel_client(
    backend: Arc<MockBackend>,
    multi: bool,
) -> (BladeClient, UnboundedReceiver<UiEvent>, tempfile::TempDir) {
    let downloads = tempfile::tempdir().expect("create download dir");
    let mut config = ClientConfig::new(downloads.path());
    config.supports_multi_auto_download = multi;
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let client = BladeClient::new(
        backend,
        Arc::new(ui_tx),
        Arc::new(MemorySessionStore::new()),
        config,
    );
    (client, ui_rx, downloads)
}

pub fn persisted_session(started_at: u64) -> SessionRecord {
    SessionRecord {
        authenticated: true,
        session_start_time: Some(started_at),
        file_manifest: Vec::new(),
    }
}

pub async fn advance(duration: Duration) {
    tokio::time::sleep(duration).await;
}
