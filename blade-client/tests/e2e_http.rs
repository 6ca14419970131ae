use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use blade_client::{
    Backend, BackendError, BladeClient, ClientConfig, GateOutcome, HttpBackend, MemorySessionStore,
    Timings, UiEvent,
};
use blade_core::{
    AuthPolicy, OutboundFile, PendingFile, PendingFilesResponse, TransferProgress, UploadAnnounce,
};
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::oneshot};

#[derive(Default)]
struct Appliance {
    policy: AuthPolicy,
    files: Vec<(String, Vec<u8>)>,
    announces: Vec<UploadAnnounce>,
    uploads: Vec<(String, String, Option<String>, Vec<u8>)>,
    auth_cache_control: Vec<String>,
    /// Route name and the `t` parameter it was called with.
    cache_busts: Vec<(&'static str, Option<String>)>,
}

type Shared = Arc<Mutex<Appliance>>;

fn listing(app: &Appliance) -> PendingFilesResponse {
    PendingFilesResponse {
        files: app
            .files
            .iter()
            .enumerate()
            .map(|(index, (name, bytes))| PendingFile {
                index: index as u32,
                name: name.clone(),
                size: bytes.len() as u64,
            })
            .collect(),
    }
}

type QueryMap = Query<HashMap<String, String>>;

fn record_cache_bust(app: &Shared, route: &'static str, query: &HashMap<String, String>) {
    app.lock()
        .unwrap()
        .cache_busts
        .push((route, query.get("t").cloned()));
}

async fn heartbeat(State(app): State<Shared>, Query(query): QueryMap) -> StatusCode {
    record_cache_bust(&app, "heartbeat", &query);
    StatusCode::OK
}

async fn auth_config(
    State(app): State<Shared>,
    Query(query): QueryMap,
    headers: HeaderMap,
) -> Json<AuthPolicy> {
    record_cache_bust(&app, "auth-config", &query);
    let mut app = app.lock().unwrap();
    if let Some(value) = headers
        .get("cache-control")
        .and_then(|value| value.to_str().ok())
    {
        app.auth_cache_control.push(value.to_string());
    }
    Json(app.policy.clone())
}

async fn pending_files(
    State(app): State<Shared>,
    Query(query): QueryMap,
) -> Json<PendingFilesResponse> {
    record_cache_bust(&app, "pending-files", &query);
    Json(listing(&app.lock().unwrap()))
}

async fn download(
    State(app): State<Shared>,
    Path((index, name)): Path<(usize, String)>,
) -> Result<Vec<u8>, StatusCode> {
    let mut app = app.lock().unwrap();
    match app.files.get(index) {
        Some((served, _)) if *served == name => Ok(app.files.remove(index).1),
        _ => Err(StatusCode::NOT_FOUND),
    }
}

async fn devices(State(app): State<Shared>, Query(query): QueryMap) -> Json<Value> {
    record_cache_bust(&app, "devices", &query);
    Json(json!({ "devices": ["192.168.4.2", "192.168.4.7"] }))
}

async fn announce(State(app): State<Shared>, Json(body): Json<UploadAnnounce>) -> StatusCode {
    app.lock().unwrap().announces.push(body);
    StatusCode::OK
}

async fn upload(State(app): State<Shared>, mut multipart: Multipart) -> StatusCode {
    while let Ok(Some(field)) = multipart.next_field().await {
        let field_name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let Ok(bytes) = field.bytes().await else {
            return StatusCode::BAD_REQUEST;
        };
        app.lock()
            .unwrap()
            .uploads
            .push((field_name, file_name, content_type, bytes.to_vec()));
    }
    StatusCode::OK
}

async fn start_appliance(app: Shared) -> (String, oneshot::Sender<()>) {
    let router = Router::new()
        .route("/api/heartbeat", get(heartbeat))
        .route("/api/auth-config", get(auth_config))
        .route("/api/pending-files", get(pending_files))
        .route("/api/download/{index}/{name}", get(download))
        .route("/api/connected-devices", get(devices))
        .route("/api/upload/announce", post(announce))
        .route("/api/upload", post(upload))
        .with_state(app);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral appliance socket");
    let address = listener.local_addr().expect("appliance local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let server = axum::serve(listener, router).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{address}"), shutdown_tx)
}

fn appliance_with(files: &[(&str, &[u8])]) -> Shared {
    Arc::new(Mutex::new(Appliance {
        files: files
            .iter()
            .map(|(name, bytes)| ((*name).to_string(), bytes.to_vec()))
            .collect(),
        ..Appliance::default()
    }))
}

#[tokio::test]
async fn every_polled_request_is_cache_busted() {
    let app = appliance_with(&[("a.txt", b"hello")]);
    let (base, shutdown) = start_appliance(app.clone()).await;
    let backend = HttpBackend::new(&base).expect("backend");

    backend.heartbeat().await.expect("heartbeat");
    let policy = backend.auth_config().await.expect("auth config");
    assert!(!policy.auth_enabled);

    let files = backend.pending_files().await.expect("pending files");
    assert_eq!(
        files,
        vec![PendingFile {
            index: 0,
            name: "a.txt".to_string(),
            size: 5
        }]
    );

    let devices = backend.connected_devices().await.expect("devices");
    assert_eq!(devices, vec!["192.168.4.2", "192.168.4.7"]);

    let app = app.lock().unwrap();
    assert_eq!(
        app.auth_cache_control,
        vec!["no-cache, no-store, must-revalidate"]
    );
    let routes: Vec<&str> = app.cache_busts.iter().map(|(route, _)| *route).collect();
    assert_eq!(routes, vec!["heartbeat", "auth-config", "pending-files", "devices"]);
    for (route, t) in &app.cache_busts {
        let t = t.as_deref().unwrap_or_else(|| panic!("{route} sent no t parameter"));
        assert!(t.parse::<u64>().is_ok(), "{route} sent t={t}");
    }
    drop(app);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn download_streams_body_and_reports_progress() {
    let body = vec![7_u8; 100_000];
    let app = appliance_with(&[("skip.bin", b"x"), ("photo 1.jpg", &body)]);
    let (base, shutdown) = start_appliance(app.clone()).await;
    let backend = HttpBackend::new(&base).expect("backend");

    let file = PendingFile {
        index: 1,
        name: "photo 1.jpg".to_string(),
        size: body.len() as u64,
    };
    let seen = Mutex::new(Vec::<TransferProgress>::new());
    let progress = |p: TransferProgress| seen.lock().unwrap().push(p);
    let mut sink = Vec::new();
    let written = backend
        .download(&file, &mut sink, &progress)
        .await
        .expect("download");

    assert_eq!(written, body.len() as u64);
    assert_eq!(sink, body);
    let seen = seen.into_inner().unwrap();
    assert_eq!(seen.first().map(|p| p.transferred), Some(0));
    assert_eq!(seen.last().and_then(TransferProgress::percent), Some(100));

    let err = backend
        .download(&file, &mut Vec::new(), &|_: TransferProgress| {})
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Http { status: 404 }));
    let _ = shutdown.send(());
}

#[tokio::test]
async fn upload_sends_announce_and_multipart_field() {
    let app = appliance_with(&[]);
    let (base, shutdown) = start_appliance(app.clone()).await;
    let backend = HttpBackend::new(&base).expect("backend");

    let file = OutboundFile::new("report.pdf", "application/pdf", vec![1_u8; 200_000]);
    backend
        .announce_upload(&file.announce())
        .await
        .expect("announce");

    let last = Mutex::new(None::<TransferProgress>);
    backend
        .upload(&file, &|p: TransferProgress| *last.lock().unwrap() = Some(p))
        .await
        .expect("upload");
    assert_eq!(
        last.into_inner().unwrap(),
        Some(TransferProgress::complete(200_000))
    );

    let app = app.lock().unwrap();
    assert_eq!(
        app.announces,
        vec![UploadAnnounce {
            filename: "report.pdf".to_string(),
            size: 200_000
        }]
    );
    let (field, name, kind, bytes) = &app.uploads[0];
    assert_eq!(field, "files[]");
    assert_eq!(name, "report.pdf");
    assert_eq!(kind.as_deref(), Some("application/pdf"));
    assert_eq!(bytes.len(), 200_000);
    drop(app);
    let _ = shutdown.send(());
}

#[tokio::test]
async fn client_receives_queued_files_end_to_end() {
    let app = appliance_with(&[("one.txt", b"first"), ("two.txt", b"second")]);
    let (base, shutdown) = start_appliance(app.clone()).await;
    let downloads = tempfile::tempdir().expect("create download dir");

    let mut config = ClientConfig::new(downloads.path());
    config.timings = Timings {
        poll_period: Duration::from_millis(100),
        settle_delay: Duration::from_millis(50),
        ..Timings::default()
    };
    let (ui_tx, mut ui_rx) = tokio::sync::mpsc::unbounded_channel();
    let client = BladeClient::new(
        Arc::new(HttpBackend::new(&base).expect("backend")),
        Arc::new(ui_tx),
        Arc::new(MemorySessionStore::new()),
        config,
    );

    assert_eq!(client.start().await, GateOutcome::Dashboard);

    let mut completed = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while completed.len() < 2 {
        let event = tokio::time::timeout_at(deadline, ui_rx.recv())
            .await
            .expect("downloads finish in time")
            .expect("ui channel open");
        if let UiEvent::IncomingComplete { key, path } = event {
            completed.push((key.name, path));
        }
    }
    client.shutdown();

    assert_eq!(completed[0].0, "one.txt");
    assert_eq!(completed[1].0, "two.txt");
    assert_eq!(std::fs::read(&completed[0].1).expect("read one"), b"first");
    assert_eq!(std::fs::read(&completed[1].1).expect("read two"), b"second");
    assert!(app.lock().unwrap().files.is_empty());
    let _ = shutdown.send(());
}
