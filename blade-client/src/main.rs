use std::{error::Error, path::PathBuf, sync::Arc};

use blade_client::{
    BladeClient, ClientConfig, FileSessionStore, GateOutcome, HttpBackend,
    config::{
        SavedClientConfig, data_dir, default_download_dir, load_saved_config, save_saved_config,
        validate_saved_config,
    },
    console::{ConsoleUi, Credentials},
    files::guess_content_type,
    logging::init_logging,
};
use blade_core::OutboundFile;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "blade", version, about = "Client for a BLADE file-transfer appliance")]
struct BladeArgs {
    /// Appliance base URL, e.g. http://192.168.4.1:8080
    #[arg(long)]
    server_url: Option<String>,

    #[arg(long)]
    username: Option<String>,

    /// Password to use when the appliance asks for a login.
    #[arg(long)]
    password: Option<String>,

    /// Where received files are saved.
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Holds config.json, session.json and logs.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Surface several simultaneous arrivals for one-by-one download instead of
    /// downloading them automatically.
    #[arg(long, default_value_t = false)]
    manual_downloads: bool,

    /// Files to upload once the session is up.
    #[arg(long = "send", value_name = "FILE")]
    send: Vec<PathBuf>,

    /// Persist --server-url, --download-dir and --manual-downloads to config.json.
    #[arg(long, default_value_t = false)]
    save_config: bool,
}

#[tokio::main]
async fn main() {
    let args = BladeArgs::parse();
    let data_dir = args.data_dir.clone().unwrap_or_else(data_dir);
    init_logging(&data_dir);

    if let Err(err) = run(args, data_dir).await {
        error!("{err}");
        eprintln!("blade: {err}");
        std::process::exit(1);
    }
}

fn resolve_config(args: &BladeArgs, data_dir: &std::path::Path) -> Result<SavedClientConfig, Box<dyn Error>> {
    let saved = match load_saved_config(data_dir) {
        Ok(saved) => saved,
        Err(err) => {
            warn!("saved config invalid; ignoring: {err}");
            None
        }
    };

    let server_url = args
        .server_url
        .clone()
        .or_else(|| saved.as_ref().map(|cfg| cfg.server_url.clone()))
        .ok_or("no appliance configured; pass --server-url")?;
    let cfg = SavedClientConfig {
        server_url,
        download_dir: args
            .download_dir
            .clone()
            .or_else(|| saved.as_ref().and_then(|cfg| cfg.download_dir.clone())),
        supports_multi_auto_download: if args.manual_downloads {
            false
        } else {
            saved
                .as_ref()
                .is_none_or(|cfg| cfg.supports_multi_auto_download)
        },
    };
    validate_saved_config(&cfg)?;

    if args.save_config {
        save_saved_config(data_dir, &cfg)?;
        info!("saved config to {}", data_dir.display());
    }
    Ok(cfg)
}

async fn read_outbound(paths: &[PathBuf]) -> Result<Vec<OutboundFile>, Box<dyn Error>> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file.bin")
            .to_string();
        files.push(OutboundFile::new(name, guess_content_type(path), bytes));
    }
    Ok(files)
}

async fn run(args: BladeArgs, data_dir: PathBuf) -> Result<(), Box<dyn Error>> {
    let cfg = resolve_config(&args, &data_dir)?;
    let backend = HttpBackend::new(&cfg.server_url)?;

    let mut config = ClientConfig::new(cfg.download_dir.clone().unwrap_or_else(default_download_dir));
    config.supports_multi_auto_download = cfg.supports_multi_auto_download;
    let credentials = args.password.clone().map(|password| Credentials {
        username: args.username.clone(),
        password,
    });

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let client = BladeClient::new(
        Arc::new(backend),
        Arc::new(ui_tx),
        Arc::new(FileSessionStore::in_dir(&data_dir)),
        config,
    );

    info!(server = %cfg.server_url, "starting");
    match client.start().await {
        GateOutcome::ConnectionError => {
            client.shutdown();
            return Err(format!("could not reach {}", cfg.server_url).into());
        }
        GateOutcome::LoginRequired => {
            let credentials = credentials
                .as_ref()
                .ok_or("appliance requires a login; pass --password")?;
            client.login(credentials.username.as_deref(), &credentials.password)?;
        }
        GateOutcome::Dashboard | GateOutcome::Reconnecting => {}
    }

    // Later login prompts and manual downloads are answered by the console.
    let mut console = tokio::spawn(ConsoleUi::stdout().drive(client.clone(), ui_rx, credentials));

    if !args.send.is_empty() {
        if client.is_authenticated() {
            let files = read_outbound(&args.send).await?;
            client.select_files(files);
            let report = client.send_selected().await?;
            info!(sent = report.sent, failed = report.failed.len(), "send finished");
        } else {
            warn!("appliance not reachable yet; skipping --send");
        }
    }

    let result: Result<(), Box<dyn Error>> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            info!("shutting down");
            signal.map_err(Into::into)
        }
        exit = &mut console => match exit {
            Ok(Err(exit)) => Err(exit.into()),
            Ok(Ok(_)) => Ok(()),
            Err(err) => Err(err.into()),
        },
    };
    console.abort();
    client.shutdown();
    result
}
