use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use blade_core::DEFAULT_FAILURE_THRESHOLD;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::files::replace_file;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const MAX_SERVER_URL_LEN: usize = 2048;
pub const MAX_PATH_LEN: usize = 4096;

/// Every period and deadline the runtime uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub heartbeat_period: Duration,
    pub heartbeat_timeout: Duration,
    pub failure_threshold: u32,
    pub reconnect_period: Duration,
    pub reconnect_timeout: Duration,
    pub poll_period: Duration,
    /// Pause between sequential downloads so the server can dequeue the previous file.
    pub settle_delay: Duration,
    pub devices_period: Duration,
    pub policy_timeout: Duration,
    pub request_timeout: Duration,
    pub clock_period: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            heartbeat_period: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_millis(2_500),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reconnect_period: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(4),
            poll_period: Duration::from_secs(2),
            settle_delay: Duration::from_secs(1),
            devices_period: Duration::from_secs(3),
            policy_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            clock_period: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub download_dir: PathBuf,
    /// Whether several downloads may be started without a user gesture.
    pub supports_multi_auto_download: bool,
    pub timings: Timings,
}

impl ClientConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            supports_multi_auto_download: true,
            timings: Timings::default(),
        }
    }
}

/// What `config.json` in the data dir holds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedClientConfig {
    pub server_url: String,
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    #[serde(default = "default_multi_auto_download")]
    pub supports_multi_auto_download: bool,
}

fn default_multi_auto_download() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub fn validate_saved_config(cfg: &SavedClientConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    let server_url = cfg.server_url.trim();
    if server_url.is_empty() {
        errors.push("Server URL is required.".to_string());
    } else if server_url.len() > MAX_SERVER_URL_LEN {
        errors.push(format!(
            "Server URL is too long ({} > {} chars).",
            server_url.len(),
            MAX_SERVER_URL_LEN
        ));
    } else {
        match Url::parse(server_url) {
            Ok(url) => {
                let scheme = url.scheme();
                if scheme != "http" && scheme != "https" {
                    errors.push("Server URL must start with http:// or https://.".to_string());
                }
            }
            Err(err) => {
                errors.push(format!("Server URL is invalid: {err}"));
            }
        }
    }

    if let Some(dir) = &cfg.download_dir {
        let len = dir.as_os_str().len();
        if len == 0 {
            errors.push("Download directory must not be empty.".to_string());
        } else if len > MAX_PATH_LEN {
            errors.push(format!(
                "Download directory is too long ({len} > {MAX_PATH_LEN} chars)."
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "Please fix the following:\n\n- {}",
            errors.join("\n- ")
        )))
    }
}

/// Where config, session and logs live.
///
/// `BLADE_DATA_DIR` wins, then `$XDG_DATA_HOME/blade`, then `~/.local/share/blade`.
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("BLADE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    if let Some(xdg) = std::env::var_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg).join("blade");
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".local").join("share").join("blade");
    }
    PathBuf::from(".blade")
}

pub fn default_download_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(|home| PathBuf::from(home).join("Downloads").join("BLADE"))
        .unwrap_or_else(|| data_dir().join("downloads"))
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

pub fn load_saved_config(data_dir: &Path) -> Result<Option<SavedClientConfig>, ConfigError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }

    let data = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;

    let cfg: SavedClientConfig =
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

    validate_saved_config(&cfg)?;
    Ok(Some(cfg))
}

pub fn save_saved_config(data_dir: &Path, cfg: &SavedClientConfig) -> Result<(), ConfigError> {
    validate_saved_config(cfg)?;

    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 50;

    std::fs::create_dir_all(data_dir).map_err(|source| ConfigError::Write {
        path: data_dir.to_path_buf(),
        source,
    })?;
    let path = config_path(data_dir);
    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_string_pretty(cfg)?;

    let mut attempt = 1;
    loop {
        let result = std::fs::write(&tmp_path, payload.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: tmp_path.clone(),
                source,
            })
            .and_then(|()| {
                replace_file(&tmp_path, &path).map_err(|source| ConfigError::Write {
                    path: path.clone(),
                    source,
                })
            });

        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt >= MAX_ATTEMPTS => return Err(err),
            Err(_) => {
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}
