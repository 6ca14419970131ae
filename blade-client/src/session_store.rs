use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use blade_core::SessionRecord;
use thiserror::Error;
use tracing::debug;

use crate::files::{replace_file, run_blocking};

/// `session.json` holds a start time and a manifest of file metadata; anything bigger
/// than this is not ours.
pub const MAX_SESSION_BYTES: u64 = 64 * 1024;

pub const SESSION_FILE_NAME: &str = "session.json";

const SAVE_ATTEMPTS: u32 = 3;
const SAVE_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SessionLoadError {
    #[error("cannot read session record {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("session record {path} exceeds {max} bytes")]
    TooLarge { path: PathBuf, max: u64 },
    #[error("session record {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionSaveError {
    #[error("cannot encode session record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cannot write session record {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot remove session record {path}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

/// Durable home of the single [`SessionRecord`].
pub trait SessionStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved.
    fn load(&self) -> Result<Option<SessionRecord>, SessionLoadError>;
    fn save(&self, record: &SessionRecord) -> Result<(), SessionSaveError>;
    fn clear(&self) -> Result<(), SessionSaveError>;
}

/// Reads at most [`MAX_SESSION_BYTES`]; a missing file is `Ok(None)`.
pub fn read_session_record(path: &Path) -> Result<Option<SessionRecord>, SessionLoadError> {
    let read_error = |source| SessionLoadError::Read {
        path: path.to_path_buf(),
        source,
    };
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(read_error(err)),
    };

    let mut data = Vec::new();
    file.take(MAX_SESSION_BYTES + 1)
        .read_to_end(&mut data)
        .map_err(read_error)?;
    if data.len() as u64 > MAX_SESSION_BYTES {
        return Err(SessionLoadError::TooLarge {
            path: path.to_path_buf(),
            max: MAX_SESSION_BYTES,
        });
    }

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| SessionLoadError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

/// Writes `<path>.tmp` and moves it into place, creating the data directory if needed.
pub fn write_session_record(path: &Path, record: &SessionRecord) -> Result<(), SessionSaveError> {
    let payload = serde_json::to_vec_pretty(record)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(write_error(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &payload).map_err(write_error(&tmp))?;
    replace_file(&tmp, path).map_err(write_error(path))
}

fn write_error(path: &Path) -> impl FnOnce(io::Error) -> SessionSaveError {
    let path = path.to_path_buf();
    move |source| SessionSaveError::Write { path, source }
}

fn write_with_retry(path: &Path, record: &SessionRecord) -> Result<(), SessionSaveError> {
    let mut attempt: u32 = 1;
    let mut backoff = SAVE_BACKOFF;
    loop {
        match write_session_record(path, record) {
            Err(err) if attempt < SAVE_ATTEMPTS => {
                debug!(attempt, error = %err, "session save failed; retrying");
                std::thread::sleep(backoff);
                backoff *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionRecord>, SessionLoadError> {
        read_session_record(&self.path)
    }

    /// Retry backoff blocks in place, so other runtime tasks keep running.
    fn save(&self, record: &SessionRecord) -> Result<(), SessionSaveError> {
        run_blocking(|| write_with_retry(&self.path, record))
    }

    fn clear(&self) -> Result<(), SessionSaveError> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(SessionSaveError::Remove {
                path: self.path.clone(),
                source: err,
            }),
            _ => Ok(()),
        }
    }
}

/// Store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    record: Mutex<Option<SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }

    pub fn snapshot(&self) -> Option<SessionRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<SessionRecord>, SessionLoadError> {
        Ok(self.snapshot())
    }

    fn save(&self, record: &SessionRecord) -> Result<(), SessionSaveError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionSaveError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
