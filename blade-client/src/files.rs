use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::now_unix_ms;

const MAX_FILE_NAME_LEN: usize = 128;

pub fn sanitize_file_name(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        return "file.bin".to_string();
    }
    let mut out: String = trimmed
        .chars()
        .map(|ch| match ch {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    if out.len() > MAX_FILE_NAME_LEN {
        let mut cut = MAX_FILE_NAME_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }
    out
}

/// First free path for `safe_name` in `dir`: `name.ext`, then `name (1).ext`, ...
pub fn unique_destination(dir: &Path, safe_name: &str) -> PathBuf {
    let dest = dir.join(safe_name);
    if !dest.exists() {
        return dest;
    }

    let safe_path = Path::new(safe_name);
    let stem = safe_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = safe_path.extension().and_then(|s| s.to_str());
    let with_suffix = |suffix: String| match ext {
        Some(ext) => dir.join(format!("{stem} ({suffix}).{ext}")),
        None => dir.join(format!("{stem} ({suffix})")),
    };

    (1..=200)
        .map(|i| with_suffix(i.to_string()))
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| with_suffix(now_unix_ms().to_string()))
}

/// Content type declared for an outgoing file, from its extension.
pub fn guess_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "log" | "md") => "text/plain",
        Some("csv") => "text/csv",
        Some("html" | "htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("mp4") => "video/mp4",
        Some("mov") => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// Runs blocking file work (including retry sleeps) without stalling the other tasks
/// of a multi-threaded runtime. Elsewhere it simply runs `work`.
pub fn run_blocking<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Moves a fully written `tmp` over `dest`. Readers see either the old or the new file.
pub fn replace_file(tmp: &Path, dest: &Path) -> io::Result<()> {
    clear_destination(dest)?;
    fs::rename(tmp, dest)
}

// Windows refuses to rename onto an existing file.
#[cfg(windows)]
fn clear_destination(dest: &Path) -> io::Result<()> {
    match fs::remove_file(dest) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(not(windows))]
fn clear_destination(_dest: &Path) -> io::Result<()> {
    Ok(())
}
