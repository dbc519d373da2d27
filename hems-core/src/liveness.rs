//! Liveness files: touched on activity, checked by `healthz`.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Update a liveness file, creating it and its directory if needed.
///
/// The content is the Unix time of the touch; only the mtime is checked.
pub fn touch(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    fs::write(path, now.to_string())
}

/// Seconds since the file was last touched; `None` if it does not exist.
pub fn age(path: &Path) -> Option<u64> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().map(|d| d.as_secs()).unwrap_or(0))
}

/// True if the file was touched within `interval` seconds.
pub fn is_fresh(path: &Path, interval: u64) -> bool {
    age(path).is_some_and(|a| a <= interval)
}
