//! Best-effort file logger used when no tracing subscriber is installed.
//!
//! Lines land in `<root>/<yyyyMMdd>/<yyyyMMddHH>.log` so the files rotate
//! by the hour. Writing never fails from the caller's point of view:
//! problems are printed to stderr and dropped.

use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock, PoisonError};

const DEFAULT_ROOT: &str = "../FatalErrors";

static ROOT: OnceLock<PathBuf> = OnceLock::new();
static WRITE_LOCK: Mutex<()> = Mutex::new(());

/// Set the directory fallback files are written under.
///
/// Only the first call takes effect; returns `false` when a root was
/// already set (or a line was already written with the default root).
pub fn set_root(root: impl Into<PathBuf>) -> bool {
    ROOT.set(root.into()).is_ok()
}

/// Directory fallback files are written under
pub fn root() -> &'static Path {
    ROOT.get_or_init(|| PathBuf::from(DEFAULT_ROOT))
}

/// Append one timestamped line to the current hourly file
pub fn write(message: &str) {
    let now = Local::now();
    let path = file_path(root(), &now);

    let _guard = WRITE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = append(&path, &format_line(&now, message)) {
        eprintln!("fallback log write to {} failed: {}", path.display(), e);
    }
}

/// Report a failure through tracing if a subscriber is installed, otherwise to the fallback file
pub fn report(message: &str) {
    if tracing::dispatcher::has_been_set() {
        tracing::error!("{}", message);
    } else {
        write(message);
    }
}

fn file_path(root: &Path, now: &DateTime<Local>) -> PathBuf {
    root.join(now.format("%Y%m%d").to_string())
        .join(format!("{}.log", now.format("%Y%m%d%H")))
}

fn format_line(now: &DateTime<Local>, message: &str) -> String {
    format!("{}::{}\n", now.format("%Y-%m-%d %H:%M:%S%.3f"), message)
}

fn append(path: &Path, line: &str) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}
