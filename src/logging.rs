//! Terminal + daily log file output
//!
//! Progress lines go to stdout (errors to stderr) and are mirrored with a
//! timestamp into `paradb-YYYY-MM-DD.log`. Use the `log!`/`elog!` macros.

use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);
static QUIET: AtomicBool = AtomicBool::new(false);

const LOG_PREFIX: &str = "paradb-";
const LOG_RETENTION_DAYS: i64 = 7;

/// Default log directory under the platform data dir
pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("paradb").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// Open today's log file in `log_dir`, removing logs older than a week.
/// Returns the log path, or None if the directory is not writable.
pub fn init_logging(log_dir: &Path) -> Option<PathBuf> {
    if fs::create_dir_all(log_dir).is_err() {
        return None;
    }

    let today = Local::now().date_naive();
    remove_old_logs(log_dir, today);

    let log_path = log_dir.join(log_file_name(today));
    let file = OpenOptions::new().create(true).append(true).open(&log_path).ok()?;
    if let Ok(mut guard) = LOG_FILE.lock() {
        *guard = Some(file);
    }
    Some(log_path)
}

/// Silence terminal output; the log file still receives everything
pub fn set_quiet(quiet: bool) {
    QUIET.store(quiet, Ordering::Relaxed);
}

fn log_file_name(date: NaiveDate) -> String {
    format!("{}{}.log", LOG_PREFIX, date.format("%Y-%m-%d"))
}

fn remove_old_logs(log_dir: &Path, today: NaiveDate) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    let cutoff = today - chrono::Duration::days(LOG_RETENTION_DAYS);
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let date = name
            .strip_prefix(LOG_PREFIX)
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok());
        if let Some(date) = date {
            if date < cutoff {
                let _ = fs::remove_file(&path);
            }
        }
    }
}

fn write_file(line: &str) {
    if let Ok(mut guard) = LOG_FILE.lock() {
        if let Some(ref mut file) = *guard {
            let _ = writeln!(file, "[{}] {}", Local::now().format("%H:%M:%S"), line);
        }
    }
}

/// Log to both terminal and file
pub fn log_both(msg: &str) {
    if !QUIET.load(Ordering::Relaxed) {
        println!("{}", msg);
    }
    write_file(msg);
}

/// Log error to both terminal and file
pub fn elog_both(msg: &str) {
    if !QUIET.load(Ordering::Relaxed) {
        eprintln!("{}", msg);
    }
    write_file(&format!("[ERROR] {}", msg));
}

/// Log to both terminal and file
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {
        $crate::logging::log_both(&format!($($arg)*))
    };
}

/// Error logging to both terminal and file
#[macro_export]
macro_rules! elog {
    ($($arg:tt)*) => {
        $crate::logging::elog_both(&format!($($arg)*))
    };
}
