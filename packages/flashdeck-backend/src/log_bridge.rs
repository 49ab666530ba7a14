/// Logger for the terminal shell.
///
/// stdout belongs to the study shell, so records never go to the console:
/// they are filtered through env_logger (`RUST_LOG`, default `warn`),
/// appended to ~/.config/flashdeck/logs/backend.log, and kept in a bounded
/// in-memory ring that the shell's `log` command prints.
use env_logger::{Logger, Target};
use log::{Log, Metadata, Record, SetLoggerError};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

const MAX_LOG_ENTRIES: usize = 500;

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp_ms: u64,
    pub level: String,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    fn now(level: &str, target: &str, message: &str) -> Self {
        Self {
            timestamp_ms: std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            level: level.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        }
    }
}

struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, entry: LogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push_back(entry);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
        }
    }

    fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }
}

static LOG_RING: LazyLock<LogRing> = LazyLock::new(|| LogRing::new(MAX_LOG_ENTRIES));

/// A log grown past this is moved to `backend.log.1` when the shell starts.
const MAX_LOG_FILE_BYTES: u64 = 1024 * 1024;

/// Append-only log file, opened on first write.
struct LogFile {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LogFile {
    fn at(path: PathBuf) -> Self {
        if let Err(e) = rotate_if_large(&path, MAX_LOG_FILE_BYTES) {
            eprintln!("flashdeck: log rotation failed for {}: {}", path.display(), e);
        }
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    fn write_line(&self, line: &str) {
        let Ok(mut guard) = self.file.lock() else {
            return;
        };
        if guard.is_none() {
            let opened = self.path.parent().map_or(Ok(()), fs::create_dir_all).and_then(|_| {
                OpenOptions::new().create(true).append(true).open(&self.path)
            });
            match opened {
                Ok(file) => *guard = Some(file),
                Err(_) => return,
            }
        }
        if let Some(file) = guard.as_mut() {
            if writeln!(file, "{}", line).and_then(|_| file.flush()).is_err() {
                // Reopen on the next record, e.g. after the file was deleted.
                *guard = None;
            }
        }
    }

    fn append(&self, entry: &LogEntry) {
        self.write_line(&format_log_line(entry));
    }
}

/// Move `path` to `<path>.1` if it has grown past `limit` bytes.
fn rotate_if_large(path: &Path, limit: u64) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(meta) if meta.len() > limit => {
            let mut rotated = path.as_os_str().to_owned();
            rotated.push(".1");
            fs::rename(path, PathBuf::from(rotated))?;
            Ok(true)
        }
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn default_log_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flashdeck")
        .join("logs")
        .join("backend.log")
}

static LOG_FILE: LazyLock<LogFile> = LazyLock::new(|| LogFile::at(default_log_path()));

pub fn format_log_line(entry: &LogEntry) -> String {
    format!(
        "{} [{}] [{}] {}",
        entry.timestamp_ms,
        entry.level.to_uppercase(),
        entry.target,
        entry.message.replace('\n', "\\n")
    )
}

struct ShellLogger {
    inner: Logger,
}

impl Log for ShellLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = LogEntry::now(
            &record.level().to_string().to_lowercase(),
            record.target(),
            &record.args().to_string(),
        );
        LOG_FILE.append(&entry);
        LOG_RING.push(entry);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

pub fn init() -> Result<(), SetLoggerError> {
    LOG_FILE.write_line(&format!(
        "--- flashdeck {} session started ---",
        env!("CARGO_PKG_VERSION")
    ));
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    builder.target(Target::Pipe(Box::new(io::sink())));
    let inner = builder.build();
    let max_level = inner.filter();
    let logger = Box::leak(Box::new(ShellLogger { inner }));
    log::set_logger(logger)?;
    log::set_max_level(max_level);
    Ok(())
}

/// Most recent `limit` entries, oldest first.
pub fn recent_entries(limit: usize) -> Vec<LogEntry> {
    LOG_RING.recent(limit)
}

pub fn log_file_path() -> String {
    LOG_FILE.path.display().to_string()
}

/// Record a line when the logger itself could not be installed.
pub fn write_fallback_line(message: &str) {
    let entry = LogEntry::now("error", "flashdeck.log_bridge", message);
    LOG_FILE.append(&entry);
    LOG_RING.push(entry);
}
