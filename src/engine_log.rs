//! Engine output capture: a bounded in-memory ring plus a size-capped file.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_LOG_CAP: usize = 500;
const LOG_MAX_BYTES: u64 = 2 * 1024 * 1024;
const LOG_KEEP_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    fn marker(self) -> &'static str {
        match self {
            LogStream::Stdout => "[OUT]",
            LogStream::Stderr => "[ERR]",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

struct Inner {
    ring: VecDeque<String>,
    file: Option<File>,
    written: u64,
}

/// Shared by the reader threads of one engine process. Appends and
/// rotation run under the same lock.
pub struct EngineLog {
    path: PathBuf,
    cap: usize,
    inner: Mutex<Inner>,
}

impl EngineLog {
    pub fn open(path: impl Into<PathBuf>, cap: usize) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            cap: cap.max(1),
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(cap.max(1)),
                file: Some(file),
                written,
            }),
        })
    }

    /// Ring and file see lines in the same order.
    pub fn append(&self, line: &LogLine) {
        let mut guard = self.lock();
        if guard.ring.len() >= self.cap {
            guard.ring.pop_front();
        }
        guard.ring.push_back(line.text.clone());
        self.write_locked(&mut guard, &format!("{} {}", line.stream.marker(), line.text));
    }

    /// Lifecycle markers go to the file only.
    pub fn note(&self, message: &str) {
        let mut guard = self.lock();
        self.write_locked(&mut guard, &format!("[{}] {message}", unix_seconds()));
    }

    pub fn recent(&self) -> Vec<String> {
        self.lock().ring.iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_locked(&self, inner: &mut Inner, entry: &str) {
        let Some(file) = inner.file.as_mut() else {
            return;
        };
        if writeln!(file, "{entry}").is_err() {
            return;
        }
        inner.written += entry.len() as u64 + 1;
        if inner.written <= LOG_MAX_BYTES {
            return;
        }

        // Close our handle while the file is rewritten, then reopen it.
        inner.file = None;
        if let Err(error) = trim_log_file(&self.path, LOG_KEEP_BYTES, LOG_MAX_BYTES) {
            tracing::warn!(%error, "engine log rotation failed");
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                inner.written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
                inner.file = Some(file);
            }
            Err(error) => tracing::warn!(%error, "engine log reopen failed"),
        }
    }
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn trim_log_file(path: &Path, keep_bytes: u64, max_bytes: u64) -> io::Result<bool> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(false),
    };
    let len = meta.len();
    if len <= max_bytes {
        return Ok(false);
    }
    let keep = keep_bytes.min(len);
    let start = len.saturating_sub(keep);
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    // Drop the partial first line.
    let cut = buf
        .iter()
        .position(|b| *b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);

    let mut out = OpenOptions::new().write(true).truncate(true).open(path)?;
    out.write_all(&buf[cut..])?;
    Ok(true)
}

/// Last `limit` lines of a log file; empty if the file does not exist.
pub fn read_tail(path: &Path, limit: usize) -> io::Result<Vec<String>> {
    let limit = limit.max(1);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len == 0 {
        return Ok(Vec::new());
    }

    let mut read_size: u64 = 64 * 1024;
    let mut lines: Vec<String> = Vec::new();
    loop {
        let start = file_len.saturating_sub(read_size);
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let text = String::from_utf8_lossy(&buf);
        lines.clear();
        lines.extend(text.lines().map(|line| line.to_string()));
        if lines.len() > limit || start == 0 {
            break;
        }
        read_size = (read_size * 2).min(file_len);
    }

    if lines.len() > limit {
        lines = lines.split_off(lines.len() - limit);
    }
    Ok(lines)
}
