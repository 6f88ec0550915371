use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;
use uuid::Uuid;

use crate::app::config::{log_dir, AppConfig};
use crate::app::error::AppError;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }
}

/// One structured event. Immutable once appended; `context` is a free
/// text correlation key, usually a device serial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub context: Option<String>,
    pub text: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = self.level {
            if entry.level != level {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        if let Some(context) = &self.context {
            if entry.context.as_deref() != Some(context.as_str()) {
                return false;
            }
        }
        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !entry.message.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct LogStoreSettings {
    pub dir: PathBuf,
    pub file_prefix: String,
    pub capacity: usize,
    pub min_level: LogLevel,
    pub log_to_file: bool,
    pub max_file_size_bytes: u64,
    pub max_files: usize,
    /// Pending entries that force a flush without waiting for the
    /// periodic flusher.
    pub flush_threshold: usize,
}

impl Default for LogStoreSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("droiddock").join("logs"),
            file_prefix: "droiddock".to_string(),
            capacity: 1000,
            min_level: LogLevel::Info,
            log_to_file: true,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files: 10,
            flush_threshold: 32,
        }
    }
}

impl LogStoreSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dir: log_dir(config),
            file_prefix: config.logging.file_prefix.clone(),
            capacity: config.logging.memory_capacity,
            min_level: LogLevel::parse(&config.logging.log_level).unwrap_or(LogLevel::Info),
            log_to_file: config.logging.log_to_file,
            max_file_size_bytes: config.logging.log_file_size_mb * 1024 * 1024,
            max_files: config.logging.max_log_files,
            flush_threshold: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogStats {
    pub total: usize,
    pub by_level: HashMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

struct Subscriber {
    filter: LogFilter,
    callback: Arc<dyn Fn(&LogEntry) + Send + Sync>,
}

struct Inner {
    ring: VecDeque<LogEntry>,
    pending: Vec<LogEntry>,
    seq: u64,
}

/// Append-only store for structured events: bounded in-memory ring for
/// queries, buffered JSON-lines writer with one file per calendar day,
/// size-based rotation with retention pruning, and live-tail
/// subscriptions. Owns the ring and the on-disk files; producers only
/// ever call the append interface.
pub struct LogStore {
    settings: LogStoreSettings,
    inner: Mutex<Inner>,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    // Serializes file append/rotate/prune so concurrent flushes cannot
    // interleave half-written lines.
    io: Mutex<()>,
}

impl LogStore {
    pub fn new(settings: LogStoreSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                ring: VecDeque::new(),
                pending: Vec::new(),
                seq: 0,
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            io: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &LogStoreSettings {
        &self.settings
    }

    pub fn debug(&self, message: impl Into<String>, data: Option<Value>, context: Option<String>) -> Option<LogEntry> {
        self.append(LogLevel::Debug, message, data, context)
    }

    pub fn info(&self, message: impl Into<String>, data: Option<Value>, context: Option<String>) -> Option<LogEntry> {
        self.append(LogLevel::Info, message, data, context)
    }

    pub fn warn(&self, message: impl Into<String>, data: Option<Value>, context: Option<String>) -> Option<LogEntry> {
        self.append(LogLevel::Warn, message, data, context)
    }

    pub fn error(&self, message: impl Into<String>, data: Option<Value>, context: Option<String>) -> Option<LogEntry> {
        self.append(LogLevel::Error, message, data, context)
    }

    pub fn fatal(&self, message: impl Into<String>, data: Option<Value>, context: Option<String>) -> Option<LogEntry> {
        self.append(LogLevel::Fatal, message, data, context)
    }

    /// Appends one entry; returns it unless the level is below the
    /// configured minimum. Subscribers are notified outside every lock.
    pub fn append(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<Value>,
        context: Option<String>,
    ) -> Option<LogEntry> {
        if level < self.settings.min_level {
            return None;
        }

        let entry;
        let due_batch;
        {
            let mut inner = self.inner.lock().expect("log store poisoned");
            inner.seq += 1;
            let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
            entry = LogEntry {
                id: format!("{:08}-{}", inner.seq, suffix),
                timestamp: Utc::now(),
                level,
                message: message.into(),
                data,
                context,
            };
            inner.ring.push_back(entry.clone());
            while inner.ring.len() > self.settings.capacity {
                inner.ring.pop_front();
            }
            if self.settings.log_to_file {
                inner.pending.push(entry.clone());
            }
            due_batch = if inner.pending.len() >= self.settings.flush_threshold {
                Some(std::mem::take(&mut inner.pending))
            } else {
                None
            };
        }

        self.notify(&entry);
        if let Some(batch) = due_batch {
            self.write_batch(&batch);
        }
        Some(entry)
    }

    fn notify(&self, entry: &LogEntry) {
        let callbacks: Vec<Arc<dyn Fn(&LogEntry) + Send + Sync>> =
            match self.subscribers.lock() {
                Ok(guard) => guard
                    .values()
                    .filter(|subscriber| subscriber.filter.matches(entry))
                    .map(|subscriber| Arc::clone(&subscriber.callback))
                    .collect(),
                Err(_) => return,
            };
        for callback in callbacks {
            callback(entry);
        }
    }

    pub fn subscribe(
        &self,
        filter: LogFilter,
        callback: Arc<dyn Fn(&LogEntry) + Send + Sync>,
    ) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.subscribers.lock() {
            guard.insert(id, Subscriber { filter, callback });
        }
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        match self.subscribers.lock() {
            Ok(mut guard) => guard.remove(&id).is_some(),
            Err(_) => false,
        }
    }

    /// Writes whatever is buffered to the current day file. Called by
    /// the periodic flusher and on shutdown.
    pub fn flush(&self) {
        let batch = {
            let mut inner = self.inner.lock().expect("log store poisoned");
            std::mem::take(&mut inner.pending)
        };
        if !batch.is_empty() {
            self.write_batch(&batch);
        }
    }

    // Disk problems must never bubble up into device operations; they
    // are reported through tracing only.
    fn write_batch(&self, batch: &[LogEntry]) {
        let _io = self.io.lock().expect("log io poisoned");
        if let Err(err) = fs::create_dir_all(&self.settings.dir) {
            warn!(error = %err, "failed to create log directory");
            return;
        }
        let path = self.current_file_path();
        self.rotate_if_oversized(&path);
        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => file,
            Err(err) => {
                warn!(error = %err, "failed to open log file");
                return;
            }
        };
        for entry in batch {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    if let Err(err) = writeln!(file, "{line}") {
                        warn!(error = %err, "failed to write log line");
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "failed to serialize log entry"),
            }
        }
        self.prune_files();
    }

    fn current_file_path(&self) -> PathBuf {
        let day = Utc::now().format("%Y-%m-%d");
        self.settings
            .dir
            .join(format!("{}-{}.log", self.settings.file_prefix, day))
    }

    fn rotate_if_oversized(&self, path: &Path) {
        let Ok(metadata) = fs::metadata(path) else {
            return;
        };
        if metadata.len() < self.settings.max_file_size_bytes {
            return;
        }
        let stamp = Utc::now().format("%H%M%S%3f");
        let rotated = path.with_extension(format!("{stamp}.log"));
        if let Err(err) = fs::rename(path, &rotated) {
            warn!(error = %err, "failed to rotate log file");
        }
    }

    fn prune_files(&self) {
        let mut files = self.list_files();
        if files.len() <= self.settings.max_files {
            return;
        }
        // list_files sorts newest-first; everything past the retention
        // count gets removed.
        for stale in files.split_off(self.settings.max_files) {
            if let Err(err) = fs::remove_file(&stale.path) {
                warn!(error = %err, file = %stale.name, "failed to prune log file");
            }
        }
    }

    /// On-disk log files for this store's prefix, newest first.
    pub fn list_files(&self) -> Vec<LogFileInfo> {
        let Ok(read_dir) = fs::read_dir(&self.settings.dir) else {
            return Vec::new();
        };
        let mut files: Vec<LogFileInfo> = read_dir
            .flatten()
            .filter_map(|dir_entry| {
                let name = dir_entry.file_name().to_string_lossy().to_string();
                if !name.starts_with(&self.settings.file_prefix) || !name.ends_with(".log") {
                    return None;
                }
                let metadata = dir_entry.metadata().ok()?;
                let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
                Some(LogFileInfo {
                    name,
                    path: dir_entry.path(),
                    size_bytes: metadata.len(),
                    modified_at,
                })
            })
            .collect();
        files.sort_by(|a, b| b.name.cmp(&a.name));
        files
    }

    /// Reads one on-disk file back into entries. Lines that do not parse
    /// are skipped; the file name must not contain path separators.
    pub fn read_file(&self, name: &str, trace_id: &str) -> Result<Vec<LogEntry>, AppError> {
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(AppError::validation("Invalid log file name", trace_id));
        }
        let path = self.settings.dir.join(name);
        let file = fs::File::open(&path).map_err(|err| {
            AppError::system(format!("Failed to open log file: {err}"), trace_id)
        })?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|err| {
                AppError::system(format!("Failed to read log file: {err}"), trace_id)
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(error = %err, "skipping unparseable log line"),
            }
        }
        Ok(entries)
    }

    pub fn get_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let inner = self.inner.lock().expect("log store poisoned");
        inner
            .ring
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let inner = self.inner.lock().expect("log store poisoned");
        inner
            .ring
            .iter()
            .rev()
            .take(count)
            .cloned()
            .rev()
            .collect()
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock().expect("log store poisoned");
        let mut by_level: HashMap<String, usize> = HashMap::new();
        for entry in &inner.ring {
            *by_level.entry(entry.level.as_str().to_string()).or_default() += 1;
        }
        LogStats {
            total: inner.ring.len(),
            by_level,
        }
    }

    /// Empties the in-memory ring; on-disk files are untouched.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("log store poisoned");
        inner.ring.clear();
    }

    /// Exports the filtered ring as a JSON array. Returns the number of
    /// entries written.
    pub fn export_json(
        &self,
        path: &Path,
        filter: &LogFilter,
        trace_id: &str,
    ) -> Result<usize, AppError> {
        let entries = self.get_logs(filter);
        let json = serde_json::to_string_pretty(&entries).map_err(|err| {
            AppError::system(format!("Failed to serialize log export: {err}"), trace_id)
        })?;
        fs::write(path, json).map_err(|err| {
            AppError::system(format!("Failed to write log export: {err}"), trace_id)
        })?;
        Ok(entries.len())
    }

    /// Exports the filtered ring as tab-separated text. Message, data
    /// and context columns are JSON-encoded so embedded tabs and
    /// newlines cannot break the row structure.
    pub fn export_delimited(
        &self,
        path: &Path,
        filter: &LogFilter,
        trace_id: &str,
    ) -> Result<usize, AppError> {
        let entries = self.get_logs(filter);
        let mut out = String::from(DELIMITED_HEADER);
        out.push('\n');
        for entry in &entries {
            out.push_str(&delimited_row(entry, trace_id)?);
            out.push('\n');
        }
        fs::write(path, out).map_err(|err| {
            AppError::system(format!("Failed to write log export: {err}"), trace_id)
        })?;
        Ok(entries.len())
    }
}

const DELIMITED_HEADER: &str = "id\ttimestamp\tlevel\tmessage\tdata\tcontext";

fn delimited_row(entry: &LogEntry, trace_id: &str) -> Result<String, AppError> {
    let encode = |value: &str| -> Result<String, AppError> {
        serde_json::to_string(value).map_err(|err| {
            AppError::system(format!("Failed to encode log field: {err}"), trace_id)
        })
    };
    let data = match &entry.data {
        Some(value) => serde_json::to_string(value).map_err(|err| {
            AppError::system(format!("Failed to encode log data: {err}"), trace_id)
        })?,
        None => String::new(),
    };
    let context = match &entry.context {
        Some(value) => encode(value)?,
        None => String::new(),
    };
    Ok(format!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        entry.id,
        entry.timestamp.to_rfc3339(),
        entry.level.as_str(),
        encode(&entry.message)?,
        data,
        context
    ))
}

/// Reads back a JSON export produced by `export_json`.
pub fn read_json_export(path: &Path, trace_id: &str) -> Result<Vec<LogEntry>, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read export: {err}"), trace_id))?;
    serde_json::from_str(&raw)
        .map_err(|err| AppError::system(format!("Failed to parse export: {err}"), trace_id))
}

/// Reads back a delimited export produced by `export_delimited`.
pub fn read_delimited_export(path: &Path, trace_id: &str) -> Result<Vec<LogEntry>, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| AppError::system(format!("Failed to read export: {err}"), trace_id))?;
    let mut lines = raw.lines();
    match lines.next() {
        Some(header) if header == DELIMITED_HEADER => {}
        _ => return Err(AppError::validation("Unrecognized export header", trace_id)),
    }
    let mut entries = Vec::new();
    for (index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() != 6 {
            return Err(AppError::validation(
                format!("Malformed export row {}", index + 2),
                trace_id,
            ));
        }
        let decode = |raw: &str| -> Result<String, AppError> {
            serde_json::from_str(raw).map_err(|err| {
                AppError::validation(format!("Bad export field: {err}"), trace_id)
            })
        };
        let timestamp = DateTime::parse_from_rfc3339(columns[1])
            .map_err(|err| AppError::validation(format!("Bad export timestamp: {err}"), trace_id))?
            .with_timezone(&Utc);
        let level = LogLevel::parse(columns[2])
            .ok_or_else(|| AppError::validation("Bad export level", trace_id))?;
        let data = if columns[4].is_empty() {
            None
        } else {
            Some(serde_json::from_str(columns[4]).map_err(|err| {
                AppError::validation(format!("Bad export data: {err}"), trace_id)
            })?)
        };
        let context = if columns[5].is_empty() {
            None
        } else {
            Some(decode(columns[5])?)
        };
        entries.push(LogEntry {
            id: columns[0].to_string(),
            timestamp,
            level,
            message: decode(columns[3])?,
            data,
            context,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, capacity: usize) -> LogStore {
        LogStore::new(LogStoreSettings {
            dir: dir.path().to_path_buf(),
            file_prefix: "test".to_string(),
            capacity,
            min_level: LogLevel::Debug,
            log_to_file: true,
            max_file_size_bytes: 10 * 1024 * 1024,
            max_files: 10,
            flush_threshold: 1000,
        })
    }

    #[test]
    fn ring_evicts_oldest_beyond_capacity() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 3);
        for index in 0..4 {
            store.info(format!("entry {index}"), None, None);
        }
        let entries = store.get_logs(&LogFilter::default());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 1");
        assert_eq!(entries[2].message, "entry 3");
    }

    #[test]
    fn drops_entries_below_min_level() {
        let dir = TempDir::new().expect("tmp");
        let mut settings = LogStoreSettings::default();
        settings.dir = dir.path().to_path_buf();
        settings.min_level = LogLevel::Warn;
        let store = LogStore::new(settings);
        assert!(store.append(LogLevel::Info, "quiet", None, None).is_none());
        assert!(store.append(LogLevel::Error, "loud", None, None).is_some());
        assert_eq!(store.get_logs(&LogFilter::default()).len(), 1);
    }

    #[test]
    fn ids_are_unique_and_ordered() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 10);
        let first = store.info("one", None, None).expect("entry");
        let second = store.info("two", None, None).expect("entry");
        assert_ne!(first.id, second.id);
        assert!(first.id < second.id);
    }

    #[test]
    fn filters_by_level_context_and_text() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        store.info("device attached", None, Some("serial-1".to_string()));
        store.error("pull failed", None, Some("serial-2".to_string()));
        store.info("poll tick", None, None);

        let by_level = store.get_logs(&LogFilter {
            level: Some(LogLevel::Error),
            ..Default::default()
        });
        assert_eq!(by_level.len(), 1);
        assert_eq!(by_level[0].message, "pull failed");

        let by_context = store.get_logs(&LogFilter {
            context: Some("serial-1".to_string()),
            ..Default::default()
        });
        assert_eq!(by_context.len(), 1);

        let by_text = store.get_logs(&LogFilter {
            text: Some("POLL".to_string()),
            ..Default::default()
        });
        assert_eq!(by_text.len(), 1);
        assert_eq!(by_text[0].message, "poll tick");
    }

    #[test]
    fn flush_writes_json_lines_to_day_file() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        store.info("persisted", Some(json!({"key": "value"})), None);
        store.flush();

        let files = store.list_files();
        assert_eq!(files.len(), 1);
        let day = Utc::now().format("%Y-%m-%d").to_string();
        assert_eq!(files[0].name, format!("test-{day}.log"));

        let entries = store.read_file(&files[0].name, "trace-test").expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "persisted");
        assert_eq!(entries[0].data, Some(json!({"key": "value"})));
    }

    #[test]
    fn threshold_flushes_without_explicit_call() {
        let dir = TempDir::new().expect("tmp");
        let mut settings = LogStoreSettings::default();
        settings.dir = dir.path().to_path_buf();
        settings.file_prefix = "test".to_string();
        settings.min_level = LogLevel::Debug;
        settings.flush_threshold = 2;
        let store = LogStore::new(settings);
        store.info("one", None, None);
        assert!(store.list_files().is_empty());
        store.info("two", None, None);
        assert_eq!(store.list_files().len(), 1);
    }

    #[test]
    fn oversized_file_is_rotated() {
        let dir = TempDir::new().expect("tmp");
        let mut settings = LogStoreSettings::default();
        settings.dir = dir.path().to_path_buf();
        settings.file_prefix = "test".to_string();
        settings.min_level = LogLevel::Debug;
        settings.max_file_size_bytes = 64;
        settings.flush_threshold = 1000;
        let store = LogStore::new(settings);

        store.info("a long enough message to cross the rotation limit", None, None);
        store.flush();
        store.info("second message lands in a fresh file", None, None);
        store.flush();

        let files = store.list_files();
        assert!(
            files.len() >= 2,
            "expected rotation to leave at least 2 files, got {}",
            files.len()
        );
    }

    #[test]
    fn retention_prunes_oldest_files() {
        let dir = TempDir::new().expect("tmp");
        let mut settings = LogStoreSettings::default();
        settings.dir = dir.path().to_path_buf();
        settings.file_prefix = "test".to_string();
        settings.min_level = LogLevel::Debug;
        settings.max_file_size_bytes = 32;
        settings.max_files = 2;
        settings.flush_threshold = 1000;
        let store = LogStore::new(settings);

        for index in 0..5 {
            store.info(format!("message number {index} with some padding"), None, None);
            store.flush();
        }

        assert!(store.list_files().len() <= 2);
    }

    #[test]
    fn json_export_round_trips() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        store.info("hello", Some(json!({"n": 1})), Some("serial-1".to_string()));
        store.warn("watch\tout\nnow", None, None);

        let path = dir.path().join("export.json");
        let written = store
            .export_json(&path, &LogFilter::default(), "trace-test")
            .expect("export");
        assert_eq!(written, 2);

        let restored = read_json_export(&path, "trace-test").expect("read");
        assert_eq!(restored, store.get_logs(&LogFilter::default()));
    }

    #[test]
    fn delimited_export_round_trips() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        store.info("plain message", None, Some("serial-1".to_string()));
        store.error(
            "tabs\tand\nnewlines survive",
            Some(json!({"nested": {"list": [1, 2, 3]}})),
            None,
        );

        let path = dir.path().join("export.tsv");
        let written = store
            .export_delimited(&path, &LogFilter::default(), "trace-test")
            .expect("export");
        assert_eq!(written, 2);

        let restored = read_delimited_export(&path, "trace-test").expect("read");
        assert_eq!(restored, store.get_logs(&LogFilter::default()));
    }

    #[test]
    fn subscribers_receive_matching_entries_only() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let id = store.subscribe(
            LogFilter {
                level: Some(LogLevel::Error),
                ..Default::default()
            },
            Arc::new(move |entry| {
                seen_cb.lock().unwrap().push(entry.message.clone());
            }),
        );

        store.info("ignored", None, None);
        store.error("delivered", None, None);
        assert!(store.unsubscribe(id));
        store.error("after unsubscribe", None, None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.as_slice(), ["delivered"]);
    }

    #[test]
    fn read_file_rejects_path_traversal() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 10);
        let err = store
            .read_file("../outside.log", "trace-test")
            .expect_err("must reject");
        assert_eq!(err.code, "ERR_VALIDATION");
    }

    #[test]
    fn clear_empties_ring_but_keeps_files() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 10);
        store.info("kept on disk", None, None);
        store.flush();
        store.clear();
        assert!(store.get_logs(&LogFilter::default()).is_empty());
        assert_eq!(store.list_files().len(), 1);
    }

    #[test]
    fn stats_count_by_level() {
        let dir = TempDir::new().expect("tmp");
        let store = store_in(&dir, 100);
        store.info("a", None, None);
        store.info("b", None, None);
        store.error("c", None, None);
        let stats = store.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_level.get("INFO"), Some(&2));
        assert_eq!(stats.by_level.get("ERROR"), Some(&1));
    }
}
