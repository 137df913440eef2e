// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered NDJSON file sink for processed records.
//!
//! Entries are buffered in memory and flushed when the buffer fills, when the periodic
//! flush task ticks, and on [`JsonWriter::close`]. Before each flush the file is rotated
//! to `<path>.1` once it has reached the configured size.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::record::{KeyValue, LogRecord, Resource};
use crate::routing::Route;

pub const DEFAULT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
pub const ROTATED_SUFFIX: &str = ".1";
/// Entries kept across failed flushes, in multiples of the buffer size.
const MAX_RETAINED_BUFFERS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Failed to open output file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write output file: {0}")]
    Io(#[from] io::Error),
    #[error("Output writer is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingInfo {
    pub index: String,
    pub rule: String,
}

/// JSON projection of one processed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEntry {
    pub timestamp: String,
    pub severity: String,
    pub severity_number: i32,
    pub body: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_attributes: BTreeMap<String, String>,
    pub routing: RoutingInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub transforms_applied: Vec<String>,
}

impl OutputEntry {
    pub fn new(
        resource: &Resource,
        record: &LogRecord,
        route: Route<'_>,
        transforms_applied: Vec<String>,
    ) -> Self {
        let time = if record.time_unix_nano == 0 {
            record.observed_time_unix_nano
        } else {
            record.time_unix_nano
        };
        Self {
            timestamp: format_timestamp(time),
            severity: record.severity_display().to_string(),
            severity_number: record.severity.number(),
            body: record.body_text(),
            attributes: flatten(&record.attributes),
            resource_attributes: flatten(&resource.attributes),
            routing: RoutingInfo {
                index: route.index.to_string(),
                rule: route.rule.to_string(),
            },
            transforms_applied,
        }
    }
}

/// Later duplicates win.
fn flatten(attributes: &[KeyValue]) -> BTreeMap<String, String> {
    attributes
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.to_string()))
        .collect()
}

/// RFC 3339 in UTC with nanosecond precision.
pub fn format_timestamp(unix_nano: u64) -> String {
    let secs = (unix_nano / 1_000_000_000) as i64;
    let nanos = (unix_nano % 1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct JsonWriterConfig {
    pub path: PathBuf,
    /// Entries buffered before a size-triggered flush.
    pub buffer_size: usize,
    pub flush_interval: Duration,
    /// Rotation threshold in bytes. 0 disables rotation.
    pub max_file_size: u64,
}

impl JsonWriterConfig {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            buffer_size: DEFAULT_BUFFER_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

#[derive(Debug)]
struct WriterState {
    buffer: Vec<OutputEntry>,
    /// `None` once closed.
    file: Option<File>,
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    rotated_path: PathBuf,
    buffer_size: usize,
    max_file_size: u64,
    state: Mutex<WriterState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self) -> Result<usize, OutputError> {
        let mut state = self.lock();
        self.flush_locked(&mut state)
    }

    /// Flushes and releases the file. `None` when already closed. On a failed flush the
    /// file and the buffer are kept so that a later close can retry.
    fn close(&self) -> Result<Option<usize>, OutputError> {
        let mut state = self.lock();
        if state.file.is_none() {
            return Ok(None);
        }
        let written = self.flush_locked(&mut state)?;
        state.file = None;
        Ok(Some(written))
    }

    /// Caller holds the state lock. The buffer is only cleared once the payload is on
    /// disk; after a failure the entries stay buffered for the next flush.
    fn flush_locked(&self, state: &mut WriterState) -> Result<usize, OutputError> {
        if state.buffer.is_empty() {
            return Ok(0);
        }
        if state.file.is_none() {
            return Err(OutputError::Closed);
        }
        self.rotate_if_needed(state);

        let mut payload = Vec::with_capacity(state.buffer.len() * 256);
        let mut written = 0;
        for entry in &state.buffer {
            match serde_json::to_vec(entry) {
                Ok(line) => {
                    payload.extend_from_slice(&line);
                    payload.push(b'\n');
                    written += 1;
                }
                Err(e) => warn!("Skipping output entry that failed to serialize: {e}"),
            }
        }

        let file = state.file.as_mut().ok_or(OutputError::Closed)?;
        if let Err(e) = file.write_all(&payload).and_then(|()| file.sync_all()) {
            self.trim_retained(state);
            return Err(e.into());
        }
        state.buffer.clear();
        debug!("Flushed {written} entries to {}", self.path.display());
        Ok(written)
    }

    /// Drops the oldest entries once repeated failures have piled up too many.
    fn trim_retained(&self, state: &mut WriterState) {
        let limit = self.buffer_size.saturating_mul(MAX_RETAINED_BUFFERS);
        if state.buffer.len() > limit {
            let excess = state.buffer.len() - limit;
            state.buffer.drain(..excess);
            warn!(
                "Dropped {excess} buffered entries for {} after repeated flush failures",
                self.path.display()
            );
        }
    }

    /// Renames a full file to `<path>.1` and reopens `<path>`. Any failure is logged and
    /// the current handle stays in use.
    fn rotate_if_needed(&self, state: &mut WriterState) {
        if self.max_file_size == 0 {
            return;
        }
        let Some(file) = state.file.as_ref() else {
            return;
        };
        let size = match file.metadata() {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                warn!("Unable to stat output file {}: {e}", self.path.display());
                return;
            }
        };
        if size < self.max_file_size {
            return;
        }

        if let Err(e) = std::fs::rename(&self.path, &self.rotated_path) {
            warn!(
                "Failed to rotate output file {} to {}: {e}",
                self.path.display(),
                self.rotated_path.display()
            );
            return;
        }
        match open_append(&self.path) {
            Ok(new_file) => {
                state.file = Some(new_file);
                info!(
                    "Rotated output file {} ({size} bytes) to {}",
                    self.path.display(),
                    self.rotated_path.display()
                );
            }
            Err(e) => warn!(
                "Failed to reopen output file after rotation, continuing with {}: {e}",
                self.rotated_path.display()
            ),
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path) -> PathBuf {
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(ROTATED_SUFFIX);
    PathBuf::from(rotated)
}

/// Buffered, rotating NDJSON writer with a background periodic flush.
#[derive(Debug)]
pub struct JsonWriter {
    inner: Arc<Inner>,
    cancel_token: CancellationToken,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl JsonWriter {
    /// Opens (or creates) the output file in append mode and starts the periodic flush
    /// task. Must be called from within a Tokio runtime.
    pub fn open(config: JsonWriterConfig) -> Result<Self, OutputError> {
        let file = open_append(&config.path).map_err(|source| OutputError::Open {
            path: config.path.clone(),
            source,
        })?;

        let inner = Arc::new(Inner {
            rotated_path: rotated_path(&config.path),
            path: config.path,
            buffer_size: config.buffer_size.max(1),
            max_file_size: config.max_file_size,
            state: Mutex::new(WriterState {
                buffer: Vec::with_capacity(config.buffer_size.max(1)),
                file: Some(file),
            }),
        });

        let cancel_token = CancellationToken::new();
        let flush_task = tokio::spawn(run_periodic_flush(
            Arc::clone(&inner),
            config.flush_interval,
            cancel_token.clone(),
        ));

        Ok(Self {
            inner,
            cancel_token,
            flush_task: Mutex::new(Some(flush_task)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Buffers an entry, flushing synchronously once the buffer is full.
    pub fn write(&self, entry: OutputEntry) -> Result<(), OutputError> {
        let mut state = self.inner.lock();
        if state.file.is_none() {
            return Err(OutputError::Closed);
        }
        state.buffer.push(entry);
        if state.buffer.len() >= self.inner.buffer_size {
            self.inner.flush_locked(&mut state)?;
        }
        Ok(())
    }

    /// Flushes whatever is buffered. Returns the number of entries written.
    pub fn flush(&self) -> Result<usize, OutputError> {
        self.inner.flush()
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Stops the periodic flush task, waits for it, then flushes the remaining buffer and
    /// releases the file. Later writes fail with [`OutputError::Closed`]. If the final
    /// flush fails the file stays open and the entries stay buffered.
    pub async fn close(&self) -> Result<(), OutputError> {
        self.cancel_token.cancel();
        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(flush_task) = flush_task {
            if let Err(e) = flush_task.await {
                error!("Output flush task failed: {e}");
            }
        }

        let inner = Arc::clone(&self.inner);
        let closed = tokio::task::spawn_blocking(move || inner.close())
            .await
            .map_err(io::Error::other)??;
        if let Some(written) = closed {
            debug!(
                "Closed output file {} after flushing {written} entries",
                self.inner.path.display()
            );
        }
        Ok(())
    }
}

async fn run_periodic_flush(
    inner: Arc<Inner>,
    flush_interval: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Periodic output flush stopped");
                return;
            }
            _ = ticker.tick() => {
                let inner = Arc::clone(&inner);
                match tokio::task::spawn_blocking(move || inner.flush()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("Periodic output flush failed: {e}"),
                    Err(e) => error!("Periodic output flush task failed: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{AttributeValue, Severity};
    use serde_json::Value;
    use tracing_test::traced_test;

    fn entry(body: &str) -> OutputEntry {
        OutputEntry {
            timestamp: format_timestamp(1_700_000_000_000_000_000),
            severity: "INFO".to_string(),
            severity_number: 9,
            body: body.to_string(),
            attributes: BTreeMap::new(),
            resource_attributes: BTreeMap::new(),
            routing: RoutingInfo {
                index: "tas_logs".to_string(),
                rule: "default".to_string(),
            },
            transforms_applied: vec![],
        }
    }

    fn config(path: &Path, buffer_size: usize, flush_interval: Duration) -> JsonWriterConfig {
        JsonWriterConfig {
            path: path.to_path_buf(),
            buffer_size,
            flush_interval,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_timestamp_has_nanoseconds() {
        assert_eq!(
            format_timestamp(1_700_000_000_000_000_001),
            "2023-11-14T22:13:20.000000001Z"
        );
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00.000000000Z");
    }

    #[test]
    fn test_entry_projection() {
        let resource = Resource {
            attributes: vec![KeyValue::new("service.name", "checkout")],
        };
        let record = LogRecord {
            time_unix_nano: 1_700_000_000_000_000_000,
            severity: Severity::WARN,
            severity_text: "WARN".to_string(),
            body: Some(AttributeValue::from("disk almost full")),
            attributes: vec![
                KeyValue::new("cf_app_name", "checkout"),
                KeyValue {
                    key: "retries".to_string(),
                    value: AttributeValue::Int(3),
                },
            ],
            ..Default::default()
        };
        let route = Route {
            index: "tas_logs",
            rule: "default",
        };
        let entry = OutputEntry::new(&resource, &record, route, vec!["Deleted: x".to_string()]);
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["timestamp"], "2023-11-14T22:13:20.000000000Z");
        assert_eq!(json["severity"], "WARN");
        assert_eq!(json["severity_number"], 13);
        assert_eq!(json["body"], "disk almost full");
        assert_eq!(json["attributes"]["retries"], "3");
        assert_eq!(json["resource_attributes"]["service.name"], "checkout");
        assert_eq!(json["routing"]["index"], "tas_logs");
        assert_eq!(json["routing"]["rule"], "default");
        assert_eq!(json["transforms_applied"][0], "Deleted: x");
    }

    #[test]
    fn test_empty_collections_omitted() {
        let json = serde_json::to_value(entry("hello")).unwrap();
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("attributes"));
        assert!(!object.contains_key("resource_attributes"));
        assert!(!object.contains_key("transforms_applied"));
        assert!(object.contains_key("routing"));
    }

    #[test]
    fn test_zero_timestamp_uses_observed_time() {
        let record = LogRecord {
            observed_time_unix_nano: 1_700_000_000_000_000_000,
            ..Default::default()
        };
        let route = Route {
            index: "tas_logs",
            rule: "default",
        };
        let entry = OutputEntry::new(&Resource::default(), &record, route, vec![]);
        assert_eq!(entry.timestamp, "2023-11-14T22:13:20.000000000Z");
        assert_eq!(entry.body, "");
    }

    #[tokio::test]
    async fn test_no_growth_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = JsonWriter::open(config(&path, 10, Duration::from_secs(3600))).unwrap();

        for i in 0..3 {
            writer.write(entry(&format!("line {i}"))).unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        assert_eq!(writer.buffered(), 3);

        writer.close().await.unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2]["body"], "line 2");
    }

    #[tokio::test]
    async fn test_buffer_full_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = JsonWriter::open(config(&path, 2, Duration::from_secs(3600))).unwrap();

        writer.write(entry("a")).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        writer.write(entry("b")).unwrap();
        assert_eq!(read_lines(&path).len(), 2);
        assert_eq!(writer.buffered(), 0);

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = JsonWriter::open(config(&path, 100, Duration::from_millis(50))).unwrap();

        writer.write(entry("tick")).unwrap();
        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if std::fs::metadata(&path).unwrap().len() > 0 {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        assert_eq!(read_lines(&path)[0]["body"], "tick");

        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_appends_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        std::fs::write(&path, "{\"body\":\"previous\"}\n").unwrap();

        let writer = JsonWriter::open(config(&path, 1, Duration::from_secs(3600))).unwrap();
        writer.write(entry("next")).unwrap();
        writer.close().await.unwrap();

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["body"], "previous");
        assert_eq!(lines[1]["body"], "next");
    }

    #[tokio::test]
    async fn test_rotation_creates_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut cfg = config(&path, 1, Duration::from_secs(3600));
        cfg.max_file_size = 10;
        let writer = JsonWriter::open(cfg).unwrap();

        writer.write(entry("first")).unwrap();
        assert!(!rotated_path(&path).exists());
        writer.write(entry("second")).unwrap();
        writer.write(entry("third")).unwrap();
        writer.close().await.unwrap();

        let rotated = read_lines(&rotated_path(&path));
        assert_eq!(rotated.len(), 1);
        assert_eq!(rotated[0]["body"], "second");
        let current = read_lines(&path);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["body"], "third");
    }

    #[tokio::test]
    #[traced_test]
    async fn test_rotation_failure_keeps_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        // a non-empty directory in the way makes the rename fail
        let blocker = rotated_path(&path);
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let mut cfg = config(&path, 1, Duration::from_secs(3600));
        cfg.max_file_size = 10;
        let writer = JsonWriter::open(cfg).unwrap();

        writer.write(entry("first")).unwrap();
        writer.write(entry("second")).unwrap();
        writer.close().await.unwrap();

        assert!(logs_contain("Failed to rotate output file"));
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let writer = JsonWriter::open(config(&path, 10, Duration::from_secs(3600))).unwrap();
        writer.close().await.unwrap();

        assert!(matches!(writer.write(entry("late")), Err(OutputError::Closed)));
        // closing twice is harmless
        writer.close().await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_failed_flush_keeps_entries() {
        // every write to /dev/full fails with ENOSPC
        let path = Path::new("/dev/full");
        let writer = JsonWriter::open(config(path, 10, Duration::from_secs(3600))).unwrap();
        writer.write(entry("one")).unwrap();
        writer.write(entry("two")).unwrap();

        assert!(matches!(writer.flush(), Err(OutputError::Io(_))));
        assert_eq!(writer.buffered(), 2);

        writer.write(entry("three")).unwrap();
        assert!(writer.close().await.is_err());
        assert_eq!(writer.buffered(), 3);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    #[traced_test]
    async fn test_retained_entries_are_bounded() {
        let path = Path::new("/dev/full");
        let writer = JsonWriter::open(config(path, 2, Duration::from_secs(3600))).unwrap();
        for i in 0..50 {
            let _ = writer.write(entry(&format!("line {i}")));
        }
        assert_eq!(writer.buffered(), 2 * MAX_RETAINED_BUFFERS);
        assert!(logs_contain("after repeated flush failures"));
    }

    #[test]
    fn test_open_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.jsonl");
        let result = JsonWriter::open(JsonWriterConfig::new(path));
        assert!(matches!(result, Err(OutputError::Open { .. })));
    }
}
