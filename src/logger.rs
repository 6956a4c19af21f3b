//! Per-request log.
//!
//! Workers hand finished operations to [`EventLogger::record`], which only
//! enqueues. One writer thread owns the file and serializes each entry as a
//! JSON line. [`EventLogger::close`] drains everything queued before it and
//! returns once the file is flushed and synced.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 10_000;
const WRITE_BUFFER: usize = 1 << 20;

/// One completed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(with = "ts_format")]
    pub ts: OffsetDateTime,
    pub config: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub targets: String,
    pub mode: String,
    pub concurrency: usize,
    pub request: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub resp_bytes: u64,
    pub ok: bool,
    pub latency_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Unix milliseconds of `ts`.
pub fn unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Fixed-width UTC RFC 3339 with nanoseconds, so lexical order matches time order.
pub mod ts_format {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::macros::format_description;
    use time::{OffsetDateTime, UtcOffset};

    pub fn format(ts: &OffsetDateTime) -> String {
        let fmt = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        );
        ts.to_offset(UtcOffset::UTC)
            .format(&fmt)
            .unwrap_or_else(|_| ts.unix_timestamp().to_string())
    }

    pub fn serialize<S: Serializer>(ts: &OffsetDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        OffsetDateTime::parse(&raw, &Rfc3339).map_err(de::Error::custom)
    }
}

enum Command {
    Entry(Box<LogEntry>),
    Shutdown,
}

/// Entries that arrived while the channel was full.
#[derive(Default)]
struct Overflow {
    pending: AtomicUsize,
    entries: Mutex<Vec<LogEntry>>,
}

impl Overflow {
    fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
        self.pending.fetch_add(1, Ordering::Release);
    }

    fn drain_into<W: Write>(&self, out: &mut W) -> io::Result<u64> {
        if self.pending.load(Ordering::Acquire) == 0 {
            return Ok(0);
        }
        let entries = {
            let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            self.pending.store(0, Ordering::Release);
            std::mem::take(&mut *guard)
        };
        for entry in &entries {
            write_entry(out, entry)?;
        }
        Ok(entries.len() as u64)
    }
}

pub struct EventLogger {
    path: PathBuf,
    tx: mpsc::Sender<Command>,
    overflow: Arc<Overflow>,
    spilled: AtomicU64,
    closed: AtomicBool,
    writer: Mutex<Option<thread::JoinHandle<io::Result<u64>>>>,
}

impl EventLogger {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_capacity(path, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
        let out = BufWriter::with_capacity(WRITE_BUFFER, file);

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let overflow = Arc::new(Overflow::default());
        let worker_overflow = Arc::clone(&overflow);
        let writer = thread::Builder::new()
            .name("request-log".into())
            .spawn(move || write_loop(rx, worker_overflow, out))
            .map_err(|e| Error::io(&path, e))?;

        debug!("request log opened at {:?}", path);
        Ok(Self {
            path,
            tx,
            overflow,
            spilled: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enqueues `entry` without waiting. When the channel is full the entry is
    /// parked in an overflow list that the writer drains next.
    pub fn record(&self, entry: LogEntry) {
        if self.closed.load(Ordering::Acquire) {
            warn!("request log closed, dropping entry for {}", entry.request);
            return;
        }
        match self.tx.try_send(Command::Entry(Box::new(entry))) {
            Ok(()) => {}
            Err(TrySendError::Full(Command::Entry(entry))) => {
                self.spilled.fetch_add(1, Ordering::Relaxed);
                self.overflow.push(*entry);
            }
            Err(TrySendError::Full(Command::Shutdown)) => {}
            Err(TrySendError::Closed(_)) => {
                warn!("request log writer stopped, dropping entry");
            }
        }
    }

    /// Drains the queue, flushes and syncs the file. Returns the number of
    /// entries written over the logger's lifetime.
    pub async fn close(&self) -> Result<u64> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::LoggerClosed);
        }
        // a send error means the writer already exited; join reports why
        let _ = self.tx.send(Command::Shutdown).await;

        let handle = self
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::LoggerClosed)?;
        let joined = tokio::task::spawn_blocking(move || handle.join())
            .await
            .map_err(|_| Error::LoggerPanicked)?;
        let written = match joined {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::io(&self.path, e)),
            Err(_) => return Err(Error::LoggerPanicked),
        };

        let spilled = self.spilled.load(Ordering::Relaxed);
        if spilled > 0 {
            warn!("request log buffer overflowed {} times", spilled);
        }
        info!("request log closed: {} entries in {:?}", written, self.path);
        Ok(written)
    }
}

/// A logger dropped without [`EventLogger::close`] still drains and flushes,
/// blocking until the writer thread has finished.
impl Drop for EventLogger {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(handle) = self.writer.get_mut().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        while let Err(TrySendError::Full(_)) = self.tx.try_send(Command::Shutdown) {
            thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok(Ok(written)) => {
                debug!("request log flushed on drop: {} entries in {:?}", written, self.path)
            }
            Ok(Err(e)) => warn!("request log flush failed for {:?}: {}", self.path, e),
            Err(_) => warn!("request log writer panicked"),
        }
    }
}

fn write_entry<W: Write>(out: &mut W, entry: &LogEntry) -> io::Result<()> {
    let line = sonic_rs::to_string(entry).map_err(io::Error::other)?;
    out.write_all(line.as_bytes())?;
    out.write_all(b"\n")
}

fn write_loop(
    mut rx: mpsc::Receiver<Command>,
    overflow: Arc<Overflow>,
    mut out: BufWriter<File>,
) -> io::Result<u64> {
    let mut written = 0u64;
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            Command::Entry(entry) => {
                write_entry(&mut out, &entry)?;
                written += 1;
            }
            Command::Shutdown => break,
        }
        written += overflow.drain_into(&mut out)?;
    }

    // entries racing with shutdown
    rx.close();
    while let Ok(cmd) = rx.try_recv() {
        if let Command::Entry(entry) = cmd {
            write_entry(&mut out, &entry)?;
            written += 1;
        }
    }
    written += overflow.drain_into(&mut out)?;

    out.flush()?;
    out.get_ref().sync_all()?;
    Ok(written)
}

/// Reads a request log, skipping blank and malformed lines.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogEntry>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(Error::MissingInput(path.to_path_buf()));
    }
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut entries = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match sonic_rs::from_str::<LogEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("skipped {} malformed lines in {:?}", skipped, path);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::datetime;

    fn entry(n: usize, ok: bool) -> LogEntry {
        LogEntry {
            ts: datetime!(2024-05-01 12:00:00 UTC) + Duration::from_millis(n as u64),
            config: "alpha".into(),
            targets: "ws://a".into(),
            mode: "blocks".into(),
            concurrency: 8,
            request: "getBlock".into(),
            resp_bytes: if ok { 512 } else { 0 },
            ok,
            latency_ms: n as i64 % 17,
            error: (!ok).then(|| "context deadline exceeded".to_string()),
        }
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = ts_format::format(&datetime!(2024-05-01 12:00:00 UTC));
        let b = ts_format::format(&datetime!(2024-05-01 12:00:00.5 UTC));
        assert_eq!(a, "2024-05-01T12:00:00.000000000Z");
        assert_eq!(b, "2024-05-01T12:00:00.500000000Z");
        assert!(a < b);
        let shifted = ts_format::format(&datetime!(2024-05-01 14:00:00 +2));
        assert_eq!(shifted, a);
    }

    #[test]
    fn entry_json_shape() {
        let json = sonic_rs::to_string(&entry(3, true)).unwrap();
        assert!(json.contains(r#""ts":"2024-05-01T12:00:00.003000000Z""#));
        assert!(json.contains(r#""request":"getBlock""#));
        assert!(!json.contains("error"));

        let failed = sonic_rs::to_string(&entry(4, false)).unwrap();
        assert!(!failed.contains("resp_bytes"));
        let back: LogEntry = sonic_rs::from_str(&failed).unwrap();
        assert_eq!(back, entry(4, false));
    }

    #[test]
    fn parses_foreign_rfc3339() {
        let line = r#"{"ts":"2024-05-01T12:00:01.25Z","config":"c","mode":"m","concurrency":1,"request":"r","ok":true,"latency_ms":3}"#;
        let e: LogEntry = sonic_rs::from_str(line).unwrap();
        assert_eq!(e.ts, datetime!(2024-05-01 12:00:01.25 UTC));
        assert_eq!(e.targets, "");
        assert_eq!(e.error, None);
    }

    #[tracing_test::traced_test]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ntest::timeout(20000)]
    async fn concurrent_producers_lose_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("requests.jsonl");
        // tiny channel so most entries go through the overflow path
        let logger = Arc::new(EventLogger::with_capacity(&path, 4).unwrap());

        let mut tasks = Vec::new();
        for p in 0..16 {
            let logger = Arc::clone(&logger);
            tasks.push(tokio::spawn(async move {
                for i in 0..500 {
                    logger.record(entry(p * 1000 + i, i % 7 != 0));
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let written = logger.close().await.unwrap();
        assert_eq!(written, 8_000);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 8_000);
        assert!(raw.ends_with('\n'));
        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 8_000);
        assert_eq!(entries.iter().filter(|e| !e.ok).count(), 16 * 72);
    }

    #[tokio::test]
    async fn close_twice_and_record_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = EventLogger::create(&path).unwrap();
        logger.record(entry(1, true));
        assert_eq!(logger.close().await.unwrap(), 1);
        logger.record(entry(2, true));
        assert!(matches!(logger.close().await, Err(Error::LoggerClosed)));
        assert_eq!(read_log(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn dropping_without_close_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = EventLogger::with_capacity(&path, 2).unwrap();
        for i in 0..100 {
            logger.record(entry(i, i % 3 != 0));
        }
        drop(logger);
        let entries = read_log(&path).unwrap();
        assert_eq!(entries.len(), 100);
        assert_eq!(entries.iter().filter(|e| !e.ok).count(), 34);
    }

    #[test]
    fn unopenable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("log.jsonl");
        assert!(matches!(EventLogger::create(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn reader_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let good = sonic_rs::to_string(&entry(9, true)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n\n{good}\n")).unwrap();
        assert_eq!(read_log(&path).unwrap().len(), 2);
        assert!(matches!(
            read_log(dir.path().join("nope.jsonl")),
            Err(Error::MissingInput(_))
        ));
    }
}
