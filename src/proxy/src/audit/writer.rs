//! Single-writer audit log worker: consumes a bounded queue of owned
//! [`AuditRecord`]s and serializes them into a rotated, gzip-compressed
//! file stream. Grounded on
//! `examples/original_source/pkg/mysqlproxy/log/auditlogwriter.go`
//! (state machine, rotation ticker, free-list pool) and `log.go` (version
//! header, filename templating).
//!
//! The `sync.Pool`-based free-list in the source is replaced by an
//! explicit bounded channel of recycled records (see `DESIGN.md`): a
//! fixed arena isn't needed in Rust because `Arc`-free ownership transfer
//! through `mpsc` already gives us the same "get a buffer, hand it back"
//! shape without an allocator hook.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::record::{AuditRecord, MAX_RECORD_PACKET_LEN};

/// Literal magic prefix every audit log file begins with (uncompressed,
/// i.e. the first bytes written into the gzip stream). Per `DESIGN.md`'s
/// open-question resolution this is the 32-byte ASCII sequence including
/// a literal backslash-n, not a newline byte — `log.go`'s `fmtVersion` is
/// a Go raw string literal.
pub const VERSION_HEADER: &[u8] = b"{\"format\":\"mysqlproxy-v1.00\"}\\n";

#[derive(Debug, Error)]
pub enum AuditWriterError {
    #[error("audit writer closed")]
    Closed,
    #[error("audit writer cancelled")]
    Cancelled,
    #[error("audit log io error: {0}")]
    Io(#[from] io::Error),
}

/// Substitutes `%Y %y %m %d %H %M %S` with zero-padded components of
/// `t`, matching `time2Path` in `log.go`.
pub fn time_to_path(template: &str, t: DateTime<Utc>) -> String {
    template
        .replace("%Y", &format!("{:04}", t.year()))
        .replace("%y", &format!("{:02}", t.year() % 100))
        .replace("%m", &format!("{:02}", t.month()))
        .replace("%d", &format!("{:02}", t.day()))
        .replace("%H", &format!("{:02}", t.hour()))
        .replace("%M", &format!("{:02}", t.minute()))
        .replace("%S", &format!("{:02}", t.second()))
}

/// A handle submitters use to push records and borrow free ones. Cloning
/// is cheap — it's just two channel senders/receivers.
#[derive(Clone)]
pub struct AuditWriterHandle {
    submit: mpsc::Sender<AuditRecord>,
    free: mpsc::Sender<AuditRecord>,
    free_recv: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<AuditRecord>>>,
}

impl AuditWriterHandle {
    /// Pulls a reset, pre-sized record off the free-list, allocating a
    /// fresh one if the list is empty (first use, or every slot is
    /// currently in flight).
    pub async fn get_record(&self) -> AuditRecord {
        let mut guard = self.free_recv.lock().await;
        let mut record = match guard.try_recv() {
            Ok(record) => record,
            Err(_) => {
                let mut record = AuditRecord::default();
                record.packets.reserve(MAX_RECORD_PACKET_LEN);
                record
            }
        };
        record.reset();
        record
    }

    /// Returns a record to the free-list after it's been encoded. Silently
    /// drops it if the free-list is full — losing a reusable buffer isn't
    /// a correctness problem, just a missed allocation saving.
    pub fn put_record(&self, record: AuditRecord) {
        let _ = self.free.try_send(record);
    }

    /// Enqueues a record for writing, blocking until space is available
    /// or `cancel` fires.
    pub async fn submit(
        &self,
        record: AuditRecord,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), AuditWriterError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AuditWriterError::Cancelled),
            result = self.submit.send(record) => result.map_err(|_| AuditWriterError::Closed),
        }
    }

}

pub struct AuditLogWriterConfig {
    pub file_path_template: String,
    pub rotate_time: Duration,
    pub queue_capacity: usize,
}

/// Owns the gzip-wrapped file and runs the consume/rotate/close state
/// machine described in spec §4.D.
pub struct AuditLogWriter {
    file_path_template: String,
    rotate_time: Duration,
    current_path: PathBuf,
    gzip: Option<GzEncoder<std::fs::File>>,
}

fn create_exclusive_or_append(path: &Path) -> io::Result<std::fs::File> {
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => std::fs::OpenOptions::new()
            .write(true)
            .append(true)
            .open(path),
        Err(e) => Err(e),
    }
}

impl AuditLogWriter {
    /// Spawns the writer task and returns a handle plus a oneshot that
    /// resolves once the writer exits (fatal failures surface here so the
    /// caller can trigger root cancellation per spec §7).
    pub fn spawn(
        config: AuditLogWriterConfig,
        cancel: tokio_util::sync::CancellationToken,
    ) -> io::Result<(
        AuditWriterHandle,
        tokio::task::JoinHandle<Result<(), AuditWriterError>>,
    )> {
        if let Some(parent) = Path::new(&config.file_path_template).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (free_tx, free_rx) = mpsc::channel(config.queue_capacity.max(1));

        let mut writer = AuditLogWriter {
            file_path_template: config.file_path_template,
            rotate_time: config.rotate_time,
            current_path: PathBuf::new(),
            gzip: None,
        };
        writer.open_for(Utc::now())?;

        let run_free_tx = free_tx.clone();
        let handle = AuditWriterHandle {
            submit: submit_tx,
            free: free_tx,
            free_recv: std::sync::Arc::new(tokio::sync::Mutex::new(free_rx)),
        };

        // `run` must only hold the free-list sender, never a clone of
        // `submit` — holding a `submit` sender inside the task itself
        // would keep that channel permanently open, and `queue.recv()`
        // would never observe a closed queue even after every external
        // `AuditWriterHandle` is dropped.
        let join = tokio::spawn(writer.run(submit_rx, run_free_tx, cancel));
        Ok((handle, join))
    }

    fn open_for(&mut self, anchor: DateTime<Utc>) -> io::Result<()> {
        let path = PathBuf::from(time_to_path(&self.file_path_template, anchor));
        let is_new = !path.exists();
        let file = create_exclusive_or_append(&path)?;
        let mut gzip = GzEncoder::new(file, Compression::default());
        if is_new {
            gzip.write_all(VERSION_HEADER)?;
        }
        self.current_path = path;
        self.gzip = Some(gzip);
        Ok(())
    }

    fn close_current(&mut self) -> io::Result<()> {
        if let Some(mut gzip) = self.gzip.take() {
            gzip.flush()?;
            gzip.finish()?;
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut queue: mpsc::Receiver<AuditRecord>,
        free_tx: mpsc::Sender<AuditRecord>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<(), AuditWriterError> {
        let mut ticker = tokio::time::interval(self.rotate_time.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; consume it so rotation happens
        // on the interval, not at startup.
        ticker.tick().await;

        let result = 'run: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued before closing —
                    // cancellation must not lose records that a submitter
                    // already handed off (spec §139(d)).
                    while let Ok(record) = queue.try_recv() {
                        if let Err(e) = self.encode(&record) {
                            error!(error = %e, "audit log encode failed while draining on cancellation");
                            break 'run self.close_current().map_err(AuditWriterError::from).and(Err(AuditWriterError::Io(e)));
                        }
                        let _ = free_tx.try_send(record);
                    }
                    break 'run self.close_current().map_err(AuditWriterError::from).and(Err(AuditWriterError::Cancelled));
                }
                record = queue.recv() => {
                    match record {
                        None => {
                            break 'run self.close_current().map_err(AuditWriterError::from).and(Err(AuditWriterError::Closed));
                        }
                        Some(record) => {
                            if let Err(e) = self.encode(&record) {
                                error!(error = %e, "audit log encode failed; writer is halting");
                                break 'run Err(AuditWriterError::Io(e));
                            }
                            let _ = free_tx.try_send(record);
                        }
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.close_current() {
                        break Err(AuditWriterError::Io(e));
                    }
                    if let Err(e) = self.open_for(Utc::now()) {
                        error!(error = %e, "audit log rotation failed to reopen a file; writer is halting");
                        break Err(AuditWriterError::Io(e));
                    }
                    info!(path = %self.current_path.display(), "audit log rotated");
                }
            }
        };
        if let Err(AuditWriterError::Cancelled) = &result {
            warn!("audit writer drained queued records and stopped on cancellation");
        }
        result
    }

    fn encode(&mut self, record: &AuditRecord) -> io::Result<()> {
        let gzip = self
            .gzip
            .as_mut()
            .expect("writer always holds an open file between open_for calls");
        let mut buf = Vec::new();
        record.encode(&mut buf)?;
        gzip.write_all(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_to_path_substitutes_all_components() {
        let t = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let path = time_to_path("x.%Y%m%d%H%M%S.gz", t);
        assert_eq!(path, "x.20260102030405.gz");
    }

    #[tokio::test]
    async fn writes_version_header_and_records_then_drains_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("audit.log.gz").to_str().unwrap().to_string();
        let cancel = tokio_util::sync::CancellationToken::new();
        let (handle, join) = AuditLogWriter::spawn(
            AuditLogWriterConfig {
                file_path_template: template.clone(),
                rotate_time: Duration::from_secs(3600),
                queue_capacity: 16,
            },
            cancel.clone(),
        )
        .unwrap();

        let mut record = handle.get_record().await;
        record.connection_id = 7;
        record.user = "u1".to_string();
        record.state = "connect".to_string();
        handle.submit(record, &cancel).await.unwrap();

        drop(handle);
        let result = join.await.unwrap();
        assert!(matches!(result, Err(AuditWriterError::Closed)));

        let bytes = std::fs::read(&template).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&bytes[..]);
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut out).unwrap();
        assert!(out.starts_with(VERSION_HEADER));
        let decoded = AuditRecord::decode(&out[VERSION_HEADER.len()..]).unwrap();
        assert_eq!(decoded.connection_id, 7);
        assert_eq!(decoded.user, "u1");
        assert_eq!(decoded.state, "connect");
    }
}
