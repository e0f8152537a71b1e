//! Durable event store: one newline-delimited JSON log per room.
//!
//! Layout:
//! ```text
//! <root>/
//!   gs-1/events.jsonl     one serialized Event per line, arrival order
//!   gs-2/events.jsonl
//! ```
//!
//! There is no index and no compaction; line `n` holds sequence number `n`.
//! A final line without a trailing newline is the remains of an interrupted
//! write and is cut off when the log is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{validate_room_id, EventStore, Replay, StoreError};
use crate::protocol::{Event, EventRecord};

/// File name of the per-room log.
pub const LOG_FILE_NAME: &str = "events.jsonl";

struct LogWriter {
    file: File,
    /// Byte length of the log up to the last complete line
    committed_bytes: u64,
}

/// Disk-backed event log of one room.
pub struct FileStore {
    room_id: String,
    path: PathBuf,
    writer: Mutex<LogWriter>,
    /// Number of complete lines, advanced only after a successful write
    len: AtomicU64,
    sync_writes: bool,
}

impl FileStore {
    /// Open (or create) the log of `room_id` under `root`.
    pub fn open(root: &Path, room_id: &str, sync_writes: bool) -> Result<Self, StoreError> {
        validate_room_id(room_id)?;

        let dir = root.join(room_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE_NAME);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let scan = scan_log(&path)?;
        if scan.total_bytes > scan.committed_bytes {
            log::warn!(
                "Discarding {} bytes of incomplete record at the end of {}",
                scan.total_bytes - scan.committed_bytes,
                path.display()
            );
            file.set_len(scan.committed_bytes)?;
        }

        log::debug!("Opened event log {} ({} records)", path.display(), scan.lines);

        Ok(Self {
            room_id: room_id.to_string(),
            path,
            writer: Mutex::new(LogWriter {
                file,
                committed_bytes: scan.committed_bytes,
            }),
            len: AtomicU64::new(scan.lines),
            sync_writes,
        })
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventStore for FileStore {
    fn append(&self, event: &Event) -> Result<u64, StoreError> {
        // serde_json escapes control characters, so one event is one line.
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = self.len.load(Ordering::Acquire);

        if let Err(e) = write_line(&mut writer.file, &line, self.sync_writes) {
            // Roll back a partial line so the next append starts clean.
            let committed = writer.committed_bytes;
            if let Err(rollback) = writer.file.set_len(committed) {
                log::error!(
                    "Failed to roll back partial write in {}: {rollback}",
                    self.path.display()
                );
            }
            return Err(e.into());
        }

        writer.committed_bytes += line.len() as u64;
        self.len.store(seq + 1, Ordering::Release);
        Ok(seq)
    }

    fn replay_range(&self, start: u64, end: u64) -> Result<Replay, StoreError> {
        let end = end.min(self.len());
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(LogReader {
            path: self.path.clone(),
            lines: reader.lines(),
            next_seq: 0,
            start,
            end,
        }))
    }

    fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }
}

/// Lazily parses log lines in `start..end`.
struct LogReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    next_seq: u64,
    start: u64,
    end: u64,
}

impl Iterator for LogReader {
    type Item = Result<EventRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_seq < self.end {
            let seq = self.next_seq;
            self.next_seq += 1;

            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.next_seq = self.end;
                    return Some(Err(e.into()));
                }
            };
            if seq < self.start {
                continue;
            }

            return Some(
                serde_json::from_str::<Event>(&line)
                    .map(|event| EventRecord::new(seq, event))
                    .map_err(|source| StoreError::Corrupt {
                        path: self.path.clone(),
                        seq,
                        source,
                    }),
            );
        }
        None
    }
}

fn write_line(file: &mut File, line: &[u8], sync: bool) -> io::Result<()> {
    file.write_all(line)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

struct LogScan {
    lines: u64,
    committed_bytes: u64,
    total_bytes: u64,
}

fn scan_log(path: &Path) -> io::Result<LogScan> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut scan = LogScan {
        lines: 0,
        committed_bytes: 0,
        total_bytes: 0,
    };
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        scan.total_bytes += n as u64;
        if buf.last() == Some(&b'\n') {
            scan.lines += 1;
            scan.committed_bytes = scan.total_bytes;
        }
    }
    Ok(scan)
}
