//! Append-only JSONL event log

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::PersistenceAdapter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{SequencedEvent, Snapshot, SnapshotBuilder};

/// Just the sequence number of a logged event
#[derive(Deserialize)]
struct SequenceOnly {
    sequence: u64,
}

/// Persists every event as one JSON line; reloads by replaying the log
pub struct JsonlEventLog {
    path: PathBuf,
    // serialises appends from concurrent flushes
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    /// Log at the configured `events.jsonl` path, creating the data directory
    pub fn new(config: &Config) -> Result<Self> {
        config.ensure_dirs()?;
        Ok(Self::open(config.event_log_path()))
    }

    /// Log at an explicit path. The file is created on first append.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, events: &[SequencedEvent]) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        // one buffer per batch so a batch lands in a single write where possible
        let mut buffer = String::new();
        if ends_mid_line(&mut file)? {
            warn!(path = %self.path.display(), "Event log ends in a torn line, starting a new one");
            buffer.push('\n');
        }
        let mut writer = BufWriter::new(file);
        for event in events {
            buffer.push_str(&serde_json::to_string(event)?);
            buffer.push('\n');
        }
        writer.write_all(buffer.as_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    fn replay(&self) -> Result<Snapshot> {
        if !self.path.exists() {
            return Ok(Snapshot::default());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut builder = SnapshotBuilder::new();
        let mut skipped = 0usize;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: SequencedEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    // a torn final line from a crash mid-append is dropped
                    warn!(line = line_no + 1, error = %e, "Skipping unreadable event log line");
                    continue;
                }
            };
            if !builder.apply(&event) {
                skipped += 1;
            }
        }

        let snapshot = builder.build();
        debug!(
            nodes = snapshot.nodes.len(),
            edges = snapshot.edges.len(),
            duplicates = skipped,
            "Replayed event log"
        );
        Ok(snapshot)
    }

    /// Highest sequence number in the log, ignoring unreadable lines
    fn highest_sequence(&self) -> Result<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut highest = 0;
        for line in reader.lines() {
            if let Ok(SequenceOnly { sequence }) = serde_json::from_str(&line?) {
                highest = highest.max(sequence);
            }
        }
        Ok(highest)
    }

    /// Number of non-empty lines in the log
    pub fn len(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader
            .lines()
            .filter(|l| l.as_ref().map(|s| !s.trim().is_empty()).unwrap_or(false))
            .count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl PersistenceAdapter for JsonlEventLog {
    async fn apply(&self, events: &[SequencedEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        self.append(events)
            .map_err(|e| Error::persistence(format!("append {} events", events.len()), e))
    }

    async fn load(&self) -> Result<Snapshot> {
        self.replay().map_err(|e| Error::persistence("replay event log", e))
    }

    async fn last_sequence(&self) -> Result<u64> {
        self.highest_sequence()
            .map_err(|e| Error::persistence("read event log sequence", e))
    }
}

/// True when a non-empty file does not end with a newline
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}
