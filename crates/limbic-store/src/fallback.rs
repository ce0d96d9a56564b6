//! Append-only emergency log for turns the store could not take.
//!
//! One JSON object per line. Replay reads every entry, writes what it can
//! and rewrites the file with whatever is left.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use limbic_core::TurnRecord;

use crate::error::{Result, StoreError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub recorded_at_ms: i64,
    pub error: String,
    pub record: TurnRecord,
}

pub struct FallbackLog {
    path: PathBuf,
    // Serializes appends and rewrites within this process
    lock: Mutex<()>,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &TurnRecord, error: &str, now_ms: i64) -> Result<()> {
        let entry = FallbackEntry {
            recorded_at_ms: now_ms,
            error: error.to_string(),
            record: record.clone(),
        };
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let _guard = self.lock()?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Every readable entry, oldest first. Lines that fail to parse are
    /// skipped with a warning and dropped on the next rewrite.
    pub fn read_all(&self) -> Result<Vec<FallbackEntry>> {
        let _guard = self.lock()?;
        self.read_unlocked()
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.read_all()?.len())
    }

    /// Replace the log contents with `entries`. An empty list removes the file.
    pub fn rewrite(&self, entries: &[FallbackEntry]) -> Result<()> {
        let _guard = self.lock()?;
        self.rewrite_unlocked(entries)
    }

    fn rewrite_unlocked(&self, entries: &[FallbackEntry]) -> Result<()> {
        if entries.is_empty() {
            match fs::remove_file(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for entry in entries {
                serde_json::to_writer(&mut file, entry)?;
                file.write_all(b"\n")?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Keep only entries for which `keep` returns true, reading and
    /// rewriting under one lock so concurrent appends are not lost.
    /// Returns how many entries remain.
    pub fn retain<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&FallbackEntry) -> bool,
    {
        let _guard = self.lock()?;
        let mut entries = self.read_unlocked()?;
        entries.retain(|e| keep(e));
        self.rewrite_unlocked(&entries)?;
        Ok(entries.len())
    }

    fn read_unlocked(&self) -> Result<Vec<FallbackEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = i + 1, error = %e, "skipping unreadable fallback entry"),
            }
        }
        Ok(entries)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| StoreError::InvalidData("fallback log lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use limbic_core::{CaptureConfig, TurnContext, TurnLayers};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use tempfile::TempDir;

    fn record(n: u64) -> TurnRecord {
        let layers = TurnLayers {
            input: format!("input {n}"),
            deliberation: String::new(),
            output: format!("output {n}"),
            speaker: None,
        };
        TurnRecord::build(
            &layers,
            &TurnContext::new("agent"),
            None,
            0.5,
            &CaptureConfig::default(),
            n as i64,
            &mut SmallRng::seed_from_u64(n),
        )
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = FallbackLog::new(dir.path().join("fallback/turns.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
        assert_eq!(log.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_append_creates_parent_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let log = FallbackLog::new(dir.path().join("fallback/turns.jsonl"));
        log.append(&record(1), "database is locked", 10).unwrap();
        log.append(&record(2), "database is locked", 20).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].record, record(1));
        assert_eq!(entries[1].recorded_at_ms, 20);
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turns.jsonl");
        let log = FallbackLog::new(&path);
        log.append(&record(1), "e", 1).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        log.append(&record(2), "e", 2).unwrap();
        assert_eq!(log.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_rewrite_keeps_only_given_entries() {
        let dir = TempDir::new().unwrap();
        let log = FallbackLog::new(dir.path().join("turns.jsonl"));
        for n in 0..3 {
            log.append(&record(n), "e", n as i64).unwrap();
        }
        let entries = log.read_all().unwrap();
        log.rewrite(&entries[1..2]).unwrap();
        assert_eq!(log.read_all().unwrap(), entries[1..2].to_vec());

        log.rewrite(&[]).unwrap();
        assert!(!log.path().exists());
        log.rewrite(&[]).unwrap();
    }

    #[test]
    fn test_retain_drops_matching_entries() {
        let dir = TempDir::new().unwrap();
        let log = FallbackLog::new(dir.path().join("turns.jsonl"));
        for n in 0..4 {
            log.append(&record(n), "e", n as i64).unwrap();
        }
        let remaining = log.retain(|e| e.recorded_at_ms % 2 == 1).unwrap();
        assert_eq!(remaining, 2);
        let kept: Vec<i64> = log.read_all().unwrap().iter().map(|e| e.recorded_at_ms).collect();
        assert_eq!(kept, vec![1, 3]);

        assert_eq!(log.retain(|_| false).unwrap(), 0);
        assert!(!log.path().exists());
    }
}
