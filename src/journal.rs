//! JSONL journal of content transfers.
//!
//! One JSON object per line, appended after each transfer finishes or
//! breaks. The journal is the durable record an operator can replay to find
//! partially-written files after a misbehaving client.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Broken,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TransferEntry {
    pub timestamp: String,
    pub user: String,
    pub path: PathBuf,
    pub bytes_expected: u64,
    pub bytes_received: u64,
    pub status: TransferStatus,
}

impl TransferEntry {
    pub fn now(
        user: &str,
        path: &Path,
        bytes_expected: u64,
        bytes_received: u64,
        status: TransferStatus,
    ) -> Self {
        TransferEntry {
            timestamp: Utc::now().to_rfc3339(),
            user: user.to_string(),
            path: path.to_path_buf(),
            bytes_expected,
            bytes_received,
            status,
        }
    }
}

pub struct TransferJournal {
    path: PathBuf,
}

impl TransferJournal {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        TransferJournal { path: path.as_ref().to_path_buf() }
    }

    pub fn record(&self, entry: &TransferEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("open transfer journal")?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<TransferEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).context("open transfer journal for reading")?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}
