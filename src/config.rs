//! Server configuration
//!
//! Plain `key=value` lines, one per line. `path` and `account_path` are
//! required; everything else has a default. Unknown keys are ignored so a
//! config can be shared with other tools.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BIND: &str = "0.0.0.0:9731";

#[derive(Debug, Clone)]
pub struct Config {
    /// Sync root; each user's tree mirrors under `{root}/{username}`.
    pub root: PathBuf,
    /// Account store file (`username,password` lines).
    pub account_path: PathBuf,
    /// Worker-pool size.
    pub workers: usize,
    /// Listen address (host:port).
    pub bind: String,
    /// Optional timestamped text log.
    pub log_file: Option<PathBuf>,
    /// Optional JSONL transfer journal.
    pub journal: Option<PathBuf>,
    /// How long a transfer may wait for the file lock before giving up.
    /// `None` preserves the classic behavior: wait as long as the client
    /// keeps probing.
    pub lock_wait: Option<Duration>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Config> {
        let mut root: Option<PathBuf> = None;
        let mut account_path: Option<PathBuf> = None;
        let mut workers: Option<usize> = None;
        let mut bind: Option<String> = None;
        let mut log_file: Option<PathBuf> = None;
        let mut journal: Option<PathBuf> = None;
        let mut lock_wait: Option<Duration> = None;

        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                bail!("config line {} is not key=value: {:?}", idx + 1, line);
            };
            let (key, val) = (key.trim(), val.trim());
            match key {
                "path" => root = Some(PathBuf::from(val)),
                "account_path" => account_path = Some(PathBuf::from(val)),
                "thread" => {
                    let n: usize = val
                        .parse()
                        .with_context(|| format!("config line {}: bad thread count", idx + 1))?;
                    if n == 0 {
                        bail!("config line {}: thread count must be positive", idx + 1);
                    }
                    workers = Some(n);
                }
                "bind" => bind = Some(val.to_string()),
                "log_file" => log_file = Some(PathBuf::from(val)),
                "journal" => journal = Some(PathBuf::from(val)),
                "lock_wait_secs" => {
                    let secs: u64 = val
                        .parse()
                        .with_context(|| format!("config line {}: bad lock_wait_secs", idx + 1))?;
                    // 0 keeps the unbounded client-paced loop
                    lock_wait = (secs > 0).then(|| Duration::from_secs(secs));
                }
                _ => {}
            }
        }

        let Some(root) = root else {
            bail!("config is missing required key: path");
        };
        let Some(account_path) = account_path else {
            bail!("config is missing required key: account_path");
        };
        Ok(Config {
            root,
            account_path,
            workers: workers.unwrap_or_else(|| num_cpus::get().max(1)),
            bind: bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
            log_file,
            journal,
            lock_wait,
        })
    }
}
