//! Account store adapter
//!
//! Accounts live in a line-oriented text file, one `username,password` record
//! per line. The file is re-read on every login attempt so edits take effect
//! without a restart. Only the lookup contract is exposed; the stored
//! password never leaves this module un-hashed.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::checksum::{digest_bytes, Digest};

pub struct AccountStore {
    path: PathBuf,
}

impl AccountStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        AccountStore { path: path.as_ref().to_path_buf() }
    }

    /// Resolve a username to the digest of its stored password.
    /// Malformed lines are skipped with a diagnostic, matching line numbers
    /// to the file on disk.
    pub fn lookup(&self, user: &str) -> Result<Option<Digest>> {
        let file = File::open(&self.path)
            .with_context(|| format!("open account file {}", self.path.display()))?;
        let reader = BufReader::new(file);
        for (idx, line) in reader.lines().enumerate() {
            let line = line.context("read account file")?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            let Some((name, password)) = line.split_once(',') else {
                eprintln!("ill-formed record in account file, line {}", idx + 1);
                continue;
            };
            if name == user {
                return Ok(Some(digest_bytes(password.as_bytes())));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with(content: &str) -> (tempfile::TempDir, AccountStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts");
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, AccountStore::new(&path))
    }

    #[test]
    fn lookup_known_user() {
        let (_dir, store) = store_with("alice,secret\nbob,hunter2\n");
        let digest = store.lookup("alice").unwrap().unwrap();
        assert_eq!(digest, digest_bytes(b"secret"));
        let digest = store.lookup("bob").unwrap().unwrap();
        assert_eq!(digest, digest_bytes(b"hunter2"));
    }

    #[test]
    fn lookup_unknown_user() {
        let (_dir, store) = store_with("alice,secret\n");
        assert!(store.lookup("mallory").unwrap().is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let (_dir, store) = store_with("garbage-no-delimiter\n\nalice,secret\n");
        assert_eq!(store.lookup("alice").unwrap().unwrap(), digest_bytes(b"secret"));
    }

    #[test]
    fn username_must_match_exactly() {
        let (_dir, store) = store_with("alice,secret\n");
        assert!(store.lookup("alic").unwrap().is_none());
        assert!(store.lookup("alicee").unwrap().is_none());
        assert!(store.lookup("Alice").unwrap().is_none());
    }

    #[test]
    fn password_may_contain_delimiter() {
        // Only the first comma splits the record
        let (_dir, store) = store_with("alice,pa,ss\n");
        assert_eq!(store.lookup("alice").unwrap().unwrap(), digest_bytes(b"pa,ss"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("nope"));
        assert!(store.lookup("alice").is_err());
    }
}
