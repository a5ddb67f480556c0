//! Content hashing for change detection

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const DIGEST_LEN: usize = 32;

/// Fixed-width BLAKE3 digest. Exact-match comparison over the full digest;
/// any byte difference means "changed".
pub type Digest = [u8; DIGEST_LEN];

pub fn digest_bytes(data: &[u8]) -> Digest {
    *blake3::hash(data).as_bytes()
}

/// Hash a file's content in bounded chunks.
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).context("read for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_digest_matches_bytes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content = b"the quick brown fox";
        std::fs::write(&path, content).unwrap();
        assert_eq!(digest_file(&path).unwrap(), digest_bytes(content));
    }

    #[test]
    fn empty_file_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert_eq!(digest_file(&path).unwrap(), digest_bytes(b""));
    }

    #[test]
    fn large_file_crosses_buffer_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        let mut content = Vec::new();
        for i in 0..200_000u32 {
            content.push((i % 251) as u8);
        }
        f.write_all(&content).unwrap();
        drop(f);
        assert_eq!(digest_file(&path).unwrap(), digest_bytes(&content));
    }

    #[test]
    fn different_content_different_digest() {
        assert_ne!(digest_bytes(b"a"), digest_bytes(b"b"));
    }
}
