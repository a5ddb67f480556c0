//! File sync engine
//!
//! Decides whether a client's file needs retransmission and performs the
//! locked, chunked content transfer. Paths always resolve under the
//! authenticated user's home root; concurrent writers to the same file are
//! serialized by an exclusive advisory lock on the destination.

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use crate::checksum;
use crate::protocol::{self, Direction, Header, MetaBody, Op, Status, CHUNK_SIZE};

/// Mode for directories the server creates on its own (home roots, synced
/// directory entries before their metadata is applied).
pub const DIR_MODE: u32 = 0o755;

const FMT_MASK: u32 = 0o170000;
const DIR_FLAG: u32 = 0o040000;

pub fn is_dir_mode(mode: u32) -> bool {
    mode & FMT_MASK == DIR_FLAG
}

/// Per-user base directory: `{root}/{username}`.
pub fn user_root(root: &Path, user: &str) -> PathBuf {
    root.join(user)
}

/// Create a user's home root if absent. Called lazily on login.
pub fn ensure_user_root(root: &Path, user: &str) -> Result<PathBuf> {
    let home = user_root(root, user);
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(&home)
        .with_context(|| format!("create home root {}", home.display()))?;
    Ok(home)
}

/// Resolve a client-supplied path under the user's home root.
///
/// Clients send absolute-looking paths rooted at their own sync tree
/// ("/notes.txt"); leading separators are treated as relative to the home
/// root. NUL bytes, `..`, and prefix/root components are rejected so a
/// request can never escape the tree.
pub fn resolve_request_path(home: &Path, raw: &str) -> Result<PathBuf> {
    if raw.contains('\0') {
        bail!("path contains NUL byte");
    }
    let rel = raw.trim_start_matches('/');
    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            other => bail!("path contains disallowed component: {:?}", other),
        }
    }
    Ok(home.join(safe))
}

/// Decision from comparing client metadata against the local entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaOutcome {
    /// Content matches; any metadata drift was already corrected.
    UpToDate,
    /// Content transfer required. `apply_after` is set when the entry did
    /// not exist yet, so mode and times must be applied once it is created.
    NeedsContent { apply_after: bool },
}

/// Compare the local entry at `meta.path` against the client's declared
/// metadata, applying mode and time corrections in place.
pub fn sync_meta(home: &Path, meta: &MetaBody) -> Result<(PathBuf, MetaOutcome)> {
    let target = resolve_request_path(home, &meta.path)?;
    let md = match fs::symlink_metadata(&target) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok((target, MetaOutcome::NeedsContent { apply_after: true }));
        }
        Err(e) => return Err(e).with_context(|| format!("stat {}", target.display())),
        Ok(md) => md,
    };

    if md.permissions().mode() != meta.mode {
        fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode & 0o7777))
            .with_context(|| format!("chmod {}", target.display()))?;
    }
    let atime = FileTime::from_last_access_time(&md);
    let mtime = FileTime::from_last_modification_time(&md);
    if atime.unix_seconds() != meta.atime || mtime.unix_seconds() != meta.mtime {
        filetime::set_file_times(
            &target,
            FileTime::from_unix_time(meta.atime, 0),
            FileTime::from_unix_time(meta.mtime, 0),
        )
        .with_context(|| format!("set times on {}", target.display()))?;
    }

    // Directory entries never carry content
    if md.is_dir() {
        return Ok((target, MetaOutcome::UpToDate));
    }
    let hash = checksum::digest_file(&target)?;
    if hash != meta.digest {
        Ok((target, MetaOutcome::NeedsContent { apply_after: false }))
    } else {
        Ok((target, MetaOutcome::UpToDate))
    }
}

fn apply_metadata(target: &Path, meta: &MetaBody) -> Result<()> {
    fs::set_permissions(target, fs::Permissions::from_mode(meta.mode & 0o7777))
        .with_context(|| format!("chmod {}", target.display()))?;
    filetime::set_file_times(
        target,
        FileTime::from_unix_time(meta.atime, 0),
        FileTime::from_unix_time(meta.mtime, 0),
    )
    .with_context(|| format!("set times on {}", target.display()))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Full declared length received and metadata settled.
    Completed { bytes: u64 },
    /// Target was a directory; created, nothing streamed.
    Directory,
    /// The content stream ended early. The partial file is left as-is and
    /// no success response may be sent for the operation.
    Broken { got: u64, want: u64 },
    /// Lock-wait budget exhausted; the client was told FAIL.
    LockTimeout,
}

/// Receive file content after a More response.
///
/// Reads the transfer descriptor, arbitrates the exclusive advisory lock
/// with the client (Blocked per failed probe, Ok once held), then streams
/// the declared length in bounded chunks.
pub fn receive_file<S: Read + Write>(
    stream: &mut S,
    target: &Path,
    meta: &MetaBody,
    apply_after: bool,
    conn_id: u32,
    lock_wait: Option<Duration>,
) -> Result<TransferOutcome> {
    let hdr = protocol::read_header(stream).context("read transfer descriptor")?;
    if hdr.direction != Direction::Request || Op::from_u8(hdr.op) != Some(Op::SyncFile) {
        bail!("expected SYNC_FILE descriptor, got op {:#x}", hdr.op);
    }
    let payload = protocol::read_payload(stream, hdr.payload_len as usize)?;
    let total = protocol::decode_file_descriptor(&payload)?;

    if is_dir_mode(meta.mode) {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(target)
            .with_context(|| format!("create directory {}", target.display()))?;
        if apply_after {
            apply_metadata(target, meta)?;
        }
        return Ok(TransferOutcome::Directory);
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(target)
        .with_context(|| format!("open {} for writing", target.display()))?;

    // Lock arbitration: the client paces retries by sending a probe token
    // before each verdict. Blocked tells it to probe again; Ok means the
    // lock is held and streaming may begin.
    let deadline = lock_wait.map(|d| Instant::now() + d);
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                protocol::read_token(stream)?;
                protocol::write_header(
                    stream,
                    &Header::response(Op::SyncFile as u8, Status::Ok, conn_id),
                )?;
                break;
            }
            Err(_) => {
                protocol::read_token(stream)?;
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    protocol::write_header(
                        stream,
                        &Header::response(Op::SyncFile as u8, Status::Fail, conn_id),
                    )?;
                    return Ok(TransferOutcome::LockTimeout);
                }
                protocol::write_header(
                    stream,
                    &Header::response(Op::SyncFile as u8, Status::Blocked, conn_id),
                )?;
            }
        }
    }

    let mut buf = [0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    let mut broken = false;
    while received < total {
        let want = ((total - received) as usize).min(CHUNK_SIZE);
        if stream.read_exact(&mut buf[..want]).is_err() {
            broken = true;
            break;
        }
        file.write_all(&buf[..want])
            .with_context(|| format!("write {}", target.display()))?;
        received += want as u64;
    }

    fs2::FileExt::unlock(&file).with_context(|| format!("unlock {}", target.display()))?;
    drop(file);

    if broken {
        return Ok(TransferOutcome::Broken { got: received, want: total });
    }
    if apply_after {
        apply_metadata(target, meta)?;
    }
    Ok(TransferOutcome::Completed { bytes: total })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// Explicit no-op: the path did not exist.
    NotFound,
}

/// Remove an entry. Directories are removed non-recursively; a non-empty
/// directory is logged and left in place. No lock is taken, so a
/// simultaneous sync of the same path is a race the client owns.
pub fn remove(home: &Path, raw_path: &str) -> Result<RemoveOutcome> {
    let target = resolve_request_path(home, raw_path)?;
    let md = match fs::symlink_metadata(&target) {
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RemoveOutcome::NotFound),
        Err(e) => return Err(e).with_context(|| format!("stat {}", target.display())),
        Ok(md) => md,
    };
    if md.is_dir() {
        if let Err(e) = fs::remove_dir(&target) {
            eprintln!("rmdir {} failed: {}", target.display(), e);
        }
    } else {
        fs::remove_file(&target).with_context(|| format!("unlink {}", target.display()))?;
    }
    Ok(RemoveOutcome::Removed)
}
