//! Per-connection protocol state machine.
//!
//! One call to [`handle_request`] runs exactly one request to completion:
//! `AwaitingHeader -> Dispatch(op) -> flow -> Done`. A closed stream or read
//! error at the header boundary is a logout; a request with the wrong magic
//! or an unknown op is dropped and the connection stays open.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::account::AccountStore;
use crate::checksum::Digest;
use crate::config::Config;
use crate::engine::{self, MetaOutcome, RemoveOutcome, TransferOutcome};
use crate::journal::{TransferEntry, TransferJournal, TransferStatus};
use crate::logger::Logger;
use crate::protocol::{
    self, Direction, Header, LoginBody, MetaBody, Op, RmBody, Status, HEADER_LEN,
};

/// Authenticated client bound to an open connection.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub conn_id: u32,
    pub user: String,
    pub digest: Digest,
}

/// Connection-id to client-record table. A connection appears here only
/// between a successful login and the matching logout.
pub struct Registry {
    clients: Mutex<HashMap<u32, ClientRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { clients: Mutex::new(HashMap::new()) }
    }

    /// Bind a record to a connection. Re-login on an active connection is
    /// permitted; the prior record is released here and the caller is told
    /// about it.
    pub fn insert(&self, record: ClientRecord) -> Option<ClientRecord> {
        self.clients.lock().insert(record.conn_id, record)
    }

    pub fn remove(&self, conn_id: u32) -> Option<ClientRecord> {
        self.clients.lock().remove(&conn_id)
    }

    pub fn user_of(&self, conn_id: u32) -> Option<String> {
        self.clients.lock().get(&conn_id).map(|r| r.user.clone())
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state every worker needs to run a request.
pub struct SessionContext {
    pub config: Config,
    pub accounts: AccountStore,
    pub registry: Registry,
    pub logger: Arc<dyn Logger>,
    pub journal: Option<TransferJournal>,
}

impl SessionContext {
    pub fn new(config: Config, logger: Arc<dyn Logger>) -> Self {
        let accounts = AccountStore::new(&config.account_path);
        let journal = config.journal.as_ref().map(TransferJournal::new);
        SessionContext { config, accounts, registry: Registry::new(), logger, journal }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Request finished; the connection stays open and watchable.
    Continue,
    /// Stream closed or errored; the record is released and the caller
    /// must drop the connection.
    Closed,
}

/// Run one protocol step on `stream`.
pub fn handle_request<S: Read + Write>(
    ctx: &SessionContext,
    stream: &mut S,
    conn_id: u32,
) -> Result<RequestOutcome> {
    let mut raw = [0u8; HEADER_LEN];
    if stream.read_exact(&mut raw).is_err() {
        logout(ctx, conn_id);
        return Ok(RequestOutcome::Closed);
    }
    let hdr = match Header::decode(&raw) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("conn {}: ignoring malformed header: {}", conn_id, e);
            return Ok(RequestOutcome::Continue);
        }
    };
    if hdr.direction != Direction::Request {
        eprintln!("conn {}: ignoring non-request message", conn_id);
        drain_payload(stream, hdr.payload_len as usize)?;
        return Ok(RequestOutcome::Continue);
    }

    match Op::from_u8(hdr.op) {
        Some(Op::Login) => login_flow(ctx, stream, conn_id, &hdr)?,
        Some(Op::SyncMeta) => sync_flow(ctx, stream, conn_id, &hdr)?,
        Some(Op::SyncEnd) => {
            protocol::write_header(
                stream,
                &Header::response(Op::SyncEnd as u8, Status::Ok, conn_id),
            )?;
        }
        Some(Op::Rm) => rm_flow(ctx, stream, conn_id, &hdr)?,
        Some(Op::SyncFile) => {
            // only valid as the follow-up inside a sync flow
            eprintln!("conn {}: SYNC_FILE outside a sync flow, dropping", conn_id);
            drain_payload(stream, hdr.payload_len as usize)?;
        }
        None => {
            eprintln!("conn {}: unknown op {:#x}, dropping request", conn_id, hdr.op);
            drain_payload(stream, hdr.payload_len as usize)?;
        }
    }
    Ok(RequestOutcome::Continue)
}

fn logout(ctx: &SessionContext, conn_id: u32) {
    if let Some(record) = ctx.registry.remove(conn_id) {
        eprintln!("[{}] [conn = {}] logout", record.user, conn_id);
        ctx.logger.logout(&record.user, conn_id);
    }
}

/// Discard a request body we are not going to act on, so the stream stays
/// aligned at the next header boundary.
fn drain_payload<R: Read>(stream: &mut R, mut len: usize) -> Result<()> {
    let mut buf = [0u8; 4096];
    while len > 0 {
        let want = len.min(buf.len());
        stream.read_exact(&mut buf[..want]).context("drain payload")?;
        len -= want;
    }
    Ok(())
}

fn login_flow<S: Read + Write>(
    ctx: &SessionContext,
    stream: &mut S,
    conn_id: u32,
    hdr: &Header,
) -> Result<()> {
    let payload = protocol::read_payload(stream, hdr.payload_len as usize)?;
    let login = LoginBody::decode(&payload)?;

    let stored = ctx.accounts.lookup(&login.user)?;
    let ok = match stored {
        Some(digest) => digest == login.digest,
        None => false,
    };
    if !ok {
        eprintln!("login failed for {:?}", login.user);
        ctx.logger.login_failed(&login.user);
        protocol::write_header(
            stream,
            &Header::response(Op::Login as u8, Status::Fail, conn_id),
        )?;
        return Ok(());
    }

    engine::ensure_user_root(&ctx.config.root, &login.user)?;
    let record = ClientRecord { conn_id, user: login.user.clone(), digest: login.digest };
    if let Some(old) = ctx.registry.insert(record) {
        eprintln!(
            "conn {}: re-login as {:?} replaces active session for {:?}",
            conn_id, login.user, old.user
        );
    }
    eprintln!("[{}] [conn = {}] login", login.user, conn_id);
    ctx.logger.login(&login.user, conn_id);
    protocol::write_header(stream, &Header::response(Op::Login as u8, Status::Ok, conn_id))?;
    Ok(())
}

/// Reject an operation that requires authentication.
fn reject_unauthenticated<S: Read + Write>(
    stream: &mut S,
    conn_id: u32,
    op: Op,
    payload_len: usize,
) -> Result<()> {
    eprintln!("conn {}: {:?} before login", conn_id, op);
    drain_payload(stream, payload_len)?;
    protocol::write_header(stream, &Header::response(op as u8, Status::Fail, conn_id))?;
    Ok(())
}

fn sync_flow<S: Read + Write>(
    ctx: &SessionContext,
    stream: &mut S,
    conn_id: u32,
    hdr: &Header,
) -> Result<()> {
    let Some(user) = ctx.registry.user_of(conn_id) else {
        return reject_unauthenticated(stream, conn_id, Op::SyncMeta, hdr.payload_len as usize);
    };
    let payload = protocol::read_payload(stream, hdr.payload_len as usize)?;
    let meta = MetaBody::decode(&payload)?;
    let home = engine::user_root(&ctx.config.root, &user);

    let (target, outcome) = engine::sync_meta(&home, &meta)?;
    let needs_content = matches!(outcome, MetaOutcome::NeedsContent { .. });
    let status = if needs_content { Status::More } else { Status::Ok };
    protocol::write_header(stream, &Header::response(Op::SyncMeta as u8, status, conn_id))?;

    if let MetaOutcome::NeedsContent { apply_after } = outcome {
        let transferred = engine::receive_file(
            stream,
            &target,
            &meta,
            apply_after,
            conn_id,
            ctx.config.lock_wait,
        )?;
        match transferred {
            TransferOutcome::Completed { bytes } => {
                record_transfer(ctx, &user, &target, bytes, bytes, TransferStatus::Completed);
                ctx.logger.sync(&user, &target, true);
                protocol::write_header(
                    stream,
                    &Header::response(Op::SyncFile as u8, Status::Ok, conn_id),
                )?;
            }
            TransferOutcome::Directory => {
                ctx.logger.sync(&user, &target, true);
                protocol::write_header(
                    stream,
                    &Header::response(Op::SyncFile as u8, Status::Ok, conn_id),
                )?;
            }
            TransferOutcome::Broken { got, want } => {
                // no success response: the client must notice and retry
                eprintln!("broken transfer for {} ({}/{} bytes)", target.display(), got, want);
                ctx.logger.broken_transfer(&user, &target, got, want);
                record_transfer(ctx, &user, &target, want, got, TransferStatus::Broken);
            }
            TransferOutcome::LockTimeout => {
                eprintln!("lock wait exhausted for {}", target.display());
                ctx.logger.error("lock_wait", &target.display().to_string());
                record_transfer(ctx, &user, &target, 0, 0, TransferStatus::Broken);
            }
        }
    } else {
        ctx.logger.sync(&user, &target, false);
    }
    Ok(())
}

fn record_transfer(
    ctx: &SessionContext,
    user: &str,
    target: &Path,
    expected: u64,
    received: u64,
    status: TransferStatus,
) {
    if let Some(journal) = &ctx.journal {
        let entry = TransferEntry::now(user, target, expected, received, status);
        if let Err(e) = journal.record(&entry) {
            eprintln!("journal write failed: {}", e);
        }
    }
}

fn rm_flow<S: Read + Write>(
    ctx: &SessionContext,
    stream: &mut S,
    conn_id: u32,
    hdr: &Header,
) -> Result<()> {
    let Some(user) = ctx.registry.user_of(conn_id) else {
        return reject_unauthenticated(stream, conn_id, Op::Rm, hdr.payload_len as usize);
    };
    let payload = protocol::read_payload(stream, hdr.payload_len as usize)?;
    let rm = RmBody::decode(&payload)?;
    let home = engine::user_root(&ctx.config.root, &user);

    match engine::remove(&home, &rm.path)? {
        RemoveOutcome::Removed => ctx.logger.remove(&user, Path::new(&rm.path)),
        RemoveOutcome::NotFound => {
            eprintln!("rm {:?}: no such entry (no-op)", rm.path);
        }
    }
    // removal always acknowledges OK
    protocol::write_header(stream, &Header::response(Op::Rm as u8, Status::Ok, conn_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::digest_bytes;
    use crate::logger::NoopLogger;
    use std::io::Cursor;
    use std::path::PathBuf;

    struct WireBuf {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl WireBuf {
        fn new(input: Vec<u8>) -> Self {
            WireBuf { input: Cursor::new(input), output: Vec::new() }
        }

        fn responses(&self) -> Vec<Header> {
            let mut out = Vec::new();
            for chunk in self.output.chunks_exact(HEADER_LEN) {
                let mut raw = [0u8; HEADER_LEN];
                raw.copy_from_slice(chunk);
                out.push(Header::decode(&raw).unwrap());
            }
            out
        }
    }

    impl Read for WireBuf {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for WireBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        ctx: SessionContext,
        root: PathBuf,
    }

    fn fixture(accounts: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("box");
        std::fs::create_dir_all(&root).unwrap();
        let account_path = dir.path().join("accounts");
        std::fs::write(&account_path, accounts).unwrap();
        let config = Config::parse(&format!(
            "path={}\naccount_path={}\nthread=2\n",
            root.display(),
            account_path.display()
        ))
        .unwrap();
        let ctx = SessionContext::new(config, Arc::new(NoopLogger));
        Fixture { _root: dir, ctx, root }
    }

    fn framed(op: Op, body: &[u8], conn: u32) -> Vec<u8> {
        let mut buf = Header::request(op, body.len() as u32, conn).encode().to_vec();
        buf.extend_from_slice(body);
        buf
    }

    fn do_login(ctx: &SessionContext, conn: u32, user: &str, pass: &[u8]) -> Vec<Header> {
        let body = LoginBody { user: user.to_string(), digest: digest_bytes(pass) }.encode();
        let mut wire = WireBuf::new(framed(Op::Login, &body, conn));
        assert_eq!(
            handle_request(ctx, &mut wire, conn).unwrap(),
            RequestOutcome::Continue
        );
        wire.responses()
    }

    #[test]
    fn login_success_creates_record_and_home() {
        let fx = fixture("alice,secret\n");
        let responses = do_login(&fx.ctx, 5, "alice", b"secret");
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), Some(Status::Ok));
        assert_eq!(responses[0].client_id, 5);
        assert_eq!(fx.ctx.registry.user_of(5).as_deref(), Some("alice"));
        assert!(fx.root.join("alice").is_dir());
    }

    #[test]
    fn login_wrong_password_fails() {
        let fx = fixture("alice,secret\n");
        let responses = do_login(&fx.ctx, 5, "alice", b"wrong");
        assert_eq!(responses[0].status(), Some(Status::Fail));
        assert!(fx.ctx.registry.user_of(5).is_none());
        assert!(!fx.root.join("alice").exists());
    }

    #[test]
    fn login_unknown_user_fails() {
        let fx = fixture("alice,secret\n");
        let responses = do_login(&fx.ctx, 5, "mallory", b"secret");
        assert_eq!(responses[0].status(), Some(Status::Fail));
        assert!(fx.ctx.registry.is_empty());
    }

    #[test]
    fn relogin_replaces_record() {
        let fx = fixture("alice,secret\nbob,pw\n");
        do_login(&fx.ctx, 5, "alice", b"secret");
        do_login(&fx.ctx, 5, "bob", b"pw");
        assert_eq!(fx.ctx.registry.user_of(5).as_deref(), Some("bob"));
        assert_eq!(fx.ctx.registry.len(), 1);
    }

    #[test]
    fn sync_before_login_is_rejected() {
        let fx = fixture("alice,secret\n");
        let meta = MetaBody {
            path: "/notes.txt".to_string(),
            mode: 0o100644,
            atime: 0,
            mtime: 0,
            digest: digest_bytes(b"x"),
        };
        let mut wire = WireBuf::new(framed(Op::SyncMeta, &meta.encode(), 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        let responses = wire.responses();
        assert_eq!(responses[0].status(), Some(Status::Fail));
        assert!(!fx.root.join("alice").exists());
    }

    #[test]
    fn rm_before_login_is_rejected() {
        let fx = fixture("alice,secret\n");
        let body = RmBody { path: "/x".to_string() }.encode();
        let mut wire = WireBuf::new(framed(Op::Rm, &body, 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        assert_eq!(wire.responses()[0].status(), Some(Status::Fail));
    }

    #[test]
    fn sync_end_acknowledges() {
        let fx = fixture("alice,secret\n");
        let mut wire = WireBuf::new(framed(Op::SyncEnd, &[], 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        let responses = wire.responses();
        assert_eq!(responses[0].status(), Some(Status::Ok));
        assert_eq!(Op::from_u8(responses[0].op), Some(Op::SyncEnd));
    }

    #[test]
    fn eof_at_header_is_logout() {
        let fx = fixture("alice,secret\n");
        do_login(&fx.ctx, 5, "alice", b"secret");
        let mut wire = WireBuf::new(Vec::new());
        assert_eq!(
            handle_request(&fx.ctx, &mut wire, 5).unwrap(),
            RequestOutcome::Closed
        );
        assert!(fx.ctx.registry.user_of(5).is_none());
    }

    #[test]
    fn unknown_op_drains_and_stays_connected() {
        let fx = fixture("alice,secret\n");
        let mut raw = Header::request(Op::Login, 3, 5).encode();
        raw[6] = 0x77; // unknown op with a 3-byte body
        let mut input = raw.to_vec();
        input.extend_from_slice(b"abc");
        // a well-formed request must still parse afterwards
        input.extend_from_slice(&framed(Op::SyncEnd, &[], 5));
        let mut wire = WireBuf::new(input);
        assert_eq!(handle_request(&fx.ctx, &mut wire, 5).unwrap(), RequestOutcome::Continue);
        assert_eq!(handle_request(&fx.ctx, &mut wire, 5).unwrap(), RequestOutcome::Continue);
        let responses = wire.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(Op::from_u8(responses[0].op), Some(Op::SyncEnd));
    }

    #[test]
    fn response_magic_request_is_ignored() {
        let fx = fixture("alice,secret\n");
        let bogus = Header::response(Op::Login as u8, Status::Ok, 5);
        let mut wire = WireBuf::new(bogus.encode().to_vec());
        assert_eq!(handle_request(&fx.ctx, &mut wire, 5).unwrap(), RequestOutcome::Continue);
        assert!(wire.responses().is_empty());
    }

    #[test]
    fn full_sync_flow_for_new_file() {
        let fx = fixture("alice,secret\n");
        do_login(&fx.ctx, 5, "alice", b"secret");

        let content = b"hello syncbox";
        let meta = MetaBody {
            path: "/notes.txt".to_string(),
            mode: 0o100644,
            atime: 1_700_000_000,
            mtime: 1_700_000_000,
            digest: digest_bytes(content),
        };
        let mut input = framed(Op::SyncMeta, &meta.encode(), 5);
        let desc = protocol::encode_file_descriptor(content.len() as u64);
        input.extend_from_slice(&framed(Op::SyncFile, &desc, 5));
        input.extend_from_slice(&1u32.to_le_bytes()); // lock probe
        input.extend_from_slice(content);

        let mut wire = WireBuf::new(input);
        assert_eq!(handle_request(&fx.ctx, &mut wire, 5).unwrap(), RequestOutcome::Continue);

        let responses = wire.responses();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0].status(), Some(Status::More));
        assert_eq!(responses[1].status(), Some(Status::Ok)); // lock verdict
        assert_eq!(responses[2].status(), Some(Status::Ok)); // transfer complete
        assert_eq!(Op::from_u8(responses[2].op), Some(Op::SyncFile));

        let target = fx.root.join("alice/notes.txt");
        assert_eq!(std::fs::read(&target).unwrap(), content);
    }

    #[test]
    fn sync_flow_unchanged_file_is_ok_only() {
        let fx = fixture("alice,secret\n");
        do_login(&fx.ctx, 5, "alice", b"secret");
        let target = fx.root.join("alice/notes.txt");
        std::fs::write(&target, b"same").unwrap();
        let md = std::fs::symlink_metadata(&target).unwrap();
        use filetime::FileTime;
        use std::os::unix::fs::PermissionsExt;
        let meta = MetaBody {
            path: "/notes.txt".to_string(),
            mode: md.permissions().mode(),
            atime: FileTime::from_last_access_time(&md).unix_seconds(),
            mtime: FileTime::from_last_modification_time(&md).unix_seconds(),
            digest: digest_bytes(b"same"),
        };
        let mut wire = WireBuf::new(framed(Op::SyncMeta, &meta.encode(), 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        let responses = wire.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].status(), Some(Status::Ok));
    }

    #[test]
    fn rm_flow_unlinks_and_acknowledges() {
        let fx = fixture("alice,secret\n");
        do_login(&fx.ctx, 5, "alice", b"secret");
        let target = fx.root.join("alice/notes.txt");
        std::fs::write(&target, b"x").unwrap();

        let body = RmBody { path: "/notes.txt".to_string() }.encode();
        let mut wire = WireBuf::new(framed(Op::Rm, &body, 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        assert_eq!(wire.responses()[0].status(), Some(Status::Ok));
        assert!(!target.exists());

        // removing again is a no-op that still acknowledges OK
        let body = RmBody { path: "/notes.txt".to_string() }.encode();
        let mut wire = WireBuf::new(framed(Op::Rm, &body, 5));
        handle_request(&fx.ctx, &mut wire, 5).unwrap();
        assert_eq!(wire.responses()[0].status(), Some(Status::Ok));
    }

    #[test]
    fn journal_records_completed_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("box");
        std::fs::create_dir_all(&root).unwrap();
        let account_path = dir.path().join("accounts");
        std::fs::write(&account_path, "alice,secret\n").unwrap();
        let journal_path = dir.path().join("transfers.jsonl");
        let config = Config::parse(&format!(
            "path={}\naccount_path={}\njournal={}\n",
            root.display(),
            account_path.display(),
            journal_path.display()
        ))
        .unwrap();
        let ctx = SessionContext::new(config, Arc::new(NoopLogger));
        do_login(&ctx, 5, "alice", b"secret");

        let content = b"abc";
        let meta = MetaBody {
            path: "/j.txt".to_string(),
            mode: 0o100644,
            atime: 1_700_000_000,
            mtime: 1_700_000_000,
            digest: digest_bytes(content),
        };
        let mut input = framed(Op::SyncMeta, &meta.encode(), 5);
        let desc = protocol::encode_file_descriptor(content.len() as u64);
        input.extend_from_slice(&framed(Op::SyncFile, &desc, 5));
        input.extend_from_slice(&1u32.to_le_bytes());
        input.extend_from_slice(content);
        let mut wire = WireBuf::new(input);
        handle_request(&ctx, &mut wire, 5).unwrap();

        let entries = TransferJournal::new(&journal_path).read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, TransferStatus::Completed);
        assert_eq!(entries[0].bytes_received, 3);
    }
}
