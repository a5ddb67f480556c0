//! Wire protocol for the syncbox framed transport.
//!
//! Every message starts with a fixed 16-byte header. Request and response
//! traffic is told apart by the magic, so a desynchronized peer is detected
//! at the first header boundary. File content is streamed raw after its
//! descriptor message and is never framed.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};

use crate::checksum::{Digest, DIGEST_LEN};

// Protocol header constants
pub const MAGIC_REQ: &[u8; 4] = b"SBXQ";
pub const MAGIC_RES: &[u8; 4] = b"SBXR";
pub const VERSION: u16 = 1;

/// Header layout: MAGIC (4) | VERSION (2) | OP (1) | STATUS (1) | LEN (4) | CLIENT_ID (4)
pub const HEADER_LEN: usize = 16;

/// Copy buffer size for chunked content transfer
pub const CHUNK_SIZE: usize = 4096;

// Maximum request body size. Bodies only carry paths and fixed-width fields;
// file content bypasses framing, so anything bigger than this is a broken or
// hostile peer.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Op byte used by control responses (assignment ack, busy) that do not
/// answer a specific operation.
pub const OP_NONE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Login = 1,
    SyncMeta = 2,
    SyncFile = 3,
    SyncEnd = 4,
    Rm = 5,
}

impl Op {
    pub fn from_u8(v: u8) -> Option<Op> {
        match v {
            1 => Some(Op::Login),
            2 => Some(Op::SyncMeta),
            3 => Some(Op::SyncFile),
            4 => Some(Op::SyncEnd),
            5 => Some(Op::Rm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 1,
    Fail = 2,
    Busy = 3,
    More = 4,
    Blocked = 5,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Status> {
        match v {
            1 => Some(Status::Ok),
            2 => Some(Status::Fail),
            3 => Some(Status::Busy),
            4 => Some(Status::More),
            5 => Some(Status::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// Fixed-size message header.
///
/// `op` and `status` stay raw bytes here so an unknown operation survives
/// decoding; the state machine decides what to do with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub direction: Direction,
    pub op: u8,
    pub status: u8,
    pub payload_len: u32,
    pub client_id: u32,
}

impl Header {
    pub fn request(op: Op, payload_len: u32, client_id: u32) -> Header {
        Header {
            direction: Direction::Request,
            op: op as u8,
            status: 0,
            payload_len,
            client_id,
        }
    }

    /// Response header. Responses never carry a payload in this protocol.
    pub fn response(op: u8, status: Status, client_id: u32) -> Header {
        Header {
            direction: Direction::Response,
            op,
            status: status as u8,
            payload_len: 0,
            client_id,
        }
    }

    pub fn status(&self) -> Option<Status> {
        Status::from_u8(self.status)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let magic = match self.direction {
            Direction::Request => MAGIC_REQ,
            Direction::Response => MAGIC_RES,
        };
        buf[0..4].copy_from_slice(magic);
        buf[4..6].copy_from_slice(&VERSION.to_le_bytes());
        buf[6] = self.op;
        buf[7] = self.status;
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.client_id.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Header> {
        let direction = if &buf[0..4] == MAGIC_REQ {
            Direction::Request
        } else if &buf[0..4] == MAGIC_RES {
            Direction::Response
        } else {
            bail!("invalid magic in message header");
        };
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != VERSION {
            bail!("protocol version mismatch: got {}, expected {}", version, VERSION);
        }
        let payload_len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len as usize > MAX_PAYLOAD {
            bail!("payload too large: {} bytes (max: {})", payload_len, MAX_PAYLOAD);
        }
        Ok(Header {
            direction,
            op: buf[6],
            status: buf[7],
            payload_len,
            client_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }
}

pub fn write_header<W: Write>(w: &mut W, header: &Header) -> Result<()> {
    w.write_all(&header.encode()).context("write header")?;
    Ok(())
}

pub fn read_header<R: Read>(r: &mut R) -> Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf).context("read header")?;
    Header::decode(&buf)
}

pub fn read_payload<R: Read>(r: &mut R, len: usize) -> Result<Vec<u8>> {
    if len > MAX_PAYLOAD {
        bail!("payload too large: {} bytes (max: {})", len, MAX_PAYLOAD);
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).context("read payload")?;
    Ok(buf)
}

/// Request trigger and lock probe tokens are a bare little-endian u32.
/// The value is ignored; only the arrival matters.
pub fn read_token<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).context("read token")?;
    Ok(u32::from_le_bytes(buf))
}

pub fn write_token<W: Write>(w: &mut W, v: u32) -> Result<()> {
    w.write_all(&v.to_le_bytes()).context("write token")?;
    Ok(())
}

fn read_u16_at(buf: &[u8], off: usize) -> Result<u16> {
    if buf.len() < off + 2 {
        bail!("truncated body");
    }
    Ok(u16::from_le_bytes([buf[off], buf[off + 1]]))
}

fn take_str(buf: &[u8], off: usize, len: usize) -> Result<&str> {
    if buf.len() < off + len {
        bail!("truncated body");
    }
    std::str::from_utf8(&buf[off..off + len]).context("utf8 field")
}

fn take_digest(buf: &[u8], off: usize) -> Result<Digest> {
    if buf.len() < off + DIGEST_LEN {
        bail!("truncated digest");
    }
    let mut d = [0u8; DIGEST_LEN];
    d.copy_from_slice(&buf[off..off + DIGEST_LEN]);
    Ok(d)
}

/// Login body: ulen u16 | username | digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginBody {
    pub user: String,
    pub digest: Digest,
}

impl LoginBody {
    pub fn encode(&self) -> Vec<u8> {
        let user = self.user.as_bytes();
        let mut buf = Vec::with_capacity(2 + user.len() + DIGEST_LEN);
        buf.extend_from_slice(&(user.len() as u16).to_le_bytes());
        buf.extend_from_slice(user);
        buf.extend_from_slice(&self.digest);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<LoginBody> {
        let ulen = read_u16_at(buf, 0)? as usize;
        let user = take_str(buf, 2, ulen)?.to_string();
        let digest = take_digest(buf, 2 + ulen)?;
        Ok(LoginBody { user, digest })
    }
}

/// Sync-meta body: plen u16 | path | mode u32 | atime i64 | mtime i64 | digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBody {
    pub path: String,
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub digest: Digest,
}

impl MetaBody {
    pub fn encode(&self) -> Vec<u8> {
        let path = self.path.as_bytes();
        let mut buf = Vec::with_capacity(2 + path.len() + 4 + 8 + 8 + DIGEST_LEN);
        buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
        buf.extend_from_slice(path);
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.digest);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<MetaBody> {
        let plen = read_u16_at(buf, 0)? as usize;
        let path = take_str(buf, 2, plen)?.to_string();
        let mut off = 2 + plen;
        if buf.len() < off + 4 + 8 + 8 + DIGEST_LEN {
            bail!("truncated meta body");
        }
        let mode = u32::from_le_bytes(buf[off..off + 4].try_into().context("mode bytes")?);
        off += 4;
        let atime = i64::from_le_bytes(buf[off..off + 8].try_into().context("atime bytes")?);
        off += 8;
        let mtime = i64::from_le_bytes(buf[off..off + 8].try_into().context("mtime bytes")?);
        off += 8;
        let digest = take_digest(buf, off)?;
        Ok(MetaBody { path, mode, atime, mtime, digest })
    }
}

/// Rm body: plen u16 | path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RmBody {
    pub path: String,
}

impl RmBody {
    pub fn encode(&self) -> Vec<u8> {
        let path = self.path.as_bytes();
        let mut buf = Vec::with_capacity(2 + path.len());
        buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
        buf.extend_from_slice(path);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<RmBody> {
        let plen = read_u16_at(buf, 0)? as usize;
        let path = take_str(buf, 2, plen)?.to_string();
        Ok(RmBody { path })
    }
}

/// File-transfer descriptor body: data_len u64
pub fn encode_file_descriptor(data_len: u64) -> [u8; 8] {
    data_len.to_le_bytes()
}

pub fn decode_file_descriptor(buf: &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        bail!("truncated file descriptor");
    }
    Ok(u64::from_le_bytes(buf[0..8].try_into().context("descriptor bytes")?))
}
