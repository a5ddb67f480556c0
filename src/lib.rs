//! Syncbox server library.
//!
//! - `protocol`: framed wire format shared with clients
//! - `checksum`: content digests
//! - `account`: credential store
//! - `config`: key=value server configuration
//! - `engine`: metadata comparison and locked content transfer
//! - `session`: per-connection request state machine
//! - `server`: poll-based dispatcher and worker pool
//! - `logger` / `journal`: operational log and transfer journal

pub mod account;
pub mod checksum;
pub mod config;
pub mod engine;
pub mod journal;
pub mod logger;
pub mod protocol;
pub mod server;
pub mod session;
