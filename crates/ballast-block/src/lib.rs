//! S3-backed Network Block Device server
//!
//! Exposes named sparse block devices ("exports") over the NBD
//! fixed-newstyle protocol, persisting 128 KiB blocks as objects in an
//! S3-compatible store. Each connection negotiates one export, takes an
//! exclusive lease on it, and buffers writes in memory until the client
//! issues a FLUSH.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ NBD Client  │
//! │ (nbd-client)│
//! └──────┬──────┘
//!        │ NBD fixed-newstyle
//! ┌──────▼──────┐
//! │  NbdServer  │  one Session per connection
//! │  - Session  │  ── LeaseManager (locks/{export})
//! │  - Storage  │  ── ExportStorage (blocks/{export}/…)
//! └──────┬──────┘
//!        │
//! ┌──────▼───────┐
//! │ ballast-store│  S3 / in-memory
//! └──────────────┘
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod lease;
pub mod nbd;
pub mod server;
pub mod storage;

pub use config::{ConfigError, KeepaliveConfig, ServerConfig};
pub use error::{BlockError, BlockResult, NbdErrno};
pub use lease::{LeaseHandle, LeaseManager, LeaseRecord};
pub use server::{NbdServer, ShutdownHandle};
pub use storage::ExportStorage;

/// Unit of persistence: one object per non-zero 128 KiB block.
pub const BLOCK_SIZE: u64 = 128 * 1024;
