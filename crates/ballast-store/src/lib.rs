//! Object-store client for the ballast NBD server.
//!
//! Wraps [`object_store`] with the small typed surface the block engine and
//! lease manager need: GET/PUT, conditional writes keyed by etag, and HEAD.
//! Production deployments talk to an S3-compatible endpoint; tests use the
//! in-memory backend.

#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod key;

pub use client::{ObjectClient, PutOutcome, S3Config};
pub use error::{StoreError, StoreResult};
pub use key::{block_key, lock_key};
