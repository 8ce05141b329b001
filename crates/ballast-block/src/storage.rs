//! Block-mapped storage engine.
//!
//! Translates random-offset byte I/O into block-aligned object operations.
//! One `ExportStorage` exists per session, bound to the negotiated export
//! and its lease. Writes are buffered in the per-session dirty map and
//! persisted only on flush; reads consult the dirty map first, so the
//! session always observes its own writes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ballast_store::{block_key, ObjectClient, StoreError, StoreResult};

use crate::error::{BlockError, BlockResult};
use crate::lease::LeaseHandle;
use crate::BLOCK_SIZE;

/// A buffered block awaiting flush.
///
/// `known_absent` records that no backing object existed when the entry was
/// populated; together with an all-zero buffer it lets the flush skip the
/// upload entirely.
#[derive(Debug, Clone)]
struct DirtyBlock {
    data: Vec<u8>,
    known_absent: bool,
}

impl DirtyBlock {
    fn is_zero(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }
}

/// The sub-range of one block touched by a byte-range operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockSpan {
    pub index: u64,
    pub start: usize,
    pub end: usize,
}

impl BlockSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_full_block(&self) -> bool {
        self.start == 0 && self.end == BLOCK_SIZE as usize
    }
}

/// Decompose `[offset, offset + length)` into per-block sub-ranges, in
/// block order. `length` must be non-zero.
pub(crate) fn block_spans(offset: u64, length: u64) -> Vec<BlockSpan> {
    debug_assert!(length > 0);
    let first = offset / BLOCK_SIZE;
    let last = (offset + length - 1) / BLOCK_SIZE;
    let end = offset + length;

    (first..=last)
        .map(|index| {
            let block_start = index * BLOCK_SIZE;
            let lo = offset.max(block_start) - block_start;
            let hi = end.min(block_start + BLOCK_SIZE) - block_start;
            BlockSpan {
                index,
                start: lo as usize,
                end: hi as usize,
            }
        })
        .collect()
}

/// Per-session storage engine for one export.
pub struct ExportStorage {
    export: String,
    export_size: u64,
    client: Arc<ObjectClient>,
    lease: LeaseHandle,
    dirty: RwLock<HashMap<u64, DirtyBlock>>,
    flush_parallelism: usize,
}

impl ExportStorage {
    /// Bind a storage engine to `export` with its held lease.
    pub fn new(
        export: impl Into<String>,
        export_size: u64,
        client: Arc<ObjectClient>,
        lease: LeaseHandle,
        flush_parallelism: usize,
    ) -> Self {
        Self {
            export: export.into(),
            export_size,
            client,
            lease,
            dirty: RwLock::new(HashMap::new()),
            flush_parallelism,
        }
    }

    /// Export name this engine is bound to.
    pub fn export(&self) -> &str {
        &self.export
    }

    /// The session's lease on the export.
    pub fn lease(&self) -> &LeaseHandle {
        &self.lease
    }

    /// Number of blocks currently buffered.
    pub async fn dirty_blocks(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Release the lease. The dirty buffer is discarded with the engine;
    /// only data the client flushed is durable.
    pub async fn release(self) {
        self.lease.release().await;
        debug!(export = %self.export, "storage released");
    }

    fn check_range(&self, offset: u64, length: u32) -> BlockResult<()> {
        let end = offset.checked_add(length as u64).ok_or(BlockError::Range {
            offset,
            length,
            size: self.export_size,
        })?;
        if end > self.export_size {
            return Err(BlockError::Range {
                offset,
                length,
                size: self.export_size,
            });
        }
        Ok(())
    }

    /// Read `length` bytes at `offset`.
    ///
    /// Holds the read lock while consulting the dirty map; blocks not in
    /// the map are fetched concurrently and reassembled in order. Missing
    /// objects read as zeros.
    pub async fn read(&self, offset: u64, length: u32) -> BlockResult<Bytes> {
        if self.lease.is_lost() {
            return Err(BlockError::LeaseLost(self.export.clone()));
        }
        self.check_range(offset, length)?;
        if length == 0 {
            return Ok(Bytes::new());
        }

        enum Part {
            Buffered(Bytes),
            Fetching(JoinHandle<StoreResult<Bytes>>),
        }

        let mut parts = Vec::new();
        {
            let dirty = self.dirty.read().await;
            for span in block_spans(offset, length as u64) {
                if let Some(block) = dirty.get(&span.index) {
                    parts.push((
                        span,
                        Part::Buffered(Bytes::copy_from_slice(&block.data[span.start..span.end])),
                    ));
                } else {
                    let client = Arc::clone(&self.client);
                    let key = block_key(&self.export, span.index * BLOCK_SIZE);
                    parts.push((
                        span,
                        Part::Fetching(tokio::spawn(async move {
                            fetch_block(&client, &key).await.map(|(bytes, _)| bytes)
                        })),
                    ));
                }
            }
        }

        let mut out = BytesMut::with_capacity(length as usize);
        for (span, part) in parts {
            match part {
                Part::Buffered(bytes) => out.extend_from_slice(&bytes),
                Part::Fetching(handle) => {
                    let block = handle
                        .await
                        .map_err(|e| StoreError::Unavailable(format!("fetch task failed: {e}")))??;
                    out.extend_from_slice(&block[span.start..span.end]);
                }
            }
        }
        Ok(out.freeze())
    }

    /// Buffer a write of `data` at `offset`. Returns once the dirty map is
    /// updated; nothing reaches the object store until flush.
    pub async fn write(&self, offset: u64, data: &[u8]) -> BlockResult<()> {
        if self.lease.is_lost() {
            return Err(BlockError::LeaseLost(self.export.clone()));
        }
        let length = data.len() as u32;
        self.check_range(offset, length)?;
        if data.is_empty() {
            return Ok(());
        }

        let mut dirty = self.dirty.write().await;
        let mut consumed = 0usize;
        for span in block_spans(offset, data.len() as u64) {
            let chunk = &data[consumed..consumed + span.len()];
            consumed += span.len();

            if span.is_full_block() {
                // Full overwrite: no read-modify-write needed.
                dirty.insert(
                    span.index,
                    DirtyBlock {
                        data: chunk.to_vec(),
                        known_absent: false,
                    },
                );
                continue;
            }

            if !dirty.contains_key(&span.index) {
                let key = block_key(&self.export, span.index * BLOCK_SIZE);
                let (base, known_absent) = fetch_block(&self.client, &key).await?;
                dirty.insert(
                    span.index,
                    DirtyBlock {
                        data: base.to_vec(),
                        known_absent,
                    },
                );
            }

            if let Some(block) = dirty.get_mut(&span.index) {
                block.data[span.start..span.end].copy_from_slice(chunk);
            }
        }

        debug!(
            export = %self.export,
            offset,
            length,
            dirty = dirty.len(),
            "buffered write"
        );
        Ok(())
    }

    /// Persist every block that was dirty at entry.
    ///
    /// The buffer is snapshotted under the write lock and the lock released
    /// before any upload starts; writes that land mid-flush stay buffered
    /// for the next flush. Uploads run with bounded fan-out. If any block
    /// fails past the retry budget, the unpersisted blocks re-merge into
    /// the buffer (newer writes win) and the flush fails.
    pub async fn flush(&self) -> BlockResult<()> {
        if self.lease.is_lost() {
            return Err(BlockError::LeaseLost(self.export.clone()));
        }

        let snapshot = {
            let mut dirty = self.dirty.write().await;
            std::mem::take(&mut *dirty)
        };
        if snapshot.is_empty() {
            debug!(export = %self.export, "flush with no dirty blocks");
            return Ok(());
        }

        let total = snapshot.len();
        let permits = Arc::new(Semaphore::new(self.flush_parallelism));
        let mut uploads = Vec::with_capacity(total);
        let mut skipped = 0usize;

        for (index, block) in snapshot {
            if block.known_absent && block.is_zero() {
                skipped += 1;
                continue;
            }

            let client = Arc::clone(&self.client);
            let key = block_key(&self.export, index * BLOCK_SIZE);
            let permits = Arc::clone(&permits);
            let known_absent = block.known_absent;
            uploads.push(tokio::spawn(async move {
                let payload = Bytes::from(block.data);
                let _permit = match permits.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return Err((
                            index,
                            payload,
                            known_absent,
                            StoreError::Unavailable("flush aborted".to_string()),
                        ))
                    }
                };
                match client.put(&key, payload.clone()).await {
                    Ok(()) => Ok(index),
                    Err(e) => Err((index, payload, known_absent, e)),
                }
            }));
        }

        let mut stored = 0usize;
        let mut lost_tasks = 0usize;
        let mut failed = Vec::new();
        for upload in uploads {
            match upload.await {
                Ok(Ok(_)) => stored += 1,
                Ok(Err((index, payload, known_absent, err))) => {
                    warn!(export = %self.export, index, "block upload failed: {err}");
                    failed.push((
                        index,
                        DirtyBlock {
                            data: payload.to_vec(),
                            known_absent,
                        },
                    ));
                }
                Err(e) => {
                    warn!(export = %self.export, "upload task failed: {e}");
                    lost_tasks += 1;
                }
            }
        }

        if !failed.is_empty() || lost_tasks > 0 {
            let unpersisted = failed.len() + lost_tasks;
            let mut dirty = self.dirty.write().await;
            for (index, block) in failed {
                dirty.entry(index).or_insert(block);
            }
            return Err(BlockError::Storage(StoreError::Unavailable(format!(
                "{unpersisted} of {total} blocks failed to persist"
            ))));
        }

        info!(export = %self.export, stored, skipped, "flushed dirty blocks");
        Ok(())
    }
}

/// Fetch one block, materializing zeros for a missing object. The bool is
/// true when no object existed. Objects that are not exactly one block
/// long are normalized with zero padding.
async fn fetch_block(client: &ObjectClient, key: &str) -> StoreResult<(Bytes, bool)> {
    match client.get(key).await? {
        Some(bytes) if bytes.len() == BLOCK_SIZE as usize => Ok((bytes, false)),
        Some(bytes) => {
            let mut buf = vec![0u8; BLOCK_SIZE as usize];
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok((Bytes::from(buf), false))
        }
        None => Ok((zero_block(), true)),
    }
}

fn zero_block() -> Bytes {
    static ZERO: std::sync::OnceLock<Bytes> = std::sync::OnceLock::new();
    ZERO.get_or_init(|| Bytes::from(vec![0u8; BLOCK_SIZE as usize]))
        .clone()
}
