//! Per-export exclusive leases backed by S3 conditional writes.
//!
//! The lease record at `locks/{export}` is the single arbiter of which
//! session may write an export. Acquisition and renewal are compare-and-swap
//! cycles against the record's etag; the conditional-write primitives of the
//! object store are the only source of atomicity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ballast_store::{lock_key, ObjectClient, StoreError, StoreResult};

use crate::error::{BlockError, BlockResult};

/// Acquisition attempts before giving up under contention
const MAX_ACQUIRE_ATTEMPTS: usize = 8;
/// Consecutive transient heartbeat failures tolerated before the lease is
/// declared lost
const MAX_HEARTBEAT_FAILURES: u32 = 3;
/// Budget for the best-effort release write at session teardown
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// The lease record stored at `locks/{export}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// 128-bit holder identifier, lowercase hex
    pub holder_id: String,
    /// Unix milliseconds at acquisition
    pub acquired_at: i64,
    /// Unix milliseconds past which the lease is dead
    pub expires_at: i64,
}

impl LeaseRecord {
    fn new(holder_id: &str, ttl: Duration) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl.as_millis() as i64,
        }
    }

    fn renewed(&self, ttl: Duration) -> Self {
        Self {
            holder_id: self.holder_id.clone(),
            acquired_at: self.acquired_at,
            expires_at: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        }
    }

    fn tombstone(&self) -> Self {
        Self {
            holder_id: self.holder_id.clone(),
            acquired_at: self.acquired_at,
            expires_at: 0,
        }
    }

    fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at
    }

    fn is_held_by(&self, holder_id: &str) -> bool {
        self.holder_id == holder_id
    }

    fn encode(&self) -> StoreResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| StoreError::Unavailable(format!("serialize lease record: {e}")))
    }

    fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

enum AcquireOutcome {
    Acquired,
    Held { expires_in_ms: i64 },
}

/// Issues and releases per-export leases.
pub struct LeaseManager {
    client: Arc<ObjectClient>,
    ttl: Duration,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    /// Create a new lease manager.
    pub fn new(client: Arc<ObjectClient>, ttl: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            client,
            ttl,
            heartbeat_interval,
        }
    }

    /// Acquire the exclusive lease for `export` on behalf of `holder_id`.
    ///
    /// A valid lease held elsewhere returns [`BlockError::LeaseConflict`]
    /// immediately. Lost conditional-write races are retried with a short
    /// randomized backoff, up to [`MAX_ACQUIRE_ATTEMPTS`] times.
    pub async fn acquire(&self, export: &str, holder_id: &str) -> BlockResult<LeaseHandle> {
        for attempt in 1..=MAX_ACQUIRE_ATTEMPTS {
            match self.try_acquire(export, holder_id).await {
                Ok(AcquireOutcome::Acquired) => {
                    info!(export, holder = holder_id, "lease acquired");
                    return Ok(self.spawn_handle(export, holder_id));
                }
                Ok(AcquireOutcome::Held { expires_in_ms }) => {
                    debug!(
                        export,
                        expires_in_ms, "export leased by another holder, refusing"
                    );
                    return Err(BlockError::LeaseConflict(export.to_string()));
                }
                Err(e) if e.is_conflict() => {
                    debug!(export, attempt, "lost lease write race, retrying");
                    let jitter = rand::thread_rng().gen_range(10..=100);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(export, "lease acquisition contended past retry bound");
        Err(BlockError::LeaseConflict(export.to_string()))
    }

    async fn try_acquire(&self, export: &str, holder_id: &str) -> StoreResult<AcquireOutcome> {
        let key = lock_key(export);
        match self.client.get_with_etag(&key).await? {
            None => {
                let record = LeaseRecord::new(holder_id, self.ttl);
                self.client.put_if_absent(&key, record.encode()?).await?;
                Ok(AcquireOutcome::Acquired)
            }
            Some((body, etag)) => {
                if let Some(current) = LeaseRecord::decode(&body) {
                    if !current.is_expired() && !current.is_held_by(holder_id) {
                        let expires_in_ms =
                            current.expires_at - Utc::now().timestamp_millis();
                        return Ok(AcquireOutcome::Held { expires_in_ms });
                    }
                } else {
                    warn!(export, "unparseable lease record, taking over");
                }

                let record = LeaseRecord::new(holder_id, self.ttl);
                self.client.put_if_match(&key, record.encode()?, &etag).await?;
                Ok(AcquireOutcome::Acquired)
            }
        }
    }

    fn spawn_handle(&self, export: &str, holder_id: &str) -> LeaseHandle {
        let lost = Arc::new(AtomicBool::new(false));
        let (lost_tx, _) = broadcast::channel(1);

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.client),
            export.to_string(),
            holder_id.to_string(),
            self.ttl,
            self.heartbeat_interval,
            Arc::clone(&lost),
            lost_tx.clone(),
        ));

        LeaseHandle {
            export: export.to_string(),
            holder_id: holder_id.to_string(),
            client: Arc::clone(&self.client),
            lost,
            lost_tx,
            heartbeat,
        }
    }
}

/// A held lease with its background heartbeat.
///
/// Dropping the handle stops the heartbeat; the record then ages out after
/// the ttl. Call [`LeaseHandle::release`] for prompt handover.
#[derive(Debug)]
pub struct LeaseHandle {
    export: String,
    holder_id: String,
    client: Arc<ObjectClient>,
    lost: Arc<AtomicBool>,
    lost_tx: broadcast::Sender<()>,
    heartbeat: JoinHandle<()>,
}

impl LeaseHandle {
    /// Export this lease guards.
    pub fn export(&self) -> &str {
        &self.export
    }

    /// Holder identifier this lease was issued to.
    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// True once the heartbeat observed the lease expired or taken over.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Subscribe to the lost-lease notification.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.lost_tx.subscribe()
    }

    /// Stop the heartbeat and write the release tombstone, best effort,
    /// bounded by [`RELEASE_TIMEOUT`].
    pub async fn release(&self) {
        self.heartbeat.abort();

        if self.is_lost() {
            debug!(export = %self.export, "lease already lost, skipping release");
            return;
        }

        let released = tokio::time::timeout(
            RELEASE_TIMEOUT,
            release_record(&self.client, &self.export, &self.holder_id),
        )
        .await;

        match released {
            Ok(Ok(true)) => info!(export = %self.export, "lease released"),
            Ok(Ok(false)) => debug!(export = %self.export, "lease no longer ours at release"),
            Ok(Err(e)) => warn!(export = %self.export, "lease release failed: {e}"),
            Err(_) => warn!(export = %self.export, "lease release timed out"),
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

async fn heartbeat_loop(
    client: Arc<ObjectClient>,
    export: String,
    holder_id: String,
    ttl: Duration,
    interval: Duration,
    lost: Arc<AtomicBool>,
    lost_tx: broadcast::Sender<()>,
) {
    let mut failures = 0u32;

    loop {
        tokio::time::sleep(interval).await;

        match renew_once(&client, &export, &holder_id, ttl).await {
            Ok(true) => {
                failures = 0;
                debug!(export = %export, "lease renewed");
            }
            Ok(false) => {
                warn!(export = %export, "lease ownership lost");
                lost.store(true, Ordering::Release);
                let _ = lost_tx.send(());
                return;
            }
            Err(e) => {
                failures += 1;
                warn!(export = %export, failures, "lease renewal failed: {e}");
                if failures >= MAX_HEARTBEAT_FAILURES {
                    lost.store(true, Ordering::Release);
                    let _ = lost_tx.send(());
                    return;
                }
                let backoff = Duration::from_secs(1u64 << (failures - 1).min(3));
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Re-read the record, verify ownership, and conditionally extend the
/// expiry. `Ok(false)` means the lease is gone: absent, held by someone
/// else, or the conditional write lost.
async fn renew_once(
    client: &ObjectClient,
    export: &str,
    holder_id: &str,
    ttl: Duration,
) -> StoreResult<bool> {
    let key = lock_key(export);
    let Some((body, etag)) = client.get_with_etag(&key).await? else {
        return Ok(false);
    };

    let Some(current) = LeaseRecord::decode(&body) else {
        return Ok(false);
    };
    if !current.is_held_by(holder_id) {
        return Ok(false);
    }

    match client.put_if_match(&key, current.renewed(ttl).encode()?, &etag).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Write the tombstone if the record is still ours. `Ok(false)` when the
/// lease had already moved on.
async fn release_record(
    client: &ObjectClient,
    export: &str,
    holder_id: &str,
) -> StoreResult<bool> {
    let key = lock_key(export);
    let Some((body, etag)) = client.get_with_etag(&key).await? else {
        return Ok(false);
    };

    let Some(current) = LeaseRecord::decode(&body) else {
        return Ok(false);
    };
    if !current.is_held_by(holder_id) {
        return Ok(false);
    }

    match client.put_if_match(&key, current.tombstone().encode()?, &etag).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(e) => Err(e),
    }
}
