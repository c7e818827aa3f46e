//! Inflight table: collapsing concurrent builds of one fingerprint.
//!
//! The first request to claim a fingerprint becomes the leader and owns the
//! build; every later claim joins as a follower holding a one-shot completion
//! slot. When the leader completes, all followers receive the shared outcome
//! and the record disappears. A leader that goes away without completing
//! promotes its oldest follower instead of dropping the waiters.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use kiln_core::Digest;

/// Bucket count for the table. Claims on distinct fingerprints rarely
/// contend on the same mutex.
const SHARDS: usize = 16;

/// Outcome a leader publishes to its followers.
#[derive(Debug)]
pub enum Completion {
    /// Build succeeded. Payload shared across all waiters.
    Success {
        object: Arc<Vec<u8>>,
        stderr: Arc<Vec<u8>>,
    },
    /// Compiler exited non-zero. Each follower translates this to its own
    /// failure response.
    Failure { status: i32, stderr: Arc<Vec<u8>> },
    /// Infrastructure failure with no fallback left.
    Error { message: String },
}

/// What a waiting follower eventually receives.
pub enum FollowerSignal {
    /// The leader finished; here is its result.
    Done(Arc<Completion>),
    /// The leader was cancelled; this follower now owns the build.
    Promoted(LeaderSlot),
}

struct Record {
    followers: VecDeque<oneshot::Sender<FollowerSignal>>,
}

struct Inner {
    shards: Vec<Mutex<HashMap<Digest, Record>>>,
}

impl Inner {
    fn shard(&self, digest: &Digest) -> &Mutex<HashMap<Digest, Record>> {
        &self.shards[digest.as_bytes()[0] as usize % SHARDS]
    }
}

/// Result of a [`claim`](InflightTable::claim).
pub enum Claim {
    Leader(LeaderSlot),
    Follower(FollowerTicket),
}

/// The unique build ownership for one fingerprint.
///
/// Must be resolved by [`complete`](Self::complete) or
/// [`abdicate`](Self::abdicate); dropping an unresolved slot (leader task
/// cancelled or panicked) behaves like abdication, promoting the oldest
/// follower.
pub struct LeaderSlot {
    inner: Arc<Inner>,
    digest: Digest,
    armed: bool,
}

impl LeaderSlot {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Publishes the outcome to every follower and removes the record.
    pub fn complete(mut self, outcome: Arc<Completion>) {
        self.armed = false;
        let followers = {
            let mut map = self.inner.shard(&self.digest).lock();
            map.remove(&self.digest)
                .map(|r| r.followers)
                .unwrap_or_default()
        };
        for tx in followers {
            // A follower that detached is simply skipped.
            let _ = tx.send(FollowerSignal::Done(Arc::clone(&outcome)));
        }
    }

    /// Gives up leadership without a result, promoting the oldest follower.
    /// With no followers the record is dropped.
    pub fn abdicate(mut self) {
        self.armed = false;
        release(&self.inner, self.digest);
    }
}

impl Drop for LeaderSlot {
    fn drop(&mut self) {
        if self.armed {
            release(&self.inner, self.digest);
        }
    }
}

/// Hands leadership to the oldest live follower, or removes the record.
fn release(inner: &Arc<Inner>, digest: Digest) {
    let mut map = inner.shard(&digest).lock();
    let Some(record) = map.get_mut(&digest) else {
        return;
    };
    while let Some(tx) = record.followers.pop_front() {
        let slot = LeaderSlot {
            inner: Arc::clone(inner),
            digest,
            armed: true,
        };
        match tx.send(FollowerSignal::Promoted(slot)) {
            Ok(()) => return,
            Err(signal) => {
                // Follower detached before promotion. Defuse the returned
                // slot so its drop cannot re-enter this shard lock.
                if let FollowerSignal::Promoted(mut slot) = signal {
                    slot.armed = false;
                }
            }
        }
    }
    map.remove(&digest);
}

/// A follower's claim on a leader's eventual result.
pub struct FollowerTicket {
    rx: oneshot::Receiver<FollowerSignal>,
}

impl FollowerTicket {
    /// Waits for the leader. `None` only if the record vanished without a
    /// signal, which indicates a dispatcher bug upstream.
    ///
    /// Cancelling a follower is just dropping the ticket; the leader is
    /// not disturbed.
    pub async fn wait(self) -> Option<FollowerSignal> {
        self.rx.await.ok()
    }
}

/// Sharded map from fingerprint to in-progress build.
#[derive(Clone)]
pub struct InflightTable {
    inner: Arc<Inner>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            }),
        }
    }

    /// Claims the build for `digest`: the first claimer per fingerprint
    /// becomes the leader, everyone else a follower in arrival order.
    pub fn claim(&self, digest: Digest) -> Claim {
        let mut map = self.inner.shard(&digest).lock();
        match map.entry(digest) {
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(Record {
                    followers: VecDeque::new(),
                });
                Claim::Leader(LeaderSlot {
                    inner: Arc::clone(&self.inner),
                    digest,
                    armed: true,
                })
            }
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let (tx, rx) = oneshot::channel();
                occupied.get_mut().followers.push_back(tx);
                Claim::Follower(FollowerTicket { rx })
            }
        }
    }

    /// Whether a build for `digest` is currently in progress.
    pub fn is_inflight(&self, digest: &Digest) -> bool {
        self.inner.shard(digest).lock().contains_key(digest)
    }
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}
