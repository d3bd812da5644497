//! Per-network response cache.
//!
//! Answered lookups are kept in an LRU map until their TTL runs out. A
//! lookup that misses atomically claims the key with a PENDING entry and
//! receives an [`AdmitToken`]; every concurrent lookup for the same key gets
//! a shared future that completes when the token holder publishes. Dropping
//! a token without publishing fails the entry so waiters are never stranded.
//!
//! PENDING entries are never evicted and do not count against the LRU
//! capacity; they only gate admission: when the cache is entirely occupied
//! by in-flight lookups, new callers are admitted without a cache entry and
//! simply bypass the cache for that lookup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use lru::LruCache;
use rustc_hash::FxHashMap;
use std::num::NonZeroUsize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::message::{self, CacheKey};

/// TTL clamp applied to every answered entry.
pub const MIN_TTL: Duration = Duration::from_secs(1);
pub const MAX_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub const DEFAULT_CAPACITY: usize = 64;

/// What a pending entry resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome {
    Answer(Vec<u8>),
    Failure,
}

/// Future handed to lookups that found someone else's query in flight.
/// Resolves to `None` when the cache itself went away.
pub type PendingWaiter = Shared<BoxFuture<'static, Option<CacheOutcome>>>;

/// Result of a cache lookup.
pub enum CacheState {
    Hit(Vec<u8>),
    Pending(PendingWaiter),
    Miss(AdmitToken),
}

struct AnsweredEntry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

struct PendingEntry {
    tx: Option<oneshot::Sender<CacheOutcome>>,
    waiter: PendingWaiter,
    generation: u64,
}

struct CacheInner {
    answered: LruCache<CacheKey, AnsweredEntry>,
    pending: FxHashMap<CacheKey, PendingEntry>,
    capacity: usize,
    generation: u64,
}

pub struct ResponseCache {
    inner: Mutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(ResponseCache {
            inner: Mutex::new(CacheInner {
                answered: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
                pending: FxHashMap::default(),
                capacity,
                generation: 0,
            }),
        })
    }

    pub fn lookup(self: &Arc<Self>, key: &CacheKey) -> CacheState {
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.answered.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return CacheState::Hit(entry.bytes.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            // Expired entries are removed lazily, on access.
            inner.answered.pop(key);
        }

        if let Some(pending) = inner.pending.get(key) {
            return CacheState::Pending(pending.waiter.clone());
        }

        if inner.pending.len() >= inner.capacity {
            // Entirely occupied by in-flight lookups: admit the caller
            // without inserting, so it resolves around the cache.
            return CacheState::Miss(AdmitToken {
                cache: None,
                key: key.clone(),
                generation: 0,
            });
        }

        let (tx, rx) = oneshot::channel::<CacheOutcome>();
        let waiter: PendingWaiter = rx.map(|r| r.ok()).boxed().shared();
        inner.generation += 1;
        let generation = inner.generation;
        inner.pending.insert(
            key.clone(),
            PendingEntry {
                tx: Some(tx),
                waiter,
                generation,
            },
        );
        CacheState::Miss(AdmitToken {
            cache: Some(self.clone()),
            key: key.clone(),
            generation,
        })
    }

    /// Empties the cache and fails every outstanding pending entry.
    pub fn flush(&self) {
        let mut txs = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.answered.clear();
            for (_, mut pending) in inner.pending.drain() {
                if let Some(tx) = pending.tx.take() {
                    txs.push(tx);
                }
            }
        }
        for tx in txs {
            let _ = tx.send(CacheOutcome::Failure);
        }
    }

    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity;
        inner.answered.resize(NonZeroUsize::new(capacity).unwrap());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().answered.len()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    fn complete(&self, key: &CacheKey, generation: u64, outcome: CacheOutcome) {
        let tx = {
            let mut inner = self.inner.lock().unwrap();
            // The entry may have been flushed or replaced while the query
            // ran; its waiters were already failed then, and the late
            // result is dropped.
            let live = inner.pending.get(key).map(|p| p.generation);
            if live != Some(generation) {
                return;
            }
            let mut pending = inner.pending.remove(key).unwrap();
            if let CacheOutcome::Answer(bytes) = &outcome {
                let expires_at = Instant::now() + answer_ttl(bytes);
                inner.answered.put(
                    key.clone(),
                    AnsweredEntry {
                        bytes: bytes.clone(),
                        expires_at,
                    },
                );
            }
            pending.tx.take()
        };
        // The channel is completed with the lock released.
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

/// TTL for an answer: the minimum TTL across the answer section, clamped;
/// an empty (or unparseable) answer section gets the minimum.
fn answer_ttl(bytes: &[u8]) -> Duration {
    match message::summarize_response(bytes) {
        Ok(summary) => match summary.min_answer_ttl {
            Some(ttl) => Duration::from_secs(ttl as u64).clamp(MIN_TTL, MAX_TTL),
            None => MIN_TTL,
        },
        Err(_) => MIN_TTL,
    }
}

/// Exclusive right to publish the answer for a claimed key. Dropping the
/// token unpublished fails the pending entry immediately.
pub struct AdmitToken {
    cache: Option<Arc<ResponseCache>>,
    key: CacheKey,
    generation: u64,
}

impl AdmitToken {
    pub fn publish(mut self, outcome: CacheOutcome) {
        if let Some(cache) = self.cache.take() {
            cache.complete(&self.key, self.generation, outcome);
        }
    }

    /// True when the token was admitted without a cache entry (cache full of
    /// pending lookups); publishing is then a no-op.
    pub fn is_bypass(&self) -> bool {
        self.cache.is_none()
    }
}

impl Drop for AdmitToken {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            cache.complete(&self.key, self.generation, CacheOutcome::Failure);
        }
    }
}
