//! 16-bit transaction-id multiplexer.
//!
//! Pipelining many queries over one TLS connection requires each in-flight
//! query to carry a connection-unique id. The map rewrites the caller's id
//! with a fresh one on the way out, restores it on the way back, and owns
//! the completion channel for every outstanding query. Responses can arrive
//! in any order; matching is purely by the rewritten id, and responses with
//! no matching slot are dropped (servers do emit garbage).
//!
//! Id assignment favours low ids: an empty map hands out 0, otherwise one
//! past the highest outstanding id, scanning for a hole once the top of the
//! space has been reached. Freed ids are therefore reusable immediately, and
//! a serial caller observes id 0 forever.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::{DotResponseCode, DotResult};
use crate::message;

/// Most send attempts per query across reconnects.
pub const MAX_TRIES: u32 = 3;

struct Slot {
    original_id: u16,
    bytes: Vec<u8>,
    tries: u32,
    tx: oneshot::Sender<DotResult>,
}

/// A recorded query: the rewritten id and the channel the result arrives on.
pub struct QueryHandle {
    pub new_id: u16,
    pub rx: oneshot::Receiver<DotResult>,
}

/// Snapshot of one outstanding query, for replay after a reconnect.
#[derive(Debug, Clone)]
pub struct OutstandingQuery {
    pub new_id: u16,
    pub original_id: u16,
    pub bytes: Vec<u8>,
}

/// Verdict of a try-count bump.
pub enum MarkTry {
    /// The query may be sent (again); wire bytes attached.
    NewTry(Vec<u8>),
    /// Retries exhausted; the query has been completed and freed.
    Discard,
}

pub struct DnsTlsQueryMap {
    queries: Mutex<BTreeMap<u16, Slot>>,
    max_tries: u32,
}

impl Default for DnsTlsQueryMap {
    fn default() -> Self {
        Self::new(MAX_TRIES)
    }
}

impl DnsTlsQueryMap {
    pub fn new(max_tries: u32) -> Self {
        DnsTlsQueryMap {
            queries: Mutex::new(BTreeMap::new()),
            max_tries,
        }
    }

    pub fn max_tries(&self) -> u32 {
        self.max_tries
    }

    fn free_id(queries: &BTreeMap<u16, Slot>) -> Option<u16> {
        let Some((&max_id, _)) = queries.iter().next_back() else {
            return Some(0);
        };
        if max_id < u16::MAX {
            return Some(max_id + 1);
        }
        if queries.len() == usize::from(u16::MAX) + 1 {
            return None;
        }
        // The top of the id space is taken; scan for the first hole.
        let mut next = 0u16;
        for &id in queries.keys() {
            if id != next {
                break;
            }
            next = id + 1;
        }
        Some(next)
    }

    /// Stores `bytes` under a fresh id (rewritten in place in the stored
    /// copy) and returns the completion handle. `None` iff all 65 536 ids
    /// are outstanding or the query is too short to carry an id.
    pub fn record_query(&self, bytes: &[u8]) -> Option<QueryHandle> {
        let original_id = message::wire_id(bytes)?;
        let mut queries = self.queries.lock();
        let new_id = Self::free_id(&queries)?;

        let mut stored = bytes.to_vec();
        message::set_wire_id(&mut stored, new_id);

        let (tx, rx) = oneshot::channel();
        queries.insert(
            new_id,
            Slot {
                original_id,
                bytes: stored,
                tries: 0,
                tx,
            },
        );
        Some(QueryHandle { new_id, rx })
    }

    /// Snapshot of everything outstanding, in id order.
    pub fn get_all(&self) -> Vec<OutstandingQuery> {
        self.queries
            .lock()
            .iter()
            .map(|(&new_id, slot)| OutstandingQuery {
                new_id,
                original_id: slot.original_id,
                bytes: slot.bytes.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.queries.lock().len()
    }

    /// Matches a wire response to its query by the leading id, restores the
    /// original id and completes the query. Unknown ids are dropped.
    pub fn on_response(&self, mut response: Vec<u8>) {
        let Some(new_id) = message::wire_id(&response) else {
            return;
        };
        let slot = self.queries.lock().remove(&new_id);
        let Some(slot) = slot else {
            log::debug!("dropping response with unknown id {}", new_id);
            return;
        };
        message::set_wire_id(&mut response, slot.original_id);
        let _ = slot.tx.send(DotResult {
            code: DotResponseCode::Success,
            response,
        });
    }

    /// Bumps the try counter before a send. Once the counter passes the
    /// limit the query completes as a network error and its id is freed.
    pub fn mark_try(&self, new_id: u16) -> MarkTry {
        let expired = {
            let mut queries = self.queries.lock();
            let Some(slot) = queries.get_mut(&new_id) else {
                return MarkTry::Discard;
            };
            slot.tries += 1;
            if slot.tries > self.max_tries {
                queries.remove(&new_id)
            } else {
                return MarkTry::NewTry(slot.bytes.clone());
            }
        };
        if let Some(slot) = expired {
            let _ = slot
                .tx
                .send(DotResult::error(DotResponseCode::NetworkError));
        }
        MarkTry::Discard
    }

    /// After a connection loss: bump every outstanding query and return the
    /// ones still worth replaying. Exhausted queries complete as network
    /// errors here.
    pub fn mark_all_tried(&self) -> Vec<OutstandingQuery> {
        let mut survivors = Vec::new();
        let mut expired = Vec::new();
        {
            let mut queries = self.queries.lock();
            let ids: Vec<u16> = queries.keys().copied().collect();
            for id in ids {
                let slot = queries.get_mut(&id).unwrap();
                slot.tries += 1;
                if slot.tries > self.max_tries {
                    expired.push(queries.remove(&id).unwrap());
                } else {
                    survivors.push(OutstandingQuery {
                        new_id: id,
                        original_id: slot.original_id,
                        bytes: slot.bytes.clone(),
                    });
                }
            }
        }
        for slot in expired {
            let _ = slot
                .tx
                .send(DotResult::error(DotResponseCode::NetworkError));
        }
        survivors
    }

    /// Completes every outstanding query with `code` and frees all ids.
    pub fn clear(&self, code: DotResponseCode) {
        let drained: Vec<Slot> = {
            let mut queries = self.queries.lock();
            std::mem::take(&mut *queries).into_values().collect()
        };
        for slot in drained {
            let _ = slot.tx.send(DotResult::error(code));
        }
    }
}
