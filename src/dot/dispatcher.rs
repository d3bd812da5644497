//! Fan-out from the resolver onto DoT transports.
//!
//! Transports are keyed by (socket mark, server) and shared by every lookup
//! heading the same way; the first query for a key creates the transport and
//! reports `connect_triggered` so callers and tests can observe connection
//! churn. Transports that have sat idle with nothing in flight are retired
//! lazily on the next query.

use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::debug;
use rustc_hash::FxHashMap;
use tokio::time::Instant;

use super::socket::SocketFactory;
use super::transport::DnsTlsTransport;
use super::{DotResponseCode, DotResult};
use crate::server::DnsServer;

/// How long a transport may sit unused before the next query replaces it.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, PartialEq, Eq, Hash)]
struct TransportKey {
    mark: u32,
    server: DnsServer,
}

struct TransportEntry {
    transport: Arc<DnsTlsTransport>,
    last_used: Instant,
}

/// Outcome of a dispatched query. `len` bytes of the caller's buffer are
/// valid iff `code` is `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DotQueryReply {
    pub code: DotResponseCode,
    pub len: usize,
    pub connect_triggered: bool,
}

pub struct DnsTlsDispatcher {
    factory: SocketFactory,
    transports: Mutex<FxHashMap<TransportKey, TransportEntry>>,
}

impl DnsTlsDispatcher {
    pub fn new(factory: SocketFactory) -> Self {
        DnsTlsDispatcher {
            factory,
            transports: Mutex::new(FxHashMap::default()),
        }
    }

    /// Sends `query` to `server` over the shared transport for (mark,
    /// server), writing the response into `answer`. A response larger than
    /// `answer` is reported as `LimitError` and not delivered.
    pub async fn query(
        &self,
        server: &DnsServer,
        net_id: u32,
        mark: u32,
        query: &[u8],
        answer: &mut [u8],
    ) -> DotQueryReply {
        let key = TransportKey {
            mark,
            server: server.clone(),
        };
        let (transport, connect_triggered) = self.lookup_or_create(&key);
        debug!(
            "querying {} on netid {} (mark {}, new transport: {})",
            server, net_id, mark, connect_triggered
        );

        let result: DotResult = transport.query(query).await;
        self.touch(&key);

        match result.code {
            DotResponseCode::Success => {
                if result.response.len() > answer.len() {
                    return DotQueryReply {
                        code: DotResponseCode::LimitError,
                        len: 0,
                        connect_triggered,
                    };
                }
                answer[..result.response.len()].copy_from_slice(&result.response);
                DotQueryReply {
                    code: DotResponseCode::Success,
                    len: result.response.len(),
                    connect_triggered,
                }
            }
            code => DotQueryReply {
                code,
                len: 0,
                connect_triggered,
            },
        }
    }

    fn lookup_or_create(&self, key: &TransportKey) -> (Arc<DnsTlsTransport>, bool) {
        let mut transports = self.transports.lock().unwrap();
        let now = Instant::now();
        // Retire transports nothing has touched for a while. Anything with
        // queries still in flight stays.
        transports.retain(|_, entry| {
            entry.transport.outstanding() > 0
                || now.duration_since(entry.last_used) < IDLE_TIMEOUT
        });

        match transports.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.get_mut().last_used = now;
                (occupied.get().transport.clone(), false)
            }
            Entry::Vacant(vacant) => {
                let transport = Arc::new(DnsTlsTransport::new(
                    key.server.clone(),
                    key.mark,
                    self.factory.clone(),
                ));
                vacant.insert(TransportEntry {
                    transport: transport.clone(),
                    last_used: now,
                });
                (transport, true)
            }
        }
    }

    fn touch(&self, key: &TransportKey) {
        let mut transports = self.transports.lock().unwrap();
        if let Some(entry) = transports.get_mut(key) {
            entry.last_used = Instant::now();
        }
    }

    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dot::socket::{FakeBehavior, FakeSpec};

    const SIZE: usize = 22;
    const NETID: u32 = 123;
    const MARK: u32 = 123;

    fn make_query(id: u16, size: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; size];
        bytes[0..2].copy_from_slice(&id.to_be_bytes());
        for (i, b) in bytes.iter_mut().enumerate().skip(2) {
            *b = (id as usize + i) as u8;
        }
        bytes
    }

    fn server(s: &str) -> DnsServer {
        DnsServer::parse_tls(s, "").unwrap()
    }

    #[tokio::test]
    async fn test_query_reuses_connection() {
        let spec = FakeSpec::new(FakeBehavior::Echo);
        let created = spec.created.clone();
        let dispatcher = DnsTlsDispatcher::new(SocketFactory::faked(spec));
        let s = server("192.0.2.1");
        let query = make_query(52, SIZE);
        let mut answer = vec![0u8; 4096];

        let reply = dispatcher.query(&s, NETID, MARK, &query, &mut answer).await;
        assert_eq!(reply.code, DotResponseCode::Success);
        assert_eq!(reply.len, query.len());
        assert!(reply.connect_triggered);
        assert_eq!(&answer[..reply.len], &query[..]);

        let reply = dispatcher.query(&s, NETID, MARK, &query, &mut answer).await;
        assert_eq!(reply.code, DotResponseCode::Success);
        assert!(!reply.connect_triggered);
        assert_eq!(created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_buffer_too_small() {
        let dispatcher = DnsTlsDispatcher::new(SocketFactory::faked(FakeSpec::new(
            FakeBehavior::Echo,
        )));
        let s = server("192.0.2.1");
        let query = make_query(52, SIZE);
        let mut answer = vec![0u8; SIZE - 1];

        let reply = dispatcher.query(&s, NETID, MARK, &query, &mut answer).await;
        assert_eq!(reply.code, DotResponseCode::LimitError);
        assert_eq!(reply.len, 0);
        assert!(reply.connect_triggered);
    }

    #[tokio::test]
    async fn test_each_key_gets_its_own_transport() {
        let spec = FakeSpec::new(FakeBehavior::Echo);
        let created = spec.created.clone();
        let dispatcher = DnsTlsDispatcher::new(SocketFactory::faked(spec));
        let mut answer = vec![0u8; 4096];

        let keys = [
            (MARK, server("192.0.2.1")),
            (MARK + 1, server("192.0.2.1")),
            (MARK, server("192.0.2.2")),
            (MARK + 1, server("192.0.2.2")),
        ];
        for (i, (mark, s)) in keys.iter().enumerate() {
            for _ in 0..3 {
                let query = make_query(i as u16, SIZE);
                let reply = dispatcher.query(s, NETID, *mark, &query, &mut answer).await;
                assert_eq!(reply.code, DotResponseCode::Success);
            }
        }
        assert_eq!(dispatcher.transport_count(), keys.len());

        let created = created.lock().unwrap();
        assert_eq!(created.len(), keys.len());
        for key in &keys {
            assert!(created.iter().any(|(m, s)| (*m, s.clone()) == *key));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_transport_retired() {
        let spec = FakeSpec::new(FakeBehavior::Echo);
        let created = spec.created.clone();
        let dispatcher = DnsTlsDispatcher::new(SocketFactory::faked(spec));
        let s = server("192.0.2.1");
        let query = make_query(52, SIZE);
        let mut answer = vec![0u8; 4096];

        let reply = dispatcher.query(&s, NETID, MARK, &query, &mut answer).await;
        assert!(reply.connect_triggered);

        tokio::time::advance(IDLE_TIMEOUT + Duration::from_secs(1)).await;
        let reply = dispatcher.query(&s, NETID, MARK, &query, &mut answer).await;
        assert!(reply.connect_triggered);
        assert_eq!(dispatcher.transport_count(), 1);
        assert_eq!(created.lock().unwrap().len(), 2);
    }
}
