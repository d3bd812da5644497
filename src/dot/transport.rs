//! Query multiplexing over one DoT connection.
//!
//! A transport owns the socket lifecycle for one (server, mark) pair. The
//! connection is established on demand by a driver task and kept up across
//! queries; when it drops, every still-outstanding query is bumped one try
//! and the survivors are replayed over a fresh socket, so transient
//! connection loss never surfaces to callers until a query has exhausted
//! its tries.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use tokio::sync::mpsc;

use super::query_map::{DnsTlsQueryMap, MarkTry};
use super::session_cache::DnsTlsSessionCache;
use super::socket::{SocketEvent, SocketFactory};
use super::{DotResponseCode, DotResult};
use crate::server::DnsServer;

pub struct DnsTlsTransport {
    query_map: Arc<DnsTlsQueryMap>,
    submit_tx: mpsc::UnboundedSender<u16>,
    connect_counter: Arc<AtomicU32>,
}

impl DnsTlsTransport {
    pub fn new(server: DnsServer, mark: u32, factory: SocketFactory) -> Self {
        let query_map = Arc::new(DnsTlsQueryMap::default());
        let connect_counter = Arc::new(AtomicU32::new(0));
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            server,
            mark,
            factory,
            query_map: query_map.clone(),
            connect_counter: connect_counter.clone(),
            session_cache: Arc::new(DnsTlsSessionCache::new()),
        };
        tokio::spawn(driver.run(submit_rx));
        DnsTlsTransport {
            query_map,
            submit_tx,
            connect_counter,
        }
    }

    /// Sends one wire query and resolves to its result. Never returns
    /// `LimitError`; `InternalError` means the 16-bit id space is spent.
    pub async fn query(&self, query: &[u8]) -> DotResult {
        let Some(handle) = self.query_map.record_query(query) else {
            return DotResult::error(DotResponseCode::InternalError);
        };
        let _ = self.submit_tx.send(handle.new_id);
        handle
            .rx
            .await
            .unwrap_or_else(|_| DotResult::error(DotResponseCode::ServerError))
    }

    /// Number of sockets created so far, for observability and tests.
    pub fn connect_counter(&self) -> u32 {
        self.connect_counter.load(Ordering::Relaxed)
    }

    pub fn outstanding(&self) -> usize {
        self.query_map.len()
    }
}

struct PendingSend {
    new_id: u16,
    bytes: Vec<u8>,
}

struct Driver {
    server: DnsServer,
    mark: u32,
    factory: SocketFactory,
    query_map: Arc<DnsTlsQueryMap>,
    connect_counter: Arc<AtomicU32>,
    session_cache: Arc<DnsTlsSessionCache>,
}

impl Driver {
    /// Connection loop. One iteration per socket; the loop idles between
    /// connections until a query needs one, and exits when the transport is
    /// dropped.
    async fn run(self, mut submit_rx: mpsc::UnboundedReceiver<u16>) {
        let mut to_send: Vec<PendingSend> = Vec::new();
        loop {
            if to_send.is_empty() {
                // Idle: connect only on demand.
                loop {
                    match submit_rx.recv().await {
                        Some(new_id) => match self.query_map.mark_try(new_id) {
                            MarkTry::NewTry(bytes) => {
                                to_send.push(PendingSend { new_id, bytes });
                                break;
                            }
                            MarkTry::Discard => continue,
                        },
                        None => {
                            self.query_map.clear(DotResponseCode::ServerError);
                            return;
                        }
                    }
                }
            }

            self.connect_counter.fetch_add(1, Ordering::Relaxed);
            let (event_tx, mut event_rx) = mpsc::unbounded_channel();
            let socket = self
                .factory
                .create(&self.server, self.mark, event_tx, &self.session_cache);
            let Some(mut socket) = socket else {
                debug!("no socket could be created for {}", self.server);
                self.query_map.clear(DotResponseCode::NetworkError);
                to_send.clear();
                continue;
            };
            if !socket.connect().await {
                debug!("connection to {} failed", self.server);
                self.query_map.clear(DotResponseCode::NetworkError);
                to_send.clear();
                continue;
            }

            for query in to_send.drain(..) {
                // A refused send means the socket already died; the close
                // event takes it from here.
                socket.query(query.new_id, &query.bytes[2..]);
            }

            let mut transport_dropped = false;
            loop {
                tokio::select! {
                    submission = submit_rx.recv() => match submission {
                        Some(new_id) => {
                            if let MarkTry::NewTry(bytes) = self.query_map.mark_try(new_id) {
                                socket.query(new_id, &bytes[2..]);
                            }
                        }
                        None => {
                            transport_dropped = true;
                            break;
                        }
                    },
                    event = event_rx.recv() => match event {
                        Some(SocketEvent::Response(response)) => {
                            self.query_map.on_response(response);
                        }
                        Some(SocketEvent::Closed) | None => break,
                    },
                }
            }
            drop(socket);

            if transport_dropped {
                self.query_map.clear(DotResponseCode::ServerError);
                return;
            }

            // Connection lost: everything still in flight gets one try
            // charged; survivors are replayed on the next socket.
            to_send = self
                .query_map
                .mark_all_tried()
                .into_iter()
                .map(|q| PendingSend {
                    new_id: q.new_id,
                    bytes: q.bytes,
                })
                .collect();
        }
    }
}
