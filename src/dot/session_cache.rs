//! TLS session storage for DoT reconnects.
//!
//! One cache per upstream server. Tickets are kept newest-first and are
//! single use: a reconnect pops the head and the server issues fresh tickets
//! on the new connection. The cache plugs into rustls resumption via
//! [`ClientSessionStore`], so session reuse happens without the transport
//! layer ever touching ticket bytes.

use std::collections::VecDeque;

use parking_lot::Mutex;
use rustls::client::{ClientSessionStore, Tls12ClientSessionValue, Tls13ClientSessionValue};
use rustls::pki_types::ServerName;
use rustls::NamedGroup;

/// Most tickets retained per server.
const CAPACITY: usize = 5;

/// Bounded newest-first ring of single-use blobs.
#[derive(Debug)]
struct TicketRing<T> {
    entries: VecDeque<T>,
}

impl<T> TicketRing<T> {
    fn new() -> Self {
        TicketRing {
            entries: VecDeque::with_capacity(CAPACITY),
        }
    }

    fn put(&mut self, value: T) {
        self.entries.push_front(value);
        self.entries.truncate(CAPACITY);
    }

    fn take(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Session state for one DoT server.
pub struct DnsTlsSessionCache {
    tickets: Mutex<TicketRing<Tls13ClientSessionValue>>,
    tls12: Mutex<Option<Tls12ClientSessionValue>>,
    kx_hint: Mutex<Option<NamedGroup>>,
}

impl DnsTlsSessionCache {
    pub fn new() -> Self {
        DnsTlsSessionCache {
            tickets: Mutex::new(TicketRing::new()),
            tls12: Mutex::new(None),
            kx_hint: Mutex::new(None),
        }
    }

    pub fn ticket_count(&self) -> usize {
        self.tickets.lock().len()
    }
}

impl Default for DnsTlsSessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DnsTlsSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsTlsSessionCache")
            .field("tickets", &self.ticket_count())
            .finish()
    }
}

// The cache is already scoped to a single server, so the rustls-side server
// name key is ignored.
impl ClientSessionStore for DnsTlsSessionCache {
    fn set_kx_hint(&self, _server_name: ServerName<'static>, group: NamedGroup) {
        *self.kx_hint.lock() = Some(group);
    }

    fn kx_hint(&self, _server_name: &ServerName<'_>) -> Option<NamedGroup> {
        *self.kx_hint.lock()
    }

    fn set_tls12_session(&self, _server_name: ServerName<'static>, value: Tls12ClientSessionValue) {
        *self.tls12.lock() = Some(value);
    }

    fn tls12_session(&self, _server_name: &ServerName<'_>) -> Option<Tls12ClientSessionValue> {
        self.tls12.lock().clone()
    }

    fn remove_tls12_session(&self, _server_name: &ServerName<'_>) {
        *self.tls12.lock() = None;
    }

    fn insert_tls13_ticket(&self, _server_name: ServerName<'static>, value: Tls13ClientSessionValue) {
        self.tickets.lock().put(value);
    }

    fn take_tls13_ticket(&self, _server_name: &ServerName<'_>) -> Option<Tls13ClientSessionValue> {
        self.tickets.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tickets_are_single_use() {
        let mut ring = TicketRing::new();
        ring.put(1);
        ring.put(2);
        assert_eq!(ring.take(), Some(2));
        assert_eq!(ring.take(), Some(1));
        assert_eq!(ring.take(), None);
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut ring = TicketRing::new();
        for i in 0..CAPACITY + 3 {
            ring.put(i);
        }
        assert_eq!(ring.len(), CAPACITY);
        // Newest first; the oldest three fell off the tail.
        for expected in (3..CAPACITY + 3).rev() {
            assert_eq!(ring.take(), Some(expected));
        }
        assert_eq!(ring.take(), None);
    }

    #[test]
    fn test_cache_starts_empty() {
        let cache = DnsTlsSessionCache::new();
        assert_eq!(cache.ticket_count(), 0);
        let name = ServerName::try_from("dns.example.com").unwrap();
        assert!(cache.take_tls13_ticket(&name).is_none());
    }
}
