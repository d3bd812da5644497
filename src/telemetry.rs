use std::net::IpAddr;
use std::time::Duration;

use log::debug;

use crate::private_dns::{ValidationObserver, ValidationState};
use crate::server::DnsServer;

/// Emitted once per completed lookup, whatever the outcome.
#[derive(Debug, Clone)]
pub struct LookupEvent {
    pub net_id: u32,
    /// The query type, as the wire value.
    pub query_type: u16,
    /// Response code of the answer; `None` when no answer was obtained.
    pub rcode: Option<u16>,
    pub latency: Duration,
    pub hostname: String,
    pub ip_addrs: Vec<IpAddr>,
    /// The upstream that produced the answer; `None` for cache hits and
    /// failures.
    pub server: Option<DnsServer>,
    pub cache_hit: bool,
}

pub trait LookupEventSink: Send + Sync {
    fn on_lookup_complete(&self, event: &LookupEvent);
}

/// Default sink: one debug line per lookup.
pub struct LogSink;

impl LookupEventSink for LogSink {
    fn on_lookup_complete(&self, event: &LookupEvent) {
        debug!(
            "lookup netid={} {} type={} rcode={:?} latency={}ms cache_hit={} server={} ips={:?}",
            event.net_id,
            event.hostname,
            event.query_type,
            event.rcode,
            event.latency.as_millis(),
            event.cache_hit,
            event
                .server
                .as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".to_string()),
            event.ip_addrs,
        );
    }
}

/// Default validation observer: one debug line per private-DNS state
/// transition. Installed until a caller replaces it, so validation events
/// are never dropped silently.
pub struct LogValidationSink;

impl ValidationObserver for LogValidationSink {
    fn on_validation_state_update(&self, server: IpAddr, state: ValidationState, net_id: u32) {
        debug!(
            "validation netid={} server={} state={:?}",
            net_id, server, state
        );
    }
}
