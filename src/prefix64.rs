//! NAT64 prefix discovery (RFC 7050).
//!
//! Per network, a detached task resolves `ipv4only.arpa. AAAA` and looks for
//! the well-known IPv4 addresses embedded at /96. Failures back off
//! exponentially; a discovered prefix is held until discovery is stopped.
//! Address synthesis itself happens in the name-lookup layer above.

use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info};
use rustc_hash::FxHashMap;

const WELL_KNOWN_V4: [[u8; 4]; 2] = [[192, 0, 0, 170], [192, 0, 0, 171]];

const INITIAL_BACKOFF: Duration = Duration::from_secs(4);
const MAX_BACKOFF: Duration = Duration::from_secs(4 * 60 * 60);

/// Resolves the discovery question on a given network. Injected so the
/// discovery loop stays decoupled from the lookup machinery that uses it.
pub type ProbeFn =
    Arc<dyn Fn(u32) -> BoxFuture<'static, std::io::Result<Vec<Ipv6Addr>>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prefix64 {
    pub prefix: Ipv6Addr,
    pub prefix_len: u8,
}

impl std::fmt::Display for Prefix64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)
    }
}

struct Discovery {
    task: tokio::task::JoinHandle<()>,
    prefix: Arc<Mutex<Option<Prefix64>>>,
}

#[derive(Default)]
pub struct Prefix64Discovery {
    networks: Mutex<FxHashMap<u32, Discovery>>,
}

impl Prefix64Discovery {
    pub fn new() -> Self {
        Prefix64Discovery::default()
    }

    /// Starts discovery for a network. False if it is already running.
    pub fn start(&self, net_id: u32, probe: ProbeFn) -> bool {
        let mut networks = self.networks.lock().unwrap();
        if networks.contains_key(&net_id) {
            return false;
        }
        let prefix = Arc::new(Mutex::new(None));
        let slot = prefix.clone();
        let task = tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                match probe(net_id).await {
                    Ok(addrs) => {
                        if let Some(found) = addrs.iter().find_map(|a| extract_prefix(*a)) {
                            info!("discovered NAT64 prefix {} on netid {}", found, net_id);
                            *slot.lock().unwrap() = Some(found);
                            return;
                        }
                        debug!("no NAT64 prefix in answer on netid {}", net_id);
                    }
                    Err(e) => debug!("prefix discovery on netid {} failed: {}", net_id, e),
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        });
        networks.insert(net_id, Discovery { task, prefix });
        true
    }

    /// Stops discovery and forgets any discovered prefix. False if nothing
    /// was running.
    pub fn stop(&self, net_id: u32) -> bool {
        match self.networks.lock().unwrap().remove(&net_id) {
            Some(discovery) => {
                discovery.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, net_id: u32) -> Option<Prefix64> {
        self.networks
            .lock()
            .unwrap()
            .get(&net_id)
            .and_then(|d| *d.prefix.lock().unwrap())
    }
}

/// Checks whether `addr` embeds one of the RFC 7050 well-known IPv4
/// addresses at /96 and returns the enclosing prefix if so. Only /96
/// prefixes are supported.
fn extract_prefix(addr: Ipv6Addr) -> Option<Prefix64> {
    let octets = addr.octets();
    if !WELL_KNOWN_V4.iter().any(|v4| octets[12..16] == *v4) {
        return None;
    }
    let mut prefix = octets;
    prefix[12..16].copy_from_slice(&[0, 0, 0, 0]);
    Some(Prefix64 {
        prefix: Ipv6Addr::from(prefix),
        prefix_len: 96,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_extract_prefix() {
        let embedded: Ipv6Addr = "64:ff9b::c000:aa".parse().unwrap(); // 192.0.0.170
        let found = extract_prefix(embedded).unwrap();
        assert_eq!(found.prefix, "64:ff9b::".parse::<Ipv6Addr>().unwrap());
        assert_eq!(found.prefix_len, 96);

        let other: Ipv6Addr = "64:ff9b::c000:ab".parse().unwrap(); // 192.0.0.171
        assert!(extract_prefix(other).is_some());

        let unrelated: Ipv6Addr = "2001:db8::1".parse().unwrap();
        assert!(extract_prefix(unrelated).is_none());
    }

    #[tokio::test]
    async fn test_discovery_retries_until_found() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let probe: ProbeFn = Arc::new(move |_net_id| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    // First answer carries no usable AAAA.
                    Ok(vec!["2001:db8::1".parse().unwrap()])
                } else {
                    Ok(vec!["64:ff9b::c000:aa".parse().unwrap()])
                }
            }
            .boxed()
        });

        let discovery = Prefix64Discovery::new();
        tokio::time::pause();
        assert!(discovery.start(30, probe.clone()));
        assert!(!discovery.start(30, probe));

        while discovery.get(30).is_none() {
            tokio::time::advance(INITIAL_BACKOFF).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(
            discovery.get(30).unwrap().prefix,
            "64:ff9b::".parse::<Ipv6Addr>().unwrap()
        );
        assert!(attempts.load(Ordering::SeqCst) >= 2);

        assert!(discovery.stop(30));
        assert!(!discovery.stop(30));
        assert!(discovery.get(30).is_none());
    }
}
