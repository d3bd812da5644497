//! Per-network private DNS (DoT) configuration and validation.
//!
//! Each network is in one of three modes: off, opportunistic (use DoT to
//! servers that have proven themselves, fall back to cleartext), or strict
//! (hostname-bound DoT only, no fallback). Every server added to a network's
//! set is probed over the real DoT transport by a detached validation
//! worker; an observer hears about every state transition.
//!
//! A worker's result is only accepted if the (network, server identity) it
//! validated is still configured when it finishes; otherwise the result is
//! discarded and the observer sees a failure for the stale identity. At most
//! one validation per identity runs at a time, so repeated `set()` calls
//! with the same servers never pile up workers.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::dot::dispatcher::DnsTlsDispatcher;
use crate::dot::DotResponseCode;
use crate::message;
use crate::server::{DnsServer, ServerIdentity};
use crate::telemetry::LogValidationSink;
use crate::tls;

/// Question used to probe a candidate DoT server.
const PROBE_NAME: &str = "www.google.com.";

const MAX_RESPONSE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivateDnsMode {
    Off,
    Opportunistic,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    Unknown,
    InProcess,
    Success,
    Fail,
}

/// Hears every validation state transition, keyed by server address.
pub trait ValidationObserver: Send + Sync {
    fn on_validation_state_update(&self, server: IpAddr, state: ValidationState, net_id: u32);
}

/// Snapshot of a network's private DNS state.
#[derive(Debug, Clone)]
pub struct PrivateDnsStatus {
    pub mode: PrivateDnsMode,
    pub servers: Vec<(DnsServer, ValidationState)>,
}

impl PrivateDnsStatus {
    fn off() -> Self {
        PrivateDnsStatus {
            mode: PrivateDnsMode::Off,
            servers: Vec::new(),
        }
    }
}

struct TrackedServer {
    server: DnsServer,
    state: ValidationState,
}

struct NetworkPrivateDns {
    mode: PrivateDnsMode,
    servers: FxHashMap<ServerIdentity, TrackedServer>,
}

#[derive(Default)]
struct Inner {
    networks: FxHashMap<u32, NetworkPrivateDns>,
    /// Identities with a validation worker currently running.
    in_flight: HashSet<(u32, ServerIdentity)>,
}

/// The installed observer: the log-backed default is owned, a caller's
/// replacement is held non-owning.
enum ObserverRef {
    Owned(Arc<dyn ValidationObserver>),
    External(Weak<dyn ValidationObserver>),
}

pub struct PrivateDnsConfiguration {
    dispatcher: Arc<DnsTlsDispatcher>,
    inner: Mutex<Inner>,
    observer: Mutex<ObserverRef>,
    running: AtomicUsize,
}

impl PrivateDnsConfiguration {
    pub fn new(dispatcher: Arc<DnsTlsDispatcher>) -> Arc<Self> {
        Arc::new(PrivateDnsConfiguration {
            dispatcher,
            inner: Mutex::new(Inner::default()),
            observer: Mutex::new(ObserverRef::Owned(Arc::new(LogValidationSink))),
            running: AtomicUsize::new(0),
        })
    }

    /// Replaces the default log-backed observer. The replacement is held
    /// non-owning; it must outlive this configuration or simply stop
    /// receiving callbacks.
    pub fn set_observer(&self, observer: &Arc<dyn ValidationObserver>) {
        *self.observer.lock().unwrap() = ObserverRef::External(Arc::downgrade(observer));
    }

    /// Applies the DoT configuration for a network. Any malformed address or
    /// fingerprint fails the whole call before any state changes.
    pub fn set(
        self: &Arc<Self>,
        net_id: u32,
        mark: u32,
        tls_servers: &[String],
        hostname: &str,
        tls_fingerprints: &[String],
    ) -> std::io::Result<()> {
        let fingerprints = tls::parse_fingerprints(tls_fingerprints)?;
        let mut servers = Vec::with_capacity(tls_servers.len());
        for s in tls_servers {
            let mut server = DnsServer::parse_tls(s, hostname)?;
            server.fingerprints = fingerprints.clone();
            servers.push(server);
        }

        let mode = if servers.is_empty() {
            PrivateDnsMode::Off
        } else if !hostname.is_empty() {
            PrivateDnsMode::Strict
        } else {
            PrivateDnsMode::Opportunistic
        };
        debug!(
            "private DNS for netid {}: mode {:?}, {} server(s)",
            net_id,
            mode,
            servers.len()
        );

        let mut notifications = Vec::new();
        let mut workers = Vec::new();
        {
            let mut guard = self.inner.lock().unwrap();
            let inner = &mut *guard;
            if servers.is_empty() {
                inner.networks.remove(&net_id);
            } else {
                let net = inner
                    .networks
                    .entry(net_id)
                    .or_insert_with(|| NetworkPrivateDns {
                        mode,
                        servers: FxHashMap::default(),
                    });
                net.mode = mode;

                let keep: HashSet<ServerIdentity> =
                    servers.iter().map(|s| s.identity()).collect();
                net.servers.retain(|identity, _| keep.contains(identity));

                for server in servers {
                    let identity = server.identity();
                    if net.servers.contains_key(&identity) {
                        continue;
                    }
                    net.servers.insert(
                        identity.clone(),
                        TrackedServer {
                            server: server.clone(),
                            state: ValidationState::InProcess,
                        },
                    );
                    if inner.in_flight.contains(&(net_id, identity.clone())) {
                        // A worker for this identity is still out; its
                        // result will land on the re-added entry.
                        continue;
                    }
                    inner.in_flight.insert((net_id, identity.clone()));
                    notifications.push((server.ip(), ValidationState::InProcess));
                    workers.push((server, identity, mark));
                }
            }
        }

        for (ip, state) in notifications {
            self.notify_observer(ip, state, net_id);
        }
        for (server, identity, mark) in workers {
            self.running.fetch_add(1, Ordering::SeqCst);
            let this = self.clone();
            tokio::spawn(async move {
                let success = this.validate(&server, net_id, mark).await;
                this.on_validation_complete(net_id, identity, success);
            });
        }
        Ok(())
    }

    /// Forgets a destroyed network. Workers still out for it publish their
    /// completion as failures and their results are discarded.
    pub fn clear(&self, net_id: u32) {
        debug!("clearing private DNS state for netid {}", net_id);
        self.inner.lock().unwrap().networks.remove(&net_id);
    }

    pub fn get_status(&self, net_id: u32) -> PrivateDnsStatus {
        let inner = self.inner.lock().unwrap();
        match inner.networks.get(&net_id) {
            Some(net) => PrivateDnsStatus {
                mode: net.mode,
                servers: net
                    .servers
                    .values()
                    .map(|t| (t.server.clone(), t.state))
                    .collect(),
            },
            None => PrivateDnsStatus::off(),
        }
    }

    /// The servers lookups may currently route DoT queries to: only those
    /// that have validated successfully.
    pub fn usable_dot_servers(&self, net_id: u32) -> (PrivateDnsMode, Vec<DnsServer>) {
        let inner = self.inner.lock().unwrap();
        match inner.networks.get(&net_id) {
            Some(net) => {
                let servers = net
                    .servers
                    .values()
                    .filter(|t| t.state == ValidationState::Success)
                    .map(|t| t.server.clone())
                    .collect();
                (net.mode, servers)
            }
            None => (PrivateDnsMode::Off, Vec::new()),
        }
    }

    /// Number of validation workers currently running. Teardown waits on
    /// this reaching zero.
    pub fn running_validations(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn join_validations(&self) {
        while self.running_validations() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// One DoT probe against a candidate server.
    async fn validate(&self, server: &DnsServer, net_id: u32, mark: u32) -> bool {
        let name = match Name::from_ascii(PROBE_NAME) {
            Ok(name) => name,
            Err(_) => return false,
        };
        let query = match message::build_query(
            &name,
            DNSClass::IN,
            RecordType::A,
            rand::random::<u16>(),
            true,
        ) {
            Ok(query) => query,
            Err(e) => {
                warn!("could not build validation probe: {}", e);
                return false;
            }
        };
        let mut answer = vec![0u8; MAX_RESPONSE];
        let reply = self
            .dispatcher
            .query(server, net_id, mark, &query, &mut answer)
            .await;
        if reply.code != DotResponseCode::Success {
            debug!("validation probe to {} failed: {:?}", server, reply.code);
            return false;
        }
        message::summarize_response(&answer[..reply.len]).is_ok()
    }

    fn on_validation_complete(&self, net_id: u32, identity: ServerIdentity, success: bool) {
        let (ip, state) = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(&(net_id, identity.clone()));
            let tracked = inner
                .networks
                .get_mut(&net_id)
                .and_then(|net| net.servers.get_mut(&identity));
            match tracked {
                Some(tracked) => {
                    tracked.state = if success {
                        ValidationState::Success
                    } else {
                        ValidationState::Fail
                    };
                    (identity.ip, tracked.state)
                }
                // The network was cleared or the server replaced while the
                // worker ran: discard the result, report the completion as a
                // failure.
                None => (identity.ip, ValidationState::Fail),
            }
        };
        self.notify_observer(ip, state, net_id);
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    // Callbacks run outside the state lock so an observer may call back in.
    fn notify_observer(&self, ip: IpAddr, state: ValidationState, net_id: u32) {
        let observer = match &*self.observer.lock().unwrap() {
            ObserverRef::Owned(observer) => Some(observer.clone()),
            ObserverRef::External(weak) => weak.upgrade(),
        };
        if let Some(observer) = observer {
            observer.on_validation_state_update(ip, state, net_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dot::socket::{FakeBehavior, FakeSpec, SocketFactory};

    const NETID: u32 = 30;
    const MARK: u32 = 30;
    const SERVER1: &str = "127.0.2.2";
    const SERVER2: &str = "127.0.2.3";

    #[derive(Default)]
    struct MockObserver {
        events: Mutex<Vec<(IpAddr, ValidationState, u32)>>,
    }

    impl ValidationObserver for MockObserver {
        fn on_validation_state_update(&self, server: IpAddr, state: ValidationState, net_id: u32) {
            self.events.lock().unwrap().push((server, state, net_id));
        }
    }

    impl MockObserver {
        fn events(&self) -> Vec<(IpAddr, ValidationState, u32)> {
            self.events.lock().unwrap().clone()
        }
    }

    fn setup(behavior: FakeBehavior) -> (Arc<PrivateDnsConfiguration>, Arc<MockObserver>) {
        let dispatcher = Arc::new(DnsTlsDispatcher::new(SocketFactory::faked(FakeSpec::new(
            behavior,
        ))));
        let config = PrivateDnsConfiguration::new(dispatcher);
        let observer = Arc::new(MockObserver::default());
        let dyn_observer: Arc<dyn ValidationObserver> = observer.clone();
        config.set_observer(&dyn_observer);
        (config, observer)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_validation_success() {
        let (config, observer) = setup(FakeBehavior::Echo);
        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        config.join_validations().await;

        assert_eq!(
            observer.events(),
            vec![
                (ip(SERVER1), ValidationState::InProcess, NETID),
                (ip(SERVER1), ValidationState::Success, NETID),
            ]
        );
        let status = config.get_status(NETID);
        assert_eq!(status.mode, PrivateDnsMode::Opportunistic);
        assert_eq!(status.servers.len(), 1);
        assert_eq!(status.servers[0].1, ValidationState::Success);

        let (mode, usable) = config.usable_dot_servers(NETID);
        assert_eq!(mode, PrivateDnsMode::Opportunistic);
        assert_eq!(usable.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_opportunistic() {
        let (config, observer) = setup(FakeBehavior::FailHandshake);
        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        config.join_validations().await;

        assert_eq!(
            observer.events(),
            vec![
                (ip(SERVER1), ValidationState::InProcess, NETID),
                (ip(SERVER1), ValidationState::Fail, NETID),
            ]
        );
        // Mode stays opportunistic; lookups just have no DoT server to use.
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Opportunistic);
        let (_, usable) = config.usable_dot_servers(NETID);
        assert!(usable.is_empty());
    }

    #[tokio::test]
    async fn test_strict_mode_and_hostname() {
        let (config, _observer) = setup(FakeBehavior::FailHandshake);
        config
            .set(
                NETID,
                MARK,
                &[SERVER1.to_string()],
                "dns.example.com",
                &[],
            )
            .unwrap();
        let status = config.get_status(NETID);
        assert_eq!(status.mode, PrivateDnsMode::Strict);
        assert_eq!(status.servers[0].0.hostname, "dns.example.com");
        config.join_validations().await;
    }

    #[tokio::test]
    async fn test_invalid_input_changes_nothing() {
        let (config, observer) = setup(FakeBehavior::Echo);

        assert!(config
            .set(NETID, MARK, &["invalid_addr".to_string()], "", &[])
            .is_err());
        assert!(observer.events().is_empty());
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Off);

        // Bad fingerprints are rejected just as atomically.
        assert!(config
            .set(
                NETID,
                MARK,
                &[SERVER1.to_string()],
                "",
                &["not-hex".to_string()],
            )
            .is_err());
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Off);

        // Off stays off without notifications.
        config.set(NETID, MARK, &[], "", &[]).unwrap();
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_no_duplicate_validation_while_in_flight() {
        // A backend that never releases responses keeps workers in flight.
        let (config, observer) = setup(FakeBehavior::Delay {
            hold: 1000,
            reverse: false,
        });
        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        config
            .set(NETID, MARK, &[SERVER2.to_string()], "", &[])
            .unwrap();
        assert_eq!(config.running_validations(), 2);
        let baseline = observer.events();
        assert_eq!(
            baseline,
            vec![
                (ip(SERVER1), ValidationState::InProcess, NETID),
                (ip(SERVER2), ValidationState::InProcess, NETID),
            ]
        );

        // Re-adding servers whose validations are still out starts nothing
        // and notifies nothing.
        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        config
            .set(
                NETID,
                MARK,
                &[SERVER1.to_string(), SERVER2.to_string()],
                "",
                &[],
            )
            .unwrap();
        config
            .set(NETID, MARK, &[SERVER2.to_string()], "", &[])
            .unwrap();
        assert_eq!(observer.events(), baseline);
        assert_eq!(config.running_validations(), 2);
    }

    #[tokio::test]
    async fn test_cleared_network_discards_late_result() {
        // hold: 2 so the test can flush the held probe by sending one more
        // query through the same transport.
        let dispatcher = Arc::new(DnsTlsDispatcher::new(SocketFactory::faked(FakeSpec::new(
            FakeBehavior::Delay {
                hold: 2,
                reverse: false,
            },
        ))));
        let config = PrivateDnsConfiguration::new(dispatcher.clone());
        let observer = Arc::new(MockObserver::default());
        let dyn_observer: Arc<dyn ValidationObserver> = observer.clone();
        config.set_observer(&dyn_observer);

        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        assert_eq!(config.running_validations(), 1);

        config.clear(NETID);
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Off);

        // Release the held probe: the worker completes, but the network is
        // gone, so the observer sees a failure and no state reappears.
        let server = DnsServer::parse_tls(SERVER1, "").unwrap();
        let filler = {
            let mut q = vec![0u8; 20];
            q[0] = 0xab;
            q
        };
        let mut answer = vec![0u8; 4096];
        let _ = dispatcher
            .query(&server, NETID, MARK, &filler, &mut answer)
            .await;
        config.join_validations().await;

        let events = observer.events();
        assert_eq!(events[0], (ip(SERVER1), ValidationState::InProcess, NETID));
        assert!(events
            .contains(&(ip(SERVER1), ValidationState::Fail, NETID)));
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Off);
    }

    #[tokio::test]
    async fn test_off_mode_discards_like_clear() {
        let (config, observer) = setup(FakeBehavior::Delay {
            hold: 1000,
            reverse: false,
        });
        config
            .set(NETID, MARK, &[SERVER1.to_string()], "", &[])
            .unwrap();
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Opportunistic);

        config.set(NETID, MARK, &[], "", &[]).unwrap();
        assert_eq!(config.get_status(NETID).mode, PrivateDnsMode::Off);
        assert_eq!(
            observer.events(),
            vec![(ip(SERVER1), ValidationState::InProcess, NETID)]
        );
    }
}
