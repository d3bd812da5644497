//! The netid registry and the configuration surface.
//!
//! The only process-wide mutable object: a map from network id to that
//! network's cache, server set, stats and parameters, next to the shared
//! private-DNS state, the DoT dispatcher and the NAT64 discovery tasks.
//! The registry lock is only ever held to snapshot or swap state; lookups
//! run against a [`LookupContext`] snapshot, never under the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use log::{info, LevelFilter};
use rustc_hash::FxHashMap;

use crate::cache::{self, ResponseCache};
use crate::dot::dispatcher::DnsTlsDispatcher;
use crate::dot::socket::SocketFactory;
use crate::message;
use crate::params::{normalize_search_domains, ResolverParams};
use crate::prefix64::{Prefix64, Prefix64Discovery, ProbeFn};
use crate::private_dns::{PrivateDnsConfiguration, PrivateDnsStatus, ValidationObserver};
use crate::resolver::{self, LookupContext, LookupError};
use crate::server::{DnsServer, DNS_PORT};
use crate::stats::{ServerStats, StatsSummary};
use crate::telemetry::{LogSink, LookupEventSink};

/// Everything `setResolverConfiguration` takes for one network.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    pub net_id: u32,
    pub servers: Vec<String>,
    pub domains: Vec<String>,
    pub params: ResolverParams,
    pub tls_name: String,
    pub tls_servers: Vec<String>,
    pub tls_fingerprints: Vec<String>,
}

/// Snapshot returned by `getResolverInfo`.
#[derive(Debug, Clone)]
pub struct ResolverInfo {
    pub servers: Vec<DnsServer>,
    pub domains: Vec<String>,
    pub private_dns: PrivateDnsStatus,
    pub params: ResolverParams,
    pub stats: Vec<(DnsServer, StatsSummary)>,
    pub pending_timeout_count: u64,
}

struct NetworkEntry {
    cache: Arc<ResponseCache>,
    stats: Arc<Mutex<ServerStats>>,
    servers: Vec<DnsServer>,
    domains: Vec<String>,
    params: ResolverParams,
    revision: u32,
    mark: u32,
    pending_timeouts: Arc<AtomicU64>,
}

impl NetworkEntry {
    fn new() -> Self {
        NetworkEntry {
            cache: ResponseCache::new(cache::DEFAULT_CAPACITY),
            stats: Arc::new(Mutex::new(ServerStats::default())),
            servers: Vec::new(),
            domains: Vec::new(),
            params: ResolverParams::default(),
            revision: 0,
            mark: 0,
            pending_timeouts: Arc::new(AtomicU64::new(0)),
        }
    }
}

pub struct ResolverRegistry {
    networks: Mutex<FxHashMap<u32, NetworkEntry>>,
    dispatcher: Arc<DnsTlsDispatcher>,
    private_dns: Arc<PrivateDnsConfiguration>,
    prefix64: Prefix64Discovery,
    telemetry: Mutex<Arc<dyn LookupEventSink>>,
}

impl ResolverRegistry {
    pub fn new() -> Arc<Self> {
        Self::with_factory(SocketFactory::new())
    }

    pub fn with_factory(factory: SocketFactory) -> Arc<Self> {
        let dispatcher = Arc::new(DnsTlsDispatcher::new(factory));
        Arc::new(ResolverRegistry {
            networks: Mutex::new(FxHashMap::default()),
            private_dns: PrivateDnsConfiguration::new(dispatcher.clone()),
            dispatcher,
            prefix64: Prefix64Discovery::new(),
            telemetry: Mutex::new(Arc::new(LogSink)),
        })
    }

    pub fn create_network_cache(&self, net_id: u32) -> std::io::Result<()> {
        let mut networks = self.networks.lock().unwrap();
        if networks.contains_key(&net_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("network {} already exists", net_id),
            ));
        }
        info!("created network cache for netid {}", net_id);
        networks.insert(net_id, NetworkEntry::new());
        Ok(())
    }

    /// Tears down a network entirely. Pending cache entries are failed,
    /// private DNS state is dropped and prefix discovery stopped. Always
    /// succeeds, even for unknown networks.
    pub fn destroy_network_cache(&self, net_id: u32) {
        let removed = self.networks.lock().unwrap().remove(&net_id);
        if let Some(entry) = removed {
            entry.cache.flush();
        }
        self.private_dns.clear(net_id);
        self.prefix64.stop(net_id);
        info!("destroyed network cache for netid {}", net_id);
    }

    /// Atomically replaces a network's cleartext and DoT configuration.
    /// Nothing changes when any part of the new configuration is invalid.
    pub fn set_resolver_configuration(
        self: &Arc<Self>,
        config: &ResolverConfig,
    ) -> std::io::Result<()> {
        config.params.validate()?;
        let mut servers = Vec::with_capacity(config.servers.len());
        for s in &config.servers {
            servers.push(DnsServer::udp(crate::address::parse_socket_addr(
                s, DNS_PORT,
            )?));
        }
        // Pre-validate the DoT side so nothing is applied when it is
        // malformed; the actual private_dns.set happens after the registry
        // lock is released because it notifies the validation observer.
        crate::tls::parse_fingerprints(&config.tls_fingerprints)?;
        for s in &config.tls_servers {
            DnsServer::parse_tls(s, &config.tls_name)?;
        }
        let domains = normalize_search_domains(&config.domains);

        // The socket mark doubles as the transport key for this network.
        let mark = config.net_id;

        {
            let mut networks = self.networks.lock().unwrap();
            let Some(entry) = networks.get_mut(&config.net_id) else {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no cache for network {}", config.net_id),
                ));
            };

            entry.revision = entry.revision.wrapping_add(1);
            entry.servers = servers;
            entry.domains = domains;
            entry.params = config.params;
            entry.mark = mark;
            let revision = entry.revision;
            entry
                .stats
                .lock()
                .unwrap()
                .reset_servers(&entry.servers, revision);
            info!(
                "resolver configuration for netid {} applied (revision {}, {} server(s))",
                config.net_id,
                revision,
                entry.servers.len()
            );
        }

        self.private_dns.set(
            config.net_id,
            mark,
            &config.tls_servers,
            &config.tls_name,
            &config.tls_fingerprints,
        )?;
        Ok(())
    }

    pub fn get_resolver_info(&self, net_id: u32) -> std::io::Result<ResolverInfo> {
        let networks = self.networks.lock().unwrap();
        let Some(entry) = networks.get(&net_id) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no cache for network {}", net_id),
            ));
        };
        let stats = entry.stats.lock().unwrap();
        Ok(ResolverInfo {
            servers: entry.servers.clone(),
            domains: entry.domains.clone(),
            private_dns: self.private_dns.get_status(net_id),
            params: entry.params,
            stats: entry
                .servers
                .iter()
                .filter_map(|s| stats.aggregate(s).map(|agg| (s.clone(), agg)))
                .collect(),
            pending_timeout_count: entry.pending_timeouts.load(Ordering::Relaxed),
        })
    }

    /// Empties a network's cache, aborting in-flight entries.
    pub fn flush_network_cache(&self, net_id: u32) -> std::io::Result<()> {
        let cache = self.cache_for(net_id)?;
        cache.flush();
        Ok(())
    }

    pub fn resize_network_cache(&self, net_id: u32, capacity: usize) -> std::io::Result<()> {
        let cache = self.cache_for(net_id)?;
        cache.resize(capacity);
        Ok(())
    }

    fn cache_for(&self, net_id: u32) -> std::io::Result<Arc<ResponseCache>> {
        self.networks
            .lock()
            .unwrap()
            .get(&net_id)
            .map(|e| e.cache.clone())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no cache for network {}", net_id),
                )
            })
    }

    pub fn set_validation_observer(&self, observer: &Arc<dyn ValidationObserver>) {
        self.private_dns.set_observer(observer);
    }

    pub fn set_telemetry(&self, sink: Arc<dyn LookupEventSink>) {
        *self.telemetry.lock().unwrap() = sink;
    }

    pub fn private_dns(&self) -> &Arc<PrivateDnsConfiguration> {
        &self.private_dns
    }

    /// Resolves one question on one network through the full pipeline.
    pub async fn resolve(
        self: &Arc<Self>,
        net_id: u32,
        name: &Name,
        qclass: DNSClass,
        qtype: RecordType,
    ) -> Result<Vec<u8>, LookupError> {
        let Some(ctx) = self.lookup_context(net_id) else {
            return Err(LookupError::TryAgain);
        };
        resolver::resolve(&ctx, name, qclass, qtype).await
    }

    fn lookup_context(&self, net_id: u32) -> Option<LookupContext> {
        let networks = self.networks.lock().unwrap();
        let entry = networks.get(&net_id)?;
        Some(LookupContext {
            net_id,
            mark: entry.mark,
            cache: entry.cache.clone(),
            stats: entry.stats.clone(),
            params: entry.params,
            servers: entry.servers.clone(),
            revision: entry.revision,
            private_dns: self.private_dns.clone(),
            dispatcher: self.dispatcher.clone(),
            telemetry: self.telemetry.lock().unwrap().clone(),
            pending_timeouts: entry.pending_timeouts.clone(),
        })
    }

    /// Starts background NAT64 prefix discovery on a network.
    pub fn start_prefix64_discovery(self: &Arc<Self>, net_id: u32) -> std::io::Result<()> {
        if !self.networks.lock().unwrap().contains_key(&net_id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no cache for network {}", net_id),
            ));
        }
        let weak = Arc::downgrade(self);
        let probe: ProbeFn = Arc::new(move |net_id| {
            let weak = weak.clone();
            async move {
                let Some(registry) = weak.upgrade() else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "registry gone",
                    ));
                };
                let name = Name::from_ascii("ipv4only.arpa.").map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
                })?;
                match registry
                    .resolve(net_id, &name, DNSClass::IN, RecordType::AAAA)
                    .await
                {
                    Ok(bytes) => message::aaaa_addrs(&bytes),
                    Err(_) => Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "discovery lookup failed",
                    )),
                }
            }
            .boxed()
        });
        self.prefix64.start(net_id, probe);
        Ok(())
    }

    pub fn stop_prefix64_discovery(&self, net_id: u32) {
        self.prefix64.stop(net_id);
    }

    pub fn get_prefix64(&self, net_id: u32) -> Option<Prefix64> {
        self.prefix64.get(net_id)
    }
}

/// Maps a textual severity onto the process log filter.
pub fn set_log_severity(level: &str) -> std::io::Result<()> {
    let filter = match level {
        "VERBOSE" => LevelFilter::Trace,
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unknown log severity: {}", level),
            ))
        }
    };
    log::set_max_level(filter);
    Ok(())
}
