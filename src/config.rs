//! YAML configuration for the front-end binary.
//!
//! One file describes the listen address and every network the process
//! serves. Validation runs before anything is applied so a bad file is
//! rejected as a whole.

use std::net::SocketAddr;

use serde::Deserialize;

use crate::cache_registry::ResolverConfig;
use crate::params::ResolverParams;
use crate::server::{DnsServer, DNS_PORT};
use crate::tls;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the UDP front-end binds, e.g. "127.0.0.1:5300".
    pub listen: String,
    /// Network queries received on `listen` are resolved on. Defaults to
    /// the first configured network.
    #[serde(default)]
    pub serve_net_id: Option<u32>,
    pub networks: Vec<NetworkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    pub net_id: u32,
    #[serde(default, alias = "server")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub cache_size: Option<usize>,
    #[serde(default)]
    pub private_dns: Option<PrivateDnsSection>,
    #[serde(default)]
    pub params: ParamsSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrivateDnsSection {
    /// Expected certificate hostname. Non-empty selects strict mode.
    #[serde(default)]
    pub hostname: String,
    #[serde(default, alias = "server")]
    pub servers: Vec<String>,
    #[serde(default)]
    pub fingerprints: Vec<String>,
}

/// Optional parameter overrides; anything unset keeps the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamsSection {
    pub sample_validity_s: Option<u64>,
    pub success_threshold_pct: Option<u32>,
    pub min_samples: Option<u32>,
    pub max_samples: Option<u32>,
    pub base_timeout_ms: Option<u64>,
    pub retry_count: Option<u32>,
}

impl ParamsSection {
    pub fn resolve(&self) -> ResolverParams {
        let mut params = ResolverParams::default();
        if let Some(v) = self.sample_validity_s {
            params.sample_validity = std::time::Duration::from_secs(v);
        }
        if let Some(v) = self.success_threshold_pct {
            params.success_threshold = v;
        }
        if let Some(v) = self.min_samples {
            params.min_samples = v;
        }
        if let Some(v) = self.max_samples {
            params.max_samples = v;
        }
        if let Some(v) = self.base_timeout_ms {
            params.base_timeout_ms = v;
        }
        if let Some(v) = self.retry_count {
            params.retry_count = v;
        }
        params
    }
}

impl NetworkConfig {
    pub fn to_resolver_config(&self) -> ResolverConfig {
        let (tls_name, tls_servers, tls_fingerprints) = match &self.private_dns {
            Some(section) => (
                section.hostname.clone(),
                section.servers.clone(),
                section.fingerprints.clone(),
            ),
            None => (String::new(), Vec::new(), Vec::new()),
        };
        ResolverConfig {
            net_id: self.net_id,
            servers: self.servers.clone(),
            domains: self.domains.clone(),
            params: self.params.resolve(),
            tls_name,
            tls_servers,
            tls_fingerprints,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> std::io::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&text).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("could not parse {}: {}", path, e),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::io::Result<()> {
        let invalid = |what: String| {
            Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, what))
        };
        if self.listen.parse::<SocketAddr>().is_err() {
            return invalid(format!("invalid listen address: {}", self.listen));
        }
        if self.networks.is_empty() {
            return invalid("no networks configured".to_string());
        }
        let mut seen = std::collections::HashSet::new();
        for net in &self.networks {
            if !seen.insert(net.net_id) {
                return invalid(format!("duplicate net_id {}", net.net_id));
            }
            for server in &net.servers {
                crate::address::parse_socket_addr(server, DNS_PORT)?;
            }
            net.params.resolve().validate()?;
            if let Some(private_dns) = &net.private_dns {
                for server in &private_dns.servers {
                    DnsServer::parse_tls(server, &private_dns.hostname)?;
                }
                tls::parse_fingerprints(&private_dns.fingerprints)?;
            }
        }
        if let Some(serve) = self.serve_net_id {
            if !seen.contains(&serve) {
                return invalid(format!("serve_net_id {} is not configured", serve));
            }
        }
        Ok(())
    }

    pub fn serve_net_id(&self) -> u32 {
        self.serve_net_id.unwrap_or(self.networks[0].net_id)
    }
}
