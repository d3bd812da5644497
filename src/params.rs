use std::time::Duration;

/// Most entries a search path may carry.
pub const MAX_SEARCH_DOMAINS: usize = 6;

/// RFC 1035 limit on a domain name, in octets.
const MAX_DOMAIN_LEN: usize = 255;

/// Hard ceiling on how long a cache waiter may block on someone else's
/// in-flight query, whatever the configured timeouts say.
pub const MAX_PENDING_WAIT: Duration = Duration::from_secs(50);

/// Per-network resolver tunables.
///
/// The sampling fields drive the stats engine: a server's reachability is
/// judged over at most `max_samples` observations no older than
/// `sample_validity`, and it takes `min_samples` of them before the success
/// threshold applies at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverParams {
    pub sample_validity: Duration,
    /// Success percentage below which a server is considered broken.
    pub success_threshold: u32,
    pub min_samples: u32,
    pub max_samples: u32,
    pub base_timeout_ms: u64,
    pub retry_count: u32,
}

impl Default for ResolverParams {
    fn default() -> Self {
        ResolverParams {
            sample_validity: Duration::from_secs(1800),
            success_threshold: 25,
            min_samples: 4,
            max_samples: 8,
            base_timeout_ms: 5000,
            retry_count: 2,
        }
    }
}

impl ResolverParams {
    /// Rejects parameter combinations no deployment could mean.
    pub fn validate(&self) -> std::io::Result<()> {
        let invalid = |what: &str| {
            Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid resolver params: {}", what),
            ))
        };
        if self.success_threshold > 100 {
            return invalid("success_threshold > 100");
        }
        if self.max_samples == 0 || self.max_samples > 64 {
            return invalid("max_samples out of range");
        }
        if self.min_samples > self.max_samples {
            return invalid("min_samples > max_samples");
        }
        if self.base_timeout_ms == 0 {
            return invalid("base_timeout_ms == 0");
        }
        if self.retry_count == 0 {
            return invalid("retry_count == 0");
        }
        Ok(())
    }

    /// Per-attempt deadline for a single upstream exchange.
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    /// How long a cache waiter may wait for someone else's in-flight query:
    /// the whole retry schedule, bounded above.
    pub fn pending_wait(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms.saturating_mul(self.retry_count as u64))
            .min(MAX_PENDING_WAIT)
    }
}

/// Normalises a configured search path: entries over 255 octets are silently
/// dropped, duplicates keep their first occurrence, and only the first six
/// valid entries survive.
pub fn normalize_search_domains(domains: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for domain in domains {
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            continue;
        }
        if out.iter().any(|d| d == domain) {
            continue;
        }
        out.push(domain.clone());
        if out.len() == MAX_SEARCH_DOMAINS {
            break;
        }
    }
    out
}
