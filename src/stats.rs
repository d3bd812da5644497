//! Server reachability statistics.
//!
//! Every upstream exchange leaves one sample (rcode or a synthetic timeout /
//! internal-error marker, plus the round-trip time) in a per-server ring.
//! The rings decide which servers are currently worth querying: a server
//! drops out once it has enough fresh samples, at least one failure among
//! them, and a success rate under the configured threshold. Stale rings are
//! cleared so a failed server is probed again, and if every server is
//! unusable they are all declared usable rather than stranding the network.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::FxHashMap;

use crate::message::{RCODE_NOERROR, RCODE_NOTAUTH, RCODE_NXDOMAIN};
use crate::params::ResolverParams;
use crate::server::DnsServer;

/// Outcome of one upstream exchange. Wire rcodes are extended with the two
/// synthetic codes the wire can never carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerCode {
    Rcode(u16),
    Timeout,
    InternalError,
}

/// One observation of a server interaction.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at_secs: u64,
    pub code: AnswerCode,
    pub rtt_ms: u32,
}

impl Sample {
    pub fn new(code: AnswerCode, rtt_ms: u32) -> Self {
        Sample {
            at_secs: now_secs(),
            code,
            rtt_ms,
        }
    }
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Aggregated view over one server's ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSummary {
    pub successes: u32,
    pub errors: u32,
    pub timeouts: u32,
    pub internal_errors: u32,
    /// Average RTT over successful samples; `None` without any success.
    pub rtt_avg_ms: Option<u32>,
    pub last_sample_secs: u64,
}

impl StatsSummary {
    pub fn total(&self) -> u32 {
        self.successes + self.errors + self.timeouts
    }
}

/// Ring of the most recent samples for one server. When full, the oldest
/// sample is overwritten.
#[derive(Debug, Clone, Default)]
struct SampleRing {
    samples: Vec<Sample>,
    next: usize,
}

impl SampleRing {
    fn push(&mut self, sample: Sample, max_samples: usize) {
        if max_samples == 0 {
            return;
        }
        if self.samples.len() > max_samples {
            // max_samples shrank under us; restart rather than reason about
            // a partially valid ring.
            self.clear();
        }
        if self.samples.len() < max_samples {
            self.samples.push(sample);
            self.next = self.samples.len() % max_samples;
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % max_samples;
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }

    fn aggregate(&self) -> StatsSummary {
        let mut out = StatsSummary::default();
        let mut rtt_sum: u64 = 0;
        let mut rtt_count: u32 = 0;
        for sample in &self.samples {
            match sample.code {
                // NXDOMAIN and NOTAUTH really happen for user queries, and
                // NOERROR with an empty answer section is not a failure
                // either; only codes a server uses to reject count against
                // it, along with unknown codes.
                AnswerCode::Rcode(RCODE_NOERROR)
                | AnswerCode::Rcode(RCODE_NOTAUTH)
                | AnswerCode::Rcode(RCODE_NXDOMAIN) => {
                    out.successes += 1;
                    rtt_sum += sample.rtt_ms as u64;
                    rtt_count += 1;
                }
                AnswerCode::Timeout => out.timeouts += 1,
                AnswerCode::InternalError => out.internal_errors += 1,
                AnswerCode::Rcode(_) => out.errors += 1,
            }
        }
        if rtt_count > 0 {
            out.rtt_avg_ms = Some((rtt_sum / rtt_count as u64) as u32);
        }
        if !self.samples.is_empty() {
            let last = if self.next > 0 {
                self.next - 1
            } else {
                self.samples.len() - 1
            };
            out.last_sample_secs = self.samples[last].at_secs;
        }
        out
    }
}

/// All sample rings for one network, tagged with the revision id of the
/// server set they belong to.
#[derive(Debug, Default)]
pub struct ServerStats {
    revision: u32,
    buckets: FxHashMap<SocketAddr, SampleRing>,
}

impl ServerStats {
    /// Applies a new server set. Rings for servers that survive the change
    /// are kept; everything else is dropped, and samples recorded against
    /// the old revision will be discarded on arrival.
    pub fn reset_servers(&mut self, servers: &[DnsServer], revision: u32) {
        self.revision = revision;
        self.buckets
            .retain(|addr, _| servers.iter().any(|s| s.addr == *addr));
        for server in servers {
            self.buckets.entry(server.addr).or_default();
        }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Records a sample, unless the server set changed since the caller
    /// captured `revision`.
    pub fn record(&mut self, revision: u32, server: &DnsServer, sample: Sample, max_samples: u32) {
        if revision != self.revision {
            log::debug!(
                "dropping stale sample for {} (revision {} != {})",
                server,
                revision,
                self.revision
            );
            return;
        }
        if let Some(ring) = self.buckets.get_mut(&server.addr) {
            ring.push(sample, max_samples as usize);
        }
    }

    pub fn aggregate(&self, server: &DnsServer) -> Option<StatsSummary> {
        self.buckets.get(&server.addr).map(|ring| ring.aggregate())
    }

    /// The subset of `servers` currently worth querying, evaluated at
    /// `now_secs`. Stale rings of otherwise unusable servers are cleared so
    /// the server gets probed again. If nothing is usable, everything is.
    pub fn usable_servers(
        &mut self,
        params: &ResolverParams,
        servers: &[DnsServer],
        now_secs: u64,
    ) -> Vec<DnsServer> {
        let mut usable: Vec<DnsServer> = Vec::with_capacity(servers.len());
        for server in servers {
            if self.is_usable(params, server, now_secs) {
                usable.push(server.clone());
            }
        }
        if usable.is_empty() {
            return servers.to_vec();
        }
        usable
    }

    fn is_usable(&mut self, params: &ResolverParams, server: &DnsServer, now_secs: u64) -> bool {
        let Some(ring) = self.buckets.get_mut(&server.addr) else {
            return true;
        };
        let agg = ring.aggregate();
        let total = agg.total();
        if total < params.min_samples || (agg.errors == 0 && agg.timeouts == 0) {
            return true;
        }
        let success_rate = agg.successes * 100 / total;
        if success_rate >= params.success_threshold {
            return true;
        }
        if now_secs.saturating_sub(agg.last_sample_secs) > params.sample_validity.as_secs() {
            log::info!("stats for {} are stale, retrying server", server);
            ring.clear();
            return true;
        }
        log::info!(
            "too many resolution errors for {} (success rate {}%), ignoring server",
            server,
            success_rate
        );
        false
    }
}
