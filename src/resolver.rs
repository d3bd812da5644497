//! The per-lookup pipeline.
//!
//! A lookup consults the network's cache first. On a miss it claims the key,
//! asks the stats engine which cleartext servers are worth trying, routes
//! through DoT when the network's private DNS state allows it, and finally
//! publishes whatever happened back into the cache so coalesced waiters and
//! later lookups benefit.
//!
//! Transport behaviours required here: truncated datagram answers are
//! retried over TCP against the same server; a FORMERR against an EDNS0
//! query is retried once without the OPT record before the server is given
//! up on; strict private DNS never falls back to cleartext, opportunistic
//! does.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use log::debug;

use crate::cache::{AdmitToken, CacheOutcome, CacheState, ResponseCache};
use crate::dot::dispatcher::DnsTlsDispatcher;
use crate::dot::DotResponseCode;
use crate::message::{
    self, CacheKey, ResponseSummary, RCODE_FORMERR, RCODE_NOERROR, RCODE_NOTAUTH, RCODE_NOTIMP,
    RCODE_NXDOMAIN, RCODE_REFUSED, RCODE_SERVFAIL,
};
use crate::net::{tcp, udp, MAX_PACKET};
use crate::params::ResolverParams;
use crate::private_dns::{PrivateDnsConfiguration, PrivateDnsMode};
use crate::server::DnsServer;
use crate::stats::{now_secs, AnswerCode, Sample, ServerStats};
use crate::telemetry::{LookupEvent, LookupEventSink};

/// What the name-lookup layer is told when no answer bytes exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// Transient: timeouts and network failures. Worth retrying.
    TryAgain,
    /// Permanent for this question: malformed responses and the like.
    NoRecord,
}

/// Everything one lookup needs, snapshotted from the registry so no
/// registry lock is held across network I/O.
pub struct LookupContext {
    pub net_id: u32,
    pub mark: u32,
    pub cache: Arc<ResponseCache>,
    pub stats: Arc<Mutex<ServerStats>>,
    pub params: ResolverParams,
    pub servers: Vec<DnsServer>,
    pub revision: u32,
    pub private_dns: Arc<PrivateDnsConfiguration>,
    pub dispatcher: Arc<DnsTlsDispatcher>,
    pub telemetry: Arc<dyn LookupEventSink>,
    pub pending_timeouts: Arc<AtomicU64>,
}

struct SendOutcome {
    bytes: Vec<u8>,
    server: DnsServer,
    /// Only clean answers go into the cache; rejections are returned to the
    /// caller but not stored.
    cacheable: bool,
}

enum Attempt {
    Answer(SendOutcome),
    /// The server rejected the query (SERVFAIL and friends). Kept as the
    /// answer of last resort while other servers are tried.
    Rejected(SendOutcome),
    Timeout,
    ParseError,
    Error,
}

pub async fn resolve(
    ctx: &LookupContext,
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
) -> Result<Vec<u8>, LookupError> {
    let started = Instant::now();
    let key = CacheKey::new(name, qclass, qtype);

    match ctx.cache.lookup(&key) {
        CacheState::Hit(bytes) => {
            emit(ctx, name, qtype, started, Ok(&bytes), None, true);
            Ok(bytes)
        }
        CacheState::Pending(waiter) => {
            match tokio::time::timeout(ctx.params.pending_wait(), waiter).await {
                Ok(Some(CacheOutcome::Answer(bytes))) => Ok(bytes),
                Ok(Some(CacheOutcome::Failure)) | Ok(None) => Err(LookupError::TryAgain),
                Err(_) => {
                    // The in-flight query keeps running and will publish
                    // for future callers; this caller gives up waiting.
                    ctx.pending_timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!("timed out waiting on an in-flight query");
                    Err(LookupError::TryAgain)
                }
            }
        }
        CacheState::Miss(token) => {
            let result = send_queries(ctx, name, qclass, qtype).await;
            publish(token, &result);
            match result {
                Ok(outcome) => {
                    emit(
                        ctx,
                        name,
                        qtype,
                        started,
                        Ok(&outcome.bytes),
                        Some(&outcome.server),
                        false,
                    );
                    Ok(outcome.bytes)
                }
                Err(e) => {
                    emit(ctx, name, qtype, started, Err(e), None, false);
                    Err(e)
                }
            }
        }
    }
}

fn publish(token: AdmitToken, result: &Result<SendOutcome, LookupError>) {
    match result {
        Ok(outcome) if outcome.cacheable => {
            token.publish(CacheOutcome::Answer(outcome.bytes.clone()));
        }
        _ => token.publish(CacheOutcome::Failure),
    }
}

fn emit(
    ctx: &LookupContext,
    name: &Name,
    qtype: RecordType,
    started: Instant,
    result: Result<&Vec<u8>, LookupError>,
    server: Option<&DnsServer>,
    cache_hit: bool,
) {
    let (rcode, ip_addrs) = match result {
        Ok(bytes) => (
            message::summarize_response(bytes).ok().map(|s| s.rcode),
            message::answer_ips(bytes),
        ),
        Err(_) => (None, Vec::new()),
    };
    ctx.telemetry.on_lookup_complete(&LookupEvent {
        net_id: ctx.net_id,
        query_type: u16::from(qtype),
        rcode,
        latency: started.elapsed(),
        hostname: name.to_ascii(),
        ip_addrs,
        server: server.cloned(),
        cache_hit,
    });
}

async fn send_queries(
    ctx: &LookupContext,
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
) -> Result<SendOutcome, LookupError> {
    let (mode, dot_servers) = ctx.private_dns.usable_dot_servers(ctx.net_id);
    match mode {
        PrivateDnsMode::Strict => {
            // No cleartext fallback, and nothing to ask until a server has
            // validated against the configured hostname.
            match query_dot(ctx, &dot_servers, name, qclass, qtype).await {
                Some(outcome) => Ok(outcome),
                None => Err(LookupError::TryAgain),
            }
        }
        PrivateDnsMode::Opportunistic => {
            if !dot_servers.is_empty() {
                if let Some(outcome) = query_dot(ctx, &dot_servers, name, qclass, qtype).await {
                    return Ok(outcome);
                }
                debug!("all DoT servers failed, falling back to cleartext");
            }
            query_cleartext(ctx, name, qclass, qtype).await
        }
        PrivateDnsMode::Off => query_cleartext(ctx, name, qclass, qtype).await,
    }
}

async fn query_dot(
    ctx: &LookupContext,
    servers: &[DnsServer],
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
) -> Option<SendOutcome> {
    let query = message::build_query(name, qclass, qtype, rand::random::<u16>(), true).ok()?;
    for server in servers {
        let mut answer = vec![0u8; MAX_PACKET];
        let start = Instant::now();
        let reply = ctx
            .dispatcher
            .query(server, ctx.net_id, ctx.mark, &query, &mut answer)
            .await;
        let rtt_ms = elapsed_ms(start);
        match reply.code {
            DotResponseCode::Success => {
                let bytes = answer[..reply.len].to_vec();
                match message::summarize_response(&bytes) {
                    Ok(summary) => {
                        record(ctx, server, AnswerCode::Rcode(summary.rcode), rtt_ms);
                        return Some(SendOutcome {
                            cacheable: cacheable_rcode(summary.rcode),
                            server: server.clone(),
                            bytes,
                        });
                    }
                    Err(e) => {
                        debug!("unparseable DoT response from {}: {}", server, e);
                        record(ctx, server, AnswerCode::InternalError, rtt_ms);
                    }
                }
            }
            DotResponseCode::NetworkError => {
                record(ctx, server, AnswerCode::Timeout, rtt_ms);
            }
            code => {
                debug!("DoT query to {} failed: {:?}", server, code);
                record(ctx, server, AnswerCode::InternalError, rtt_ms);
            }
        }
    }
    None
}

async fn query_cleartext(
    ctx: &LookupContext,
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
) -> Result<SendOutcome, LookupError> {
    if ctx.servers.is_empty() {
        return Err(LookupError::TryAgain);
    }
    let usable = {
        let mut stats = ctx.stats.lock().unwrap();
        stats.usable_servers(&ctx.params, &ctx.servers, now_secs())
    };

    let mut rejected: Option<SendOutcome> = None;
    let mut saw_parse_error = false;
    for _ in 0..ctx.params.retry_count {
        for server in &usable {
            match attempt_server(ctx, server, name, qclass, qtype).await {
                Attempt::Answer(outcome) => return Ok(outcome),
                Attempt::Rejected(outcome) => rejected = Some(outcome),
                Attempt::ParseError => saw_parse_error = true,
                Attempt::Timeout | Attempt::Error => {}
            }
        }
    }

    // A rejection is still an answer; the caller gets to see the rcode.
    if let Some(outcome) = rejected {
        return Ok(outcome);
    }
    if saw_parse_error {
        return Err(LookupError::NoRecord);
    }
    Err(LookupError::TryAgain)
}

async fn attempt_server(
    ctx: &LookupContext,
    server: &DnsServer,
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
) -> Attempt {
    let timeout = ctx.params.attempt_timeout();
    let mut use_edns = true;
    loop {
        let query =
            match message::build_query(name, qclass, qtype, rand::random::<u16>(), use_edns) {
                Ok(query) => query,
                Err(_) => return Attempt::Error,
            };

        let start = Instant::now();
        let response = match udp::exchange(server.addr, &query, timeout).await {
            Ok(response) => response,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                record(ctx, server, AnswerCode::Timeout, elapsed_ms(start));
                return Attempt::Timeout;
            }
            Err(e) => {
                debug!("udp exchange with {} failed: {}", server, e);
                record(ctx, server, AnswerCode::InternalError, elapsed_ms(start));
                return Attempt::Error;
            }
        };
        let rtt_ms = elapsed_ms(start);

        let summary = match message::summarize_response(&response) {
            Ok(summary) => summary,
            Err(e) => {
                debug!("unparseable response from {}: {}", server, e);
                record(ctx, server, AnswerCode::InternalError, rtt_ms);
                return Attempt::ParseError;
            }
        };

        // Truncated: same question, same server, over a stream.
        if summary.truncated {
            let start = Instant::now();
            return match tcp::exchange(server.addr, &query, timeout).await {
                Ok(tcp_response) => {
                    let rtt_ms = elapsed_ms(start);
                    match message::summarize_response(&tcp_response) {
                        Ok(summary) => classify(ctx, server, summary, tcp_response, rtt_ms),
                        Err(_) => {
                            record(ctx, server, AnswerCode::InternalError, rtt_ms);
                            Attempt::ParseError
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    record(ctx, server, AnswerCode::Timeout, elapsed_ms(start));
                    Attempt::Timeout
                }
                Err(e) => {
                    debug!("tcp fallback to {} failed: {}", server, e);
                    record(ctx, server, AnswerCode::InternalError, elapsed_ms(start));
                    Attempt::Error
                }
            };
        }

        // FORMERR with EDNS: some servers choke on the OPT record. Retry
        // once without it before giving up on this server.
        if summary.rcode == RCODE_FORMERR && use_edns {
            record(ctx, server, AnswerCode::Rcode(RCODE_FORMERR), rtt_ms);
            use_edns = false;
            continue;
        }

        return classify(ctx, server, summary, response, rtt_ms);
    }
}

fn classify(
    ctx: &LookupContext,
    server: &DnsServer,
    summary: ResponseSummary,
    bytes: Vec<u8>,
    rtt_ms: u32,
) -> Attempt {
    record(ctx, server, AnswerCode::Rcode(summary.rcode), rtt_ms);
    let outcome = SendOutcome {
        cacheable: cacheable_rcode(summary.rcode),
        server: server.clone(),
        bytes,
    };
    match summary.rcode {
        RCODE_SERVFAIL | RCODE_NOTIMP | RCODE_REFUSED | RCODE_FORMERR => Attempt::Rejected(outcome),
        _ => Attempt::Answer(outcome),
    }
}

fn cacheable_rcode(rcode: u16) -> bool {
    rcode == RCODE_NOERROR || rcode == RCODE_NXDOMAIN || rcode == RCODE_NOTAUTH
}

fn record(ctx: &LookupContext, server: &DnsServer, code: AnswerCode, rtt_ms: u32) {
    let mut stats = ctx.stats.lock().unwrap();
    stats.record(
        ctx.revision,
        server,
        Sample::new(code, rtt_ms),
        ctx.params.max_samples,
    );
}

fn elapsed_ms(start: Instant) -> u32 {
    start.elapsed().as_millis().min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dot::socket::{FakeBehavior, FakeSpec, SocketFactory};
    use crate::telemetry::LogSink;
    use hickory_proto::op::{Message, MessageType, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{RData, Record};
    use std::net::SocketAddr;
    use std::str::FromStr;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    enum ResponderMode {
        Answer,
        FormErrIfEdns,
        Truncated,
    }

    fn answer_message(query: &[u8]) -> Message {
        let mut message = Message::from_vec(query).unwrap();
        message.set_message_type(MessageType::Response);
        let name = message.queries()[0].name().clone();
        message.add_answer(Record::from_rdata(
            name,
            300,
            RData::A(A::new(192, 0, 2, 99)),
        ));
        message
    }

    async fn spawn_udp_responder(
        socket: UdpSocket,
        mode: ResponderMode,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let addr = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let query = &buf[..n];
                let response = match mode {
                    ResponderMode::Answer => answer_message(query).to_vec().unwrap(),
                    ResponderMode::FormErrIfEdns => {
                        let mut message = Message::from_vec(query).unwrap();
                        if message.extensions().is_some() {
                            message.set_message_type(MessageType::Response);
                            message.set_response_code(ResponseCode::FormErr);
                            message.to_vec().unwrap()
                        } else {
                            answer_message(query).to_vec().unwrap()
                        }
                    }
                    ResponderMode::Truncated => {
                        let mut message = Message::from_vec(query).unwrap();
                        message.set_message_type(MessageType::Response);
                        message.set_truncated(true);
                        message.to_vec().unwrap()
                    }
                };
                let _ = socket.send_to(&response, peer).await;
            }
        });
        (addr, queries)
    }

    async fn udp_responder(mode: ResponderMode) -> (SocketAddr, Arc<AtomicUsize>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        spawn_udp_responder(socket, mode).await
    }

    fn spawn_tcp_responder(listener: tokio::net::TcpListener) -> Arc<AtomicUsize> {
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut len_buf = [0u8; 2];
                if stream.read_exact(&mut len_buf).await.is_err() {
                    continue;
                }
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut query = vec![0u8; len];
                if stream.read_exact(&mut query).await.is_err() {
                    continue;
                }
                let response = answer_message(&query).to_vec().unwrap();
                let mut frame = (response.len() as u16).to_be_bytes().to_vec();
                frame.extend_from_slice(&response);
                let _ = stream.write_all(&frame).await;
            }
        });
        queries
    }

    fn make_ctx(servers: Vec<DnsServer>, factory: SocketFactory) -> LookupContext {
        let dispatcher = Arc::new(DnsTlsDispatcher::new(factory));
        let private_dns = PrivateDnsConfiguration::new(dispatcher.clone());
        let mut stats = ServerStats::default();
        stats.reset_servers(&servers, 1);
        let mut params = ResolverParams::default();
        params.base_timeout_ms = 500;
        params.retry_count = 1;
        LookupContext {
            net_id: 30,
            mark: 30,
            cache: ResponseCache::new(64),
            stats: Arc::new(Mutex::new(stats)),
            params,
            servers,
            revision: 1,
            private_dns,
            dispatcher,
            telemetry: Arc::new(LogSink),
            pending_timeouts: Arc::new(AtomicU64::new(0)),
        }
    }

    fn qname() -> Name {
        Name::from_str("www.example.com.").unwrap()
    }

    #[tokio::test]
    async fn test_lookup_answers_and_caches() {
        let (addr, queries) = udp_responder(ResponderMode::Answer).await;
        let ctx = make_ctx(vec![DnsServer::udp(addr)], SocketFactory::new());

        let bytes = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        let summary = message::summarize_response(&bytes).unwrap();
        assert_eq!(summary.rcode, RCODE_NOERROR);
        assert_eq!(summary.answer_count, 1);

        // Second lookup is served from the cache.
        let again = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(again, bytes);
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        // A success sample was recorded for the server.
        let agg = ctx
            .stats
            .lock()
            .unwrap()
            .aggregate(&ctx.servers[0])
            .unwrap();
        assert_eq!(agg.successes, 1);
    }

    #[tokio::test]
    async fn test_formerr_retries_without_edns() {
        let (addr, queries) = udp_responder(ResponderMode::FormErrIfEdns).await;
        let ctx = make_ctx(vec![DnsServer::udp(addr)], SocketFactory::new());

        let bytes = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        let summary = message::summarize_response(&bytes).unwrap();
        assert_eq!(summary.rcode, RCODE_NOERROR);
        assert_eq!(summary.answer_count, 1);
        // One EDNS attempt that drew FORMERR, one bare retry.
        assert_eq!(queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_truncation_falls_back_to_tcp() {
        // The TCP fallback reuses the server's address, so the responders
        // must share a port. Bind UDP first, then TCP on the same port,
        // retrying with fresh ephemeral ports on collision.
        let (udp_socket, tcp_listener) = loop {
            let udp_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let addr = udp_socket.local_addr().unwrap();
            if let Ok(listener) = tokio::net::TcpListener::bind(addr).await {
                break (udp_socket, listener);
            }
        };
        let (addr, _udp_queries) = spawn_udp_responder(udp_socket, ResponderMode::Truncated).await;
        let tcp_queries = spawn_tcp_responder(tcp_listener);

        let ctx = make_ctx(vec![DnsServer::udp(addr)], SocketFactory::new());
        let bytes = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        let summary = message::summarize_response(&bytes).unwrap();
        assert!(!summary.truncated);
        assert_eq!(summary.answer_count, 1);
        assert_eq!(tcp_queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeouts_mean_try_again() {
        // A socket that never answers.
        let blackhole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = blackhole.local_addr().unwrap();
        let mut ctx = make_ctx(vec![DnsServer::udp(addr)], SocketFactory::new());
        ctx.params.base_timeout_ms = 100;

        let err = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap_err();
        assert_eq!(err, LookupError::TryAgain);

        let agg = ctx
            .stats
            .lock()
            .unwrap()
            .aggregate(&ctx.servers[0])
            .unwrap();
        assert!(agg.timeouts >= 1);
        drop(blackhole);
    }

    #[tokio::test]
    async fn test_strict_mode_never_touches_cleartext() {
        let (addr, queries) = udp_responder(ResponderMode::Answer).await;
        let ctx = make_ctx(
            vec![DnsServer::udp(addr)],
            SocketFactory::faked(FakeSpec::new(FakeBehavior::FailHandshake)),
        );
        ctx.private_dns
            .set(
                ctx.net_id,
                ctx.mark,
                &["127.0.2.2".to_string()],
                "dns.example.com",
                &[],
            )
            .unwrap();
        ctx.private_dns.join_validations().await;

        // Validation failed, strict mode: the lookup must fail rather than
        // fall back to cleartext.
        let err = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap_err();
        assert_eq!(err, LookupError::TryAgain);
        assert_eq!(queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_opportunistic_failure_falls_back_to_cleartext() {
        let (addr, queries) = udp_responder(ResponderMode::Answer).await;
        let ctx = make_ctx(
            vec![DnsServer::udp(addr)],
            SocketFactory::faked(FakeSpec::new(FakeBehavior::FailHandshake)),
        );
        ctx.private_dns
            .set(ctx.net_id, ctx.mark, &["127.0.2.2".to_string()], "", &[])
            .unwrap();
        ctx.private_dns.join_validations().await;

        let bytes = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(
            message::summarize_response(&bytes).unwrap().rcode,
            RCODE_NOERROR
        );
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validated_dot_server_carries_the_lookup() {
        let (addr, queries) = udp_responder(ResponderMode::Answer).await;
        let ctx = make_ctx(
            vec![DnsServer::udp(addr)],
            SocketFactory::faked(FakeSpec::new(FakeBehavior::Echo)),
        );
        ctx.private_dns
            .set(ctx.net_id, ctx.mark, &["127.0.2.2".to_string()], "", &[])
            .unwrap();
        ctx.private_dns.join_validations().await;
        assert_eq!(ctx.private_dns.usable_dot_servers(ctx.net_id).1.len(), 1);

        // The echo server reflects the query, which parses as a NOERROR
        // message; that is all the pipeline needs here.
        let bytes = resolve(&ctx, &qname(), DNSClass::IN, RecordType::A)
            .await
            .unwrap();
        assert_eq!(
            message::summarize_response(&bytes).unwrap().rcode,
            RCODE_NOERROR
        );
        // Cleartext was never consulted.
        assert_eq!(queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_coalesce_onto_one_upstream_query() {
        let (addr, queries) = udp_responder(ResponderMode::Answer).await;
        let ctx = Arc::new(make_ctx(vec![DnsServer::udp(addr)], SocketFactory::new()));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                resolve(&ctx, &qname(), DNSClass::IN, RecordType::A).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }
}
