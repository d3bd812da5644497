//! DNS-over-TLS transport stack.
//!
//! Layering, resolver side down: [`dispatcher::DnsTlsDispatcher`] keys
//! reference-counted [`transport::DnsTlsTransport`]s by (socket mark,
//! server); each transport multiplexes pipelined queries over one TLS
//! connection through [`query_map::DnsTlsQueryMap`] (16-bit id space) and a
//! [`socket`] I/O task, reconnecting and replaying on connection loss.
//! Session resumption flows through [`session_cache::DnsTlsSessionCache`].

pub mod dispatcher;
pub mod query_map;
pub mod session_cache;
pub mod socket;
pub mod transport;

/// Result codes of the DoT stack, distinct from wire RCODEs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DotResponseCode {
    Success,
    /// No usable connection, or retries exhausted.
    NetworkError,
    /// Caller-supplied answer buffer too small for the response.
    LimitError,
    /// Transaction-id space exhausted or malformed input.
    InternalError,
    /// Query cancelled by transport teardown.
    ServerError,
}

/// Outcome of one DoT query. `response` is non-empty only on success.
#[derive(Debug, Clone)]
pub struct DotResult {
    pub code: DotResponseCode,
    pub response: Vec<u8>,
}

impl DotResult {
    pub fn error(code: DotResponseCode) -> Self {
        DotResult {
            code,
            response: Vec::new(),
        }
    }
}
