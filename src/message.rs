//! The wire-format boundary.
//!
//! Everything the resolver needs from RFC 1035 message handling goes through
//! this module: building queries (with or without an EDNS0 OPT record),
//! summarising responses, deriving cache keys from the question section, and
//! matching responses back to the query that produced them. Compressed-name
//! handling, including loop detection, is delegated to hickory-proto; a loop
//! or truncated message surfaces here as a parse failure.

use std::net::{IpAddr, Ipv6Addr};

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};

// Wire response codes, as classified by the stats engine.
pub const RCODE_NOERROR: u16 = 0;
pub const RCODE_FORMERR: u16 = 1;
pub const RCODE_SERVFAIL: u16 = 2;
pub const RCODE_NXDOMAIN: u16 = 3;
pub const RCODE_NOTIMP: u16 = 4;
pub const RCODE_REFUSED: u16 = 5;
pub const RCODE_NOTAUTH: u16 = 9;

/// EDNS0 advertised UDP payload size.
const EDNS_PAYLOAD: u16 = 1232;

fn parse_error(e: hickory_proto::error::ProtoError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("parse failure: {}", e))
}

/// Builds a wire query for (name, class, type) with recursion desired and,
/// unless the server already rejected it with FORMERR, an EDNS0 OPT record.
pub fn build_query(
    name: &Name,
    qclass: DNSClass,
    qtype: RecordType,
    id: u16,
    use_edns: bool,
) -> std::io::Result<Vec<u8>> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);

    let mut query = Query::query(name.clone(), qtype);
    query.set_query_class(qclass);
    message.add_query(query);

    if use_edns {
        let edns = message.extensions_mut().get_or_insert_with(Edns::new);
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_version(0);
    }

    message.to_vec().map_err(parse_error)
}

/// The parts of a response the pipeline cares about.
#[derive(Debug, Clone)]
pub struct ResponseSummary {
    pub id: u16,
    pub rcode: u16,
    pub truncated: bool,
    pub answer_count: usize,
    /// Minimum TTL across the answer section; `None` when it is empty.
    pub min_answer_ttl: Option<u32>,
}

pub fn summarize_response(bytes: &[u8]) -> std::io::Result<ResponseSummary> {
    let message = Message::from_vec(bytes).map_err(parse_error)?;
    Ok(ResponseSummary {
        id: message.id(),
        rcode: u16::from(message.response_code()),
        truncated: message.truncated(),
        answer_count: message.answer_count() as usize,
        min_answer_ttl: message.answers().iter().map(|r| r.ttl()).min(),
    })
}

/// Cache key: the question section with labels case-lowered, class and type
/// preserved. Two queries for the same question always collide here no
/// matter how the stub randomised the label case or the transaction id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    pub fn new(name: &Name, qclass: DNSClass, qtype: RecordType) -> Self {
        CacheKey {
            name: name.to_lowercase().to_ascii(),
            qtype: u16::from(qtype),
            qclass: u16::from(qclass),
        }
    }

    /// Derives the key from wire query bytes.
    pub fn from_query(bytes: &[u8]) -> std::io::Result<Self> {
        let message = Message::from_vec(bytes).map_err(parse_error)?;
        let query = message.queries().first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "query without question")
        })?;
        Ok(CacheKey::new(
            query.name(),
            query.query_class(),
            query.query_type(),
        ))
    }

    pub fn qtype(&self) -> u16 {
        self.qtype
    }
}

/// Checks that `response` answers `query`: matching id and matching question
/// section (case-insensitively). Anything else on a UDP socket is a stray or
/// spoofed datagram and must be ignored.
pub fn response_matches(query_bytes: &[u8], response_bytes: &[u8]) -> bool {
    let (Ok(query), Ok(response)) = (
        Message::from_vec(query_bytes),
        Message::from_vec(response_bytes),
    ) else {
        return false;
    };
    if query.id() != response.id() {
        return false;
    }
    match (query.queries().first(), response.queries().first()) {
        (Some(q), Some(r)) => {
            q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
                && q.name().to_lowercase() == r.name().to_lowercase()
        }
        _ => false,
    }
}

/// AAAA addresses in the answer section, for NAT64 prefix discovery.
pub fn aaaa_addrs(bytes: &[u8]) -> std::io::Result<Vec<Ipv6Addr>> {
    let message = Message::from_vec(bytes).map_err(parse_error)?;
    Ok(message
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::AAAA(aaaa)) => Some(aaaa.0),
            _ => None,
        })
        .collect())
}

/// Every address in the answer section, for telemetry.
pub fn answer_ips(bytes: &[u8]) -> Vec<IpAddr> {
    let Ok(message) = Message::from_vec(bytes) else {
        return Vec::new();
    };
    message
        .answers()
        .iter()
        .filter_map(|r| match r.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// The question of a wire query, for feeding a received query into the
/// lookup pipeline.
pub fn question(bytes: &[u8]) -> std::io::Result<(Name, DNSClass, RecordType)> {
    let message = Message::from_vec(bytes).map_err(parse_error)?;
    let query = message.queries().first().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "query without question")
    })?;
    Ok((query.name().clone(), query.query_class(), query.query_type()))
}

/// Reads the transaction id straight off the wire.
pub fn wire_id(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 2 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Overwrites the transaction id in place.
pub fn set_wire_id(bytes: &mut [u8], id: u16) {
    if bytes.len() >= 2 {
        bytes[0..2].copy_from_slice(&id.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn query_bytes(name: &str, id: u16, use_edns: bool) -> Vec<u8> {
        build_query(
            &Name::from_str(name).unwrap(),
            DNSClass::IN,
            RecordType::A,
            id,
            use_edns,
        )
        .unwrap()
    }

    #[test]
    fn test_build_and_reparse() {
        let bytes = query_bytes("www.example.com.", 0x1234, true);
        let message = Message::from_vec(&bytes).unwrap();
        assert_eq!(message.id(), 0x1234);
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert!(message.extensions().is_some());

        let without_opt = query_bytes("www.example.com.", 0x1234, false);
        let message = Message::from_vec(&without_opt).unwrap();
        assert!(message.extensions().is_none());
        assert!(without_opt.len() < bytes.len());
    }

    #[test]
    fn test_wire_id_roundtrip() {
        let mut bytes = query_bytes("example.com.", 999, true);
        assert_eq!(wire_id(&bytes), Some(999));
        set_wire_id(&mut bytes, 3);
        assert_eq!(wire_id(&bytes), Some(3));
        assert_eq!(wire_id(&[0x01]), None);
    }

    #[test]
    fn test_cache_key_is_case_insensitive() {
        let a = CacheKey::from_query(&query_bytes("WWW.Example.COM.", 1, true)).unwrap();
        let b = CacheKey::from_query(&query_bytes("www.example.com.", 2, false)).unwrap();
        assert_eq!(a, b);

        let c = CacheKey::from_query(&query_bytes("www.example.org.", 1, true)).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_cache_key_preserves_type() {
        let a = CacheKey::new(
            &Name::from_str("example.com.").unwrap(),
            DNSClass::IN,
            RecordType::A,
        );
        let aaaa = CacheKey::new(
            &Name::from_str("example.com.").unwrap(),
            DNSClass::IN,
            RecordType::AAAA,
        );
        assert_ne!(a, aaaa);
    }

    #[test]
    fn test_response_matches() {
        let query = query_bytes("example.com.", 77, true);

        let mut response = Message::from_vec(&query).unwrap();
        response.set_message_type(MessageType::Response);
        let response_bytes = response.to_vec().unwrap();
        assert!(response_matches(&query, &response_bytes));

        // Wrong id.
        let mut other = response_bytes.clone();
        set_wire_id(&mut other, 78);
        assert!(!response_matches(&query, &other));

        // Wrong question.
        let other_query = query_bytes("example.org.", 77, true);
        assert!(!response_matches(&query, &other_query));

        // Case-folded question still matches.
        let folded = query_bytes("EXAMPLE.com.", 77, true);
        assert!(response_matches(&query, &folded));
    }

    #[test]
    fn test_compression_loop_is_parse_failure() {
        // A hand-built message whose question name is a pointer to itself.
        let mut bytes = vec![
            0x12, 0x34, // id
            0x81, 0x80, // response flags
            0x00, 0x01, // qdcount
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        bytes.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12 (itself)
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // qtype, qclass
        assert!(summarize_response(&bytes).is_err());
        assert!(CacheKey::from_query(&bytes).is_err());
    }

    #[test]
    fn test_truncated_message_is_parse_failure() {
        let bytes = query_bytes("example.com.", 5, false);
        assert!(summarize_response(&bytes[..bytes.len() - 3]).is_err());
    }
}
