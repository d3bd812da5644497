//! Cleartext upstream exchanges: datagram first, stream on truncation.

pub mod tcp;
pub mod udp;

/// Largest response accepted from an upstream, cleartext or DoT.
pub const MAX_PACKET: usize = 8 * 1024;
