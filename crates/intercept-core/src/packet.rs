//! Wire-level packet views.
//!
//! The classifier never parses TCP payloads: it reads the IPv4 destination
//! address (payload bytes 16..20, network order) to decide the verdict, and
//! the router additionally reads the TCP destination port behind the IP
//! header to find the replayed client's entry. Both reads operate on raw
//! bytes; the IP version field is not verified, matching the queue contract
//! that only IPv4 traffic is diverted here.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Minimum classifiable payload: 20-byte IPv4 header + 20-byte TCP header.
pub const MIN_PACKET_LEN: usize = 40;

/// Bytes kept in a [`ResponseHeader`] snapshot: the maximal IPv4 header
/// (15 words = 60 bytes) plus the TCP destination-port field behind it.
pub const HEADER_SNAP_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum PacketError {
    /// Payload too short to carry IP + TCP headers. No verdict is emitted
    /// for such packets; the kernel times them out.
    #[error("payload len wrong: {0}")]
    ShortPayload(usize),
}

/// ACCEPT/DROP decision returned to the kernel for a queued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

impl Verdict {
    /// The netfilter wire value (`NF_ACCEPT` = 1, `NF_DROP` = 0).
    pub fn nf_value(self) -> u32 {
        match self {
            Verdict::Accept => 1,
            Verdict::Drop => 0,
        }
    }
}

/// One packet pulled from the kernel queue. Ephemeral: it exists between a
/// queue read and the corresponding verdict.
#[derive(Debug)]
pub struct PacketDescriptor {
    /// Per-queue packet id the verdict must echo. 0 when the backend does
    /// not expose it.
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Bounded copy of the leading header bytes of an intercepted response.
///
/// Owning a small fixed buffer lets the snapshot outlive the packet buffer,
/// which is required when it travels through the staging ring to the
/// forwarder thread.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    buf: [u8; HEADER_SNAP_LEN],
    len: usize,
}

impl ResponseHeader {
    pub fn capture(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() < MIN_PACKET_LEN {
            return Err(PacketError::ShortPayload(payload.len()));
        }
        let len = payload.len().min(HEADER_SNAP_LEN);
        let mut buf = [0u8; HEADER_SNAP_LEN];
        buf[..len].copy_from_slice(&payload[..len]);
        Ok(Self { buf, len })
    }

    /// IPv4 destination address: the replayed client's address on a
    /// response packet.
    pub fn daddr(&self) -> Ipv4Addr {
        daddr_of(&self.buf)
    }

    fn ihl_bytes(&self) -> usize {
        (self.buf[0] & 0x0f) as usize * 4
    }

    /// TCP destination port, i.e. the replayed client's port. `None` when the
    /// IP header length field points past the captured bytes.
    pub fn dst_port(&self) -> Option<u16> {
        let off = self.ihl_bytes();
        if off < 20 || off + 4 > self.len {
            return None;
        }
        Some(u16::from_be_bytes([self.buf[off + 2], self.buf[off + 3]]))
    }

    /// The raw IP header bytes forwarded upstream (`ihl × 4`, 20 for a
    /// standard header). A nonsense length field degrades to 20 bytes.
    pub fn ip_header(&self) -> &[u8] {
        let ihl = self.ihl_bytes();
        let n = if ihl < 20 { 20 } else { ihl.min(self.len) };
        &self.buf[..n]
    }
}

/// Destination address of a raw IPv4 packet. Callers must have length-checked
/// the payload.
pub fn daddr_of(payload: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(payload[16], payload[17], payload[18], payload[19])
}
