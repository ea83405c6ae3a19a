//! Kernel packet source and verdict sink.
//!
//! Two backends deliver queued packets and accept verdicts: the legacy
//! ip_queue netlink socket and NFQUEUE. Both owe the kernel exactly one
//! verdict per delivered packet, in delivery order; the queue stalls
//! otherwise.

use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::packet::{PacketDescriptor, Verdict};
use crate::settings::{Backend, Settings};

pub mod ipq;
pub mod nfq;

pub use self::ipq::IpqSocket;
pub use self::nfq::NfqQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("kernel queue open failed: {0}")]
    Open(io::Error),
    #[error("copy-packet mode request failed: {0}")]
    Mode(io::Error),
    #[error("kernel queue receive failed: {0}")]
    Recv(io::Error),
    #[error("verdict send failed: {0}")]
    VerdictSend(io::Error),
}

/// Backend chosen at startup.
pub enum KernelQueue {
    Ipq(Arc<IpqSocket>),
    Nfq(NfqQueue),
}

impl KernelQueue {
    pub fn open(settings: &Settings) -> Result<Self, QueueError> {
        match settings.backend {
            Backend::Ipq => Ok(Self::Ipq(Arc::new(IpqSocket::open()?))),
            Backend::Nfqueue => Ok(Self::Nfq(NfqQueue::open(settings.queue_num)?)),
        }
    }

    /// Pull the next queued packet. `Ok(None)` when the queue is drained.
    pub fn read_packet(&mut self) -> Result<Option<PacketDescriptor>, QueueError> {
        match self {
            Self::Ipq(sock) => sock.read_packet(),
            Self::Nfq(queue) => queue.read_packet(),
        }
    }

    pub fn send_verdict(&mut self, packet_id: u64, verdict: Verdict) -> Result<(), QueueError> {
        match self {
            Self::Ipq(sock) => sock.send_verdict(packet_id, verdict),
            Self::Nfq(queue) => queue.send_verdict(verdict),
        }
    }

    /// Abandon the packet read last without a verdict (short-payload path).
    pub fn discard(&mut self) {
        if let Self::Nfq(queue) = self {
            queue.discard();
        }
    }

    /// The shareable netlink socket, present on the ipq backend. The
    /// threaded verdict dispatcher sends through a clone of this handle.
    pub fn ipq(&self) -> Option<&Arc<IpqSocket>> {
        match self {
            Self::Ipq(sock) => Some(sock),
            Self::Nfq(_) => None,
        }
    }
}
