//! Per-packet verdict pipeline.
//!
//! Every queued response packet gets classified against the whitelist:
//! whitelisted destinations pass through the firewall, everything else is a
//! replayed response that must be suppressed and fingerprinted upstream.
//! The step performs no I/O itself: it returns the verdict plus the header
//! to forward, and the server emits both in forward-then-verdict order.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

use crate::packet::{self, PacketError, ResponseHeader, Verdict, MIN_PACKET_LEN};
use crate::stats::InterceptStats;
use crate::whitelist::Whitelist;

/// Result of classifying one packet.
#[derive(Debug)]
pub struct Outcome {
    pub verdict: Verdict,
    /// Set on the drop path: the fingerprint owed to the replay client.
    pub forward: Option<ResponseHeader>,
}

pub struct Classifier {
    whitelist: Whitelist,
    stats: Arc<InterceptStats>,
}

impl Classifier {
    pub fn new(whitelist: Whitelist, stats: Arc<InterceptStats>) -> Self {
        Self { whitelist, stats }
    }

    /// Classify one payload. Short payloads are an error and get no verdict
    /// at all; the kernel times them out.
    pub fn classify(&self, payload: &[u8]) -> Result<Outcome, PacketError> {
        if payload.len() < MIN_PACKET_LEN {
            return Err(PacketError::ShortPayload(payload.len()));
        }

        let pass_through = self.whitelist.contains(packet::daddr_of(payload));
        self.stats.tot_resp_packs.fetch_add(1, Relaxed);

        if pass_through {
            return Ok(Outcome {
                verdict: Verdict::Accept,
                forward: None,
            });
        }

        self.stats.tot_copy_resp_packs.fetch_add(1, Relaxed);
        let header = ResponseHeader::capture(payload)?;
        Ok(Outcome {
            verdict: Verdict::Drop,
            forward: Some(header),
        })
    }
}
