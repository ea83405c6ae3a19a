//! NFQUEUE backend.
//!
//! One queue bound to the configured queue number, read non-blocking. The
//! crate hands packets out as messages that carry their own kernel id, so
//! verdicts go back by returning the message; at most one message is
//! undecided at a time, which keeps verdicts in delivery order. This
//! backend does not support the threaded staging path.

use std::io;

use crate::packet::{PacketDescriptor, Verdict};

use super::QueueError;

pub struct NfqQueue {
    queue: nfq::Queue,
    queue_num: u16,
    /// The message read last, awaiting its verdict.
    pending: Option<nfq::Message>,
}

impl NfqQueue {
    pub fn open(queue_num: u16) -> Result<Self, QueueError> {
        let mut queue = nfq::Queue::open().map_err(QueueError::Open)?;
        queue.bind(queue_num).map_err(QueueError::Open)?;
        queue.set_nonblocking(true);
        Ok(Self {
            queue,
            queue_num,
            pending: None,
        })
    }

    /// Pull the next queued packet. The previous packet must have been
    /// verdicted or discarded first.
    pub fn read_packet(&mut self) -> Result<Option<PacketDescriptor>, QueueError> {
        debug_assert!(self.pending.is_none(), "verdict owed for previous packet");
        match self.queue.recv() {
            Ok(msg) => {
                let payload = msg.get_payload().to_vec();
                self.pending = Some(msg);
                // The crate tracks the kernel packet id inside the message.
                Ok(Some(PacketDescriptor { id: 0, payload }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(QueueError::Recv(e)),
        }
    }

    pub fn send_verdict(&mut self, verdict: Verdict) -> Result<(), QueueError> {
        let Some(mut msg) = self.pending.take() else {
            return Ok(());
        };
        msg.set_verdict(match verdict {
            Verdict::Accept => nfq::Verdict::Accept,
            Verdict::Drop => nfq::Verdict::Drop,
        });
        self.queue.verdict(msg).map_err(QueueError::VerdictSend)
    }

    /// Abandon the pending packet without a verdict; the kernel times it
    /// out.
    pub fn discard(&mut self) {
        self.pending = None;
    }
}

impl Drop for NfqQueue {
    fn drop(&mut self) {
        tracing::info!("unbinding from nfqueue {}", self.queue_num);
        if let Err(e) = self.queue.unbind(self.queue_num) {
            tracing::warn!("nfqueue unbind failed: {e}");
        }
    }
}
