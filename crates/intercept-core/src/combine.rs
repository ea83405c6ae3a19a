//! Combined-mode upstream sender.
//!
//! Instead of one `send` per intercepted packet, fingerprints are coalesced
//! per upstream connection and flushed either when a buffer fills up or when
//! the `CHECK_INTERVAL` timer fires. Each fingerprint is framed with a u16
//! network-order length prefix so the replay client can split the batch.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::Mutex;

use crate::router::send_to_fd;

/// Frames buffered per upstream before an immediate flush.
pub const COMBINE_MAX_PENDING: usize = 16;

#[derive(Default)]
struct PendingBuf {
    bytes: Vec<u8>,
    frames: usize,
}

pub struct CombineBuffers {
    bufs: Mutex<HashMap<RawFd, PendingBuf>>,
}

impl CombineBuffers {
    pub fn new() -> Self {
        Self {
            bufs: Mutex::new(HashMap::new()),
        }
    }

    /// Append one fingerprint for `fd`, flushing immediately once the
    /// pending count reaches [`COMBINE_MAX_PENDING`].
    pub fn push(&self, fd: RawFd, header: &[u8]) {
        let mut bufs = self.bufs.lock().unwrap();
        let buf = bufs.entry(fd).or_default();
        buf.bytes.extend_from_slice(&(header.len() as u16).to_be_bytes());
        buf.bytes.extend_from_slice(header);
        buf.frames += 1;
        if buf.frames >= COMBINE_MAX_PENDING {
            flush_one(fd, buf);
        }
    }

    /// Timer-driven flush of every pending buffer.
    pub fn flush_all(&self) {
        let mut bufs = self.bufs.lock().unwrap();
        for (fd, buf) in bufs.iter_mut() {
            if buf.frames > 0 {
                flush_one(*fd, buf);
            }
        }
    }

    /// Drop anything pending for a closed connection.
    pub fn forget(&self, fd: RawFd) {
        self.bufs.lock().unwrap().remove(&fd);
    }

    #[cfg(test)]
    fn pending_frames(&self, fd: RawFd) -> usize {
        self.bufs
            .lock()
            .unwrap()
            .get(&fd)
            .map_or(0, |buf| buf.frames)
    }
}

impl Default for CombineBuffers {
    fn default() -> Self {
        Self::new()
    }
}

/// A batch goes out whole or not at all; a failed send discards its frames.
fn flush_one(fd: RawFd, buf: &mut PendingBuf) {
    if let Err(e) = send_to_fd(fd, &buf.bytes) {
        tracing::warn!("combined flush to fd:{fd} failed, discarding {} frames: {e}", buf.frames);
    }
    buf.bytes.clear();
    buf.frames = 0;
}
