//! Client → upstream routing table.
//!
//! Maps the replayed flow's `(client_ip, client_port)` identity to the
//! replay client's control connection, so that each intercepted response can
//! be returned to the process that originated the corresponding inbound
//! traffic. Entries age out after `timeout` seconds of inactivity.
//!
//! The table holds the upstream sockets as weak integer fds; the event loop
//! owns the sockets. A fingerprint racing a `CLIENT_DEL` or a connection
//! close may therefore hit a dead fd, so the send is warn-and-drop.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering::Relaxed};
use std::sync::Mutex;

use crate::combine::CombineBuffers;
use crate::packet::ResponseHeader;
use crate::stats;

struct RouteEntry {
    fd: RawFd,
    last_access: u64,
}

pub struct Router {
    entries: Mutex<HashMap<(Ipv4Addr, u16), RouteEntry>>,
    /// Idle seconds after which an entry is obsolete.
    timeout: u64,
    /// Single replay-client deployment: lookups bypassed, `default_fd` used.
    single: bool,
    /// The one control connection in single mode; -1 while unset.
    default_fd: AtomicI32,
    /// Present in combined mode; fingerprints are buffered instead of
    /// written straight to the upstream socket.
    combine: Option<CombineBuffers>,
}

impl Router {
    pub fn new(hash_size: usize, timeout: u64, single: bool, combined: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_capacity(hash_size)),
            timeout,
            single,
            default_fd: AtomicI32::new(-1),
            combine: combined.then(CombineBuffers::new),
        }
    }

    /// Record the single-mode replay client. A second client replaces the
    /// first; distributed replay is not supported in this mode.
    pub fn set_default_fd(&self, fd: RawFd) {
        let prev = self.default_fd.swap(fd, Relaxed);
        if prev >= 0 {
            tracing::warn!(
                "replay client fd:{fd} replaces fd:{prev}; single mode supports one client"
            );
        }
    }

    pub fn add(&self, client_ip: Ipv4Addr, client_port: u16, fd: RawFd) {
        let entry = RouteEntry {
            fd,
            last_access: stats::now_secs(),
        };
        self.entries
            .lock()
            .unwrap()
            .insert((client_ip, client_port), entry);
    }

    /// Missing keys are a no-op: a `CLIENT_DEL` may race the TTL sweep.
    pub fn del(&self, client_ip: Ipv4Addr, client_port: u16) {
        self.entries.lock().unwrap().remove(&(client_ip, client_port));
    }

    /// Hot path: deliver an intercepted response's fingerprint to the
    /// replay client that owns the flow. Silent no-op when no entry matches
    /// (expected for concurrent teardown races).
    pub fn update(&self, header: &ResponseHeader) {
        let fd = if self.single {
            let fd = self.default_fd.load(Relaxed);
            if fd < 0 {
                tracing::debug!("no replay client connected yet");
                return;
            }
            fd
        } else {
            let Some(port) = header.dst_port() else {
                tracing::debug!("response header too short for a routing key");
                return;
            };
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&(header.daddr(), port)) {
                Some(entry) => {
                    entry.last_access = stats::now_secs();
                    entry.fd
                }
                None => return,
            }
        };

        match &self.combine {
            Some(bufs) => bufs.push(fd, header.ip_header()),
            None => {
                if let Err(e) = send_to_fd(fd, header.ip_header()) {
                    tracing::warn!("upstream notify on fd:{fd} failed: {e}");
                }
            }
        }
    }

    /// Drop entries idle for longer than the timeout. Runs on the
    /// maintenance timer.
    pub fn delete_obsolete(&self, now: u64) {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.last_access) <= self.timeout);
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!("swept {removed} obsolete routing entries");
        }
    }

    /// Remove every entry bound to a closed control connection.
    pub fn purge_fd(&self, fd: RawFd) {
        self.entries.lock().unwrap().retain(|_, entry| entry.fd != fd);
        if self.single {
            let _ = self.default_fd.compare_exchange(fd, -1, Relaxed, Relaxed);
        }
        if let Some(bufs) = &self.combine {
            bufs.forget(fd);
        }
    }

    /// Flush combined-mode buffers. No-op outside combined mode.
    pub fn flush_buffered(&self) {
        if let Some(bufs) = &self.combine {
            bufs.flush_all();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write to an upstream socket held only as a raw fd. `MSG_NOSIGNAL` keeps a
/// dead peer from killing the process with SIGPIPE.
pub(crate) fn send_to_fd(fd: RawFd, bytes: &[u8]) -> io::Result<()> {
    let rc = unsafe {
        libc::send(
            fd,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::response_packet;
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    fn header_for(ip: Ipv4Addr, port: u16) -> ResponseHeader {
        ResponseHeader::capture(&response_packet(ip, port)).unwrap()
    }

    #[test]
    fn test_update_writes_header_to_registered_client() {
        let router = Router::new(64, 30, false, false);
        let (up, mut peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());

        router.update(&header_for(CLIENT, 54321));

        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 20];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &response_packet(CLIENT, 54321)[..20]);
    }

    #[test]
    fn test_readd_replaces_the_upstream() {
        let router = Router::new(64, 30, false, false);
        let (up1, mut peer1) = UnixStream::pair().unwrap();
        let (up2, mut peer2) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up1.as_raw_fd());
        router.add(CLIENT, 54321, up2.as_raw_fd());
        assert_eq!(router.len(), 1);

        router.update(&header_for(CLIENT, 54321));

        peer2.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 20];
        peer2.read_exact(&mut buf).unwrap();

        // The first upstream saw nothing.
        peer1
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(peer1.read(&mut probe).is_err());
    }

    #[test]
    fn test_del_is_idempotent_and_silences_update() {
        let router = Router::new(64, 30, false, false);
        let (up, mut peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());
        router.del(CLIENT, 54321);
        router.del(CLIENT, 54321);
        assert!(router.is_empty());

        router.update(&header_for(CLIENT, 54321));
        peer.set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(peer.read(&mut probe).is_err());
    }

    #[test]
    fn test_obsolete_entries_are_swept() {
        let router = Router::new(64, 30, false, false);
        let (up, _peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());
        let now = stats::now_secs();

        // Exactly at the timeout the entry survives; one second past it goes.
        router.delete_obsolete(now + 30);
        assert_eq!(router.len(), 1);
        router.delete_obsolete(now + 31);
        assert!(router.is_empty());
    }

    #[test]
    fn test_purge_fd_drops_all_entries_for_a_connection() {
        let router = Router::new(64, 30, false, false);
        let (up, _peer) = UnixStream::pair().unwrap();
        let (other, _other_peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 1000, up.as_raw_fd());
        router.add(CLIENT, 1001, up.as_raw_fd());
        router.add(CLIENT, 2000, other.as_raw_fd());

        router.purge_fd(up.as_raw_fd());
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_single_mode_bypasses_the_table() {
        let router = Router::new(64, 30, true, false);
        let (up, mut peer) = UnixStream::pair().unwrap();

        // Nothing registered yet: update is a no-op.
        router.update(&header_for(CLIENT, 54321));

        router.set_default_fd(up.as_raw_fd());
        router.update(&header_for(CLIENT, 54321));
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buf = [0u8; 20];
        peer.read_exact(&mut buf).unwrap();
        assert!(router.is_empty());
    }

    #[test]
    fn test_combined_update_buffers_until_flush() {
        let router = Router::new(64, 30, false, true);
        let (up, mut peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());

        router.update(&header_for(CLIENT, 54321));

        // Combined mode holds the fingerprint until the flush timer fires.
        peer.set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(peer.read(&mut probe).is_err());

        router.flush_buffered();
        peer.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut framed = [0u8; 2 + 20];
        peer.read_exact(&mut framed).unwrap();
        assert_eq!(&framed[..2], &20u16.to_be_bytes());
        assert_eq!(&framed[2..], &response_packet(CLIENT, 54321)[..20]);
    }

    #[test]
    fn test_combined_purge_discards_pending_frames() {
        let router = Router::new(64, 30, false, true);
        let (up, mut peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());

        router.update(&header_for(CLIENT, 54321));
        router.purge_fd(up.as_raw_fd());
        router.flush_buffered();

        assert!(router.is_empty());
        peer.set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut probe = [0u8; 1];
        assert!(peer.read(&mut probe).is_err());
    }

    #[test]
    fn test_dead_peer_send_is_dropped() {
        let router = Router::new(64, 30, false, false);
        let (up, peer) = UnixStream::pair().unwrap();
        router.add(CLIENT, 54321, up.as_raw_fd());
        drop(peer);

        // EPIPE on the send path must be swallowed, not raised.
        router.update(&header_for(CLIENT, 54321));
        router.update(&header_for(CLIENT, 54321));
        assert_eq!(router.len(), 1);
    }
}
