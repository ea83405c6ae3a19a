//! Legacy ip_queue netlink backend.
//!
//! A single `AF_NETLINK`/`NETLINK_FIREWALL` socket carries packet
//! notifications from the kernel and verdict messages back. On open, an
//! `IPQM_MODE` request asks the kernel to copy full packets up to user
//! space; without it nothing is ever delivered.
//!
//! The queue protocol expects one `IPQM_VERDICT` for every `IPQM_PACKET`
//! before the next packet is handed up, so callers must emit verdicts in
//! delivery order.

use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering::Relaxed};

use crate::packet::{PacketDescriptor, Verdict};

use super::QueueError;

const NETLINK_FIREWALL: libc::c_int = 3;

const NLMSG_ERROR: u16 = 0x2;
const NLM_F_REQUEST: u16 = 0x1;

const IPQM_BASE: u16 = 0x10;
const IPQM_MODE: u16 = IPQM_BASE + 1;
const IPQM_VERDICT: u16 = IPQM_BASE + 2;
const IPQM_PACKET: u16 = IPQM_BASE + 3;

/// `IPQ_COPY_PACKET`: metadata plus payload.
const COPY_PACKET: u8 = 2;
/// Payload bytes requested per packet.
const COPY_RANGE: usize = 65_535;

/// Netlink receive buffer; ip_queue bursts hard under replay load.
const RECV_BUF: usize = 4 * 1024 * 1024;

// Kernel ip_queue wire structs. `nlmsghdr` is 16 bytes and 4-aligned, the
// ipq payloads are 8-aligned, so each frame struct lays out exactly as
// NLMSG_LENGTH computes it. Fields mirror the kernel layout whether or not
// this side reads them.

#[repr(C)]
#[allow(dead_code)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct SockaddrNl {
    nl_family: libc::sa_family_t,
    nl_pad: libc::c_ushort,
    nl_pid: u32,
    nl_groups: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct IpqModeMsg {
    value: u8,
    range: libc::size_t,
}

#[repr(C)]
#[allow(dead_code)]
struct IpqVerdictMsg {
    value: libc::c_uint,
    id: libc::c_ulong,
}

#[repr(C)]
#[allow(dead_code)]
struct IpqPacketMsg {
    packet_id: libc::c_ulong,
    mark: libc::c_ulong,
    timestamp_sec: libc::c_long,
    timestamp_usec: libc::c_long,
    hook: libc::c_uint,
    indev_name: [libc::c_char; 16],
    outdev_name: [libc::c_char; 16],
    hw_protocol: u16,
    hw_type: libc::c_ushort,
    hw_addrlen: u8,
    hw_addr: [u8; 8],
    data_len: libc::size_t,
    // payload follows
}

#[repr(C)]
struct ModeFrame {
    hdr: NlMsgHdr,
    msg: IpqModeMsg,
}

#[repr(C)]
struct VerdictFrame {
    hdr: NlMsgHdr,
    msg: IpqVerdictMsg,
}

pub struct IpqSocket {
    fd: OwnedFd,
    pid: u32,
    /// Monotonic netlink sequence, starting at 1.
    seq: AtomicU32,
}

impl IpqSocket {
    pub fn open() -> Result<Self, QueueError> {
        let raw = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_FIREWALL) };
        if raw < 0 {
            return Err(QueueError::Open(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        set_nonblocking(raw).map_err(QueueError::Open)?;
        enlarge_recv_buffer(raw);

        let sock = Self {
            fd,
            pid: std::process::id(),
            seq: AtomicU32::new(1),
        };
        sock.send_mode_request()?;
        Ok(sock)
    }

    /// Ask the kernel to start copying queued packets to this socket.
    fn send_mode_request(&self) -> Result<(), QueueError> {
        let frame = ModeFrame {
            hdr: self.header(IPQM_MODE, size_of::<ModeFrame>()),
            msg: IpqModeMsg {
                value: COPY_PACKET,
                range: COPY_RANGE,
            },
        };
        self.send_frame(&frame, size_of::<ModeFrame>())
            .map_err(QueueError::Mode)
    }

    /// Pull one queued packet. `Ok(None)` when the socket is drained or the
    /// message was not a packet notification.
    pub fn read_packet(&self) -> Result<Option<PacketDescriptor>, QueueError> {
        let mut buf = vec![0u8; COPY_RANGE];
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(QueueError::Recv(err));
        }
        let n = n as usize;
        if n < size_of::<NlMsgHdr>() {
            tracing::warn!("truncated netlink message ({n} bytes)");
            return Ok(None);
        }

        let hdr = unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const NlMsgHdr) };
        match hdr.nlmsg_type {
            IPQM_PACKET => {}
            NLMSG_ERROR => {
                tracing::warn!("netlink error message from kernel queue");
                return Ok(None);
            }
            other => {
                tracing::debug!("ignoring netlink message type {other:#x}");
                return Ok(None);
            }
        }

        let meta_off = size_of::<NlMsgHdr>();
        let payload_off = meta_off + size_of::<IpqPacketMsg>();
        if n < payload_off {
            tracing::warn!("short ipq packet message ({n} bytes)");
            return Ok(None);
        }
        let meta = unsafe {
            std::ptr::read_unaligned(buf.as_ptr().add(meta_off) as *const IpqPacketMsg)
        };
        let take = (meta.data_len as usize).min(n - payload_off);
        Ok(Some(PacketDescriptor {
            id: meta.packet_id as u64,
            payload: buf[payload_off..payload_off + take].to_vec(),
        }))
    }

    /// Emit one verdict. Safe to call from any thread; the sequence counter
    /// is atomic and `sendto` is a single syscall.
    pub fn send_verdict(&self, packet_id: u64, verdict: Verdict) -> Result<(), QueueError> {
        let frame = VerdictFrame {
            hdr: self.header(IPQM_VERDICT, size_of::<VerdictFrame>()),
            msg: IpqVerdictMsg {
                value: verdict.nf_value() as libc::c_uint,
                id: packet_id as libc::c_ulong,
            },
        };
        self.send_frame(&frame, size_of::<VerdictFrame>())
            .map_err(QueueError::VerdictSend)
    }

    fn header(&self, msg_type: u16, frame_len: usize) -> NlMsgHdr {
        NlMsgHdr {
            nlmsg_len: frame_len as u32,
            nlmsg_type: msg_type,
            nlmsg_flags: NLM_F_REQUEST,
            nlmsg_seq: self.seq.fetch_add(1, Relaxed),
            nlmsg_pid: self.pid,
        }
    }

    fn send_frame<T>(&self, frame: &T, len: usize) -> io::Result<()> {
        let addr = SockaddrNl {
            nl_family: libc::AF_NETLINK as libc::sa_family_t,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: 0,
        };
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame as *const T as *const libc::c_void,
                len,
                0,
                &addr as *const SockaddrNl as *const libc::sockaddr,
                size_of::<SockaddrNl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for IpqSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// SO_RCVBUFFORCE bypasses `net.core.rmem_max` but needs root; fall back to
/// SO_RCVBUF with a warning when unprivileged.
fn enlarge_recv_buffer(fd: RawFd) {
    let val = RECV_BUF as libc::c_int;
    let force_ok = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUFFORCE,
            &val as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    } == 0;
    if !force_ok {
        let ok = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &val as *const _ as *const libc::c_void,
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        } == 0;
        if !ok {
            tracing::warn!(
                "could not enlarge netlink receive buffer to {}KB: {}",
                RECV_BUF / 1024,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layouts_match_the_wire() {
        // nlmsghdr is 16 bytes; the ipq payloads start right behind it.
        assert_eq!(size_of::<NlMsgHdr>(), 16);
        assert_eq!(size_of::<ModeFrame>(), 16 + size_of::<IpqModeMsg>());
        assert_eq!(size_of::<VerdictFrame>(), 16 + size_of::<IpqVerdictMsg>());
        assert_eq!(size_of::<SockaddrNl>(), 12);
    }
}
