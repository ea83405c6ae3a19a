//! The interception server: control-plane listener, kernel queue dispatch
//! and periodic maintenance on one mio poll loop.
//!
//! Everything runs on the event thread by default. In threaded mode the two
//! blocking syscall sites (netlink verdict sends and upstream forwards) move
//! to worker threads behind the staging rings, and the event thread only
//! produces ring slots.

use anyhow::{bail, Context, Result};
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::classifier::Classifier;
use crate::packet::{PacketDescriptor, ResponseHeader};
use crate::pool::{StagingPool, VerdictSlot};
use crate::queue::KernelQueue;
use crate::router::Router;
use crate::settings::{Backend, Settings, CHECK_INTERVAL, OUTPUT_INTERVAL};
use crate::stats::{self, InterceptStats};
use crate::whitelist::Whitelist;

/// Control message size on the wire: 8 header bytes + 8 reserved.
pub const MSG_CLIENT_SIZE: usize = 16;
/// Register a replayed flow.
pub const CLIENT_ADD: u16 = 1;
/// Deregister a replayed flow.
pub const CLIENT_DEL: u16 = 2;

const LISTENER: Token = Token(0);
const KERNEL: Token = Token(1);
const FIRST_CLIENT_TOKEN: usize = 2;

/// NFQUEUE has no fd in the poll set; cap the poll timeout so the queue is
/// drained at a short tick instead.
const NFQ_TICK: Duration = Duration::from_millis(2);

struct ClientConn {
    stream: TcpStream,
    /// Reassembly buffer: messages are consumed in `MSG_CLIENT_SIZE` units
    /// only; a read may deliver less.
    buf: [u8; MSG_CLIENT_SIZE],
    filled: usize,
}

struct StagingHandles {
    verdicts: Arc<StagingPool<VerdictSlot>>,
    headers: Arc<StagingPool<ResponseHeader>>,
}

pub struct InterceptServer {
    settings: Settings,
    poll: Poll,
    listener: TcpListener,
    queue: KernelQueue,
    clients: HashMap<Token, ClientConn>,
    next_token: usize,
    router: Arc<Router>,
    classifier: Classifier,
    stats: Arc<InterceptStats>,
    staging: Option<StagingHandles>,
    next_stats_at: Instant,
    next_flush_at: Option<Instant>,
}

impl InterceptServer {
    pub fn new(settings: Settings) -> Result<Self> {
        if settings.threaded && settings.backend == Backend::Nfqueue {
            bail!("threaded mode requires the ipq backend");
        }

        let stats = InterceptStats::new();
        let router = Arc::new(Router::new(
            settings.hash_size,
            settings.timeout,
            settings.single,
            settings.combined,
        ));
        let classifier = Classifier::new(
            Whitelist::new(settings.passed_ips.clone()),
            stats.clone(),
        );

        let poll = Poll::new().context("poll create failed")?;

        let mut listener = bind_listener(settings.ip, settings.port)
            .with_context(|| format!("listen on {}:{} failed", settings.ip, settings.port))?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .context("listener register failed")?;
        tracing::info!("control listener on {}:{}", settings.ip, settings.port);

        let queue = KernelQueue::open(&settings).context("kernel queue open failed")?;
        match &queue {
            KernelQueue::Ipq(sock) => {
                let raw = sock.as_raw_fd();
                poll.registry()
                    .register(&mut SourceFd(&raw), KERNEL, Interest::READABLE)
                    .context("netlink register failed")?;
                tracing::info!("firewall socket fd:{raw} (ipq)");
            }
            KernelQueue::Nfq(_) => {
                tracing::info!("nfqueue {} bound", settings.queue_num);
            }
        }

        let staging = if settings.threaded {
            Some(spawn_workers(&settings, &queue, &router)?)
        } else {
            None
        };

        let next_flush_at = settings.combined.then(|| Instant::now() + CHECK_INTERVAL);

        Ok(Self {
            settings,
            poll,
            listener,
            queue,
            clients: HashMap::new(),
            next_token: FIRST_CLIENT_TOKEN,
            router,
            classifier,
            stats,
            staging,
            next_stats_at: Instant::now() + OUTPUT_INTERVAL,
            next_flush_at,
        })
    }

    /// Run the dispatch loop. Never returns under normal operation.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e).context("poll failed");
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_clients(),
                    KERNEL => self.drain_kernel_queue(),
                    token => self.client_readable(token),
                }
            }

            // No poll registration exists for the nfqueue handle; drain it
            // every tick instead.
            if matches!(self.queue, KernelQueue::Nfq(_)) {
                self.drain_kernel_queue();
            }

            self.fire_timers();
        }
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = self.next_stats_at.saturating_duration_since(now);
        if let Some(at) = self.next_flush_at {
            timeout = timeout.min(at.saturating_duration_since(now));
        }
        if matches!(self.queue, KernelQueue::Nfq(_)) {
            timeout = timeout.min(NFQ_TICK);
        }
        timeout.max(Duration::from_millis(1))
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        if now >= self.next_stats_at {
            self.stats.emit();
            if !self.settings.single {
                self.router.delete_obsolete(stats::now_secs());
            }
            self.next_stats_at = now + OUTPUT_INTERVAL;
        }
        if let Some(at) = self.next_flush_at {
            if now >= at {
                self.router.flush_buffered();
                self.next_flush_at = Some(now + CHECK_INTERVAL);
            }
        }
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::warn!("set nodelay on {peer} failed, dropping: {e}");
                        continue;
                    }
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        tracing::warn!("register {peer} failed, dropping: {e}");
                        continue;
                    }
                    if self.settings.single {
                        self.router.set_default_fd(stream.as_raw_fd());
                    }
                    tracing::info!("replay client {peer} connected, fd:{}", stream.as_raw_fd());
                    self.clients.insert(
                        token,
                        ClientConn {
                            stream,
                            buf: [0u8; MSG_CLIENT_SIZE],
                            filled: 0,
                        },
                    );
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn client_readable(&mut self, token: Token) {
        let mut close = false;
        if let Some(conn) = self.clients.get_mut(&token) {
            loop {
                match conn.stream.read(&mut conn.buf[conn.filled..]) {
                    Ok(0) => {
                        close = true;
                        break;
                    }
                    Ok(n) => {
                        conn.filled += n;
                        if conn.filled == MSG_CLIENT_SIZE {
                            conn.filled = 0;
                            let fd = conn.stream.as_raw_fd();
                            dispatch_control(&self.router, &self.stats, &conn.buf, fd);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!("control read failed: {e}");
                        close = true;
                        break;
                    }
                }
            }
        }
        if close {
            self.close_client(token);
        }
    }

    fn close_client(&mut self, token: Token) {
        if let Some(mut conn) = self.clients.remove(&token) {
            let fd = conn.stream.as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                tracing::warn!("deregister fd:{fd} failed: {e}");
            }
            self.router.purge_fd(fd);
            tracing::info!("replay client fd:{fd} disconnected");
        }
    }

    fn drain_kernel_queue(&mut self) {
        loop {
            match self.queue.read_packet() {
                Ok(Some(pkt)) => self.process_packet(pkt),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("kernel queue read failed: {e}");
                    break;
                }
            }
        }
    }

    /// The verdict pipeline for one packet. The fingerprint goes out before
    /// the verdict so the replay client can observe the interception no
    /// later than the kernel suppresses the packet.
    fn process_packet(&mut self, pkt: PacketDescriptor) {
        let outcome = match self.classifier.classify(&pkt.payload) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("packet id:{}: {e}", pkt.id);
                self.queue.discard();
                return;
            }
        };

        if let Some(header) = outcome.forward {
            match &self.staging {
                Some(staging) => staging.headers.put(header),
                None => self.router.update(&header),
            }
        }

        match &self.staging {
            Some(staging) => staging.verdicts.put(VerdictSlot {
                packet_id: pkt.id,
                verdict: outcome.verdict,
            }),
            None => {
                if let Err(e) = self.queue.send_verdict(pkt.id, outcome.verdict) {
                    tracing::warn!("packet id:{}: {e}", pkt.id);
                }
            }
        }
    }
}

/// Decode and apply one control message. The wire fields are network order;
/// unknown message types are ignored.
fn dispatch_control(
    router: &Router,
    stats: &InterceptStats,
    msg: &[u8; MSG_CLIENT_SIZE],
    fd: std::os::fd::RawFd,
) {
    let client_ip = Ipv4Addr::new(msg[0], msg[1], msg[2], msg[3]);
    let client_port = u16::from_be_bytes([msg[4], msg[5]]);
    match u16::from_be_bytes([msg[6], msg[7]]) {
        CLIENT_ADD => {
            stats.tot_router_items.fetch_add(1, Relaxed);
            tracing::debug!("add client route {client_ip}:{client_port} -> fd:{fd}");
            router.add(client_ip, client_port, fd);
        }
        CLIENT_DEL => {
            tracing::debug!("del client route {client_ip}:{client_port}");
            router.del(client_ip, client_port);
        }
        other => {
            tracing::debug!("ignoring control message type {other}");
        }
    }
}

/// Reuse-address listener, non-blocking before it enters the poll set.
fn bind_listener(ip: Ipv4Addr, port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddrV4::new(ip, port).into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// Spawn the verdict dispatcher and response forwarder. The threads are
/// detached; they terminate with the process.
fn spawn_workers(
    settings: &Settings,
    queue: &KernelQueue,
    router: &Arc<Router>,
) -> Result<StagingHandles> {
    let ipq = queue
        .ipq()
        .context("threaded mode requires the ipq backend")?
        .clone();
    let verdicts = Arc::new(StagingPool::new(settings.pool_size));
    let headers = Arc::new(StagingPool::new(settings.pool_size));

    {
        let pool = verdicts.clone();
        thread::Builder::new()
            .name("verdict-dispatch".into())
            .spawn(move || loop {
                let slot: VerdictSlot = pool.get();
                if let Err(e) = ipq.send_verdict(slot.packet_id, slot.verdict) {
                    tracing::warn!("packet id:{}: {e}", slot.packet_id);
                }
            })
            .context("spawn verdict dispatcher failed")?;
    }
    {
        let pool = headers.clone();
        let router = router.clone();
        thread::Builder::new()
            .name("resp-forward".into())
            .spawn(move || loop {
                let header = pool.get();
                router.update(&header);
            })
            .context("spawn response forwarder failed")?;
    }

    Ok(StagingHandles { verdicts, headers })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ResponseHeader;
    use crate::testutil::response_packet;
    use std::os::unix::net::UnixStream;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);

    /// A control message laid out exactly as the wire carries it: ip at
    /// offset 0, port at 4, type at 6, reserved tail zeroed.
    fn control_msg(ip: Ipv4Addr, port: u16, kind: u16) -> [u8; MSG_CLIENT_SIZE] {
        let mut msg = [0u8; MSG_CLIENT_SIZE];
        msg[0..4].copy_from_slice(&ip.octets());
        msg[4..6].copy_from_slice(&port.to_be_bytes());
        msg[6..8].copy_from_slice(&kind.to_be_bytes());
        msg
    }

    #[test]
    fn test_client_add_decodes_ip_port_and_registers() {
        let router = Router::new(64, 30, false, false);
        let stats = InterceptStats::new();
        let (up, mut peer) = UnixStream::pair().unwrap();

        let msg = control_msg(CLIENT, 54321, CLIENT_ADD);
        dispatch_control(&router, &stats, &msg, up.as_raw_fd());
        assert_eq!(router.len(), 1);
        assert_eq!(stats.snapshot().tot_router_items, 1);

        // The decoded key must match the key a response packet produces:
        // an ip/port offset or byte-order slip would miss this lookup.
        let header = ResponseHeader::capture(&response_packet(CLIENT, 54321)).unwrap();
        router.update(&header);
        peer.set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let mut fingerprint = [0u8; 20];
        peer.read_exact(&mut fingerprint).unwrap();
        assert_eq!(&fingerprint, &response_packet(CLIENT, 54321)[..20]);
    }

    #[test]
    fn test_client_del_decodes_the_same_key() {
        let router = Router::new(64, 30, false, false);
        let stats = InterceptStats::new();
        let (up, _peer) = UnixStream::pair().unwrap();

        dispatch_control(
            &router,
            &stats,
            &control_msg(CLIENT, 54321, CLIENT_ADD),
            up.as_raw_fd(),
        );
        assert_eq!(router.len(), 1);

        let del = control_msg(CLIENT, 54321, CLIENT_DEL);
        dispatch_control(&router, &stats, &del, up.as_raw_fd());
        assert!(router.is_empty());

        // A second del is a no-op, and del never counts as a registration.
        dispatch_control(&router, &stats, &del, up.as_raw_fd());
        assert!(router.is_empty());
        assert_eq!(stats.snapshot().tot_router_items, 1);
    }

    #[test]
    fn test_unknown_message_type_is_ignored() {
        let router = Router::new(64, 30, false, false);
        let stats = InterceptStats::new();
        let (up, _peer) = UnixStream::pair().unwrap();

        dispatch_control(&router, &stats, &control_msg(CLIENT, 54321, 7), up.as_raw_fd());
        assert!(router.is_empty());
        assert_eq!(stats.snapshot().tot_router_items, 0);
    }
}
