//! Descriptor registry: one record per live socket.
//!
//! The registry owns every socket for the lifetime of a run. Records are
//! reachable by descriptor number and through the intrusive `next_fd` ring,
//! which gives the client O(1) round-robin over its targets. Registration and
//! deregistration happen only at setup/teardown; steady-state access is
//! read-mostly and single-threaded per worker.
//!
//! Socket preparation applies each configured knob best-effort in sequence;
//! the first knob the kernel refuses fails preparation with a `Socket` error.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::addr::{McIface, PeerAddr, SockKind, SocketSpec};
use crate::error::{PulseError, Result};
use crate::parser::RecvAccumulator;

// `libc` does not expose `struct group_source_req` (from <linux/mcast.h>) on
// this target/version, so it is reproduced here with the kernel's ABI layout.
#[repr(C)]
#[allow(non_camel_case_types)]
struct group_source_req {
    gsr_interface: u32,
    gsr_group: libc::sockaddr_storage,
    gsr_source: libc::sockaddr_storage,
}

/// Which side of the benchmark a socket belongs to. Servers bind and listen;
/// clients connect (stream) or address sends to the peer (datagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Socket knobs applied at prepare time.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub nonblocking: bool,
    pub reuse_addr: bool,
    /// SO_SNDBUF / SO_RCVBUF, both set to the same value when present.
    pub buffer_size: Option<usize>,
    /// TCP_NODELAY; on by default, `--tcp-avoid-nodelay` turns it off.
    pub tcp_no_delay: bool,
    pub tos: Option<u32>,
    /// SO_BUSY_POLL microseconds (Linux low-latency socket poll).
    pub lls_usec: Option<u32>,
    /// SO_MAX_PACING_RATE, bytes per second.
    pub rate_limit: Option<u32>,
    pub mc_ttl: u32,
    /// Multicast loopback; disabled by default.
    pub mc_loopback: bool,
    pub mc_rx_if: Option<McIface>,
    pub mc_tx_if: Option<McIface>,
    /// Client-side bind address (`--client_addr` / `--client_port`).
    pub client_bind: Option<PeerAddr>,
    /// SO_REUSEADDR on the client-side bind (`--uc-reuseaddr`).
    pub client_reuse_addr: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            nonblocking: false,
            reuse_addr: true,
            buffer_size: None,
            tcp_no_delay: true,
            tos: None,
            lls_usec: None,
            rate_limit: None,
            mc_ttl: 2,
            mc_loopback: false,
            mc_rx_if: None,
            mc_tx_if: None,
            client_bind: None,
            client_reuse_addr: false,
        }
    }
}

pub struct SocketRecord {
    pub socket: Socket,
    pub peer: PeerAddr,
    pub kind: SockKind,
    pub is_multicast: bool,
    pub is_listener: bool,
    pub memberships: Vec<PeerAddr>,
    pub mc_source: Option<IpAddr>,
    /// Next descriptor in the round-robin ring; rewired by the registry.
    pub next_fd: RawFd,
    pub recv: RecvAccumulator,
    /// Expected next sequence for per-connection gap detection.
    pub expected_seq: Option<u64>,
    /// UNIX-domain path to unlink when this record is released.
    pub unlink_on_close: Option<PathBuf>,
}

impl SocketRecord {
    pub fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn local_addr(&self) -> Result<PeerAddr> {
        let sa = self
            .socket
            .local_addr()
            .map_err(|e| PulseError::socket_err("local_addr", e))?;
        PeerAddr::from_sock_addr(&sa)
            .ok_or_else(|| PulseError::Fatal("unrepresentable local address".into()))
    }
}

impl Drop for SocketRecord {
    fn drop(&mut self) {
        if let Some(path) = self.unlink_on_close.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

fn sockerr(context: &str) -> impl Fn(io::Error) -> PulseError + '_ {
    move |e| PulseError::socket_err(context.to_string(), e)
}

fn setsockopt_raw(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: *const libc::c_void,
    len: libc::socklen_t,
    context: &str,
) -> Result<()> {
    let rc = unsafe { libc::setsockopt(fd, level, name, value, len) };
    if rc != 0 {
        return Err(PulseError::socket(context));
    }
    Ok(())
}

pub(crate) fn v4_source_membership(
    group: Ipv4Addr,
    source: Ipv4Addr,
    iface: Ipv4Addr,
) -> libc::ip_mreq_source {
    libc::ip_mreq_source {
        imr_multiaddr: libc::in_addr { s_addr: u32::from_ne_bytes(group.octets()) },
        imr_interface: libc::in_addr { s_addr: u32::from_ne_bytes(iface.octets()) },
        imr_sourceaddr: libc::in_addr { s_addr: u32::from_ne_bytes(source.octets()) },
    }
}

fn join_group(
    socket: &Socket,
    group: &PeerAddr,
    source: Option<IpAddr>,
    rx_if: Option<McIface>,
) -> Result<()> {
    match (group, source) {
        (PeerAddr::V4(g), None) => {
            let iface = match rx_if {
                Some(McIface::V4(a)) => a,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            socket
                .join_multicast_v4(g.ip(), &iface)
                .map_err(sockerr("IP_ADD_MEMBERSHIP"))
        }
        (PeerAddr::V4(g), Some(IpAddr::V4(src))) => {
            let iface = match rx_if {
                Some(McIface::V4(a)) => a,
                _ => Ipv4Addr::UNSPECIFIED,
            };
            let mreq = v4_source_membership(*g.ip(), src, iface);
            setsockopt_raw(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_ADD_SOURCE_MEMBERSHIP,
                &mreq as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::ip_mreq_source>() as libc::socklen_t,
                "IP_ADD_SOURCE_MEMBERSHIP",
            )
        }
        (PeerAddr::V6(g), None) => {
            let ifindex = match rx_if {
                Some(McIface::V6Index(ix)) => ix,
                _ => 0,
            };
            socket
                .join_multicast_v6(g.ip(), ifindex)
                .map_err(sockerr("IPV6_JOIN_GROUP"))
        }
        (PeerAddr::V6(g), Some(IpAddr::V6(src))) => {
            let ifindex = match rx_if {
                Some(McIface::V6Index(ix)) => ix,
                _ => 0,
            };
            let mut req: group_source_req = unsafe { std::mem::zeroed() };
            req.gsr_interface = ifindex;
            write_v6_storage(&mut req.gsr_group, g);
            let src_sa = SocketAddrV6::new(src, 0, 0, 0);
            write_v6_storage(&mut req.gsr_source, &src_sa);
            setsockopt_raw(
                socket.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::MCAST_JOIN_SOURCE_GROUP,
                &req as *const _ as *const libc::c_void,
                std::mem::size_of::<group_source_req>() as libc::socklen_t,
                "MCAST_JOIN_SOURCE_GROUP",
            )
        }
        _ => Err(PulseError::BadArgument(
            "multicast source filter family does not match the group".into(),
        )),
    }
}

fn write_v6_storage(storage: &mut libc::sockaddr_storage, addr: &SocketAddrV6) {
    let sa = SockAddr::from(*addr);
    unsafe {
        std::ptr::copy_nonoverlapping(
            sa.as_ptr() as *const u8,
            storage as *mut _ as *mut u8,
            sa.len() as usize,
        );
    }
}

fn apply_common_options(socket: &Socket, spec: &SocketSpec, opts: &SocketOptions) -> Result<()> {
    if let Some(size) = opts.buffer_size {
        socket.set_recv_buffer_size(size).map_err(sockerr("SO_RCVBUF"))?;
        socket.set_send_buffer_size(size).map_err(sockerr("SO_SNDBUF"))?;
    }
    if let Some(tos) = opts.tos {
        match &spec.addr {
            PeerAddr::V4(_) => socket.set_tos(tos).map_err(sockerr("IP_TOS"))?,
            PeerAddr::V6(_) => {
                let v = tos as libc::c_int;
                setsockopt_raw(
                    socket.as_raw_fd(),
                    libc::IPPROTO_IPV6,
                    libc::IPV6_TCLASS,
                    &v as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                    "IPV6_TCLASS",
                )?;
            }
            PeerAddr::Unix(_) => {}
        }
    }
    #[cfg(target_os = "linux")]
    if let Some(usec) = opts.lls_usec {
        let v = usec as libc::c_int;
        setsockopt_raw(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BUSY_POLL,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            "SO_BUSY_POLL",
        )?;
    }
    #[cfg(target_os = "linux")]
    if let Some(rate) = opts.rate_limit {
        let v = rate;
        setsockopt_raw(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_MAX_PACING_RATE,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<u32>() as libc::socklen_t,
            "SO_MAX_PACING_RATE",
        )?;
    }
    if spec.kind == SockKind::Stream && !spec.addr.is_unix() {
        socket.set_nodelay(opts.tcp_no_delay).map_err(sockerr("TCP_NODELAY"))?;
    }
    Ok(())
}

fn apply_multicast_tx_options(socket: &Socket, spec: &SocketSpec, opts: &SocketOptions) -> Result<()> {
    match &spec.addr {
        PeerAddr::V4(_) => {
            socket
                .set_multicast_ttl_v4(opts.mc_ttl)
                .map_err(sockerr("IP_MULTICAST_TTL"))?;
            socket
                .set_multicast_loop_v4(opts.mc_loopback)
                .map_err(sockerr("IP_MULTICAST_LOOP"))?;
            if let Some(McIface::V4(a)) = opts.mc_tx_if {
                socket.set_multicast_if_v4(&a).map_err(sockerr("IP_MULTICAST_IF"))?;
            }
        }
        PeerAddr::V6(_) => {
            socket
                .set_multicast_hops_v6(opts.mc_ttl)
                .map_err(sockerr("IPV6_MULTICAST_HOPS"))?;
            socket
                .set_multicast_loop_v6(opts.mc_loopback)
                .map_err(sockerr("IPV6_MULTICAST_LOOP"))?;
            if let Some(McIface::V6Index(ix)) = opts.mc_tx_if {
                socket.set_multicast_if_v6(ix).map_err(sockerr("IPV6_MULTICAST_IF"))?;
            }
        }
        PeerAddr::Unix(_) => {}
    }
    Ok(())
}

/// Per-(pid, fd) reply path for UNIX-domain datagram clients: an unbound
/// datagram socket has no address for the server to reply to.
fn unix_client_path(fd: RawFd) -> PathBuf {
    let pid = unsafe { libc::getpid() };
    PathBuf::from(format!("/tmp/sockpulse_client_{}_{}.sock", pid, fd))
}

/// Create and configure one socket per its spec, role, and options.
pub fn prepare_socket(
    spec: &SocketSpec,
    opts: &SocketOptions,
    role: Role,
    max_size: usize,
) -> Result<SocketRecord> {
    let domain = match &spec.addr {
        PeerAddr::V4(_) => Domain::IPV4,
        PeerAddr::V6(_) => Domain::IPV6,
        PeerAddr::Unix(_) => Domain::UNIX,
    };
    let (ty, protocol) = match spec.kind {
        SockKind::Dgram => (Type::DGRAM, (!spec.addr.is_unix()).then_some(Protocol::UDP)),
        SockKind::Stream => (Type::STREAM, (!spec.addr.is_unix()).then_some(Protocol::TCP)),
    };
    let socket = Socket::new(domain, ty, protocol).map_err(sockerr("socket"))?;
    let is_multicast = spec.addr.is_multicast();
    let mut unlink_on_close = None;
    let mut is_listener = false;

    apply_common_options(&socket, spec, opts)?;

    match role {
        Role::Server => {
            if opts.reuse_addr {
                socket.set_reuse_address(true).map_err(sockerr("SO_REUSEADDR"))?;
            }
            if let PeerAddr::Unix(path) = &spec.addr {
                // The server owns its path; a stale one from a crashed run is
                // removed before bind.
                let _ = std::fs::remove_file(path);
                unlink_on_close = Some(path.clone());
            }
            socket
                .bind(&spec.addr.to_sock_addr()?)
                .map_err(sockerr(&format!("bind {}", spec.addr)))?;
            if is_multicast {
                join_group(&socket, &spec.addr, spec.mc_source, opts.mc_rx_if)?;
                for (group, source) in &spec.memberships {
                    join_group(&socket, group, *source, opts.mc_rx_if)?;
                }
                apply_multicast_tx_options(&socket, spec, opts)?;
            }
            if spec.kind == SockKind::Stream {
                socket.listen(128).map_err(sockerr("listen"))?;
                is_listener = true;
            }
        }
        Role::Client => {
            if opts.client_reuse_addr {
                socket.set_reuse_address(true).map_err(sockerr("SO_REUSEADDR"))?;
            }
            match spec.kind {
                SockKind::Dgram => {
                    if spec.addr.is_unix() {
                        let path = unix_client_path(socket.as_raw_fd());
                        let _ = std::fs::remove_file(&path);
                        socket
                            .bind(&SockAddr::unix(&path).map_err(sockerr("unix client path"))?)
                            .map_err(sockerr("bind unix client path"))?;
                        unlink_on_close = Some(path);
                    } else if let Some(bind_addr) = &opts.client_bind {
                        socket
                            .bind(&bind_addr.to_sock_addr()?)
                            .map_err(sockerr(&format!("bind {}", bind_addr)))?;
                    }
                    if is_multicast {
                        apply_multicast_tx_options(&socket, spec, opts)?;
                    }
                }
                SockKind::Stream => {
                    if let Some(bind_addr) = &opts.client_bind {
                        socket
                            .bind(&bind_addr.to_sock_addr()?)
                            .map_err(sockerr(&format!("bind {}", bind_addr)))?;
                    }
                    socket
                        .connect(&spec.addr.to_sock_addr()?)
                        .map_err(sockerr(&format!("connect {}", spec.addr)))?;
                }
            }
        }
    }

    if opts.nonblocking {
        socket.set_nonblocking(true).map_err(sockerr("O_NONBLOCK"))?;
    }

    let fd = socket.as_raw_fd();
    Ok(SocketRecord {
        socket,
        peer: spec.addr.clone(),
        kind: spec.kind,
        is_multicast,
        is_listener,
        memberships: spec.memberships.iter().map(|(a, _)| a.clone()).collect(),
        mc_source: spec.mc_source,
        next_fd: fd,
        recv: RecvAccumulator::new(max_size),
        expected_seq: None,
        unlink_on_close,
    })
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct SocketRegistry {
    slots: Vec<Option<SocketRecord>>,
    count: usize,
    head: RawFd,
    tail: RawFd,
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketRegistry {
    pub fn new() -> Self {
        SocketRegistry { slots: Vec::new(), count: 0, head: -1, tail: -1 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// First descriptor of the round-robin ring.
    pub fn head(&self) -> Option<RawFd> {
        (self.head >= 0).then_some(self.head)
    }

    pub fn fd_min(&self) -> RawFd {
        self.iter_fds().min().unwrap_or(0)
    }

    pub fn fd_max(&self) -> RawFd {
        self.iter_fds().max().unwrap_or(0)
    }

    pub fn iter_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(fd, _)| fd as RawFd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&SocketRecord> {
        self.slots.get(fd as usize).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut SocketRecord> {
        self.slots.get_mut(fd as usize).and_then(|s| s.as_mut())
    }

    /// Successor in the ring; identity for unknown descriptors.
    pub fn next_fd(&self, fd: RawFd) -> RawFd {
        self.get(fd).map(|r| r.next_fd).unwrap_or(fd)
    }

    pub fn register(&mut self, mut record: SocketRecord) -> RawFd {
        let fd = record.fd();
        if self.slots.len() <= fd as usize {
            self.slots.resize_with(fd as usize + 1, || None);
        }
        if self.head < 0 {
            record.next_fd = fd;
            self.head = fd;
            self.tail = fd;
        } else {
            record.next_fd = self.head;
            if let Some(tail) = self.get_mut(self.tail) {
                tail.next_fd = fd;
            }
            self.tail = fd;
        }
        self.slots[fd as usize] = Some(record);
        self.count += 1;
        fd
    }

    /// Unlink from the ring and release the record (closing the socket and
    /// removing any UNIX-domain path it owns).
    pub fn deregister(&mut self, fd: RawFd) -> Option<SocketRecord> {
        let record = self.slots.get_mut(fd as usize)?.take()?;
        self.count -= 1;
        if self.count == 0 {
            self.head = -1;
            self.tail = -1;
        } else {
            // Rewire the predecessor around the removed node.
            let mut prev = record.next_fd;
            while self.next_fd(prev) != fd {
                prev = self.next_fd(prev);
            }
            if let Some(p) = self.get_mut(prev) {
                p.next_fd = record.next_fd;
            }
            if self.head == fd {
                self.head = record.next_fd;
            }
            if self.tail == fd {
                self.tail = prev;
            }
        }
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// Raw send/receive
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RecvOutcome {
    /// Bytes landed in the record's accumulator write slot.
    Data { len: usize, from: Option<PeerAddr> },
    WouldBlock,
    Interrupted,
    /// Orderly shutdown or connection reset.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    WouldBlock,
    Shutdown,
}

fn peer_from_storage(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<PeerAddr> {
    if len == 0 {
        return None;
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(PeerAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(PeerAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        libc::AF_UNIX => {
            let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let cap = (len as usize)
                .saturating_sub(std::mem::size_of::<libc::sa_family_t>())
                .min(sun.sun_path.len());
            let bytes: Vec<u8> = sun.sun_path[..cap]
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            Some(PeerAddr::Unix(PathBuf::from(std::ffi::OsString::from_vec(bytes))))
        }
        _ => None,
    }
}

/// Receive once into the record's accumulator. Datagram sockets report the
/// source address; stream sockets report `None`.
pub fn recv_into(record: &mut SocketRecord) -> RecvOutcome {
    let fd = record.socket.as_raw_fd();
    let want_addr = record.kind == SockKind::Dgram;
    let slot = record.recv.write_slot();

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        if want_addr {
            libc::recvfrom(
                fd,
                slot.as_mut_ptr() as *mut libc::c_void,
                slot.len(),
                libc::MSG_NOSIGNAL,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut addr_len,
            )
        } else {
            libc::recv(fd, slot.as_mut_ptr() as *mut libc::c_void, slot.len(), libc::MSG_NOSIGNAL)
        }
    };

    if n > 0 {
        let from = want_addr.then(|| peer_from_storage(&storage, addr_len)).flatten();
        return RecvOutcome::Data { len: n as usize, from };
    }
    if n == 0 {
        return RecvOutcome::Shutdown;
    }
    match io::Error::last_os_error().raw_os_error() {
        Some(libc::EAGAIN) => RecvOutcome::WouldBlock,
        #[allow(unreachable_patterns)]
        Some(libc::EWOULDBLOCK) => RecvOutcome::WouldBlock,
        Some(libc::EINTR) => RecvOutcome::Interrupted,
        Some(libc::ECONNRESET) | Some(libc::EPIPE) => RecvOutcome::Shutdown,
        _ => {
            tracing::warn!(fd, error = %io::Error::last_os_error(), "recv failed");
            RecvOutcome::WouldBlock
        }
    }
}

/// Upper bound on mid-message would-block retries when the caller asked to
/// skip blocking sends; an unresponsive peer must not stall the loop.
const SKIP_SEND_SPIN: u32 = 4096;

/// Send one whole message. Partial stream sends retry the remainder; a
/// would-block before the first byte is reported so the caller can skip the
/// send; `EINTR` is retried once. With `skip_blocking` the mid-message retry
/// is bounded instead of indefinite; the stream may desync, which is the
/// documented price of skipping blocking sends.
pub fn send_message(fd: RawFd, data: &[u8], dest: Option<&SockAddr>, skip_blocking: bool) -> SendOutcome {
    let mut sent = 0usize;
    let mut eintr_retried = false;
    let mut spins = 0u32;
    while sent < data.len() {
        let n = unsafe {
            match dest {
                Some(sa) => libc::sendto(
                    fd,
                    data[sent..].as_ptr() as *const libc::c_void,
                    data.len() - sent,
                    libc::MSG_NOSIGNAL,
                    sa.as_ptr() as *const libc::sockaddr,
                    sa.len(),
                ),
                None => libc::send(
                    fd,
                    data[sent..].as_ptr() as *const libc::c_void,
                    data.len() - sent,
                    libc::MSG_NOSIGNAL,
                ),
            }
        };
        if n >= 0 {
            sent += n as usize;
            continue;
        }
        match io::Error::last_os_error().raw_os_error() {
            Some(libc::EAGAIN) => {
                if sent == 0 {
                    return SendOutcome::WouldBlock;
                }
                // Mid-message on a stream: spin out the remainder to keep
                // framing intact.
                if skip_blocking {
                    spins += 1;
                    if spins > SKIP_SEND_SPIN {
                        return SendOutcome::WouldBlock;
                    }
                }
                std::hint::spin_loop();
                continue;
            }
            Some(libc::EINTR) => {
                if eintr_retried {
                    return SendOutcome::WouldBlock;
                }
                eintr_retried = true;
                continue;
            }
            Some(libc::EPIPE) | Some(libc::ECONNRESET) => return SendOutcome::Shutdown,
            _ => {
                tracing::warn!(fd, error = %io::Error::last_os_error(), "send failed");
                return SendOutcome::WouldBlock;
            }
        }
    }
    SendOutcome::Sent
}
