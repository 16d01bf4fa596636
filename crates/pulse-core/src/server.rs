//! Server role: multiplexed echo across every prepared socket.
//!
//! Each ready-fd cycle accepts pending stream connections, drives the message
//! parser over readable sockets, and echoes back every message that carries
//! `PONG_REQUEST`: `CLIENT` cleared (bridge mode forwards untouched),
//! sequence and `WARMUP` preserved, payload verbatim. Multicast requests are
//! answered on the original group unless forced to unicast.
//!
//! Multi-threaded mode partitions the prepared sockets across workers; each
//! worker owns its descriptors, multiplexer, and parser state outright, so no
//! descriptor ever crosses threads. Per-worker counters are summed over a
//! channel at teardown.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

use crate::addr::{PeerAddr, SockKind};
use crate::error::Result;
use crate::message::{MsgHeader, MsgLimits};
use crate::mux::{IoMux, MuxKind};
use crate::parser::{LengthMode, MessageParser};
use crate::registry::{
    recv_into, send_message, RecvOutcome, SendOutcome, SocketRecord, SocketRegistry, SocketOptions,
};

/// How many pending connections one readiness event may accept when the
/// listener is non-blocking.
const ACCEPT_BURST: usize = 10;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub limits: MsgLimits,
    /// Stream framing length; both peers must agree.
    pub msg_size: usize,
    pub mux: MuxKind,
    /// Multiplexer liveness timeout in milliseconds; -1 blocks.
    pub timeout_msec: i64,
    pub threads: usize,
    /// Swallow requests instead of echoing.
    pub dont_reply: bool,
    /// Forward without touching the CLIENT flag (a third role, not a server).
    pub bridge: bool,
    /// Answer multicast requests to the source instead of the group.
    pub force_unicast_reply: bool,
    /// Accept non-CLIENT traffic for multicast-loopback diagnostics.
    pub mc_loopback_diag: bool,
    pub detect_gaps: bool,
    /// Emit an activity line every N received messages.
    pub activity_every: Option<u64>,
    /// Options inherited by accepted stream sockets.
    pub inherit_opts: SocketOptions,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSummary {
    pub received: u64,
    pub replied: u64,
    pub bad_headers: u64,
    pub gap_dropped: u64,
    pub gap_ooo: u64,
    pub accepted: u64,
    pub closed: u64,
}

impl ServerSummary {
    fn merge(&mut self, other: &ServerSummary) {
        self.received += other.received;
        self.replied += other.replied;
        self.bad_headers += other.bad_headers;
        self.gap_dropped += other.gap_dropped;
        self.gap_ooo += other.gap_ooo;
        self.accepted += other.accepted;
        self.closed += other.closed;
    }
}

// ---------------------------------------------------------------------------
// Gap detection
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum GapOutcome {
    FirstContact,
    InOrder,
    Dropped(u64),
    OutOfOrder,
}

/// Compare a received sequence against the per-peer expectation and advance
/// it. A skip counts the missing sequences as drops; an old sequence counts
/// as out-of-order and leaves the expectation alone.
pub(crate) fn update_gap(expected: &mut Option<u64>, seq: u64) -> GapOutcome {
    match *expected {
        None => {
            *expected = Some(seq + 1);
            GapOutcome::FirstContact
        }
        Some(want) if seq == want => {
            *expected = Some(seq + 1);
            GapOutcome::InOrder
        }
        Some(want) if seq > want => {
            *expected = Some(seq + 1);
            GapOutcome::Dropped(seq - want)
        }
        Some(_) => GapOutcome::OutOfOrder,
    }
}

// ---------------------------------------------------------------------------
// Reply construction
// ---------------------------------------------------------------------------

/// Copy the request into `scratch` and rewrite its header for the reply:
/// CLIENT cleared (kept in bridge mode), sequence, PONG_REQUEST and WARMUP
/// preserved, payload untouched.
pub(crate) fn build_reply<'a>(hdr: &MsgHeader, data: &[u8], bridge: bool, scratch: &'a mut [u8]) -> &'a [u8] {
    let out = &mut scratch[..data.len()];
    out.copy_from_slice(data);
    let mut reply = *hdr;
    if !bridge {
        reply.set_server();
    }
    reply.write_to(out);
    &out[..data.len()]
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum MessageAction {
    Continue,
    /// Stop parsing and deregister the descriptor.
    CloseFd,
}

#[allow(clippy::too_many_arguments)]
fn on_message(
    cfg: &ServerConfig,
    fd: RawFd,
    kind: SockKind,
    is_multicast: bool,
    group: &PeerAddr,
    src: Option<&PeerAddr>,
    expected_seq: &mut Option<u64>,
    sessions: &mut HashMap<PeerAddr, u64>,
    summary: &mut ServerSummary,
    scratch: &mut [u8],
    hdr: &MsgHeader,
    data: &[u8],
) -> MessageAction {
    if !hdr.is_client() && !cfg.mc_loopback_diag {
        // Not a request: a looped-back reply of our own or foreign traffic.
        return MessageAction::Continue;
    }
    summary.received += 1;
    if let Some(every) = cfg.activity_every {
        if summary.received % every == 0 {
            tracing::info!(received = summary.received, "activity");
        }
    }

    if cfg.detect_gaps {
        let outcome = match kind {
            SockKind::Stream => update_gap(expected_seq, hdr.sequence),
            SockKind::Dgram => match src {
                Some(peer) => {
                    let mut expected = sessions.get(peer).copied();
                    let out = update_gap(&mut expected, hdr.sequence);
                    sessions.insert(peer.clone(), expected.unwrap_or(hdr.sequence + 1));
                    out
                }
                None => GapOutcome::FirstContact,
            },
        };
        match outcome {
            GapOutcome::Dropped(n) => summary.gap_dropped += n,
            GapOutcome::OutOfOrder => summary.gap_ooo += 1,
            _ => {}
        }
    }

    if !hdr.is_pong_request() || cfg.dont_reply {
        return MessageAction::Continue;
    }

    let wire = build_reply(hdr, data, cfg.bridge, scratch);
    let dest = match kind {
        SockKind::Stream => None,
        SockKind::Dgram => {
            let to = if is_multicast && !cfg.force_unicast_reply {
                // Reply on the original group, to the port the request came
                // from.
                let mut g = group.clone();
                if let Some(p) = src.and_then(|s| s.port()) {
                    g.set_port(p);
                }
                g
            } else {
                match src {
                    Some(s) => s.clone(),
                    None => return MessageAction::Continue,
                }
            };
            match to.to_sock_addr() {
                Ok(sa) => Some(sa),
                Err(_) => return MessageAction::Continue,
            }
        }
    };

    match send_message(fd, wire, dest.as_ref(), false) {
        SendOutcome::Sent => {
            summary.replied += 1;
            MessageAction::Continue
        }
        SendOutcome::WouldBlock => {
            tracing::trace!(fd, seq = hdr.sequence, "reply dropped, send would block");
            MessageAction::Continue
        }
        SendOutcome::Shutdown => MessageAction::CloseFd,
    }
}

fn close_fd(registry: &mut SocketRegistry, mux: &mut IoMux, fd: RawFd, summary: &mut ServerSummary) {
    let _ = mux.remove(fd);
    if registry.deregister(fd).is_some() {
        summary.closed += 1;
        tracing::debug!(fd, "connection closed");
    }
}

fn accept_burst(
    cfg: &ServerConfig,
    registry: &mut SocketRegistry,
    mux: &mut IoMux,
    fd: RawFd,
    summary: &mut ServerSummary,
) -> Result<()> {
    let burst = if cfg.inherit_opts.nonblocking { ACCEPT_BURST } else { 1 };
    for _ in 0..burst {
        let accepted = {
            let Some(rec) = registry.get(fd) else { return Ok(()) };
            rec.socket.accept()
        };
        match accepted {
            Ok((sock, sa)) => {
                // Accepted sockets inherit the buffer, TOS, and nodelay
                // settings of the listener's configuration.
                if let Some(size) = cfg.inherit_opts.buffer_size {
                    let _ = sock.set_recv_buffer_size(size);
                    let _ = sock.set_send_buffer_size(size);
                }
                let peer = PeerAddr::from_sock_addr(&sa);
                let is_unix = matches!(peer, Some(PeerAddr::Unix(_)));
                if !is_unix {
                    let _ = sock.set_nodelay(cfg.inherit_opts.tcp_no_delay);
                    if let Some(tos) = cfg.inherit_opts.tos {
                        let _ = sock.set_tos(tos);
                    }
                }
                if cfg.inherit_opts.nonblocking {
                    let _ = sock.set_nonblocking(true);
                }
                let peer = peer.unwrap_or(PeerAddr::Unix(Default::default()));
                tracing::debug!(peer = %peer, "accepted connection");
                let record = SocketRecord {
                    socket: sock,
                    peer,
                    kind: SockKind::Stream,
                    is_multicast: false,
                    is_listener: false,
                    memberships: Vec::new(),
                    mc_source: None,
                    next_fd: -1,
                    recv: crate::parser::RecvAccumulator::new(cfg.limits.max_size),
                    expected_seq: None,
                    unlink_on_close: None,
                };
                let newfd = registry.register(record);
                mux.add(newfd)?;
                summary.accepted += 1;
            }
            Err(e) => {
                match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => {}
                    _ => tracing::warn!(fd, error = %e, "accept failed"),
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_ready_fd(
    cfg: &ServerConfig,
    registry: &mut SocketRegistry,
    mux: &mut IoMux,
    fd: RawFd,
    sessions: &mut HashMap<PeerAddr, u64>,
    summary: &mut ServerSummary,
    scratch: &mut [u8],
    exit: &AtomicBool,
) {
    let Some(rec) = registry.get_mut(fd) else { return };
    let kind = rec.kind;
    let is_multicast = rec.is_multicast;
    let group = rec.peer.clone();

    let (n, from) = match recv_into(rec) {
        RecvOutcome::Data { len, from } => (len, from),
        RecvOutcome::WouldBlock | RecvOutcome::Interrupted => return,
        RecvOutcome::Shutdown => {
            // A zero read ends a connection; datagram sockets just saw an
            // empty datagram.
            if kind == SockKind::Stream {
                close_fd(registry, mux, fd, summary);
            }
            return;
        }
    };

    let src = match kind {
        SockKind::Stream => Some(group.clone()),
        SockKind::Dgram => from,
    };
    let mode = match kind {
        SockKind::Dgram => LengthMode::Datagram,
        SockKind::Stream => LengthMode::Stream(cfg.msg_size),
    };
    let parser = MessageParser::new(cfg.limits, mode);

    let rec = registry.get_mut(fd).expect("record vanished mid-read");
    let SocketRecord { recv, expected_seq, .. } = rec;

    let mut close_after = false;
    let sum = parser.process_received(recv, n, &mut |hdr: &MsgHeader, data: &[u8]| {
        if exit.load(Relaxed) {
            return false;
        }
        match on_message(
            cfg, fd, kind, is_multicast, &group, src.as_ref(), expected_seq, sessions, summary,
            scratch, hdr, data,
        ) {
            MessageAction::Continue => true,
            MessageAction::CloseFd => {
                close_after = true;
                false
            }
        }
    });
    summary.bad_headers += u64::from(sum.bad_headers);
    if sum.bad_headers > 0 {
        tracing::debug!(fd, "bad header, chunk discarded");
    }
    if close_after {
        close_fd(registry, mux, fd, summary);
    }
}

fn run_worker(
    cfg: &ServerConfig,
    mut registry: SocketRegistry,
    exit: &AtomicBool,
    worker_id: usize,
) -> Result<ServerSummary> {
    let mut mux = IoMux::new(cfg.mux)?;
    let fds: Vec<RawFd> = registry.iter_fds().collect();
    for fd in fds {
        mux.add(fd)?;
    }
    let mut sessions: HashMap<PeerAddr, u64> = HashMap::new();
    let mut summary = ServerSummary::default();
    let mut scratch = vec![0u8; cfg.limits.max_size];
    let mut ready: Vec<RawFd> = Vec::new();

    tracing::debug!(worker = worker_id, fds = registry.len(), "server worker running");
    while !exit.load(Relaxed) {
        ready.clear();
        ready.extend_from_slice(mux.wait(cfg.timeout_msec)?);
        for i in 0..ready.len() {
            let fd = ready[i];
            let Some(rec) = registry.get(fd) else { continue };
            if rec.is_listener {
                accept_burst(cfg, &mut registry, &mut mux, fd, &mut summary)?;
            } else {
                handle_ready_fd(
                    cfg, &mut registry, &mut mux, fd, &mut sessions, &mut summary, &mut scratch,
                    exit,
                );
            }
        }
    }
    tracing::debug!(worker = worker_id, received = summary.received, "server worker stopping");
    Ok(summary)
}

/// Split a prepared registry round-robin into per-worker registries.
fn partition(mut registry: SocketRegistry, n: usize) -> Vec<SocketRegistry> {
    let fds: Vec<RawFd> = registry.iter_fds().collect();
    let mut parts: Vec<SocketRegistry> = (0..n).map(|_| SocketRegistry::new()).collect();
    for (i, fd) in fds.into_iter().enumerate() {
        if let Some(rec) = registry.deregister(fd) {
            parts[i % n].register(rec);
        }
    }
    parts.retain(|p| !p.is_empty());
    parts
}

/// Run the server over a prepared registry until the exit flag is raised.
pub fn run(cfg: &ServerConfig, registry: SocketRegistry, exit: &AtomicBool) -> Result<ServerSummary> {
    let threads = cfg.threads.max(1);
    if threads == 1 || registry.len() < 2 {
        return run_worker(cfg, registry, exit, 0);
    }

    let parts = partition(registry, threads);
    let (tx, rx) = crossbeam_channel::unbounded::<Result<ServerSummary>>();
    std::thread::scope(|s| {
        for (id, part) in parts.into_iter().enumerate() {
            let tx = tx.clone();
            s.spawn(move || {
                let _ = tx.send(run_worker(cfg, part, exit, id));
            });
        }
        drop(tx);
    });

    let mut total = ServerSummary::default();
    for result in rx.iter() {
        total.merge(&result?);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SocketSpec;
    use crate::message::{FLAG_CLIENT, FLAG_PONG_REQUEST, HEADER_SIZE};
    use crate::registry::prepare_socket;
    use crate::registry::Role;
    use std::io::{Read, Write};

    fn limits() -> MsgLimits {
        MsgLimits::new(64, 1000).unwrap()
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            limits: limits(),
            msg_size: 14,
            mux: MuxKind::Poll,
            timeout_msec: 10,
            threads: 1,
            dont_reply: false,
            bridge: false,
            force_unicast_reply: false,
            mc_loopback_diag: false,
            detect_gaps: true,
            activity_every: None,
            inherit_opts: SocketOptions::default(),
        }
    }

    fn request(seq: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0x5au8; len];
        MsgHeader { sequence: seq, flags: FLAG_CLIENT | FLAG_PONG_REQUEST }.write_to(&mut buf);
        buf
    }

    #[test]
    fn test_gap_state_machine() {
        let mut expected = None;
        assert_eq!(update_gap(&mut expected, 5), GapOutcome::FirstContact);
        assert_eq!(update_gap(&mut expected, 6), GapOutcome::InOrder);
        assert_eq!(update_gap(&mut expected, 9), GapOutcome::Dropped(2));
        assert_eq!(update_gap(&mut expected, 8), GapOutcome::OutOfOrder);
        assert_eq!(update_gap(&mut expected, 10), GapOutcome::InOrder);
    }

    #[test]
    fn test_reply_header_rewrite() {
        let req = request(42, 14);
        let hdr = MsgHeader::read_from(&req);
        let mut scratch = [0u8; 64];
        let wire = build_reply(&hdr, &req, false, &mut scratch);
        let reply = MsgHeader::read_from(wire);
        assert!(!reply.is_client());
        assert!(reply.is_pong_request());
        assert_eq!(reply.sequence, 42);
        assert_eq!(&wire[HEADER_SIZE..], &req[HEADER_SIZE..]);

        // bridge mode forwards the CLIENT flag untouched
        let wire = build_reply(&hdr, &req, true, &mut scratch);
        assert!(MsgHeader::read_from(wire).is_client());
    }

    #[test]
    fn test_udp_echo_round_trip() {
        let spec = SocketSpec::new(SockKind::Dgram, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let server_rec = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let server_addr = server_rec.local_addr().unwrap();
        let mut registry = SocketRegistry::new();
        registry.register(server_rec);

        let cfg = test_config();
        let exit = AtomicBool::new(false);
        std::thread::scope(|s| {
            let handle = s.spawn(|| run(&cfg, registry, &exit).unwrap());

            let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            client.connect(server_addr.to_string()).unwrap();
            client
                .set_read_timeout(Some(std::time::Duration::from_secs(5)))
                .unwrap();
            client.send(&request(1, 14)).unwrap();

            let mut buf = [0u8; 64];
            let n = client.recv(&mut buf).unwrap();
            assert_eq!(n, 14);
            let reply = MsgHeader::read_from(&buf);
            assert_eq!(reply.sequence, 1);
            assert!(!reply.is_client());
            assert!(reply.is_pong_request());
            assert_eq!(&buf[HEADER_SIZE..14], &request(1, 14)[HEADER_SIZE..]);

            exit.store(true, Relaxed);
            let summary = handle.join().unwrap();
            assert_eq!(summary.received, 1);
            assert_eq!(summary.replied, 1);
        });
    }

    #[test]
    fn test_tcp_framing_and_echo_across_tiny_chunks() {
        let spec = SocketSpec::new(SockKind::Stream, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let listener = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let server_addr = listener.local_addr().unwrap();
        let mut registry = SocketRegistry::new();
        registry.register(listener);

        let cfg = test_config();
        let exit = AtomicBool::new(false);
        std::thread::scope(|s| {
            let handle = s.spawn(|| run(&cfg, registry, &exit).unwrap());

            let mut stream = std::net::TcpStream::connect(server_addr.to_string()).unwrap();
            stream
                .set_read_timeout(Some(std::time::Duration::from_secs(5)))
                .unwrap();

            // two back-to-back requests, written as 3/3/3/5 byte chunks
            let mut bytes = request(1, 14);
            bytes.extend_from_slice(&request(2, 14));
            for chunk in [&bytes[0..3], &bytes[3..6], &bytes[6..9], &bytes[9..14],
                          &bytes[14..17], &bytes[17..20], &bytes[20..23], &bytes[23..28]] {
                stream.write_all(chunk).unwrap();
                stream.flush().unwrap();
            }

            let mut replies = [0u8; 28];
            stream.read_exact(&mut replies).unwrap();
            let first = MsgHeader::read_from(&replies[..14]);
            let second = MsgHeader::read_from(&replies[14..]);
            assert_eq!(first.sequence, 1);
            assert_eq!(second.sequence, 2);
            assert!(!first.is_client() && !second.is_client());

            drop(stream);
            exit.store(true, Relaxed);
            let summary = handle.join().unwrap();
            assert_eq!(summary.received, 2);
            assert_eq!(summary.replied, 2);
            assert_eq!(summary.accepted, 1);
            assert_eq!(summary.gap_dropped, 0);
        });
    }

    #[test]
    fn test_dont_reply_swallows_requests() {
        let spec = SocketSpec::new(SockKind::Dgram, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let server_rec = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let server_addr = server_rec.local_addr().unwrap();
        let mut registry = SocketRegistry::new();
        registry.register(server_rec);

        let cfg = ServerConfig { dont_reply: true, ..test_config() };
        let exit = AtomicBool::new(false);
        std::thread::scope(|s| {
            let handle = s.spawn(|| run(&cfg, registry, &exit).unwrap());

            let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            client.connect(server_addr.to_string()).unwrap();
            client
                .set_read_timeout(Some(std::time::Duration::from_millis(300)))
                .unwrap();
            client.send(&request(1, 14)).unwrap();
            let mut buf = [0u8; 64];
            assert!(client.recv(&mut buf).is_err(), "no reply expected");

            exit.store(true, Relaxed);
            let summary = handle.join().unwrap();
            assert_eq!(summary.received, 1);
            assert_eq!(summary.replied, 0);
        });
    }

    #[test]
    fn test_non_client_traffic_is_dropped() {
        let cfg = test_config();
        let mut sessions = HashMap::new();
        let mut summary = ServerSummary::default();
        let mut scratch = [0u8; 64];
        let mut expected = None;
        // a server-flagged message must not be counted or echoed
        let mut msg = request(1, 14);
        let mut hdr = MsgHeader::read_from(&msg);
        hdr.set_server();
        hdr.write_to(&mut msg);
        let group = PeerAddr::V4("127.0.0.1:1".parse().unwrap());
        let action = on_message(
            &cfg, -1, SockKind::Dgram, false, &group, None, &mut expected, &mut sessions,
            &mut summary, &mut scratch, &hdr, &msg,
        );
        assert!(matches!(action, MessageAction::Continue));
        assert_eq!(summary.received, 0);
    }
}
