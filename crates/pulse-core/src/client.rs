//! Client role: paced probe generation and reply correlation.
//!
//! One thread does everything: it paces sends over the descriptor ring,
//! stamps tx times for every `reply_every`-th sequence, and drains replies
//! between cycles; there is no background reply thread. Warm-up and
//! cool-down windows bracket the measured interval; messages sent inside
//! them carry the `WARMUP` flag and never touch the timestamp tables.
//!
//! Replying servers are identified by source address and assigned a dense
//! index on first contact; the assignment never changes afterwards, so
//! per-server slots in `PacketTimes` stay stable even when replies from
//! different servers interleave out of order.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

use crate::addr::{PeerAddr, SockKind};
use crate::error::{PulseError, Result};
use crate::message::{Message, MsgHeader, MsgLimits, HEADER_SIZE};
use crate::mux::{IoMux, MuxKind};
use crate::packet_times::{ArrivalErrors, PacketTimes};
use crate::pacing::{CycleScheduler, RunLength};
use crate::parser::{LengthMode, MessageParser};
use crate::playback::PlaybackItem;
use crate::registry::{recv_into, send_message, RecvOutcome, SendOutcome, SocketRecord, SocketRegistry};
use crate::ticks::{TicksDuration, TicksTime};

/// Floor of the warm-up window; the effective duration also scales with the
/// descriptor count and multicast TTL so switches have time to learn every
/// group.
pub const TEST_START_WARMUP_MSEC: u64 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    /// Paced stream of requests with pong sampling every `reply_every`.
    UnderLoad,
    /// Strict lock-step: one request in flight, block until its reply.
    PingPong,
    /// Under-load with a reply_every large enough to make sampling free.
    Throughput,
    /// Walk a precomputed `(delay, size)` schedule.
    Playback,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub mode: ClientMode,
    pub limits: MsgLimits,
    pub msg_size: usize,
    /// None means maximum rate.
    pub mps: Option<u32>,
    pub burst_size: u64,
    pub reply_every: u64,
    pub run: RunLength,
    pub do_warmup: bool,
    pub cooldown_msec: u64,
    /// Skip sends that would block instead of waiting them out.
    pub nonblocked_send: bool,
    /// Verify reply payloads byte-for-byte against what was sent.
    pub data_integrity: bool,
    pub dummy_mps: Option<u32>,
    pub mux: MuxKind,
    /// Multiplexer liveness timeout in milliseconds.
    pub timeout_msec: i64,
    /// Ping-pong gives up after this long without the awaited reply.
    pub reply_timeout_msec: u64,
    pub num_servers: usize,
    pub mc_ttl: u32,
    pub seed: u64,
}

#[derive(Debug, Default, Clone)]
struct ClientCounters {
    sent: u64,
    /// Non-warm-up sends, the ones a number-based run counts.
    counted_sent: u64,
    /// Non-warm-up sends that carried PONG_REQUEST.
    pong_sent: u64,
    received: u64,
    skipped: u64,
    bad_headers: u64,
    integrity_errors: u64,
    dummy_sent: u64,
}

pub struct ClientSummary {
    pub sent: u64,
    pub received: u64,
    pub skipped: u64,
    pub bad_headers: u64,
    pub integrity_errors: u64,
    pub dummy_sent: u64,
    /// Measured main window, warm-up and cool-down excluded.
    pub duration: TicksDuration,
    /// Replying servers in first-contact order with their arrival errors.
    pub servers: Vec<(PeerAddr, ArrivalErrors)>,
    /// The raw per-sequence timestamp tables.
    pub times: PacketTimes,
}

enum SendResult {
    Sent { pong: bool },
    Skipped,
    FdClosed,
    /// The sequence space is exhausted; the run must stop.
    Exhausted,
}

// ---------------------------------------------------------------------------
// Reply accounting
// ---------------------------------------------------------------------------

fn assign_server_ix(
    server_map: &mut HashMap<PeerAddr, usize>,
    server_addrs: &mut Vec<PeerAddr>,
    num_servers: usize,
    src: &PeerAddr,
) -> Option<usize> {
    if let Some(&ix) = server_map.get(src) {
        return Some(ix);
    }
    if server_map.len() >= num_servers {
        tracing::warn!(src = %src, "reply from more servers than expected, ignoring");
        return None;
    }
    let ix = server_map.len();
    server_map.insert(src.clone(), ix);
    server_addrs.push(src.clone());
    Some(ix)
}

#[allow(clippy::too_many_arguments)]
fn on_reply(
    reply_every: u64,
    data_integrity: bool,
    num_servers: usize,
    times: &mut PacketTimes,
    server_map: &mut HashMap<PeerAddr, usize>,
    server_addrs: &mut Vec<PeerAddr>,
    last_rx_seq: &mut [u64],
    counters: &mut ClientCounters,
    last_reply_seq: &mut u64,
    expected_payload: &[u8],
    hdr: &MsgHeader,
    data: &[u8],
    src: &PeerAddr,
    now: TicksTime,
) {
    if hdr.is_client() {
        // Our own multicast loopback, not a reply.
        return;
    }
    // The lock-step correlator advances on every reply, warm-up included.
    if hdr.sequence > *last_reply_seq {
        *last_reply_seq = hdr.sequence;
    }
    if hdr.is_warmup() {
        return;
    }
    counters.received += 1;

    if data_integrity && data.len() > HEADER_SIZE {
        let body = &data[HEADER_SIZE..];
        if body != &expected_payload[..body.len()] {
            counters.integrity_errors += 1;
        }
    }

    let Some(ix) = assign_server_ix(server_map, server_addrs, num_servers, src) else {
        return;
    };
    if hdr.sequence % reply_every != 0 {
        // No slot was allocated for this sequence.
        return;
    }
    if hdr.sequence < last_rx_seq[ix] {
        times.inc_ooo(ix);
    } else {
        last_rx_seq[ix] = hdr.sequence;
    }
    let _ = times.set_rx_time(hdr.sequence, ix, now);
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client<'a> {
    cfg: &'a ClientConfig,
    exit: &'a AtomicBool,
    registry: SocketRegistry,
    mux: IoMux,
    times: PacketTimes,
    msg: Message,
    /// Precomputed send destination per descriptor (None for connected
    /// stream sockets).
    dests: HashMap<RawFd, Option<socket2::SockAddr>>,
    server_map: HashMap<PeerAddr, usize>,
    server_addrs: Vec<PeerAddr>,
    last_rx_seq: Vec<u64>,
    counters: ClientCounters,
    next_seq: u64,
    last_reply_seq: u64,
    cur_fd: RawFd,
    ready_buf: Vec<RawFd>,
}

impl<'a> Client<'a> {
    pub fn new(cfg: &'a ClientConfig, registry: SocketRegistry, exit: &'a AtomicBool) -> Result<Self> {
        let Some(head) = registry.head() else {
            return Err(PulseError::BadArgument("no sockets prepared".into()));
        };
        let mut mux = IoMux::new(cfg.mux)?;
        let mut dests = HashMap::new();
        for fd in registry.iter_fds().collect::<Vec<_>>() {
            mux.add(fd)?;
            let rec = registry.get(fd).expect("fd just listed");
            let dest = match rec.kind {
                SockKind::Stream => None,
                SockKind::Dgram => Some(rec.peer.to_sock_addr()?),
            };
            dests.insert(fd, dest);
        }
        let times = PacketTimes::new(cfg.limits.max_seq_no, cfg.reply_every, cfg.num_servers)?;
        let msg = Message::new(&cfg.limits, cfg.msg_size, cfg.seed)?;
        Ok(Client {
            cfg,
            exit,
            registry,
            mux,
            times,
            msg,
            dests,
            server_map: HashMap::new(),
            server_addrs: Vec::new(),
            last_rx_seq: vec![0; cfg.num_servers],
            counters: ClientCounters::default(),
            next_seq: 0,
            last_reply_seq: 0,
            cur_fd: head,
            ready_buf: Vec::new(),
        })
    }

    fn exiting(&self) -> bool {
        self.exit.load(Relaxed)
    }

    /// Warm-up window: spec'd floor, widened per descriptor by the multicast
    /// TTL so every switch on the path can learn the groups.
    fn warmup_duration(&self) -> TicksDuration {
        let ttl = u64::from(self.cfg.mc_ttl);
        let scaled = ttl + self.registry.len() as u64 * ttl;
        TicksDuration::from_msec(TEST_START_WARMUP_MSEC.max(scaled) as i64)
    }

    fn advance_ring(&mut self) -> RawFd {
        let fd = self.cur_fd;
        self.cur_fd = self.registry.next_fd(fd);
        fd
    }

    fn close_fd(&mut self, fd: RawFd) -> Result<()> {
        if self.cur_fd == fd {
            self.cur_fd = self.registry.next_fd(fd);
        }
        let _ = self.mux.remove(fd);
        self.registry.deregister(fd);
        tracing::warn!(fd, "peer went away, descriptor retired");
        if self.registry.is_empty() {
            return Err(PulseError::socket_err(
                "all connections lost",
                std::io::Error::from_raw_os_error(libc::EPIPE),
            ));
        }
        Ok(())
    }

    /// Build and send one probe on `fd`. Allocates the next sequence number;
    /// every `reply_every`-th sequence requests a pong and records its tx
    /// time (warm-up sends keep the pong for lock-step but stay out of the
    /// tables).
    fn send_one(&mut self, fd: RawFd, warmup: bool) -> Result<SendResult> {
        if self.next_seq >= self.cfg.limits.max_seq_no {
            tracing::warn!("sequence space exhausted, ending run");
            return Ok(SendResult::Exhausted);
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        let pong = seq % self.cfg.reply_every == 0;

        self.msg.set_sequence(seq);
        let h = self.msg.header_mut();
        h.set_client();
        if pong {
            h.set_pong_request();
        } else {
            h.clear_pong_request();
        }
        if warmup {
            h.set_warmup();
        } else {
            h.clear_warmup();
        }

        if pong && !warmup {
            self.times.set_tx_time(seq)?;
        }
        let wire = self.msg.wire();
        let dest = self.dests.get(&fd).and_then(|d| d.as_ref());
        match send_message(fd, wire, dest, self.cfg.nonblocked_send) {
            SendOutcome::Sent => {
                self.counters.sent += 1;
                if !warmup {
                    self.counters.counted_sent += 1;
                    if pong {
                        self.counters.pong_sent += 1;
                    }
                }
                Ok(SendResult::Sent { pong })
            }
            SendOutcome::WouldBlock => {
                self.counters.skipped += 1;
                if pong && !warmup {
                    self.times.clear_tx_time(seq)?;
                }
                if !self.cfg.nonblocked_send {
                    tracing::debug!(fd, seq, "send would block, skipped");
                }
                Ok(SendResult::Skipped)
            }
            SendOutcome::Shutdown => {
                self.close_fd(fd)?;
                Ok(SendResult::FdClosed)
            }
        }
    }

    /// One multiplexer pass: receive once from every ready descriptor and
    /// feed complete replies to the correlator.
    fn drain_replies(&mut self, timeout_msec: i64) -> Result<()> {
        let Self { mux, ready_buf, .. } = self;
        ready_buf.clear();
        ready_buf.extend_from_slice(mux.wait(timeout_msec)?);
        for i in 0..self.ready_buf.len() {
            let fd = self.ready_buf[i];
            self.recv_one(fd)?;
        }
        Ok(())
    }

    fn recv_one(&mut self, fd: RawFd) -> Result<()> {
        let Some(rec) = self.registry.get_mut(fd) else {
            return Ok(());
        };
        let kind = rec.kind;
        let peer = rec.peer.clone();
        let (n, from) = match recv_into(rec) {
            RecvOutcome::Data { len, from } => (len, from),
            RecvOutcome::WouldBlock | RecvOutcome::Interrupted => return Ok(()),
            RecvOutcome::Shutdown => {
                if kind == SockKind::Stream {
                    self.close_fd(fd)?;
                }
                return Ok(());
            }
        };
        let src = match kind {
            SockKind::Stream => peer,
            SockKind::Dgram => match from {
                Some(p) => p,
                None => peer,
            },
        };
        let mode = match kind {
            SockKind::Dgram => LengthMode::Datagram,
            SockKind::Stream => LengthMode::Stream(self.cfg.msg_size),
        };
        let parser = MessageParser::new(self.cfg.limits, mode);
        let now = TicksTime::now();

        let Self {
            cfg,
            registry,
            times,
            server_map,
            server_addrs,
            last_rx_seq,
            counters,
            last_reply_seq,
            msg,
            exit,
            ..
        } = self;
        let rec = registry.get_mut(fd).expect("record vanished mid-read");
        let SocketRecord { recv, .. } = rec;
        let expected_payload = msg.payload();

        let sum = parser.process_received(recv, n, &mut |hdr: &MsgHeader, data: &[u8]| {
            on_reply(
                cfg.reply_every,
                cfg.data_integrity,
                cfg.num_servers,
                times,
                server_map,
                server_addrs,
                last_rx_seq,
                counters,
                last_reply_seq,
                expected_payload,
                hdr,
                data,
                &src,
                now,
            );
            !exit.load(Relaxed)
        });
        self.counters.bad_headers += u64::from(sum.bad_headers);
        Ok(())
    }

    /// Send a couple of warm-up messages on every multicast descriptor so
    /// the fabric learns the groups before measurement starts.
    fn multicast_warmup_burst(&mut self) -> Result<()> {
        let fds: Vec<RawFd> = self.registry.iter_fds().collect();
        for fd in fds {
            let is_mc = self.registry.get(fd).map(|r| r.is_multicast).unwrap_or(false);
            if !is_mc {
                continue;
            }
            for _ in 0..2 {
                if let SendResult::Exhausted = self.send_one(fd, true)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Number-based runs finish when the target is reached.
    fn count_done(&self) -> bool {
        match self.cfg.run {
            RunLength::Count(n) => self.counters.counted_sent >= n,
            RunLength::Time(_) => false,
        }
    }

    fn run_under_load(&mut self) -> Result<TicksDuration> {
        let mut scheduler =
            CycleScheduler::new(self.cfg.burst_size, self.cfg.mps, self.cfg.dummy_mps)?;
        let start = TicksTime::now();
        let warmup_end = match (self.cfg.run, self.cfg.do_warmup) {
            (RunLength::Time(_), true) => start + self.warmup_duration(),
            _ => start,
        };
        let test_end = match self.cfg.run {
            RunLength::Time(secs) => Some(warmup_end + TicksDuration::from_seconds(secs as f64)),
            RunLength::Count(_) => None,
        };
        let cooldown_end =
            test_end.map(|t| t + TicksDuration::from_msec(self.cfg.cooldown_msec as i64));
        scheduler.restart(start);

        // Dummy sends keep the egress path warm between cycles; they are
        // zero-accounting fire-and-forget writes on the ring head.
        let dummy_fd = self.cur_fd;
        let dummy_dest = self.dests.get(&dummy_fd).and_then(|d| d.clone());
        let mut dummy_wire = {
            let mut h = MsgHeader::new(1);
            h.set_client();
            h.set_warmup();
            let mut buf = vec![0u8; HEADER_SIZE];
            h.write_to(&mut buf);
            buf
        };
        dummy_wire.resize(self.cfg.msg_size.min(self.cfg.limits.max_size), 0);
        let mut dummy_count = 0u64;

        'outer: loop {
            let exit_flag = self.exit;
            if !scheduler.wait_cycle(exit_flag, || {
                dummy_count += 1;
                let _ = send_message(dummy_fd, &dummy_wire, dummy_dest.as_ref(), true);
            }) {
                break;
            }
            let now = TicksTime::now();
            if let Some(end) = cooldown_end {
                if now >= end {
                    break;
                }
            }
            let warmup_flag = now < warmup_end || test_end.map(|t| now >= t).unwrap_or(false);

            for _ in 0..self.cfg.burst_size {
                let fd = self.advance_ring();
                match self.send_one(fd, warmup_flag)? {
                    SendResult::Exhausted => break 'outer,
                    SendResult::FdClosed | SendResult::Skipped | SendResult::Sent { .. } => {}
                }
                if self.count_done() {
                    break 'outer;
                }
            }
            scheduler.advance(now);
            self.drain_replies(0)?;
        }
        self.counters.dummy_sent = dummy_count;
        let measured_end = TicksTime::now();
        let measured_start = warmup_end.min(measured_end);
        Ok(test_end.map(|t| t.min(measured_end) - measured_start).unwrap_or(measured_end - measured_start))
    }

    fn run_ping_pong(&mut self) -> Result<TicksDuration> {
        let start = TicksTime::now();
        let warmup_end = match (self.cfg.run, self.cfg.do_warmup) {
            (RunLength::Time(_), true) => start + self.warmup_duration(),
            _ => start,
        };
        let test_end = match self.cfg.run {
            RunLength::Time(secs) => Some(warmup_end + TicksDuration::from_seconds(secs as f64)),
            RunLength::Count(_) => None,
        };
        let reply_timeout = TicksDuration::from_msec(self.cfg.reply_timeout_msec as i64);

        loop {
            if self.exiting() || self.count_done() {
                break;
            }
            let now = TicksTime::now();
            if let Some(end) = test_end {
                if now >= end {
                    break;
                }
            }
            let warmup_flag = now < warmup_end;

            let fd = self.advance_ring();
            let sent = match self.send_one(fd, warmup_flag)? {
                SendResult::Exhausted => break,
                SendResult::Sent { pong } => pong,
                SendResult::Skipped | SendResult::FdClosed => false,
            };
            if !sent {
                continue;
            }

            // Lock-step: block until the reply for this sequence (or any
            // later one) has been seen.
            let target = self.next_seq;
            let deadline = TicksTime::now() + reply_timeout;
            while self.last_reply_seq < target {
                if self.exiting() {
                    return Ok(TicksTime::now() - warmup_end);
                }
                self.drain_replies(self.cfg.timeout_msec)?;
                if self.last_reply_seq < target && TicksTime::now() >= deadline {
                    return Err(PulseError::Timeout(format!(
                        "no reply for sequence {} within {} ms",
                        target, self.cfg.reply_timeout_msec
                    )));
                }
            }
        }
        let end = TicksTime::now();
        Ok(test_end.map(|t| t.min(end)).unwrap_or(end) - warmup_end.min(end))
    }

    fn run_playback(&mut self, schedule: &[PlaybackItem]) -> Result<TicksDuration> {
        let start = TicksTime::now();
        let mut send_time = start;
        for item in schedule {
            if self.exiting() {
                break;
            }
            send_time += item.delay;
            sleep_until(send_time, self.exit);
            self.msg.set_len(item.size)?;
            let fd = self.advance_ring();
            if let SendResult::Exhausted = self.send_one(fd, false)? {
                break;
            }
            self.drain_replies(0)?;
        }
        Ok(TicksTime::now() - start)
    }

    /// Cool-down: flush a final burst (load modes only; lock-step leaves
    /// nothing queued) and give in-flight replies a bounded window to land.
    fn finish(&mut self) -> Result<()> {
        if matches!(self.cfg.mode, ClientMode::UnderLoad | ClientMode::Throughput) {
            let fds: Vec<RawFd> = self.registry.iter_fds().collect();
            for fd in fds {
                let _ = self.send_one(fd, true);
            }
        }
        let deadline =
            TicksTime::now() + TicksDuration::from_msec(self.cfg.cooldown_msec as i64);
        let expected = self.counters.pong_sent * self.cfg.num_servers as u64;
        while TicksTime::now() < deadline && !self.exiting() {
            if self.counters.received >= expected {
                break;
            }
            self.drain_replies(self.cfg.timeout_msec)?;
        }
        Ok(())
    }

    fn into_summary(self, duration: TicksDuration) -> ClientSummary {
        let servers = self
            .server_addrs
            .iter()
            .enumerate()
            .map(|(ix, addr)| (addr.clone(), self.times.errors(ix)))
            .collect();
        ClientSummary {
            sent: self.counters.sent,
            received: self.counters.received,
            skipped: self.counters.skipped,
            bad_headers: self.counters.bad_headers,
            integrity_errors: self.counters.integrity_errors,
            dummy_sent: self.counters.dummy_sent,
            duration,
            servers,
            times: self.times,
        }
    }
}

fn sleep_until(t: TicksTime, exit: &AtomicBool) {
    loop {
        let now = TicksTime::now();
        if now >= t || exit.load(Relaxed) {
            return;
        }
        let left = t - now;
        if left > TicksDuration::from_msec(1) {
            std::thread::sleep(std::time::Duration::from_nanos(
                (left - TicksDuration::from_msec(1)).to_nsec() as u64,
            ));
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Run the client over a prepared registry. `schedule` is required for
/// playback mode and ignored otherwise.
pub fn run(
    cfg: &ClientConfig,
    registry: SocketRegistry,
    schedule: Option<&[PlaybackItem]>,
    exit: &AtomicBool,
) -> Result<ClientSummary> {
    let mut client = Client::new(cfg, registry, exit)?;
    if cfg.do_warmup {
        client.multicast_warmup_burst()?;
    }
    let duration = match cfg.mode {
        ClientMode::UnderLoad | ClientMode::Throughput => client.run_under_load()?,
        ClientMode::PingPong => client.run_ping_pong()?,
        ClientMode::Playback => {
            let schedule = schedule.ok_or_else(|| {
                PulseError::BadArgument("playback mode needs a schedule".into())
            })?;
            client.run_playback(schedule)?
        }
    };
    client.finish()?;
    tracing::info!(
        sent = client.counters.sent,
        received = client.counters.received,
        skipped = client.counters.skipped,
        "client run complete"
    );
    Ok(client.into_summary(duration))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::SocketSpec;
    use crate::message::FLAG_PONG_REQUEST;
    use crate::registry::{prepare_socket, Role, SocketOptions};
    use crate::server;

    fn limits() -> MsgLimits {
        MsgLimits::new(64, 10_000).unwrap()
    }

    fn base_config(mode: ClientMode, run: RunLength) -> ClientConfig {
        ClientConfig {
            mode,
            limits: limits(),
            msg_size: 14,
            mps: Some(10_000),
            burst_size: 1,
            reply_every: 1,
            run,
            do_warmup: false,
            cooldown_msec: 500,
            nonblocked_send: false,
            data_integrity: true,
            dummy_mps: None,
            mux: MuxKind::Poll,
            timeout_msec: 10,
            reply_timeout_msec: 5_000,
            num_servers: 1,
            mc_ttl: 2,
            seed: 1,
        }
    }

    fn udp_server_registry() -> (SocketRegistry, PeerAddr) {
        let spec = SocketSpec::new(SockKind::Dgram, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let rec = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let addr = rec.local_addr().unwrap();
        let mut reg = SocketRegistry::new();
        reg.register(rec);
        (reg, addr)
    }

    fn client_registry(target: &PeerAddr, kind: SockKind) -> SocketRegistry {
        let spec = SocketSpec::new(kind, target.clone());
        let rec = prepare_socket(&spec, &SocketOptions::default(), Role::Client, 64).unwrap();
        let mut reg = SocketRegistry::new();
        reg.register(rec);
        reg
    }

    fn echo_server_config() -> server::ServerConfig {
        server::ServerConfig {
            limits: limits(),
            msg_size: 14,
            mux: MuxKind::Poll,
            timeout_msec: 10,
            threads: 1,
            dont_reply: false,
            bridge: false,
            force_unicast_reply: false,
            mc_loopback_diag: false,
            detect_gaps: false,
            activity_every: None,
            inherit_opts: SocketOptions::default(),
        }
    }

    #[test]
    fn test_udp_ping_pong_single_message() {
        // One 14-byte ping-pong exchange over loopback UDP: exactly one tx
        // and one rx stamp, no duplicates.
        let (server_reg, server_addr) = udp_server_registry();
        let server_cfg = echo_server_config();
        let server_exit = AtomicBool::new(false);

        std::thread::scope(|s| {
            let server = s.spawn(|| server::run(&server_cfg, server_reg, &server_exit).unwrap());

            let cfg = base_config(ClientMode::PingPong, RunLength::Count(1));
            let client_reg = client_registry(&server_addr, SockKind::Dgram);
            let exit = AtomicBool::new(false);
            let summary = run(&cfg, client_reg, None, &exit).unwrap();

            assert_eq!(summary.sent, 1);
            assert_eq!(summary.received, 1);
            assert_eq!(summary.skipped, 0);
            assert_eq!(summary.integrity_errors, 0);
            assert_eq!(summary.servers.len(), 1);
            assert_eq!(summary.servers[0].1.duplicates, 0);

            let mut samples = 0;
            summary.times.for_each_sample(|seq, tx, rx| {
                assert_eq!(seq, 1);
                assert!(!tx.is_zero());
                assert!(!rx[0].is_zero());
                assert!(rx[0] >= tx);
                samples += 1;
            });
            assert_eq!(samples, 1);

            server_exit.store(true, Relaxed);
            let ssum = server.join().unwrap();
            assert_eq!(ssum.received, 1);
        });
    }

    #[test]
    fn test_tcp_ping_pong_run() {
        let spec = SocketSpec::new(SockKind::Stream, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let rec = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let server_addr = rec.local_addr().unwrap();
        let mut server_reg = SocketRegistry::new();
        server_reg.register(rec);
        let server_cfg = echo_server_config();
        let server_exit = AtomicBool::new(false);

        std::thread::scope(|s| {
            let server = s.spawn(|| server::run(&server_cfg, server_reg, &server_exit).unwrap());

            let cfg = base_config(ClientMode::PingPong, RunLength::Count(10));
            let client_reg = client_registry(&server_addr, SockKind::Stream);
            let exit = AtomicBool::new(false);
            let summary = run(&cfg, client_reg, None, &exit).unwrap();

            assert_eq!(summary.sent, 10);
            assert_eq!(summary.received, 10);
            let mut rtts = 0;
            summary.times.for_each_sample(|_, tx, rx| {
                assert!(rx[0] >= tx);
                rtts += 1;
            });
            assert_eq!(rtts, 10);

            server_exit.store(true, Relaxed);
            server.join().unwrap();
        });
    }

    #[test]
    fn test_under_load_samples_every_nth() {
        let (server_reg, server_addr) = udp_server_registry();
        let server_cfg = echo_server_config();
        let server_exit = AtomicBool::new(false);

        std::thread::scope(|s| {
            let server = s.spawn(|| server::run(&server_cfg, server_reg, &server_exit).unwrap());

            let mut cfg = base_config(ClientMode::UnderLoad, RunLength::Count(100));
            cfg.reply_every = 10;
            let client_reg = client_registry(&server_addr, SockKind::Dgram);
            let exit = AtomicBool::new(false);
            let summary = run(&cfg, client_reg, None, &exit).unwrap();

            assert_eq!(summary.sent, 100 + 1);
            // only 1-in-10 sequences carry a pong and own a table block
            let mut samples = 0;
            summary.times.for_each_sample(|seq, _, _| {
                assert_eq!(seq % 10, 0);
                samples += 1;
            });
            assert_eq!(samples, 10);
            assert_eq!(summary.received, 10);

            server_exit.store(true, Relaxed);
            server.join().unwrap();
        });
    }

    #[test]
    fn test_duplicate_reply_counts_once() {
        // A hand-rolled echo that answers every request twice: the client
        // must keep the first rx stamp and count one duplicate.
        let echo = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        echo.set_read_timeout(Some(std::time::Duration::from_secs(5))).unwrap();
        let echo_addr = PeerAddr::V4(match echo.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        });

        std::thread::scope(|s| {
            s.spawn(|| {
                let mut buf = [0u8; 64];
                let (n, peer) = echo.recv_from(&mut buf).unwrap();
                let mut hdr = MsgHeader::read_from(&buf);
                hdr.set_server();
                hdr.write_to(&mut buf);
                echo.send_to(&buf[..n], peer).unwrap();
                echo.send_to(&buf[..n], peer).unwrap();
            });

            let mut cfg = base_config(ClientMode::UnderLoad, RunLength::Count(1));
            cfg.cooldown_msec = 1_000;
            // expect two servers so the drain waits for both copies
            cfg.num_servers = 2;
            let client_reg = client_registry(&echo_addr, SockKind::Dgram);
            let exit = AtomicBool::new(false);
            let summary = run(&cfg, client_reg, None, &exit).unwrap();

            assert_eq!(summary.received, 2);
            assert_eq!(summary.servers.len(), 1);
            assert_eq!(summary.servers[0].1.duplicates, 1);
            let mut samples = 0;
            summary.times.for_each_sample(|_, _, rx| {
                assert!(!rx[0].is_zero());
                assert!(rx[1].is_zero());
                samples += 1;
            });
            assert_eq!(samples, 1);
        });
    }

    #[test]
    fn test_skipped_send_clears_tx_slot() {
        // Fill a tiny non-blocking TCP send buffer against a peer that never
        // reads: once sends start skipping, every skipped pong slot must be
        // zero again.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = PeerAddr::V4(match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        });

        let spec = SocketSpec::new(SockKind::Stream, target);
        let opts = SocketOptions {
            nonblocking: true,
            buffer_size: Some(4096),
            ..Default::default()
        };
        let rec = prepare_socket(&spec, &opts, Role::Client, 1024).unwrap();
        let (_peer, _) = listener.accept().unwrap();
        let mut reg = SocketRegistry::new();
        reg.register(rec);

        let mut cfg = base_config(ClientMode::UnderLoad, RunLength::Count(5_000));
        cfg.limits = MsgLimits::new(1024, 10_000).unwrap();
        cfg.msg_size = 1024;
        cfg.mps = None;
        cfg.nonblocked_send = true;
        cfg.cooldown_msec = 0;
        let exit = AtomicBool::new(false);
        let cfg2 = cfg.clone();
        let mut client = Client::new(&cfg2, reg, &exit).unwrap();
        let mut skipped_seqs = Vec::new();
        for _ in 0..5_000 {
            let fd = client.advance_ring();
            let seq = client.next_seq + 1;
            match client.send_one(fd, false).unwrap() {
                SendResult::Skipped => skipped_seqs.push(seq),
                SendResult::Sent { .. } => {}
                _ => break,
            }
            if skipped_seqs.len() >= 3 {
                break;
            }
        }
        assert!(!skipped_seqs.is_empty(), "send buffer never filled");
        assert_eq!(client.counters.skipped as usize, skipped_seqs.len());
        for seq in skipped_seqs {
            assert!(client.times.tx_time(seq).unwrap().is_zero());
        }
    }

    #[test]
    fn test_reply_accounting_ignores_own_loopback_and_warmup() {
        let cfg = base_config(ClientMode::UnderLoad, RunLength::Count(1));
        let mut times = PacketTimes::new(100, 1, 1).unwrap();
        let mut map = HashMap::new();
        let mut addrs = Vec::new();
        let mut last_rx = vec![0u64];
        let mut counters = ClientCounters::default();
        let mut last_reply = 0u64;
        let payload = vec![0x5a; 52];
        let src = PeerAddr::V4("127.0.0.1:1000".parse().unwrap());

        let mut data = vec![0x5a; 14];
        // our own multicast loopback: CLIENT still set
        let mut hdr = MsgHeader { sequence: 3, flags: FLAG_PONG_REQUEST };
        hdr.set_client();
        hdr.write_to(&mut data);
        on_reply(1, false, 1, &mut times, &mut map, &mut addrs, &mut last_rx, &mut counters,
                 &mut last_reply, &payload, &hdr, &data, &src, TicksTime::now());
        assert_eq!(counters.received, 0);
        assert_eq!(last_reply, 0);

        // warm-up reply: advances the correlator but not the stats
        let mut hdr = MsgHeader { sequence: 4, flags: FLAG_PONG_REQUEST };
        hdr.set_warmup();
        hdr.write_to(&mut data);
        on_reply(1, false, 1, &mut times, &mut map, &mut addrs, &mut last_rx, &mut counters,
                 &mut last_reply, &payload, &hdr, &data, &src, TicksTime::now());
        assert_eq!(counters.received, 0);
        assert_eq!(last_reply, 4);
        assert!(times.rx_time(4, 0).unwrap().is_zero());

        // real reply
        let hdr = MsgHeader { sequence: 5, flags: FLAG_PONG_REQUEST };
        hdr.write_to(&mut data);
        on_reply(1, false, 1, &mut times, &mut map, &mut addrs, &mut last_rx, &mut counters,
                 &mut last_reply, &payload, &hdr, &data, &src, TicksTime::now());
        assert_eq!(counters.received, 1);
        assert!(!times.rx_time(5, 0).unwrap().is_zero());
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn test_out_of_order_reply_detection() {
        let mut times = PacketTimes::new(100, 1, 1).unwrap();
        let mut map = HashMap::new();
        let mut addrs = Vec::new();
        let mut last_rx = vec![0u64];
        let mut counters = ClientCounters::default();
        let mut last_reply = 0u64;
        let payload = vec![0u8; 52];
        let src = PeerAddr::V4("127.0.0.1:1000".parse().unwrap());
        let mut data = vec![0u8; 14];

        for seq in [5u64, 7, 6] {
            let hdr = MsgHeader { sequence: seq, flags: FLAG_PONG_REQUEST };
            hdr.write_to(&mut data);
            on_reply(1, false, 1, &mut times, &mut map, &mut addrs, &mut last_rx, &mut counters,
                     &mut last_reply, &payload, &hdr, &data, &src, TicksTime::now());
        }
        assert_eq!(times.errors(0).ooo, 1);
        assert_eq!(counters.received, 3);
    }
}
