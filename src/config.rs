//! Translation of CLI arguments and feedfiles into engine configuration.
//!
//! The feedfile is UTF-8 text, one target per non-blank non-`#` line:
//!
//! ```text
//! entry := proto? addr ":" port ( ":" mc_source )?
//!        | proto? path
//! proto := "U:" | "u:" | "T:" | "t:"        # U/u datagram, T/t stream
//! addr  := hostname | ipv4 | "[" ipv6 "]"
//! path  := absolute filesystem path
//! ```
//!
//! Duplicate `(proto, family, port)` triples fold onto one socket as extra
//! multicast memberships; see `pulse_core::addr::group_entries`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use pulse_core::addr::{
    group_entries, is_unix_path, resolve_host, FeedEntry, McIface, PeerAddr, SockKind, SocketSpec,
};
use pulse_core::client::{ClientConfig, ClientMode};
use pulse_core::message::{MsgLimits, HEADER_SIZE};
use pulse_core::mux::MuxKind;
use pulse_core::pacing::RunLength;
use pulse_core::registry::SocketOptions;
use pulse_core::server::ServerConfig;
use pulse_core::{PulseError, Result};

use crate::cli::{ClientArgs, ServerArgs, SocketArgs};

/// Default paced message rate, used when `--mps` is absent in a paced mode.
const MPS_DEFAULT: u32 = 10_000;
/// Sampling stride forced by throughput mode so the timestamp table stays
/// within bounds at line rate.
const THROUGHPUT_REPLY_EVERY: u64 = 1 << 20;
/// Rate estimates used to size the sequence space of time-based runs.
const PINGPONG_RATE_ESTIMATE: u64 = 250_000;
const UNPACED_RATE_ESTIMATE: u64 = 4_000_000;

// ---------------------------------------------------------------------------
// Feedfile
// ---------------------------------------------------------------------------

pub fn parse_feed_line(line: &str, default_kind: SockKind) -> Result<FeedEntry> {
    let (kind, rest) = match line.get(..2) {
        Some("U:") | Some("u:") => (SockKind::Dgram, &line[2..]),
        Some("T:") | Some("t:") => (SockKind::Stream, &line[2..]),
        _ => (default_kind, line),
    };

    if is_unix_path(rest) {
        return Ok(FeedEntry { kind, addr: PeerAddr::Unix(PathBuf::from(rest)), mc_source: None });
    }

    let (host, tail) = if let Some(stripped) = rest.strip_prefix('[') {
        // bracketed IPv6 literal
        let close = stripped
            .find(']')
            .ok_or_else(|| PulseError::Incorrect(format!("unterminated '[' in '{}'", line)))?;
        let host = &stripped[..close];
        let tail = stripped[close + 1..]
            .strip_prefix(':')
            .ok_or_else(|| PulseError::Incorrect(format!("missing port in '{}'", line)))?;
        (host, tail)
    } else {
        rest.split_once(':')
            .ok_or_else(|| PulseError::Incorrect(format!("missing port in '{}'", line)))?
    };

    let (port_str, source_str) = match tail.split_once(':') {
        Some((p, s)) => (p, Some(s)),
        None => (tail, None),
    };
    let port: u16 = port_str
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| PulseError::Incorrect(format!("bad port in '{}'", line)))?;
    let mc_source = match source_str {
        None => None,
        Some(s) => Some(
            s.parse::<IpAddr>()
                .map_err(|_| PulseError::Incorrect(format!("bad source filter in '{}'", line)))?,
        ),
    };

    let addr = resolve_host(host, port)?;
    Ok(FeedEntry { kind, addr, mc_source })
}

pub fn load_feedfile(path: &Path, default_kind: SockKind) -> Result<Vec<FeedEntry>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| PulseError::NotExist(format!("feedfile {}: {}", path.display(), e)))?;
    let mut entries = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        entries.push(parse_feed_line(line, default_kind)?);
    }
    if entries.is_empty() {
        return Err(PulseError::Incorrect(format!(
            "feedfile {} holds no targets",
            path.display()
        )));
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Shared socket configuration
// ---------------------------------------------------------------------------

fn parse_mc_iface(s: &str) -> Result<McIface> {
    if let Ok(v4) = s.parse() {
        return Ok(McIface::V4(v4));
    }
    s.parse::<u32>()
        .map(McIface::V6Index)
        .map_err(|_| PulseError::BadArgument(format!("bad multicast interface '{}'", s)))
}

pub fn socket_options(socket: &SocketArgs, client: Option<&ClientArgs>) -> Result<SocketOptions> {
    let mut opts = SocketOptions {
        nonblocking: socket.nonblocked,
        buffer_size: socket.buffer_size,
        tcp_no_delay: !socket.tcp_avoid_nodelay,
        tos: socket.tos,
        lls_usec: socket.lls,
        rate_limit: socket.rate_limit,
        mc_ttl: socket.mc_ttl,
        mc_loopback: socket.mc_loopback_enable,
        mc_rx_if: socket.mc_rx_if.as_deref().map(parse_mc_iface).transpose()?,
        mc_tx_if: socket.mc_tx_if.as_deref().map(parse_mc_iface).transpose()?,
        ..Default::default()
    };
    if let Some(client) = client {
        opts.client_reuse_addr = client.uc_reuseaddr;
        if client.client_addr.is_some() || client.client_port.is_some() {
            let host = client.client_addr.as_deref().unwrap_or("0.0.0.0");
            let port = client.client_port.unwrap_or(0);
            opts.client_bind = Some(resolve_host(host, port)?);
        }
    }
    Ok(opts)
}

fn kind_of(socket: &SocketArgs) -> SockKind {
    if socket.tcp {
        SockKind::Stream
    } else {
        SockKind::Dgram
    }
}

/// Resolve the target set: a feedfile when given, otherwise the single
/// `-i/-p` pair. The server with neither binds the wildcard address.
pub fn build_specs(socket: &SocketArgs, server_side: bool) -> Result<Vec<SocketSpec>> {
    let kind = kind_of(socket);
    if let Some(path) = &socket.file {
        return Ok(group_entries(load_feedfile(path, kind)?));
    }
    let host = match (&socket.addr, server_side) {
        (Some(a), _) => a.clone(),
        (None, true) => "0.0.0.0".to_string(),
        (None, false) => {
            return Err(PulseError::BadArgument(
                "a target is required: -i/--addr or -f/--file".into(),
            ))
        }
    };
    let addr = resolve_host(&host, socket.port)?;
    let entry = FeedEntry { kind, addr, mc_source: socket.mc_source_filter };
    Ok(group_entries(vec![entry]))
}

fn mux_kind(socket: &SocketArgs) -> Result<MuxKind> {
    socket.fd_handler.parse()
}

fn seed_from_env() -> u64 {
    std::env::var("SEED").ok().and_then(|s| s.parse().ok()).unwrap_or(0x5eed)
}

fn check_msg_size(msg_size: usize) -> Result<()> {
    if msg_size < HEADER_SIZE {
        return Err(PulseError::BadArgument(format!(
            "message size {} below the {}-byte header",
            msg_size, HEADER_SIZE
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Client / server configs
// ---------------------------------------------------------------------------

/// Maximum payload the accumulators are sized for; a full UDP datagram.
pub const MAX_PAYLOAD: usize = 65_507;

fn parse_mps(client: &ClientArgs, mode: ClientMode) -> Result<Option<u32>> {
    match client.mps.as_deref() {
        Some("max") | Some("MAX") => Ok(None),
        Some(s) => s
            .parse::<u32>()
            .ok()
            .filter(|v| *v > 0)
            .map(Some)
            .ok_or_else(|| PulseError::BadArgument(format!("bad mps '{}'", s))),
        None => match mode {
            // ping-pong is lock-step, throughput runs unpaced
            ClientMode::PingPong | ClientMode::Throughput => Ok(None),
            _ => Ok(Some(MPS_DEFAULT)),
        },
    }
}

fn estimate_max_seq(run: RunLength, mps: Option<u32>, mode: ClientMode, fd_count: u64) -> u64 {
    // Warm-up bursts and the final flush also draw sequence numbers.
    let slack = 3 * fd_count + 64;
    match run {
        RunLength::Count(n) => n + slack,
        RunLength::Time(secs) => {
            let rate = match (mps, mode) {
                (Some(r), _) => u64::from(r),
                (None, ClientMode::PingPong) => PINGPONG_RATE_ESTIMATE,
                (None, _) => UNPACED_RATE_ESTIMATE,
            };
            // generous envelope: measured window plus warm-up and cool-down
            rate.saturating_mul(secs + 3).saturating_add(slack)
        }
    }
}

pub fn client_config(
    mode: ClientMode,
    socket: &SocketArgs,
    client: &ClientArgs,
    fd_count: usize,
) -> Result<ClientConfig> {
    check_msg_size(socket.msg_size)?;
    let mps = parse_mps(client, mode)?;
    let run = match client.number_of_packets {
        Some(n) if n > 0 => RunLength::Count(n),
        Some(_) => return Err(PulseError::BadArgument("number of packets is zero".into())),
        None => RunLength::Time(client.time),
    };
    let reply_every = match mode {
        ClientMode::PingPong => 1,
        ClientMode::Throughput => THROUGHPUT_REPLY_EVERY.max(client.reply_every),
        _ => client.reply_every.max(1),
    };
    let max_seq = estimate_max_seq(run, mps, mode, fd_count as u64);
    Ok(ClientConfig {
        mode,
        limits: MsgLimits::new(MAX_PAYLOAD.max(socket.msg_size), max_seq)?,
        msg_size: socket.msg_size,
        mps,
        burst_size: client.burst.max(1),
        reply_every,
        run,
        do_warmup: !client.dont_warmup,
        cooldown_msec: client.cooldown_msec,
        nonblocked_send: socket.nonblocked || socket.tcp_skip_blocking_send,
        data_integrity: client.data_integrity,
        dummy_mps: client.dummy_send,
        mux: mux_kind(socket)?,
        timeout_msec: socket.timeout,
        reply_timeout_msec: client.reply_timeout_msec,
        num_servers: fd_count.max(1),
        mc_ttl: socket.mc_ttl,
        seed: seed_from_env(),
    })
}

pub fn server_config(socket: &SocketArgs, server: &ServerArgs) -> Result<ServerConfig> {
    check_msg_size(socket.msg_size)?;
    Ok(ServerConfig {
        limits: MsgLimits::new(MAX_PAYLOAD.max(socket.msg_size), u64::MAX - 1)?,
        msg_size: socket.msg_size,
        mux: mux_kind(socket)?,
        timeout_msec: socket.timeout,
        threads: server.threads_num.max(1),
        dont_reply: server.dont_reply,
        bridge: server.bridge,
        force_unicast_reply: server.force_unicast_reply,
        mc_loopback_diag: socket.mc_loopback_enable,
        detect_gaps: server.gap_detection,
        activity_every: server.activity.filter(|n| *n > 0),
        inherit_opts: socket_options(socket, None)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_line_protocols() {
        let e = parse_feed_line("U:127.0.0.1:5001", SockKind::Stream).unwrap();
        assert_eq!(e.kind, SockKind::Dgram);
        assert_eq!(e.addr, PeerAddr::V4("127.0.0.1:5001".parse().unwrap()));

        let e = parse_feed_line("t:127.0.0.1:5001", SockKind::Dgram).unwrap();
        assert_eq!(e.kind, SockKind::Stream);

        // no prefix inherits the command-line transport
        let e = parse_feed_line("127.0.0.1:5001", SockKind::Stream).unwrap();
        assert_eq!(e.kind, SockKind::Stream);
    }

    #[test]
    fn test_feed_line_ipv6_and_unix() {
        let e = parse_feed_line("[::1]:5001", SockKind::Dgram).unwrap();
        assert_eq!(e.addr, PeerAddr::V6("[::1]:5001".parse().unwrap()));

        let e = parse_feed_line("/var/run/pulse.sock", SockKind::Dgram).unwrap();
        assert!(matches!(e.addr, PeerAddr::Unix(_)));

        let e = parse_feed_line("T:/var/run/pulse.sock", SockKind::Dgram).unwrap();
        assert_eq!(e.kind, SockKind::Stream);
        assert!(matches!(e.addr, PeerAddr::Unix(_)));
    }

    #[test]
    fn test_feed_line_source_filter() {
        let e = parse_feed_line("U:239.1.2.3:11111:10.0.0.5", SockKind::Dgram).unwrap();
        assert!(e.addr.is_multicast());
        assert_eq!(e.mc_source, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_feed_line_rejects_garbage() {
        assert!(parse_feed_line("127.0.0.1", SockKind::Dgram).is_err()); // no port
        assert!(parse_feed_line("127.0.0.1:0", SockKind::Dgram).is_err()); // port 0
        assert!(parse_feed_line("127.0.0.1:99999", SockKind::Dgram).is_err());
        assert!(parse_feed_line("[::1:5001", SockKind::Dgram).is_err()); // unterminated
        assert!(parse_feed_line("239.1.2.3:5001:not-an-ip", SockKind::Dgram).is_err());
    }

    #[test]
    fn test_mc_iface_parsing() {
        assert_eq!(parse_mc_iface("10.0.0.7").unwrap(), McIface::V4("10.0.0.7".parse().unwrap()));
        assert_eq!(parse_mc_iface("3").unwrap(), McIface::V6Index(3));
        assert!(parse_mc_iface("eth0").is_err());
    }

    #[test]
    fn test_throughput_forces_wide_sampling() {
        let socket = test_socket_args();
        let client = test_client_args();
        let cfg = client_config(ClientMode::Throughput, &socket, &client, 1).unwrap();
        assert_eq!(cfg.reply_every, THROUGHPUT_REPLY_EVERY);
        assert!(cfg.mps.is_none());

        let cfg = client_config(ClientMode::PingPong, &socket, &client, 1).unwrap();
        assert_eq!(cfg.reply_every, 1);
        assert!(cfg.mps.is_none());

        let cfg = client_config(ClientMode::UnderLoad, &socket, &client, 1).unwrap();
        assert_eq!(cfg.reply_every, 100);
        assert_eq!(cfg.mps, Some(MPS_DEFAULT));
    }

    #[test]
    fn test_count_run_sizes_sequence_space() {
        let socket = test_socket_args();
        let mut client = test_client_args();
        client.number_of_packets = Some(1_000);
        let cfg = client_config(ClientMode::UnderLoad, &socket, &client, 2).unwrap();
        assert_eq!(cfg.run, RunLength::Count(1_000));
        assert!(cfg.limits.max_seq_no > 1_000);
    }

    fn test_socket_args() -> SocketArgs {
        SocketArgs {
            addr: Some("127.0.0.1".into()),
            port: 11111,
            file: None,
            fd_handler: "epoll".into(),
            tcp: false,
            msg_size: 14,
            nonblocked: false,
            tcp_avoid_nodelay: false,
            tcp_skip_blocking_send: false,
            buffer_size: None,
            tos: None,
            lls: None,
            rate_limit: None,
            mc_rx_if: None,
            mc_tx_if: None,
            mc_source_filter: None,
            mc_loopback_enable: false,
            mc_ttl: 2,
            timeout: 10,
        }
    }

    fn test_client_args() -> ClientArgs {
        ClientArgs {
            mps: None,
            burst: 1,
            time: 1,
            number_of_packets: None,
            reply_every: 100,
            client_port: None,
            client_addr: None,
            uc_reuseaddr: false,
            dummy_send: None,
            no_rdtsc: false,
            data_integrity: false,
            dont_warmup: false,
            cooldown_msec: 500,
            reply_timeout_msec: 10_000,
            full_log: None,
        }
    }
}
