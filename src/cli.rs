//! CLI definitions for sockpulse.

use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "sockpulse",
    version,
    about = "Socket latency and throughput benchmark\n\nMeasure round-trip time under load, ping-pong latency, one-way throughput, or play back a recorded message stream over UDP, TCP, and UNIX-domain sockets.",
    long_about = None
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

/// Socket and transport options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct SocketArgs {
    /// Target host, IP, or UNIX-domain path (server: bind address)
    #[clap(short = 'i', long = "addr")]
    pub addr: Option<String>,

    /// UDP/TCP port
    #[clap(short = 'p', long, default_value = "11111")]
    pub port: u16,

    /// Feedfile with one [U:|T:]host:port[:mc_source] target per line
    #[clap(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Readiness back-end: recvfrom, select, poll, or epoll
    #[clap(short = 'F', long = "fd-handler", default_value = "epoll")]
    pub fd_handler: String,

    /// Use TCP instead of UDP
    #[clap(long)]
    pub tcp: bool,

    /// Message size in bytes, header included
    #[clap(short = 'm', long = "msg-size", default_value = "14")]
    pub msg_size: usize,

    /// Non-blocking sockets
    #[clap(long)]
    pub nonblocked: bool,

    /// Leave Nagle's algorithm enabled on TCP sockets
    #[clap(long)]
    pub tcp_avoid_nodelay: bool,

    /// Give up on TCP sends that keep blocking mid-message
    #[clap(long)]
    pub tcp_skip_blocking_send: bool,

    /// Socket send and receive buffer size in bytes
    #[clap(long)]
    pub buffer_size: Option<usize>,

    /// IP type-of-service byte
    #[clap(long)]
    pub tos: Option<u32>,

    /// Low-latency busy-poll budget in microseconds (SO_BUSY_POLL)
    #[clap(long)]
    pub lls: Option<u32>,

    /// Kernel egress pacing cap in bytes per second (SO_MAX_PACING_RATE)
    #[clap(long = "rate-limit")]
    pub rate_limit: Option<u32>,

    /// Multicast receive interface: IPv4 address or IPv6 interface index
    #[clap(long = "mc-rx-if")]
    pub mc_rx_if: Option<String>,

    /// Multicast transmit interface: IPv4 address or IPv6 interface index
    #[clap(long = "mc-tx-if")]
    pub mc_tx_if: Option<String>,

    /// Accept multicast only from this unicast source
    #[clap(long = "mc-source-filter")]
    pub mc_source_filter: Option<IpAddr>,

    /// Enable multicast loopback (off by default)
    #[clap(long = "mc-loopback-enable")]
    pub mc_loopback_enable: bool,

    /// Multicast TTL / hop limit
    #[clap(long = "mc-ttl", default_value = "2")]
    pub mc_ttl: u32,

    /// Multiplexer timeout in milliseconds; negative blocks indefinitely
    #[clap(long, default_value = "10", allow_hyphen_values = true)]
    pub timeout: i64,
}

/// Client-side options shared by the measurement subcommands.
#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Messages per second, or "max" for unpaced
    #[clap(long)]
    pub mps: Option<String>,

    /// Messages per pacing cycle
    #[clap(short = 'b', long = "burst", default_value = "1")]
    pub burst: u64,

    /// Test duration in seconds (excluding warm-up and cool-down)
    #[clap(short = 't', long = "time", default_value = "1")]
    pub time: u64,

    /// Send exactly this many packets instead of running for a duration
    #[clap(short = 'n', long = "number-of-packets")]
    pub number_of_packets: Option<u64>,

    /// Request a pong for 1 in every N sends
    #[clap(long = "reply-every", default_value = "100")]
    pub reply_every: u64,

    /// Bind outgoing sockets to this local port
    #[clap(long = "client_port")]
    pub client_port: Option<u16>,

    /// Bind outgoing sockets to this local address
    #[clap(long = "client_addr")]
    pub client_addr: Option<String>,

    /// SO_REUSEADDR on the client-side bind
    #[clap(long = "uc-reuseaddr")]
    pub uc_reuseaddr: bool,

    /// Keep the egress path warm with filler sends at this rate
    #[clap(long = "dummy-send", num_args = 0..=1, default_missing_value = "10000")]
    pub dummy_send: Option<u32>,

    /// Use the monotonic clock instead of the calibrated hardware counter
    #[clap(long = "no-rdtsc")]
    pub no_rdtsc: bool,

    /// Verify reply payloads byte-for-byte
    #[clap(long = "data-integrity")]
    pub data_integrity: bool,

    /// Skip the warm-up phase
    #[clap(long = "dont-warmup")]
    pub dont_warmup: bool,

    /// Cool-down window for in-flight replies, in milliseconds
    #[clap(long = "cooldown", default_value = "500")]
    pub cooldown_msec: u64,

    /// Give up a ping-pong wait after this many milliseconds
    #[clap(long = "reply-timeout", default_value = "10000")]
    pub reply_timeout_msec: u64,

    /// Write the raw per-sequence timestamp table as JSON to this file
    #[clap(long = "full-log")]
    pub full_log: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Worker threads; sockets are partitioned across them
    #[clap(long = "threads-num", default_value = "1")]
    pub threads_num: usize,

    /// Receive only, never echo
    #[clap(long = "dont-reply")]
    pub dont_reply: bool,

    /// Answer multicast requests to the sender instead of the group
    #[clap(long = "force-unicast-reply")]
    pub force_unicast_reply: bool,

    /// Track per-peer sequence gaps
    #[clap(long = "gap-detection")]
    pub gap_detection: bool,

    /// Log an activity line every N received messages
    #[clap(long)]
    pub activity: Option<u64>,

    /// Forward messages without touching the CLIENT flag
    #[clap(long)]
    pub bridge: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Round-trip latency under configurable load
    UnderLoad {
        #[clap(flatten)]
        socket: SocketArgs,
        #[clap(flatten)]
        client: ClientArgs,
    },

    /// Lock-step request/reply latency
    PingPong {
        #[clap(flatten)]
        socket: SocketArgs,
        #[clap(flatten)]
        client: ClientArgs,
    },

    /// One-way throughput
    Throughput {
        #[clap(flatten)]
        socket: SocketArgs,
        #[clap(flatten)]
        client: ClientArgs,
    },

    /// Replay a timestamped message schedule
    Playback {
        #[clap(flatten)]
        socket: SocketArgs,
        #[clap(flatten)]
        client: ClientArgs,
        /// Schedule file of "seconds, size" lines
        #[clap(long = "data-file")]
        data_file: PathBuf,
    },

    /// Echo server
    Server {
        #[clap(flatten)]
        socket: SocketArgs,
        #[clap(flatten)]
        server: ServerArgs,
    },
}
