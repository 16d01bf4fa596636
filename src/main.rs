//! sockpulse — socket latency and throughput benchmark.
//!
//! A client paces timestamped probes at a server that echoes them back;
//! round-trip times land in a raw per-sequence table. Run
//! `sockpulse --help` for the mode and transport matrix.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pulse_core::client::{self, ClientMode};
use pulse_core::pacing::RunLength;
use pulse_core::registry::{prepare_socket, Role, SocketOptions, SocketRegistry};
use pulse_core::ticks::{self, ClockSource};
use pulse_core::{server, PulseError};

mod cli;
mod config;
mod summary;

use cli::{Cli, ClientArgs, Commands, SocketArgs};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().expect("static directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = real_main(cli) {
        eprintln!("sockpulse: {}", err);
        let code = err.downcast_ref::<PulseError>().map(|e| e.exit_code()).unwrap_or(1);
        std::process::exit(code);
    }
}

fn real_main(cli: Cli) -> anyhow::Result<()> {
    pulse_core::install_signal_handler()?;

    match cli.command {
        Commands::UnderLoad { socket, client } => {
            run_client(ClientMode::UnderLoad, &socket, &client, None)?
        }
        Commands::PingPong { socket, client } => {
            run_client(ClientMode::PingPong, &socket, &client, None)?
        }
        Commands::Throughput { socket, client } => {
            run_client(ClientMode::Throughput, &socket, &client, None)?
        }
        Commands::Playback { socket, client, data_file } => {
            run_client(ClientMode::Playback, &socket, &client, Some(data_file.as_path()))?
        }
        Commands::Server { socket, server } => run_server(&socket, &server)?,
    }
    Ok(())
}

fn init_clock(no_rdtsc: bool) -> anyhow::Result<()> {
    let want = if no_rdtsc { ClockSource::Monotonic } else { ClockSource::Rdtsc };
    let got = ticks::init(want)?;
    tracing::debug!(?got, "clock source selected");
    Ok(())
}

fn prepare_registry(
    socket: &SocketArgs,
    role: Role,
    opts: &SocketOptions,
    max_size: usize,
) -> anyhow::Result<SocketRegistry> {
    let specs = config::build_specs(socket, role == Role::Server)?;
    let mut registry = SocketRegistry::new();
    for spec in &specs {
        let record = prepare_socket(spec, opts, role, max_size)?;
        tracing::info!(addr = %record.peer, fd = record.fd(), "socket ready");
        registry.register(record);
    }
    Ok(registry)
}

fn run_client(
    mode: ClientMode,
    socket: &SocketArgs,
    client_args: &ClientArgs,
    data_file: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    init_clock(client_args.no_rdtsc)?;

    let specs = config::build_specs(socket, false)?;
    let cfg = config::client_config(mode, socket, client_args, specs.len())?;
    let opts = config::socket_options(socket, Some(client_args))?;
    let mut registry = SocketRegistry::new();
    for spec in &specs {
        let record = prepare_socket(spec, &opts, Role::Client, cfg.limits.max_size)?;
        tracing::info!(addr = %record.peer, fd = record.fd(), "socket ready");
        registry.register(record);
    }

    let schedule = match data_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| PulseError::NotExist(format!("data file {}: {}", path.display(), e)))?;
            Some(pulse_core::playback::parse_schedule(&text, cfg.limits.max_size)?)
        }
        None => None,
    };

    match cfg.run {
        RunLength::Time(secs) => tracing::info!(mode = ?mode, secs, "starting timed run"),
        RunLength::Count(n) => tracing::info!(mode = ?mode, packets = n, "starting counted run"),
    }
    let result = client::run(&cfg, registry, schedule.as_deref(), pulse_core::exit_flag());

    match result {
        Ok(run_summary) => {
            summary::print_client(&run_summary);
            if let Some(path) = &client_args.full_log {
                summary::write_full_log(&run_summary, path)?;
                tracing::info!(path = %path.display(), "full log written");
            }
            Ok(())
        }
        // A signal mid-run is a clean stop: the counters survived, print them.
        Err(err) if pulse_core::exit_requested() => {
            tracing::warn!(%err, "run interrupted");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn run_server(socket: &SocketArgs, server_args: &cli::ServerArgs) -> anyhow::Result<()> {
    init_clock(true)?;
    let cfg = config::server_config(socket, server_args)?;
    let registry = prepare_registry(socket, Role::Server, &cfg.inherit_opts, cfg.limits.max_size)?;
    tracing::info!(
        sockets = registry.len(),
        threads = cfg.threads,
        "server running, ^C to stop"
    );

    let run_summary = server::run(&cfg, registry, pulse_core::exit_flag())?;
    summary::print_server(&run_summary);
    Ok(())
}
