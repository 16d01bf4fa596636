//! End-of-run reporting: human-readable counters plus an optional JSON dump
//! of the raw per-sequence timestamp table.

use std::io::Write;
use std::path::Path;

use pulse_core::client::ClientSummary;
use pulse_core::server::ServerSummary;
use pulse_core::ticks::NSEC_IN_USEC;
use pulse_core::{PulseError, Result};
use serde::Serialize;

#[derive(Serialize)]
struct Sample {
    seq: u64,
    tx_nsec: i64,
    /// One entry per server slot; 0 marks a missing reply.
    rx_nsec: Vec<i64>,
}

#[derive(Serialize)]
struct FullLog<'a> {
    sent: u64,
    received: u64,
    skipped: u64,
    duplicates: u64,
    servers: Vec<&'a str>,
    samples: Vec<Sample>,
}

pub fn print_client(summary: &ClientSummary) {
    println!("sockpulse: run summary");
    println!("  sent      = {}", summary.sent);
    println!("  received  = {}", summary.received);
    println!("  skipped   = {}", summary.skipped);
    if summary.bad_headers > 0 {
        println!("  bad headers = {}", summary.bad_headers);
    }
    if summary.dummy_sent > 0 {
        println!("  dummy sends = {}", summary.dummy_sent);
    }
    if summary.integrity_errors > 0 {
        println!("  DATA INTEGRITY ERRORS = {}", summary.integrity_errors);
    }
    let secs = summary.duration.to_nsec() as f64 / 1e9;
    if secs > 0.0 {
        println!("  duration  = {:.3} s ({:.0} msg/s)", secs, summary.sent as f64 / secs);
    }

    for (ix, (addr, errors)) in summary.servers.iter().enumerate() {
        println!(
            "  server[{}] {}: duplicates={} out-of-order={} dropped={}",
            ix, addr, errors.duplicates, errors.ooo, errors.dropped
        );
    }

    // Round-trip spread over the raw table; anything deeper is for offline
    // tooling fed by --full-log.
    let mut count = 0u64;
    let mut min_ns = i64::MAX;
    let mut max_ns = 0i64;
    let mut sum_ns = 0i64;
    summary.times.for_each_sample(|_seq, tx, rx| {
        for &r in rx {
            if r.is_zero() {
                continue;
            }
            let rtt = (r - tx).to_nsec();
            count += 1;
            sum_ns += rtt;
            min_ns = min_ns.min(rtt);
            max_ns = max_ns.max(rtt);
        }
    });
    if count > 0 {
        println!(
            "  rtt: samples={} min={:.3}us avg={:.3}us max={:.3}us",
            count,
            min_ns as f64 / NSEC_IN_USEC as f64,
            (sum_ns / count as i64) as f64 / NSEC_IN_USEC as f64,
            max_ns as f64 / NSEC_IN_USEC as f64,
        );
    } else {
        println!("  rtt: no samples");
    }
}

/// Write the raw timestamp table as JSON for offline post-processing.
pub fn write_full_log(summary: &ClientSummary, path: &Path) -> Result<()> {
    let mut samples = Vec::new();
    summary.times.for_each_sample(|seq, tx, rx| {
        samples.push(Sample {
            seq,
            tx_nsec: tx.to_nsec(),
            rx_nsec: rx.iter().map(|t| t.to_nsec()).collect(),
        });
    });
    let names: Vec<String> = summary.servers.iter().map(|(a, _)| a.to_string()).collect();
    let log = FullLog {
        sent: summary.sent,
        received: summary.received,
        skipped: summary.skipped,
        duplicates: summary.servers.iter().map(|(_, e)| e.duplicates).sum(),
        servers: names.iter().map(|s| s.as_str()).collect(),
        samples,
    };
    let mut file = std::fs::File::create(path)
        .map_err(|e| PulseError::NotExist(format!("full log {}: {}", path.display(), e)))?;
    serde_json::to_writer_pretty(&mut file, &log)
        .map_err(|e| PulseError::Incorrect(format!("full log encoding: {}", e)))?;
    file.write_all(b"\n")
        .map_err(|e| PulseError::socket_err("full log write", e))?;
    Ok(())
}

pub fn print_server(summary: &ServerSummary) {
    println!("sockpulse: server summary");
    println!("  received  = {}", summary.received);
    println!("  replied   = {}", summary.replied);
    if summary.bad_headers > 0 {
        println!("  bad headers = {}", summary.bad_headers);
    }
    if summary.accepted > 0 || summary.closed > 0 {
        println!("  connections: accepted={} closed={}", summary.accepted, summary.closed);
    }
    if summary.gap_dropped > 0 || summary.gap_ooo > 0 {
        println!("  gaps: dropped={} out-of-order={}", summary.gap_dropped, summary.gap_ooo);
    }
}
