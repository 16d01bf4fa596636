//! pulse-core — the latency-measurement engine behind sockpulse.
//!
//! The binary crate owns argument parsing, feedfiles, and summary output;
//! everything on the hot path lives here: the tick-level clock, the wire
//! message, socket preparation and the descriptor ring, message-boundary
//! reassembly, the readiness multiplexer, the paced client loop, and the
//! multiplexed echo server.

pub mod addr;
pub mod client;
pub mod error;
pub mod message;
pub mod mux;
pub mod packet_times;
pub mod pacing;
pub mod parser;
pub mod playback;
pub mod registry;
pub mod server;
pub mod ticks;

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

pub use error::{PulseError, Result};

/// Process-wide exit flag, shared by every run started from the binary.
/// Library users (and tests) may pass their own flag instead; this one exists
/// so the signal handler has something static to poke.
static EXIT_FLAG: AtomicBool = AtomicBool::new(false);

pub fn exit_flag() -> &'static AtomicBool {
    &EXIT_FLAG
}

pub fn exit_requested() -> bool {
    EXIT_FLAG.load(Relaxed)
}

extern "C" fn on_signal(_sig: libc::c_int) {
    // Async-signal context: set the flag and nothing else.
    EXIT_FLAG.store(true, Relaxed);
}

/// Route SIGINT and SIGTERM to the exit flag. Every loop in the engine polls
/// the flag once per cycle; teardown and the final summary still run, and the
/// process exits 0.
pub fn install_signal_handler() -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_signal as usize;
        libc::sigemptyset(&mut action.sa_mask);
        for sig in [libc::SIGINT, libc::SIGTERM] {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                return Err(PulseError::socket("sigaction"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_flag_round_trip() {
        assert!(!exit_requested() || EXIT_FLAG.load(Relaxed));
        // raising through the handler path works without UB
        on_signal(libc::SIGINT);
        assert!(exit_requested());
        EXIT_FLAG.store(false, Relaxed);
    }
}
