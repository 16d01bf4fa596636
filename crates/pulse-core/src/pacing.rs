//! Cycle pacing for the client send loop.
//!
//! The scheduler owns a free-running cursor: the send path busy-spins until
//! `now >= next_send_time`, then the cursor advances by one cycle. A loop
//! that falls behind by more than one full cycle snaps the cursor to the
//! present instead of accumulating debt. With `mps = max` the cycle is zero
//! and the spin degenerates to a no-op.
//!
//! An optional dummy-send filler fires between real sends to keep the egress
//! pipeline warm; its cadence is independent and must be faster than the real
//! message rate.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

use crate::error::{PulseError, Result};
use crate::ticks::{TicksDuration, TicksTime, NSEC_IN_SEC};

/// How long the run lasts: wall-clock seconds (excluding warm-up/cool-down)
/// or an exact packet count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLength {
    Time(u64),
    Count(u64),
}

#[derive(Debug)]
pub struct CycleScheduler {
    cycle: TicksDuration,
    next_send: TicksTime,
    dummy_cycle: TicksDuration,
    next_dummy: TicksTime,
}

impl CycleScheduler {
    /// `mps = None` means maximum rate (no pacing). `dummy_mps` enables the
    /// filler; it is rejected together with maximum rate since there is no
    /// idle gap to fill.
    pub fn new(burst_size: u64, mps: Option<u32>, dummy_mps: Option<u32>) -> Result<Self> {
        if burst_size == 0 {
            return Err(PulseError::BadArgument("burst size is zero".into()));
        }
        let cycle = match mps {
            Some(0) => return Err(PulseError::BadArgument("mps is zero".into())),
            Some(mps) => TicksDuration::from_nsec(NSEC_IN_SEC * burst_size as i64 / mps as i64),
            None => TicksDuration::ZERO,
        };
        let dummy_cycle = match dummy_mps {
            None => TicksDuration::ZERO,
            Some(_) if mps.is_none() => {
                return Err(PulseError::BadArgument(
                    "dummy sends need a bounded message rate".into(),
                ))
            }
            Some(0) => return Err(PulseError::BadArgument("dummy-send rate is zero".into())),
            Some(d) if u64::from(d) <= u64::from(mps.unwrap()) => {
                return Err(PulseError::BadArgument(
                    "dummy-send rate must exceed the message rate".into(),
                ))
            }
            Some(d) => TicksDuration::from_nsec(NSEC_IN_SEC / d as i64),
        };
        let now = TicksTime::now();
        Ok(CycleScheduler { cycle, next_send: now, dummy_cycle, next_dummy: now })
    }

    pub fn cycle_duration(&self) -> TicksDuration {
        self.cycle
    }

    /// Restart the cursor from `now` (end of warm-up).
    pub fn restart(&mut self, now: TicksTime) {
        self.next_send = now;
        self.next_dummy = now;
    }

    /// True once the next cycle boundary has been reached.
    #[inline]
    pub fn due(&self, now: TicksTime) -> bool {
        now >= self.next_send
    }

    /// Advance the cursor past a completed cycle, snapping to the present
    /// when more than one full cycle behind.
    pub fn advance(&mut self, now: TicksTime) {
        self.next_send += self.cycle;
        if now - self.next_send > self.cycle {
            self.next_send = now;
        }
    }

    /// Busy-spin until the cycle boundary, firing `dummy` at its own cadence
    /// while waiting. Returns false if the exit flag was raised.
    pub fn wait_cycle(&mut self, exit: &AtomicBool, mut dummy: impl FnMut()) -> bool {
        if self.cycle.is_zero() {
            return !exit.load(Relaxed);
        }
        loop {
            let now = TicksTime::now();
            if self.due(now) {
                return true;
            }
            if exit.load(Relaxed) {
                return false;
            }
            if !self.dummy_cycle.is_zero() && now >= self.next_dummy {
                dummy();
                self.next_dummy += self.dummy_cycle;
                if now - self.next_dummy > self.dummy_cycle {
                    self.next_dummy = now;
                }
            }
            std::hint::spin_loop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_duration_from_rate() {
        let s = CycleScheduler::new(1, Some(1000), None).unwrap();
        assert_eq!(s.cycle_duration().to_nsec(), NSEC_IN_SEC / 1000);
        let s = CycleScheduler::new(8, Some(1000), None).unwrap();
        assert_eq!(s.cycle_duration().to_nsec(), 8 * NSEC_IN_SEC / 1000);
        let s = CycleScheduler::new(1, None, None).unwrap();
        assert!(s.cycle_duration().is_zero());
    }

    #[test]
    fn test_bad_rates_rejected() {
        assert!(CycleScheduler::new(0, Some(1), None).is_err());
        assert!(CycleScheduler::new(1, Some(0), None).is_err());
        // dummy rate must exceed mps, and needs a bounded mps at all
        assert!(CycleScheduler::new(1, Some(1000), Some(500)).is_err());
        assert!(CycleScheduler::new(1, Some(1000), Some(1000)).is_err());
        assert!(CycleScheduler::new(1, None, Some(10_000)).is_err());
        assert!(CycleScheduler::new(1, Some(1000), Some(10_000)).is_ok());
    }

    #[test]
    fn test_cursor_advances_by_exact_cycles() {
        let mut s = CycleScheduler::new(1, Some(1000), None).unwrap();
        let t0 = TicksTime::now();
        s.restart(t0);
        let cycle = s.cycle_duration();
        assert!(s.due(t0));
        // on schedule: boundaries land exactly cycle apart
        s.advance(t0);
        assert!(!s.due(t0));
        assert!(s.due(t0 + cycle));
        s.advance(t0 + cycle);
        assert!(s.due(t0 + cycle * 2));
    }

    #[test]
    fn test_cursor_catches_up_when_far_behind() {
        let mut s = CycleScheduler::new(1, Some(1000), None).unwrap();
        let t0 = TicksTime::now();
        s.restart(t0);
        let cycle = s.cycle_duration();
        // the loop stalled for five cycles; the cursor snaps to the present
        let late = t0 + cycle * 5;
        s.advance(late);
        assert!(s.due(late));
        s.advance(late);
        assert!(!s.due(late));
        assert!(s.due(late + cycle));
    }

    #[test]
    fn test_wait_cycle_observes_exit_flag() {
        let mut s = CycleScheduler::new(1, Some(1), None).unwrap(); // 1s cycle
        s.restart(TicksTime::now() + TicksDuration::from_seconds(10.0));
        let exit = AtomicBool::new(true);
        assert!(!s.wait_cycle(&exit, || {}));
    }

    #[test]
    fn test_wait_cycle_fires_dummies_while_spinning() {
        // 100 mps real rate, 100k dummy rate: a single 10ms cycle wait must
        // fire a healthy number of dummies.
        let mut s = CycleScheduler::new(1, Some(100), Some(100_000)).unwrap();
        let now = TicksTime::now();
        s.restart(now);
        s.advance(now); // park the boundary one cycle out
        let exit = AtomicBool::new(false);
        let mut dummies = 0u32;
        assert!(s.wait_cycle(&exit, || dummies += 1));
        assert!(dummies > 10, "only {} dummy sends fired", dummies);
    }

    #[test]
    fn test_max_rate_never_waits() {
        let mut s = CycleScheduler::new(1, None, None).unwrap();
        let exit = AtomicBool::new(false);
        for _ in 0..1000 {
            assert!(s.wait_cycle(&exit, || {}));
        }
    }
}
