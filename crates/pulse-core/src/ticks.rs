//! Tick-level time points and intervals.
//!
//! `TicksTime` is a point in time, `TicksDuration` an interval. Both are thin
//! wrappers over a signed tick count; the meaning of one tick depends on the
//! clock source selected once at startup:
//!
//! * `Monotonic`: ticks are nanoseconds from `CLOCK_MONOTONIC`. Always
//!   available, no calibration.
//! * `Rdtsc`: ticks are raw timestamp-counter cycles, calibrated once against
//!   the monotonic clock. Sub-100ns reads with no syscall, which is what makes
//!   sub-microsecond RTT measurement possible.
//!
//! Only the algebra that makes sense for points and intervals is implemented:
//! `TicksTime + TicksDuration`, `TicksTime - TicksTime`, duration ± duration,
//! duration × / ÷ integer. Anything else (adding two points, dividing by a
//! point) simply has no `impl` and will not compile.
//!
//! Conversions split values at the millisecond to stay exact without
//! overflowing: good for durations up to roughly a week at multi-GHz tick
//! rates. No runtime overflow checks on the fast path.

use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering::Relaxed};

use crate::error::{PulseError, Result};

pub const NSEC_IN_SEC: i64 = 1_000_000_000;
pub const NSEC_IN_MSEC: i64 = 1_000_000;
pub const NSEC_IN_USEC: i64 = 1_000;

/// Ticks per millisecond. Defaults to the monotonic identity (1 tick = 1 ns);
/// rewritten once by `init` when the rdtsc source is calibrated.
static TICKS_PER_MSEC: AtomicI64 = AtomicI64::new(NSEC_IN_MSEC);
static USE_RDTSC: AtomicBool = AtomicBool::new(false);
/// Counter value at calibration time so rdtsc points start near zero.
static RDTSC_BASE: AtomicI64 = AtomicI64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockSource {
    Monotonic,
    Rdtsc,
}

/// Nanoseconds from `CLOCK_MONOTONIC`.
#[inline]
fn monotonic_nsec() -> i64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * NSEC_IN_SEC + ts.tv_nsec as i64
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn rdtsc() -> i64 {
    unsafe { core::arch::x86_64::_rdtsc() as i64 }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn rdtsc() -> i64 {
    0
}

/// Select the clock source for the whole process. Call once at bring-up,
/// before the first `TicksTime::now()` on the hot path.
///
/// For `Rdtsc` the counter is calibrated by sampling it around a ~100 ms
/// monotonic-clock sleep. Returns the source actually in effect: on platforms
/// without a usable counter the request quietly degrades to `Monotonic`.
pub fn init(source: ClockSource) -> Result<ClockSource> {
    match source {
        ClockSource::Monotonic => {
            USE_RDTSC.store(false, Relaxed);
            TICKS_PER_MSEC.store(NSEC_IN_MSEC, Relaxed);
            Ok(ClockSource::Monotonic)
        }
        ClockSource::Rdtsc => {
            if !cfg!(target_arch = "x86_64") {
                tracing::warn!("hardware counter unavailable on this arch, using monotonic clock");
                return init(ClockSource::Monotonic);
            }
            let tsc0 = rdtsc();
            let ns0 = monotonic_nsec();
            std::thread::sleep(std::time::Duration::from_millis(100));
            let tsc1 = rdtsc();
            let ns1 = monotonic_nsec();

            let dns = ns1 - ns0;
            let dtsc = tsc1 - tsc0;
            if dns <= 0 || dtsc <= 0 {
                return Err(PulseError::Fatal("counter calibration went backwards".into()));
            }
            let ticks_per_msec = dtsc * NSEC_IN_MSEC / dns;
            if ticks_per_msec <= 0 {
                return Err(PulseError::Fatal("counter slower than 1 tick/msec".into()));
            }
            TICKS_PER_MSEC.store(ticks_per_msec, Relaxed);
            RDTSC_BASE.store(tsc1, Relaxed);
            USE_RDTSC.store(true, Relaxed);
            tracing::debug!(ticks_per_msec, "rdtsc clock calibrated");
            Ok(ClockSource::Rdtsc)
        }
    }
}

#[inline(always)]
fn current_ticks() -> i64 {
    if USE_RDTSC.load(Relaxed) {
        rdtsc() - RDTSC_BASE.load(Relaxed)
    } else {
        monotonic_nsec()
    }
}

#[inline]
fn nsec_to_ticks(nsec: i64) -> i64 {
    let tpm = TICKS_PER_MSEC.load(Relaxed);
    if tpm == NSEC_IN_MSEC {
        return nsec;
    }
    // Split at the millisecond: both halves stay well inside i64.
    (nsec / NSEC_IN_MSEC) * tpm + (nsec % NSEC_IN_MSEC) * tpm / NSEC_IN_MSEC
}

#[inline]
fn ticks_to_nsec(ticks: i64) -> i64 {
    let tpm = TICKS_PER_MSEC.load(Relaxed);
    if tpm == NSEC_IN_MSEC {
        return ticks;
    }
    (ticks / tpm) * NSEC_IN_MSEC + (ticks % tpm) * NSEC_IN_MSEC / tpm
}

// ---------------------------------------------------------------------------
// TicksTime
// ---------------------------------------------------------------------------

/// A point in time. The zero value doubles as the "not recorded" sentinel in
/// timestamp tables; real samples from `now()` are never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TicksTime(i64);

impl TicksTime {
    pub const ZERO: TicksTime = TicksTime(0);

    /// Current time. Reentrant; wait-free under the rdtsc source (one
    /// register read, no syscall).
    #[inline(always)]
    pub fn now() -> Self {
        TicksTime(current_ticks())
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Nanoseconds from the clock origin; intended for raw-table dumps.
    pub fn to_nsec(self) -> i64 {
        ticks_to_nsec(self.0)
    }
}

// ---------------------------------------------------------------------------
// TicksDuration
// ---------------------------------------------------------------------------

/// An interval. May be negative (a point minus a later point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TicksDuration(i64);

impl TicksDuration {
    pub const ZERO: TicksDuration = TicksDuration(0);

    pub fn from_nsec(nsec: i64) -> Self {
        TicksDuration(nsec_to_ticks(nsec))
    }

    pub fn from_usec(usec: i64) -> Self {
        Self::from_nsec(usec * NSEC_IN_USEC)
    }

    pub fn from_msec(msec: i64) -> Self {
        Self::from_nsec(msec * NSEC_IN_MSEC)
    }

    pub fn from_seconds(secs: f64) -> Self {
        Self::from_nsec((secs * NSEC_IN_SEC as f64) as i64)
    }

    pub fn to_nsec(self) -> i64 {
        ticks_to_nsec(self.0)
    }

    pub fn to_usec(self) -> i64 {
        self.to_nsec() / NSEC_IN_USEC
    }

    #[inline]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add<TicksDuration> for TicksTime {
    type Output = TicksTime;
    #[inline]
    fn add(self, rhs: TicksDuration) -> TicksTime {
        TicksTime(self.0 + rhs.0)
    }
}

impl AddAssign<TicksDuration> for TicksTime {
    #[inline]
    fn add_assign(&mut self, rhs: TicksDuration) {
        self.0 += rhs.0;
    }
}

impl Sub<TicksDuration> for TicksTime {
    type Output = TicksTime;
    #[inline]
    fn sub(self, rhs: TicksDuration) -> TicksTime {
        TicksTime(self.0 - rhs.0)
    }
}

impl Sub for TicksTime {
    type Output = TicksDuration;
    #[inline]
    fn sub(self, rhs: TicksTime) -> TicksDuration {
        TicksDuration(self.0 - rhs.0)
    }
}

impl Add for TicksDuration {
    type Output = TicksDuration;
    #[inline]
    fn add(self, rhs: TicksDuration) -> TicksDuration {
        TicksDuration(self.0 + rhs.0)
    }
}

impl Sub for TicksDuration {
    type Output = TicksDuration;
    #[inline]
    fn sub(self, rhs: TicksDuration) -> TicksDuration {
        TicksDuration(self.0 - rhs.0)
    }
}

impl AddAssign for TicksDuration {
    #[inline]
    fn add_assign(&mut self, rhs: TicksDuration) {
        self.0 += rhs.0;
    }
}

impl SubAssign for TicksDuration {
    #[inline]
    fn sub_assign(&mut self, rhs: TicksDuration) {
        self.0 -= rhs.0;
    }
}

impl Mul<i64> for TicksDuration {
    type Output = TicksDuration;
    #[inline]
    fn mul(self, rhs: i64) -> TicksDuration {
        TicksDuration(self.0 * rhs)
    }
}

impl Div<i64> for TicksDuration {
    type Output = TicksDuration;
    #[inline]
    fn div(self, rhs: i64) -> TicksDuration {
        TicksDuration(self.0 / rhs)
    }
}
