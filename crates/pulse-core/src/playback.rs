//! Playback schedules: replaying a timestamped message stream.
//!
//! A schedule file is UTF-8 text, one `time, size` record per line, `#`
//! starting a comment. Times are absolute seconds from the start of the run
//! and must be monotonically non-decreasing; sizes must fit the configured
//! message bounds. The file is parsed once at startup into relative
//! `(delay since previous, size)` steps the client walks at send time.

use crate::error::{PulseError, Result};
use crate::message::HEADER_SIZE;
use crate::ticks::TicksDuration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackItem {
    /// Delay from the previous send.
    pub delay: TicksDuration,
    pub size: usize,
}

/// Parse a whole schedule. `max_size` bounds each record's message size.
pub fn parse_schedule(text: &str, max_size: usize) -> Result<Vec<PlaybackItem>> {
    let mut items = Vec::new();
    let mut prev_time = 0.0f64;
    for (ix, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, ',');
        let time: f64 = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad_line(ix, "cannot read time"))?;
        let size: usize = parts
            .next()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| bad_line(ix, "cannot read size"))?;

        if time < prev_time {
            return Err(bad_line(ix, "out-of-order timestamp"));
        }
        if size < HEADER_SIZE || size > max_size {
            return Err(bad_line(ix, "size out of range"));
        }
        items.push(PlaybackItem { delay: TicksDuration::from_seconds(time - prev_time), size });
        prev_time = time;
    }
    if items.is_empty() {
        return Err(PulseError::Incorrect("playback schedule is empty".into()));
    }
    Ok(items)
}

fn bad_line(ix: usize, what: &str) -> PulseError {
    PulseError::Incorrect(format!("playback line #{}: {}", ix + 1, what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relative_delays() {
        let text = "# warmup\n0.000, 14\n0.010, 20\n0.010, 14\n\n0.025, 64\n";
        let items = parse_schedule(text, 64).unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].delay, TicksDuration::ZERO);
        assert_eq!(items[0].size, 14);
        assert_eq!(items[1].delay.to_nsec(), 10_000_000);
        // identical timestamps are legal: zero delay
        assert_eq!(items[2].delay, TicksDuration::ZERO);
        assert_eq!(items[3].delay.to_nsec(), 15_000_000);
    }

    #[test]
    fn test_rejects_out_of_order_time() {
        let err = parse_schedule("0.5, 14\n0.4, 14\n", 64).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(parse_schedule("0.0, 11\n", 64).is_err()); // below header
        assert!(parse_schedule("0.0, 65\n", 64).is_err()); // above max
        assert!(parse_schedule("0.0, 64\n", 64).is_ok());
    }

    #[test]
    fn test_rejects_garbage_and_empty() {
        assert!(parse_schedule("hello world\n", 64).is_err());
        assert!(parse_schedule("0.0\n", 64).is_err());
        assert!(parse_schedule("# nothing\n", 64).is_err());
    }
}
