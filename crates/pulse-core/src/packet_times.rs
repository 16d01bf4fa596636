//! Per-sequence timestamp tables.
//!
//! One dense array holds a block per sampled sequence: slot 0 is the tx time,
//! slots `1..=num_servers` the per-server rx times. Only every
//! `reply_every`-th sequence carries a PONG_REQUEST and therefore owns a
//! block, which is what keeps throughput runs (reply_every in the millions)
//! from allocating gigabytes. All operations are O(1); the zero tick is the
//! "not recorded" sentinel.

use crate::error::{PulseError, Result};
use crate::ticks::TicksTime;

/// Arrival accounting for one server.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrivalErrors {
    pub duplicates: u64,
    pub ooo: u64,
    pub dropped: u64,
}

pub struct PacketTimes {
    max_seq_no: u64,
    reply_every: u64,
    block_size: u64,
    times: Vec<TicksTime>,
    errors: Vec<ArrivalErrors>,
}

impl PacketTimes {
    pub fn new(max_seq_no: u64, reply_every: u64, num_servers: usize) -> Result<Self> {
        if max_seq_no == 0 || reply_every == 0 || num_servers == 0 {
            return Err(PulseError::BadArgument(
                "packet-times dimensions must be non-zero".into(),
            ));
        }
        let block_size = 1 + num_servers as u64;
        let blocks = max_seq_no / reply_every + 1;
        let len = blocks
            .checked_mul(block_size)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| {
                PulseError::OutOfMemory(format!(
                    "timestamp table of {} blocks x {} slots",
                    blocks, block_size
                ))
            })?;
        Ok(PacketTimes {
            max_seq_no,
            reply_every,
            block_size,
            times: vec![TicksTime::ZERO; len],
            errors: vec![ArrivalErrors::default(); num_servers],
        })
    }

    pub fn max_seq_no(&self) -> u64 {
        self.max_seq_no
    }

    pub fn reply_every(&self) -> u64 {
        self.reply_every
    }

    pub fn num_servers(&self) -> usize {
        self.errors.len()
    }

    /// Block index for a sequence. Block 0 is never used by real packets
    /// (sequences start at 1).
    #[inline]
    fn index(&self, seq: u64) -> Result<usize> {
        if seq > self.max_seq_no {
            return Err(PulseError::Fatal(format!(
                "sequence {} beyond table maximum {}",
                seq, self.max_seq_no
            )));
        }
        Ok((seq / self.reply_every * self.block_size) as usize)
    }

    #[inline]
    pub fn set_tx_time(&mut self, seq: u64) -> Result<()> {
        let ix = self.index(seq)?;
        self.times[ix] = TicksTime::now();
        Ok(())
    }

    /// Forget a tx stamp after a skipped/dropped send.
    #[inline]
    pub fn clear_tx_time(&mut self, seq: u64) -> Result<()> {
        let ix = self.index(seq)?;
        self.times[ix] = TicksTime::ZERO;
        Ok(())
    }

    /// Record an rx time. First write wins; a second arrival for the same
    /// slot only bumps the server's duplicates counter. Returns whether the
    /// slot was filled by this call.
    #[inline]
    pub fn set_rx_time(&mut self, seq: u64, server_ix: usize, t: TicksTime) -> Result<bool> {
        let ix = self.index(seq)? + 1 + server_ix;
        if self.times[ix].is_zero() {
            self.times[ix] = t;
            Ok(true)
        } else {
            self.errors[server_ix].duplicates += 1;
            Ok(false)
        }
    }

    pub fn tx_time(&self, seq: u64) -> Result<TicksTime> {
        Ok(self.times[self.index(seq)?])
    }

    pub fn rx_time(&self, seq: u64, server_ix: usize) -> Result<TicksTime> {
        Ok(self.times[self.index(seq)? + 1 + server_ix])
    }

    pub fn inc_ooo(&mut self, server_ix: usize) {
        self.errors[server_ix].ooo += 1;
    }

    pub fn inc_dropped(&mut self, server_ix: usize) {
        self.errors[server_ix].dropped += 1;
    }

    pub fn errors(&self, server_ix: usize) -> ArrivalErrors {
        self.errors[server_ix]
    }

    /// Walk every sampled `(seq, tx, rx[server])` triple that has a tx stamp.
    /// This is the raw table consumers post-process; nothing is aggregated
    /// here.
    pub fn for_each_sample(&self, mut f: impl FnMut(u64, TicksTime, &[TicksTime])) {
        let mut seq = self.reply_every;
        while seq <= self.max_seq_no {
            let ix = (seq / self.reply_every * self.block_size) as usize;
            let tx = self.times[ix];
            if !tx.is_zero() {
                f(seq, tx, &self.times[ix + 1..ix + self.block_size as usize]);
            }
            seq += self.reply_every;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::TicksDuration;

    #[test]
    fn test_indexing_stays_in_bounds() {
        // Property: for all seq in [1, max] divisible by reply_every,
        // index(seq) + num_servers < len.
        for (max_seq, reply_every, servers) in [(100, 1, 1), (1000, 7, 3), (50, 50, 2)] {
            let pt = PacketTimes::new(max_seq, reply_every, servers).unwrap();
            let mut seq = reply_every;
            while seq <= max_seq {
                let ix = (seq / reply_every * pt.block_size) as usize;
                assert!(ix + servers < pt.times.len(), "seq={} out of bounds", seq);
                seq += reply_every;
            }
        }
    }

    #[test]
    fn test_tx_set_and_clear() {
        let mut pt = PacketTimes::new(100, 10, 1).unwrap();
        pt.set_tx_time(10).unwrap();
        assert!(!pt.tx_time(10).unwrap().is_zero());
        pt.clear_tx_time(10).unwrap();
        assert!(pt.tx_time(10).unwrap().is_zero());
    }

    #[test]
    fn test_tx_beyond_max_is_fatal() {
        let mut pt = PacketTimes::new(100, 10, 1).unwrap();
        let err = pt.set_tx_time(101).unwrap_err();
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn test_duplicate_detection_preserves_first_rx() {
        let mut pt = PacketTimes::new(1000, 100, 1).unwrap();
        let first = TicksTime::now();
        let second = first + TicksDuration::from_usec(50);
        assert!(pt.set_rx_time(100, 0, first).unwrap());
        assert!(!pt.set_rx_time(100, 0, second).unwrap());
        assert_eq!(pt.rx_time(100, 0).unwrap(), first);
        assert_eq!(pt.errors(0).duplicates, 1);
        // a third copy counts again
        assert!(!pt.set_rx_time(100, 0, second).unwrap());
        assert_eq!(pt.errors(0).duplicates, 2);
    }

    #[test]
    fn test_per_server_slots_are_independent() {
        let mut pt = PacketTimes::new(100, 10, 3).unwrap();
        let t = TicksTime::now();
        assert!(pt.set_rx_time(20, 0, t).unwrap());
        assert!(pt.set_rx_time(20, 2, t).unwrap());
        assert!(pt.rx_time(20, 1).unwrap().is_zero());
        assert_eq!(pt.errors(0).duplicates, 0);
        assert_eq!(pt.errors(2).duplicates, 0);
    }

    #[test]
    fn test_for_each_sample_visits_only_stamped_blocks() {
        let mut pt = PacketTimes::new(100, 10, 2).unwrap();
        pt.set_tx_time(10).unwrap();
        pt.set_tx_time(30).unwrap();
        pt.set_rx_time(30, 1, TicksTime::now()).unwrap();
        let mut seen = Vec::new();
        pt.for_each_sample(|seq, tx, rx| {
            assert!(!tx.is_zero());
            assert_eq!(rx.len(), 2);
            seen.push(seq);
        });
        assert_eq!(seen, vec![10, 30]);
    }
}
