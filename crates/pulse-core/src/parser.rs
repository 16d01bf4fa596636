//! Message-boundary reassembly.
//!
//! A `MessageParser` slices the byte stream of one descriptor into whole
//! messages and hands each to a callback. Stream transports carry no length
//! on the wire (every message is exactly the session's `msg_size`), so the
//! parser's job is purely to ride out arbitrary recv boundaries. Datagram
//! transports deliver one message per datagram and bypass reassembly.
//!
//! Two accumulation strategies, same state machine:
//!
//! * **In-place** (`process_received`): the reader deposits bytes directly
//!   into the accumulator at `write_slot()` and reports how many arrived.
//!   The accumulator is 2× the maximum payload so one pending partial plus
//!   one full fresh chunk always fit without moving bytes.
//! * **Buffered** (`process_external`): bytes arrive in a producer-owned
//!   region (a zero-copy scatter element, a replayed capture); complete
//!   messages are emitted straight out of that region and only a trailing
//!   partial is copied into the accumulator.
//!
//! Bad headers resync at a recv boundary: if the offending header was
//! assembled across reads, the stale prefix from earlier reads is dropped and
//! the current read is reparsed from its start; if the garbage begins inside
//! the current read, the rest of that read is discarded.
//!
//! After every call the accumulator is either empty or holds a prefix of
//! exactly one in-flight message, with `cur_offset` strictly below the
//! message length.

use crate::message::{MsgHeader, MsgLimits, HEADER_SIZE};

// ---------------------------------------------------------------------------
// RecvAccumulator
// ---------------------------------------------------------------------------

/// Per-socket receive state. Owned by the socket's registry record.
pub struct RecvAccumulator {
    buf: Vec<u8>,
    max_size: usize,
    /// Start of the message currently being assembled.
    cur_start: usize,
    /// Bytes of it accumulated so far.
    cur_offset: usize,
    /// Upper bound for the next read.
    cur_size: usize,
}

impl RecvAccumulator {
    pub fn new(max_size: usize) -> Self {
        RecvAccumulator {
            buf: vec![0u8; 2 * max_size],
            max_size,
            cur_start: 0,
            cur_offset: 0,
            cur_size: max_size,
        }
    }

    /// Where the next read lands. Capped by both `cur_size` and the physical
    /// end of the buffer.
    pub fn write_slot(&mut self) -> &mut [u8] {
        let start = self.cur_start + self.cur_offset;
        let end = (start + self.cur_size).min(self.buf.len());
        &mut self.buf[start..end]
    }

    pub fn reset(&mut self) {
        self.cur_start = 0;
        self.cur_offset = 0;
        self.cur_size = self.max_size;
    }

    pub fn is_empty(&self) -> bool {
        self.cur_offset == 0
    }

    pub fn pending(&self) -> usize {
        self.cur_offset
    }
}

// ---------------------------------------------------------------------------
// MessageParser
// ---------------------------------------------------------------------------

/// How message length is determined for a socket.
#[derive(Debug, Clone, Copy)]
pub enum LengthMode {
    /// One whole datagram is one message.
    Datagram,
    /// Fixed session message size; reassembled across recv boundaries.
    Stream(usize),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseSummary {
    pub emitted: u32,
    pub bad_headers: u32,
    /// The callback asked to stop; remaining bytes of the chunk were dropped.
    pub stopped: bool,
}

pub struct MessageParser {
    limits: MsgLimits,
    mode: LengthMode,
}

impl MessageParser {
    pub fn new(limits: MsgLimits, mode: LengthMode) -> Self {
        MessageParser { limits, mode }
    }

    pub fn mode(&self) -> LengthMode {
        self.mode
    }

    /// In-place strategy: `n` bytes were just read into `acc.write_slot()`.
    /// The callback receives each complete message (header already validated,
    /// decoded to host order) and returns `false` to stop.
    pub fn process_received<F>(&self, acc: &mut RecvAccumulator, n: usize, emit: &mut F) -> ParseSummary
    where
        F: FnMut(&MsgHeader, &[u8]) -> bool,
    {
        let mut sum = ParseSummary::default();
        match self.mode {
            LengthMode::Datagram => {
                let start = acc.cur_start;
                self.emit_datagram(&acc.buf[start..start + n], emit, &mut sum);
            }
            LengthMode::Stream(msg_len) => {
                self.stream_in_place(acc, n, msg_len, emit, &mut sum);
            }
        }
        sum
    }

    /// Buffered strategy: process a producer-owned chunk. For datagram-style
    /// producers call once per packet; for stream producers call per chunk in
    /// arrival order.
    pub fn process_external<F>(&self, acc: &mut RecvAccumulator, chunk: &[u8], emit: &mut F) -> ParseSummary
    where
        F: FnMut(&MsgHeader, &[u8]) -> bool,
    {
        let mut sum = ParseSummary::default();
        match self.mode {
            LengthMode::Datagram => self.emit_datagram(chunk, emit, &mut sum),
            LengthMode::Stream(msg_len) => self.stream_external(acc, chunk, msg_len, emit, &mut sum),
        }
        sum
    }

    fn emit_datagram<F>(&self, data: &[u8], emit: &mut F, sum: &mut ParseSummary)
    where
        F: FnMut(&MsgHeader, &[u8]) -> bool,
    {
        if data.len() < HEADER_SIZE {
            sum.bad_headers += 1;
            return;
        }
        let hdr = MsgHeader::read_from(data);
        if !self.limits.is_valid_header(&hdr, data.len()) {
            sum.bad_headers += 1;
            return;
        }
        sum.emitted += 1;
        if !emit(&hdr, data) {
            sum.stopped = true;
        }
    }

    fn stream_in_place<F>(
        &self,
        acc: &mut RecvAccumulator,
        mut n: usize,
        msg_len: usize,
        emit: &mut F,
        sum: &mut ParseSummary,
    ) where
        F: FnMut(&MsgHeader, &[u8]) -> bool,
    {
        loop {
            // 1: header not complete yet
            if acc.cur_offset + n < HEADER_SIZE {
                acc.cur_offset += n;
                acc.cur_size = acc
                    .cur_size
                    .saturating_sub(n)
                    .max(HEADER_SIZE - acc.cur_offset);
                return;
            }

            // 2: header available at cur_start, decode and validate
            let hdr = MsgHeader::read_from(&acc.buf[acc.cur_start..]);
            if !self.limits.is_valid_header(&hdr, msg_len) {
                sum.bad_headers += 1;
                if acc.cur_offset > 0 {
                    // The header spanned a recv boundary; only the prefix
                    // accumulated before this read is stale. Keep this read's
                    // bytes and reparse them from a clean state.
                    let chunk_start = acc.cur_start + acc.cur_offset;
                    acc.buf.copy_within(chunk_start..chunk_start + n, 0);
                    acc.reset();
                    continue;
                }
                // Garbage begins inside this read: drop the rest of it.
                acc.reset();
                return;
            }

            // 3: message not complete yet
            if acc.cur_offset + n < msg_len {
                acc.cur_offset += n;
                acc.cur_size = msg_len - acc.cur_offset;
                return;
            }

            // 5/6: one complete message at cur_start
            let consumed = msg_len - acc.cur_offset;
            sum.emitted += 1;
            let keep = emit(&hdr, &acc.buf[acc.cur_start..acc.cur_start + msg_len]);
            n -= consumed;
            if !keep {
                sum.stopped = true;
                acc.reset();
                return;
            }
            if n == 0 {
                acc.reset();
                return;
            }
            acc.cur_start += msg_len;
            acc.cur_offset = 0;
        }
    }

    fn stream_external<F>(
        &self,
        acc: &mut RecvAccumulator,
        chunk: &[u8],
        msg_len: usize,
        emit: &mut F,
        sum: &mut ParseSummary,
    ) where
        F: FnMut(&MsgHeader, &[u8]) -> bool,
    {
        let mut pos = 0usize;

        // Resume a pending partial by copying into the accumulator.
        while acc.cur_offset > 0 && pos < chunk.len() {
            let take = acc.cur_size.min(chunk.len() - pos);
            let dst = acc.cur_start + acc.cur_offset;
            acc.buf[dst..dst + take].copy_from_slice(&chunk[pos..pos + take]);
            pos += take;
            let filled = acc.cur_offset + take;

            if filled < HEADER_SIZE {
                acc.cur_offset = filled;
                acc.cur_size = HEADER_SIZE - filled;
                return; // chunk exhausted
            }
            let hdr = MsgHeader::read_from(&acc.buf[acc.cur_start..]);
            if !self.limits.is_valid_header(&hdr, msg_len) {
                sum.bad_headers += 1;
                // Stale prefix from earlier reads; reparse this chunk whole.
                acc.reset();
                pos = 0;
                break;
            }
            if filled < msg_len {
                acc.cur_offset = filled;
                acc.cur_size = msg_len - filled;
                if pos >= chunk.len() {
                    return;
                }
                continue;
            }
            sum.emitted += 1;
            let keep = emit(&hdr, &acc.buf[acc.cur_start..acc.cur_start + msg_len]);
            acc.reset();
            if !keep {
                sum.stopped = true;
                return;
            }
            break;
        }

        // Direct scan: emit whole messages straight out of the chunk.
        loop {
            let avail = chunk.len() - pos;
            if avail == 0 {
                return;
            }
            if avail < HEADER_SIZE {
                break;
            }
            let hdr = MsgHeader::read_from(&chunk[pos..]);
            if !self.limits.is_valid_header(&hdr, msg_len) {
                sum.bad_headers += 1;
                acc.reset();
                return; // drop the rest of this read
            }
            if avail < msg_len {
                break;
            }
            sum.emitted += 1;
            let keep = emit(&hdr, &chunk[pos..pos + msg_len]);
            pos += msg_len;
            if !keep {
                sum.stopped = true;
                acc.reset();
                return;
            }
        }

        // Stash the trailing partial.
        let rem = chunk.len() - pos;
        acc.buf[..rem].copy_from_slice(&chunk[pos..]);
        acc.cur_start = 0;
        acc.cur_offset = rem;
        acc.cur_size = if rem < HEADER_SIZE { HEADER_SIZE - rem } else { msg_len - rem };
    }
}
