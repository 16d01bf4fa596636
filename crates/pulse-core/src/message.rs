//! On-wire message header and the client/server scratch message.
//!
//! Wire layout, identical for every transport:
//!
//! ```text
//! bytes [0..8)   sequence number, big-endian u64
//! bytes [8..12)  flags, big-endian u32 (CLIENT=1, PONG_REQUEST=2, WARMUP=4)
//! bytes [12..)   opaque payload, preserved verbatim on reply
//! ```
//!
//! The header is always packed explicitly as two big-endian integers, never
//! through struct layout. Total message length travels out-of-band: it equals
//! the datagram size on datagram transports and the session's agreed
//! `msg_size` on stream transports, so both peers must be configured with the
//! same `-m`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{PulseError, Result};

/// Effective header size on the wire.
pub const HEADER_SIZE: usize = 12;

pub const FLAG_CLIENT: u32 = 1 << 0;
pub const FLAG_PONG_REQUEST: u32 = 1 << 1;
pub const FLAG_WARMUP: u32 = 1 << 2;
const KNOWN_FLAGS: u32 = FLAG_CLIENT | FLAG_PONG_REQUEST | FLAG_WARMUP;

// ---------------------------------------------------------------------------
// MsgHeader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgHeader {
    pub sequence: u64,
    pub flags: u32,
}

impl MsgHeader {
    pub fn new(sequence: u64) -> Self {
        MsgHeader { sequence, flags: 0 }
    }

    /// Decode from network byte order. `buf` must hold at least `HEADER_SIZE`.
    #[inline]
    pub fn read_from(buf: &[u8]) -> MsgHeader {
        let sequence = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let flags = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        MsgHeader { sequence, flags }
    }

    /// Encode to network byte order. `buf` must hold at least `HEADER_SIZE`.
    #[inline]
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..12].copy_from_slice(&self.flags.to_be_bytes());
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.flags & FLAG_CLIENT != 0
    }

    #[inline]
    pub fn set_client(&mut self) {
        self.flags |= FLAG_CLIENT;
    }

    #[inline]
    pub fn set_server(&mut self) {
        self.flags &= !FLAG_CLIENT;
    }

    #[inline]
    pub fn is_pong_request(&self) -> bool {
        self.flags & FLAG_PONG_REQUEST != 0
    }

    #[inline]
    pub fn set_pong_request(&mut self) {
        self.flags |= FLAG_PONG_REQUEST;
    }

    #[inline]
    pub fn clear_pong_request(&mut self) {
        self.flags &= !FLAG_PONG_REQUEST;
    }

    #[inline]
    pub fn is_warmup(&self) -> bool {
        self.flags & FLAG_WARMUP != 0
    }

    #[inline]
    pub fn set_warmup(&mut self) {
        self.flags |= FLAG_WARMUP;
    }

    #[inline]
    pub fn clear_warmup(&mut self) {
        self.flags &= !FLAG_WARMUP;
    }
}

// ---------------------------------------------------------------------------
// Per-run limits
// ---------------------------------------------------------------------------

/// Maximum message size and sequence number for the run, fixed at bring-up.
/// Sizes the receive accumulators and the timestamp tables, and bounds what a
/// header is allowed to claim.
#[derive(Debug, Clone, Copy)]
pub struct MsgLimits {
    pub max_size: usize,
    pub max_seq_no: u64,
}

impl MsgLimits {
    pub fn new(max_size: usize, max_seq_no: u64) -> Result<Self> {
        if max_size < HEADER_SIZE {
            return Err(PulseError::BadArgument(format!(
                "message size {} below header size {}",
                max_size, HEADER_SIZE
            )));
        }
        if max_seq_no == 0 {
            return Err(PulseError::BadArgument("max sequence number is zero".into()));
        }
        Ok(MsgLimits { max_size, max_seq_no })
    }

    /// A well-formed header carries only known flag bits, a sequence inside
    /// `[1, max_seq_no]`, and a length inside `[HEADER_SIZE, max_size]`.
    #[inline]
    pub fn is_valid_header(&self, hdr: &MsgHeader, len: usize) -> bool {
        hdr.flags & !KNOWN_FLAGS == 0
            && hdr.sequence >= 1
            && hdr.sequence <= self.max_seq_no
            && len >= HEADER_SIZE
            && len <= self.max_size
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// The message a client or server sends from. Owns a max-size buffer whose
/// payload bytes are randomized once at construction (seeded via `SEED`), so
/// data-integrity checks have real content to compare.
pub struct Message {
    buf: Vec<u8>,
    len: usize,
    header: MsgHeader,
}

impl Message {
    pub fn new(limits: &MsgLimits, len: usize, seed: u64) -> Result<Self> {
        if len < HEADER_SIZE || len > limits.max_size {
            return Err(PulseError::BadArgument(format!(
                "message length {} outside [{}, {}]",
                len, HEADER_SIZE, limits.max_size
            )));
        }
        let mut buf = vec![0u8; limits.max_size];
        let mut rng = StdRng::seed_from_u64(seed);
        rng.fill(&mut buf[HEADER_SIZE..]);
        Ok(Message { buf, len, header: MsgHeader::default() })
    }

    #[inline]
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut MsgHeader {
        &mut self.header
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    #[inline]
    pub fn set_sequence(&mut self, seq: u64) {
        self.header.sequence = seq;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the active length (playback varies it per schedule step).
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len < HEADER_SIZE || len > self.buf.len() {
            return Err(PulseError::BadArgument(format!(
                "message length {} outside [{}, {}]",
                len,
                HEADER_SIZE,
                self.buf.len()
            )));
        }
        self.len = len;
        Ok(())
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..self.len]
    }

    /// Serialize the header into the buffer in network order and return the
    /// wire image of the active message.
    #[inline]
    pub fn wire(&mut self) -> &[u8] {
        self.header.write_to(&mut self.buf);
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        for seq in [1u64, 2, 0x0123_4567_89ab_cdef, u64::MAX] {
            for flags in 0u32..=7 {
                let h = MsgHeader { sequence: seq, flags };
                let mut buf = [0u8; HEADER_SIZE];
                h.write_to(&mut buf);
                assert_eq!(MsgHeader::read_from(&buf), h);
            }
        }
    }

    #[test]
    fn test_header_is_big_endian_on_the_wire() {
        let mut h = MsgHeader::new(1);
        h.set_client();
        h.set_pong_request();
        let mut buf = [0u8; HEADER_SIZE];
        h.write_to(&mut buf);
        assert_eq!(&buf[0..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&buf[8..12], &[0, 0, 0, 3]);
    }

    #[test]
    fn test_flag_operations() {
        let mut h = MsgHeader::new(5);
        h.set_client();
        h.set_pong_request();
        h.set_warmup();
        assert!(h.is_client() && h.is_pong_request() && h.is_warmup());
        h.set_server();
        assert!(!h.is_client());
        assert!(h.is_pong_request() && h.is_warmup());
        h.clear_pong_request();
        h.clear_warmup();
        assert_eq!(h.flags, 0);
    }

    #[test]
    fn test_header_validation() {
        let limits = MsgLimits::new(64, 1000).unwrap();
        let good = MsgHeader { sequence: 1, flags: FLAG_CLIENT | FLAG_PONG_REQUEST };
        assert!(limits.is_valid_header(&good, 14));
        // unknown flag bits
        let bad_flags = MsgHeader { sequence: 1, flags: 0xff00_0000 };
        assert!(!limits.is_valid_header(&bad_flags, 14));
        // sequence outside [1, max]
        assert!(!limits.is_valid_header(&MsgHeader { sequence: 0, flags: 0 }, 14));
        assert!(!limits.is_valid_header(&MsgHeader { sequence: 1001, flags: 0 }, 14));
        // lengths
        assert!(!limits.is_valid_header(&good, HEADER_SIZE - 1));
        assert!(!limits.is_valid_header(&good, 65));
    }

    #[test]
    fn test_message_payload_is_seeded() {
        let limits = MsgLimits::new(64, 100).unwrap();
        let mut a = Message::new(&limits, 32, 1).unwrap();
        let b = Message::new(&limits, 32, 1).unwrap();
        let c = Message::new(&limits, 32, 2).unwrap();
        assert_eq!(a.payload(), b.payload());
        assert_ne!(a.payload(), c.payload());

        a.set_sequence(7);
        a.header_mut().set_client();
        let wire = a.wire().to_vec();
        assert_eq!(wire.len(), 32);
        let h = MsgHeader::read_from(&wire);
        assert_eq!(h.sequence, 7);
        assert!(h.is_client());
        assert_eq!(&wire[HEADER_SIZE..], b.payload());
    }

    #[test]
    fn test_message_rejects_bad_lengths() {
        let limits = MsgLimits::new(64, 100).unwrap();
        assert!(Message::new(&limits, HEADER_SIZE - 1, 0).is_err());
        assert!(Message::new(&limits, 65, 0).is_err());
        let mut m = Message::new(&limits, 14, 0).unwrap();
        assert!(m.set_len(65).is_err());
        assert!(m.set_len(64).is_ok());
    }
}
