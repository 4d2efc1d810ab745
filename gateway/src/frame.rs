//! Frame Reader — per-connection stream reassembler (spec.md §4.1).
//!
//! Each protocol family gets its own reader because the two wire formats
//! don't share a framing shape (Jimi has start/end markers; Ruptela is bare
//! length-prefixed). Both expose the same `push`/`try_extract` shape so the
//! connection worker in `listener` doesn't need to care which family it's
//! driving.

use crate::checksum::{crc16_kermit, crc16_x25};
use crate::error::FramingError;

/// Buffered bytes beyond this, with no parseable frame found yet, are a
/// soft reset: drop the buffer and start fresh (spec.md §4.1).
const SAFETY_CEILING: usize = 10 * 1024;

const JIMI_START_SHORT: u16 = 0x7878;
const JIMI_START_LONG: u16 = 0x7979;
const JIMI_END: u16 = 0x0D0A;

/// A validated, checksummed frame ready for the Frame Codec.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub bytes: Vec<u8>,
}

pub trait FrameReader {
    /// Append freshly read bytes to the internal buffer.
    fn push(&mut self, bytes: &[u8]);

    /// Attempt to pull one complete, validated frame out of the buffer.
    /// `Ok(None)` means "need more bytes"; `Err` is always recoverable
    /// (spec.md §4.1) — the connection stays open and the caller should
    /// call `try_extract` again after the next `push`.
    fn try_extract(&mut self) -> Result<Option<RawFrame>, FramingError>;
}

#[derive(Debug, Default)]
pub struct JimiFrameReader {
    buf: Vec<u8>,
}

impl JimiFrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn over_ceiling(&mut self) -> Option<FramingError> {
        if self.buf.len() > SAFETY_CEILING {
            self.buf.clear();
            Some(FramingError::BufferOverflow)
        } else {
            None
        }
    }
}

impl FrameReader for JimiFrameReader {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn try_extract(&mut self) -> Result<Option<RawFrame>, FramingError> {
        if self.buf.len() < 5 {
            return match self.over_ceiling() {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let start = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        if start != JIMI_START_SHORT && start != JIMI_START_LONG {
            self.buf.clear();
            return Err(FramingError::BadStartMarker(start as u32));
        }

        let declared_len = if start == JIMI_START_SHORT {
            self.buf[2] as usize
        } else {
            if self.buf.len() < 6 {
                return Ok(None);
            }
            u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
        };
        let total = declared_len + 5;

        if self.buf.len() < total {
            return match self.over_ceiling() {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();

        let end = u16::from_be_bytes([frame[total - 2], frame[total - 1]]);
        if end != JIMI_END {
            return Err(FramingError::BadEndMarker(end));
        }

        let expected = u16::from_be_bytes([frame[total - 4], frame[total - 3]]);
        let actual = crc16_x25(&frame[2..total - 4]);
        if actual != expected {
            return Err(FramingError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(RawFrame { bytes: frame }))
    }
}

#[derive(Debug, Default)]
pub struct RuptelaFrameReader {
    buf: Vec<u8>,
}

impl RuptelaFrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn over_ceiling(&mut self) -> Option<FramingError> {
        if self.buf.len() > SAFETY_CEILING {
            self.buf.clear();
            Some(FramingError::BufferOverflow)
        } else {
            None
        }
    }
}

impl FrameReader for RuptelaFrameReader {
    fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn try_extract(&mut self) -> Result<Option<RawFrame>, FramingError> {
        if self.buf.len() < 8 {
            return match self.over_ceiling() {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let declared_len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        let total = declared_len + 4;

        if self.buf.len() < total {
            return match self.over_ceiling() {
                Some(e) => Err(e),
                None => Ok(None),
            };
        }

        let frame: Vec<u8> = self.buf.drain(..total).collect();

        let expected = u16::from_be_bytes([frame[total - 2], frame[total - 1]]);
        let actual = crc16_kermit(&frame[2..total - 2]);
        if actual != expected {
            return Err(FramingError::ChecksumMismatch { expected, actual });
        }

        Ok(Some(RawFrame { bytes: frame }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jimi_login_frame() -> Vec<u8> {
        vec![
            0x78, 0x78, 0x11, 0x01, 0x03, 0x51, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0x36, 0x00,
            0x36, 0x01, 0x00, 0x01, 0x8C, 0xDD, 0x0D, 0x0A,
        ]
    }

    #[test]
    fn jimi_needs_more_on_partial_frame() {
        let mut r = JimiFrameReader::new();
        let full = jimi_login_frame();
        r.push(&full[..full.len() - 3]);
        assert!(matches!(r.try_extract(), Ok(None)));
    }

    #[test]
    fn jimi_extracts_complete_frame() {
        let mut r = JimiFrameReader::new();
        r.push(&jimi_login_frame());
        let frame = r.try_extract().unwrap().expect("frame");
        assert_eq!(frame.bytes, jimi_login_frame());
        assert!(matches!(r.try_extract(), Ok(None)));
    }

    #[test]
    fn jimi_rejects_flipped_checksum_byte_but_recovers() {
        let mut r = JimiFrameReader::new();
        let mut bad = jimi_login_frame();
        let last_crc_idx = bad.len() - 4;
        bad[last_crc_idx] ^= 0xFF;
        r.push(&bad);
        let err = r.try_extract().unwrap_err();
        assert!(matches!(err, FramingError::ChecksumMismatch { .. }));
        assert!(err.recoverable());

        // Connection stays open: the next valid frame still parses.
        r.push(&jimi_login_frame());
        let frame = r.try_extract().unwrap().expect("frame");
        assert_eq!(frame.bytes, jimi_login_frame());
    }

    #[test]
    fn jimi_two_frames_back_to_back() {
        let mut r = JimiFrameReader::new();
        let mut combined = jimi_login_frame();
        combined.extend_from_slice(&jimi_login_frame());
        r.push(&combined);
        assert!(r.try_extract().unwrap().is_some());
        assert!(r.try_extract().unwrap().is_some());
        assert!(matches!(r.try_extract(), Ok(None)));
    }

    #[test]
    fn jimi_buffer_overflow_resets() {
        let mut r = JimiFrameReader::new();
        r.push(&[0x00; SAFETY_CEILING + 1]);
        assert!(matches!(r.try_extract(), Err(FramingError::BadStartMarker(_))));
    }

    fn ruptela_records_frame(imei: u64, num_records_payload: &[u8]) -> Vec<u8> {
        let mut inner = Vec::new();
        inner.extend_from_slice(&imei.to_be_bytes());
        inner.push(1); // command id: Records
        inner.extend_from_slice(num_records_payload);
        let len = inner.len() as u16;
        let mut frame = Vec::new();
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&inner);
        let crc = crc16_kermit(&frame[2..]);
        frame.extend_from_slice(&crc.to_be_bytes());
        frame
    }

    #[test]
    fn ruptela_round_trips_simple_frame() {
        let frame_bytes = ruptela_records_frame(356938035643809, &[0, 0]);
        let mut r = RuptelaFrameReader::new();
        r.push(&frame_bytes);
        let frame = r.try_extract().unwrap().expect("frame");
        assert_eq!(frame.bytes, frame_bytes);
    }

    #[test]
    fn ruptela_bad_crc_is_discarded_then_recovers() {
        let mut bad = ruptela_records_frame(356938035643809, &[0, 0]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let mut r = RuptelaFrameReader::new();
        r.push(&bad);
        assert!(matches!(
            r.try_extract(),
            Err(FramingError::ChecksumMismatch { .. })
        ));

        let good = ruptela_records_frame(356938035643809, &[0, 0]);
        r.push(&good);
        assert!(r.try_extract().unwrap().is_some());
    }
}
