//! Error types at the Frame Reader / Frame Codec seams.
//!
//! Neither type ever leaves the decode path as an unrecoverable exception
//! (spec.md §7): the Codec and Frame Reader return these as ordinary values,
//! and the session/listener layers decide what, if anything, to do.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("bad start marker: {0:#x}")]
    BadStartMarker(u32),
    #[error("bad end marker: {0:#x}")]
    BadEndMarker(u16),
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("declared length {declared} inconsistent with frame bounds")]
    InconsistentLength { declared: usize },
    #[error("buffer exceeded safety ceiling without a parseable frame")]
    BufferOverflow,
}

impl FramingError {
    /// Every framing error is recoverable at the connection level per
    /// spec.md §4.1 — the offending frame (or the whole buffer, for
    /// `BufferOverflow`) is discarded but the connection stays open.
    pub fn recoverable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload too short for variant: need {needed} bytes, have {have}")]
    PayloadTooShort { needed: usize, have: usize },
    #[error("decoded IMEI length {0} outside 14-16 digit range")]
    ImeiLengthOutOfRange(usize),
}
