//! Incremental wire codecs.
//!
//! Both directions run a small step machine over a current target buffer: the
//! header scratch bytes or the message body. Each call moves as many bytes as
//! are available into (or out of) the target. When the target is complete the
//! next step runs and picks the following target. Bytes may arrive or leave in
//! chunks of any size, down to a single byte at a time.
//!
//! A wire format is a [`Dialect`]: an enum of header decoding steps with a
//! pure transition function, plus a header encoder. The [`Decoder`] and
//! [`Encoder`] drive any dialect. Two dialects are provided:
//!
//! ```text
//! V1: | size: u8 (< 0xFF)          | flags: u8 | body: size - 1 bytes |
//!     | 0xFF | size: u64 big endian | flags: u8 | body: size - 1 bytes |
//!
//! V2: | flags: u8 (LARGE unset) | size: u8             | body: size bytes |
//!     | flags: u8 (LARGE set)   | size: u64 big endian | body: size bytes |
//! ```
mod decoder;
mod encoder;
mod v1;
mod v2;

use std::fmt;

pub use decoder::{Decoded, Decoder};
pub use encoder::{DEFAULT_BUFFER_SIZE, Encoder};
use thiserror::Error;
pub use v1::{V1, V1Step};
pub use v2::{V2, V2Step};

use crate::msg::Msg;

/// Largest header any dialect writes.
pub const MAX_HEADER_LEN: usize = 10;

/// Malformed or unacceptable input.
///
/// Decode errors are fatal for the stream: the decoder cannot resynchronise
/// and the connection must be dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The peer announced a message larger than the configured maximum.
    #[error("Message of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    /// The announced size cannot be represented on this platform.
    #[error("Message size {0} does not fit in memory")]
    Overflow(u64),

    /// A V1 frame announced a size of zero, leaving no room for the flags
    /// byte.
    #[error("Frame is missing its flags byte")]
    MissingFlags,
}

/// Constraints applied while decoding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum body size, `None` meaning unlimited.
    pub max_msg_size: Option<u64>,
}

impl Limits {
    /// Validates an announced body size.
    pub fn body_size(&self, size: u64) -> Result<usize, DecodeError> {
        match self.max_msg_size {
            Some(max) if size > max => return Err(DecodeError::TooLarge { size, max }),
            _ => {}
        }
        usize::try_from(size).map_err(|_| DecodeError::Overflow(size))
    }
}

/// Outcome of a completed header step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S> {
    /// Read another header field.
    Header(S),
    /// The header is complete: read a body of `size` bytes and deliver it
    /// with the message `flags`.
    Body { size: usize, flags: u8 },
}

/// A framing format.
pub trait Dialect {
    /// Header decoding steps.
    type Step: Copy + fmt::Debug;

    /// Step decoding starts from, and returns to after every message.
    const START: Self::Step;

    /// Number of header bytes the step reads.
    fn header_len(step: Self::Step) -> usize;

    /// Consumes the header bytes read by `step` and tells what comes next.
    fn next(step: Self::Step, header: &[u8], limits: &Limits) -> Result<Transition<Self::Step>, DecodeError>;

    /// Writes the header of `msg`, returning its length.
    fn encode_header(msg: &Msg, header: &mut [u8; MAX_HEADER_LEN]) -> usize;
}
