use super::{DecodeError, Dialect, Limits, MAX_HEADER_LEN, Transition};
use crate::msg::{Msg, flags};

/// The legacy framing.
///
/// The size prefix counts the flags byte along with the body. Sizes below
/// 255 fit in one byte; larger ones are escaped with `0xFF` followed by a
/// 64-bit big endian size. Only the MORE flag travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V1;

/// Header decoding steps of [`V1`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V1Step {
    OneByteSize,
    EightByteSize,
    /// Reading the flags byte of a frame whose body is `size` bytes.
    Flags { size: usize },
}

const ESCAPE: u8 = 0xFF;

impl V1 {
    fn sized(size: u64, limits: &Limits) -> Result<Transition<V1Step>, DecodeError> {
        // The announced size includes the flags byte.
        let Some(body) = size.checked_sub(1) else {
            return Err(DecodeError::MissingFlags);
        };
        let size = limits.body_size(body)?;
        Ok(Transition::Header(V1Step::Flags { size }))
    }
}

impl Dialect for V1 {
    type Step = V1Step;

    const START: V1Step = V1Step::OneByteSize;

    fn header_len(step: V1Step) -> usize {
        match step {
            V1Step::OneByteSize | V1Step::Flags { .. } => 1,
            V1Step::EightByteSize => 8,
        }
    }

    fn next(step: V1Step, header: &[u8], limits: &Limits) -> Result<Transition<V1Step>, DecodeError> {
        match step {
            V1Step::OneByteSize if header[0] == ESCAPE => Ok(Transition::Header(V1Step::EightByteSize)),
            V1Step::OneByteSize => Self::sized(u64::from(header[0]), limits),
            V1Step::EightByteSize => {
                let mut size = [0; 8];
                size.copy_from_slice(header);
                Self::sized(u64::from_be_bytes(size), limits)
            }
            V1Step::Flags { size } => Ok(Transition::Body {
                size,
                flags: header[0] & flags::MORE,
            }),
        }
    }

    fn encode_header(msg: &Msg, header: &mut [u8; MAX_HEADER_LEN]) -> usize {
        let size = msg.size() as u64 + 1;
        let more = msg.flags() & flags::MORE;
        if size < u64::from(ESCAPE) {
            header[0] = size as u8;
            header[1] = more;
            2
        } else {
            header[0] = ESCAPE;
            header[1..9].copy_from_slice(&size.to_be_bytes());
            header[9] = more;
            10
        }
    }
}
