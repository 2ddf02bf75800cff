use super::{DecodeError, Dialect, Limits, MAX_HEADER_LEN, Transition};
use crate::msg::{Msg, flags};

/// Wire flag bits.
mod wire {
    pub(super) const MORE: u8 = 1;
    pub(super) const LARGE: u8 = 1 << 1;
    pub(super) const COMMAND: u8 = 1 << 2;
}

/// The current framing.
///
/// A flags byte comes first. Its LARGE bit selects between a one-byte and a
/// 64-bit big endian size, which counts the body only. The MORE and COMMAND
/// flags travel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V2;

/// Header decoding steps of [`V2`]. The carried flags are already
/// translated to message flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Step {
    Flags,
    OneByteSize { flags: u8 },
    EightByteSize { flags: u8 },
}

impl Dialect for V2 {
    type Step = V2Step;

    const START: V2Step = V2Step::Flags;

    fn header_len(step: V2Step) -> usize {
        match step {
            V2Step::Flags | V2Step::OneByteSize { .. } => 1,
            V2Step::EightByteSize { .. } => 8,
        }
    }

    fn next(step: V2Step, header: &[u8], limits: &Limits) -> Result<Transition<V2Step>, DecodeError> {
        match step {
            V2Step::Flags => {
                let bits = header[0];
                let mut flags = 0;
                if bits & wire::MORE != 0 {
                    flags |= flags::MORE;
                }
                if bits & wire::COMMAND != 0 {
                    flags |= flags::COMMAND;
                }
                Ok(Transition::Header(if bits & wire::LARGE != 0 {
                    V2Step::EightByteSize { flags }
                } else {
                    V2Step::OneByteSize { flags }
                }))
            }
            V2Step::OneByteSize { flags } => Ok(Transition::Body {
                size: limits.body_size(u64::from(header[0]))?,
                flags,
            }),
            V2Step::EightByteSize { flags } => {
                let mut size = [0; 8];
                size.copy_from_slice(header);
                Ok(Transition::Body {
                    size: limits.body_size(u64::from_be_bytes(size))?,
                    flags,
                })
            }
        }
    }

    fn encode_header(msg: &Msg, header: &mut [u8; MAX_HEADER_LEN]) -> usize {
        let mut bits = 0;
        if msg.more() {
            bits |= wire::MORE;
        }
        if msg.is_command() {
            bits |= wire::COMMAND;
        }
        let size = msg.size();
        if size > usize::from(u8::MAX) {
            header[0] = bits | wire::LARGE;
            header[1..9].copy_from_slice(&(size as u64).to_be_bytes());
            9
        } else {
            header[0] = bits;
            header[1] = size as u8;
            2
        }
    }
}
