use std::{fmt, marker::PhantomData};

use super::{DecodeError, Dialect, Limits, MAX_HEADER_LEN, Transition};
use crate::msg::{BodyMut, HeapAllocator, Msg, MsgAllocator};

/// Result of feeding bytes to a [`Decoder`].
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// All the input was consumed without completing a message.
    MoreData,
    /// A message was completed. Input past it was left unconsumed.
    Message(Msg),
}

enum State<S> {
    Header(S),
    Body { body: BodyMut, flags: u8 },
}

/// Incremental decoder turning a byte stream into messages.
///
/// # Examples
///
/// ```
/// use msgpipe::codec::{Decoded, Decoder, V2};
///
/// let mut decoder = Decoder::<V2>::new();
/// let wire = [0x00, 0x02, b'h', b'i', 0x00];
///
/// let (decoded, used) = decoder.decode(&wire).unwrap();
/// assert_eq!(used, 4);
/// let Decoded::Message(msg) = decoded else { panic!() };
/// assert_eq!(msg.data(), b"hi");
///
/// // The next frame is incomplete.
/// assert_eq!(decoder.decode(&wire[used..]).unwrap(), (Decoded::MoreData, 1));
/// ```
pub struct Decoder<D: Dialect, A = HeapAllocator> {
    state: State<D::Step>,
    header: [u8; MAX_HEADER_LEN],
    // Bytes of the current target already filled.
    filled: usize,
    limits: Limits,
    alloc: A,
    _dialect: PhantomData<D>,
}

impl<D: Dialect> Decoder<D> {
    pub fn new() -> Self {
        Self {
            state: State::Header(D::START),
            header: [0; MAX_HEADER_LEN],
            filled: 0,
            limits: Limits::default(),
            alloc: HeapAllocator,
            _dialect: PhantomData,
        }
    }
}

impl<D: Dialect> Default for Decoder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dialect, A: MsgAllocator> Decoder<D, A> {
    /// Rejects messages larger than `max` bytes. `None` means unlimited.
    #[must_use]
    pub fn max_msg_size(mut self, max: Option<u64>) -> Self {
        self.limits.max_msg_size = max;
        self
    }

    /// Allocates message bodies with `alloc`.
    #[must_use]
    pub fn allocator<B: MsgAllocator>(self, alloc: B) -> Decoder<D, B> {
        Decoder {
            state: self.state,
            header: self.header,
            filled: self.filled,
            limits: self.limits,
            alloc,
            _dialect: PhantomData,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Consumes bytes from `data` until a message is complete or the input
    /// runs out.
    ///
    /// Returns the outcome along with the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, after which the decoder must be discarded.
    pub fn decode(&mut self, data: &[u8]) -> Result<(Decoded, usize), DecodeError> {
        let mut used = 0;
        loop {
            let target = self.target();
            if target.is_empty() {
                if let Some(msg) = self.step()? {
                    return Ok((Decoded::Message(msg), used));
                }
                continue;
            }
            if used == data.len() {
                return Ok((Decoded::MoreData, used));
            }
            let n = target.len().min(data.len() - used);
            target[..n].copy_from_slice(&data[used..used + n]);
            self.filled += n;
            used += n;
        }
    }

    /// The bytes the decoder is waiting for.
    ///
    /// Reading straight into this buffer and calling
    /// [`commit`](Self::commit) avoids a copy, which pays off for large
    /// message bodies.
    pub fn read_buf(&mut self) -> &mut [u8] {
        self.target()
    }

    /// Marks `n` bytes of [`read_buf`](Self::read_buf) as filled, returning
    /// the message this completes, if any.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, after which the decoder must be discarded.
    pub fn commit(&mut self, n: usize) -> Result<Option<Msg>, DecodeError> {
        debug_assert!(n <= self.target().len(), "Committing more than the read buffer");
        self.filled += n;
        while self.target().is_empty() {
            if let Some(msg) = self.step()? {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }

    fn target(&mut self) -> &mut [u8] {
        match &mut self.state {
            State::Header(step) => &mut self.header[self.filled..D::header_len(*step)],
            State::Body { body, .. } => &mut body[self.filled..],
        }
    }

    /// Runs the next step once the current target is complete.
    fn step(&mut self) -> Result<Option<Msg>, DecodeError> {
        self.filled = 0;
        let next = match &self.state {
            State::Header(step) => {
                let header = &self.header[..D::header_len(*step)];
                D::next(*step, header, &self.limits)?
            }
            State::Body { .. } => Transition::Header(D::START),
        };

        let prev = match next {
            Transition::Header(step) => std::mem::replace(&mut self.state, State::Header(step)),
            Transition::Body { size, flags } => {
                let body = self.alloc.allocate(size);
                std::mem::replace(&mut self.state, State::Body { body, flags })
            }
        };

        match prev {
            State::Body { body, flags } => Ok(Some(Msg::with_flags(body.freeze(), flags))),
            State::Header(_) => Ok(None),
        }
    }
}

impl<D: Dialect, A> fmt::Debug for Decoder<D, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Decoder");
        match &self.state {
            State::Header(step) => s.field("step", step),
            State::Body { body, flags } => s.field("body", &body.len()).field("flags", flags),
        };
        s.field("filled", &self.filled).field("limits", &self.limits).finish()
    }
}
