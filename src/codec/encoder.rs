use std::{fmt, marker::PhantomData};

use super::{Dialect, MAX_HEADER_LEN};
use crate::{
    buffers::Payload,
    msg::{Msg, MsgSource},
};

/// Default size of the encoder batch buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

enum State {
    Idle,
    Header(Msg),
    Body(Msg),
}

/// Incremental encoder turning messages into a byte stream.
///
/// Small messages are batched into an internal buffer. A body at least as
/// large as that buffer is handed out directly instead of being copied.
///
/// # Examples
///
/// ```
/// use std::collections::VecDeque;
///
/// use msgpipe::{Msg, codec::{Encoder, V2}};
///
/// let mut encoder = Encoder::<V2>::new();
/// let mut queue = VecDeque::from([Msg::new(b"ab".as_slice()), Msg::new(b"c".as_slice())]);
///
/// assert_eq!(encoder.encode(&mut queue), [0, 2, b'a', b'b', 0, 1, b'c']);
/// assert!(encoder.encode(&mut queue).is_empty());
/// ```
pub struct Encoder<D: Dialect> {
    state: State,
    header: [u8; MAX_HEADER_LEN],
    header_len: usize,
    // Bytes of the current header or body already emitted.
    pos: usize,
    buf: Box<[u8]>,
    // Body handed out without copying.
    view: Payload,
    _dialect: PhantomData<D>,
}

impl<D: Dialect> Encoder<D> {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            header: [0; MAX_HEADER_LEN],
            header_len: 0,
            pos: 0,
            buf: vec![0; DEFAULT_BUFFER_SIZE].into_boxed_slice(),
            view: Payload::empty(),
            _dialect: PhantomData,
        }
    }

    /// Sets the batch buffer size, which is also the threshold above which
    /// bodies skip the copy.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buf = vec![0; size.max(1)].into_boxed_slice();
        self
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Idle)
    }

    /// Starts encoding `msg`. Fails, handing the message back, if the previous
    /// one is not fully encoded yet.
    pub fn load_msg(&mut self, msg: Msg) -> Result<(), Msg> {
        if !self.is_idle() {
            return Err(msg);
        }
        self.header_len = D::encode_header(&msg, &mut self.header);
        self.pos = 0;
        self.state = State::Header(msg);
        Ok(())
    }

    /// Encodes the message in progress followed by messages pulled from
    /// `src`, returning the next chunk of bytes to write.
    ///
    /// An empty chunk means there is nothing left to encode. The chunk is
    /// only valid until the next call.
    pub fn encode<S: MsgSource + ?Sized>(&mut self, src: &mut S) -> &[u8] {
        if let Some(body) = self.take_body(self.buf.len()) {
            self.view = body;
            return &self.view;
        }
        self.view = Payload::empty();

        let mut buf = std::mem::take(&mut self.buf);
        let n = self.encode_into(src, &mut buf);
        self.buf = buf;
        &self.buf[..n]
    }

    /// Hands out the rest of the body in progress without copying it, if at
    /// least `min` bytes of it remain.
    pub fn take_body(&mut self, min: usize) -> Option<Payload> {
        let State::Body(msg) = &self.state else {
            return None;
        };
        if msg.size() - self.pos < min.max(1) {
            return None;
        }
        let body = msg.data().view(self.pos..)?;
        self.advance();
        Some(body)
    }

    /// Encodes into `out`, returning the number of bytes written.
    ///
    /// Stops when `out` is full or `src` runs dry. A message cut short
    /// carries on at the next call.
    pub fn encode_into<S: MsgSource + ?Sized>(&mut self, src: &mut S, out: &mut [u8]) -> usize {
        let mut written = 0;
        while written < out.len() {
            let data = match &self.state {
                State::Idle => {
                    let Some(msg) = src.pull_msg() else {
                        break;
                    };
                    // Idle: cannot fail.
                    let _ = self.load_msg(msg);
                    continue;
                }
                State::Header(_) => &self.header[self.pos..self.header_len],
                State::Body(msg) => &msg.data()[self.pos..],
            };
            let n = data.len().min(out.len() - written);
            out[written..written + n].copy_from_slice(&data[..n]);
            written += n;
            self.pos += n;
            if n == data.len() {
                self.advance();
            }
        }
        written
    }

    /// Moves past the completed header or body.
    fn advance(&mut self) {
        self.pos = 0;
        self.state = match std::mem::replace(&mut self.state, State::Idle) {
            State::Header(msg) if msg.size() > 0 => State::Body(msg),
            _ => State::Idle,
        };
    }
}

impl<D: Dialect> Default for Encoder<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Dialect> fmt::Debug for Encoder<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            State::Idle => "idle",
            State::Header(_) => "header",
            State::Body(_) => "body",
        };
        f.debug_struct("Encoder")
            .field("state", &state)
            .field("pos", &self.pos)
            .field("buffer_size", &self.buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::Rng;

    use super::*;
    use crate::{
        codec::{Decoded, Decoder, V1, V2},
        msg::flags,
    };

    fn random_msgs(n: usize, max_len: usize) -> VecDeque<Msg> {
        let mut rng = rand::rng();
        (0..n)
            .map(|_| {
                let len = rng.random_range(0..=max_len);
                let flags = if rng.random_bool(0.3) { flags::MORE } else { 0 };
                Msg::with_flags(Payload::rand(len), flags)
            })
            .collect()
    }

    /// Feeds `wire` to the decoder in random slices.
    fn decode_chopped<D: Dialect>(wire: &[u8]) -> Vec<Msg> {
        let mut rng = rand::rng();
        let mut decoder = Decoder::<D>::new();
        let mut out = Vec::new();
        let mut rest = wire;
        while !rest.is_empty() {
            let end = rng.random_range(1..=rest.len().min(64));
            let mut chunk = &rest[..end];
            while !chunk.is_empty() {
                let (decoded, used) = decoder.decode(chunk).unwrap();
                if let Decoded::Message(msg) = decoded {
                    out.push(msg);
                }
                chunk = &chunk[used..];
            }
            rest = &rest[end..];
        }
        out
    }

    fn round_trip<D: Dialect>() {
        let msgs = random_msgs(200, 600);
        let mut src = msgs.clone();
        let mut encoder = Encoder::<D>::new().buffer_size(97);
        let mut wire = Vec::new();
        loop {
            let chunk = encoder.encode(&mut src);
            if chunk.is_empty() {
                break;
            }
            wire.extend_from_slice(chunk);
        }
        assert!(encoder.is_idle());
        assert_eq!(decode_chopped::<D>(&wire), Vec::from(msgs));
    }

    #[test]
    fn round_trip_v1() {
        round_trip::<V1>();
    }

    #[test]
    fn round_trip_v2() {
        round_trip::<V2>();
    }

    #[test]
    fn batches_small_messages() {
        let mut src: VecDeque<_> = (0..4u8).map(|i| Msg::new(vec![i; 3])).collect();
        let mut encoder = Encoder::<V2>::new().buffer_size(12);
        // Two and a half frames fit.
        assert_eq!(encoder.encode(&mut src).len(), 12);
        assert_eq!(encoder.encode(&mut src).len(), 8);
        assert!(encoder.encode(&mut src).is_empty());
    }

    #[test]
    fn large_body_is_not_copied() {
        let body = Payload::rand(1000);
        let mut src = Some(Msg::new(body.clone()));
        let mut encoder = Encoder::<V2>::new().buffer_size(64);

        let header = encoder.encode(&mut src).to_vec();
        assert_eq!(header.len(), 64);
        assert_eq!(header[..9], [0x02, 0, 0, 0, 0, 0, 0, 0x03, 0xE8]);

        let rest = encoder.encode(&mut src);
        assert_eq!(rest.len(), 1000 - 55);
        assert_eq!(rest.as_ptr(), body[55..].as_ptr());
        assert!(encoder.is_idle());
    }

    #[test]
    fn load_msg_while_busy() {
        let mut encoder = Encoder::<V1>::new();
        encoder.load_msg(Msg::new(b"one".as_slice())).unwrap();
        let rejected = encoder.load_msg(Msg::new(b"two".as_slice())).unwrap_err();
        assert_eq!(rejected.data(), b"two");

        let mut out = [0; 3];
        assert_eq!(encoder.encode_into(&mut None, &mut out), 3);
        assert_eq!(out, [4, 0, b'o']);
        assert!(!encoder.is_idle());
        assert_eq!(encoder.encode_into(&mut None, &mut out), 2);
        assert!(encoder.is_idle());
    }

    #[test]
    fn read_buf_commit() {
        let msgs = VecDeque::from([Msg::new(Payload::rand(300)), Msg::new(b"tail".as_slice())]);
        let mut src = msgs.clone();
        let mut encoder = Encoder::<V2>::new();
        let wire = encoder.encode(&mut src).to_vec();

        let mut decoder = Decoder::<V2>::new();
        let mut got = Vec::new();
        let mut rest = wire.as_slice();
        while !rest.is_empty() {
            let target = decoder.read_buf();
            let n = target.len().min(rest.len()).min(7);
            target[..n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            got.extend(decoder.commit(n).unwrap());
        }
        assert_eq!(got, Vec::from(msgs));
    }
}
