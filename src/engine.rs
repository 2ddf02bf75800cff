//! Stream engine binding a pipe endpoint to a byte stream.
//!
//! The engine runs as a background tokio task. Messages written into the
//! peer endpoint are encoded and written to the stream, and messages decoded
//! from the stream are written into the pipe for the peer endpoint to read.
//!
//! ```text
//!                 ┌────────────── EngineTask ──────────────┐
//!  user Pipe <==> │ engine Pipe ─▶ Encoder ─▶ write half ─▶│──▶ stream
//!                 │ engine Pipe ◀─ Decoder ◀─ read half  ◀─│◀── stream
//!                 └────────────────────────────────────────┘
//! ```
//!
//! Flow control carries over from the pipe: once the pipe is full the engine
//! stops reading from the stream until the peer endpoint catches up.
//!
//! When the stream ends, fails, carries malformed data or the engine is
//! stopped, the engine terminates its endpoint and keeps serving the
//! termination handshake until the pipe is
//! [`Terminated`](crate::PipeState::Terminated).
#[cfg(feature = "stats")]
use std::sync::atomic::{AtomicU64, Ordering};
use std::{marker::PhantomData, sync::Arc};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffers::Payload,
    codec::{DEFAULT_BUFFER_SIZE, DecodeError, Decoded, Decoder, Dialect, Encoder, V2},
    msg::{Msg, MsgSource},
    pipe::Pipe,
};

/// Errors ending an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Reading from or writing to the stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent malformed data.
    #[error("Protocol error: {0}")]
    Decode(#[from] DecodeError),
}

/// Creates an [`EngineBuilder`] binding `pipe` to `stream`.
///
/// The [`V2`] dialect is used unless another one is selected with
/// [`EngineBuilder::dialect`].
///
/// # Examples
///
/// ```no_run
/// use msgpipe::{Msg, codec::V1, engine, pipe};
///
/// # async fn run() -> std::io::Result<()> {
/// let stream = tokio::net::TcpStream::connect("127.0.0.1:5555").await?;
/// let (mut user, engine_end) = pipe::pair().build();
/// let task = engine::builder(stream, engine_end).dialect::<V1>().build();
///
/// user.write(Msg::new(b"hello".as_slice())).unwrap();
/// user.flush();
///
/// // The engine finishes once the user endpoint acknowledges termination.
/// let stopping = task.stop();
/// loop {
///     user.process_commands(&mut ());
///     while user.read().is_some() {}
///     if user.is_terminated() || user.wait_commands().await.is_err() {
///         break;
///     }
/// }
/// stopping.await.unwrap().unwrap();
/// # Ok(())
/// # }
/// ```
pub fn builder<S>(stream: S, pipe: Pipe) -> EngineBuilder<S, V2> {
    EngineBuilder {
        stream,
        pipe,
        buffer_size: DEFAULT_BUFFER_SIZE,
        max_msg_size: None,
        _dialect: PhantomData,
    }
}

/// Builder for an engine task, see [`builder`].
pub struct EngineBuilder<S, D> {
    stream: S,
    pipe: Pipe,
    buffer_size: usize,
    max_msg_size: Option<u64>,
    _dialect: PhantomData<D>,
}

impl<S, D> EngineBuilder<S, D>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    D: Dialect + Send + 'static,
    D::Step: Send,
{
    /// Selects the wire format.
    #[must_use]
    pub fn dialect<D2: Dialect>(self) -> EngineBuilder<S, D2> {
        EngineBuilder {
            stream: self.stream,
            pipe: self.pipe,
            buffer_size: self.buffer_size,
            max_msg_size: self.max_msg_size,
            _dialect: PhantomData,
        }
    }

    /// Size of the read and write buffers.
    ///
    /// Message bodies at least this large bypass the buffers.
    ///
    /// # Default
    ///
    /// 8192 bytes.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Largest message accepted from the stream. `None` means unlimited.
    ///
    /// # Default
    ///
    /// Unlimited.
    #[must_use]
    pub fn max_msg_size(mut self, max: Option<u64>) -> Self {
        self.max_msg_size = max;
        self
    }

    /// Spawns the engine on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    #[must_use]
    pub fn build(self) -> EngineTask<S> {
        let Self {
            stream,
            pipe,
            buffer_size,
            max_msg_size,
            _dialect,
        } = self;

        let token = CancellationToken::new();
        let inner = Arc::new(EngineInner {
            #[cfg(feature = "stats")]
            stats: EngineCounters::default(),
        });

        let inbound = Inbound {
            decoder: Decoder::<D>::new().max_msg_size(max_msg_size),
            buf: vec![0; buffer_size].into_boxed_slice(),
            pos: 0,
            len: 0,
            stalled: None,
        };
        let outbound = Outbound {
            encoder: Encoder::<D>::new().buffer_size(buffer_size),
            buf: vec![0; buffer_size].into_boxed_slice(),
            len: 0,
            body: Payload::empty(),
            pos: 0,
        };

        let handle = tokio::spawn(run(stream, pipe, inbound, outbound, inner.clone(), token.clone()));
        EngineTask { handle, token, inner }
    }
}

#[cfg(feature = "stats")]
#[derive(Default)]
struct EngineCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    msgs_in: AtomicU64,
    msgs_out: AtomicU64,
}

/// Snapshot of engine statistics.
#[cfg(feature = "stats")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct EngineStats {
    /// Bytes read from the stream.
    pub bytes_in: u64,
    /// Bytes written to the stream.
    pub bytes_out: u64,
    /// Messages decoded and written into the pipe.
    pub msgs_in: u64,
    /// Messages read from the pipe for encoding.
    pub msgs_out: u64,
}

struct EngineInner {
    #[cfg(feature = "stats")]
    stats: EngineCounters,
}

impl EngineInner {
    #[cfg(feature = "stats")]
    fn count(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Handle to a running engine.
///
/// Dropping the handle leaves the engine running until its pipe terminates.
pub struct EngineTask<S> {
    handle: JoinHandle<Result<S, EngineError>>,
    token: CancellationToken,
    #[cfg_attr(not(feature = "stats"), allow(dead_code))]
    inner: Arc<EngineInner>,
}

impl<S> EngineTask<S> {
    /// Returns whether the engine has finished, either because its pipe
    /// terminated or because it was stopped.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the engine to finish on its own, returning the stream.
    pub fn join(self) -> JoinHandle<Result<S, EngineError>> {
        self.handle
    }

    /// Stops the engine and returns a handle to await its completion.
    ///
    /// The engine stops reading and terminates its pipe endpoint without
    /// delay. It completes once the user endpoint has acknowledged the
    /// termination (or was dropped), writing out the bytes already encoded and
    /// handing the stream back.
    pub fn stop(self) -> JoinHandle<Result<S, EngineError>> {
        self.token.cancel();
        self.handle
    }

    #[cfg(feature = "stats")]
    pub fn stats(&self) -> EngineStats {
        let stats = &self.inner.stats;
        EngineStats {
            bytes_in: stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: stats.bytes_out.load(Ordering::Relaxed),
            msgs_in: stats.msgs_in.load(Ordering::Relaxed),
            msgs_out: stats.msgs_out.load(Ordering::Relaxed),
        }
    }
}

/// Stream to pipe direction.
struct Inbound<D: Dialect> {
    decoder: Decoder<D>,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    // Decoded message the pipe had no room for.
    stalled: Option<Msg>,
}

impl<D: Dialect> Inbound<D> {
    fn wants_input(&self) -> bool {
        self.stalled.is_none() && self.pos == self.len
    }

    fn discard(&mut self) {
        self.pos = self.len;
        self.stalled = None;
    }

    /// Where the next read goes, and whether that is the decoder itself.
    fn read_target(&mut self) -> (&mut [u8], bool) {
        if self.decoder.read_buf().len() >= self.buf.len() {
            (self.decoder.read_buf(), true)
        } else {
            (&mut self.buf[..], false)
        }
    }

    fn received(&mut self, n: usize, direct: bool) -> Result<(), DecodeError> {
        if direct {
            self.stalled = self.decoder.commit(n)?;
        } else {
            self.pos = 0;
            self.len = n;
        }
        Ok(())
    }

    /// Decodes buffered bytes into the pipe until it is full. Returns the
    /// number of messages delivered.
    fn deliver(&mut self, pipe: &mut Pipe) -> Result<usize, DecodeError> {
        let mut delivered = 0;
        loop {
            if let Some(msg) = self.stalled.take() {
                if let Err(msg) = pipe.write(msg) {
                    self.stalled = Some(msg);
                    break;
                }
                delivered += 1;
            }
            if self.pos == self.len {
                break;
            }
            let (decoded, used) = self.decoder.decode(&self.buf[self.pos..self.len])?;
            self.pos += used;
            if let Decoded::Message(msg) = decoded {
                self.stalled = Some(msg);
            }
        }
        if delivered > 0 {
            pipe.flush();
        }
        Ok(delivered)
    }
}

/// Pipe to stream direction.
struct Outbound<D: Dialect> {
    encoder: Encoder<D>,
    buf: Box<[u8]>,
    len: usize,
    // Body going out without a copy, empty when `buf` is in use.
    body: Payload,
    pos: usize,
}

impl<D: Dialect> Outbound<D> {
    fn pending(&self) -> &[u8] {
        if self.body.is_empty() {
            &self.buf[self.pos..self.len]
        } else {
            &self.body[self.pos..]
        }
    }

    /// Encodes more bytes once the pending ones are written. Returns the
    /// number of messages taken from `src`.
    fn refill(&mut self, src: &mut impl MsgSource) -> usize {
        if !self.pending().is_empty() {
            return 0;
        }
        self.pos = 0;
        self.len = 0;
        match self.encoder.take_body(self.buf.len()) {
            Some(body) => {
                self.body = body;
                0
            }
            None => {
                self.body = Payload::empty();
                let mut src = Counted { src, pulled: 0 };
                self.len = self.encoder.encode_into(&mut src, &mut self.buf);
                src.pulled
            }
        }
    }
}

struct Counted<'a, S> {
    src: &'a mut S,
    pulled: usize,
}

impl<S: MsgSource> MsgSource for Counted<'_, S> {
    fn pull_msg(&mut self) -> Option<Msg> {
        let msg = self.src.pull_msg()?;
        self.pulled += 1;
        Some(msg)
    }
}

#[cfg_attr(not(feature = "stats"), allow(unused_variables))]
async fn run<S, D>(
    stream: S,
    mut pipe: Pipe,
    mut inbound: Inbound<D>,
    mut outbound: Outbound<D>,
    inner: Arc<EngineInner>,
    token: CancellationToken,
) -> Result<S, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    D: Dialect,
{
    let (mut reader, mut writer): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
    let mut reading = true;
    let mut writing = true;
    let mut stopping = false;
    let mut error = None;

    macro_rules! fail {
        ($err:expr) => {{
            let err = EngineError::from($err);
            match &err {
                EngineError::Decode(e) => tracing::warn!(pipe = %pipe.id(), "Protocol error: {e}"),
                EngineError::Io(e) => tracing::debug!(pipe = %pipe.id(), "Stream failed: {e}"),
            }
            if error.is_none() {
                error = Some(err);
            }
            inbound.discard();
            reading = false;
            pipe.terminate(false);
        }};
    }

    loop {
        pipe.process_commands(&mut ());
        if pipe.is_terminated() {
            tracing::debug!(pipe = %pipe.id(), "Pipe terminated, closing the engine");
            break;
        }

        match inbound.deliver(&mut pipe) {
            Ok(_delivered) => {
                #[cfg(feature = "stats")]
                EngineInner::count(&inner.stats.msgs_in, _delivered);
            }
            Err(e) => fail!(e),
        }

        if writing {
            let _pulled = outbound.refill(&mut pipe);
            #[cfg(feature = "stats")]
            EngineInner::count(&inner.stats.msgs_out, _pulled);
        }

        let can_read = reading && inbound.wants_input();
        let can_write = writing && !outbound.pending().is_empty();
        let (target, direct) = inbound.read_target();

        select! {
            biased;

            _ = token.cancelled(), if !stopping => {
                tracing::debug!(pipe = %pipe.id(), "Engine stopping");
                stopping = true;
                reading = false;
                pipe.terminate(false);
            }

            res = pipe.wait_commands() => {
                if res.is_err() {
                    tracing::debug!(pipe = %pipe.id(), "Peer endpoint dropped");
                    break;
                }
            }

            res = reader.read(target), if can_read => match res {
                Ok(0) => {
                    tracing::debug!(pipe = %pipe.id(), "Stream closed by peer");
                    reading = false;
                    pipe.terminate(false);
                }
                Ok(n) => {
                    #[cfg(feature = "stats")]
                    EngineInner::count(&inner.stats.bytes_in, n);
                    if let Err(e) = inbound.received(n, direct) {
                        fail!(e);
                    }
                }
                Err(e) => fail!(e),
            },

            res = writer.write(outbound.pending()), if can_write => match res {
                Ok(n) => {
                    #[cfg(feature = "stats")]
                    EngineInner::count(&inner.stats.bytes_out, n);
                    outbound.pos += n;
                }
                Err(e) => {
                    writing = false;
                    fail!(e);
                }
            },
        }
    }

    if writing {
        // Bytes already encoded still go out.
        loop {
            let pending = outbound.pending();
            if pending.is_empty() {
                break;
            }
            let n = pending.len();
            writer.write_all(pending).await?;
            outbound.pos += n;
            #[cfg(feature = "stats")]
            EngineInner::count(&inner.stats.bytes_out, n);
            outbound.refill(&mut None::<Msg>);
        }
        writer.flush().await?;
    }

    match error {
        Some(err) => Err(err),
        None => Ok(reader.unsplit(writer)),
    }
}
