//! Bounded message pipes between two endpoints.
//!
//! A pipe pair is created with [`pair()`]. Each [`Pipe`] endpoint writes into
//! one lock-free queue and reads from the other, so each endpoint may live on
//! its own thread. Everything that must reach the other endpoint besides the
//! messages themselves (activation, watermark changes, the termination
//! handshake) travels as a command through a per-endpoint mailbox and takes
//! effect when the receiving owner calls [`Pipe::process_commands`].
//!
//! # Flow control
//!
//! A writer may have at most `hwm` complete messages outstanding, i.e. written
//! but not yet read by the peer. Frames of a multipart message only count once,
//! on the final frame. A write past the high-water mark fails and hands the
//! message back. Read counts are published to the writer as soon as messages
//! are consumed, and every `lwm` messages the reader additionally sends an
//! activation command so that a writer that saw the pipe full is told it can
//! resume ([`PipeEvents::write_activated`]).
//!
//! # Termination
//!
//! ```text
//!            terminate()                               peer's ack
//!   Active ---------------> Terminating ------------------------------> Terminated
//!     |  \                      | peer's term (crossed requests)             ^
//!     |   \                     v                                            |
//!     |    \              DoubleTerminated ----------- peer's ack -----------+
//!     |     \                                                                |
//!     |      `-- peer's term --> WaitingForDelimiter --delimiter read--.     |
//!     |          (delay)                                               v     |
//!     |                                          TermAckSent --- peer's ack -'
//!     |          peer's term (no delay) ------------^    ^
//!     `-- delimiter read --> DelimiterReceived --------'   (peer's term)
//! ```
//!
//! [`Pipe::terminate`] can be called at any time from either endpoint and any
//! number of times. Both endpoints always converge to
//! [`PipeState::Terminated`], each reporting it once through
//! [`PipeEvents::pipe_terminated`].
pub(crate) mod mailbox;
pub(crate) mod ypipe;

use std::{
    collections::{HashMap, hash_map},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crossbeam_utils::CachePadded;
use mailbox::{MailboxReceiver, MailboxSender, mailbox};
use ypipe::{YPipeReader, YPipeWriter, ypipe};

use crate::{
    buffers::Payload,
    collections::DEFAULT_CHUNK_SIZE,
    msg::{Msg, MsgSource},
    sync::WaitError,
};

/// Default high-water mark, in messages.
pub const DEFAULT_HWM: usize = 1000;

/// Above twice this value the low-water mark trails the high-water mark by
/// this many messages instead of sitting halfway.
const MAX_WM_DELTA: usize = 1024;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    fn next() -> Self {
        Self(NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

/// Lifecycle of a pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    /// Messages flow in both directions.
    Active,
    /// The delimiter was read before the peer's termination request.
    DelimiterReceived,
    /// The peer asked to terminate, pending messages are still being read.
    WaitingForDelimiter,
    /// The termination request was acknowledged, waiting for the peer's ack.
    TermAckSent,
    /// Termination was requested, waiting for the peer's ack.
    Terminating,
    /// Both endpoints requested termination concurrently.
    DoubleTerminated,
    /// The handshake completed; the endpoint can be dropped.
    Terminated,
}

/// Owner-side notifications produced by [`Pipe::process_commands`].
///
/// All methods default to doing nothing.
pub trait PipeEvents {
    /// Messages are available again after a read came up empty.
    fn read_activated(&mut self, _id: PipeId) {}

    /// The pipe accepts writes again after having been found full.
    fn write_activated(&mut self, _id: PipeId) {}

    /// The peer replaced the pipe's queue, unread messages were discarded.
    fn hiccuped(&mut self, _id: PipeId) {}

    /// The termination handshake completed.
    fn pipe_terminated(&mut self, _id: PipeId) {}
}

impl PipeEvents for () {}

/// What travels through the message queues.
pub(crate) enum Item {
    Msg(Msg),
    Delimiter,
}

impl Item {
    fn is_delimiter(&self) -> bool {
        matches!(self, Item::Delimiter)
    }
}

pub(crate) enum Command {
    ActivateRead,
    ActivateWrite,
    Hiccup {
        out: YPipeWriter<Item>,
        stale: YPipeReader<Item>,
    },
    PipeTerm,
    PipeTermAck,
    PipeHwm {
        inhwm: usize,
        outhwm: usize,
    },
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ActivateRead => f.write_str("ActivateRead"),
            Command::ActivateWrite => f.write_str("ActivateWrite"),
            Command::Hiccup { .. } => f.write_str("Hiccup"),
            Command::PipeTerm => f.write_str("PipeTerm"),
            Command::PipeTermAck => f.write_str("PipeTermAck"),
            Command::PipeHwm { inhwm, outhwm } => write!(f, "PipeHwm({inhwm}, {outhwm})"),
        }
    }
}

fn compute_lwm(hwm: usize) -> usize {
    if hwm > 2 * MAX_WM_DELTA {
        hwm - MAX_WM_DELTA
    } else {
        hwm.div_ceil(2)
    }
}

/// Builds a connected pair of pipe endpoints.
///
/// ```
/// use msgpipe::{Msg, pipe};
///
/// let (mut a, mut b) = pipe::pair().hwm(2, 2).build();
///
/// assert!(a.write(Msg::new(b"1".as_slice())).is_ok());
/// assert!(a.write(Msg::new(b"2".as_slice())).is_ok());
/// assert!(a.write(Msg::new(b"3".as_slice())).is_err());
/// a.flush();
///
/// assert_eq!(b.read().unwrap().data(), b"1");
/// assert!(a.write(Msg::new(b"3".as_slice())).is_ok());
/// ```
pub fn pair() -> PairBuilder {
    PairBuilder::default()
}

#[derive(Debug, Clone)]
pub struct PairBuilder {
    hwm: [usize; 2],
    delay: [bool; 2],
    chunk_size: usize,
    ids: Option<(PipeId, PipeId)>,
}

impl Default for PairBuilder {
    fn default() -> Self {
        Self {
            hwm: [DEFAULT_HWM; 2],
            delay: [true; 2],
            chunk_size: DEFAULT_CHUNK_SIZE,
            ids: None,
        }
    }
}

impl PairBuilder {
    /// Outbound high-water marks of the first and second endpoint. Zero means
    /// unlimited.
    #[must_use]
    pub fn hwm(mut self, a: usize, b: usize) -> Self {
        self.hwm = [a, b];
        self
    }

    /// Whether each endpoint reads pending messages up to the delimiter when
    /// its peer terminates, rather than dropping them.
    #[must_use]
    pub fn delay(mut self, a: bool, b: bool) -> Self {
        self.delay = [a, b];
        self
    }

    /// Number of messages per allocation of the underlying queues.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Identifiers of the two endpoints. By default they are taken from a
    /// process-wide counter.
    #[must_use]
    pub fn ids(mut self, a: PipeId, b: PipeId) -> Self {
        self.ids = Some((a, b));
        self
    }

    pub fn build(self) -> (Pipe, Pipe) {
        let (a_id, b_id) = self.ids.unwrap_or_else(|| (PipeId::next(), PipeId::next()));

        let (a_out, b_in) = ypipe(self.chunk_size);
        let (b_out, a_in) = ypipe(self.chunk_size);
        let (to_a, a_inbox) = mailbox();
        let (to_b, b_inbox) = mailbox();
        let a_read = Arc::new(CachePadded::new(AtomicU64::new(0)));
        let b_read = Arc::new(CachePadded::new(AtomicU64::new(0)));

        let a = Pipe {
            id: a_id,
            peer_id: b_id,
            in_pipe: Some(a_in),
            out_pipe: Some(a_out),
            in_active: true,
            out_active: true,
            hwm: self.hwm[0],
            lwm: compute_lwm(self.hwm[1]),
            in_hwm_boost: None,
            out_hwm_boost: None,
            msgs_read: 0,
            msgs_written: 0,
            read_count: a_read.clone(),
            peer_read_count: b_read.clone(),
            inbox: a_inbox,
            outbox: to_b,
            state: PipeState::Active,
            delay: self.delay[0],
            credential: Payload::empty(),
            routing_id: None,
            chunk_size: self.chunk_size,
        };
        let b = Pipe {
            id: b_id,
            peer_id: a_id,
            in_pipe: Some(b_in),
            out_pipe: Some(b_out),
            in_active: true,
            out_active: true,
            hwm: self.hwm[1],
            lwm: compute_lwm(self.hwm[0]),
            in_hwm_boost: None,
            out_hwm_boost: None,
            msgs_read: 0,
            msgs_written: 0,
            read_count: b_read,
            peer_read_count: a_read,
            inbox: b_inbox,
            outbox: to_a,
            state: PipeState::Active,
            delay: self.delay[1],
            credential: Payload::empty(),
            routing_id: None,
            chunk_size: self.chunk_size,
        };
        tracing::trace!(a = %a_id, b = %b_id, hwm = ?self.hwm, "Pipe pair created");
        (a, b)
    }
}

/// One endpoint of a pipe pair.
///
/// All operations are non-blocking. An endpoint is owned by a single thread at
/// a time, and may be moved between threads.
pub struct Pipe {
    id: PipeId,
    peer_id: PipeId,

    in_pipe: Option<YPipeReader<Item>>,
    out_pipe: Option<YPipeWriter<Item>>,
    // Cleared when a read comes up empty, set again on ActivateRead.
    in_active: bool,
    // Cleared when a write hits the high-water mark, set again on ActivateWrite.
    out_active: bool,

    hwm: usize,
    lwm: usize,
    in_hwm_boost: Option<usize>,
    out_hwm_boost: Option<usize>,
    msgs_read: u64,
    msgs_written: u64,
    read_count: Arc<CachePadded<AtomicU64>>,
    peer_read_count: Arc<CachePadded<AtomicU64>>,

    inbox: MailboxReceiver<Command>,
    outbox: MailboxSender<Command>,

    state: PipeState,
    delay: bool,
    credential: Payload,
    routing_id: Option<u32>,
    chunk_size: usize,
}

impl Pipe {
    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn peer_id(&self) -> PipeId {
        self.peer_id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn is_terminated(&self) -> bool {
        self.state == PipeState::Terminated
    }

    pub fn routing_id(&self) -> Option<u32> {
        self.routing_id
    }

    pub fn set_routing_id(&mut self, routing_id: Option<u32>) {
        self.routing_id = routing_id;
    }

    /// The last credential frame received on this pipe.
    pub fn credential(&self) -> &Payload {
        &self.credential
    }

    /// Outbound high-water mark, zero meaning unlimited.
    pub fn hwm(&self) -> usize {
        self.hwm
    }

    /// Inbound low-water mark.
    pub fn lwm(&self) -> usize {
        self.lwm
    }

    fn set_state(&mut self, state: PipeState) {
        tracing::trace!(pipe = %self.id, from = ?self.state, to = ?state, "Pipe state change");
        self.state = state;
    }

    fn send_command(&mut self, cmd: Command) {
        tracing::trace!(pipe = %self.id, peer = %self.peer_id, ?cmd, "Sending command");
        self.outbox.send(cmd);
    }

    // -- reading

    fn can_read(&self) -> bool {
        matches!(self.state, PipeState::Active | PipeState::WaitingForDelimiter)
    }

    /// Returns whether a message can be read right now.
    ///
    /// Reaching the delimiter consumes it and advances the termination
    /// handshake.
    pub fn check_read(&mut self) -> bool {
        if !self.can_read() {
            return false;
        }
        let Some(in_pipe) = self.in_pipe.as_mut() else {
            return false;
        };
        if !in_pipe.check_read() {
            self.in_active = false;
            return false;
        }
        if in_pipe.probe(Item::is_delimiter) {
            let _ = in_pipe.read();
            self.process_delimiter();
            return false;
        }
        true
    }

    /// Reads the next frame.
    ///
    /// Credential frames are consumed and remembered as the pipe
    /// [`credential`](Self::credential) instead of being returned.
    pub fn read(&mut self) -> Option<Msg> {
        if !self.can_read() {
            return None;
        }
        let msg = loop {
            let Some(item) = self.in_pipe.as_mut().and_then(YPipeReader::read) else {
                self.in_active = false;
                return None;
            };
            match item {
                Item::Delimiter => {
                    self.process_delimiter();
                    return None;
                }
                Item::Msg(msg) if msg.is_credential() => self.credential = msg.into_data(),
                Item::Msg(msg) => break msg,
            }
        };

        if !msg.more() && !msg.is_routing_id() {
            self.msgs_read += 1;
            self.read_count.store(self.msgs_read, Ordering::Release);
            if self.lwm > 0 && self.msgs_read % self.lwm as u64 == 0 {
                self.send_command(Command::ActivateWrite);
            }
        }
        Some(msg)
    }

    // -- writing

    /// Returns whether the high-water mark leaves room for one more message.
    pub fn check_hwm(&self) -> bool {
        let peers_msgs_read = self.peer_read_count.load(Ordering::Acquire);
        let full = self.hwm > 0 && self.msgs_written - peers_msgs_read >= self.hwm as u64;
        !full
    }

    /// Returns whether a message can be written right now.
    pub fn check_write(&mut self) -> bool {
        if self.state != PipeState::Active || self.out_pipe.is_none() {
            return false;
        }
        if !self.check_hwm() {
            self.out_active = false;
            return false;
        }
        true
    }

    /// Writes a frame.
    ///
    /// The frame only becomes visible to the peer on the next
    /// [`flush`](Self::flush), and frames of a multipart message only once
    /// the final frame is written.
    ///
    /// # Errors
    ///
    /// Hands the frame back if the pipe is full or no longer active.
    pub fn write(&mut self, msg: Msg) -> Result<(), Msg> {
        if !self.check_write() {
            return Err(msg);
        }
        let Some(out_pipe) = self.out_pipe.as_mut() else {
            return Err(msg);
        };
        let more = msg.more();
        let counts = !more && !msg.is_routing_id();
        out_pipe.write(Item::Msg(msg), more);
        if counts {
            self.msgs_written += 1;
        }
        Ok(())
    }

    /// Drops the frames of an incomplete multipart message.
    pub fn rollback(&mut self) {
        let Some(out_pipe) = self.out_pipe.as_mut() else {
            return;
        };
        while let Some(item) = out_pipe.unwrite() {
            debug_assert!(matches!(&item, Item::Msg(msg) if msg.more()));
            drop(item);
        }
    }

    /// Publishes the written messages, waking the peer if it went to sleep.
    pub fn flush(&mut self) {
        if self.state == PipeState::TermAckSent {
            return;
        }
        let woken = self.out_pipe.as_mut().is_some_and(|out_pipe| !out_pipe.flush());
        if woken {
            self.send_command(Command::ActivateRead);
        }
    }

    // -- configuration

    /// Sets the inbound and outbound high-water marks, zero meaning unlimited.
    pub fn set_hwms(&mut self, inhwm: usize, outhwm: usize) {
        let mut inbound = inhwm + self.in_hwm_boost.unwrap_or(0);
        let mut outbound = outhwm + self.out_hwm_boost.unwrap_or(0);
        if inhwm == 0 || self.in_hwm_boost == Some(0) {
            inbound = 0;
        }
        if outhwm == 0 || self.out_hwm_boost == Some(0) {
            outbound = 0;
        }
        self.lwm = compute_lwm(inbound);
        self.hwm = outbound;
    }

    /// Extra capacity added on top of the watermarks set by
    /// [`set_hwms`](Self::set_hwms). A zero boost makes the direction
    /// unlimited.
    pub fn set_hwms_boost(&mut self, inhwm: usize, outhwm: usize) {
        self.in_hwm_boost = Some(inhwm);
        self.out_hwm_boost = Some(outhwm);
    }

    /// Asks the peer to apply the given watermarks to its side.
    pub fn send_hwms_to_peer(&mut self, inhwm: usize, outhwm: usize) {
        self.send_command(Command::PipeHwm { inhwm, outhwm });
    }

    /// Drops pending inbound messages instead of reading them up to the
    /// delimiter when the peer terminates.
    pub fn set_nodelay(&mut self) {
        self.delay = false;
    }

    // -- lifecycle

    /// Replaces the inbound queue with a fresh one.
    ///
    /// Messages not read yet are discarded by the peer, which is told through
    /// [`PipeEvents::hiccuped`].
    pub fn hiccup(&mut self) {
        if self.state != PipeState::Active {
            return;
        }
        let (out, fresh) = ypipe(self.chunk_size);
        let Some(stale) = self.in_pipe.replace(fresh) else {
            return;
        };
        self.in_active = true;
        self.send_command(Command::Hiccup { out, stale });
    }

    /// Starts the termination handshake.
    ///
    /// With `delay` set, the peer keeps reading until the delimiter marking
    /// the end of this endpoint's messages. Otherwise messages still pending
    /// on either side may be dropped. Calling it again is a no-op.
    pub fn terminate(&mut self, delay: bool) {
        self.delay = delay;

        match self.state {
            PipeState::Terminating
            | PipeState::DoubleTerminated
            | PipeState::TermAckSent
            | PipeState::Terminated => return,
            PipeState::Active | PipeState::DelimiterReceived => {
                self.send_command(Command::PipeTerm);
                self.set_state(PipeState::Terminating);
            }
            PipeState::WaitingForDelimiter if !self.delay => {
                self.rollback();
                self.out_pipe = None;
                self.send_command(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            // Pending messages are still to be read.
            PipeState::WaitingForDelimiter => {}
        }

        self.out_active = false;

        if self.out_pipe.is_some() {
            self.rollback();
            // Watermarks do not apply to the delimiter.
            if let Some(out_pipe) = self.out_pipe.as_mut() {
                out_pipe.write(Item::Delimiter, false);
            }
            self.flush();
        }
    }

    /// Applies the commands sent by the peer, reporting their effects to
    /// `events`. Returns the number of commands processed.
    pub fn process_commands(&mut self, events: &mut impl PipeEvents) -> usize {
        let mut processed = 0;
        while let Some(cmd) = self.inbox.recv() {
            tracing::trace!(pipe = %self.id, ?cmd, "Processing command");
            processed += 1;
            match cmd {
                Command::ActivateRead => self.process_activate_read(events),
                Command::ActivateWrite => self.process_activate_write(events),
                Command::Hiccup { out, stale } => self.process_hiccup(out, stale, events),
                Command::PipeTerm => self.process_pipe_term(),
                Command::PipeTermAck => self.process_pipe_term_ack(events),
                Command::PipeHwm { inhwm, outhwm } => self.set_hwms(inhwm, outhwm),
            }
        }
        processed
    }

    /// Waits until the peer sends a command.
    ///
    /// # Errors
    ///
    /// Fails once the peer endpoint has been dropped.
    pub async fn wait_commands(&self) -> Result<(), WaitError> {
        self.inbox.wait().await
    }

    /// Blocking version of [`wait_commands`](Self::wait_commands).
    pub fn wait_commands_blocking(&self) -> Result<(), WaitError> {
        self.inbox.wait_blocking()
    }

    fn process_activate_read(&mut self, events: &mut impl PipeEvents) {
        if !self.in_active && self.can_read() {
            self.in_active = true;
            events.read_activated(self.id);
        }
    }

    fn process_activate_write(&mut self, events: &mut impl PipeEvents) {
        if !self.out_active && self.state == PipeState::Active {
            self.out_active = true;
            events.write_activated(self.id);
        }
    }

    fn process_hiccup(
        &mut self,
        out: YPipeWriter<Item>,
        mut stale: YPipeReader<Item>,
        events: &mut impl PipeEvents,
    ) {
        // The reader gave up on the old queue: drain what it did not read.
        let Some(mut old) = self.out_pipe.replace(out) else {
            // Our side is already torn down, the fresh queue is useless.
            self.out_pipe = None;
            return;
        };
        old.flush();
        while let Some(item) = stale.read() {
            match item {
                Item::Msg(msg) if !msg.more() && !msg.is_routing_id() => self.msgs_written -= 1,
                _ => {}
            }
        }
        self.out_active = true;

        if self.state == PipeState::Active {
            events.hiccuped(self.id);
        }
    }

    fn process_pipe_term(&mut self) {
        match self.state {
            PipeState::Active if self.delay => self.set_state(PipeState::WaitingForDelimiter),
            PipeState::Active | PipeState::DelimiterReceived => {
                self.out_pipe = None;
                self.send_command(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            // Both endpoints asked at the same time: ack and keep waiting for
            // the ack to our own request.
            PipeState::Terminating => {
                self.out_pipe = None;
                self.send_command(Command::PipeTermAck);
                self.set_state(PipeState::DoubleTerminated);
            }
            state => debug_assert!(false, "Unexpected pipe term in state {state:?}"),
        }
    }

    fn process_pipe_term_ack(&mut self, events: &mut impl PipeEvents) {
        match self.state {
            PipeState::Terminating => {
                self.out_pipe = None;
                self.send_command(Command::PipeTermAck);
            }
            PipeState::TermAckSent | PipeState::DoubleTerminated => {}
            state => debug_assert!(false, "Unexpected pipe term ack in state {state:?}"),
        }

        // Unread messages are dropped with the queue.
        self.in_pipe = None;
        self.out_pipe = None;
        self.in_active = false;
        self.out_active = false;
        self.set_state(PipeState::Terminated);
        events.pipe_terminated(self.id);
    }

    fn process_delimiter(&mut self) {
        match self.state {
            PipeState::Active => self.set_state(PipeState::DelimiterReceived),
            PipeState::WaitingForDelimiter => {
                self.rollback();
                self.out_pipe = None;
                self.send_command(Command::PipeTermAck);
                self.set_state(PipeState::TermAckSent);
            }
            state => debug_assert!(false, "Unexpected delimiter in state {state:?}"),
        }
    }
}

impl MsgSource for Pipe {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.read()
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("state", &self.state)
            .field("hwm", &self.hwm)
            .field("lwm", &self.lwm)
            .field("msgs_read", &self.msgs_read)
            .field("msgs_written", &self.msgs_written)
            .finish()
    }
}

/// Endpoints owned by one thread, keyed by their identifier.
///
/// This is the handle store the schedulers operate on.
#[derive(Debug, Default)]
pub struct PipeTable {
    pipes: HashMap<PipeId, Pipe>,
}

impl PipeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `pipe`, returning its identifier. An endpoint with the same
    /// identifier is replaced.
    pub fn insert(&mut self, pipe: Pipe) -> PipeId {
        let id = pipe.id();
        self.pipes.insert(id, pipe);
        id
    }

    pub fn get(&self, id: PipeId) -> Option<&Pipe> {
        self.pipes.get(&id)
    }

    pub fn get_mut(&mut self, id: PipeId) -> Option<&mut Pipe> {
        self.pipes.get_mut(&id)
    }

    pub fn remove(&mut self, id: PipeId) -> Option<Pipe> {
        self.pipes.remove(&id)
    }

    pub fn contains(&self, id: PipeId) -> bool {
        self.pipes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = PipeId> + '_ {
        self.pipes.keys().copied()
    }

    pub fn iter_mut(&mut self) -> hash_map::IterMut<'_, PipeId, Pipe> {
        self.pipes.iter_mut()
    }

    /// Processes the pending commands of every endpoint.
    pub fn process_commands(&mut self, events: &mut impl PipeEvents) -> usize {
        self.pipes.values_mut().map(|p| p.process_commands(events)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::flags;

    #[derive(Debug, Default)]
    struct Recorder {
        read_activated: Vec<PipeId>,
        write_activated: Vec<PipeId>,
        hiccuped: Vec<PipeId>,
        terminated: Vec<PipeId>,
    }

    impl PipeEvents for Recorder {
        fn read_activated(&mut self, id: PipeId) {
            self.read_activated.push(id);
        }

        fn write_activated(&mut self, id: PipeId) {
            self.write_activated.push(id);
        }

        fn hiccuped(&mut self, id: PipeId) {
            self.hiccuped.push(id);
        }

        fn pipe_terminated(&mut self, id: PipeId) {
            self.terminated.push(id);
        }
    }

    fn msg(s: &'static str) -> Msg {
        Msg::new(s.as_bytes())
    }

    fn more(s: &'static str) -> Msg {
        Msg::with_flags(s.as_bytes(), flags::MORE)
    }

    #[test]
    fn watermarks() {
        assert_eq!(compute_lwm(0), 0);
        assert_eq!(compute_lwm(1), 1);
        assert_eq!(compute_lwm(4), 2);
        assert_eq!(compute_lwm(5), 3);
        assert_eq!(compute_lwm(1000), 500);
        assert_eq!(compute_lwm(2048), 1024);
        assert_eq!(compute_lwm(5000), 3976);

        let (a, b) = pair().hwm(10, 3000).build();
        assert_eq!(a.hwm(), 10);
        assert_eq!(a.lwm(), 3000 - MAX_WM_DELTA);
        assert_eq!(b.hwm(), 3000);
        assert_eq!(b.lwm(), 5);
    }

    #[test]
    fn writes_invisible_until_flush() {
        let (mut a, mut b) = pair().build();
        a.write(msg("hello")).unwrap();
        assert!(!b.check_read());
        assert!(b.read().is_none());

        a.flush();
        let mut events = Recorder::default();
        b.process_commands(&mut events);
        assert_eq!(events.read_activated, vec![b.id()]);

        assert!(b.check_read());
        assert_eq!(b.read().unwrap().data(), b"hello");
        assert!(b.read().is_none());
    }

    #[test]
    fn hwm_boundary() {
        const N: usize = 4;
        let (mut a, mut b) = pair().hwm(N, N).build();

        for i in 0..N {
            assert!(a.write(msg("x")).is_ok(), "write {i}");
        }
        let rejected = a.write(msg("y")).unwrap_err();
        assert_eq!(rejected.data(), b"y");
        a.flush();

        assert!(b.read().is_some());
        assert!(a.write(rejected).is_ok());
        assert!(a.write(msg("z")).is_err());
    }

    #[test]
    fn unlimited_hwm() {
        let (mut a, _b) = pair().hwm(0, 0).build();
        for _ in 0..10_000 {
            a.write(msg("x")).unwrap();
        }
    }

    #[test]
    fn multipart_counts_once_and_is_atomic() {
        let (mut a, mut b) = pair().hwm(1, 1).build();

        a.write(more("1")).unwrap();
        a.write(more("2")).unwrap();
        a.flush();
        assert!(b.read().is_none(), "Incomplete multipart must not be visible");

        a.write(msg("3")).unwrap();
        assert!(a.write(msg("4")).is_err());
        a.flush();

        let frames: Vec<_> = std::iter::from_fn(|| b.read()).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].more() && frames[1].more() && !frames[2].more());
    }

    #[test]
    fn low_water_mark_activates_writer() {
        let (mut a, mut b) = pair().hwm(4, 4).build();
        let mut events = Recorder::default();

        while a.write(msg("x")).is_ok() {}
        a.flush();

        // lwm = 2: the second read sends an activation.
        b.read().unwrap();
        a.process_commands(&mut events);
        assert!(events.write_activated.is_empty());
        b.read().unwrap();
        a.process_commands(&mut events);
        assert_eq!(events.write_activated, vec![a.id()]);
    }

    #[test]
    fn rollback_drops_incomplete() {
        let (mut a, mut b) = pair().build();
        a.write(msg("1")).unwrap();
        a.write(more("2a")).unwrap();
        a.write(more("2b")).unwrap();
        a.rollback();
        a.write(msg("3")).unwrap();
        a.flush();

        assert_eq!(b.read().unwrap().data(), b"1");
        assert_eq!(b.read().unwrap().data(), b"3");
        assert!(b.read().is_none());
    }

    #[test]
    fn credential_frames_are_consumed() {
        let (mut a, mut b) = pair().build();
        a.write(Msg::with_flags(b"alice".as_slice(), flags::CREDENTIAL)).unwrap();
        a.write(msg("data")).unwrap();
        a.flush();

        assert_eq!(b.read().unwrap().data(), b"data");
        assert_eq!(b.credential(), b"alice");
    }

    #[test]
    fn routing_id_frames_do_not_count() {
        let (mut a, mut b) = pair().hwm(1, 1).build();
        a.write(Msg::with_flags(b"id".as_slice(), flags::ROUTING_ID)).unwrap();
        a.write(msg("data")).unwrap();
        assert!(a.write(msg("full")).is_err());
        a.flush();
        assert_eq!(b.read().unwrap().data(), b"id");
        assert_eq!(b.read().unwrap().data(), b"data");
    }

    #[test]
    fn graceful_termination() {
        let (mut a, mut b) = pair().build();
        let mut events = Recorder::default();

        a.write(msg("1")).unwrap();
        a.write(msg("2")).unwrap();
        a.flush();
        a.terminate(true);
        assert_eq!(a.state(), PipeState::Terminating);
        assert!(a.write(msg("3")).is_err());

        b.process_commands(&mut events);
        assert_eq!(b.state(), PipeState::WaitingForDelimiter);

        // Pending messages survive the termination request.
        assert_eq!(b.read().unwrap().data(), b"1");
        assert_eq!(b.read().unwrap().data(), b"2");
        assert!(b.read().is_none());
        assert_eq!(b.state(), PipeState::TermAckSent);

        a.process_commands(&mut events);
        assert_eq!(a.state(), PipeState::Terminated);
        b.process_commands(&mut events);
        assert_eq!(b.state(), PipeState::Terminated);
        assert_eq!(events.terminated, vec![a.id(), b.id()]);
    }

    #[test]
    fn nodelay_drops_pending() {
        let (mut a, mut b) = pair().delay(true, false).build();
        let mut events = Recorder::default();

        a.write(msg("lost")).unwrap();
        a.flush();
        a.terminate(true);

        b.process_commands(&mut events);
        assert_eq!(b.state(), PipeState::TermAckSent);
        assert!(b.read().is_none());

        a.process_commands(&mut events);
        b.process_commands(&mut events);
        assert!(a.is_terminated() && b.is_terminated());
    }

    #[test]
    fn delimiter_before_term() {
        let (mut a, mut b) = pair().build();
        let mut events = Recorder::default();

        a.terminate(true);
        // The delimiter is read before the term command is processed.
        assert!(b.read().is_none());
        assert_eq!(b.state(), PipeState::DelimiterReceived);

        b.process_commands(&mut events);
        assert_eq!(b.state(), PipeState::TermAckSent);
        a.process_commands(&mut events);
        b.process_commands(&mut events);
        assert!(a.is_terminated() && b.is_terminated());
    }

    #[test]
    fn crossed_termination() {
        let (mut a, mut b) = pair().build();
        let mut events = Recorder::default();

        a.terminate(true);
        b.terminate(true);
        assert_eq!(a.state(), PipeState::Terminating);
        assert_eq!(b.state(), PipeState::Terminating);

        a.process_commands(&mut events);
        assert_eq!(a.state(), PipeState::DoubleTerminated);
        b.process_commands(&mut events);
        assert_eq!(b.state(), PipeState::Terminated);
        a.process_commands(&mut events);
        assert_eq!(a.state(), PipeState::Terminated);
        assert_eq!(events.terminated.len(), 2);
    }

    #[test]
    fn terminate_is_idempotent() {
        let (mut a, mut b) = pair().build();
        let mut events = Recorder::default();

        a.terminate(true);
        a.terminate(true);
        a.terminate(false);
        assert_eq!(a.state(), PipeState::Terminating);

        // Only one term request reached the peer.
        assert_eq!(b.process_commands(&mut events), 1);

        for _ in 0..4 {
            a.process_commands(&mut events);
            b.process_commands(&mut events);
            b.read();
        }
        assert!(a.is_terminated() && b.is_terminated());
        a.terminate(true);
        assert!(a.is_terminated());
        assert_eq!(events.terminated.len(), 2);
    }

    #[test]
    fn hiccup_discards_unread() {
        let (mut a, mut b) = pair().hwm(2, 2).build();
        let mut events = Recorder::default();

        a.write(msg("old1")).unwrap();
        a.write(msg("old2")).unwrap();
        a.flush();
        assert!(a.write(msg("full")).is_err());

        b.hiccup();
        a.process_commands(&mut events);
        assert_eq!(events.hiccuped, vec![a.id()]);

        // The stale messages no longer count against the high-water mark.
        a.write(msg("new")).unwrap();
        a.flush();
        assert_eq!(b.read().unwrap().data(), b"new");
        assert!(b.read().is_none());
    }

    #[test]
    fn hwm_command() {
        let (mut a, mut b) = pair().hwm(1000, 1000).build();
        a.send_hwms_to_peer(10, 20);
        b.process_commands(&mut ());
        assert_eq!(b.hwm(), 20);
        assert_eq!(b.lwm(), 5);

        b.set_hwms_boost(0, 5);
        b.set_hwms(10, 20);
        assert_eq!(b.hwm(), 25);
        assert_eq!(b.lwm(), 0);
    }

    #[test]
    fn explicit_ids() {
        let (a, b) = pair().ids(PipeId::new(7), PipeId::new(8)).build();
        assert_eq!(a.id(), PipeId::new(7));
        assert_eq!(a.peer_id(), PipeId::new(8));
        assert_eq!(b.peer_id(), PipeId::new(7));

        let mut table = PipeTable::new();
        table.insert(a);
        table.insert(b);
        assert_eq!(table.len(), 2);
        assert!(table.remove(PipeId::new(7)).is_some());
        assert!(!table.contains(PipeId::new(7)));
    }
}
