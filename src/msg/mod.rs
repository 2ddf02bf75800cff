//! Messages and the allocators that size their bodies.
mod allocator;

use std::{collections::VecDeque, fmt};

pub use allocator::{BodyMut, HeapAllocator, MsgAllocator, PoolAllocator, ThresholdAllocator};

use crate::buffers::Payload;

/// Message flag bits.
///
/// Only [`MORE`](flags::MORE) and [`COMMAND`](flags::COMMAND) travel on the
/// wire. The others are local annotations set by the layers around the pipe.
pub mod flags {
    /// More frames of the same logical message follow.
    pub const MORE: u8 = 1 << 0;
    /// The frame carries a protocol command rather than application data.
    pub const COMMAND: u8 = 1 << 1;
    /// The frame carries the peer's credential.
    pub const CREDENTIAL: u8 = 1 << 5;
    /// The frame carries a routing id.
    pub const ROUTING_ID: u8 = 1 << 6;
}

/// A single frame of a possibly multi-frame message.
///
/// A logical message is a run of frames where every frame but the last has
/// [`flags::MORE`] set. Moving a [`Msg`] never copies its body.
///
/// # Examples
///
/// ```
/// use msgpipe::{Msg, flags};
///
/// let mut msg = Msg::new(b"hello".as_slice());
/// assert_eq!(msg.size(), 5);
/// assert!(!msg.more());
///
/// msg.set_flags(flags::MORE);
/// assert!(msg.more());
/// ```
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Msg {
    data: Payload,
    flags: u8,
    routing_id: Option<u32>,
    group: Option<String>,
}

impl Msg {
    pub fn new(data: impl Into<Payload>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_flags(data: impl Into<Payload>, flags: u8) -> Self {
        Self {
            data: data.into(),
            flags,
            ..Default::default()
        }
    }

    /// An empty frame without flags.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    /// Body size in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags |= flags;
    }

    pub fn reset_flags(&mut self, flags: u8) {
        self.flags &= !flags;
    }

    pub fn more(&self) -> bool {
        self.flags & flags::MORE != 0
    }

    pub fn is_command(&self) -> bool {
        self.flags & flags::COMMAND != 0
    }

    pub fn is_credential(&self) -> bool {
        self.flags & flags::CREDENTIAL != 0
    }

    pub fn is_routing_id(&self) -> bool {
        self.flags & flags::ROUTING_ID != 0
    }

    pub fn routing_id(&self) -> Option<u32> {
        self.routing_id
    }

    pub fn set_routing_id(&mut self, routing_id: Option<u32>) {
        self.routing_id = routing_id;
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn set_group(&mut self, group: Option<String>) {
        self.group = group;
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Msg");
        s.field("size", &self.size()).field("flags", &format_args!("{:#04x}", self.flags));
        if let Some(id) = self.routing_id {
            s.field("routing_id", &id);
        }
        if let Some(group) = &self.group {
            s.field("group", group);
        }
        s.finish()
    }
}

impl From<Payload> for Msg {
    fn from(data: Payload) -> Self {
        Self::new(data)
    }
}

/// Anything an encoder can pull frames from.
pub trait MsgSource {
    /// Returns the next frame, or `None` if nothing is available right now.
    fn pull_msg(&mut self) -> Option<Msg>;
}

impl MsgSource for VecDeque<Msg> {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.pop_front()
    }
}

impl MsgSource for Option<Msg> {
    fn pull_msg(&mut self) -> Option<Msg> {
        self.take()
    }
}

impl<S: MsgSource + ?Sized> MsgSource for &mut S {
    fn pull_msg(&mut self) -> Option<Msg> {
        (**self).pull_msg()
    }
}
