//! Msgpipe: the message-movement core of a brokerless messaging library.
//!
//! Msgpipe moves discrete, optionally multipart messages between endpoints.
//! Inside a process, messages travel over lock-free single-producer
//! single-consumer [pipes](pipe) with high/low water mark flow control and a
//! graceful termination handshake. Across a byte stream, they are framed by
//! incremental [wire codecs](codec) that accept input and produce output in
//! chunks of any size.
//!
//! # Overview
//!
//! The diagram below shows a message travelling from an application thread to
//! a remote peer and back.
//!
//! ```text
//!                                                               .....
//!  APPLICATION                                          User code   :
//!  ┌──────────┐ write/flush                   read ┌──────────┐     :
//!  │   Pipe   │───────┐                   ┌───────▶│   Pipe   │     :
//!  └──────────┘       │                   │        └──────────┘     :
//! ~~~~~~~~~~~~~~~~~~~~│~~~~~~~~~~~~~~~~~~~│~~~~~~~~~~~~~~~~~~~~~~~  :
//!  PIPE PAIR          ▼                   │            Msgpipe code :
//!  ┌─────────────────────────────────────────────────────────────┐  :
//!  │  ChunkQueue ─▶ ypipe ─▶ ...      ... ─▶ ypipe ─▶ ChunkQueue │  :
//!  │  commands: activate read/write, hwm, term, term ack         │  :
//!  └─────────────────────────────────────────────────────────────┘  :
//!                     │                   ▲                         :
//!  ENGINE             ▼                   │                         :
//!  ┌──────────┐   ┌─────────┐        ┌─────────┐                    :
//!  │   Pipe   │──▶│ Encoder │        │ Decoder │──▶ Pipe            :
//!  └──────────┘   └────┬────┘        └────▲────┘                    :
//!                      │ bytes            │ bytes               .....
//!                      ▼      Network     │
//! ```
//!
//! Endpoints owning several pipes spread outbound messages with a
//! [`LoadBalancer`] and gather inbound ones with a [`FairQueue`]. Both keep
//! the frames of a multipart message together.
//!
//! # Features
//!
//! - **Lock-free pipes**: one atomic per flush on the fast path, readers sleep
//!   and are woken through a command only when they ran dry
//! - **Flow control**: writers are bounded by a high-water mark and resumed at
//!   the low-water mark
//! - **Atomic multipart messages**: frames become visible to the reader all at
//!   once and count once against the watermarks
//! - **Graceful termination**: either endpoint may terminate at any time, both
//!   converge to [`PipeState::Terminated`]
//! - **Incremental codecs**: [V1](codec::V1) and [V2](codec::V2) framing with
//!   zero-copy paths for large bodies
//! - **Pluggable allocation**: message bodies come from a [`MsgAllocator`]
//!
//! # Quick Start
//!
//! ```
//! use msgpipe::{Msg, flags, pipe};
//!
//! let (mut a, mut b) = pipe::pair().hwm(2, 2).build();
//!
//! // A two-frame message is written and published at once.
//! a.write(Msg::with_flags(b"hello".as_slice(), flags::MORE)).unwrap();
//! a.write(Msg::new(b"world".as_slice())).unwrap();
//! a.flush();
//!
//! assert_eq!(b.read().unwrap().data(), b"hello");
//! assert_eq!(b.read().unwrap().data(), b"world");
//! assert!(b.read().is_none());
//! ```
//!
//! # Threads
//!
//! Each [`Pipe`] endpoint is owned by one thread at a time. Commands from the
//! peer only take effect when the owner calls [`Pipe::process_commands`],
//! which the owner does whenever [`Pipe::wait_commands`] (or its blocking
//! twin) returns:
//!
//! ```
//! use msgpipe::{Msg, pipe};
//!
//! let (mut tx, mut rx) = pipe::pair().build();
//! let consumer = std::thread::spawn(move || {
//!     let mut got = Vec::new();
//!     while got.len() < 100 {
//!         match rx.read() {
//!             Some(msg) => got.push(msg.data()[0]),
//!             None => {
//!                 rx.wait_commands_blocking().unwrap();
//!                 rx.process_commands(&mut ());
//!             }
//!         }
//!     }
//!     got
//! });
//!
//! for i in 0..100u8 {
//!     tx.write(Msg::new(vec![i])).unwrap();
//!     tx.flush();
//! }
//! assert_eq!(consumer.join().unwrap(), (0..100).collect::<Vec<u8>>());
//! ```
//!
//! # Buffer management
//!
//! Message bodies are [`Payload`]s: reference-counted, immutable views over
//! any [`DynBuf`]. Cloning a message or taking a view of its body never copies
//! the data. A decoder fills bodies obtained from its [`MsgAllocator`] and
//! freezes them into payloads, so a [`PoolAllocator`] gets its buffers back
//! once every message referencing them is gone.
//!
//! # Optional statistics
//!
//! With the `stats` feature, `EngineTask::stats` reports the bytes
//! and messages that went through an engine.
mod buffers;
pub mod codec;
pub mod collections;
pub mod engine;
mod msg;
pub mod pipe;
mod sched;
mod sync;

pub use buffers::{DynBuf, Payload};
pub use msg::{BodyMut, HeapAllocator, Msg, MsgAllocator, MsgSource, PoolAllocator, ThresholdAllocator, flags};
pub use pipe::{Pipe, PipeEvents, PipeId, PipeState, PipeTable};
pub use sched::{FairQueue, LoadBalancer, SendError};
pub use sync::WaitError;
