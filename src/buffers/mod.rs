//! Shared, immutable byte buffers carried by messages.
mod payload;

pub use payload::{DynBuf, Payload};
