//! Containers used on the message path.
mod active_set;
mod chunk_queue;
mod on_drop;

pub use active_set::ActiveSet;
pub(crate) use chunk_queue::RawChunkQueue;
pub use chunk_queue::{ChunkQueue, DEFAULT_CHUNK_SIZE};
pub use on_drop::OnDrop;
