use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{buffers::Payload, collections::OnDrop};

/// Default number of bodies a [`PoolAllocator`] keeps around.
const DEFAULT_POOL_CAPACITY: usize = 64;

/// A writable message body of a fixed size.
///
/// Decoders fill it in place and then [`freeze`](BodyMut::freeze) it into the
/// [`Payload`] of the decoded message.
pub struct BodyMut {
    buf: Vec<u8>,
    pool: Option<Arc<Pool>>,
}

impl BodyMut {
    fn heap(size: usize) -> Self {
        Self {
            buf: vec![0; size],
            pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Turns the body into an immutable payload without copying.
    ///
    /// Pooled storage goes back to its pool once the last clone of the
    /// payload is dropped.
    pub fn freeze(self) -> Payload {
        match self.pool {
            None => Payload::from(self.buf),
            Some(pool) => Payload::from(OnDrop::new(self.buf, move |buf| pool.put(buf))),
        }
    }
}

impl Deref for BodyMut {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for BodyMut {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl fmt::Debug for BodyMut {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyMut")
            .field("len", &self.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

/// Provides storage for the bodies of decoded messages.
pub trait MsgAllocator {
    /// Returns a zero-filled body of exactly `size` bytes.
    fn allocate(&mut self, size: usize) -> BodyMut;
}

impl<A: MsgAllocator + ?Sized> MsgAllocator for &mut A {
    fn allocate(&mut self, size: usize) -> BodyMut {
        (**self).allocate(size)
    }
}

/// Allocates every body on the heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl MsgAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> BodyMut {
        BodyMut::heap(size)
    }
}

struct Pool {
    free: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
}

impl Pool {
    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    fn take(&self) -> Option<Vec<u8>> {
        self.free.lock().pop()
    }
}

/// Recycles the storage of bodies up to a maximum size.
///
/// Bodies larger than the maximum size fall back to plain heap allocations.
/// Clones share the same pool, so bodies allocated on one thread may be
/// recycled from another.
///
/// # Examples
///
/// ```
/// use msgpipe::{MsgAllocator, PoolAllocator};
///
/// let mut alloc = PoolAllocator::new(1024);
/// let mut body = alloc.allocate(3);
/// body.copy_from_slice(b"abc");
///
/// let payload = body.freeze();
/// assert_eq!(alloc.pooled(), 0);
/// drop(payload);
/// assert_eq!(alloc.pooled(), 1);
/// ```
#[derive(Clone)]
pub struct PoolAllocator {
    pool: Arc<Pool>,
    max_size: usize,
}

impl PoolAllocator {
    pub fn new(max_size: usize) -> Self {
        Self {
            pool: Arc::new(Pool {
                free: Mutex::new(Vec::new()),
                capacity: DEFAULT_POOL_CAPACITY,
            }),
            max_size,
        }
    }

    /// Sets how many idle bodies the pool retains.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        // Only meaningful before the pool is shared.
        if let Some(pool) = Arc::get_mut(&mut self.pool) {
            pool.capacity = capacity;
        }
        self
    }

    /// Number of idle bodies currently held by the pool.
    pub fn pooled(&self) -> usize {
        self.pool.free.lock().len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl MsgAllocator for PoolAllocator {
    fn allocate(&mut self, size: usize) -> BodyMut {
        if size > self.max_size {
            return BodyMut::heap(size);
        }
        let mut buf = self.pool.take().unwrap_or_else(|| Vec::with_capacity(self.max_size));
        buf.clear();
        buf.resize(size, 0);
        BodyMut {
            buf,
            pool: Some(self.pool.clone()),
        }
    }
}

impl fmt::Debug for PoolAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("max_size", &self.max_size)
            .field("pooled", &self.pooled())
            .finish()
    }
}

/// Routes small bodies to one allocator and large ones to another.
///
/// Sizes strictly below `threshold` go to `small`, the others to `large`.
#[derive(Debug, Clone)]
pub struct ThresholdAllocator<S, L> {
    small: S,
    large: L,
    threshold: usize,
}

impl<S, L> ThresholdAllocator<S, L> {
    pub fn new(threshold: usize, small: S, large: L) -> Self {
        Self { small, large, threshold }
    }
}

impl<S: MsgAllocator, L: MsgAllocator> MsgAllocator for ThresholdAllocator<S, L> {
    fn allocate(&mut self, size: usize) -> BodyMut {
        if size < self.threshold {
            self.small.allocate(size)
        } else {
            self.large.allocate(size)
        }
    }
}
