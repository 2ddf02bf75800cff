use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

/// Default number of items stored in a single chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

struct Chunk<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    // Only ever touched by the producer.
    prev: *mut Chunk<T>,
    next: AtomicPtr<Chunk<T>>,
}

impl<T> Chunk<T> {
    fn alloc(capacity: usize) -> *mut Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Chunk {
            slots,
            prev: ptr::null_mut(),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// # Safety
    ///
    /// `pos` must be lower than the chunk capacity.
    unsafe fn slot(&self, pos: usize) -> *mut MaybeUninit<T> {
        unsafe { self.slots.get_unchecked(pos) }.get()
    }
}

/// Position of one end of the queue.
struct Cursor<T> {
    chunk: *mut Chunk<T>,
    pos: usize,
    seq: u64,
}

/// Chunked queue storage shared by a single producer and a single consumer.
///
/// The producer owns the back cursor, the consumer owns the front cursor and
/// the two only meet on the `next` links and on the spare chunk slot, both of
/// which are atomics. The queue itself does not tell the consumer how far it
/// may read: that is the job of the synchronisation layer built on top of it
/// (see `pipe::ypipe`), which must publish the back position with release
/// semantics after pushing.
///
/// Both cursors always point at a usable slot. The push that fills the back
/// chunk links the next one right away, so the consumer finds it linked when
/// it empties the front chunk. An emptied chunk is retired immediately: it
/// becomes the single spare chunk if the slot is empty and is freed
/// otherwise.
pub(crate) struct RawChunkQueue<T> {
    capacity: usize,
    head: CachePadded<UnsafeCell<Cursor<T>>>,
    tail: CachePadded<UnsafeCell<Cursor<T>>>,
    spare: AtomicPtr<Chunk<T>>,
    allocated: AtomicUsize,
}

unsafe impl<T: Send> Send for RawChunkQueue<T> {}
unsafe impl<T: Send> Sync for RawChunkQueue<T> {}

impl<T> RawChunkQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Chunk capacity must be greater than zero");
        let chunk = Chunk::alloc(capacity);
        let cursor = || Cursor { chunk, pos: 0, seq: 0 };
        Self {
            capacity,
            head: CachePadded::new(UnsafeCell::new(cursor())),
            tail: CachePadded::new(UnsafeCell::new(cursor())),
            spare: AtomicPtr::new(ptr::null_mut()),
            allocated: AtomicUsize::new(1),
        }
    }

    pub(crate) fn chunk_size(&self) -> usize {
        self.capacity
    }

    pub(crate) fn chunks_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    fn take_chunk(&self) -> *mut Chunk<T> {
        let spare = self.spare.swap(ptr::null_mut(), Ordering::AcqRel);
        if spare.is_null() {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Chunk::alloc(self.capacity)
        } else {
            spare
        }
    }

    /// # Safety
    ///
    /// `chunk` must be unlinked and hold no initialized item.
    unsafe fn retire(&self, chunk: *mut Chunk<T>) {
        unsafe {
            (*chunk).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        if self
            .spare
            .compare_exchange(ptr::null_mut(), chunk, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            drop(unsafe { Box::from_raw(chunk) });
        }
    }

    // -- producer side

    /// Appends `t` at the back of the queue.
    ///
    /// # Safety
    ///
    /// Must only be called by the producer.
    pub(crate) unsafe fn push_back(&self, t: T) {
        let tail = unsafe { &mut *self.tail.get() };
        unsafe { (*(*tail.chunk).slot(tail.pos)).write(t) };
        tail.pos += 1;
        tail.seq += 1;
        if tail.pos == self.capacity {
            let next = self.take_chunk();
            unsafe {
                (*next).prev = tail.chunk;
                (*tail.chunk).next.store(next, Ordering::Release);
            }
            tail.chunk = next;
            tail.pos = 0;
        }
    }

    /// Removes the most recently pushed item.
    ///
    /// # Safety
    ///
    /// Must only be called by the producer, and only for an item the consumer
    /// cannot observe yet (i.e. one that was never published).
    pub(crate) unsafe fn pop_back(&self) -> T {
        let tail = unsafe { &mut *self.tail.get() };
        if tail.pos == 0 {
            // The back chunk is empty: step back into the previous chunk,
            // which holds the item. The consumer cannot have retired it since
            // the item was never published.
            let empty = tail.chunk;
            unsafe {
                tail.chunk = (*empty).prev;
                (*tail.chunk).next.store(ptr::null_mut(), Ordering::Relaxed);
                self.retire(empty);
            }
            tail.pos = self.capacity;
        }
        tail.pos -= 1;
        tail.seq -= 1;
        unsafe { (*(*tail.chunk).slot(tail.pos)).assume_init_read() }
    }

    /// # Safety
    ///
    /// Must only be called by the producer on a non-empty queue.
    pub(crate) unsafe fn back(&self) -> *const T {
        let tail = unsafe { &*self.tail.get() };
        let (chunk, pos) = if tail.pos == 0 {
            (unsafe { (*tail.chunk).prev }, self.capacity)
        } else {
            (tail.chunk, tail.pos)
        };
        unsafe { (*(*chunk).slot(pos - 1)).as_ptr() }
    }

    /// Sequence number the next pushed item will get.
    ///
    /// # Safety
    ///
    /// Must only be called by the producer.
    pub(crate) unsafe fn back_pos(&self) -> u64 {
        unsafe { (*self.tail.get()).seq }
    }

    // -- consumer side

    /// Removes the item at the front of the queue.
    ///
    /// # Safety
    ///
    /// Must only be called by the consumer, and only when an item has been
    /// published to it.
    pub(crate) unsafe fn pop_front(&self) -> T {
        let head = unsafe { &mut *self.head.get() };
        let t = unsafe { (*(*head.chunk).slot(head.pos)).assume_init_read() };
        head.pos += 1;
        head.seq += 1;
        if head.pos == self.capacity {
            let emptied = head.chunk;
            head.chunk = unsafe { (*emptied).next.load(Ordering::Acquire) };
            debug_assert!(!head.chunk.is_null(), "Filled chunk without a successor");
            head.pos = 0;
            unsafe { self.retire(emptied) };
        }
        t
    }

    /// # Safety
    ///
    /// Same as [`pop_front`](Self::pop_front).
    pub(crate) unsafe fn front(&self) -> *const T {
        let head = unsafe { &*self.head.get() };
        unsafe { (*(*head.chunk).slot(head.pos)).as_ptr() }
    }

    /// Sequence number of the item at the front of the queue.
    ///
    /// # Safety
    ///
    /// Must only be called by the consumer.
    pub(crate) unsafe fn front_pos(&self) -> u64 {
        unsafe { (*self.head.get()).seq }
    }
}

// Dropping needs exclusive access, which is only possible once both the
// producer and the consumer are gone.
impl<T> Drop for RawChunkQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` grants both the producer and the consumer roles,
        // and every item between the two cursors is initialized.
        unsafe {
            while self.front_pos() != self.back_pos() {
                drop(self.pop_front());
            }

            let mut chunk = (*self.head.get()).chunk;
            while !chunk.is_null() {
                let next = (*chunk).next.load(Ordering::Relaxed);
                drop(Box::from_raw(chunk));
                chunk = next;
            }

            let spare = self.spare.swap(ptr::null_mut(), Ordering::Relaxed);
            if !spare.is_null() {
                drop(Box::from_raw(spare));
            }
        }
    }
}

/// A growable FIFO queue storing its items in fixed-capacity chunks.
///
/// Items are never moved after insertion. Allocation is amortised by keeping
/// at most one emptied chunk around for reuse, so a queue oscillating around
/// a steady size stops allocating altogether.
///
/// Positions returned by [`front_pos`](Self::front_pos) and
/// [`back_pos`](Self::back_pos) are monotonic sequence numbers: the n-th item
/// ever pushed has position `n - 1`.
///
/// # Examples
///
/// ```
/// use msgpipe::collections::ChunkQueue;
///
/// let mut queue = ChunkQueue::with_chunk_size(2);
/// for i in 0..3 {
///     queue.push_back(i);
/// }
/// assert_eq!(queue.front(), Some(&0));
/// assert_eq!(queue.back(), Some(&2));
/// assert_eq!(queue.pop_front(), Some(0));
/// assert_eq!(queue.front_pos(), 1);
/// assert_eq!(queue.back_pos(), 3);
/// ```
pub struct ChunkQueue<T> {
    raw: RawChunkQueue<T>,
    _marker: PhantomData<T>,
}

impl<T> ChunkQueue<T> {
    /// Creates an empty queue with [`DEFAULT_CHUNK_SIZE`] items per chunk.
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    /// Creates an empty queue with `chunk_size` items per chunk.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            raw: RawChunkQueue::new(chunk_size),
            _marker: PhantomData,
        }
    }

    pub fn push_back(&mut self, t: T) {
        // SAFETY: `&mut self` makes us both the single producer and consumer.
        unsafe { self.raw.push_back(t) }
    }

    pub fn pop_front(&mut self) -> Option<T> {
        // SAFETY: every pushed item is visible to a single owner.
        (!self.is_empty()).then(|| unsafe { self.raw.pop_front() })
    }

    /// Removes the most recently pushed item.
    pub fn pop_back(&mut self) -> Option<T> {
        // SAFETY: the consumer role is ours as well, nothing else can observe
        // the item being removed.
        (!self.is_empty()).then(|| unsafe { self.raw.pop_back() })
    }

    pub fn front(&self) -> Option<&T> {
        // SAFETY: the queue is not empty, the slot is initialized.
        (!self.is_empty()).then(|| unsafe { &*self.raw.front() })
    }

    pub fn back(&self) -> Option<&T> {
        // SAFETY: the queue is not empty, the slot is initialized.
        (!self.is_empty()).then(|| unsafe { &*self.raw.back() })
    }

    pub fn len(&self) -> usize {
        (self.back_pos() - self.front_pos()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the front item.
    pub fn front_pos(&self) -> u64 {
        // SAFETY: shared borrow, no concurrent mutation.
        unsafe { self.raw.front_pos() }
    }

    /// Sequence number the next pushed item will get.
    pub fn back_pos(&self) -> u64 {
        // SAFETY: shared borrow, no concurrent mutation.
        unsafe { self.raw.back_pos() }
    }

    pub fn chunk_size(&self) -> usize {
        self.raw.chunk_size()
    }

    /// Number of chunks allocated over the lifetime of the queue, including
    /// the initial one.
    pub fn chunks_allocated(&self) -> usize {
        self.raw.chunks_allocated()
    }
}

impl<T> Default for ChunkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ChunkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkQueue")
            .field("front_pos", &self.front_pos())
            .field("back_pos", &self.back_pos())
            .field("chunk_size", &self.chunk_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rand::Rng;

    use super::*;

    #[test]
    fn fifo_order() {
        let mut queue = ChunkQueue::with_chunk_size(4);
        for i in 0..100 {
            queue.push_back(i);
        }
        assert_eq!(queue.len(), 100);
        for i in 0..100 {
            assert_eq!(queue.front(), Some(&i));
            assert_eq!(queue.pop_front(), Some(i));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.pop_front(), None);
        assert_eq!(queue.front_pos(), 100);
        assert_eq!(queue.back_pos(), 100);
    }

    #[test]
    fn emptied_chunk_becomes_the_spare() {
        let mut queue = ChunkQueue::with_chunk_size(2);
        // Filling the first chunk links the second one.
        queue.push_back(0);
        queue.push_back(1);
        assert_eq!(queue.chunks_allocated(), 2);

        // Emptying the first chunk retires it as the spare, which the next
        // link reuses.
        assert_eq!(queue.pop_front(), Some(0));
        assert_eq!(queue.pop_front(), Some(1));
        queue.push_back(2);
        queue.push_back(3);
        assert_eq!(queue.chunks_allocated(), 2);
        assert_eq!(queue.front(), Some(&2));
    }

    #[test]
    fn steady_state_stops_allocating() {
        let mut queue = ChunkQueue::with_chunk_size(8);
        for i in 0..16 {
            queue.push_back(i);
        }
        // Live items span at most three chunks at once, plus the spare.
        for i in 16..1_000 {
            queue.push_back(i);
            assert_eq!(queue.pop_front(), Some(i - 16));
        }
        let allocated = queue.chunks_allocated();
        assert!(allocated <= 4, "allocated {allocated}");
        for i in 1_000..10_000 {
            queue.push_back(i);
            assert_eq!(queue.pop_front(), Some(i - 16));
        }
        assert_eq!(queue.chunks_allocated(), allocated);
    }

    #[test]
    fn pop_back_across_chunks() {
        let mut queue = ChunkQueue::with_chunk_size(2);
        for i in 0..5 {
            queue.push_back(i);
        }
        assert_eq!(queue.back(), Some(&4));
        assert_eq!(queue.pop_back(), Some(4));
        assert_eq!(queue.pop_back(), Some(3));
        assert_eq!(queue.back(), Some(&2));
        assert_eq!(queue.pop_back(), Some(2));
        assert_eq!(queue.back(), Some(&1));

        queue.push_back(7);
        queue.push_back(8);
        assert_eq!(queue.pop_front(), Some(0));
        assert_eq!(queue.pop_front(), Some(1));
        assert_eq!(queue.pop_front(), Some(7));
        assert_eq!(queue.pop_front(), Some(8));
        assert_eq!(queue.pop_back(), None);
    }

    #[test]
    fn random_ops_match_vecdeque() {
        let mut rng = rand::rng();
        let mut queue = ChunkQueue::with_chunk_size(3);
        let mut model = std::collections::VecDeque::new();

        for i in 0..10_000u32 {
            match rng.random_range(0..4) {
                0 | 1 => {
                    queue.push_back(i);
                    model.push_back(i);
                }
                2 => assert_eq!(queue.pop_front(), model.pop_front()),
                _ => assert_eq!(queue.pop_back(), model.pop_back()),
            }
            assert_eq!(queue.len(), model.len());
            assert_eq!(queue.front(), model.front());
            assert_eq!(queue.back(), model.back());
        }
    }

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct DropCounter;

    impl DropCounter {
        fn new() -> Self {
            COUNTER.fetch_add(1, Ordering::SeqCst);
            Self
        }
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            COUNTER.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn memcheck() {
        let mut queue = ChunkQueue::with_chunk_size(4);
        for _ in 0..37 {
            queue.push_back(DropCounter::new());
        }
        for _ in 0..10 {
            drop(queue.pop_front());
        }
        assert_eq!(COUNTER.load(Ordering::SeqCst), 27);

        drop(queue);
        assert_eq!(COUNTER.load(Ordering::SeqCst), 0, "All the drop counters should have been dropped");
    }
}
