use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::collections::RawChunkQueue;

/// Value of the shared position when the reader went to sleep.
const ASLEEP: u64 = u64::MAX;

struct Shared<T> {
    queue: RawChunkQueue<T>,
    // Position up to which items are readable, or ASLEEP.
    c: CachePadded<AtomicU64>,
}

/// Creates a lock-free single-producer single-consumer queue.
///
/// Writes become visible to the reader only once flushed. The reader and the
/// writer synchronise on a single atomic position: `flush` publishes it with
/// release semantics and `check_read` acquires it. When the reader finds
/// nothing to read it atomically marks itself asleep, so the next flush can
/// tell the writer that the reader must be woken up.
pub(crate) fn ypipe<T>(chunk_size: usize) -> (YPipeWriter<T>, YPipeReader<T>) {
    let shared = Arc::new(Shared {
        queue: RawChunkQueue::new(chunk_size),
        c: CachePadded::new(AtomicU64::new(0)),
    });
    (
        YPipeWriter {
            shared: shared.clone(),
            w: 0,
            f: 0,
        },
        YPipeReader { shared, r: 0 },
    )
}

pub(crate) struct YPipeWriter<T> {
    shared: Arc<Shared<T>>,
    // First item not flushed yet.
    w: u64,
    // First item not yet complete, i.e. the limit of the next flush.
    f: u64,
}

impl<T> YPipeWriter<T> {
    /// Appends `t`.
    ///
    /// An incomplete item, and everything written after it, is held back by
    /// [`flush`](Self::flush) until a complete item is written.
    pub(crate) fn write(&mut self, t: T, incomplete: bool) {
        // SAFETY: the writer is the single producer.
        unsafe { self.shared.queue.push_back(t) };
        if !incomplete {
            self.f = unsafe { self.shared.queue.back_pos() };
        }
    }

    /// Removes the last written item if it has not been completed yet.
    pub(crate) fn unwrite(&mut self) -> Option<T> {
        // SAFETY: items past `f` were never published.
        unsafe {
            if self.shared.queue.back_pos() == self.f {
                return None;
            }
            Some(self.shared.queue.pop_back())
        }
    }

    /// Publishes all the complete items.
    ///
    /// Returns `false` if the reader is asleep and must be woken up by other
    /// means.
    pub(crate) fn flush(&mut self) -> bool {
        if self.w == self.f {
            return true;
        }
        match self
            .shared
            .c
            .compare_exchange(self.w, self.f, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.w = self.f;
                true
            }
            Err(c) => {
                debug_assert_eq!(c, ASLEEP);
                // The reader is asleep: nobody races with us on `c` until it
                // is woken up.
                self.shared.c.store(self.f, Ordering::Release);
                self.w = self.f;
                false
            }
        }
    }
}

pub(crate) struct YPipeReader<T> {
    shared: Arc<Shared<T>>,
    // Prefetched readable limit.
    r: u64,
}

impl<T> YPipeReader<T> {
    /// Returns whether an item is available, marking the reader asleep when
    /// none is.
    pub(crate) fn check_read(&mut self) -> bool {
        // SAFETY: the reader is the single consumer.
        let front = unsafe { self.shared.queue.front_pos() };
        if front != self.r && self.r != ASLEEP {
            return true;
        }

        // Either fetch a new limit or go to sleep.
        self.r = match self
            .shared
            .c
            .compare_exchange(front, ASLEEP, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(prev) | Err(prev) => prev,
        };
        !(self.r == front || self.r == ASLEEP)
    }

    pub(crate) fn read(&mut self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        // SAFETY: `check_read` acquired an item.
        Some(unsafe { self.shared.queue.pop_front() })
    }

    /// Applies `pred` to the next item without consuming it.
    pub(crate) fn probe(&mut self, pred: impl FnOnce(&T) -> bool) -> bool {
        if !self.check_read() {
            return false;
        }
        // SAFETY: `check_read` acquired an item.
        pred(unsafe { &*self.shared.queue.front() })
    }
}
