use std::{any::Any, fmt, mem::ManuallyDrop, ops::Deref};

use crate::buffers::DynBuf;

/// A buffer wrapper that hands its value to a hook when the last reference to
/// it goes away.
///
/// Message bodies travel through pipes as [`Payload`](crate::Payload)s, so the
/// storage is only released once every clone of the payload is gone. Wrapping
/// the storage in an [`OnDrop`] is how [`PoolAllocator`](crate::PoolAllocator)
/// gets its buffers back: the hook pushes the storage into the pool instead of
/// freeing it.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use msgpipe::{Payload, collections::OnDrop};
///
/// static RETURNED: AtomicUsize = AtomicUsize::new(0);
///
/// let body = OnDrop::new(vec![1u8, 2, 3], |v: Vec<u8>| {
///     RETURNED.fetch_add(v.len(), Ordering::SeqCst);
/// });
/// let payload = Payload::from(body);
/// let view = payload.view(1..).unwrap();
///
/// drop(payload);
/// assert_eq!(RETURNED.load(Ordering::SeqCst), 0);
///
/// drop(view);
/// assert_eq!(RETURNED.load(Ordering::SeqCst), 3);
/// ```
pub struct OnDrop<T, D: FnOnce(T)> {
    value: ManuallyDrop<T>,
    hook: Option<D>,
}

impl<T, D: FnOnce(T)> OnDrop<T, D> {
    pub fn new(value: T, hook: D) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            hook: Some(hook),
        }
    }
}

impl<T, D: FnOnce(T)> Deref for OnDrop<T, D> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: fmt::Debug, D: FnOnce(T)> fmt::Debug for OnDrop<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OnDrop").field(&*self.value).finish()
    }
}

impl<T, D> DynBuf for OnDrop<T, D>
where
    T: DynBuf + 'static,
    D: FnOnce(T) + Send + Sync + 'static,
{
    fn as_slice(&self) -> &[u8] {
        self.value.as_slice()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T, D: FnOnce(T)> Drop for OnDrop<T, D> {
    fn drop(&mut self) {
        // SAFETY: `value` is never touched again after being taken here.
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        match self.hook.take() {
            Some(hook) => hook(value),
            None => drop(value),
        }
    }
}
