use core::{
    fmt,
    hash::{Hash, Hasher},
    ops::{Bound, Deref, Range, RangeBounds},
};
use std::{any::Any, sync::Arc};

/// A trait for types that can back a [`Payload`] and provide a byte slice
/// view.
///
/// Any storage can carry message bytes as long as it can be shared between
/// threads: the pipe hands a message from the thread that decoded it to the
/// thread that consumes it without copying. Pooled allocators use this trait to
/// wrap their buffers in a type that returns the storage to the pool on drop
/// (see [`OnDrop`](crate::collections::OnDrop)).
///
/// # Examples
///
/// Short bodies kept inline, with no heap allocation:
///
/// ```
/// use msgpipe::{DynBuf, Payload};
///
/// struct Inline {
///     len: u8,
///     bytes: [u8; 15],
/// }
///
/// impl DynBuf for Inline {
///     fn as_slice(&self) -> &[u8] {
///         &self.bytes[..self.len as usize]
///     }
///
///     fn as_any(&self) -> &dyn std::any::Any {
///         self
///     }
/// }
///
/// let payload = Payload::from(Inline { len: 2, bytes: *b"ok_____________" });
/// assert_eq!(payload, *b"ok");
/// ```
pub trait DynBuf: Send + Sync {
    /// The bytes of the buffer.
    fn as_slice(&self) -> &[u8];

    /// `self`, for [`Payload::downcast_ref`].
    fn as_any(&self) -> &dyn Any;
}

macro_rules! dyn_buf {
    ($($ty:ty => |$this:ident| $bytes:expr),* $(,)?) => {$(
        impl DynBuf for $ty {
            fn as_slice(&self) -> &[u8] {
                let $this = self;
                $bytes
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    )*};
}

dyn_buf! {
    Vec<u8> => |v| v,
    Box<[u8]> => |b| b,
    &'static [u8] => |s| s,
    String => |s| s.as_bytes(),
    &'static str => |s| s.as_bytes(),
}

impl<const N: usize> DynBuf for [u8; N] {
    fn as_slice(&self) -> &[u8] {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// The body of a message: a cheaply cloneable, immutable view on a byte
/// buffer.
///
/// Cloning only bumps a reference count, and [`view`](Payload::view) narrows
/// the visible range without copying. The encoder relies on this to hand the
/// body of a large message straight to the transport.
///
/// # Examples
///
/// ```
/// use msgpipe::Payload;
///
/// let frame = Payload::from(b"\x00\x05hello".to_vec());
/// let body = frame.view(2..).unwrap();
/// assert_eq!(body, *b"hello");
/// assert_eq!(body.view(1..=2).unwrap(), *b"el");
/// assert!(body.view(..6).is_none());
/// ```
#[derive(Clone)]
pub struct Payload {
    buf: Arc<dyn DynBuf>,
    range: Range<usize>,
}

/// Resolves `range` against a length, `None` when it does not fit.
fn resolve(range: impl RangeBounds<usize>, len: usize) -> Option<Range<usize>> {
    let start = match range.start_bound() {
        Bound::Included(&n) => n,
        Bound::Excluded(&n) => n.checked_add(1)?,
        Bound::Unbounded => 0,
    };
    let end = match range.end_bound() {
        Bound::Included(&n) => n.checked_add(1)?,
        Bound::Excluded(&n) => n,
        Bound::Unbounded => len,
    };
    (start <= end && end <= len).then_some(start..end)
}

impl Payload {
    /// Creates a payload over `range` of `buf`.
    ///
    /// # Errors
    ///
    /// Hands `buf` back when the range does not fit in it.
    pub fn new(buf: Arc<dyn DynBuf>, range: impl RangeBounds<usize>) -> Result<Payload, Arc<dyn DynBuf>> {
        match resolve(range, buf.as_slice().len()) {
            Some(range) => Ok(Self { buf, range }),
            None => Err(buf),
        }
    }

    pub fn empty() -> Self {
        Self::from(&[] as &'static [u8])
    }

    /// Copies `data` into a freshly allocated payload.
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from(data.to_vec())
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: every constructor checks the range against the buffer and
        // `view` only ever narrows it.
        unsafe { self.buf.as_slice().get_unchecked(self.range.clone()) }
    }

    /// Attempts to downcast the backing storage to a concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.buf.as_any().downcast_ref()
    }

    /// Creates a view into a subrange of this payload.
    ///
    /// The range is relative to the current view. Returns `None` when the
    /// range is out of bounds.
    #[must_use]
    pub fn view(&self, range: impl RangeBounds<usize>) -> Option<Self> {
        let sub = resolve(range, self.len())?;
        Some(Payload {
            buf: Arc::clone(&self.buf),
            range: self.range.start + sub.start..self.range.start + sub.end,
        })
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::empty()
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl<Rhs: AsRef<[u8]> + ?Sized> PartialEq<Rhs> for Payload {
    fn eq(&self, other: &Rhs) -> bool {
        self.as_slice() == other.as_ref()
    }
}

impl Eq for Payload {}

impl Hash for Payload {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_slice().hash(state);
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_slice(), f)
    }
}

impl<T> From<Arc<T>> for Payload
where
    T: DynBuf + 'static,
{
    fn from(buf: Arc<T>) -> Self {
        let range = 0..buf.as_slice().len();
        Self { buf, range }
    }
}

impl<T> From<T> for Payload
where
    T: DynBuf + 'static,
{
    fn from(buf: T) -> Self {
        Self::from(Arc::new(buf))
    }
}

impl Payload {
    #[cfg(test)]
    pub(crate) fn rand(len: usize) -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        (0..len).map(|_| rng.random()).collect::<Vec<u8>>().into()
    }
}
