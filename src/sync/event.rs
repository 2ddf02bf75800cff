use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use event_listener::{Event, IntoNotification, Listener};
use thiserror::Error;

/// Error returned when waiting on an event whose notifier has been dropped.
///
/// For a pipe endpoint this means the peer endpoint is gone: no command will
/// ever arrive again.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("No notifier available: the peer endpoint has been dropped")]
pub struct WaitError;

/// Error returned when notifying an event whose waiter has been dropped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("No waiter available")]
pub(crate) struct NotifyError;

/// Flag bit set by [`Notifier::notify`] and cleared by the waiter.
const PENDING: u8 = 0b01;
/// Flag bit set once either side is dropped.
const CLOSED: u8 = 0b10;

struct Shared {
    flag: AtomicU8,
    event: Event,
}

impl Shared {
    /// Takes the pending notification. `None` means there is nothing to take
    /// yet.
    fn take(&self) -> Option<Result<(), WaitError>> {
        let prev = self.flag.fetch_and(!PENDING, Ordering::AcqRel);
        if prev & CLOSED != 0 {
            Some(Err(WaitError))
        } else if prev & PENDING != 0 {
            Some(Ok(()))
        } else {
            None
        }
    }

    fn close(&self) {
        self.flag.fetch_or(CLOSED, Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }
}

/// Creates a single-waiter wakeup event.
///
/// Notifications latch: a notification sent while nobody waits is consumed by
/// the next wait. Several notifications sent before a wait collapse into one.
/// Once the notifier is dropped every wait fails, even with a notification
/// still pending.
pub(crate) fn new() -> (Notifier, Waiter) {
    let shared = Arc::new(Shared {
        flag: AtomicU8::new(0),
        event: Event::new(),
    });
    (Notifier(shared.clone()), Waiter(shared))
}

pub(crate) struct Notifier(Arc<Shared>);

impl Notifier {
    #[inline]
    pub(crate) fn notify(&self) -> Result<(), NotifyError> {
        if self.0.flag.fetch_or(PENDING, Ordering::AcqRel) & CLOSED != 0 {
            return Err(NotifyError);
        }
        self.0.event.notify(1.additional().relaxed());
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub(crate) struct Waiter(Arc<Shared>);

impl Waiter {
    /// Waits asynchronously until a notification is pending.
    pub(crate) async fn wait(&self) -> Result<(), WaitError> {
        loop {
            if let Some(res) = self.0.take() {
                return res;
            }
            let listener = self.0.event.listen();
            // Catch a notification that landed before the listener existed.
            if let Some(res) = self.0.take() {
                return res;
            }
            listener.await;
        }
    }

    /// Blocks the current thread until a notification is pending.
    pub(crate) fn wait_blocking(&self) -> Result<(), WaitError> {
        loop {
            if let Some(res) = self.0.take() {
                return res;
            }
            let listener = self.0.event.listen();
            if let Some(res) = self.0.take() {
                return res;
            }
            listener.wait();
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use tokio::time::timeout;

    use super::*;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn wakes_a_parked_waiter() {
        let (notifier, waiter) = new();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.notify().unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn early_notifications_collapse_into_one() {
        let (notifier, waiter) = new();
        for _ in 0..3 {
            notifier.notify().unwrap();
        }

        assert_eq!(timeout(SHORT, waiter.wait()).await, Ok(Ok(())));
        assert!(timeout(SHORT, waiter.wait()).await.is_err());
    }

    #[tokio::test]
    async fn closing_beats_a_pending_notification() {
        let (notifier, waiter) = new();
        notifier.notify().unwrap();
        drop(notifier);

        assert_eq!(waiter.wait().await, Err(WaitError));
        assert_eq!(waiter.wait_blocking(), Err(WaitError));
    }

    #[test]
    fn notify_without_waiter_fails() {
        let (notifier, waiter) = new();
        drop(waiter);
        assert_eq!(notifier.notify(), Err(NotifyError));
    }

    #[test]
    fn blocking_wait_across_threads() {
        let (notifier, waiter) = new();
        let handle = thread::spawn(move || {
            waiter.wait_blocking()?;
            waiter.wait_blocking()
        });

        thread::sleep(Duration::from_millis(10));
        notifier.notify().unwrap();
        thread::sleep(Duration::from_millis(10));
        drop(notifier);

        assert_eq!(handle.join().unwrap(), Err(WaitError));
    }
}
