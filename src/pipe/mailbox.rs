use super::ypipe::{YPipeReader, YPipeWriter, ypipe};
use crate::sync::{Notifier, WaitError, Waiter, event};

const COMMAND_CHUNK_SIZE: usize = 16;

/// Creates a command channel with a single sender and a single receiver.
pub(crate) fn mailbox<T>() -> (MailboxSender<T>, MailboxReceiver<T>) {
    let (tx, mut rx) = ypipe(COMMAND_CHUNK_SIZE);
    // The receiver starts asleep: the first command wakes it.
    let ready = rx.check_read();
    debug_assert!(!ready);
    let (notifier, waiter) = event::new();
    (
        MailboxSender { pipe: tx, notifier },
        MailboxReceiver { pipe: rx, waiter },
    )
}

pub(crate) struct MailboxSender<T> {
    pipe: YPipeWriter<T>,
    notifier: Notifier,
}

impl<T> MailboxSender<T> {
    /// Delivers `cmd`, waking the receiver only if it went to sleep.
    pub(crate) fn send(&mut self, cmd: T) {
        self.pipe.write(cmd, false);
        if !self.pipe.flush() {
            // A gone receiver has nothing left to wake.
            let _ = self.notifier.notify();
        }
    }
}

pub(crate) struct MailboxReceiver<T> {
    pipe: YPipeReader<T>,
    waiter: Waiter,
}

impl<T> MailboxReceiver<T> {
    /// Fetches the next command without blocking.
    ///
    /// Returning `None` arms the wakeup for the next [`send`](MailboxSender::send).
    pub(crate) fn recv(&mut self) -> Option<T> {
        self.pipe.read()
    }

    pub(crate) async fn wait(&self) -> Result<(), WaitError> {
        self.waiter.wait().await
    }

    pub(crate) fn wait_blocking(&self) -> Result<(), WaitError> {
        self.waiter.wait_blocking()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn wakes_sleeping_receiver() {
        let (mut tx, mut rx) = mailbox::<u8>();

        assert_eq!(rx.recv(), None);
        let task = tokio::spawn(async move {
            rx.wait().await.unwrap();
            rx.recv()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(42);
        assert_eq!(task.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn first_command_wakes_fresh_receiver() {
        let (mut tx, mut rx) = mailbox::<u8>();
        tx.send(1);
        rx.wait().await.unwrap();
        assert_eq!(rx.recv(), Some(1));
    }

    #[tokio::test]
    async fn awake_receiver_is_not_notified() {
        let (mut tx, mut rx) = mailbox::<u8>();
        tx.send(1);
        rx.wait().await.unwrap();

        // Still awake: it has not run dry since.
        tx.send(2);
        assert!(timeout(Duration::from_millis(20), rx.wait()).await.is_err());
        assert_eq!(rx.recv(), Some(1));
        assert_eq!(rx.recv(), Some(2));
    }

    #[tokio::test]
    async fn dropped_sender_fails_wait() {
        let (tx, rx) = mailbox::<u8>();
        drop(tx);
        assert_eq!(rx.wait().await, Err(WaitError));
    }
}
