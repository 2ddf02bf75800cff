use thiserror::Error;

use crate::{
    collections::ActiveSet,
    msg::Msg,
    pipe::{Pipe, PipeId, PipeTable},
};

/// Errors returned by [`LoadBalancer::send`].
#[derive(Debug, Error)]
pub enum SendError {
    /// No attached pipe can accept the frame right now.
    ///
    /// Nothing was written. The frame is handed back and may be sent again
    /// once a pipe reports [`write_activated`](crate::PipeEvents::write_activated).
    #[error("No pipe can accept the message")]
    WouldBlock(Msg),

    /// A non-initial frame of a multipart message could not be written.
    ///
    /// The frames already written were rolled back and the remaining frames
    /// of the same message will be silently dropped. The frame is handed back
    /// for inspection only: resending it would break message atomicity.
    #[error("Multipart message aborted, the pipe stopped accepting frames")]
    Aborted(Msg),
}

/// Load-balances outbound messages across a set of pipes.
///
/// Each complete message goes to the next writable pipe in round-robin order.
/// All frames of a multipart message go to the same pipe and are flushed
/// together with the final frame.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    pipes: ActiveSet<PipeId>,
    current: usize,
    more: bool,
    dropping: bool,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, id: PipeId) {
        self.pipes.push_active(id);
    }

    pub fn activated(&mut self, id: PipeId) {
        self.pipes.activate(id);
    }

    /// Forgets a pipe whose termination completed.
    ///
    /// If a multipart message was being sent to it, the rest of that message
    /// is dropped.
    pub fn terminated(&mut self, id: PipeId) {
        let in_progress = if self.more { self.current_id() } else { None };
        if in_progress == Some(id) {
            self.dropping = true;
        }
        if self.pipes.remove(id) == Some(true) && self.current >= self.pipes.active_len() {
            self.current = 0;
        }
        // Removal may have moved the pipe still receiving a multipart message.
        if let Some(i) = in_progress.and_then(|p| self.pipes.active_index(p)) {
            self.current = i;
        }
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    /// Sends one frame, returning the pipe it was written to.
    ///
    /// `Ok(None)` means the frame belonged to a message being dropped.
    pub fn send(&mut self, msg: Msg, pipes: &mut PipeTable) -> Result<Option<PipeId>, SendError> {
        if self.dropping {
            self.more = msg.more();
            self.dropping = self.more;
            return Ok(None);
        }

        let more = msg.more();
        let mut msg = msg;
        let id = loop {
            let Some(id) = self.current_id() else {
                return Err(SendError::WouldBlock(msg));
            };
            let Some(pipe) = pipes.get_mut(id) else {
                self.deactivate_current();
                if self.more {
                    // The rest of the message cannot follow its first frames.
                    tracing::debug!(pipe = %id, "Multipart message aborted, pipe is gone");
                    self.dropping = msg.more();
                    self.more = false;
                    return Err(SendError::Aborted(msg));
                }
                continue;
            };
            match pipe.write(msg) {
                Ok(()) => break id,
                Err(rejected) if self.more => {
                    pipe.rollback();
                    tracing::debug!(pipe = %id, "Multipart message aborted");
                    self.dropping = rejected.more();
                    self.more = false;
                    return Err(SendError::Aborted(rejected));
                }
                Err(rejected) => {
                    msg = rejected;
                    self.deactivate_current();
                }
            }
        };

        self.more = more;
        if !more {
            if let Some(pipe) = pipes.get_mut(id) {
                pipe.flush();
            }
            self.current = (self.current + 1) % self.pipes.active_len();
        }
        Ok(Some(id))
    }

    /// Returns whether a frame can be sent, deactivating full pipes on the
    /// way.
    pub fn has_out(&mut self, pipes: &mut PipeTable) -> bool {
        if self.more {
            return true;
        }
        while let Some(id) = self.current_id() {
            if pipes.get_mut(id).is_some_and(Pipe::check_write) {
                return true;
            }
            self.deactivate_current();
        }
        false
    }

    fn current_id(&self) -> Option<PipeId> {
        self.pipes.active().get(self.current).copied()
    }

    fn deactivate_current(&mut self) {
        self.pipes.deactivate_at(self.current);
        if self.current >= self.pipes.active_len() {
            self.current = 0;
        }
    }
}
