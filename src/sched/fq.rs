use crate::{
    buffers::Payload,
    collections::ActiveSet,
    msg::Msg,
    pipe::{Pipe, PipeId, PipeTable},
};

/// Fair-queues inbound messages across a set of pipes.
///
/// Pipes are visited round-robin. The cursor only moves on once a complete
/// message has been read, so the frames of a multipart message are never
/// interleaved with frames from another pipe.
///
/// A pipe that has nothing to read is deactivated until the owner reports it
/// readable again through [`activated`](Self::activated), typically from
/// [`PipeEvents::read_activated`](crate::PipeEvents::read_activated).
#[derive(Debug, Default)]
pub struct FairQueue {
    pipes: ActiveSet<PipeId>,
    current: usize,
    more: bool,
    last_in: Option<PipeId>,
    saved_credential: Payload,
}

impl FairQueue {
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
    /// If it was the last pipe a complete message came from, its credential
    /// is kept so the message can still be attributed. A multipart message it
    /// was delivering is abandoned: the next frame starts a new message.
    pub fn terminated(&mut self, pipe: &Pipe) {
        let id = pipe.id();
        let in_progress = if self.more { self.current() } else { None };
        if in_progress == Some(id) {
            tracing::debug!(pipe = %id, "Pipe terminated in the middle of a multipart message");
            self.more = false;
        }
        if self.pipes.remove(id) == Some(true) && self.current >= self.pipes.active_len() {
            self.current = 0;
        }
        // Removal may have moved the pipe still delivering a multipart message.
        if let Some(i) = in_progress.and_then(|p| self.pipes.active_index(p)) {
            self.current = i;
        }
        if self.last_in == Some(id) {
            self.saved_credential = pipe.credential().clone();
            self.last_in = None;
        }
    }

    /// Number of attached pipes.
    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    pub fn recv(&mut self, pipes: &mut PipeTable) -> Option<Msg> {
        self.recv_pipe(pipes).map(|(msg, _)| msg)
    }

    /// Reads the next frame along with the pipe it came from.
    pub fn recv_pipe(&mut self, pipes: &mut PipeTable) -> Option<(Msg, PipeId)> {
        while let Some(id) = self.current() {
            if let Some(msg) = pipes.get_mut(id).and_then(Pipe::read) {
                self.more = msg.more();
                if !self.more {
                    self.last_in = Some(id);
                    self.current = (self.current + 1) % self.pipes.active_len();
                }
                return Some((msg, id));
            }

            if self.more {
                // The pipe went away in the middle of a multipart message.
                tracing::debug!(pipe = %id, "Incomplete multipart message");
                self.more = false;
            }
            // Another active pipe takes this slot: no need to move the cursor.
            self.deactivate_current();
        }
        None
    }

    /// Returns whether a frame can be read, deactivating exhausted pipes on
    /// the way.
    pub fn has_in(&mut self, pipes: &mut PipeTable) -> bool {
        if self.more {
            return true;
        }
        while let Some(id) = self.current() {
            if pipes.get_mut(id).is_some_and(Pipe::check_read) {
                return true;
            }
            self.deactivate_current();
        }
        false
    }

    /// Credential of the pipe the last complete message was read from.
    pub fn credential<'a>(&'a self, pipes: &'a PipeTable) -> &'a Payload {
        self.last_in
            .and_then(|id| pipes.get(id))
            .map_or(&self.saved_credential, Pipe::credential)
    }

    fn current(&self) -> Option<PipeId> {
        self.pipes.active().get(self.current).copied()
    }

    fn deactivate_current(&mut self) {
        self.pipes.deactivate_at(self.current);
        if self.current >= self.pipes.active_len() {
            self.current = 0;
        }
    }
}
