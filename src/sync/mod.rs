pub(crate) mod event;

pub use event::WaitError;
pub(crate) use event::{Notifier, Waiter};
