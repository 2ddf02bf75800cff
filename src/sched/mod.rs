//! Round-robin scheduling of messages across pipes.
mod fq;
mod lb;

pub use fq::FairQueue;
pub use lb::{LoadBalancer, SendError};
