//! Durable retry queue for mutating operations that could not be delivered.
//!
//! Operations are removed only after a server-confirmed success. Anything
//! else leaves them queued, in their original position, for the next drain.

mod drain;
mod store;

pub use drain::{DrainReport, Submitter};
pub use store::{PendingOperation, RetryQueue};

#[cfg(test)]
pub use drain::testing;
