//! Cooperative cancellation.
//!
//! Every run owns a [`CancellationToken`]; the invocations it dispatches
//! hold child tokens so a failing run can stop its in-flight stages without
//! marking the run itself cancelled.

mod token;

pub use token::{CancelCallback, CancellationToken};
