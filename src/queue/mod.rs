//! Offline write queue and batched remote writes.

mod batch;
mod operation;
mod pending;
mod retry;

pub use batch::{BatchExecutor, FanOutKind, FanOutOperation};
pub use operation::{operation_id, OperationIntent, PendingOperation};
pub use pending::OperationQueue;
pub use retry::RetryPolicy;
