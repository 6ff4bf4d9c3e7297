//! Transaction layer: lock queues, timestamps, state tracking, contexts.

pub mod context;
pub mod lock;
pub mod manager;

pub use context::TxContext;
pub use lock::{LockError, LockManager, LockWait, WaiterView};
pub use manager::{FinishDispatcher, TxError, TxFinishRequest, TxManager, TxState};
