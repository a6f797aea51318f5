//! Concurrency building blocks shared by the signal client, transports and engine

pub mod completer;
pub mod condition_queue;
pub mod debounce;
pub mod observers;
pub mod retry;
pub mod state_sync;

pub use completer::Completer;
pub use condition_queue::ConditionQueue;
pub use debounce::Debouncer;
pub use observers::{ObserverId, Observers};
pub use retry::retry;
pub use state_sync::StateSync;
