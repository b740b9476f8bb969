pub mod handle;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use handle::{ConnectionLease, DocumentHandle};
pub use registry::DocumentRegistry;
pub use retry::{RetryExecutor, RetryPolicy};
pub use scheduler::PersistenceScheduler;
