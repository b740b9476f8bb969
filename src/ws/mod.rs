pub mod coordinator;
pub mod presence;
pub mod sync;

pub use coordinator::SessionCoordinator;
