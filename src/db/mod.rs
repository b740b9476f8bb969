pub mod dbdocs;
pub mod memory;
pub mod store;

pub use dbdocs::DbDocs;
pub use memory::MemoryDocs;
pub use store::DocumentStore;
