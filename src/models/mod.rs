pub mod health;
pub mod doc_export;
pub mod diagnostics;
pub mod messages;
pub mod error;

pub use health::*;
pub use doc_export::*;
pub use diagnostics::*;
pub use messages::*;
pub use error::*;
