pub mod health;
pub mod doc_export;
pub mod diagnostics;

pub use health::*;
pub use doc_export::*;
pub use diagnostics::*;
