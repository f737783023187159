pub mod actor;
pub mod router;
pub mod types;
pub mod writer;

pub use crate::core::*;

pub use actor::*;
pub use router::*;
pub use types::*;
pub use writer::*;
