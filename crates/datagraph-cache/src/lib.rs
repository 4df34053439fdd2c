pub mod entry;
pub mod resource_cache;
pub mod store;
pub mod teardown;

pub use entry::*;
pub use resource_cache::*;
pub use store::*;
pub use teardown::*;

// Re-export common types for convenience
pub use datagraph_core::{DataGraphError, Identifier, ResourceRef, Result};
