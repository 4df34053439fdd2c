pub mod edge;
pub mod graph;
pub mod loading;
pub mod operations;
pub mod scheduler;

pub use edge::*;
pub use graph::*;
pub use loading::*;
pub use operations::*;
pub use scheduler::*;
