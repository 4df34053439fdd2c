pub mod config;
pub mod error;
pub mod identifier;
pub mod identifier_cache;
pub mod notify;
pub mod payload;
pub mod schema;
pub mod telemetry;
pub mod traits;

pub use config::*;
pub use error::*;
pub use identifier::*;
pub use identifier_cache::*;
pub use notify::*;
pub use payload::*;
pub use schema::*;
pub use telemetry::*;
pub use traits::*;
