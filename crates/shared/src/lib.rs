pub mod auth;
pub mod config;
pub mod errors;
pub mod telemetry;
pub mod tracing;

pub use auth::*;
pub use config::*;
pub use errors::*;
pub use self::tracing::init_tracing;
