// Core library for bulwark
// Commands, per-group circuit breakers, bulkheads, rolling metrics and result futures

pub mod bulkhead;
pub mod circuit_breaker;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod future;
pub mod group;
pub mod logging;
pub mod metrics;

// Re-export commonly used types
pub use bulkhead::*;
pub use circuit_breaker::*;
pub use command::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use future::{CommandFuture, FutureState};
pub use group::*;
pub use metrics::*;

pub use async_trait::async_trait;
