// Bulwark - isolated command execution for Rust
//
// Commands run inside named groups, each with its own circuit breaker,
// bulkhead, rolling metrics and fallback limit.

// Re-export core functionality
pub use bulwark_core::*;

// Re-export optional crates
#[cfg(feature = "config")]
pub use bulwark_config;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BoxError,
        CircuitState,
        Command,
        CommandEngine,
        CommandError,
        CommandFuture,
        EngineConfig,
        ExecutionContext,
        FnCommand,
        FutureState,
        GroupConfig,
        IsolationStrategy,
        RejectionReason,
        async_trait,
    };
}
