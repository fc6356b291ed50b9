// Error types for command execution

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by user-supplied `run` and `fallback` operations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Reference-counted error that can be handed to every reader of a future.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Why a command was refused before its `run` operation was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RejectionReason {
    /// The group's circuit breaker is open.
    CircuitOpen,
    /// The breaker is half-open and its single trial request is outstanding.
    HalfOpenTrialInFlight,
    /// The group's bulkhead has no free worker or queue slot.
    BulkheadFull,
    /// The group's pool has been shut down.
    PoolShutdown,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit breaker is open"),
            Self::HalfOpenTrialInFlight => write!(f, "half-open trial already in flight"),
            Self::BulkheadFull => write!(f, "bulkhead is full"),
            Self::PoolShutdown => write!(f, "pool is shut down"),
        }
    }
}

/// Structured failure observed by callers of a command.
#[derive(Error, Debug, Clone)]
pub enum CommandError {
    #[error("Command execution failed: {0}")]
    ExecutionFailure(SharedError),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Command rejected: {0}")]
    Rejected(RejectionReason),

    #[error("Cancellation requested: {0}")]
    CancellationRequested(String),

    #[error("Fallback failed: {fallback} (cause: {cause})")]
    FallbackFailure {
        cause: Box<CommandError>,
        fallback: SharedError,
    },

    #[error("Result not available after waiting {0:?}")]
    WaitElapsed(Duration),
}

impl CommandError {
    /// Wrap a user error as an execution failure.
    pub fn execution(err: BoxError) -> Self {
        Self::ExecutionFailure(Arc::from(err))
    }

    /// Build a fallback failure wrapping the original cause.
    pub fn fallback_failed(cause: CommandError, fallback: BoxError) -> Self {
        Self::FallbackFailure {
            cause: Box::new(cause),
            fallback: Arc::from(fallback),
        }
    }

    /// The error that originally triggered the fallback path, if any.
    pub fn root_cause(&self) -> &CommandError {
        match self {
            Self::FallbackFailure { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), Self::Timeout(_))
    }

    pub fn is_rejection(&self) -> bool {
        matches!(self.root_cause(), Self::Rejected(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::CancellationRequested(_))
    }

    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self.root_cause() {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Returned by the default `Command::fallback`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("No fallback available")]
pub struct FallbackNotImplemented;

/// Returned when a group's fallback concurrency limit is exhausted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Fallback concurrency limit reached")]
pub struct FallbackRejected;

/// Returned when a pooled `run` task panics or is aborted.
#[derive(Error, Debug, Clone)]
#[error("Command panicked: {0}")]
pub struct CommandPanicked(pub String);

/// Invalid group or engine configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Group already initialized: {0}")]
    GroupAlreadyInitialized(String),
}

/// Failure to build a `CommandEngine`.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_root_cause_unwraps_fallback_failure() {
        let err = CommandError::fallback_failed(
            CommandError::Timeout(Duration::from_millis(100)),
            Box::new(Boom),
        );

        assert!(err.is_timeout());
        assert!(!err.is_rejection());
        assert!(matches!(err.root_cause(), CommandError::Timeout(_)));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_rejection_reason() {
        let err = CommandError::Rejected(RejectionReason::BulkheadFull);
        assert_eq!(err.rejection_reason(), Some(RejectionReason::BulkheadFull));
        assert_eq!(err.to_string(), "Command rejected: bulkhead is full");

        let err = CommandError::execution(Box::new(Boom));
        assert_eq!(err.rejection_reason(), None);
    }

    #[test]
    fn test_errors_are_cloneable() {
        let err = CommandError::execution(Box::new(Boom));
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
