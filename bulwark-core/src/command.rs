//! Command definition.
//!
//! A command is a unit of work against one dependency: a primary `run`
//! step, a `fallback` used when `run` is denied, fails or times out, and a
//! `cleanup` hook that runs once the outcome is settled.
//! Commands sharing a [`group_key`](Command::group_key) share one breaker,
//! one metrics window and one bulkhead.
//!
//! ## Example
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use bulwark_core::{BoxError, Command, CommandError, ExecutionContext};
//!
//! struct FetchUser { client: ApiClient }
//!
//! #[async_trait]
//! impl Command for FetchUser {
//!     type Input = u64;
//!     type Output = User;
//!
//!     fn group_key(&self) -> &str { "users" }
//!
//!     async fn run(&self, id: u64, ctx: &ExecutionContext) -> Result<User, BoxError> {
//!         tokio::select! {
//!             user = self.client.get_user(id) => Ok(user?),
//!             _ = ctx.cancelled() => Err("cancelled".into()),
//!         }
//!     }
//!
//!     async fn fallback(&self, id: u64, _cause: &CommandError) -> Result<User, BoxError> {
//!         Ok(User::anonymous(id))
//!     }
//! }
//! ```

use crate::error::{BoxError, CommandError, FallbackNotImplemented};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A unit of work guarded by its group's breaker and bulkhead.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    type Input: Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    /// Isolation group this command belongs to.
    fn group_key(&self) -> &str;

    /// The primary operation.
    ///
    /// Long-running implementations should watch `ctx` and stop once it is
    /// cancelled; the engine never aborts a running `run` forcibly.
    async fn run(&self, input: Self::Input, ctx: &ExecutionContext) -> Result<Self::Output, BoxError>;

    /// Degraded result used when `run` is rejected, fails or times out.
    async fn fallback(&self, input: Self::Input, cause: &CommandError) -> Result<Self::Output, BoxError> {
        let _ = (input, cause);
        Err(Box::new(FallbackNotImplemented))
    }

    /// Release resources held for this execution.
    ///
    /// Runs once per execution after `run` and any `fallback`, before the
    /// future resolves. A cancelled execution runs it after the future has
    /// already resolved. Errors are logged and otherwise ignored.
    async fn cleanup(&self, input: Self::Input) -> Result<(), BoxError> {
        let _ = input;
        Ok(())
    }
}

/// Per-execution state visible to [`Command::run`].
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    id: Uuid,
    group: Arc<str>,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        id: Uuid,
        group: Arc<str>,
        deadline: Option<Instant>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            group,
            deadline,
            token,
        }
    }

    /// Execution id, matching the caller's `CommandFuture::id`.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn group_key(&self) -> &str {
        &self.group
    }

    /// Instant after which the engine gives up on this execution.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// True once the caller cancelled or the execution timed out.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`is_cancelled`](Self::is_cancelled) becomes true.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }
}

/// Async run closure stored by [`FnCommand`].
pub type RunFn<I, O> = Arc<
    dyn Fn(I, ExecutionContext) -> Pin<Box<dyn Future<Output = Result<O, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Async fallback closure stored by [`FnCommand`].
pub type FallbackFn<I, O> = Arc<
    dyn Fn(I, CommandError) -> Pin<Box<dyn Future<Output = Result<O, BoxError>> + Send>>
        + Send
        + Sync,
>;

/// Async cleanup closure stored by [`FnCommand`].
pub type CleanupFn<I> =
    Arc<dyn Fn(I) -> Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>> + Send + Sync>;

/// Closure-backed [`Command`].
///
/// ```
/// use bulwark_core::{BoxError, CommandEngine, EngineConfig, FnCommand};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let engine = CommandEngine::new(EngineConfig::default()).unwrap();
/// let stock = Arc::new(
///     FnCommand::new("inventory", |sku: String, _ctx| async move {
///         Err::<u32, BoxError>(format!("{} lookup timed out", sku).into())
///     })
///     .with_fallback(|_sku, _cause| async { Ok(0) }),
/// );
///
/// assert_eq!(engine.execute(stock, "A-100".to_string()).await.unwrap(), 0);
/// # });
/// ```
pub struct FnCommand<I, O> {
    group: String,
    run: RunFn<I, O>,
    fallback: Option<FallbackFn<I, O>>,
    cleanup: Option<CleanupFn<I>>,
}

impl<I, O> FnCommand<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    pub fn new<F, Fut>(group: impl Into<String>, run: F) -> Self
    where
        F: Fn(I, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
    {
        Self {
            group: group.into(),
            run: Arc::new(move |input, ctx| Box::pin(run(input, ctx))),
            fallback: None,
            cleanup: None,
        }
    }

    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(I, CommandError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |input, cause| Box::pin(fallback(input, cause))));
        self
    }

    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.cleanup = Some(Arc::new(move |input| Box::pin(cleanup(input))));
        self
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

impl<I, O> Clone for FnCommand<I, O> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            run: Arc::clone(&self.run),
            fallback: self.fallback.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for FnCommand<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCommand")
            .field("group", &self.group)
            .field("has_fallback", &self.fallback.is_some())
            .field("has_cleanup", &self.cleanup.is_some())
            .finish()
    }
}

#[async_trait]
impl<I, O> Command for FnCommand<I, O>
where
    I: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    type Input = I;
    type Output = O;

    fn group_key(&self) -> &str {
        &self.group
    }

    async fn run(&self, input: I, ctx: &ExecutionContext) -> Result<O, BoxError> {
        (self.run)(input, ctx.clone()).await
    }

    async fn fallback(&self, input: I, cause: &CommandError) -> Result<O, BoxError> {
        match &self.fallback {
            Some(fallback) => fallback(input, cause.clone()).await,
            None => Err(Box::new(FallbackNotImplemented)),
        }
    }

    async fn cleanup(&self, input: I) -> Result<(), BoxError> {
        match &self.cleanup {
            Some(cleanup) => cleanup(input).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionReason;

    fn context(deadline: Option<Instant>) -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), Arc::from("test"), deadline, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_fn_command_runs_closure() {
        let command = FnCommand::new("math", |x: i32, _ctx| async move { Ok(x * 2) });

        assert_eq!(command.group_key(), "math");
        assert_eq!(command.run(21, &context(None)).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_default_fallback_is_not_implemented() {
        let command = FnCommand::new("math", |x: i32, _ctx| async move { Ok(x) });
        let cause = CommandError::Rejected(RejectionReason::CircuitOpen);

        let err = command.fallback(1, &cause).await.unwrap_err();
        assert!(err.downcast_ref::<FallbackNotImplemented>().is_some());
    }

    #[tokio::test]
    async fn test_fallback_receives_cause() {
        let command = FnCommand::new("math", |_: i32, _ctx| async move {
            Err::<i32, BoxError>("down".into())
        })
        .with_fallback(|x, cause| async move {
            assert!(cause.is_timeout());
            Ok(-x)
        });

        let cause = CommandError::Timeout(Duration::from_millis(10));
        assert!(command.has_fallback());
        assert_eq!(command.fallback(3, &cause).await.unwrap(), -3);
    }

    #[tokio::test]
    async fn test_cleanup_defaults_to_noop() {
        let command = FnCommand::new("math", |x: i32, _ctx| async move { Ok(x) });
        assert!(command.cleanup(1).await.is_ok());

        let command = command.with_cleanup(|x| async move {
            Err::<(), BoxError>(format!("cannot release {}", x).into())
        });
        assert_eq!(command.cleanup(7).await.unwrap_err().to_string(), "cannot release 7");
    }

    #[tokio::test]
    async fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(Uuid::new_v4(), Arc::from("test"), None, token.child_token());

        assert!(!ctx.is_cancelled());
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_context_remaining() {
        let ctx = context(Some(Instant::now() + Duration::from_secs(10)));
        let remaining = ctx.remaining().unwrap();
        assert!(remaining > Duration::from_secs(9));

        assert!(context(None).remaining().is_none());
        let expired = context(Some(Instant::now()));
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(expired.remaining(), Some(Duration::ZERO));
    }
}
