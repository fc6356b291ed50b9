//! Command execution engine.
//!
//! For every submission the engine:
//!
//! 1. resolves (or lazily creates) the command's group,
//! 2. asks the group's breaker for permission and reserves a bulkhead slot,
//!    both synchronously so rejections are decided at submission time,
//! 3. waits for a worker slot, then runs the command under the group's run
//!    timeout and the future's cancellation token,
//! 4. records the outcome in the group's window, goes through the command's
//!    fallback on rejection, failure or timeout, runs its cleanup and
//!    resolves the [`CommandFuture`].
//!
//! Cancellation skips the fallback entirely.

use crate::bulkhead::{BulkheadError, BulkheadPermit, BulkheadStats, BulkheadTicket};
use crate::circuit_breaker::{BreakerGrant, CircuitState};
use crate::command::{Command, ExecutionContext};
use crate::config::{EngineConfig, GroupConfig, IsolationStrategy};
use crate::error::{
    BoxError, CommandError, CommandPanicked, ConfigError, EngineError, FallbackRejected,
    RejectionReason,
};
use crate::events::{CommandEvent, EventBus};
use crate::future::{self, CommandFuture, Completer};
use crate::group::{CommandGroup, GroupRegistry, GroupSnapshot};
use crate::metrics::{Outcome, WindowSnapshot};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Entry point for running commands.
///
/// Cheap to clone; clones share groups, events and the runtime handle.
#[derive(Clone)]
pub struct CommandEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: GroupRegistry,
    events: EventBus,
    handle: Handle,
}

enum Admission {
    Granted {
        ticket: BulkheadTicket,
        grant: BreakerGrant,
    },
    Rejected(RejectionReason),
}

enum Queued {
    Ready(BulkheadPermit),
    Cancelled,
    TimedOut,
    Shutdown,
}

enum Step<T> {
    Done(Result<T, BoxError>),
    TimedOut,
    Cancelled,
}

impl CommandEngine {
    /// Create an engine on the current tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let handle = Handle::try_current()?;
        Ok(Self::with_handle(config, handle)?)
    }

    /// Create an engine whose tasks run on `handle`.
    pub fn with_handle(config: EngineConfig, handle: Handle) -> Result<Self, ConfigError> {
        config.validate()?;

        let events = EventBus::start(&handle);
        Ok(Self {
            inner: Arc::new(EngineInner {
                registry: GroupRegistry::new(config.default_group, events.clone()),
                events,
                handle,
            }),
        })
    }

    /// Create group `key` with its own configuration.
    ///
    /// Must happen before the group's first submission.
    pub fn configure_group(
        &self,
        key: &str,
        config: GroupConfig,
    ) -> Result<Arc<CommandGroup>, ConfigError> {
        self.inner.registry.configure(key, config)
    }

    /// Submit a command without waiting for it.
    pub fn submit<C: Command>(&self, command: Arc<C>, input: C::Input) -> CommandFuture<C::Output> {
        let (future, completer) = future::channel(command.group_key());
        let (execution, admission) = self.prepare(command, input, completer);

        self.inner.handle.spawn(execution.run(admission));
        future
    }

    /// Run a command to completion on the calling task.
    ///
    /// Under [`IsolationStrategy::Pooled`] the `run` step still executes on
    /// its own worker task.
    pub async fn execute<C>(&self, command: Arc<C>, input: C::Input) -> Result<C::Output, CommandError>
    where
        C: Command,
        C::Output: Clone,
    {
        let (future, completer) = future::channel(command.group_key());
        let (execution, admission) = self.prepare(command, input, completer);

        execution.run(admission).await;
        future.result_async().await
    }

    /// Submit and block the calling thread until the result is available.
    ///
    /// `timeout` bounds only this wait; on expiry the command keeps running
    /// and [`CommandError::WaitElapsed`] is returned. Must not be called
    /// from a runtime worker thread.
    pub fn run_sync<C>(
        &self,
        command: Arc<C>,
        input: C::Input,
        timeout: Option<Duration>,
    ) -> Result<C::Output, CommandError>
    where
        C: Command,
        C::Output: Clone,
    {
        self.submit(command, input).result(timeout)
    }

    fn prepare<C: Command>(
        &self,
        command: Arc<C>,
        input: C::Input,
        completer: Completer<C::Output>,
    ) -> (Execution<C>, Admission) {
        let submitted = Instant::now();
        let group = self.inner.registry.get_or_create(command.group_key());
        let deadline = group.config().run_timeout.map(|timeout| submitted + timeout);
        let admission = self.admit(&group, &completer);

        let execution = Execution {
            engine: Arc::clone(&self.inner),
            group,
            command,
            input,
            completer,
            grant: None,
            submitted,
            deadline,
        };
        (execution, admission)
    }

    fn admit<T>(&self, group: &CommandGroup, completer: &Completer<T>) -> Admission {
        let grant = match group.breaker().try_acquire() {
            Ok(grant) => grant,
            Err(reason) => {
                completer.set_primary_outcome(Outcome::ShortCircuited);
                return Admission::Rejected(reason);
            }
        };

        let reason = match group.bulkhead().try_enter() {
            Ok(ticket) => return Admission::Granted { ticket, grant },
            Err(BulkheadError::Full) => RejectionReason::BulkheadFull,
            Err(BulkheadError::Shutdown) => RejectionReason::PoolShutdown,
            Err(BulkheadError::Execution(never)) => match never {},
        };

        debug!(
            group = group.key(),
            execution_id = %completer.id(),
            reason = %reason,
            "Command rejected by bulkhead"
        );
        grant.record(Outcome::Rejected);
        completer.set_primary_outcome(Outcome::Rejected);
        self.inner.events.emit(CommandEvent::PoolRejected {
            group: group.key().to_string(),
            at: Utc::now(),
        });
        Admission::Rejected(reason)
    }

    /// Look up a group without creating it.
    pub fn group(&self, key: &str) -> Option<Arc<CommandGroup>> {
        self.inner.registry.get(key)
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn breaker_state(&self, key: &str) -> Option<CircuitState> {
        self.group(key).map(|group| group.breaker().state())
    }

    pub fn metrics_snapshot(&self, key: &str) -> Option<WindowSnapshot> {
        self.group(key).map(|group| group.metrics().snapshot())
    }

    pub fn pool_stats(&self, key: &str) -> Option<BulkheadStats> {
        self.group(key).map(|group| group.bulkhead().stats())
    }

    pub fn group_snapshot(&self, key: &str) -> Option<GroupSnapshot> {
        self.group(key).map(|group| group.snapshot())
    }

    pub fn snapshots(&self) -> Vec<GroupSnapshot> {
        self.inner.registry.snapshots()
    }

    /// Stop admitting work to every group.
    ///
    /// Queued commands are rejected through their fallbacks; running ones
    /// finish normally.
    pub fn shutdown(&self) {
        self.inner.registry.shutdown_all();
    }
}

impl std::fmt::Debug for CommandEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEngine")
            .field("registry", &self.inner.registry)
            .field("events", &self.inner.events)
            .finish()
    }
}

/// One submission, driven to a terminal state by `run`.
struct Execution<C: Command> {
    engine: Arc<EngineInner>,
    group: Arc<CommandGroup>,
    command: Arc<C>,
    input: C::Input,
    completer: Completer<C::Output>,
    /// Breaker permission, until an outcome is recorded against it.
    grant: Option<BreakerGrant>,
    submitted: Instant,
    deadline: Option<Instant>,
}

impl<C: Command> Execution<C> {
    async fn run(mut self, admission: Admission) {
        let ticket = match admission {
            Admission::Granted { ticket, grant } => {
                self.grant = Some(grant);
                ticket
            }
            Admission::Rejected(reason) => {
                let outcome = match reason {
                    RejectionReason::CircuitOpen | RejectionReason::HalfOpenTrialInFlight => {
                        Outcome::ShortCircuited
                    }
                    RejectionReason::BulkheadFull | RejectionReason::PoolShutdown => {
                        Outcome::Rejected
                    }
                };
                self.emit_executed(outcome);
                return self.fallback(CommandError::Rejected(reason)).await;
            }
        };

        let token = self.completer.token().clone();
        let queued = tokio::select! {
            biased;
            _ = token.cancelled() => Queued::Cancelled,
            _ = deadline_reached(self.deadline) => Queued::TimedOut,
            acquired = ticket.acquire() => match acquired {
                Ok(permit) => Queued::Ready(permit),
                Err(_) => Queued::Shutdown,
            },
        };

        let permit = match queued {
            Queued::Ready(permit) => permit,
            Queued::Cancelled => return self.finish_cancelled().await,
            Queued::TimedOut => {
                debug!(group = self.group.key(), "Command timed out while queued");
                return self.finish_timed_out().await;
            }
            Queued::Shutdown => {
                self.record(Outcome::Rejected);
                return self
                    .fallback(CommandError::Rejected(RejectionReason::PoolShutdown))
                    .await;
            }
        };

        if !self.completer.start() {
            drop(permit);
            return self.finish_cancelled().await;
        }

        let ctx = ExecutionContext::new(
            self.completer.id(),
            self.group.shared_key(),
            self.deadline,
            token.child_token(),
        );

        let step = match self.group.config().isolation {
            IsolationStrategy::Pooled => {
                let command = Arc::clone(&self.command);
                let input = self.input.clone();
                let worker_ctx = ctx.clone();
                let mut worker = self.engine.handle.spawn(async move {
                    let _permit = permit;
                    command.run(input, &worker_ctx).await
                });

                tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Cancelled,
                    _ = deadline_reached(self.deadline) => Step::TimedOut,
                    joined = &mut worker => Step::Done(joined.unwrap_or_else(|e| {
                        Err(Box::new(CommandPanicked(e.to_string())) as BoxError)
                    })),
                }
            }
            IsolationStrategy::Inline => {
                let _permit = permit;
                let run = self.command.run(self.input.clone(), &ctx);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => Step::Cancelled,
                    _ = deadline_reached(self.deadline) => Step::TimedOut,
                    result = run => Step::Done(result),
                }
            }
        };

        match step {
            Step::Done(Ok(value)) => {
                self.record(Outcome::Success);
                self.cleanup().await;
                self.completer.succeed(value);
            }
            Step::Done(Err(e)) => {
                debug!(
                    group = self.group.key(),
                    execution_id = %self.completer.id(),
                    error = %e,
                    "Command failed"
                );
                self.record(Outcome::Failure);
                self.fallback(CommandError::execution(e)).await;
            }
            Step::TimedOut => {
                ctx.cancel();
                self.finish_timed_out().await;
            }
            Step::Cancelled => {
                ctx.cancel();
                self.finish_cancelled().await;
            }
        }
    }

    fn record(&mut self, outcome: Outcome) {
        match self.grant.take() {
            Some(grant) => grant.record(outcome),
            None => self.group.breaker().record(outcome),
        }
        self.completer.set_primary_outcome(outcome);
        self.emit_executed(outcome);
    }

    fn emit_executed(&self, outcome: Outcome) {
        self.engine.events.emit(CommandEvent::Executed {
            group: self.group.key().to_string(),
            execution_id: self.completer.id(),
            outcome,
            latency: self.submitted.elapsed(),
            at: Utc::now(),
        });
    }

    async fn finish_cancelled(&mut self) {
        debug!(
            group = self.group.key(),
            execution_id = %self.completer.id(),
            "Command execution stopped by cancellation"
        );
        self.record(Outcome::Cancelled);
        self.cleanup().await;
    }

    async fn finish_timed_out(&mut self) {
        let timeout = self.group.config().run_timeout.unwrap_or_default();
        warn!(
            group = self.group.key(),
            execution_id = %self.completer.id(),
            timeout = ?timeout,
            "Command timed out"
        );
        self.record(Outcome::Timeout);
        self.fallback(CommandError::Timeout(timeout)).await;
    }

    async fn fallback(&self, cause: CommandError) {
        if self.completer.is_cancelled() {
            return self.cleanup().await;
        }

        let Some(slot) = self.group.try_fallback_slot() else {
            debug!(group = self.group.key(), "Fallback concurrency limit reached");
            self.fallback_finished(false);
            self.cleanup().await;
            self.completer
                .fail(CommandError::fallback_failed(cause, Box::new(FallbackRejected)));
            return;
        };

        let result = self.command.fallback(self.input.clone(), &cause).await;
        drop(slot);

        match result {
            Ok(value) => {
                self.fallback_finished(true);
                self.cleanup().await;
                self.completer.succeed_with_fallback(value);
            }
            Err(e) => {
                debug!(
                    group = self.group.key(),
                    execution_id = %self.completer.id(),
                    cause = %cause,
                    error = %e,
                    "Fallback failed"
                );
                self.fallback_finished(false);
                self.cleanup().await;
                self.completer.fail(CommandError::fallback_failed(cause, e));
            }
        }
    }

    async fn cleanup(&self) {
        if let Err(e) = self.command.cleanup(self.input.clone()).await {
            warn!(
                group = self.group.key(),
                execution_id = %self.completer.id(),
                error = %e,
                "Command cleanup failed"
            );
        }
    }

    fn fallback_finished(&self, succeeded: bool) {
        let outcome = if succeeded {
            Outcome::FallbackSuccess
        } else {
            Outcome::FallbackFailure
        };
        self.group.metrics().record(outcome);
        self.engine.events.emit(CommandEvent::Fallback {
            group: self.group.key().to_string(),
            execution_id: self.completer.id(),
            succeeded,
            at: Utc::now(),
        });
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
