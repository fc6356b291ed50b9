//! Result handle returned by [`CommandEngine::submit`](crate::CommandEngine::submit).
//!
//! A [`CommandFuture`] moves forward only:
//!
//! ```text
//! Pending ──▶ Running ──▶ Succeeded | Failed | TimedOut | Cancelled
//!    └──────────────────▶ Cancelled
//! ```
//!
//! The engine owns the single [`Completer`] for each future; the first
//! terminal write wins and every later one is ignored. Readers may block a
//! thread ([`CommandFuture::result`], [`CommandFuture::wait`]) or await
//! ([`CommandFuture::result_async`]).

use crate::error::{CommandError, CommandPanicked};
use crate::metrics::Outcome;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle state of a [`CommandFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl FutureState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for FutureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

struct Slot<T> {
    state: FutureState,
    value: Option<T>,
    error: Option<CommandError>,
    from_fallback: bool,
    primary_outcome: Option<Outcome>,
}

struct Shared<T> {
    id: Uuid,
    group: String,
    slot: Mutex<Slot<T>>,
    terminal: Condvar,
    notify: Notify,
    token: CancellationToken,
}

impl<T> Shared<T> {
    /// Publish a terminal state. Returns false if one was already set.
    fn finish(&self, state: FutureState, value: Option<T>, error: Option<CommandError>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = state;
            slot.value = value;
            slot.error = error;
        }

        self.terminal.notify_all();
        self.notify.notify_waiters();
        true
    }
}

/// Create a linked future and completer.
pub(crate) fn channel<T>(group: impl Into<String>) -> (CommandFuture<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        id: Uuid::new_v4(),
        group: group.into(),
        slot: Mutex::new(Slot {
            state: FutureState::Pending,
            value: None,
            error: None,
            from_fallback: false,
            primary_outcome: None,
        }),
        terminal: Condvar::new(),
        notify: Notify::new(),
        token: CancellationToken::new(),
    });

    (
        CommandFuture {
            shared: Arc::clone(&shared),
        },
        Completer { shared },
    )
}

/// Handle to the eventual result of a submitted command.
///
/// Cloning the handle shares the same underlying result.
pub struct CommandFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CommandFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> CommandFuture<T> {
    /// Execution id, shared with the command's `ExecutionContext` and events.
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn group_key(&self) -> &str {
        &self.shared.group
    }

    pub fn state(&self) -> FutureState {
        self.shared.slot.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether the value was produced by the command's fallback.
    pub fn is_response_from_fallback(&self) -> bool {
        self.shared.slot.lock().from_fallback
    }

    /// Outcome recorded for the primary step, once known.
    pub fn primary_outcome(&self) -> Option<Outcome> {
        self.shared.slot.lock().primary_outcome
    }

    /// Block until a terminal state is reached or `timeout` elapses.
    ///
    /// Returns true if the future is terminal.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut slot = self.shared.slot.lock();
        self.shared
            .terminal
            .wait_while_for(&mut slot, |slot| !slot.state.is_terminal(), timeout);
        slot.state.is_terminal()
    }

    /// The stored error, if the future ended in one. Never blocks.
    pub fn exception(&self) -> Option<CommandError> {
        let slot = self.shared.slot.lock();
        if slot.state.is_terminal() {
            slot.error.clone()
        } else {
            None
        }
    }

    /// Request cancellation.
    ///
    /// Returns false if the future was already terminal, in which case
    /// nothing changes. Otherwise the future becomes `Cancelled` and the
    /// running command's context is signalled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let cancelled = self.shared.finish(
            FutureState::Cancelled,
            None,
            Some(CommandError::CancellationRequested(reason.clone())),
        );

        if cancelled {
            debug!(
                group = %self.shared.group,
                execution_id = %self.shared.id,
                reason = %reason,
                "Command cancelled"
            );
            self.shared.token.cancel();
        }
        cancelled
    }
}

impl<T: Clone> CommandFuture<T> {
    /// Block until terminal, or until `timeout` elapses.
    ///
    /// A stored failure is returned as `Err`. Running out of time returns
    /// [`CommandError::WaitElapsed`] and leaves the future untouched.
    /// Do not call this from inside an async task; use
    /// [`result_async`](Self::result_async) instead.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T, CommandError> {
        let mut slot = self.shared.slot.lock();
        match timeout {
            Some(timeout) => {
                self.shared
                    .terminal
                    .wait_while_for(&mut slot, |slot| !slot.state.is_terminal(), timeout);
                if !slot.state.is_terminal() {
                    return Err(CommandError::WaitElapsed(timeout));
                }
            }
            None => self
                .shared
                .terminal
                .wait_while(&mut slot, |slot| !slot.state.is_terminal()),
        }

        read_terminal(&slot)
    }

    /// Await a terminal state without blocking a thread.
    pub async fn result_async(&self) -> Result<T, CommandError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_result() {
                return result;
            }
            notified.await;
        }
    }

    /// The result if the future is already terminal.
    pub fn try_result(&self) -> Option<Result<T, CommandError>> {
        let slot = self.shared.slot.lock();
        slot.state.is_terminal().then(|| read_terminal(&slot))
    }
}

fn read_terminal<T: Clone>(slot: &Slot<T>) -> Result<T, CommandError> {
    match (&slot.value, &slot.error) {
        (Some(value), _) => Ok(value.clone()),
        (None, Some(error)) => Err(error.clone()),
        (None, None) => Err(CommandError::execution(Box::new(CommandPanicked(
            "terminal state without a result".to_string(),
        )))),
    }
}

impl<T> std::fmt::Debug for CommandFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandFuture")
            .field("id", &self.shared.id)
            .field("group", &self.shared.group)
            .field("state", &self.state())
            .finish()
    }
}

/// Engine-side writer of a [`CommandFuture`].
pub(crate) struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Completer<T> {
    pub(crate) fn id(&self) -> Uuid {
        self.shared.id
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.slot.lock().state == FutureState::Cancelled
    }

    /// Move `Pending` to `Running`. False if the future was cancelled first.
    pub(crate) fn start(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.state != FutureState::Pending {
            return false;
        }
        slot.state = FutureState::Running;
        true
    }

    pub(crate) fn set_primary_outcome(&self, outcome: Outcome) {
        let mut slot = self.shared.slot.lock();
        if !slot.state.is_terminal() {
            slot.primary_outcome = Some(outcome);
        }
    }

    /// Resolve with a value from the primary step.
    pub(crate) fn succeed(&self, value: T) -> bool {
        self.shared
            .finish(FutureState::Succeeded, Some(value), None)
    }

    /// Resolve with a value produced by the fallback.
    pub(crate) fn succeed_with_fallback(&self, value: T) -> bool {
        {
            let mut slot = self.shared.slot.lock();
            if slot.state.is_terminal() {
                return false;
            }
            slot.from_fallback = true;
        }
        self.shared
            .finish(FutureState::Succeeded, Some(value), None)
    }

    /// Resolve with a failure; timeouts map to `TimedOut`.
    pub(crate) fn fail(&self, error: CommandError) -> bool {
        let state = if error.is_cancellation() {
            FutureState::Cancelled
        } else if error.is_timeout() {
            FutureState::TimedOut
        } else {
            FutureState::Failed
        };
        self.shared.finish(state, None, Some(error))
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.shared.finish(
            FutureState::Failed,
            None,
            Some(CommandError::execution(Box::new(CommandPanicked(
                "execution abandoned before completion".to_string(),
            )))),
        ) {
            debug!(
                group = %self.shared.group,
                execution_id = %self.shared.id,
                "Command abandoned without a result"
            );
        }
    }
}
