//! Cancellation scopes bounding a task's reservation and execution.
//!
//! The reservation scope holds the CPU/RAM reservation. The execution scope
//! is derived from it and additionally expires after the task's maximum
//! execution time. Cancelling the reservation ends both.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an execution scope ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeEnd {
    /// The scope, or its parent, was cancelled.
    Canceled,
    /// The deadline passed first.
    Timeout,
}

/// Execution scope: a child cancellation token plus a deadline.
#[derive(Debug, Clone)]
pub struct ExecScope {
    token: CancellationToken,
    deadline: Instant,
}

impl ExecScope {
    /// Derive an execution scope from `parent` expiring after `timeout`.
    pub fn new(parent: &CancellationToken, timeout: Duration) -> Self {
        Self {
            token: parent.child_token(),
            deadline: Instant::now() + timeout,
        }
    }

    /// Cancellation token of this scope.
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deadline of this scope.
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Cancel this scope only.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolve when the scope is cancelled or times out.
    ///
    /// A cancellation observed at the deadline wins over the timeout.
    pub async fn ended(&self) -> ScopeEnd {
        tokio::select! {
            biased;
            () = self.token.cancelled() => ScopeEnd::Canceled,
            () = tokio::time::sleep_until(self.deadline) => {
                if self.token.is_cancelled() {
                    ScopeEnd::Canceled
                } else {
                    ScopeEnd::Timeout
                }
            }
        }
    }
}

/// Handle installed on a running task: ends both scopes.
#[derive(Debug, Clone)]
pub struct TaskCancel {
    reservation: CancellationToken,
    execution: CancellationToken,
}

impl TaskCancel {
    /// Bundle a reservation scope with its execution scope.
    pub fn new(reservation: &CancellationToken, execution: &ExecScope) -> Self {
        Self {
            reservation: reservation.clone(),
            execution: execution.token().clone(),
        }
    }

    /// End both scopes. Idempotent.
    pub fn cancel(&self) {
        self.execution.cancel();
        self.reservation.cancel();
    }

    /// Whether `cancel` already ran (or the reservation ended).
    pub fn is_cancelled(&self) -> bool {
        self.reservation.is_cancelled()
    }
}
