use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between a caller and a running
/// computation. Cloning shares the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// What a batch loop should do before starting its next batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BudgetState {
    Continue,
    /// Deadline reached: stop and return what has been computed.
    Expired,
    /// Token fired: abort with an error.
    Cancelled,
}

/// Caller-settable limits for one optimizer or simulation run.
/// Checked between batches, never inside one.
#[derive(Clone, Debug, Default)]
pub struct RunBudget {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RunBudget {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.deadline = Some(Instant::now() + limit);
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn state(&self) -> BudgetState {
        if self.token.is_cancelled() {
            BudgetState::Cancelled
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            BudgetState::Expired
        } else {
            BudgetState::Continue
        }
    }
}
