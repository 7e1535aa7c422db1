//! Call context: CancellationToken + optional deadline.
//! Every blocking wait in the translation path derives from one of these, so
//! cancelling a parent (or letting its deadline pass) unblocks all children.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::translate::TranslateError;

#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CallContext {
    /// Root context: no deadline, never cancelled unless asked to.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Root context bound to an externally owned token.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child context whose deadline is the earlier of the parent's and `now + timeout`.
    /// Cancelling the parent cancels the child; not the other way round.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Child context sharing the parent's deadline.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails fast if the context is already done.
    pub fn check(&self) -> Result<(), TranslateError> {
        if self.is_cancelled() {
            return Err(TranslateError::Cancelled);
        }
        if matches!(self.deadline, Some(d) if Instant::now() >= d) {
            return Err(TranslateError::Timeout);
        }
        Ok(())
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves when the token is cancelled or the deadline passes.
    pub async fn done(&self) -> TranslateError {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => TranslateError::Cancelled,
            _ = wait_deadline(self.deadline) => TranslateError::Timeout,
        }
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, TranslateError>
    where
        F: Future<Output = Result<T, TranslateError>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => out,
        }
    }

    /// Cancellable sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TranslateError> {
        if duration.is_zero() {
            return self.check();
        }
        self.run(async {
            sleep(duration).await;
            Ok(())
        })
        .await
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
