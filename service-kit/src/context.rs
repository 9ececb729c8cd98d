//! Request-scoped cancellation, deadline and correlation id.

use std::{sync::Arc, time::Duration};

use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Context handed to every externally facing operation.
///
/// Cloning is cheap and clones share the same cancellation token.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    request_id: Option<Arc<str>>,
}

impl RequestContext {
    /// A context that is never canceled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a child context: canceling the parent cancels the child, not the other way round.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            request_id: self.request_id.clone(),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The earlier of the existing and the given deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        ctx
    }

    pub fn with_request_id(&self, request_id: impl Into<Arc<str>>) -> Self {
        let mut ctx = self.clone();
        ctx.request_id = Some(request_id.into());
        ctx
    }

    /// Detaches from the caller's cancellation and deadline while keeping its values.
    ///
    /// Used for work that outlives the caller that triggered it, such as a batch
    /// shared by many callers.
    pub fn without_cancel(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            request_id: self.request_id.clone(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// `None` while the context is live, otherwise the reason it ended.
    pub fn err(&self) -> Option<Error> {
        if self.token.is_cancelled() {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Completes once the context is canceled or its deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => Error::Canceled,
                _ = sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                Error::Canceled
            }
        }
    }

    /// Runs `fut` unless the context ends first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = Result<T, Error>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            res = fut => res,
            err = self.done() => Err(err),
        }
    }
}
