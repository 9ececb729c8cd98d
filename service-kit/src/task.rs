//! Single-assignment result slot shared between a waiting caller and the
//! machinery that eventually produces its result.

use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::{context::RequestContext, error::Error};

/// Waiting half, owned by the caller that submitted the work.
#[derive(Debug)]
pub struct Task<T> {
    ctx: RequestContext,
    rx: oneshot::Receiver<Result<T, Error>>,
}

/// Resolving half, handed to whoever produces the result.
#[derive(Debug)]
pub struct Resolver<T> {
    ctx: RequestContext,
    tx: Mutex<Option<oneshot::Sender<Result<T, Error>>>>,
}

impl<T> Task<T> {
    pub fn new(ctx: RequestContext) -> (Task<T>, Resolver<T>) {
        let (tx, rx) = oneshot::channel();
        let resolver = Resolver {
            ctx: ctx.clone(),
            tx: Mutex::new(Some(tx)),
        };
        (Task { ctx, rx }, resolver)
    }

    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    /// Waits for the resolution or for the caller's context to end.
    ///
    /// A resolution that is already available wins over an ended context.
    pub async fn result(self) -> Result<T, Error> {
        let Task { ctx, rx } = self;
        tokio::select! {
            biased;
            res = rx => res.unwrap_or(Err(Error::Abandoned)),
            err = ctx.done() => Err(err),
        }
    }
}

impl<T> Resolver<T> {
    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    /// Delivers the result. Only the first call has an effect; later calls return `false`.
    pub fn resolve(&self, result: Result<T, Error>) -> bool {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        match tx {
            Some(tx) => {
                // The caller may have stopped waiting; nothing to deliver to then.
                let _ = tx.send(result);
                true
            }
            None => {
                tracing::warn!("task resolved more than once, keeping the first result");
                false
            }
        }
    }

    /// True once the waiting half is gone, i.e. nobody will read the result.
    pub fn is_abandoned(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}
