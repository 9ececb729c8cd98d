//! Exponential backoff retries.
//!
//! [`BackoffCfg`] is the hot-reloadable configuration; [`ExponentialPolicy`]
//! is the policy it builds. Consumers only depend on the [`BackoffPolicy`]
//! trait.

use std::{future::Future, time::Duration};

use backoff::{ExponentialBackoff, backoff::Backoff, exponential::ExponentialBackoffBuilder};
use serde::Deserialize;

use crate::config::Reloadable;

/// Retries an operation until it succeeds or the policy gives up.
pub trait BackoffPolicy: Send + Sync {
    /// Runs `operation` until it succeeds, calling `notify` with the error and
    /// the upcoming wait before every retry. Returns the last error once the
    /// policy is exhausted.
    fn retry_notify<T, E, F, Fut, N>(
        &self,
        operation: F,
        notify: N,
    ) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        N: FnMut(&E, Duration) + Send;

    fn retry<T, E, F, Fut>(&self, operation: F) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
    {
        self.retry_notify(operation, |_: &E, _: Duration| {})
    }
}

/// Jittered exponential backoff with an optional cap on the number of retries.
#[derive(Clone, Debug)]
pub struct ExponentialPolicy {
    backoff: ExponentialBackoff,
    max_retries: Option<u64>,
}

impl Default for ExponentialPolicy {
    fn default() -> Self {
        Self::new(ExponentialBackoff::default(), None)
    }
}

impl ExponentialPolicy {
    pub fn new(backoff: ExponentialBackoff, max_retries: Option<u64>) -> Self {
        Self {
            backoff,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> Option<u64> {
        self.max_retries
    }

    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Short intervals for tests.
    #[cfg(test)]
    pub(crate) fn for_testing(max_retries: Option<u64>) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(1))
            .with_multiplier(1.1)
            .with_max_interval(Duration::from_millis(5))
            .with_max_elapsed_time(Some(Duration::from_millis(500)))
            .build();
        Self::new(backoff, max_retries)
    }
}

impl BackoffPolicy for ExponentialPolicy {
    fn retry_notify<T, E, F, Fut, N>(
        &self,
        mut operation: F,
        mut notify: N,
    ) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        N: FnMut(&E, Duration) + Send,
    {
        // Every run starts from a fresh copy so concurrent retries never share
        // interval or elapsed-time state.
        let mut backoff = self.backoff.clone();
        backoff.reset();
        let max_retries = self.max_retries;
        let mut attempt: u64 = 0;

        backoff::future::retry_notify(
            backoff,
            move || {
                attempt += 1;
                let last_attempt = max_retries.is_some_and(|max| attempt > max);
                let fut = operation();
                async move {
                    fut.await.map_err(|err| {
                        if last_attempt {
                            backoff::Error::permanent(err)
                        } else {
                            backoff::Error::transient(err)
                        }
                    })
                }
            },
            move |err: E, wait: Duration| notify(&err, wait),
        )
    }
}

/// Backoff configuration. Zero values keep the `backoff` crate defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackoffCfg {
    pub initial_interval_ms: u64,
    pub randomization_factor: f64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_elapsed_time_ms: u64,
    pub max_retries: u64,
    #[serde(skip)]
    policy: ExponentialPolicy,
}

impl BackoffCfg {
    pub fn build_policy(&self) -> ExponentialPolicy {
        let defaults = ExponentialBackoff::default();
        let mut builder = ExponentialBackoffBuilder::new();
        builder
            .with_initial_interval(non_zero_ms(self.initial_interval_ms, defaults.initial_interval))
            .with_randomization_factor(non_zero(
                self.randomization_factor,
                defaults.randomization_factor,
            ))
            .with_multiplier(non_zero(self.multiplier, defaults.multiplier))
            .with_max_interval(non_zero_ms(self.max_interval_ms, defaults.max_interval))
            .with_max_elapsed_time(match self.max_elapsed_time_ms {
                0 => defaults.max_elapsed_time,
                ms => Some(Duration::from_millis(ms)),
            });

        let max_retries = (self.max_retries != 0).then_some(self.max_retries);
        ExponentialPolicy::new(builder.build(), max_retries)
    }

    /// The policy built by the last update.
    pub fn policy(&self) -> &ExponentialPolicy {
        &self.policy
    }
}

impl Reloadable for BackoffCfg {
    fn on_update(_old: Option<&Self>, new: &mut Self) {
        new.policy = new.build_policy();
    }
}

impl BackoffPolicy for BackoffCfg {
    fn retry_notify<T, E, F, Fut, N>(
        &self,
        operation: F,
        notify: N,
    ) -> impl Future<Output = Result<T, E>> + Send
    where
        T: Send,
        E: Send,
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send,
        N: FnMut(&E, Duration) + Send,
    {
        self.policy.retry_notify(operation, notify)
    }
}

fn non_zero_ms(ms: u64, default: Duration) -> Duration {
    if ms == 0 {
        default
    } else {
        Duration::from_millis(ms)
    }
}

fn non_zero(value: f64, default: f64) -> f64 {
    if value == 0.0 { default } else { value }
}
