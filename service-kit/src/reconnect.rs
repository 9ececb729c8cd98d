//! Self-healing client wrapper.
//!
//! [`Reconnectable`] keeps the current client instance behind an [`ArcSwap`]
//! and rebuilds it through a [`ClientFactory`] when an operation fails with an
//! error the factory recognizes as a broken connection. Refreshes are
//! single-flight and rate limited by a cooldown; the replaced instance is
//! released after a grace delay on a background task.
//!
//! Instances are reference counted, so an operation that is still running on
//! the old instance when the delay ends keeps it alive until it finishes.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use metrics::counter;
use tokio::time::Instant;

use crate::observability::metrics::CLIENT_REFRESH_TOTAL;

/// Builds client instances and decides which failures call for a new one.
pub trait ClientFactory: Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Label used in logs and metrics.
    fn name(&self) -> &str;

    fn connect(&self) -> Result<Self::Client, Self::Error>;

    fn should_refresh(&self, err: &Self::Error) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPolicy {
    /// Minimum time between two refresh attempts.
    pub cooldown: Duration,
    /// How long a replaced instance is kept before it is released.
    pub close_delay: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(10),
            close_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshState {
    Healthy,
    RefreshInProgress,
    Cooldown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    InProgress,
    Cooldown,
    Failed,
}

impl RefreshOutcome {
    fn as_str(self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::InProgress => "in_progress",
            RefreshOutcome::Cooldown => "cooldown",
            RefreshOutcome::Failed => "failed",
        }
    }
}

pub struct Reconnectable<F: ClientFactory> {
    factory: F,
    policy: RefreshPolicy,
    current: ArcSwap<F::Client>,
    last_refresh: Mutex<Option<Instant>>,
    refresh_in_progress: AtomicBool,
    generation: AtomicU64,
}

impl<F: ClientFactory> Reconnectable<F> {
    pub fn new(factory: F, policy: RefreshPolicy) -> Result<Self, F::Error> {
        let client = factory.connect()?;
        Ok(Self {
            factory,
            policy,
            current: ArcSwap::from_pointee(client),
            last_refresh: Mutex::new(None),
            refresh_in_progress: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    /// The instance new operations should use.
    pub fn current(&self) -> Arc<F::Client> {
        self.current.load_full()
    }

    /// Number of successful refreshes so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.policy
    }

    pub fn state(&self) -> RefreshState {
        if self.refresh_in_progress.load(Ordering::Acquire) {
            RefreshState::RefreshInProgress
        } else if !self.cooldown_elapsed() {
            RefreshState::Cooldown
        } else {
            RefreshState::Healthy
        }
    }

    /// Runs `op` against the current instance and refreshes it if the
    /// failure calls for it. The outcome of `op` is returned unchanged.
    pub async fn execute<T, Op, Fut>(&self, op: Op) -> Result<T, F::Error>
    where
        Op: FnOnce(Arc<F::Client>) -> Fut,
        Fut: Future<Output = Result<T, F::Error>>,
    {
        let result = op(self.current()).await;
        if let Err(err) = &result {
            self.observe(err);
        }
        result
    }

    /// Inspects an operation's error and requests a refresh when needed.
    pub fn observe(&self, err: &F::Error) -> Option<RefreshOutcome> {
        if !self.factory.should_refresh(err) {
            return None;
        }
        tracing::debug!(client = self.factory.name(), error = %err, "connection failure observed");
        Some(self.refresh())
    }

    /// Rebuilds the client unless another refresh is running or the cooldown
    /// has not elapsed yet.
    pub fn refresh(&self) -> RefreshOutcome {
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RefreshOutcome::InProgress;
        }

        let outcome = self.refresh_exclusive();
        self.refresh_in_progress.store(false, Ordering::Release);

        counter!(
            CLIENT_REFRESH_TOTAL,
            "client" => self.factory.name().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        outcome
    }

    fn refresh_exclusive(&self) -> RefreshOutcome {
        if !self.cooldown_elapsed() {
            return RefreshOutcome::Cooldown;
        }
        *self.last_refresh_slot() = Some(Instant::now());

        let client = match self.factory.connect() {
            Ok(client) => client,
            Err(err) => {
                tracing::error!(
                    client = self.factory.name(),
                    error = %err,
                    "failed to rebuild client, keeping the current one"
                );
                return RefreshOutcome::Failed;
            }
        };

        let old = self.current.swap(Arc::new(client));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            client = self.factory.name(),
            generation,
            "client refreshed after connection failure"
        );
        release_later(old, self.policy.close_delay, self.factory.name().to_string());
        RefreshOutcome::Refreshed
    }

    fn cooldown_elapsed(&self) -> bool {
        match *self.last_refresh_slot() {
            Some(last) => last.elapsed() >= self.policy.cooldown,
            None => true,
        }
    }

    fn last_refresh_slot(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drops `client` after `delay` on a background task, or right away when no
/// runtime is available.
pub(crate) fn release_later<C: Send + Sync + 'static>(client: Arc<C>, delay: Duration, name: String) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(delay).await;
                let still_used = Arc::strong_count(&client) > 1;
                drop(client);
                tracing::debug!(client = %name, still_used, "released replaced client");
            });
        }
        Err(_) => drop(client),
    }
}
