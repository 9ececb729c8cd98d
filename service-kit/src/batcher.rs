//! Time/count windowed batching.
//!
//! Items are collected into a window that closes when it holds `max_count`
//! items or when `max_wait` has passed since its first item, whichever comes
//! first. A closed window is handed to the processing callback on a spawned
//! task so submitters never wait on downstream I/O.

use std::{
    future::Future,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use metrics::histogram;
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::{
    error::{Error, Result},
    observability::metrics::BATCH_SIZE,
};

const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(10);
const DEFAULT_MAX_COUNT: usize = 100;

/// Window limits. Zero values fall back to the defaults.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct BatchConfig {
    #[serde(default, rename = "max_wait_ms", with = "duration_ms")]
    pub max_wait: Duration,
    #[serde(default)]
    pub max_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            max_count: DEFAULT_MAX_COUNT,
        }
    }
}

impl BatchConfig {
    pub fn new(max_wait: Duration, max_count: usize) -> Self {
        Self {
            max_wait,
            max_count,
        }
        .normalized()
    }

    fn normalized(self) -> Self {
        Self {
            max_wait: if self.max_wait.is_zero() {
                DEFAULT_MAX_WAIT
            } else {
                self.max_wait
            },
            max_count: if self.max_count == 0 {
                DEFAULT_MAX_COUNT
            } else {
                self.max_count
            },
        }
    }
}

type ProcessFn<T> = dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync;

/// Cheap to clone; clones feed the same windows.
pub struct Batcher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Batcher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T> {
    name: &'static str,
    config: BatchConfig,
    process: Box<ProcessFn<T>>,
    window: Mutex<Window<T>>,
}

struct Window<T> {
    items: Vec<T>,
    /// Bumped every time a window closes so a stale timer cannot flush a newer window.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl<T> Window<T> {
    fn close_window(&mut self) -> Vec<T> {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        mem::take(&mut self.items)
    }
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new<F, Fut>(name: &'static str, config: BatchConfig, process: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let config = config.normalized();
        Self {
            inner: Arc::new(Inner {
                name,
                config,
                process: Box::new(move |batch| Box::pin(process(batch))),
                window: Mutex::new(Window {
                    items: Vec::with_capacity(config.max_count),
                    generation: 0,
                    timer: None,
                    closed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> BatchConfig {
        self.inner.config
    }

    /// Adds an item to the open window, opening one if needed.
    ///
    /// Must be called within a Tokio runtime. Fails with [`Error::Closed`] once
    /// [`Batcher::close`] has been called.
    pub fn submit(&self, item: T) -> Result<()> {
        let mut window = self.inner.lock();
        if window.closed {
            return Err(Error::Closed);
        }
        window.items.push(item);

        if window.items.len() >= self.inner.config.max_count {
            let batch = window.close_window();
            drop(window);
            self.inner.dispatch(batch);
        } else if window.items.len() == 1 {
            let generation = window.generation;
            let inner = self.inner.clone();
            window.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.config.max_wait).await;
                inner.flush_expired(generation);
            }));
        }
        Ok(())
    }

    /// Stops accepting items and flushes the open window. Idempotent.
    pub fn close(&self) {
        let mut window = self.inner.lock();
        if window.closed {
            return;
        }
        window.closed = true;
        let batch = window.close_window();
        drop(window);
        tracing::debug!(batcher = self.inner.name, pending = batch.len(), "batcher closed");
        self.inner.dispatch(batch);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, Window<T>> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush_expired(&self, generation: u64) {
        let mut window = self.lock();
        if window.generation != generation {
            return;
        }
        // This runs on the timer task itself; detach instead of aborting it.
        window.timer.take();
        let batch = window.close_window();
        drop(window);
        self.dispatch(batch);
    }

    fn dispatch(&self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        histogram!(BATCH_SIZE, "batcher" => self.name).record(batch.len() as f64);
        tokio::spawn((self.process)(batch));
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
