//! Concurrency-limited, retrying execution of many independent fetches.
//!
//! Results are yielded lazily in completion order. Queued items start in submission order as
//! soon as a slot frees up, and dropping the stream stops further items from being dequeued.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, sleep_until};

use crate::domain::errors::SourceError;
use crate::infra::config::Config;

/// Errors that can tell whether another attempt is worthwhile.
pub trait Retryable: fmt::Display {
    fn is_transient(&self) -> bool;
}

impl Retryable for SourceError {
    fn is_transient(&self) -> bool {
        SourceError::is_transient(self)
    }
}

/// Limits and retry policy for batch fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    pub max_concurrent: usize,
    pub retries: u32,
    pub retry_delay: Duration,
    pub min_start_interval: Option<Duration>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 6,
            retries: 2,
            retry_delay: Duration::from_millis(500),
            min_start_interval: None,
        }
    }
}

impl FetchConfig {
    pub fn from_config(config: &Config) -> Self {
        let fetch = &config.fetch;
        Self {
            max_concurrent: fetch.max_concurrent.max(1),
            retries: fetch.retries,
            retry_delay: Duration::from_millis(fetch.retry_delay_ms),
            min_start_interval: (fetch.min_start_interval_ms > 0)
                .then(|| Duration::from_millis(fetch.min_start_interval_ms)),
        }
    }
}

/// Executes fetch operations with at most `max_concurrent` in flight.
#[derive(Debug, Clone)]
pub struct BoundedFetcher {
    config: FetchConfig,
    last_start: Arc<Mutex<Option<Instant>>>,
}

impl Default for BoundedFetcher {
    fn default() -> Self {
        Self::new(FetchConfig::default())
    }
}

impl BoundedFetcher {
    pub fn new(mut config: FetchConfig) -> Self {
        config.max_concurrent = config.max_concurrent.max(1);
        Self {
            config,
            last_start: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Run `op` for every item and stream `(item, result)` pairs as operations finish.
    ///
    /// A failing item only affects its own result; siblings keep running.
    pub fn run<I, T, E, F, Fut>(
        &self,
        items: I,
        op: F,
    ) -> impl Stream<Item = (I::Item, Result<T, E>)> + use<I, T, E, F, Fut>
    where
        I: IntoIterator,
        I::Item: Clone,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let op = Arc::new(op);
        let limit = self.config.max_concurrent;
        let this = self.clone();

        stream::iter(items)
            .map(move |item| {
                let op = Arc::clone(&op);
                let this = this.clone();
                async move {
                    let result = this.attempt(&item, op.as_ref()).await;
                    (item, result)
                }
            })
            .buffer_unordered(limit)
    }

    /// Run everything to completion and collect the results in completion order.
    pub async fn run_all<I, T, E, F, Fut>(&self, items: I, op: F) -> Vec<(I::Item, Result<T, E>)>
    where
        I: IntoIterator,
        I::Item: Clone,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        self.run(items, op).collect().await
    }

    async fn attempt<Item, T, E, F, Fut>(&self, item: &Item, op: &F) -> Result<T, E>
    where
        Item: Clone,
        F: Fn(Item) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable,
    {
        let mut attempt = 0u32;
        loop {
            self.throttle().await;
            match op(item.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.retries => {
                    attempt += 1;
                    tracing::debug!(attempt, error = %err, "transient fetch failure; retrying");
                    sleep(self.config.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn throttle(&self) {
        let Some(interval) = self.config.min_start_interval else {
            return;
        };
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + interval).await;
        }
        *last = Some(Instant::now());
    }
}
