use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;

/// Bounds how many pages one run validates at the same time.
///
/// Unrelated to [`super::ConcurrencyGovernor`]: it shares no counters and
/// never refuses, it only makes callers wait.
#[derive(Clone)]
pub struct PageGate {
    semaphore: Arc<Semaphore>,
    width: usize,
}

impl PageGate {
    pub const DEFAULT_WIDTH: usize = 3;

    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run every future, at most `width` at a time, keeping input order.
    pub async fn run_all<T, F, Fut>(&self, items: Vec<T>, work: F) -> Vec<Fut::Output>
    where
        F: Fn(T) -> Fut,
        Fut: Future,
    {
        let tasks = items.into_iter().map(|item| {
            let semaphore = self.semaphore.clone();
            let fut = work(item);
            async move {
                // The semaphore is never closed, so acquire cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                fut.await
            }
        });
        join_all(tasks).await
    }
}

impl Default for PageGate {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WIDTH)
    }
}
