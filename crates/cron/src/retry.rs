//! At-least-once work queue with bounded retries.
//!
//! Used to deliver notifications off the job's critical path: hooks `add`
//! messages and return, a pool of workers sends them and retries failures.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    tokio::sync::{mpsc, watch},
    tokio_util::sync::CancellationToken,
    tracing::{Instrument, Span, debug, warn},
};

#[cfg(feature = "metrics")]
use jobkit_metrics::{counter, labels, retry as retry_metrics};

use crate::{Error, Result, task::spawn_catching};

/// Capacity of the shared intake channel.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// The work performed for each item.
pub type RetryAction<T> =
    Arc<dyn Fn(T) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync>;

/// How long to wait before retrying an item that just failed.
pub type WaitProvider<T> = Arc<dyn Fn(&RetryWorkItem<T>) -> Duration + Send + Sync>;

/// An item in flight.
#[derive(Debug)]
pub struct RetryWorkItem<T> {
    pub payload: T,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Span of the caller that added the item; attempts run inside it.
    pub span: Span,
}

/// The same wait after every failure.
pub fn constant_wait<T>(wait: Duration) -> WaitProvider<T> {
    Arc::new(move |_| wait)
}

/// `attempts * base`, so the wait grows with each failure.
pub fn linear_backoff<T>(base: Duration) -> WaitProvider<T> {
    Arc::new(move |item: &RetryWorkItem<T>| base.saturating_mul(item.attempts))
}

struct Shared<T> {
    name: String,
    action: RetryAction<T>,
    max_attempts: u32,
    wait: WaitProvider<T>,
    retry_tx: mpsc::UnboundedSender<RetryWorkItem<T>>,
    shutdown: CancellationToken,
}

struct Receivers<T> {
    work: mpsc::Receiver<RetryWorkItem<T>>,
    retry: mpsc::UnboundedReceiver<RetryWorkItem<T>>,
}

/// Worker-pool queue that retries failed items up to `max_attempts`.
///
/// Build it, spawn [`start`](Self::start), [`add`](Self::add) items, and
/// [`stop`](Self::stop) it once. A stopped queue cannot be restarted.
pub struct RetryQueue<T> {
    shared: Arc<Shared<T>>,
    parallelism: usize,
    work_tx: mpsc::Sender<RetryWorkItem<T>>,
    receivers: Mutex<Option<Receivers<T>>>,
    running: watch::Sender<bool>,
}

impl<T> RetryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, action: RetryAction<T>) -> Self {
        let (work_tx, work_rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (running, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                action,
                max_attempts: 0,
                wait: constant_wait(Duration::ZERO),
                retry_tx,
                shutdown: CancellationToken::new(),
            }),
            parallelism: std::thread::available_parallelism().map_or(1, |n| n.get()),
            work_tx,
            receivers: Mutex::new(Some(Receivers {
                work: work_rx,
                retry: retry_rx,
            })),
            running,
        }
    }

    /// Build a queue from a closure returning a future.
    pub fn from_fn<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::new(name, Arc::new(move |item| Box::pin(action(item))))
    }

    /// Number of workers; at least one.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Attempts before an item is dropped; `0` retries forever.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.shared_mut(|s| s.max_attempts = max_attempts);
        self
    }

    #[must_use]
    pub fn with_retry_wait(self, wait: Duration) -> Self {
        self.with_wait_provider(constant_wait(wait))
    }

    #[must_use]
    pub fn with_retry_backoff(self, base: Duration) -> Self {
        self.with_wait_provider(linear_backoff(base))
    }

    #[must_use]
    pub fn with_wait_provider(mut self, wait: WaitProvider<T>) -> Self {
        self.shared_mut(|s| s.wait = wait);
        self
    }

    /// Resize the intake channel. Only meaningful before `start`.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        let (work_tx, work_rx) = mpsc::channel(capacity.max(1));
        self.work_tx = work_tx;
        let mut receivers = self.receivers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(receivers) = receivers.as_mut() {
            receivers.work = work_rx;
        }
        drop(receivers);
        self
    }

    fn shared_mut(&mut self, f: impl FnOnce(&mut Shared<T>)) {
        // Builders run before the queue is shared, so this is the only Arc.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            f(shared);
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Enqueue `payload` with zero attempts. Waits while the queue is full.
    pub async fn add(&self, payload: T) -> Result<()> {
        let item = RetryWorkItem {
            payload,
            attempts: 0,
            span: Span::current(),
        };
        self.work_tx
            .send(item)
            .await
            .map_err(|_| Error::message(format!("retry queue {} is stopped", self.shared.name)))?;
        #[cfg(feature = "metrics")]
        counter!(retry_metrics::ITEMS_ADDED_TOTAL, labels::CHANNEL => self.shared.name.clone())
            .increment(1);
        Ok(())
    }

    /// Run the workers and the dispatch loop until [`stop`](Self::stop).
    pub async fn start(&self) -> Result<()> {
        let Some(mut receivers) = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return Err(Error::message(format!(
                "retry queue {} already started",
                self.shared.name
            )));
        };
        if self.shared.shutdown.is_cancelled() {
            return Ok(());
        }
        self.running.send_replace(true);
        debug!(queue = %self.shared.name, workers = self.parallelism, "retry queue started");

        let mut workers = Vec::with_capacity(self.parallelism);
        let mut handles = Vec::with_capacity(self.parallelism);
        for _ in 0..self.parallelism {
            let (tx, rx) = mpsc::channel(1);
            workers.push(tx);
            handles.push(tokio::spawn(work(Arc::clone(&self.shared), rx)));
        }

        let shutdown = self.shared.shutdown.clone();
        let mut next = 0;
        loop {
            let item = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(item) = receivers.retry.recv() => item,
                Some(item) = receivers.work.recv() => item,
                else => break,
            };
            tokio::select! {
                sent = workers[next].send(item) => {
                    if sent.is_err() {
                        break;
                    }
                },
                () = shutdown.cancelled() => break,
            }
            next = (next + 1) % workers.len();
        }

        // Closing the worker channels lets each worker finish its current item.
        drop(workers);
        for handle in handles {
            let _ = handle.await;
        }
        self.running.send_replace(false);
        debug!(queue = %self.shared.name, "retry queue stopped");
        Ok(())
    }

    /// Signal shutdown and wait for in-flight items to finish.
    ///
    /// Items still waiting in the channel are discarded.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let mut rx = self.running.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }
}

async fn work<T>(shared: Arc<Shared<T>>, mut rx: mpsc::Receiver<RetryWorkItem<T>>)
where
    T: Clone + Send + Sync + 'static,
{
    while let Some(mut item) = rx.recv().await {
        let span = item.span.clone();
        let outcome = spawn_catching((shared.action)(item.payload.clone()).instrument(span)).await;
        let err = match outcome {
            Ok(Ok(())) => {
                #[cfg(feature = "metrics")]
                counter!(
                    retry_metrics::ATTEMPTS_TOTAL,
                    labels::CHANNEL => shared.name.clone(),
                    labels::OUTCOME => "success"
                )
                .increment(1);
                continue;
            },
            Ok(Err(err)) => err.to_string(),
            Err(panic) => panic,
        };

        #[cfg(feature = "metrics")]
        counter!(
            retry_metrics::ATTEMPTS_TOTAL,
            labels::CHANNEL => shared.name.clone(),
            labels::OUTCOME => "failure"
        )
        .increment(1);

        item.attempts += 1;
        if shared.max_attempts > 0 && item.attempts >= shared.max_attempts {
            warn!(
                parent: &item.span,
                queue = %shared.name,
                attempts = item.attempts,
                error = %err,
                "dropping work item after final attempt"
            );
            #[cfg(feature = "metrics")]
            counter!(retry_metrics::ITEMS_DROPPED_TOTAL, labels::CHANNEL => shared.name.clone())
                .increment(1);
            continue;
        }

        debug!(
            parent: &item.span,
            queue = %shared.name,
            attempts = item.attempts,
            error = %err,
            "work item failed, retrying"
        );
        let wait = (shared.wait)(&item);
        if !wait.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(wait) => {},
                () = shared.shutdown.cancelled() => continue,
            }
        }
        if shared.shutdown.is_cancelled() {
            continue;
        }
        let _ = shared.retry_tx.send(item);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::atomic::{AtomicBool, AtomicU32, Ordering},
    };

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn spawn_queue<T: Clone + Send + Sync + 'static>(
        queue: RetryQueue<T>,
    ) -> (Arc<RetryQueue<T>>, tokio::task::JoinHandle<Result<()>>) {
        let queue = Arc::new(queue);
        let runner = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.start().await })
        };
        (queue, runner)
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let queue = RetryQueue::from_fn("always-fails", move |_: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("endpoint down")
            }
        })
        .with_parallelism(2)
        .with_max_attempts(5);
        let (queue, runner) = spawn_queue(queue);

        queue.add(1).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) >= 5).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        queue.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn succeeds_before_exhaustion() {
        let calls = Arc::new(AtomicU32::new(0));
        let delivered = Arc::new(AtomicBool::new(false));
        let (counter, done) = (Arc::clone(&calls), Arc::clone(&delivered));
        let queue = RetryQueue::from_fn("flaky", move |_: &'static str| {
            let (counter, done) = (Arc::clone(&counter), Arc::clone(&done));
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 < 5 {
                    anyhow::bail!("try again");
                }
                done.store(true, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_max_attempts(5);
        let (queue, runner) = spawn_queue(queue);

        queue.add("hello").await.unwrap();
        wait_until(|| delivered.load(Ordering::SeqCst)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        queue.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn panics_count_as_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let queue = RetryQueue::from_fn("panicky", move |_: u8| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("formatter bug");
                }
                Ok(())
            }
        })
        .with_max_attempts(3);
        let (queue, runner) = spawn_queue(queue);

        queue.add(0).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        queue.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn workers_run_in_parallel() {
        let active = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let queue = RetryQueue::from_fn("parallel", move |_: u32| {
            let (active, peak) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_parallelism(4);
        let (queue, runner) = spawn_queue(queue);

        for i in 0..4 {
            queue.add(i).await.unwrap();
        }
        wait_until(|| peak.load(Ordering::SeqCst) == 4).await;

        queue.stop().await;
        runner.await.unwrap().unwrap();
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_item() {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let queue = RetryQueue::from_fn("slow", move |_: u32| {
            let (started, finished) = (Arc::clone(&s), Arc::clone(&f));
            async move {
                started.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        let (queue, runner) = spawn_queue(queue);

        queue.add(1).await.unwrap();
        wait_until(|| started.load(Ordering::SeqCst)).await;
        queue.stop().await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!queue.is_running());
        runner.await.unwrap().unwrap();

        assert!(queue.add(2).await.is_err());
    }

    #[tokio::test]
    async fn backoff_wait_is_interrupted_by_stop() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let queue = RetryQueue::from_fn("backoff", move |_: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("nope")
            }
        })
        .with_retry_backoff(Duration::from_secs(3600));
        let (queue, runner) = spawn_queue(queue);

        queue.add(1).await.unwrap();
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::timeout(Duration::from_secs(2), queue.stop())
            .await
            .expect("stop should interrupt the backoff");
        runner.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_providers() {
        let item = RetryWorkItem {
            payload: (),
            attempts: 3,
            span: Span::none(),
        };
        assert_eq!(
            constant_wait::<()>(Duration::from_secs(2))(&item),
            Duration::from_secs(2)
        );
        assert_eq!(
            linear_backoff::<()>(Duration::from_millis(500))(&item),
            Duration::from_millis(1500)
        );
    }

    #[tokio::test]
    async fn second_start_fails() {
        let queue = Arc::new(RetryQueue::from_fn("once", |_: u8| async { Ok(()) }));
        let runner = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(queue.start().await.is_err());
        queue.stop().await;
        runner.await.unwrap().unwrap();
    }
}
