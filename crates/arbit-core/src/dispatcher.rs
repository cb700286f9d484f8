//! Bounded job dispatcher for inference requests.
//!
//! The dispatcher brokers inference calls between HTTP handlers and the
//! provider adapters through a bounded FIFO queue drained by a fixed pool
//! of worker tasks:
//!
//! ```text
//! handler ──try_enqueue──▶ [bounded queue] ──▶ worker ──▶ provider
//!    ▲                                          │
//!    └───────────── reply (oneshot) ◀───────────┘
//! ```
//!
//! # Invariants
//!
//! - Exactly one [`InferenceResult`] is delivered per accepted job.
//! - `try_enqueue` never blocks; a full queue is reported as
//!   [`EnqueueError::QueueFull`] so callers can shed load.
//! - Jobs are picked up in FIFO order but may complete out of order; one
//!   slow provider call never blocks another worker.
//! - After [`Dispatcher::shutdown`] already-enqueued jobs still complete;
//!   new enqueues fail with [`EnqueueError::Closed`].
//!
//! Provider errors are reported back verbatim and never retried here; the
//! caller decides policy. Cancellation is observed at worker pickup and
//! inside the provider call via the job's [`CancellationToken`].

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::providers::{Provider, ProviderError, ProviderReply};

/// An inference request as submitted by a client. Immutable per request.
#[derive(Debug, Clone, Deserialize)]
pub struct InferenceRequest {
    /// The prompt to send to the provider.
    #[serde(default)]
    pub prompt: String,
    /// Requested model identifier; providers may substitute a default.
    #[serde(default)]
    pub model: String,
}

/// The single result delivered for an accepted job.
#[derive(Debug)]
pub struct InferenceResult {
    /// Provider reply, or the error reported verbatim.
    pub outcome: Result<ProviderReply, ProviderError>,
    /// Time the job spent waiting in the queue.
    pub queue_wait: Duration,
    /// Time the worker spent executing the provider call.
    pub exec_time: Duration,
}

/// One enqueued unit of work, owned by the dispatcher from enqueue until
/// its result is delivered.
#[derive(Debug)]
pub struct InferenceJob {
    /// The request to execute.
    pub request: InferenceRequest,
    /// Cancellation scope derived from the inbound request plus deadline.
    pub cancel: CancellationToken,
    /// Single-slot reply channel; the send never blocks a worker, and a
    /// dropped receiver (abandoned request) is ignored.
    pub reply: oneshot::Sender<InferenceResult>,
    /// When the job entered the queue.
    pub enqueued_at: Instant,
}

impl InferenceJob {
    /// Creates a job plus the receiving half of its reply channel.
    #[must_use]
    pub fn new(
        request: InferenceRequest,
        cancel: CancellationToken,
    ) -> (Self, oneshot::Receiver<InferenceResult>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                request,
                cancel,
                reply,
                enqueued_at: Instant::now(),
            },
            rx,
        )
    }
}

/// Queue occupancy observed at enqueue time, for backpressure reporting.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Jobs currently queued.
    pub len: usize,
    /// Queue capacity.
    pub cap: usize,
}

/// Why an enqueue was refused.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the caller should shed load.
    #[error("queue full")]
    QueueFull,
    /// The dispatcher is shutting down and no longer accepts jobs.
    #[error("dispatcher closed")]
    Closed,
}

/// Bounded job dispatcher: a FIFO queue drained by a fixed worker pool.
///
/// The dispatcher is shared behind an `Arc`; [`Dispatcher::shutdown`] takes
/// `&self` so the shutdown routine can close it while handlers still hold
/// the same handle.
pub struct Dispatcher {
    queue: RwLock<Option<mpsc::Sender<InferenceJob>>>,
    capacity: usize,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher with the given queue capacity and worker count
    /// and starts the workers.
    ///
    /// A `queue_size` of zero is bumped to one; `workers` may be zero, in
    /// which case enqueued jobs are never picked up (useful in tests that
    /// exercise backpressure).
    #[must_use]
    pub fn new(queue_size: usize, workers: usize, provider: Arc<dyn Provider>) -> Self {
        let capacity = queue_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers)
            .map(|id| {
                let rx = Arc::clone(&rx);
                let provider = Arc::clone(&provider);
                tokio::spawn(worker_loop(id, rx, provider))
            })
            .collect();

        Self {
            queue: RwLock::new(Some(tx)),
            capacity,
            workers: StdMutex::new(workers),
        }
    }

    /// Current queue occupancy.
    #[must_use]
    pub fn queue_stats(&self) -> QueueStats {
        let queue = self.queue.read().expect("lock poisoned");
        let len = queue
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity());
        QueueStats {
            len,
            cap: self.capacity,
        }
    }

    /// Enqueues a job without blocking.
    ///
    /// Returns the queue stats observed at enqueue time alongside the
    /// outcome so callers can report backpressure either way.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::QueueFull`] when the queue is at capacity,
    /// [`EnqueueError::Closed`] after shutdown has begun.
    pub fn try_enqueue(&self, job: InferenceJob) -> (QueueStats, Result<(), EnqueueError>) {
        let result = {
            let queue = self.queue.read().expect("lock poisoned");
            match queue.as_ref() {
                None => Err(EnqueueError::Closed),
                Some(tx) => match tx.try_send(job) {
                    Ok(()) => Ok(()),
                    Err(mpsc::error::TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
                    Err(mpsc::error::TrySendError::Closed(_)) => Err(EnqueueError::Closed),
                },
            }
        };
        (self.queue_stats(), result)
    }

    /// Stops accepting new jobs, drains the queue through the workers and
    /// returns once every worker has exited. Safe to call more than once.
    pub async fn shutdown(&self) {
        drop(self.queue.write().expect("lock poisoned").take());
        let workers = std::mem::take(&mut *self.workers.lock().expect("lock poisoned"));
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<InferenceJob>>>,
    provider: Arc<dyn Provider>,
) {
    loop {
        // Hold the lock only while waiting for the next job; processing
        // happens with the lock released so the pool drains in parallel.
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        let started_at = Instant::now();
        let queue_wait = started_at.duration_since(job.enqueued_at);

        // Respect cancellation before starting work.
        if job.cancel.is_cancelled() {
            let _ = job.reply.send(InferenceResult {
                outcome: Err(ProviderError::Cancelled),
                queue_wait,
                exec_time: Duration::ZERO,
            });
            continue;
        }

        let outcome = provider.complete(&job.request, &job.cancel).await;
        let exec_time = started_at.elapsed();

        if let Err(error) = &outcome {
            tracing::warn!(
                worker = id,
                model = %job.request.model,
                error = %error,
                "provider call failed"
            );
        }

        let _ = job.reply.send(InferenceResult {
            outcome,
            queue_wait,
            exec_time,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::providers::StubProvider;

    struct CountingProvider {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Provider for CountingProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn complete(
            &self,
            request: &InferenceRequest,
            _cancel: &CancellationToken,
        ) -> Result<ProviderReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ProviderReply {
                text: format!("hi {}", request.prompt),
                provider: "test".to_string(),
                token_usage: 7,
            })
        }
    }

    fn request(prompt: &str) -> InferenceRequest {
        InferenceRequest {
            prompt: prompt.to_string(),
            model: "stub".to_string(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_full_at_capacity() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(1)));
        let dispatcher = Dispatcher::new(1, 0, provider);

        let (job, _rx) = InferenceJob::new(request("a"), CancellationToken::new());
        let (stats, result) = dispatcher.try_enqueue(job);
        assert!(result.is_ok());
        assert_eq!(stats.len, 1);
        assert_eq!(stats.cap, 1);

        let (job, _rx) = InferenceJob::new(request("b"), CancellationToken::new());
        let (stats, result) = dispatcher.try_enqueue(job);
        assert!(matches!(result, Err(EnqueueError::QueueFull)));
        assert_eq!(stats.len, 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_enqueue_succeeds_below_capacity() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(1)));
        let dispatcher = Dispatcher::new(2, 0, provider);

        let (job, _rx1) = InferenceJob::new(request("a"), CancellationToken::new());
        assert!(dispatcher.try_enqueue(job).1.is_ok());

        // Capacity - 1 occupied: the next enqueue still succeeds.
        let (job, _rx2) = InferenceJob::new(request("b"), CancellationToken::new());
        assert!(dispatcher.try_enqueue(job).1.is_ok());

        let (job, _rx3) = InferenceJob::new(request("c"), CancellationToken::new());
        assert!(matches!(
            dispatcher.try_enqueue(job).1,
            Err(EnqueueError::QueueFull)
        ));

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_exactly_one_result_per_job() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(8, 2, Arc::clone(&provider) as Arc<dyn Provider>);

        let (job, rx) = InferenceJob::new(request("hello"), CancellationToken::new());
        let (_, result) = dispatcher.try_enqueue(job);
        assert!(result.is_ok());

        let result = rx.await.expect("one reply per accepted job");
        let reply = result.outcome.expect("provider succeeds");
        assert_eq!(reply.text, "hi hello");
        assert_eq!(reply.token_usage, 7);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_job_skips_provider() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(4, 1, Arc::clone(&provider) as Arc<dyn Provider>);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (job, rx) = InferenceJob::new(request("late"), cancel);
        assert!(dispatcher.try_enqueue(job).1.is_ok());

        let result = rx.await.expect("cancelled jobs still get a reply");
        assert!(matches!(result.outcome, Err(ProviderError::Cancelled)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_enqueued_jobs() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(5)));
        let dispatcher = Dispatcher::new(8, 2, provider);

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (job, rx) =
                InferenceJob::new(request(&format!("job-{i}")), CancellationToken::new());
            assert!(dispatcher.try_enqueue(job).1.is_ok());
            receivers.push(rx);
        }

        dispatcher.shutdown().await;

        for rx in receivers {
            let result = rx.await.expect("drained during shutdown");
            assert!(result.outcome.is_ok());
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_refused() {
        let provider = Arc::new(StubProvider::new(Duration::from_millis(1)));
        let dispatcher = Dispatcher::new(2, 1, provider);
        dispatcher.shutdown().await;

        let (job, _rx) = InferenceJob::new(request("too late"), CancellationToken::new());
        assert!(matches!(
            dispatcher.try_enqueue(job).1,
            Err(EnqueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_slow_job_does_not_block_fast_job() {
        struct PerPromptDelay;

        #[async_trait::async_trait]
        impl Provider for PerPromptDelay {
            fn name(&self) -> &'static str {
                "test"
            }

            async fn complete(
                &self,
                request: &InferenceRequest,
                _cancel: &CancellationToken,
            ) -> Result<ProviderReply, ProviderError> {
                let delay = if request.prompt == "slow" { 200 } else { 5 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(ProviderReply {
                    text: request.prompt.clone(),
                    provider: "test".to_string(),
                    token_usage: 0,
                })
            }
        }

        let dispatcher = Dispatcher::new(8, 2, Arc::new(PerPromptDelay));

        let (slow, slow_rx) = InferenceJob::new(request("slow"), CancellationToken::new());
        let (fast, fast_rx) = InferenceJob::new(request("fast"), CancellationToken::new());
        assert!(dispatcher.try_enqueue(slow).1.is_ok());
        assert!(dispatcher.try_enqueue(fast).1.is_ok());

        let first = tokio::select! {
            r = slow_rx => r.expect("slow reply").outcome.expect("ok").text,
            r = fast_rx => r.expect("fast reply").outcome.expect("ok").text,
        };
        assert_eq!(first, "fast");

        dispatcher.shutdown().await;
    }
}
