//! Bounded-concurrency retrying task executor
//!
//! Two shapes share one retry policy:
//!
//! - [`TaskExecutor::parallel`] / [`TaskExecutor::parallel_stream`] run a
//!   batch of items with at most `max_parallelism` operations in flight.
//! - [`TaskExecutor::execute`] runs a single operation in the background.
//!
//! Failures never reach the caller. An item that still fails after
//! `max_retries` retries is handed to the error sink.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::config::ExecutorSettings;
use crate::error::PluginHostError;

/// Receives items that failed after every retry: `(label, error)`.
pub type ErrorSink = Arc<dyn Fn(&str, &PluginHostError) + Send + Sync>;

/// Error sink that logs at `error!`
pub fn log_errors() -> ErrorSink {
    Arc::new(|label, err| {
        error!(item = %label, error = %err, "Operation failed after retries");
    })
}

/// Retry and backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_step: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(attempt)
    }
}

impl From<ExecutorSettings> for RetryPolicy {
    fn from(settings: ExecutorSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_step: settings.backoff_step(),
        }
    }
}

/// Outcome counts of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    /// Items abandoned between retries because of cancellation
    pub cancelled: usize,
}

#[derive(Clone)]
pub struct TaskExecutor {
    max_parallelism: usize,
    policy: RetryPolicy,
    cancel: CancellationToken,
    tracker: TaskTracker,
    on_error: ErrorSink,
}

impl TaskExecutor {
    pub fn new(settings: ExecutorSettings, cancel: CancellationToken, on_error: ErrorSink) -> Self {
        Self {
            max_parallelism: settings.max_parallelism.max(1),
            policy: settings.into(),
            cancel,
            tracker: TaskTracker::new(),
            on_error,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` for every item, bounded and retried.
    pub async fn parallel<I, T, F, Fut>(&self, items: I, op: F) -> BatchSummary
    where
        I: IntoIterator<Item = T>,
        T: Clone + fmt::Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginHostError>> + Send + 'static,
    {
        self.parallel_stream(tokio_stream::iter(items), op).await
    }

    /// Run `op` for every item the stream yields, bounded and retried.
    ///
    /// Items are pulled only when a slot is free, so a slow batch applies
    /// backpressure to the stream.
    pub async fn parallel_stream<S, T, F, Fut>(&self, items: S, op: F) -> BatchSummary
    where
        S: Stream<Item = T>,
        T: Clone + fmt::Display + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PluginHostError>> + Send + 'static,
    {
        let start = Instant::now();
        let op = Arc::new(op);
        let slots = Arc::new(Semaphore::new(self.max_parallelism));
        let mut running = JoinSet::new();
        let mut summary = BatchSummary::default();

        let mut items = std::pin::pin!(items);
        loop {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = items.next() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            let op = op.clone();
            let policy = self.policy;
            let cancel = self.cancel.clone();
            let on_error = self.on_error.clone();
            running.spawn(async move {
                let _permit = permit;
                let label = item.to_string();
                let result = run_with_retry(policy, &cancel, move || op(item.clone())).await;
                report(&label, result, &on_error)
            });

            while let Some(done) = running.try_join_next() {
                tally(&mut summary, done);
            }
        }

        while let Some(done) = running.join_next().await {
            tally(&mut summary, done);
        }

        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch finished"
        );
        summary
    }

    /// Run `op` on a background task with the retry policy.
    ///
    /// `op` is invoked once per attempt. Ignored once cancellation was signalled.
    pub fn execute<F, Fut>(&self, label: impl Into<String>, op: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), PluginHostError>> + Send + 'static,
    {
        let label = label.into();
        if self.cancel.is_cancelled() {
            debug!(item = %label, "Executor cancelled, dropping operation");
            return;
        }

        let policy = self.policy;
        let cancel = self.cancel.clone();
        let on_error = self.on_error.clone();
        self.tracker.spawn(async move {
            let result = run_with_retry(policy, &cancel, op).await;
            report(&label, result, &on_error);
        });
    }

    /// Number of background operations still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every background operation started by [`execute`](Self::execute).
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("max_parallelism", &self.max_parallelism)
            .field("policy", &self.policy)
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

fn report(label: &str, result: Result<(), PluginHostError>, on_error: &ErrorSink) -> Outcome {
    match result {
        Ok(()) => Outcome::Succeeded,
        Err(PluginHostError::Cancelled) => {
            debug!(item = %label, "Operation cancelled");
            Outcome::Cancelled
        }
        Err(err) => {
            on_error(label, &err);
            Outcome::Failed
        }
    }
}

fn tally(summary: &mut BatchSummary, done: Result<Outcome, tokio::task::JoinError>) {
    match done {
        Ok(Outcome::Succeeded) => summary.succeeded += 1,
        Ok(Outcome::Cancelled) => summary.cancelled += 1,
        Ok(Outcome::Failed) | Err(_) => summary.failed += 1,
    }
}

/// Run attempts until one succeeds, retries run out, or cancellation is
/// observed between attempts. Each attempt runs on its own task so a panic
/// counts as a failed attempt.
async fn run_with_retry<F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<(), PluginHostError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), PluginHostError>> + Send + 'static,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::spawn(attempt_fn()).await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                Err(PluginHostError::Panicked(panic_message(join.into_panic())))
            }
            Err(_) => Err(PluginHostError::Cancelled),
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(PluginHostError::Cancelled) => return Err(PluginHostError::Cancelled),
            Err(err) if attempt >= policy.max_retries => return Err(err),
            Err(err) => err,
        };

        attempt += 1;
        debug!(attempt, max_retries = policy.max_retries, error = %err, "Retrying operation");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PluginHostError::Cancelled),
            _ = tokio::time::sleep(policy.delay(attempt)) => {}
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
