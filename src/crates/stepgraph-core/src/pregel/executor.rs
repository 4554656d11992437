//! Task execution primitives: the background executor and the retry driver

use crate::error::{GraphError, Result};
use crate::node::{NodeBody, NodeContext, NodeOutput, WriteSink};
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Concurrency primitive for running node bodies in parallel.
///
/// Thin wrapper over a [`JoinSet`] with the two semantics the runner
/// needs: every still-running task is cancelled when the executor goes
/// out of scope (cancel-on-exit), and a panicking task surfaces as an
/// error from [`join_next`](Self::join_next) instead of being swallowed
/// (reraise-on-exit). Tasks aborted via [`abort_all`](Self::abort_all)
/// are silently dropped from the join stream.
pub struct BackgroundExecutor<T> {
    set: JoinSet<T>,
}

impl<T: Send + 'static> BackgroundExecutor<T> {
    pub fn new() -> Self {
        Self { set: JoinSet::new() }
    }

    /// Spawn a task onto the runtime
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.set.spawn(future);
    }

    /// Wait for the next task to finish.
    ///
    /// Returns `None` once every task has finished or been aborted.
    pub async fn join_next(&mut self) -> Option<Result<T>> {
        loop {
            match self.set.join_next().await {
                None => return None,
                Some(Ok(value)) => return Some(Ok(value)),
                Some(Err(join_error)) if join_error.is_cancelled() => continue,
                Some(Err(join_error)) => {
                    return Some(Err(GraphError::Execution(format!(
                        "background task panicked: {join_error}"
                    ))))
                }
            }
        }
    }

    /// Cancel every task that has not yet finished
    pub fn abort_all(&mut self) {
        self.set.abort_all();
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

impl<T: Send + 'static> Default for BackgroundExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one node body to completion, retrying per policy.
///
/// Each attempt gets a fresh context (so the interrupt position counter
/// restarts) and a cleared write sink (so a failed attempt leaves no
/// partial writes). Interrupts pass straight through: they are control
/// flow, not failures, and are never retried. Other errors are retried
/// while the policy's predicate matches and attempts remain, sleeping an
/// exponentially backed-off interval between attempts.
pub async fn run_with_retry(
    body: Arc<dyn NodeBody>,
    node: &str,
    step: usize,
    input: &Value,
    sink: &WriteSink,
    resumes: Arc<Vec<Value>>,
    cancelled: Arc<AtomicBool>,
    policy: Option<&RetryPolicy>,
) -> Result<NodeOutput> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        // clear any writes from previous attempts
        sink.clear();
        let ctx = NodeContext::new(node, step, sink.clone(), resumes.clone(), cancelled.clone());

        tracing::debug!(node, attempt = attempts, "executing task");
        match body.run(input.clone(), ctx).await {
            Ok(output) => {
                if attempts > 1 {
                    tracing::info!(node, attempts, "task succeeded after retry");
                }
                return Ok(output);
            }
            Err(error) if error.is_interrupt() => return Err(error),
            Err(error) => {
                let Some(policy) = policy else {
                    return Err(error);
                };
                if !(policy.retry_on)(&error) || attempts >= policy.max_attempts {
                    tracing::error!(node, attempts, %error, "task failed, not retrying");
                    return Err(error);
                }
                let delay = policy.calculate_delay(attempts - 1);
                tracing::warn!(
                    node,
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "task failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
