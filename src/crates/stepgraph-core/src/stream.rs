//! Execution events emitted while a run progresses
//!
//! The engine emits these over an `mpsc` channel when streaming is
//! enabled; transports (HTTP, CLI, ...) serialize them into their own
//! framing. Everything here is `Serialize` so a thin caller can forward
//! events without re-mapping.

use crate::interrupt::Interrupt;
use serde::Serialize;
use serde_json::Value;

/// One engine-side event during a run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A task was scheduled and is about to execute
    TaskStarted {
        task_id: String,
        node: String,
        step: usize,
    },
    /// A task completed and its writes will be committed
    TaskFinished {
        task_id: String,
        node: String,
        step: usize,
    },
    /// A task failed terminally (retries exhausted or fatal error)
    TaskFailed {
        task_id: String,
        node: String,
        step: usize,
        error: String,
    },
    /// A superstep committed; `state` is the post-commit channel view
    SuperstepCompleted {
        step: usize,
        checkpoint_id: Option<String>,
        state: Value,
    },
    /// The run suspended waiting for external input
    Interrupted {
        interrupt: Interrupt,
        thread_id: Option<String>,
        checkpoint_id: Option<String>,
    },
    /// The run completed normally
    Done { state: Value },
    /// The run failed terminally
    Error { error: String },
}
