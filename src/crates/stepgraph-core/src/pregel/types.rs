//! Core task and node-spec types for the superstep engine

use crate::node::NodeBody;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Reserved entry sentinel
pub const START: &str = "__start__";
/// Reserved exit sentinel
pub const END: &str = "__end__";
/// Task name used for applying graph input as writes
pub const INPUT: &str = "__input__";
/// Task name used for applying external state updates as writes
pub const UPDATE: &str = "__update__";
/// Versions-seen key tracking static interrupt breakpoints
pub const INTERRUPT_SEEN: &str = "__interrupt__";

/// Trigger tag for push tasks
pub const PUSH: &str = "__pregel_push";
/// Trigger tag for pull tasks
pub const PULL: &str = "__pregel_pull";

pub use stepgraph_checkpoint::reserved;

/// Where a task came from: derived from channel versions (pull) or an
/// explicit queued send (push). Ordering is the deterministic write
/// application order within a superstep.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPath {
    /// Scheduled because a subscribed channel advanced
    Pull { node: String },
    /// Scheduled because a previous step queued a packet at this index
    Push { index: usize },
}

impl fmt::Display for TaskPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPath::Pull { node } => write!(f, "{PULL}:{node}"),
            TaskPath::Push { index } => write!(f, "{PUSH}:{index}"),
        }
    }
}

/// A unit of scheduled work for one superstep
#[derive(Debug, Clone)]
pub struct Task {
    /// Deterministic id: identical due work hashes to an identical id
    pub id: String,
    /// Node to execute
    pub name: String,
    /// Value read from the triggering channels (or the push payload)
    pub input: Value,
    /// Channel names that caused scheduling (the push tag for push tasks)
    pub triggers: Vec<String>,
    /// Pull vs push provenance
    pub path: TaskPath,
}

/// Writes produced by a task (or a bare source such as graph input),
/// ready for application to channels
#[derive(Debug, Clone)]
pub struct TaskWrites {
    pub path: TaskPath,
    pub name: String,
    pub writes: Vec<(String, Value)>,
    pub triggers: Vec<String>,
}

/// Binds a node body to its trigger, read and write channels
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique node name; reserved `__` prefixed names are rejected at
    /// compile time
    pub name: String,
    /// Channels whose version advance schedules this node
    pub triggers: Vec<String>,
    /// Channels read to build the node's input snapshot
    pub reads: Vec<String>,
    /// Channels this node's updates may target
    pub writes: Vec<String>,
    /// The node body
    pub body: Arc<dyn NodeBody>,
    /// Per-node retry policy override
    pub retry_policy: Option<RetryPolicy>,
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("triggers", &self.triggers)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Derive a deterministic task id from the scheduling identity.
///
/// SHA-1 based UUIDv5 over (checkpoint id, namespace, step, node, path
/// tag, triggers/index), so re-scheduling the same due work on the same
/// checkpoint is idempotent, across processes.
pub fn task_id(
    checkpoint_id: &str,
    namespace: &str,
    step: usize,
    node: &str,
    path_tag: &str,
    parts: &[String],
) -> String {
    let mut name = Vec::new();
    for piece in [checkpoint_id, namespace, &step.to_string(), node, path_tag] {
        name.extend_from_slice(piece.as_bytes());
        name.push(0);
    }
    for part in parts {
        name.extend_from_slice(part.as_bytes());
        name.push(0);
    }
    Uuid::new_v5(&Uuid::NAMESPACE_OID, &name).to_string()
}
