//! Node body contract
//!
//! A node is one of a closed set of behaviors, expressed through the value
//! it returns rather than through runtime type inspection:
//!
//! - a plain transform returns [`NodeOutput::Update`], a map of
//!   channel-name → value writes;
//! - a router returns [`NodeOutput::Command`], an optional update plus an
//!   explicit goto (the end token or named node(s));
//! - a push-producer returns [`NodeOutput::Sends`], a list of
//!   (target node, payload) packets scheduled as push tasks next step.
//!
//! Every invocation receives its [`NodeContext`] explicitly - write sink,
//! interrupt primitive, step number, cancellation flag. There is no
//! ambient or thread-local state: a task can only ever append intended
//! writes to its own private buffer, never touch shared channel state.

use crate::error::{GraphError, Result};
use crate::interrupt::Interrupt;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use stepgraph_checkpoint::SendPacket;

/// Future returned by a node body
pub type NodeFuture<'a> = Pin<Box<dyn Future<Output = Result<NodeOutput>> + Send + 'a>>;

/// Explicit routing instruction returned by a node
#[derive(Debug, Clone, PartialEq)]
pub enum Goto {
    /// Stop routing from this node
    End,
    /// Continue at a named node
    Node(String),
    /// Fan out to several named nodes
    Nodes(Vec<String>),
}

/// The result of one node invocation
#[derive(Debug, Clone)]
pub enum NodeOutput {
    /// Channel-name → value writes
    Update(Map<String, Value>),
    /// Writes plus an explicit goto instruction
    Command {
        update: Option<Map<String, Value>>,
        goto: Goto,
    },
    /// Dynamic push targets, each scheduled as its own task next step
    Sends(Vec<SendPacket>),
}

impl NodeOutput {
    /// An update with no writes
    pub fn empty() -> Self {
        NodeOutput::Update(Map::new())
    }

    /// Build an update from a JSON object value
    ///
    /// # Errors
    ///
    /// Fails if the value is not a JSON object.
    pub fn update_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(NodeOutput::Update(map)),
            other => Err(GraphError::Execution(format!(
                "node update must be a JSON object, got {other}"
            ))),
        }
    }

    /// An update that also routes to a named node
    pub fn goto(update: Option<Map<String, Value>>, node: impl Into<String>) -> Self {
        NodeOutput::Command {
            update,
            goto: Goto::Node(node.into()),
        }
    }

    /// An update that ends routing from this node
    pub fn end(update: Option<Map<String, Value>>) -> Self {
        NodeOutput::Command {
            update,
            goto: Goto::End,
        }
    }
}

/// A task's private write buffer
///
/// Shared between the engine and the executing node body; writes appended
/// here are merged into channels only when the superstep commits. Cleared
/// between retry attempts so a failed attempt leaves no partial writes.
#[derive(Clone, Default)]
pub struct WriteSink {
    inner: Arc<Mutex<Vec<(String, Value)>>>,
}

impl WriteSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an intended write
    pub fn push(&self, channel: impl Into<String>, value: Value) {
        self.inner
            .lock()
            .expect("write sink lock poisoned")
            .push((channel.into(), value));
    }

    /// Take all buffered writes
    pub fn drain(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.inner.lock().expect("write sink lock poisoned"))
    }

    /// Discard all buffered writes
    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("write sink lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("write sink lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for WriteSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSink").field("len", &self.len()).finish()
    }
}

/// Per-invocation context handed to a node body
///
/// Carries everything the body may interact with - no ambient state.
#[derive(Debug, Clone)]
pub struct NodeContext {
    node: String,
    step: usize,
    sink: WriteSink,
    resumes: Arc<Vec<Value>>,
    interrupts_raised: Arc<AtomicUsize>,
    cancelled: Arc<AtomicBool>,
}

impl NodeContext {
    pub(crate) fn new(
        node: impl Into<String>,
        step: usize,
        sink: WriteSink,
        resumes: Arc<Vec<Value>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            node: node.into(),
            step,
            sink,
            resumes,
            interrupts_raised: Arc::new(AtomicUsize::new(0)),
            cancelled,
        }
    }

    /// Name of the executing node
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Current superstep number
    pub fn step(&self) -> usize {
        self.step
    }

    /// Append an intended channel write to this task's buffer
    pub fn write(&self, channel: impl Into<String>, value: Value) {
        self.sink.push(channel, value);
    }

    /// Suspend the run and request external input.
    ///
    /// On first execution this raises [`GraphError::Interrupt`] carrying
    /// `value`; the engine persists the suspension point. When the task is
    /// re-entered after the caller supplied a resume value, the same call
    /// returns that value instead of suspending. Multiple calls within one
    /// body are resolved in the order they were raised.
    pub fn interrupt(&self, value: Value) -> Result<Value> {
        let index = self.interrupts_raised.fetch_add(1, Ordering::SeqCst);
        if let Some(resume) = self.resumes.get(index) {
            return Ok(resume.clone());
        }
        Err(GraphError::Interrupt(Interrupt::during(
            self.node.clone(),
            index,
            value,
        )))
    }

    /// Whether the engine has requested cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Async function a node executes when triggered
pub trait NodeBody: Send + Sync {
    fn run(&self, input: Value, ctx: NodeContext) -> NodeFuture<'_>;
}

struct FnNode<F>(F);

impl<F, Fut> NodeBody for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    fn run(&self, input: Value, ctx: NodeContext) -> NodeFuture<'_> {
        Box::pin((self.0)(input, ctx))
    }
}

/// Wrap an async closure as a node body
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeBody>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<NodeOutput>> + Send + 'static,
{
    Arc::new(FnNode(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(resumes: Vec<Value>) -> NodeContext {
        NodeContext::new(
            "test",
            0,
            WriteSink::new(),
            Arc::new(resumes),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_interrupt_raises_without_resume() {
        let ctx = test_ctx(vec![]);
        let err = ctx.interrupt(serde_json::json!("need input")).unwrap_err();
        match err {
            GraphError::Interrupt(interrupt) => {
                assert_eq!(interrupt.node, "test");
                assert_eq!(interrupt.index, 0);
                assert_eq!(interrupt.value, serde_json::json!("need input"));
            }
            other => panic!("expected interrupt, got {other}"),
        }
    }

    #[test]
    fn test_interrupt_consumes_resume_values_positionally() {
        let ctx = test_ctx(vec![serde_json::json!("first"), serde_json::json!("second")]);

        assert_eq!(
            ctx.interrupt(serde_json::json!("a")).unwrap(),
            serde_json::json!("first")
        );
        assert_eq!(
            ctx.interrupt(serde_json::json!("b")).unwrap(),
            serde_json::json!("second")
        );
        // third call has no recorded resume value: suspend again
        let err = ctx.interrupt(serde_json::json!("c")).unwrap_err();
        assert!(err.is_interrupt());
    }

    #[test]
    fn test_write_sink_drain() {
        let sink = WriteSink::new();
        sink.push("x", serde_json::json!(1));
        sink.push("y", serde_json::json!(2));

        let writes = sink.drain();
        assert_eq!(writes.len(), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_update_value_requires_object() {
        assert!(NodeOutput::update_value(serde_json::json!({"x": 1})).is_ok());
        assert!(NodeOutput::update_value(serde_json::json!([1, 2])).is_err());
    }
}
