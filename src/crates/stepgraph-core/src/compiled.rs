//! The executable graph facade
//!
//! [`CompiledGraph`] is what a builder compiles into: immutable node
//! specs, a channel prototype cloned fresh for every invocation (no
//! channel instance outlives one run), and the runtime options. Each
//! invocation builds a [`PregelLoop`] around a fresh channel set, loads
//! or creates a checkpoint, and drives supersteps to completion.
//!
//! The single entry point transports need is [`CompiledGraph::run`] /
//! [`CompiledGraph::stream`]: start or resume a thread with an input or
//! a resume value, and either await the final state or consume the
//! per-step event stream.

use crate::error::{GraphError, Result};
use crate::graph::GraphTopology;
use crate::pregel::loop_impl::{LoopOptions, PregelLoop};
use crate::pregel::types::NodeSpec;
use crate::retry::RetryPolicy;
use crate::stream::ExecutionEvent;
use futures::TryStreamExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use stepgraph_checkpoint::{
    Channel, CheckpointConfig, CheckpointSaver, CheckpointTuple,
};

/// One start-or-resume request against a thread
#[derive(Debug, Default)]
pub struct RunRequest {
    /// New input to apply before running
    pub input: Option<Value>,
    /// Resume value for a pending interrupt on the thread
    pub resume: Option<Value>,
    /// Thread / checkpoint addressing; `None` runs without persistence
    pub config: Option<CheckpointConfig>,
}

impl RunRequest {
    /// Start a run with fresh input
    pub fn input(input: Value) -> Self {
        Self {
            input: Some(input),
            ..Self::default()
        }
    }

    /// Resume a suspended thread with a value
    pub fn resume(resume: Value) -> Self {
        Self {
            resume: Some(resume),
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: CheckpointConfig) -> Self {
        self.config = Some(config);
        self
    }
}

/// An immutable, validated, executable graph
pub struct CompiledGraph {
    nodes: HashMap<String, NodeSpec>,
    channel_prototype: HashMap<String, Box<dyn Channel>>,
    topology: Arc<GraphTopology>,
    trigger_to_nodes: HashMap<String, Vec<String>>,
    options: LoopOptions,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("channels", &self.channel_prototype.keys().collect::<Vec<_>>())
            .field("topology", &self.topology)
            .field("trigger_to_nodes", &self.trigger_to_nodes)
            .field("options", &self.options)
            .field("has_checkpointer", &self.checkpointer.is_some())
            .finish()
    }
}

impl CompiledGraph {
    pub(crate) fn new(
        nodes: HashMap<String, NodeSpec>,
        channel_prototype: HashMap<String, Box<dyn Channel>>,
        topology: Arc<GraphTopology>,
        trigger_to_nodes: HashMap<String, Vec<String>>,
    ) -> Self {
        Self {
            nodes,
            channel_prototype,
            topology,
            trigger_to_nodes,
            options: LoopOptions::default(),
            checkpointer: None,
        }
    }

    /// Attach a checkpoint store for persistence and resumption
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn CheckpointSaver>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    /// Bound the number of supersteps per thread
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.options.max_steps = max_steps;
        self
    }

    /// Control whether a failing task cancels its in-flight siblings
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.options.fail_fast = fail_fast;
        self
    }

    /// Give each superstep a wall-clock budget
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.options.step_timeout = Some(timeout);
        self
    }

    /// Fallback retry policy for nodes without their own
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.options.default_retry = Some(policy);
        self
    }

    /// Pause before any of these nodes execute
    pub fn with_interrupt_before<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.interrupt_before = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Pause after any of these nodes execute
    pub fn with_interrupt_after<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.interrupt_after = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Spec of a compiled node (mainly for introspection and tests)
    pub fn node_spec(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.get(name)
    }

    /// The graph's static topology
    pub fn topology(&self) -> &GraphTopology {
        &self.topology
    }

    fn build_loop(
        &self,
        config: Option<CheckpointConfig>,
        events: Option<mpsc::Sender<ExecutionEvent>>,
    ) -> PregelLoop {
        let channels: HashMap<String, Box<dyn Channel>> = self
            .channel_prototype
            .iter()
            .map(|(name, channel)| (name.clone(), channel.clone_box()))
            .collect();
        let mut pregel = PregelLoop::new(
            channels,
            self.nodes.clone(),
            self.topology.clone(),
            self.trigger_to_nodes.clone(),
            self.options.clone(),
        );
        if let (Some(checkpointer), Some(config)) = (&self.checkpointer, config) {
            pregel = pregel.with_checkpointer(checkpointer.clone(), config);
        }
        if let Some(events) = events {
            pregel = pregel.with_events(events);
        }
        pregel
    }

    async fn run_inner(
        &self,
        request: RunRequest,
        events: Option<mpsc::Sender<ExecutionEvent>>,
    ) -> Result<Value> {
        let mut pregel = self.build_loop(request.config, events);
        let found = pregel.load().await?;

        if let Some(resume) = request.resume {
            if !found {
                return Err(GraphError::Execution(
                    "cannot resume: no checkpoint found for thread".into(),
                ));
            }
            pregel.apply_resume(resume).await?;
        }
        if let Some(input) = request.input {
            pregel.apply_input(input).await?;
        }
        pregel.run().await
    }

    /// Start or resume a run, returning the final state.
    ///
    /// A pending interrupt surfaces as [`GraphError::Interrupt`]; the
    /// checkpoint carrying the suspension is already persisted when the
    /// error is returned.
    pub async fn run(&self, request: RunRequest) -> Result<Value> {
        self.run_inner(request, None).await
    }

    /// Run once without persistence
    pub async fn invoke(&self, input: Value) -> Result<Value> {
        self.run(RunRequest::input(input)).await
    }

    /// Run against a persisted thread
    pub async fn invoke_with_config(
        &self,
        input: Value,
        config: CheckpointConfig,
    ) -> Result<Value> {
        self.run(RunRequest::input(input).with_config(config)).await
    }

    /// Resume a suspended thread with a value
    pub async fn resume_with_config(
        &self,
        resume: Value,
        config: CheckpointConfig,
    ) -> Result<Value> {
        self.run(RunRequest::resume(resume).with_config(config))
            .await
    }

    /// Start or resume a run, streaming execution events.
    ///
    /// The run proceeds in the background; the returned receiver yields
    /// task, superstep, interrupt and terminal events in order.
    pub fn stream(self: Arc<Self>, request: RunRequest) -> mpsc::Receiver<ExecutionEvent> {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            let events = tx.clone();
            if let Err(error) = self.run_inner(request, Some(events)).await {
                if !error.is_interrupt() {
                    let _ = tx
                        .send(ExecutionEvent::Error {
                            error: error.to_string(),
                        })
                        .await;
                }
            }
        });
        rx
    }

    /// Apply an external state update to a persisted thread
    /// (`source: update` in checkpoint metadata).
    pub async fn update_state(
        &self,
        config: CheckpointConfig,
        values: Map<String, Value>,
    ) -> Result<()> {
        let mut pregel = self.build_loop(Some(config), None);
        if !pregel.load().await? {
            return Err(GraphError::Execution(
                "no checkpoint found for thread".into(),
            ));
        }
        pregel.apply_update(values).await
    }

    /// Latest (or addressed) checkpoint of a thread
    pub async fn get_state(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let checkpointer = self.require_checkpointer()?;
        Ok(checkpointer.get_tuple(config).await?)
    }

    /// Checkpoint history of a thread, newest first
    pub async fn state_history(
        &self,
        config: &CheckpointConfig,
        limit: Option<usize>,
    ) -> Result<Vec<CheckpointTuple>> {
        let checkpointer = self.require_checkpointer()?;
        let stream = checkpointer.list(Some(config), None, None, limit).await?;
        Ok(stream.try_collect().await?)
    }

    fn require_checkpointer(&self) -> Result<&Arc<dyn CheckpointSaver>> {
        self.checkpointer
            .as_ref()
            .ok_or_else(|| GraphError::Execution("no checkpointer configured".into()))
    }
}
