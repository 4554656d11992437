//! The superstep loop
//!
//! [`PregelLoop`] drives one invocation of a compiled graph:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  load-or-create checkpoint (fresh channels every run)  │
//! │        │                                               │
//! │  ┌─────▼──────────────────────────────────────────┐    │
//! │  │  superstep N                                   │    │
//! │  │  1. prepare_next_tasks (+ forced re-entries)   │    │
//! │  │  2. static interrupt-before check              │    │
//! │  │  3. run tasks concurrently (retry, interrupts) │    │
//! │  │  4. record per-task writes / markers           │    │
//! │  │  5. apply_writes          [BARRIER]            │    │
//! │  │  6. persist next checkpoint                    │    │
//! │  └─────┬──────────────────────────────────────────┘    │
//! │        │ more tasks?  yes → N+1                        │
//! │        ▼ no / interrupt / error                        │
//! │      done                                              │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! Supersteps of one invocation never overlap; superstep N's committed
//! checkpoint is the sole input to superstep N+1. On an interrupt the
//! step still commits: finished siblings' writes are applied, and the
//! suspended task's identity, input and interrupt payload are recorded
//! as marker writes against the committed checkpoint so a later
//! invocation re-enters exactly that task and nothing else runs twice.

use crate::error::{GraphError, Result};
use crate::graph::GraphTopology;
use crate::interrupt::{Interrupt, ResumeLedger};
use crate::io;
use crate::pregel::algo::{apply_writes, prepare_next_tasks};
use crate::pregel::runner::{ExecTask, SuperstepRunner, TaskOutcome, TaskRunResult};
use crate::pregel::types::{
    reserved, NodeSpec, Task, TaskPath, TaskWrites, INPUT, INTERRUPT_SEEN, UPDATE,
};
use crate::retry::RetryPolicy;
use crate::stream::ExecutionEvent;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use stepgraph_checkpoint::{
    Channel, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
};

/// Runtime knobs for one invocation
#[derive(Debug, Clone)]
pub struct LoopOptions {
    /// Hard bound on supersteps per thread
    pub max_steps: usize,
    /// Cancel in-flight siblings once a task fails terminally
    pub fail_fast: bool,
    /// Per-superstep wall-clock budget
    pub step_timeout: Option<Duration>,
    /// Fallback retry policy for nodes without their own
    pub default_retry: Option<RetryPolicy>,
    /// Pause before these nodes execute
    pub interrupt_before: HashSet<String>,
    /// Pause after these nodes execute
    pub interrupt_after: HashSet<String>,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_steps: 25,
            fail_fast: true,
            step_timeout: None,
            default_retry: None,
            interrupt_before: HashSet::new(),
            interrupt_after: HashSet::new(),
        }
    }
}

/// One invocation's execution state
pub struct PregelLoop {
    checkpoint: Checkpoint,
    channels: HashMap<String, Box<dyn Channel>>,
    nodes: HashMap<String, NodeSpec>,
    topology: Arc<GraphTopology>,
    trigger_to_nodes: HashMap<String, Vec<String>>,
    options: LoopOptions,
    step: usize,
    checkpointer: Option<Arc<dyn CheckpointSaver>>,
    checkpoint_config: Option<CheckpointConfig>,
    resume_ledger: ResumeLedger,
    /// Suspended tasks re-entered on the first superstep after load
    forced: Vec<Task>,
    /// Nodes with a recorded pending interrupt, in marker order
    interrupted_nodes: Vec<String>,
    events: Option<mpsc::Sender<ExecutionEvent>>,
    /// Externally-managed writes accumulated across the run
    managed: HashMap<String, Vec<Value>>,
}

impl PregelLoop {
    pub fn new(
        channels: HashMap<String, Box<dyn Channel>>,
        nodes: HashMap<String, NodeSpec>,
        topology: Arc<GraphTopology>,
        trigger_to_nodes: HashMap<String, Vec<String>>,
        options: LoopOptions,
    ) -> Self {
        Self {
            checkpoint: Checkpoint::empty(),
            channels,
            nodes,
            topology,
            trigger_to_nodes,
            options,
            step: 0,
            checkpointer: None,
            checkpoint_config: None,
            resume_ledger: ResumeLedger::new(),
            forced: Vec::new(),
            interrupted_nodes: Vec::new(),
            events: None,
            managed: HashMap::new(),
        }
    }

    pub fn with_checkpointer(
        mut self,
        checkpointer: Arc<dyn CheckpointSaver>,
        config: CheckpointConfig,
    ) -> Self {
        self.checkpointer = Some(checkpointer);
        self.checkpoint_config = Some(config);
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<ExecutionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Externally-managed writes produced so far, grouped by name
    pub fn managed_writes(&self) -> &HashMap<String, Vec<Value>> {
        &self.managed
    }

    /// Load persisted state for the configured thread, if any.
    ///
    /// Restores channel snapshots, the step counter, suspended-task
    /// re-entries and resume values recorded against the latest (or the
    /// configured) checkpoint. Returns whether a checkpoint was found.
    pub async fn load(&mut self) -> Result<bool> {
        let Some(checkpointer) = self.checkpointer.clone() else {
            return Ok(false);
        };
        let Some(config) = self.checkpoint_config.clone() else {
            return Ok(false);
        };
        let Some(tuple) = checkpointer.get_tuple(&config).await? else {
            return Ok(false);
        };

        self.checkpoint = tuple.checkpoint;
        for (name, snapshot) in &self.checkpoint.channel_values {
            if let Some(channel) = self.channels.get_mut(name) {
                channel.restore(snapshot.clone())?;
            }
        }
        self.step = (tuple.metadata.step.unwrap_or(-1) + 1).max(0) as usize;
        self.checkpoint_config = Some(tuple.config);

        for (task_id, channel, value) in &tuple.pending_writes {
            match channel.as_str() {
                reserved::SCHEDULED => {
                    let node = value.get("node").and_then(Value::as_str);
                    let input = value.get("input");
                    let (Some(node), Some(input)) = (node, input) else {
                        tracing::warn!(%task_id, "ignoring malformed scheduled marker");
                        continue;
                    };
                    let triggers = value
                        .get("triggers")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or_default();
                    let path = value
                        .get("path")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                        .unwrap_or(TaskPath::Pull {
                            node: node.to_string(),
                        });
                    self.forced.push(Task {
                        id: task_id.clone(),
                        name: node.to_string(),
                        input: input.clone(),
                        triggers,
                        path,
                    });
                }
                reserved::INTERRUPT => {
                    if let Some(node) = value.get("node").and_then(Value::as_str) {
                        self.interrupted_nodes.push(node.to_string());
                    }
                }
                reserved::RESUME => {
                    let node = value.get("node").and_then(Value::as_str);
                    let values = value.get("values").and_then(Value::as_array);
                    if let (Some(node), Some(values)) = (node, values) {
                        self.resume_ledger.load(node, values.clone());
                    }
                }
                _ => {}
            }
        }

        Ok(true)
    }

    /// Record a resume value for the pending interrupt.
    pub async fn apply_resume(&mut self, resume: Value) -> Result<()> {
        let Some(node) = self.interrupted_nodes.first().cloned() else {
            return Err(GraphError::Execution(
                "cannot resume: no pending interrupt on this thread".into(),
            ));
        };
        self.resume_ledger.push(&node, resume);

        // persist so resumption survives a process restart
        if let (Some(checkpointer), Some(config)) = (&self.checkpointer, &self.checkpoint_config) {
            if config.checkpoint_id.is_some() {
                let values = self.resume_ledger.values_for(&node);
                checkpointer
                    .put_writes(
                        config,
                        vec![(
                            reserved::RESUME.to_string(),
                            serde_json::json!({"node": node, "values": values}),
                        )],
                        format!("resume:{node}"),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Apply graph input as writes and persist the input checkpoint.
    pub async fn apply_input(&mut self, input: Value) -> Result<()> {
        let writes = io::map_input_writes(&input, &self.channels, &self.topology);
        let task = TaskWrites {
            path: TaskPath::Pull {
                node: INPUT.to_string(),
            },
            name: INPUT.to_string(),
            writes,
            triggers: vec![],
        };
        let applied = apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            vec![task],
            &self.trigger_to_nodes,
        )?;
        self.merge_managed(applied.managed);
        self.save_checkpoint(CheckpointSource::Input, self.step as i64 - 1, HashMap::new())
            .await
    }

    /// Apply an external state update as writes (`source: update`).
    pub async fn apply_update(&mut self, values: Map<String, Value>) -> Result<()> {
        let mut writes = Vec::new();
        for (channel, value) in values {
            if !self.topology.is_state_channel(&channel) || !self.channels.contains_key(&channel) {
                return Err(GraphError::Checkpoint(
                    stepgraph_checkpoint::CheckpointError::InvalidUpdate(format!(
                        "'{channel}' is not a declared state channel"
                    )),
                ));
            }
            writes.push((channel, value));
        }
        let task = TaskWrites {
            path: TaskPath::Pull {
                node: UPDATE.to_string(),
            },
            name: UPDATE.to_string(),
            writes,
            triggers: vec![],
        };
        let applied = apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            vec![task],
            &self.trigger_to_nodes,
        )?;
        self.merge_managed(applied.managed);
        self.save_checkpoint(CheckpointSource::Update, self.step as i64, HashMap::new())
            .await
    }

    /// Drive supersteps until no tasks remain, an interrupt or error
    /// halts execution, or the step bound is hit.
    pub async fn run(&mut self) -> Result<Value> {
        loop {
            if self.step >= self.options.max_steps {
                return Err(GraphError::Execution(format!(
                    "maximum steps ({}) exceeded",
                    self.options.max_steps
                )));
            }
            if !self.superstep().await? {
                break;
            }
            self.step += 1;
        }

        let state = io::read_state(&self.channels, &self.topology);
        self.emit(ExecutionEvent::Done {
            state: state.clone(),
        })
        .await;
        Ok(state)
    }

    async fn superstep(&mut self) -> Result<bool> {
        // 1. schedule: pull/push tasks, plus forced re-entries from a
        //    suspended superstep (which replace their pull duplicates)
        let namespace = self
            .checkpoint_config
            .as_ref()
            .map(|c| c.namespace().to_string())
            .unwrap_or_default();
        let prepared = prepare_next_tasks(
            &self.checkpoint,
            &self.nodes,
            &self.channels,
            self.step,
            &namespace,
        )?;
        let mut tasks: Vec<Task> = prepared.into_values().collect();
        let forced = std::mem::take(&mut self.forced);
        if !forced.is_empty() {
            let forced_nodes: HashSet<String> =
                forced.iter().map(|task| task.name.clone()).collect();
            tasks.retain(|task| !forced_nodes.contains(&task.name));
            tasks.extend(forced);
        }
        tasks.sort_by(|a, b| (&a.path, &a.name).cmp(&(&b.path, &b.name)));

        if tasks.is_empty() {
            return Ok(false);
        }

        // 2. static interrupt-before breakpoints
        if let Some(node) = self.static_interrupt_hit(&self.options.interrupt_before, &tasks) {
            self.mark_interrupt_seen();
            self.save_checkpoint(CheckpointSource::Loop, self.step as i64, HashMap::new())
                .await?;
            let interrupt = Interrupt::before(node);
            self.emit_interrupted(&interrupt).await;
            return Err(GraphError::Interrupt(interrupt));
        }

        for task in &tasks {
            self.emit(ExecutionEvent::TaskStarted {
                task_id: task.id.clone(),
                node: task.name.clone(),
                step: self.step,
            })
            .await;
        }

        // 3. run the whole superstep concurrently
        let exec_tasks: Vec<ExecTask> = tasks
            .iter()
            .filter_map(|task| {
                let Some(spec) = self.nodes.get(&task.name) else {
                    tracing::warn!(node = %task.name, "dropping task for unknown node");
                    return None;
                };
                Some(ExecTask {
                    task: task.clone(),
                    spec: spec.clone(),
                    resumes: Arc::new(self.resume_ledger.values_for(&task.name)),
                })
            })
            .collect();
        let runner = SuperstepRunner {
            fail_fast: self.options.fail_fast,
            step_timeout: self.options.step_timeout,
            default_retry: self.options.default_retry.clone(),
        };
        let output = runner.run(self.step, exec_tasks, self.topology.clone()).await;

        // 4. per-task bookkeeping against the pre-step checkpoint
        for outcome in &output.outcomes {
            match &outcome.result {
                TaskRunResult::Completed => {
                    self.emit(ExecutionEvent::TaskFinished {
                        task_id: outcome.task.id.clone(),
                        node: outcome.task.name.clone(),
                        step: self.step,
                    })
                    .await;
                    self.record_writes(outcome.writes.clone(), &outcome.task.id)
                        .await?;
                }
                TaskRunResult::Failed(message) => {
                    self.emit(ExecutionEvent::TaskFailed {
                        task_id: outcome.task.id.clone(),
                        node: outcome.task.name.clone(),
                        step: self.step,
                        error: message.clone(),
                    })
                    .await;
                    self.record_writes(
                        vec![(reserved::ERROR.to_string(), Value::String(message.clone()))],
                        &outcome.task.id,
                    )
                    .await?;
                }
                TaskRunResult::Interrupted(_) | TaskRunResult::Cancelled => {}
            }
        }

        // 5. barrier: merge completed tasks' writes into the channels
        let completed: Vec<TaskWrites> = output
            .outcomes
            .iter()
            .filter(|outcome| outcome.is_completed())
            .map(|outcome| TaskWrites {
                path: outcome.task.path.clone(),
                name: outcome.task.name.clone(),
                writes: outcome.writes.clone(),
                triggers: outcome.task.triggers.clone(),
            })
            .collect();
        let writes_by_node = summarize_writes(&output.outcomes, &self.topology);
        let applied = apply_writes(
            &mut self.checkpoint,
            &mut self.channels,
            completed,
            &self.trigger_to_nodes,
        )?;
        self.merge_managed(applied.managed);

        // 6. static interrupt-after breakpoints are part of the commit
        let after_hit = self.static_interrupt_hit_names(
            &self.options.interrupt_after,
            output
                .outcomes
                .iter()
                .filter(|o| o.is_completed())
                .map(|o| o.task.name.as_str()),
        );
        if after_hit.is_some() {
            self.mark_interrupt_seen();
        }

        // 7. persist the superstep
        self.save_checkpoint(CheckpointSource::Loop, self.step as i64, writes_by_node)
            .await?;
        self.emit(ExecutionEvent::SuperstepCompleted {
            step: self.step,
            checkpoint_id: self
                .checkpoint_config
                .as_ref()
                .and_then(|c| c.checkpoint_id.clone()),
            state: io::read_state(&self.channels, &self.topology),
        })
        .await;

        // 8. record suspension markers against the committed checkpoint
        let mut first_interrupt: Option<Interrupt> = None;
        for outcome in &output.outcomes {
            if let TaskRunResult::Interrupted(interrupt) = &outcome.result {
                self.record_interrupt_markers(outcome, interrupt).await?;
                if first_interrupt.is_none() {
                    first_interrupt = Some(interrupt.clone());
                }
            }
        }

        // 9. a genuine error is re-raised only after the commit above
        if let Some(error) = output.error {
            return Err(error);
        }

        if let Some(interrupt) = first_interrupt {
            self.emit_interrupted(&interrupt).await;
            return Err(GraphError::Interrupt(interrupt));
        }

        if let Some(node) = after_hit {
            let interrupt = Interrupt::after(node);
            self.emit_interrupted(&interrupt).await;
            return Err(GraphError::Interrupt(interrupt));
        }

        Ok(true)
    }

    /// Static breakpoints fire only when some channel advanced since the
    /// last breakpoint, so a resumed run does not immediately re-pause.
    fn static_interrupt_hit(&self, nodes: &HashSet<String>, tasks: &[Task]) -> Option<String> {
        self.static_interrupt_hit_names(nodes, tasks.iter().map(|t| t.name.as_str()))
    }

    fn static_interrupt_hit_names<'a>(
        &self,
        nodes: &HashSet<String>,
        mut candidates: impl Iterator<Item = &'a str>,
    ) -> Option<String> {
        if nodes.is_empty() {
            return None;
        }
        let null_version = self.checkpoint.null_version();
        let seen = self.checkpoint.versions_seen.get(INTERRUPT_SEEN);
        let any_updates = self.checkpoint.channel_versions.iter().any(|(chan, version)| {
            let last = seen.and_then(|s| s.get(chan)).unwrap_or(&null_version);
            version > last
        });
        if !any_updates {
            return None;
        }
        candidates
            .find(|name| nodes.contains(*name))
            .map(str::to_string)
    }

    fn mark_interrupt_seen(&mut self) {
        self.checkpoint.versions_seen.insert(
            INTERRUPT_SEEN.to_string(),
            self.checkpoint.channel_versions.clone(),
        );
    }

    async fn record_interrupt_markers(
        &self,
        outcome: &TaskOutcome,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let scheduled = serde_json::json!({
            "node": outcome.task.name,
            "input": outcome.task.input,
            "triggers": outcome.task.triggers,
            "path": outcome.task.path,
        });
        self.record_writes(
            vec![
                (
                    reserved::INTERRUPT.to_string(),
                    serde_json::to_value(interrupt)?,
                ),
                (reserved::SCHEDULED.to_string(), scheduled),
            ],
            &outcome.task.id,
        )
        .await?;

        // carry the node's resume history forward to the new checkpoint
        let history = self.resume_ledger.values_for(&outcome.task.name);
        if !history.is_empty() {
            self.record_writes(
                vec![(
                    reserved::RESUME.to_string(),
                    serde_json::json!({"node": outcome.task.name, "values": history}),
                )],
                &format!("resume:{}", outcome.task.name),
            )
            .await?;
        }
        Ok(())
    }

    async fn record_writes(&self, writes: Vec<(String, Value)>, task_id: &str) -> Result<()> {
        if let (Some(checkpointer), Some(config)) = (&self.checkpointer, &self.checkpoint_config) {
            if config.checkpoint_id.is_some() {
                checkpointer
                    .put_writes(config, writes, task_id.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    /// Snapshot the channels into a fresh checkpoint and persist it.
    async fn save_checkpoint(
        &mut self,
        source: CheckpointSource,
        step: i64,
        writes_by_node: HashMap<String, Value>,
    ) -> Result<()> {
        let mut channel_values = HashMap::new();
        for (name, channel) in &self.channels {
            if channel.is_available() {
                if let Ok(snapshot) = channel.checkpoint() {
                    channel_values.insert(name.clone(), snapshot);
                }
            }
        }
        self.checkpoint.channel_values = channel_values;
        self.checkpoint = self.checkpoint.next();

        let checkpointer = self.checkpointer.clone();
        let config = self.checkpoint_config.clone();
        if let (Some(checkpointer), Some(config)) = (checkpointer, config) {
            let mut metadata = CheckpointMetadata::new().with_source(source).with_step(step);
            if !writes_by_node.is_empty() {
                metadata = metadata.with_writes(writes_by_node);
            }
            if let Some(parent_id) = &config.checkpoint_id {
                metadata = metadata.with_parents(HashMap::from([(
                    config.namespace().to_string(),
                    parent_id.clone(),
                )]));
            }
            let stored = checkpointer
                .put(
                    &config,
                    self.checkpoint.clone(),
                    metadata,
                    self.checkpoint.channel_versions.clone(),
                )
                .await?;
            tracing::debug!(
                checkpoint_id = ?stored.checkpoint_id,
                step,
                source = ?source,
                "checkpoint committed"
            );
            self.checkpoint_config = Some(stored);
        }
        Ok(())
    }

    fn merge_managed(&mut self, managed: HashMap<String, Vec<Value>>) {
        for (name, values) in managed {
            self.managed.entry(name).or_default().extend(values);
        }
    }

    async fn emit(&self, event: ExecutionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }

    async fn emit_interrupted(&self, interrupt: &Interrupt) {
        self.emit(ExecutionEvent::Interrupted {
            interrupt: interrupt.clone(),
            thread_id: self
                .checkpoint_config
                .as_ref()
                .and_then(|c| c.thread_id.clone()),
            checkpoint_id: self
                .checkpoint_config
                .as_ref()
                .and_then(|c| c.checkpoint_id.clone()),
        })
        .await;
    }
}

/// Per-node state-channel writes, recorded in checkpoint metadata.
fn summarize_writes(
    outcomes: &[TaskOutcome],
    topology: &GraphTopology,
) -> HashMap<String, Value> {
    let mut by_node: HashMap<String, Map<String, Value>> = HashMap::new();
    for outcome in outcomes {
        if !outcome.is_completed() {
            continue;
        }
        let entry = by_node.entry(outcome.task.name.clone()).or_default();
        for (channel, value) in &outcome.writes {
            if topology.is_state_channel(channel) {
                entry.insert(channel.clone(), value.clone());
            }
        }
    }
    by_node
        .into_iter()
        .filter(|(_, writes)| !writes.is_empty())
        .map(|(node, writes)| (node, Value::Object(writes)))
        .collect()
}
