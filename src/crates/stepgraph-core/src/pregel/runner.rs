//! Concurrent execution of one superstep's tasks
//!
//! All scheduled tasks are independent and run concurrently on the
//! background executor. Each task's node body only ever appends to its
//! private write buffer; the buffer is decomposed into channel writes
//! here and committed by the loop after the whole step settles.
//!
//! Failure semantics: an interrupt is recorded and lets its siblings run
//! to completion; a genuine error (after retries) cancels not-yet-finished
//! siblings when fail-fast is on, while finished siblings keep their
//! writes. A step timeout behaves like a task failure after cancelling
//! whatever is still in flight. Cancelled tasks' partial writes are
//! discarded.

use crate::error::{GraphError, Result};
use crate::graph::{GraphTopology, RouterResult};
use crate::interrupt::Interrupt;
use crate::node::{Goto, NodeOutput, WriteSink};
use crate::pregel::executor::{run_with_retry, BackgroundExecutor};
use crate::pregel::types::{reserved, NodeSpec, Task};
use crate::retry::RetryPolicy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepgraph_checkpoint::{CheckpointError, SendPacket};

/// A task paired with everything needed to execute it
pub struct ExecTask {
    pub task: Task,
    pub spec: NodeSpec,
    /// Resume values recorded for this node, consumed positionally
    pub resumes: Arc<Vec<Value>>,
}

/// How one task ended
#[derive(Debug)]
pub enum TaskRunResult {
    Completed,
    Interrupted(Interrupt),
    Failed(String),
    Cancelled,
}

/// One task's settled outcome
#[derive(Debug)]
pub struct TaskOutcome {
    pub task: Task,
    pub writes: Vec<(String, Value)>,
    pub result: TaskRunResult,
}

impl TaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self.result, TaskRunResult::Completed)
    }
}

/// The settled superstep: every task accounted for, plus the error to
/// re-raise (if any) once the finished tasks' writes are committed
#[derive(Debug)]
pub struct SuperstepOutput {
    pub outcomes: Vec<TaskOutcome>,
    pub error: Option<GraphError>,
}

enum RawResult {
    Completed,
    Interrupted(Interrupt),
    Failed(GraphError),
}

struct RawOutcome {
    task: Task,
    writes: Vec<(String, Value)>,
    result: RawResult,
}

/// Runs the tasks of one superstep concurrently
pub struct SuperstepRunner {
    pub fail_fast: bool,
    pub step_timeout: Option<Duration>,
    pub default_retry: Option<RetryPolicy>,
}

impl SuperstepRunner {
    pub async fn run(
        &self,
        step: usize,
        exec_tasks: Vec<ExecTask>,
        topology: Arc<GraphTopology>,
    ) -> SuperstepOutput {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut unsettled: HashMap<String, Task> = exec_tasks
            .iter()
            .map(|exec| (exec.task.id.clone(), exec.task.clone()))
            .collect();

        let mut executor = BackgroundExecutor::new();
        for exec in exec_tasks {
            let topology = topology.clone();
            let cancelled = cancelled.clone();
            let policy = exec.spec.retry_policy.clone().or_else(|| self.default_retry.clone());
            executor.spawn(async move {
                run_one(step, exec, topology, cancelled, policy).await
            });
        }

        let mut outcomes = Vec::new();
        let mut first_error: Option<GraphError> = None;
        let deadline = self
            .step_timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        loop {
            let joined = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, executor.join_next()).await {
                        Ok(joined) => joined,
                        Err(_) => {
                            cancelled.store(true, Ordering::SeqCst);
                            executor.abort_all();
                            if first_error.is_none() {
                                let duration_ms = self
                                    .step_timeout
                                    .map(|limit| limit.as_millis() as u64)
                                    .unwrap_or_default();
                                first_error = Some(GraphError::Timeout {
                                    operation: format!("superstep {step}"),
                                    duration_ms,
                                });
                            }
                            // drain whatever already finished
                            while let Some(Ok(raw)) = executor.join_next().await {
                                unsettled.remove(&raw.task.id);
                                outcomes.push(convert(raw, &mut first_error));
                            }
                            break;
                        }
                    }
                }
                None => executor.join_next().await,
            };

            let Some(joined) = joined else { break };
            match joined {
                Ok(raw) => {
                    unsettled.remove(&raw.task.id);
                    let failed = matches!(raw.result, RawResult::Failed(_));
                    outcomes.push(convert(raw, &mut first_error));
                    if failed && self.fail_fast {
                        cancelled.store(true, Ordering::SeqCst);
                        executor.abort_all();
                    }
                }
                Err(panic_error) => {
                    if first_error.is_none() {
                        first_error = Some(panic_error);
                    }
                    cancelled.store(true, Ordering::SeqCst);
                    executor.abort_all();
                }
            }
        }

        // tasks that never settled were cancelled; their writes are gone
        for (_, task) in unsettled {
            outcomes.push(TaskOutcome {
                task,
                writes: Vec::new(),
                result: TaskRunResult::Cancelled,
            });
        }

        SuperstepOutput {
            outcomes,
            error: first_error,
        }
    }
}

fn convert(raw: RawOutcome, first_error: &mut Option<GraphError>) -> TaskOutcome {
    match raw.result {
        RawResult::Completed => TaskOutcome {
            task: raw.task,
            writes: raw.writes,
            result: TaskRunResult::Completed,
        },
        RawResult::Interrupted(interrupt) => TaskOutcome {
            task: raw.task,
            writes: Vec::new(),
            result: TaskRunResult::Interrupted(interrupt),
        },
        RawResult::Failed(error) => {
            let message = error.to_string();
            if first_error.is_none() {
                *first_error = Some(error);
            }
            TaskOutcome {
                task: raw.task,
                writes: Vec::new(),
                result: TaskRunResult::Failed(message),
            }
        }
    }
}

async fn run_one(
    step: usize,
    exec: ExecTask,
    topology: Arc<GraphTopology>,
    cancelled: Arc<AtomicBool>,
    policy: Option<RetryPolicy>,
) -> RawOutcome {
    let sink = WriteSink::new();
    let result = run_with_retry(
        exec.spec.body.clone(),
        &exec.task.name,
        step,
        &exec.task.input,
        &sink,
        exec.resumes,
        cancelled,
        policy.as_ref(),
    )
    .await;

    match result {
        Ok(output) => {
            let mut writes = sink.drain();
            match decompose_output(&exec.task, &exec.spec, output, &topology, &mut writes) {
                Ok(()) => RawOutcome {
                    task: exec.task,
                    writes,
                    result: RawResult::Completed,
                },
                Err(error) => RawOutcome {
                    task: exec.task,
                    writes: Vec::new(),
                    result: RawResult::Failed(error),
                },
            }
        }
        Err(GraphError::Interrupt(interrupt)) => RawOutcome {
            task: exec.task,
            writes: Vec::new(),
            result: RawResult::Interrupted(interrupt),
        },
        Err(error) => RawOutcome {
            task: exec.task,
            writes: Vec::new(),
            result: RawResult::Failed(error),
        },
    }
}

/// Turn a node's output into its channel writes.
///
/// Update keys must target one of the node's writable channels; a key
/// naming some other existing channel is an invalid update (fatal to the
/// task), while a key naming no channel at all becomes an
/// externally-managed write. Goto verdicts and explicit sends become
/// queued packets; branch routers run against the node's effective state
/// and write the chosen decision channels. A completed task with nothing
/// to say still records the no-writes marker.
fn decompose_output(
    task: &Task,
    spec: &NodeSpec,
    output: NodeOutput,
    topology: &GraphTopology,
    writes: &mut Vec<(String, Value)>,
) -> Result<()> {
    // writes pushed through the context sink obey the same target rules
    for (channel, _) in writes.iter() {
        check_write_target(spec, topology, channel)?;
    }

    let mut effective = match &task.input {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let mut apply_update = |update: Map<String, Value>,
                            effective: &mut Map<String, Value>,
                            writes: &mut Vec<(String, Value)>|
     -> Result<()> {
        for (channel, value) in update {
            check_write_target(spec, topology, &channel)?;
            effective.insert(channel.clone(), value.clone());
            writes.push((channel, value));
        }
        Ok(())
    };

    // an explicit routing verdict (goto or sends) replaces static edges
    let explicit_routing = matches!(
        output,
        NodeOutput::Command { .. } | NodeOutput::Sends(_)
    );
    match output {
        NodeOutput::Update(update) => {
            apply_update(update, &mut effective, writes)?;
        }
        NodeOutput::Command { update, goto } => {
            if let Some(update) = update {
                apply_update(update, &mut effective, writes)?;
            }
            let targets = match goto {
                Goto::End => Vec::new(),
                Goto::Node(node) => vec![node],
                Goto::Nodes(nodes) => nodes,
            };
            for target in targets {
                push_send(
                    spec,
                    topology,
                    writes,
                    SendPacket::new(target, Value::Object(effective.clone())),
                )?;
            }
        }
        NodeOutput::Sends(packets) => {
            for packet in packets {
                push_send(spec, topology, writes, packet)?;
            }
        }
    }

    // branch routers see the input snapshot overlaid with this task's writes
    if let Some(branches) = topology.branches.get(&task.name) {
        let effective_state = Value::Object(effective.clone());
        for branch in branches {
            let keys = match branch.route(&effective_state) {
                RouterResult::End => Vec::new(),
                RouterResult::Node(key) => vec![key],
                RouterResult::Nodes(keys) => keys,
                RouterResult::Sends(packets) => {
                    for packet in packets {
                        push_send(spec, topology, writes, packet)?;
                    }
                    Vec::new()
                }
            };
            for key in keys {
                let Some(target) = branch.resolve(&key)? else {
                    continue;
                };
                match branch.channel_for(&target) {
                    Some(channel) => writes.push((channel.clone(), Value::Null)),
                    None => push_send(
                        spec,
                        topology,
                        writes,
                        SendPacket::new(target, effective_state.clone()),
                    )?,
                }
            }
        }
    }

    // trigger static successors
    if !explicit_routing && topology.channel_names.contains(&task.name) {
        writes.push((task.name.clone(), Value::Null));
    }

    if writes.is_empty() {
        writes.push((reserved::NO_WRITES.to_string(), Value::Null));
    }

    Ok(())
}

fn check_write_target(spec: &NodeSpec, topology: &GraphTopology, channel: &str) -> Result<()> {
    if spec.writes.iter().any(|allowed| allowed == channel) {
        return Ok(());
    }
    if !topology.channel_names.contains(channel) && !reserved::is_reserved(channel) {
        // not a channel at all: an externally-managed value write
        return Ok(());
    }
    Err(GraphError::Checkpoint(CheckpointError::InvalidUpdate(
        format!(
            "node '{}' may not write channel '{channel}'",
            spec.name
        ),
    )))
}

fn push_send(
    spec: &NodeSpec,
    topology: &GraphTopology,
    writes: &mut Vec<(String, Value)>,
    packet: SendPacket,
) -> Result<()> {
    if !topology.has_node(&packet.node) {
        return Err(GraphError::Execution(format!(
            "node '{}' targeted unknown node '{}'",
            spec.name, packet.node
        )));
    }
    writes.push((
        reserved::TASKS.to_string(),
        serde_json::to_value(&packet)?,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeContext};
    use crate::pregel::types::TaskPath;
    use std::collections::HashSet;

    fn topology(nodes: &[&str], channels: &[&str]) -> Arc<GraphTopology> {
        let node_names: HashSet<String> = nodes.iter().map(|s| s.to_string()).collect();
        let mut channel_names: HashSet<String> = channels.iter().map(|s| s.to_string()).collect();
        channel_names.extend(node_names.iter().cloned());
        Arc::new(GraphTopology {
            node_names,
            channel_names,
            branches: HashMap::new(),
        })
    }

    fn exec_task(name: &str, body: Arc<dyn crate::node::NodeBody>) -> ExecTask {
        ExecTask {
            task: Task {
                id: format!("task-{name}"),
                name: name.to_string(),
                input: serde_json::json!({}),
                triggers: vec![],
                path: TaskPath::Pull {
                    node: name.to_string(),
                },
            },
            spec: NodeSpec {
                name: name.to_string(),
                triggers: vec![],
                reads: vec!["x".to_string()],
                writes: vec!["x".to_string()],
                body,
                retry_policy: None,
            },
            resumes: Arc::new(vec![]),
        }
    }

    fn runner() -> SuperstepRunner {
        SuperstepRunner {
            fail_fast: true,
            step_timeout: None,
            default_retry: None,
        }
    }

    #[tokio::test]
    async fn test_completed_task_writes_and_self_trigger() {
        let body = node_fn(|_input, _ctx| async move {
            NodeOutput::update_value(serde_json::json!({"x": 1}))
        });
        let output = runner()
            .run(0, vec![exec_task("a", body)], topology(&["a"], &["x"]))
            .await;

        assert!(output.error.is_none());
        assert_eq!(output.outcomes.len(), 1);
        let outcome = &output.outcomes[0];
        assert!(outcome.is_completed());
        assert_eq!(
            outcome.writes,
            vec![
                ("x".to_string(), serde_json::json!(1)),
                ("a".to_string(), Value::Null),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_writes_marker() {
        let body = node_fn(|_input, _ctx| async move { Ok(NodeOutput::empty()) });
        let output = runner()
            .run(0, vec![exec_task("a", body)], topology(&[], &["x"]))
            .await;

        let outcome = &output.outcomes[0];
        // node "a" has no node channel in this topology, so nothing at all
        // was written and the marker records completion
        assert_eq!(
            outcome.writes,
            vec![(reserved::NO_WRITES.to_string(), Value::Null)]
        );
    }

    #[tokio::test]
    async fn test_write_to_foreign_channel_is_invalid() {
        let body = node_fn(|_input, _ctx| async move {
            NodeOutput::update_value(serde_json::json!({"other_channel": 1}))
        });
        let output = runner()
            .run(
                0,
                vec![exec_task("a", body)],
                topology(&["a"], &["x", "other_channel"]),
            )
            .await;

        assert!(matches!(
            output.outcomes[0].result,
            TaskRunResult::Failed(_)
        ));
        assert!(output.error.is_some());
    }

    #[tokio::test]
    async fn test_managed_write_passes_through() {
        let body = node_fn(|_input, _ctx| async move {
            NodeOutput::update_value(serde_json::json!({"not_a_channel": 1}))
        });
        let output = runner()
            .run(0, vec![exec_task("a", body)], topology(&["a"], &["x"]))
            .await;

        let outcome = &output.outcomes[0];
        assert!(outcome.is_completed());
        assert!(outcome
            .writes
            .iter()
            .any(|(chan, _)| chan == "not_a_channel"));
    }

    #[tokio::test]
    async fn test_goto_becomes_send_packet() {
        let body = node_fn(|_input, _ctx| async move {
            Ok(NodeOutput::goto(
                Some(serde_json::Map::from_iter([(
                    "x".to_string(),
                    serde_json::json!(5),
                )])),
                "b",
            ))
        });
        let output = runner()
            .run(0, vec![exec_task("a", body)], topology(&["a", "b"], &["x"]))
            .await;

        let outcome = &output.outcomes[0];
        assert!(outcome.is_completed());
        let send_write = outcome
            .writes
            .iter()
            .find(|(chan, _)| chan == reserved::TASKS)
            .expect("goto produces a queued send");
        let packet: SendPacket = serde_json::from_value(send_write.1.clone()).unwrap();
        assert_eq!(packet.node, "b");
        assert_eq!(packet.arg, serde_json::json!({"x": 5}));
        // explicit goto replaces static routing: no self-trigger write
        assert!(!outcome.writes.iter().any(|(chan, _)| chan == "a"));
    }

    #[tokio::test]
    async fn test_goto_unknown_node_fails() {
        let body = node_fn(|_input, _ctx| async move { Ok(NodeOutput::goto(None, "ghost")) });
        let output = runner()
            .run(0, vec![exec_task("a", body)], topology(&["a"], &["x"]))
            .await;

        assert!(matches!(
            output.outcomes[0].result,
            TaskRunResult::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_lets_siblings_finish() {
        let interrupting = node_fn(|_input, ctx: NodeContext| async move {
            ctx.interrupt(serde_json::json!("question"))?;
            Ok(NodeOutput::empty())
        });
        let writing = node_fn(|_input, _ctx| async move {
            NodeOutput::update_value(serde_json::json!({"x": 1}))
        });

        let output = runner()
            .run(
                0,
                vec![exec_task("asks", interrupting), exec_task("works", writing)],
                topology(&["asks", "works"], &["x"]),
            )
            .await;

        assert!(output.error.is_none());
        let interrupted = output
            .outcomes
            .iter()
            .find(|o| o.task.name == "asks")
            .unwrap();
        assert!(matches!(
            interrupted.result,
            TaskRunResult::Interrupted(_)
        ));
        let completed = output
            .outcomes
            .iter()
            .find(|o| o.task.name == "works")
            .unwrap();
        assert!(completed.is_completed());
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings() {
        let failing = node_fn(|_input, _ctx| async move {
            Err::<NodeOutput, _>(GraphError::Custom("fatal mistake".into()))
        });
        let slow = node_fn(|_input, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(NodeOutput::empty())
        });

        let start = std::time::Instant::now();
        let output = runner()
            .run(
                0,
                vec![exec_task("bad", failing), exec_task("slow", slow)],
                topology(&["bad", "slow"], &["x"]),
            )
            .await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(output.error.is_some());
        let cancelled = output
            .outcomes
            .iter()
            .find(|o| o.task.name == "slow")
            .unwrap();
        assert!(matches!(cancelled.result, TaskRunResult::Cancelled));
    }

    #[tokio::test]
    async fn test_step_timeout() {
        let slow = node_fn(|_input, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(NodeOutput::empty())
        });

        let runner = SuperstepRunner {
            fail_fast: true,
            step_timeout: Some(Duration::from_millis(20)),
            default_retry: None,
        };
        let output = runner
            .run(0, vec![exec_task("slow", slow)], topology(&["slow"], &[]))
            .await;

        assert!(matches!(output.error, Some(GraphError::Timeout { .. })));
        assert!(matches!(
            output.outcomes[0].result,
            TaskRunResult::Cancelled
        ));
    }
}
