//! Core scheduling and write-application algorithms
//!
//! The two functions here are the heart of the superstep model:
//!
//! [`prepare_next_tasks`] decides what runs next. A **push task** is
//! materialized for every packet queued in the checkpoint's pending
//! sends, addressed to its target regardless of channel state. A **pull
//! task** is materialized for every node with at least one trigger
//! channel whose version advanced past the node's versions-seen mark and
//! which is non-empty. Task ids are content-derived, so preparing the
//! same checkpoint twice yields identical ids.
//!
//! [`apply_writes`] commits one superstep's results:
//!
//! ```text
//!   versions_seen ◄── record trigger versions per task
//!        │
//!   consume ◄──────── drain every distinct trigger channel, bump on change
//!        │
//!   pending_sends ◄── clear (holds exactly one superstep's worth),
//!        │             then refill from this step's send writes
//!   group writes ◄─── by destination channel, in deterministic task order
//!        │             (unknown names separated out as managed writes)
//!   update ◄────────── channel.update(values), bump version on change
//!        │
//!   step boundary ◄── untouched channels get update([]) so ephemeral
//!        │             and barrier channels observe the step
//!   finish ◄────────── when nothing updated triggers a node
//! ```
//!
//! Version bumps happen in two waves off the current maximum: channels
//! consumed this step get `max+1`, channels written get `max+2` relative
//! to the pre-step maximum. Versions are strictly increasing on change
//! and never decrease.

use crate::error::Result;
use crate::io::read_node_input;
use crate::pregel::types::{reserved, task_id, NodeSpec, Task, TaskPath, TaskWrites, PULL, PUSH};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use stepgraph_checkpoint::{increment, Channel, ChannelVersion, Checkpoint, SendPacket};

/// Compute the set of tasks due for the next superstep.
///
/// Returns a map keyed by deterministic task id; identical due work
/// hashes to the identical id, so re-scheduling is idempotent. An empty
/// map means the run is terminal for this step.
pub fn prepare_next_tasks(
    checkpoint: &Checkpoint,
    nodes: &HashMap<String, NodeSpec>,
    channels: &HashMap<String, Box<dyn Channel>>,
    step: usize,
    namespace: &str,
) -> Result<BTreeMap<String, Task>> {
    let mut tasks = BTreeMap::new();

    // push tasks: one per queued packet, regardless of channel state
    for (index, packet) in checkpoint.pending_sends.iter().enumerate() {
        if !nodes.contains_key(&packet.node) {
            tracing::warn!(node = %packet.node, "ignoring send to unknown node");
            continue;
        }
        let id = task_id(
            &checkpoint.id,
            namespace,
            step,
            &packet.node,
            PUSH,
            &[index.to_string()],
        );
        tasks.insert(
            id.clone(),
            Task {
                id,
                name: packet.node.clone(),
                input: packet.arg.clone(),
                triggers: vec![PUSH.to_string()],
                path: TaskPath::Push { index },
            },
        );
    }

    // pull tasks: nodes whose subscribed channels advanced
    let null_version = checkpoint.null_version();
    let mut names: Vec<&String> = nodes.keys().collect();
    names.sort();

    for name in names {
        let spec = &nodes[name];
        // a node with zero subscriptions is never scheduled
        if spec.triggers.is_empty() {
            continue;
        }
        let seen = checkpoint.versions_seen.get(name);
        let mut triggers: Vec<String> = spec
            .triggers
            .iter()
            .filter(|chan| {
                let Some(channel) = channels.get(chan.as_str()) else {
                    return false;
                };
                // an empty trigger channel means "not yet ready", not an error
                if !channel.is_available() {
                    return false;
                }
                let current = checkpoint
                    .channel_versions
                    .get(chan.as_str())
                    .unwrap_or(&null_version);
                let last_seen = seen
                    .and_then(|s| s.get(chan.as_str()))
                    .unwrap_or(&null_version);
                current > last_seen
            })
            .cloned()
            .collect();

        if triggers.is_empty() {
            continue;
        }
        triggers.sort();

        let input = read_node_input(spec, channels)?;
        let id = task_id(&checkpoint.id, namespace, step, name, PULL, &triggers);
        tasks.insert(
            id.clone(),
            Task {
                id,
                name: name.clone(),
                input,
                triggers,
                path: TaskPath::Pull { node: name.clone() },
            },
        );
    }

    Ok(tasks)
}

/// Result of applying one superstep's writes
#[derive(Debug, Default)]
pub struct AppliedWrites {
    /// Channels that changed (written, cleared or finished) and are
    /// still readable
    pub updated_channels: HashSet<String>,
    /// Writes to names that are not declared channels, returned to the
    /// caller for externally-managed state
    pub managed: HashMap<String, Vec<Value>>,
}

fn next_version(checkpoint: &Checkpoint) -> ChannelVersion {
    let max = checkpoint.channel_versions.values().max().cloned();
    increment(max.as_ref())
}

/// Merge all task writes for a completed superstep into the channels,
/// bump versions, and separate out externally-managed writes.
pub fn apply_writes(
    checkpoint: &mut Checkpoint,
    channels: &mut HashMap<String, Box<dyn Channel>>,
    mut tasks: Vec<TaskWrites>,
    trigger_to_nodes: &HashMap<String, Vec<String>>,
) -> Result<AppliedWrites> {
    // deterministic application order
    tasks.sort_by(|a, b| (&a.path, &a.name).cmp(&(&b.path, &b.name)));

    let bump_step = tasks.iter().any(|t| !t.triggers.is_empty());

    // record the versions each task reacted to
    for task in &tasks {
        let seen = checkpoint
            .versions_seen
            .entry(task.name.clone())
            .or_default();
        for chan in &task.triggers {
            if let Some(version) = checkpoint.channel_versions.get(chan) {
                seen.insert(chan.clone(), version.clone());
            }
        }
    }

    // consume every distinct trigger channel
    let consume_version = next_version(checkpoint);
    let trigger_chans: BTreeSet<String> = tasks
        .iter()
        .flat_map(|t| t.triggers.iter())
        .filter(|chan| !reserved::is_reserved(chan) && *chan != PUSH)
        .cloned()
        .collect();
    for chan in trigger_chans {
        if let Some(channel) = channels.get_mut(&chan) {
            if channel.consume() {
                checkpoint
                    .channel_versions
                    .insert(chan, consume_version.clone());
            }
        }
    }

    // pending sends only ever hold one superstep's worth
    checkpoint.pending_sends.clear();

    // group writes by destination
    let mut by_channel: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    let mut managed: HashMap<String, Vec<Value>> = HashMap::new();
    for task in &tasks {
        for (chan, value) in &task.writes {
            if chan == reserved::NO_WRITES {
                continue;
            }
            if chan == reserved::TASKS {
                match serde_json::from_value::<SendPacket>(value.clone()) {
                    Ok(packet) => checkpoint.pending_sends.push(packet),
                    Err(error) => {
                        tracing::warn!(%error, task = %task.name, "ignoring malformed send packet")
                    }
                }
                continue;
            }
            if reserved::is_reserved(chan) {
                continue;
            }
            if channels.contains_key(chan) {
                by_channel.entry(chan.clone()).or_default().push(value.clone());
            } else {
                managed.entry(chan.clone()).or_default().push(value.clone());
            }
        }
    }

    // apply grouped writes
    let write_version = next_version(checkpoint);
    let mut updated = HashSet::new();
    for (chan, values) in by_channel {
        let channel = channels
            .get_mut(&chan)
            .expect("writes were grouped by existing channel");
        if channel.update(values)? {
            checkpoint
                .channel_versions
                .insert(chan.clone(), write_version.clone());
        }
        if channel.is_available() {
            updated.insert(chan);
        }
    }

    // untouched channels observe the step boundary
    if bump_step {
        let untouched: Vec<String> = channels
            .keys()
            .filter(|chan| !updated.contains(*chan))
            .cloned()
            .collect();
        for chan in untouched {
            let channel = channels.get_mut(&chan).expect("iterating existing channels");
            if channel.update(vec![])? {
                checkpoint
                    .channel_versions
                    .insert(chan.clone(), write_version.clone());
                if channel.is_available() {
                    updated.insert(chan);
                }
            }
        }
    }

    // tentatively the last superstep: let channels finalize
    if bump_step {
        let triggers_any = updated
            .iter()
            .any(|chan| trigger_to_nodes.get(chan).is_some_and(|nodes| !nodes.is_empty()));
        if !triggers_any {
            for (chan, channel) in channels.iter_mut() {
                if channel.finish() {
                    checkpoint
                        .channel_versions
                        .insert(chan.clone(), write_version.clone());
                    if channel.is_available() {
                        updated.insert(chan.clone());
                    }
                }
            }
        }
    }

    let mut updated_list: Vec<String> = updated.iter().cloned().collect();
    updated_list.sort();
    checkpoint.updated_channels = Some(updated_list);

    Ok(AppliedWrites {
        updated_channels: updated,
        managed,
    })
}
