//! Reading channel values into node inputs and run outputs

use crate::error::Result;
use crate::graph::GraphTopology;
use crate::pregel::types::{NodeSpec, START};
use serde_json::Value;
use std::collections::HashMap;
use stepgraph_checkpoint::Channel;

/// Build a node's input snapshot from its read channels.
///
/// Empty channels are simply omitted: a required trigger is known to be
/// available by the time this runs, and optional reads that have never
/// been written just don't appear in the snapshot.
pub fn read_node_input(
    spec: &NodeSpec,
    channels: &HashMap<String, Box<dyn Channel>>,
) -> Result<Value> {
    let mut snapshot = serde_json::Map::new();
    for name in &spec.reads {
        if let Some(channel) = channels.get(name) {
            if channel.is_available() {
                snapshot.insert(name.clone(), channel.get()?);
            }
        }
    }
    Ok(Value::Object(snapshot))
}

/// Turn graph input into the initial set of channel writes.
///
/// The whole input value lands on the entry channel so entry nodes
/// trigger; object fields matching declared state channels seed those
/// channels directly.
pub fn map_input_writes(
    input: &Value,
    channels: &HashMap<String, Box<dyn Channel>>,
    topology: &GraphTopology,
) -> Vec<(String, Value)> {
    let mut writes = vec![(START.to_string(), input.clone())];
    if let Value::Object(map) = input {
        for (key, value) in map {
            if channels.contains_key(key) && topology.is_state_channel(key) {
                writes.push((key.clone(), value.clone()));
            }
        }
    }
    writes
}

/// Read the externally visible run state: every available declared state
/// channel, excluding engine bookkeeping (entry/node/branch channels).
pub fn read_state(
    channels: &HashMap<String, Box<dyn Channel>>,
    topology: &GraphTopology,
) -> Value {
    let mut state = serde_json::Map::new();
    let mut names: Vec<&String> = channels.keys().collect();
    names.sort();
    for name in names {
        if !topology.is_state_channel(name) {
            continue;
        }
        let channel = &channels[name];
        if channel.is_available() {
            if let Ok(value) = channel.get() {
                state.insert(name.clone(), value);
            }
        }
    }
    Value::Object(state)
}
