//! Graph construction, validation and compilation
//!
//! [`GraphBuilder`] declares named nodes, state channels, static edges and
//! conditional branches, then compiles them into an executable
//! [`CompiledGraph`](crate::compiled::CompiledGraph). All structural
//! validation happens once at compile time; a graph that compiles cannot
//! hit a dangling reference at runtime.
//!
//! # Wiring model
//!
//! Everything is expressed as channel subscriptions:
//!
//! - a static edge `a -> b` subscribes `b` to `a`'s node channel, an
//!   ephemeral channel written with a sentinel when `a` completes;
//! - the entry edge `__start__ -> n` subscribes `n` to the entry channel,
//!   written once with the graph input;
//! - a conditional branch with a routing table compiles into one
//!   ephemeral decision channel per (source, target) pair - the router's
//!   verdict is a write to the chosen decision channel, so fan-out to
//!   several candidate nodes is uniform channel traffic;
//! - a branch without a routing table cannot be wired statically, so its
//!   verdicts travel as queued send packets instead (push tasks). For
//!   validation, such a branch is assumed able to reach every node and
//!   the exit.
//!
//! Routing tables are explicit. The router returns a key; the table maps
//! keys to node names or the `__end__` token. There is no inference from
//! router signatures.

use crate::error::{GraphError, Result};
use crate::node::NodeBody;
use crate::pregel::types::{NodeSpec, END, START};
use crate::retry::RetryPolicy;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use stepgraph_checkpoint::{Channel, EphemeralValueChannel, SendPacket};

/// Name prefix for branch decision channels
pub const BRANCH_PREFIX: &str = "branch:";

/// Verdict returned by a branch router
#[derive(Debug, Clone, PartialEq)]
pub enum RouterResult {
    /// Route to one key (resolved through the routing table when present)
    Node(String),
    /// Fan out to several keys
    Nodes(Vec<String>),
    /// Stop routing from this branch
    End,
    /// Dynamic push targets with explicit payloads
    Sends(Vec<SendPacket>),
}

/// Router function evaluated against the node's effective output state
pub type RouterFn = Arc<dyn Fn(&Value) -> RouterResult + Send + Sync>;

struct Branch {
    router: RouterFn,
    path_map: Option<HashMap<String, String>>,
}

/// A branch bound to its decision channels
#[derive(Clone)]
pub struct CompiledBranch {
    pub source: String,
    router: RouterFn,
    path_map: Option<HashMap<String, String>>,
    /// target node -> decision channel (only for routing-table branches)
    channels: HashMap<String, String>,
}

impl CompiledBranch {
    /// Resolve a router key to a target node, `None` meaning the end token
    pub fn resolve(&self, key: &str) -> Result<Option<String>> {
        let target = match &self.path_map {
            Some(map) => map
                .get(key)
                .ok_or_else(|| {
                    GraphError::Execution(format!(
                        "router for '{}' returned unmapped key '{key}'",
                        self.source
                    ))
                })?
                .clone(),
            None => key.to_string(),
        };
        if target == END {
            Ok(None)
        } else {
            Ok(Some(target))
        }
    }

    /// Decision channel wired for a target, if this branch has one
    pub fn channel_for(&self, target: &str) -> Option<&String> {
        self.channels.get(target)
    }

    /// Evaluate the router against the effective state
    pub fn route(&self, state: &Value) -> RouterResult {
        (self.router)(state)
    }
}

impl fmt::Debug for CompiledBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledBranch")
            .field("source", &self.source)
            .field("path_map", &self.path_map)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Static shape of a compiled graph, shared across invocations
#[derive(Debug, Default)]
pub struct GraphTopology {
    pub node_names: HashSet<String>,
    pub channel_names: HashSet<String>,
    pub branches: HashMap<String, Vec<CompiledBranch>>,
}

impl GraphTopology {
    /// Whether a channel name is user-visible state (not an engine
    /// bookkeeping channel)
    pub fn is_state_channel(&self, name: &str) -> bool {
        !name.starts_with("__")
            && !name.starts_with(BRANCH_PREFIX)
            && !self.node_names.contains(name)
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.node_names.contains(name)
    }
}

/// Declarative graph under construction
pub struct GraphBuilder {
    channels: HashMap<String, Box<dyn Channel>>,
    nodes: HashMap<String, Arc<dyn NodeBody>>,
    retry: HashMap<String, RetryPolicy>,
    edges: BTreeSet<(String, String)>,
    branches: HashMap<String, Vec<Branch>>,
    subscriptions: HashMap<String, BTreeSet<String>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            channels: HashMap::new(),
            nodes: HashMap::new(),
            retry: HashMap::new(),
            edges: BTreeSet::new(),
            branches: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Declare a state channel
    pub fn add_channel(&mut self, name: impl Into<String>, channel: Box<dyn Channel>) -> &mut Self {
        self.channels.insert(name.into(), channel);
        self
    }

    /// Declare a named node
    pub fn add_node(&mut self, name: impl Into<String>, body: Arc<dyn NodeBody>) -> &mut Self {
        self.nodes.insert(name.into(), body);
        self
    }

    /// Attach a retry policy to a declared node
    pub fn with_node_retry(&mut self, name: impl Into<String>, policy: RetryPolicy) -> &mut Self {
        self.retry.insert(name.into(), policy);
        self
    }

    /// Declare a static edge between nodes (or the start/end sentinels)
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.insert((from.into(), to.into()));
        self
    }

    /// Declare a conditional branch from a node.
    ///
    /// The router is evaluated against the node's effective output state;
    /// with `path_map` its key is looked up in the table, otherwise the
    /// key must itself name a node or the end token.
    pub fn add_conditional_edges<F>(
        &mut self,
        from: impl Into<String>,
        router: F,
        path_map: Option<HashMap<String, String>>,
    ) -> &mut Self
    where
        F: Fn(&Value) -> RouterResult + Send + Sync + 'static,
    {
        self.branches.entry(from.into()).or_default().push(Branch {
            router: Arc::new(router),
            path_map,
        });
        self
    }

    /// Subscribe a node directly to a state channel.
    ///
    /// The node triggers whenever the channel's version advances -
    /// regardless of which node (or the graph input) wrote it. This is
    /// how barrier fan-ins are wired: contributors write the barrier
    /// channel, the join node subscribes to it and only triggers once the
    /// barrier releases. For connectivity validation a subscribed node is
    /// treated as reachable from the start and from any writer.
    pub fn add_subscription(
        &mut self,
        node: impl Into<String>,
        channel: impl Into<String>,
    ) -> &mut Self {
        self.subscriptions
            .entry(node.into())
            .or_default()
            .insert(channel.into());
        self
    }

    /// Sugar for `add_edge(START, node)`
    pub fn set_entry_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.add_edge(START, node)
    }

    /// Sugar for `add_edge(node, END)`
    pub fn set_finish_point(&mut self, node: impl Into<String>) -> &mut Self {
        self.add_edge(node, END)
    }

    fn validate(&self) -> Result<()> {
        for name in self.nodes.keys() {
            if name.is_empty() {
                return Err(GraphError::Validation("node name may not be empty".into()));
            }
            if name.starts_with("__") || name.starts_with(BRANCH_PREFIX) {
                return Err(GraphError::Validation(format!(
                    "node name '{name}' collides with a reserved prefix"
                )));
            }
            if self.channels.contains_key(name) {
                return Err(GraphError::Validation(format!(
                    "node '{name}' collides with a channel of the same name"
                )));
            }
        }

        for name in self.channels.keys() {
            if name.is_empty() || name.starts_with("__") || name.starts_with(BRANCH_PREFIX) {
                return Err(GraphError::Validation(format!(
                    "channel name '{name}' is reserved"
                )));
            }
        }

        for (from, to) in &self.edges {
            if from == END {
                return Err(GraphError::Validation(
                    "__end__ cannot be an edge source".into(),
                ));
            }
            if to == START {
                return Err(GraphError::Validation(
                    "__start__ cannot be an edge target".into(),
                ));
            }
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' is not a declared node"
                )));
            }
            if to != END && !self.nodes.contains_key(to) {
                return Err(GraphError::Validation(format!(
                    "edge target '{to}' is not a declared node"
                )));
            }
        }

        for (source, branches) in &self.branches {
            if !self.nodes.contains_key(source) {
                return Err(GraphError::Validation(format!(
                    "conditional edge source '{source}' is not a declared node"
                )));
            }
            for branch in branches {
                if let Some(map) = &branch.path_map {
                    for target in map.values() {
                        if target != END && !self.nodes.contains_key(target) {
                            return Err(GraphError::Validation(format!(
                                "conditional edge target '{target}' is not a declared node"
                            )));
                        }
                    }
                }
            }
        }

        for (node, channels) in &self.subscriptions {
            if !self.nodes.contains_key(node) {
                return Err(GraphError::Validation(format!(
                    "subscription node '{node}' is not a declared node"
                )));
            }
            for channel in channels {
                if !self.channels.contains_key(channel) {
                    return Err(GraphError::Validation(format!(
                        "subscription channel '{channel}' is not a declared channel"
                    )));
                }
            }
        }

        self.validate_connectivity()
    }

    /// Every node must be reachable from START and have a path to END.
    fn validate_connectivity(&self) -> Result<()> {
        fn insert_edge<'a>(
            map: &mut HashMap<&'a str, BTreeSet<&'a str>>,
            from: &'a str,
            to: &'a str,
        ) {
            map.entry(from).or_default().insert(to);
        }

        let mut forward: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for (from, to) in &self.edges {
            insert_edge(&mut forward, from.as_str(), to.as_str());
        }
        for (source, branches) in &self.branches {
            for branch in branches {
                match &branch.path_map {
                    Some(map) => {
                        for target in map.values() {
                            insert_edge(&mut forward, source.as_str(), target.as_str());
                        }
                    }
                    None => {
                        // without a routing table the branch may reach anything
                        for node in self.nodes.keys() {
                            insert_edge(&mut forward, source.as_str(), node.as_str());
                        }
                        insert_edge(&mut forward, source.as_str(), END);
                    }
                }
            }
        }

        // a channel subscriber can be triggered by any writer, or by the
        // graph input seeding the channel
        for subscriber in self.subscriptions.keys() {
            insert_edge(&mut forward, START, subscriber.as_str());
            for writer in self.nodes.keys() {
                if writer != subscriber {
                    insert_edge(&mut forward, writer.as_str(), subscriber.as_str());
                }
            }
        }

        let reachable = bfs(&forward, START);
        for name in self.nodes.keys() {
            if !reachable.contains(name.as_str()) {
                return Err(GraphError::Validation(format!(
                    "node '{name}' is not reachable from {START}"
                )));
            }
        }

        let mut backward: HashMap<&str, BTreeSet<&str>> = HashMap::new();
        for (from, targets) in &forward {
            for to in targets {
                insert_edge(&mut backward, to, from);
            }
        }
        let finishing = bfs(&backward, END);
        for name in self.nodes.keys() {
            if !finishing.contains(name.as_str()) {
                return Err(GraphError::Validation(format!(
                    "node '{name}' has no path to {END}"
                )));
            }
        }

        Ok(())
    }

    /// Validate and bind the graph into its executable form.
    pub fn compile(self) -> Result<crate::compiled::CompiledGraph> {
        self.validate()?;

        let user_channels: Vec<String> = {
            let mut names: Vec<String> = self.channels.keys().cloned().collect();
            names.sort();
            names
        };

        let mut channels = self.channels;
        channels.insert(
            START.to_string(),
            Box::new(EphemeralValueChannel::unguarded()),
        );
        for name in self.nodes.keys() {
            channels.insert(name.clone(), Box::new(EphemeralValueChannel::unguarded()));
        }

        // branch decision channels, one per mapped (source, target) pair
        let mut compiled_branches: HashMap<String, Vec<CompiledBranch>> = HashMap::new();
        for (source, branch_list) in self.branches {
            for branch in branch_list {
                let mut channel_map = HashMap::new();
                if let Some(map) = &branch.path_map {
                    let targets: BTreeSet<&String> =
                        map.values().filter(|t| t.as_str() != END).collect();
                    for target in targets {
                        let channel_name = format!("{BRANCH_PREFIX}{source}:{target}");
                        channels
                            .entry(channel_name.clone())
                            .or_insert_with(|| Box::new(EphemeralValueChannel::unguarded()));
                        channel_map.insert(target.clone(), channel_name);
                    }
                }
                compiled_branches
                    .entry(source.clone())
                    .or_default()
                    .push(CompiledBranch {
                        source: source.clone(),
                        router: branch.router,
                        path_map: branch.path_map,
                        channels: channel_map,
                    });
            }
        }

        // bind each node to its trigger channels
        let mut triggers_by_node: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (from, to) in &self.edges {
            if to == END {
                continue;
            }
            let channel = if from == START {
                START.to_string()
            } else {
                from.clone()
            };
            triggers_by_node
                .get_mut(to)
                .expect("validated edge target")
                .insert(channel);
        }
        for branches in compiled_branches.values() {
            for branch in branches {
                for (target, channel) in &branch.channels {
                    triggers_by_node
                        .get_mut(target)
                        .expect("validated branch target")
                        .insert(channel.clone());
                }
            }
        }
        for (node, subscribed) in &self.subscriptions {
            triggers_by_node
                .get_mut(node)
                .expect("validated subscription node")
                .extend(subscribed.iter().cloned());
        }

        let mut specs = HashMap::new();
        for (name, body) in self.nodes {
            let triggers: Vec<String> = triggers_by_node
                .remove(&name)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default();
            specs.insert(
                name.clone(),
                NodeSpec {
                    retry_policy: self.retry.get(&name).cloned(),
                    name,
                    triggers,
                    reads: user_channels.clone(),
                    writes: user_channels.clone(),
                    body,
                },
            );
        }

        let mut trigger_to_nodes: HashMap<String, Vec<String>> = HashMap::new();
        for spec in specs.values() {
            for trigger in &spec.triggers {
                trigger_to_nodes
                    .entry(trigger.clone())
                    .or_default()
                    .push(spec.name.clone());
            }
        }
        for nodes in trigger_to_nodes.values_mut() {
            nodes.sort();
        }

        let topology = GraphTopology {
            node_names: specs.keys().cloned().collect(),
            channel_names: channels.keys().cloned().collect(),
            branches: compiled_branches,
        };

        Ok(crate::compiled::CompiledGraph::new(
            specs,
            channels,
            Arc::new(topology),
            trigger_to_nodes,
        ))
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn bfs<'a>(adjacency: &HashMap<&'a str, BTreeSet<&'a str>>, from: &'a str) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([from]);
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = adjacency.get(current) {
            queue.extend(next.iter().copied());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{node_fn, NodeOutput};
    use stepgraph_checkpoint::LastValueChannel;

    fn noop() -> Arc<dyn NodeBody> {
        node_fn(|_input, _ctx| async move { Ok(NodeOutput::empty()) })
    }

    fn two_node_builder() -> GraphBuilder {
        let mut builder = GraphBuilder::new();
        builder
            .add_channel("x", Box::new(LastValueChannel::new()))
            .add_node("a", noop())
            .add_node("b", noop())
            .set_entry_point("a")
            .add_edge("a", "b")
            .set_finish_point("b");
        builder
    }

    #[test]
    fn test_compile_two_node_graph() {
        let compiled = two_node_builder().compile().unwrap();
        let spec_b = compiled.node_spec("b").unwrap();
        assert_eq!(spec_b.triggers, vec!["a".to_string()]);
        let spec_a = compiled.node_spec("a").unwrap();
        assert_eq!(spec_a.triggers, vec![START.to_string()]);
        assert_eq!(spec_a.reads, vec!["x".to_string()]);
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("a", noop())
            .set_entry_point("a")
            .add_edge("a", "ghost")
            .set_finish_point("a");

        let error = builder.compile().unwrap_err();
        assert!(matches!(error, GraphError::Validation(_)));
    }

    #[test]
    fn test_unreachable_node_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("a", noop())
            .add_node("island", noop())
            .set_entry_point("a")
            .set_finish_point("a")
            .set_finish_point("island");

        let error = builder.compile().unwrap_err();
        match error {
            GraphError::Validation(msg) => assert!(msg.contains("island")),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_node_without_exit_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("a", noop())
            .add_node("sink", noop())
            .set_entry_point("a")
            .add_edge("a", "sink")
            .set_finish_point("a");

        let error = builder.compile().unwrap_err();
        match error {
            GraphError::Validation(msg) => assert!(msg.contains("sink")),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_reserved_node_name_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("__secret__", noop())
            .set_entry_point("__secret__")
            .set_finish_point("__secret__");

        assert!(matches!(
            builder.compile().unwrap_err(),
            GraphError::Validation(_)
        ));
    }

    #[test]
    fn test_node_channel_collision_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_channel("a", Box::new(LastValueChannel::new()))
            .add_node("a", noop())
            .set_entry_point("a")
            .set_finish_point("a");

        assert!(matches!(
            builder.compile().unwrap_err(),
            GraphError::Validation(_)
        ));
    }

    #[test]
    fn test_conditional_edges_compile_to_decision_channels() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("router", noop())
            .add_node("left", noop())
            .add_node("right", noop())
            .set_entry_point("router")
            .add_conditional_edges(
                "router",
                |_state| RouterResult::Node("go_left".into()),
                Some(HashMap::from([
                    ("go_left".to_string(), "left".to_string()),
                    ("go_right".to_string(), "right".to_string()),
                    ("stop".to_string(), END.to_string()),
                ])),
            )
            .set_finish_point("left")
            .set_finish_point("right");

        let compiled = builder.compile().unwrap();
        let left = compiled.node_spec("left").unwrap();
        assert_eq!(left.triggers, vec!["branch:router:left".to_string()]);
        let right = compiled.node_spec("right").unwrap();
        assert_eq!(right.triggers, vec!["branch:router:right".to_string()]);
    }

    #[test]
    fn test_conditional_edges_unknown_mapped_target_rejected() {
        let mut builder = GraphBuilder::new();
        builder
            .add_node("router", noop())
            .set_entry_point("router")
            .add_conditional_edges(
                "router",
                |_state| RouterResult::End,
                Some(HashMap::from([("key".to_string(), "ghost".to_string())])),
            );

        assert!(matches!(
            builder.compile().unwrap_err(),
            GraphError::Validation(_)
        ));
    }

    #[test]
    fn test_mapping_less_branch_satisfies_connectivity() {
        let mut builder = GraphBuilder::new();
        builder.add_node("a", noop()).set_entry_point("a");
        builder.add_conditional_edges("a", |_state| RouterResult::End, None);

        // no static finish edge, but the open branch may reach END
        assert!(builder.compile().is_ok());
    }
}
