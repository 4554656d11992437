//! Core checkpoint data structures for state persistence
//!
//! A **checkpoint** is an immutable snapshot of all channel state plus the
//! scheduling metadata the engine needs to decide what runs next:
//!
//! - **channel_values** - serialized snapshot of every non-empty channel
//! - **channel_versions** - monotonically increasing version per channel
//! - **versions_seen** - per-node high-water-mark of versions already
//!   reacted to (a node is due again once any trigger channel's version
//!   exceeds its mark)
//! - **pending_sends** - push messages queued by the previous superstep,
//!   consumed and cleared by the next one
//!
//! Checkpoint ids are lexicographically sortable (wall-clock time plus a
//! process-local sequence counter), so the latest checkpoint of a thread is
//! always the greatest id and history listings sort naturally.
//!
//! # Invariants
//!
//! - `channel_versions[c]` never decreases for any channel `c`.
//! - `versions_seen[n][c] <= channel_versions[c]` for every node `n`.
//! - A persisted checkpoint is never mutated; new state means a new
//!   checkpoint with a recorded parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Checkpoint ID type
pub type CheckpointId = String;

/// Reserved write-channel names and their store indices.
///
/// Ordinary task writes are keyed by their position in the write list;
/// marker writes use negative indices so they can never collide with a
/// real write at the same position.
pub mod reserved {
    /// Marker recorded when a task finished with zero writes.
    pub const NO_WRITES: &str = "__no_writes__";
    /// Destination for push packets; moved into `pending_sends` on apply.
    pub const TASKS: &str = "__pregel_tasks__";
    /// Terminal error recorded for a task whose retries were exhausted.
    pub const ERROR: &str = "__error__";
    /// Input + identity of a task that must re-run on resume.
    pub const SCHEDULED: &str = "__scheduled__";
    /// Interrupt payload raised by a suspended task.
    pub const INTERRUPT: &str = "__interrupt__";
    /// Resume values supplied by the caller, consumed positionally.
    pub const RESUME: &str = "__resume__";

    /// Store index for a reserved write channel, if it has one.
    pub fn write_index(channel: &str) -> Option<i64> {
        match channel {
            ERROR => Some(-1),
            SCHEDULED => Some(-2),
            INTERRUPT => Some(-3),
            RESUME => Some(-4),
            _ => None,
        }
    }

    /// Whether a channel name is reserved for engine bookkeeping.
    pub fn is_reserved(channel: &str) -> bool {
        matches!(
            channel,
            NO_WRITES | TASKS | ERROR | SCHEDULED | INTERRUPT | RESUME
        )
    }
}

static CHECKPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a new lexicographically sortable checkpoint id.
///
/// Sixteen hex digits of microseconds since the epoch followed by four hex
/// digits of a wrapping sequence counter. Ids created later in the same
/// process always sort after earlier ones.
pub fn next_checkpoint_id() -> CheckpointId {
    let micros = Utc::now().timestamp_micros().max(0) as u64;
    let seq = CHECKPOINT_SEQ.fetch_add(1, AtomicOrdering::Relaxed) & 0xffff;
    format!("{micros:016x}{seq:04x}")
}

/// Channel version - any monotonically comparable value
///
/// The default scheme is sequential integers; float and string variants
/// leave room for fractional or composite (timestamp-based) schemes in
/// distributed stores. Versions are totally ordered within a variant;
/// cross-variant comparison falls back to a stable variant order so sorting
/// never panics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelVersion {
    /// Sequential integer version (default)
    Int(i64),
    /// Floating-point version for fractional increments
    Float(f64),
    /// String-based version (timestamp, composite, etc.)
    String(String),
}

impl ChannelVersion {
    /// The zero value used when a node has not yet seen a channel.
    pub fn null_of(&self) -> ChannelVersion {
        match self {
            ChannelVersion::Int(_) => ChannelVersion::Int(0),
            ChannelVersion::Float(_) => ChannelVersion::Float(0.0),
            ChannelVersion::String(_) => ChannelVersion::String(String::new()),
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            ChannelVersion::Int(_) => 0,
            ChannelVersion::Float(_) => 1,
            ChannelVersion::String(_) => 2,
        }
    }
}

impl PartialEq for ChannelVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChannelVersion {}

impl PartialOrd for ChannelVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelVersion::Int(a), ChannelVersion::Int(b)) => a.cmp(b),
            (ChannelVersion::Float(a), ChannelVersion::Float(b)) => {
                a.partial_cmp(b).unwrap_or(Ordering::Equal)
            }
            (ChannelVersion::String(a), ChannelVersion::String(b)) => a.cmp(b),
            _ => self.variant_rank().cmp(&other.variant_rank()),
        }
    }
}

impl Default for ChannelVersion {
    fn default() -> Self {
        ChannelVersion::Int(0)
    }
}

/// Increment a channel version by one unit.
///
/// `None` yields the initial version `Int(1)`. String versions append a
/// numeric suffix when they do not parse as integers.
pub fn increment(current: Option<&ChannelVersion>) -> ChannelVersion {
    match current {
        Some(ChannelVersion::Int(v)) => ChannelVersion::Int(v + 1),
        Some(ChannelVersion::Float(v)) => ChannelVersion::Float(v + 1.0),
        Some(ChannelVersion::String(v)) => {
            if let Ok(num) = v.parse::<i64>() {
                ChannelVersion::String((num + 1).to_string())
            } else {
                ChannelVersion::String(format!("{v}.1"))
            }
        }
        None => ChannelVersion::Int(1),
    }
}

/// Mapping from channel name to version
pub type ChannelVersions = HashMap<String, ChannelVersion>;

/// A push message queued for a named target node.
///
/// Produced by a task in superstep N, consumed by the scheduler as a push
/// task in superstep N+1 regardless of channel state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPacket {
    /// Target node name
    pub node: String,
    /// Payload delivered as the target task's input
    pub arg: serde_json::Value,
}

impl SendPacket {
    pub fn new(node: impl Into<String>, arg: serde_json::Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }
}

/// Metadata source type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Checkpoint created from the input of an invocation
    Input,
    /// Checkpoint created from inside the superstep loop
    Loop,
    /// Checkpoint created from a manual state update
    Update,
    /// Checkpoint created as a copy of another checkpoint
    Fork,
}

/// Metadata associated with a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointMetadata {
    /// The source of the checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<CheckpointSource>,

    /// The step number of the checkpoint
    /// -1 for the first "input" checkpoint
    /// 0 for the first "loop" checkpoint
    /// n for the nth checkpoint afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Writes committed in the step that produced this checkpoint,
    /// keyed by node name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub writes: Option<HashMap<String, serde_json::Value>>,

    /// The IDs of the parent checkpoints
    /// Mapping from checkpoint namespace to checkpoint ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<HashMap<String, String>>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CheckpointMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: CheckpointSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_step(mut self, step: i64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_writes(mut self, writes: HashMap<String, serde_json::Value>) -> Self {
        self.writes = Some(writes);
        self
    }

    pub fn with_parents(mut self, parents: HashMap<String, String>) -> Self {
        self.parents = Some(parents);
        self
    }

    pub fn with_extra(mut self, key: String, value: serde_json::Value) -> Self {
        self.extra.insert(key, value);
        self
    }
}

/// State snapshot at a given point in the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The version of the checkpoint format (currently 1)
    pub v: i32,

    /// The ID of the checkpoint (unique and lexicographically increasing)
    pub id: CheckpointId,

    /// The timestamp of the checkpoint
    pub ts: DateTime<Utc>,

    /// Serialized channel snapshots at the time of the checkpoint
    pub channel_values: HashMap<String, serde_json::Value>,

    /// The versions of the channels at the time of the checkpoint
    pub channel_versions: ChannelVersions,

    /// Map from node name to map from channel name to version seen.
    /// A node is due again once any of its trigger channels carries a
    /// version greater than the one recorded here.
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Push messages queued by the previous superstep, not yet consumed
    #[serde(default)]
    pub pending_sends: Vec<SendPacket>,

    /// The channels that were updated in the step producing this checkpoint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_channels: Option<Vec<String>>,
}

impl Checkpoint {
    /// Current checkpoint format version
    pub const CURRENT_VERSION: i32 = 1;

    /// Create an empty checkpoint with a fresh id
    pub fn empty() -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: next_checkpoint_id(),
            ts: Utc::now(),
            channel_values: HashMap::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            pending_sends: Vec::new(),
            updated_channels: None,
        }
    }

    /// Derive the next checkpoint in the lineage: same scheduling state,
    /// fresh id and timestamp.
    pub fn next(&self) -> Self {
        Self {
            v: self.v,
            id: next_checkpoint_id(),
            ts: Utc::now(),
            channel_values: self.channel_values.clone(),
            channel_versions: self.channel_versions.clone(),
            versions_seen: self.versions_seen.clone(),
            pending_sends: self.pending_sends.clone(),
            updated_channels: self.updated_channels.clone(),
        }
    }

    /// The zero version matching this checkpoint's version scheme.
    pub fn null_version(&self) -> ChannelVersion {
        self.channel_versions
            .values()
            .next()
            .map(ChannelVersion::null_of)
            .unwrap_or_default()
    }

    /// The greatest version currently recorded for any channel.
    pub fn max_version(&self) -> Option<&ChannelVersion> {
        self.channel_versions.values().max()
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::empty()
    }
}

/// Configuration for checkpoint operations
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CheckpointConfig {
    /// Thread ID for grouping related checkpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,

    /// Specific checkpoint ID to retrieve
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<CheckpointId>,

    /// Checkpoint namespace (empty for the root graph)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_ns: Option<String>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            checkpoint_id: None,
            checkpoint_ns: None,
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<CheckpointId>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_checkpoint_ns(mut self, checkpoint_ns: impl Into<String>) -> Self {
        self.checkpoint_ns = Some(checkpoint_ns.into());
        self
    }

    /// Namespace, defaulting to the root namespace.
    pub fn namespace(&self) -> &str {
        self.checkpoint_ns.as_deref().unwrap_or("")
    }
}

/// A pending write recorded against a checkpoint:
/// (task_id, channel, value)
pub type PendingWrite = (String, String, serde_json::Value);

/// A checkpoint together with its configuration, metadata, lineage and
/// uncommitted writes
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    /// Configuration identifying this checkpoint
    pub config: CheckpointConfig,

    /// The checkpoint itself
    pub checkpoint: Checkpoint,

    /// Metadata associated with the checkpoint
    pub metadata: CheckpointMetadata,

    /// Parent configuration (if any)
    pub parent_config: Option<CheckpointConfig>,

    /// Writes recorded against this checkpoint but not yet applied,
    /// ordered by (task_id, write index)
    pub pending_writes: Vec<PendingWrite>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_creation() {
        let checkpoint = Checkpoint::empty();
        assert_eq!(checkpoint.v, Checkpoint::CURRENT_VERSION);
        assert!(checkpoint.channel_values.is_empty());
        assert!(checkpoint.channel_versions.is_empty());
        assert!(checkpoint.pending_sends.is_empty());
    }

    #[test]
    fn test_checkpoint_ids_sort_by_creation_order() {
        let ids: Vec<_> = (0..100).map(|_| next_checkpoint_id()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_checkpoint_next_gets_fresh_id() {
        let first = Checkpoint::empty();
        let second = first.next();
        assert_ne!(first.id, second.id);
        assert!(second.id > first.id);
        assert_eq!(first.channel_versions, second.channel_versions);
    }

    #[test]
    fn test_channel_version_comparison() {
        let v1 = ChannelVersion::Int(5);
        let v2 = ChannelVersion::Int(10);
        assert!(v1 < v2);
        assert!(v2 > v1);
        assert_eq!(v1, ChannelVersion::Int(5));
    }

    #[test]
    fn test_increment() {
        assert_eq!(
            increment(Some(&ChannelVersion::Int(5))),
            ChannelVersion::Int(6)
        );
        assert_eq!(increment(None), ChannelVersion::Int(1));
        assert_eq!(
            increment(Some(&ChannelVersion::String("10".to_string()))),
            ChannelVersion::String("11".to_string())
        );
    }

    #[test]
    fn test_checkpoint_null_version() {
        let mut cp = Checkpoint::empty();
        cp.channel_versions
            .insert("test".into(), ChannelVersion::Int(5));
        assert_eq!(cp.null_version(), ChannelVersion::Int(0));
    }

    #[test]
    fn test_reserved_write_indices() {
        assert_eq!(reserved::write_index(reserved::ERROR), Some(-1));
        assert_eq!(reserved::write_index(reserved::SCHEDULED), Some(-2));
        assert_eq!(reserved::write_index(reserved::INTERRUPT), Some(-3));
        assert_eq!(reserved::write_index(reserved::RESUME), Some(-4));
        assert_eq!(reserved::write_index("my_channel"), None);
        assert!(reserved::is_reserved(reserved::NO_WRITES));
        assert!(!reserved::is_reserved("my_channel"));
    }

    #[test]
    fn test_checkpoint_serde_round_trip() {
        let mut cp = Checkpoint::empty();
        cp.channel_values
            .insert("x".into(), serde_json::json!({"a": [1, 2, 3]}));
        cp.channel_versions.insert("x".into(), ChannelVersion::Int(3));
        cp.pending_sends
            .push(SendPacket::new("worker", serde_json::json!({"item": 1})));

        let json = serde_json::to_string(&cp).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(cp.id, restored.id);
        assert_eq!(cp.channel_values, restored.channel_values);
        assert_eq!(cp.channel_versions, restored.channel_versions);
        assert_eq!(cp.pending_sends, restored.pending_sends);
    }

    #[test]
    fn test_checkpoint_metadata() {
        let metadata = CheckpointMetadata::new()
            .with_source(CheckpointSource::Input)
            .with_step(-1)
            .with_extra("key".to_string(), serde_json::json!("value"));

        assert_eq!(metadata.source, Some(CheckpointSource::Input));
        assert_eq!(metadata.step, Some(-1));
        assert_eq!(metadata.extra.get("key"), Some(&serde_json::json!("value")));
    }

    #[test]
    fn test_checkpoint_config() {
        let config = CheckpointConfig::new("thread-1").with_checkpoint_id("checkpoint-1");
        assert_eq!(config.thread_id, Some("thread-1".to_string()));
        assert_eq!(config.checkpoint_id, Some("checkpoint-1".to_string()));
        assert_eq!(config.namespace(), "");
    }
}
