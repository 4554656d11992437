//! In-memory checkpoint storage for development and testing
//!
//! [`InMemorySaver`] is the reference implementation of the
//! [`CheckpointSaver`] trait: all checkpoints live in a thread-safe map
//! keyed by (thread id, namespace), each holding an append-only vector of
//! entries. Suitable for development, tests, and single-process runs;
//! nothing survives a restart.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Arc<RwLock<HashMap<(thread, ns), Vec<Entry>>>>      │
//! │                                                      │
//! │  ("session-1", "")                                   │
//! │    ├─ [0] Entry (step -1, source input)              │
//! │    ├─ [1] Entry (step 0,  source loop)               │
//! │    └─ [2] Entry (step 1,  source loop)               │
//! │  ("session-2", "")                                   │
//! │    └─ [0] Entry (step -1, source input)              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Entries are appended in put order; the latest checkpoint is the last
//! entry. Pending writes are attached to their entry keyed by
//! (task_id, index), with reserved marker channels at negative indices.

use crate::{
    checkpoint::{
        reserved, ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata,
        CheckpointTuple,
    },
    error::{CheckpointError, Result},
    traits::{CheckpointSaver, CheckpointStream},
};
use async_trait::async_trait;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A single pending write attached to a checkpoint entry
#[derive(Debug, Clone)]
struct WriteEntry {
    task_id: String,
    idx: i64,
    channel: String,
    value: serde_json::Value,
}

/// Storage entry for one persisted checkpoint
#[derive(Debug, Clone)]
struct CheckpointEntry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    config: CheckpointConfig,
    parent_config: Option<CheckpointConfig>,
    writes: Vec<WriteEntry>,
}

impl CheckpointEntry {
    fn to_tuple(&self) -> CheckpointTuple {
        let mut writes = self.writes.clone();
        writes.sort_by(|a, b| (&a.task_id, a.idx).cmp(&(&b.task_id, b.idx)));
        CheckpointTuple {
            config: self.config.clone(),
            checkpoint: self.checkpoint.clone(),
            metadata: self.metadata.clone(),
            parent_config: self.parent_config.clone(),
            pending_writes: writes
                .into_iter()
                .map(|w| (w.task_id, w.channel, w.value))
                .collect(),
        }
    }
}

type StorageKey = (String, String); // (thread_id, namespace)
type Storage = Arc<RwLock<HashMap<StorageKey, Vec<CheckpointEntry>>>>;

/// Thread-safe in-memory checkpoint saver
///
/// # Example
///
/// ```rust
/// use stepgraph_checkpoint::{InMemorySaver, CheckpointSaver, CheckpointConfig, Checkpoint};
/// use stepgraph_checkpoint::CheckpointMetadata;
/// use std::collections::HashMap;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let saver = InMemorySaver::new();
///     let config = CheckpointConfig::new("thread-1");
///
///     let stored = saver
///         .put(&config, Checkpoint::empty(), CheckpointMetadata::new(), HashMap::new())
///         .await?;
///
///     let tuple = saver.get_tuple(&stored).await?.expect("stored checkpoint");
///     assert_eq!(tuple.config.checkpoint_id, stored.checkpoint_id);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemorySaver {
    storage: Storage,
}

impl InMemorySaver {
    /// Create a new in-memory checkpoint saver
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the number of (thread, namespace) histories being tracked
    pub async fn thread_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Get the total number of checkpoints across all threads
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Clear all checkpoints (useful for testing)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    fn require_thread(config: &CheckpointConfig) -> Result<String> {
        config
            .thread_id
            .clone()
            .ok_or_else(|| CheckpointError::Storage("thread_id is required".to_string()))
    }

    fn matches_filter(
        metadata: &CheckpointMetadata,
        filter: &HashMap<String, serde_json::Value>,
    ) -> bool {
        let meta_value = match serde_json::to_value(metadata) {
            Ok(value) => value,
            Err(_) => return false,
        };
        filter
            .iter()
            .all(|(key, expected)| meta_value.get(key) == Some(expected))
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let thread_id = Self::require_thread(config)?;
        let key = (thread_id, config.namespace().to_string());
        let storage = self.storage.read().await;

        let Some(entries) = storage.get(&key) else {
            return Ok(None);
        };

        let entry = if let Some(checkpoint_id) = &config.checkpoint_id {
            entries.iter().find(|e| &e.checkpoint.id == checkpoint_id)
        } else {
            entries.last()
        };

        Ok(entry.map(CheckpointEntry::to_tuple))
    }

    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream> {
        let storage = self.storage.read().await;

        let keys: Vec<StorageKey> = if let Some(cfg) = config {
            if let Some(thread_id) = &cfg.thread_id {
                vec![(thread_id.clone(), cfg.namespace().to_string())]
            } else {
                storage.keys().cloned().collect()
            }
        } else {
            storage.keys().cloned().collect()
        };

        let before_id = before.and_then(|cfg| cfg.checkpoint_id.clone());
        let mut results = Vec::new();

        'outer: for key in keys {
            let Some(entries) = storage.get(&key) else {
                continue;
            };
            // newest first
            for entry in entries.iter().rev() {
                if let Some(before_id) = &before_id {
                    if entry.checkpoint.id >= *before_id {
                        continue;
                    }
                }

                if let Some(filter_map) = &filter {
                    if !Self::matches_filter(&entry.metadata, filter_map) {
                        continue;
                    }
                }

                results.push(Ok(entry.to_tuple()));

                if let Some(lim) = limit {
                    if results.len() >= lim {
                        break 'outer;
                    }
                }
            }
        }

        Ok(Box::pin(stream::iter(results)))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let thread_id = Self::require_thread(config)?;
        let key = (thread_id.clone(), config.namespace().to_string());

        let checkpoint_config = CheckpointConfig {
            thread_id: Some(thread_id),
            checkpoint_id: Some(checkpoint.id.clone()),
            checkpoint_ns: config.checkpoint_ns.clone(),
        };

        // the incoming config's checkpoint_id, if any, names the parent
        let parent_config = config.checkpoint_id.as_ref().map(|_| config.clone());

        let entry = CheckpointEntry {
            checkpoint,
            metadata,
            config: checkpoint_config.clone(),
            parent_config,
            writes: Vec::new(),
        };

        let mut storage = self.storage.write().await;
        storage.entry(key).or_default().push(entry);

        Ok(checkpoint_config)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()> {
        let thread_id = Self::require_thread(config)?;
        let checkpoint_id = config
            .checkpoint_id
            .clone()
            .ok_or_else(|| CheckpointError::Storage("checkpoint_id is required".to_string()))?;
        let key = (thread_id, config.namespace().to_string());

        let mut storage = self.storage.write().await;
        let entry = storage
            .get_mut(&key)
            .and_then(|entries| {
                entries
                    .iter_mut()
                    .find(|e| e.checkpoint.id == checkpoint_id)
            })
            .ok_or_else(|| CheckpointError::NotFound(checkpoint_id.clone()))?;

        for (seq, (channel, value)) in writes.into_iter().enumerate() {
            let idx = reserved::write_index(&channel).unwrap_or(seq as i64);
            // a marker write replaces any earlier marker for the same task
            if idx < 0 {
                entry
                    .writes
                    .retain(|w| !(w.task_id == task_id && w.idx == idx));
            }
            entry.writes.push(WriteEntry {
                task_id: task_id.clone(),
                idx,
                channel,
                value,
            });
        }

        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.retain(|(thread, _), _| thread != thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointSource;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_save_and_load_checkpoint() {
        let saver = InMemorySaver::new();
        let checkpoint = Checkpoint::empty();
        let checkpoint_id = checkpoint.id.clone();
        let metadata = CheckpointMetadata::new().with_source(CheckpointSource::Input);
        let config = CheckpointConfig::new("thread-1");

        let saved_config = saver
            .put(&config, checkpoint, metadata, HashMap::new())
            .await
            .unwrap();

        assert_eq!(saved_config.checkpoint_id, Some(checkpoint_id.clone()));

        let tuple = saver.get_tuple(&saved_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, checkpoint_id);
        assert!(tuple.parent_config.is_none());
    }

    #[tokio::test]
    async fn test_get_tuple_returns_latest_without_id() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        let mut last_id = String::new();
        for step in 0..3 {
            let checkpoint = Checkpoint::empty();
            last_id = checkpoint.id.clone();
            saver
                .put(
                    &config,
                    checkpoint,
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, last_id);
        assert_eq!(tuple.metadata.step, Some(2));
    }

    #[tokio::test]
    async fn test_parent_lineage_recorded() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        let first = saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();

        // the second put carries the first checkpoint's config as parent
        let second = saver
            .put(
                &first,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&second).await.unwrap().unwrap();
        let parent = tuple.parent_config.unwrap();
        assert_eq!(parent.checkpoint_id, first.checkpoint_id);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_limit() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        for step in 0..5 {
            saver
                .put(
                    &config,
                    Checkpoint::empty(),
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }

        let stream = saver
            .list(Some(&config), None, None, Some(3))
            .await
            .unwrap();
        let results: Vec<_> = stream.collect().await;

        assert_eq!(results.len(), 3);
        let steps: Vec<i64> = results
            .into_iter()
            .map(|r| r.unwrap().metadata.step.unwrap())
            .collect();
        assert_eq!(steps, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn test_list_with_metadata_filter() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new()
                    .with_step(0)
                    .with_extra("kind".into(), serde_json::json!("a")),
                HashMap::new(),
            )
            .await
            .unwrap();
        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new()
                    .with_step(1)
                    .with_extra("kind".into(), serde_json::json!("b")),
                HashMap::new(),
            )
            .await
            .unwrap();

        let mut filter = HashMap::new();
        filter.insert("kind".to_string(), serde_json::json!("a"));

        let stream = saver
            .list(Some(&config), Some(filter), None, None)
            .await
            .unwrap();
        let results: Vec<_> = stream.collect().await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().metadata.step, Some(0));
    }

    #[tokio::test]
    async fn test_list_before_cursor() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        let mut configs = Vec::new();
        for step in 0..3 {
            let stored = saver
                .put(
                    &config,
                    Checkpoint::empty(),
                    CheckpointMetadata::new().with_step(step),
                    HashMap::new(),
                )
                .await
                .unwrap();
            configs.push(stored);
        }

        let stream = saver
            .list(Some(&config), None, Some(&configs[2]), None)
            .await
            .unwrap();
        let results: Vec<_> = stream.collect().await;

        let steps: Vec<i64> = results
            .into_iter()
            .map(|r| r.unwrap().metadata.step.unwrap())
            .collect();
        assert_eq!(steps, vec![1, 0]);
    }

    #[tokio::test]
    async fn test_put_writes_ordering_and_marker_indices() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");
        let stored = saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();

        saver
            .put_writes(
                &stored,
                vec![
                    ("chan_a".to_string(), serde_json::json!(1)),
                    ("chan_b".to_string(), serde_json::json!(2)),
                ],
                "task-1".to_string(),
            )
            .await
            .unwrap();
        saver
            .put_writes(
                &stored,
                vec![(reserved::ERROR.to_string(), serde_json::json!("boom"))],
                "task-2".to_string(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 3);
        // ordered by (task_id, idx): task-1 writes in order, then task-2's marker
        assert_eq!(tuple.pending_writes[0].1, "chan_a");
        assert_eq!(tuple.pending_writes[1].1, "chan_b");
        assert_eq!(tuple.pending_writes[2].1, reserved::ERROR);
    }

    #[tokio::test]
    async fn test_put_writes_marker_replaces_prior_marker() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");
        let stored = saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();

        saver
            .put_writes(
                &stored,
                vec![(reserved::RESUME.to_string(), serde_json::json!(["a"]))],
                "task-1".to_string(),
            )
            .await
            .unwrap();
        saver
            .put_writes(
                &stored,
                vec![(reserved::RESUME.to_string(), serde_json::json!(["a", "b"]))],
                "task-1".to_string(),
            )
            .await
            .unwrap();

        let tuple = saver.get_tuple(&stored).await.unwrap().unwrap();
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.pending_writes[0].2, serde_json::json!(["a", "b"]));
    }

    #[tokio::test]
    async fn test_put_writes_unknown_checkpoint() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1").with_checkpoint_id("missing");

        let result = saver
            .put_writes(&config, vec![], "task-1".to_string())
            .await;
        assert!(matches!(result, Err(CheckpointError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_namespace_isolation() {
        let saver = InMemorySaver::new();
        let root = CheckpointConfig::new("thread-1");
        let nested = CheckpointConfig::new("thread-1").with_checkpoint_ns("child");

        saver
            .put(
                &root,
                Checkpoint::empty(),
                CheckpointMetadata::new().with_step(0),
                HashMap::new(),
            )
            .await
            .unwrap();

        assert!(saver.get_tuple(&nested).await.unwrap().is_none());
        assert!(saver.get_tuple(&root).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_thread() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(saver.thread_count().await, 1);

        saver.delete_thread("thread-1").await.unwrap();
        assert_eq!(saver.thread_count().await, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::new("thread-1");

        saver
            .put(
                &config,
                Checkpoint::empty(),
                CheckpointMetadata::new(),
                HashMap::new(),
            )
            .await
            .unwrap();
        assert_eq!(saver.checkpoint_count().await, 1);

        saver.clear().await;
        assert_eq!(saver.checkpoint_count().await, 0);
    }
}
