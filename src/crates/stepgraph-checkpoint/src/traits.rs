//! Checkpoint storage trait for pluggable persistence backends
//!
//! [`CheckpointSaver`] is the abstraction the engine persists through. A
//! backend stores immutable checkpoints keyed by (thread, namespace,
//! checkpoint id), appends pending writes against a checkpoint, and serves
//! history listings newest-first.
//!
//! # Contract
//!
//! - `put` is **append-only** per (thread, namespace): a stored checkpoint
//!   is never mutated in place. Lineage is reconstructed via each
//!   checkpoint's recorded parent config.
//! - `put_writes` appends, never overwrites. Writes are keyed by
//!   (task_id, write index); reserved marker channels map to negative
//!   indices (see [`reserved::write_index`](crate::checkpoint::reserved))
//!   so they cannot collide with ordinary channel writes.
//! - `get_tuple` with no checkpoint id returns the **latest** checkpoint
//!   for the thread/namespace.
//! - Concurrent invocations against the *same* thread must be serialized
//!   by the caller; the store is not required to arbitrate them.
//!
//! Implementations must be `Send + Sync`; all methods are async so
//! database-backed stores can do real I/O.

use crate::{
    checkpoint::{
        ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    },
    error::Result,
};
use async_trait::async_trait;
use futures::stream::Stream;
use std::pin::Pin;

/// Type alias for async stream of checkpoint tuples
pub type CheckpointStream = Pin<Box<dyn Stream<Item = Result<CheckpointTuple>> + Send + 'static>>;

/// Core trait for implementing checkpoint storage backends
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint for the given configuration.
    ///
    /// Convenience wrapper over [`get_tuple`](Self::get_tuple).
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|tuple| tuple.checkpoint))
    }

    /// Retrieve a complete checkpoint tuple.
    ///
    /// When `config.checkpoint_id` is set, returns exactly that checkpoint;
    /// otherwise the latest checkpoint for the thread and namespace. The
    /// tuple carries the stored metadata, the parent config for lineage
    /// traversal, and any pending writes recorded against the checkpoint,
    /// ordered by (task_id, write index).
    ///
    /// Returns `Ok(None)` (not an error) when nothing matches.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Query checkpoints newest-first.
    ///
    /// `config` scopes the listing to a thread (and namespace); `filter`
    /// matches against serialized metadata fields; `before` is a pagination
    /// cursor (only checkpoints older than the referenced one); `limit`
    /// caps the stream length.
    async fn list(
        &self,
        config: Option<&CheckpointConfig>,
        filter: Option<std::collections::HashMap<String, serde_json::Value>>,
        before: Option<&CheckpointConfig>,
        limit: Option<usize>,
    ) -> Result<CheckpointStream>;

    /// Store a checkpoint with its metadata.
    ///
    /// `new_versions` carries the channel versions changed by the step that
    /// produced this checkpoint, for backends that index by version delta.
    /// Returns the config of the stored checkpoint (with its checkpoint id
    /// filled in), which callers thread through as the parent of the next
    /// `put`.
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Append intermediate writes linked to a checkpoint.
    ///
    /// `config.checkpoint_id` must identify a stored checkpoint. Writes are
    /// appended keyed by (task_id, index); marker channels use their
    /// reserved negative indices, so re-recording a marker replaces the
    /// prior marker for that task instead of stacking duplicates.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, serde_json::Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Delete all checkpoints and writes associated with a thread ID.
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }
}
