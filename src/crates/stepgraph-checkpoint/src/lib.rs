//! Channel, checkpoint and store abstractions for the stepgraph engine
//!
//! This crate holds the persistence half of the engine:
//!
//! - [`Channel`] and its variants - versioned state containers with
//!   pluggable merge rules (last-value, append-only, reducer, ephemeral,
//!   named barrier)
//! - [`Checkpoint`] - immutable snapshot of all channel state plus the
//!   scheduling metadata (versions, versions-seen, pending sends)
//! - [`CheckpointSaver`] - storage backend trait, with [`InMemorySaver`]
//!   as the reference implementation
//! - [`SerializerProtocol`] / [`WireValue`] - pluggable codecs and the
//!   binary-safe tagged wire format
//!
//! The execution engine lives in `stepgraph-core`; this crate has no
//! knowledge of nodes, graphs or scheduling beyond the data it persists.

pub mod channels;
pub mod channels_ext;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use channels::{BinaryOperatorChannel, Channel, LastValueChannel, ReducerFn, TopicChannel};
pub use channels_ext::{EphemeralValueChannel, NamedBarrierChannel};
pub use checkpoint::{
    increment, next_checkpoint_id, reserved, ChannelVersion, ChannelVersions, Checkpoint,
    CheckpointConfig, CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointTuple,
    PendingWrite, SendPacket,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use serializer::{
    BincodeSerializer, JsonSerializer, SerializerProtocol, WireEnvelope, WireValue, WIRE_VERSION,
};
pub use traits::{CheckpointSaver, CheckpointStream};
