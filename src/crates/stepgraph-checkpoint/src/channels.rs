//! Channel abstractions for state management
//!
//! Channels are versioned state containers with pluggable merge rules.
//! Each superstep's task writes are merged into channels through
//! [`Channel::update`]; version bumps happen only through the engine's
//! write applier, never inside the channel itself.

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// Base trait for all channels
///
/// Channels are typed state containers that manage how state is stored,
/// updated, and checkpointed. Different channel types provide different
/// semantics for handling concurrent updates: last-value-wins, append-only,
/// reducer-merged, per-step ephemeral, or barrier synchronization.
pub trait Channel: Send + Sync + Debug {
    /// Get the current value of the channel
    ///
    /// # Errors
    ///
    /// Returns `EmptyChannelError` if the channel has never been updated
    fn get(&self) -> Result<serde_json::Value>;

    /// Update the channel with a sequence of values
    ///
    /// The order of values is the deterministic task submission order for
    /// the step. Called once per channel at the end of each step; an empty
    /// sequence signals a step boundary with no writes to this channel.
    /// Returns `true` if the channel was updated, `false` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUpdateError` if the sequence of updates violates the
    /// channel's merge contract.
    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool>;

    /// Create a checkpoint of the current channel state
    ///
    /// Returns a serializable representation of the channel's state.
    fn checkpoint(&self) -> Result<serde_json::Value>;

    /// Restore the channel from a checkpoint snapshot
    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()>;

    /// Check if the channel has a value (is not empty)
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Notify the channel that a subscribed task ran
    ///
    /// Returns `true` if the channel was updated, `false` otherwise.
    fn consume(&mut self) -> bool {
        false
    }

    /// Notify the channel that the run is finishing
    ///
    /// Returns `true` if the channel was updated, `false` otherwise.
    fn finish(&mut self) -> bool {
        false
    }

    /// Clone the channel into a Box
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// LastValue channel - stores only the latest value
///
/// When several tasks write in the same step, the last write in the
/// deterministic task submission order wins, so repeated runs with the
/// same ordering always produce the same final value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastValueChannel {
    value: Option<serde_json::Value>,
}

impl LastValueChannel {
    /// Create a new LastValue channel
    pub fn new() -> Self {
        Self { value: None }
    }

    /// Create a new LastValue channel with an initial value
    pub fn with_value(value: serde_json::Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Default for LastValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.value = values.into_iter().last();
        Ok(true)
    }

    fn checkpoint(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("last_value".to_string()))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Topic channel - append-only log of values
///
/// Accumulates all values received. Each update appends to the log.
/// With `reset_on_consume`, the log is drained once a subscribed task
/// has run, so each batch of values is delivered exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicChannel {
    values: Vec<serde_json::Value>,
    reset_on_consume: bool,
}

impl TopicChannel {
    /// Create a new Topic channel
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            reset_on_consume: false,
        }
    }

    /// Create a Topic channel that drains after each subscribed task runs
    pub fn with_reset_on_consume() -> Self {
        Self {
            values: Vec::new(),
            reset_on_consume: true,
        }
    }

    /// Get all accumulated values
    pub fn get_all(&self) -> &[serde_json::Value] {
        &self.values
    }
}

impl Default for TopicChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for TopicChannel {
    fn get(&self) -> Result<serde_json::Value> {
        if self.values.is_empty() {
            return Err(CheckpointError::EmptyChannel("topic".to_string()));
        }
        Ok(serde_json::Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        self.values.extend(values);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Array(self.values.clone()))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        if let serde_json::Value::Array(arr) = snapshot {
            self.values = arr;
            Ok(())
        } else {
            Err(CheckpointError::InvalidUpdate(
                "Topic channel checkpoint must be an array".to_string(),
            ))
        }
    }

    fn is_available(&self) -> bool {
        !self.values.is_empty()
    }

    fn consume(&mut self) -> bool {
        if self.reset_on_consume && !self.values.is_empty() {
            self.values.clear();
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function type for BinaryOperator channel
pub type ReducerFn =
    Arc<dyn Fn(serde_json::Value, serde_json::Value) -> serde_json::Value + Send + Sync>;

/// BinaryOperator channel - reduces multiple values with a custom operator
///
/// Uses a binary reduction function to combine multiple updates into a
/// single value, in task submission order.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<serde_json::Value>,
    reducer: ReducerFn,
}

impl BinaryOperatorChannel {
    /// Create a new BinaryOperator channel with a custom reducer
    pub fn new<F>(reducer: F) -> Self
    where
        F: Fn(serde_json::Value, serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            reducer: Arc::new(reducer),
        }
    }

    /// Create a sum reducer (for numbers)
    pub fn sum() -> Self {
        Self::new(|a, b| {
            let a_num = a.as_f64().unwrap_or(0.0);
            let b_num = b.as_f64().unwrap_or(0.0);
            serde_json::json!(a_num + b_num)
        })
    }

    /// Create an append reducer (for arrays)
    pub fn append() -> Self {
        Self::new(|a, b| {
            let mut result = if let serde_json::Value::Array(arr) = a {
                arr
            } else {
                vec![a]
            };

            if let serde_json::Value::Array(arr) = b {
                result.extend(arr);
            } else {
                result.push(b);
            }

            serde_json::Value::Array(result)
        })
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }

        let reduced = values.into_iter().reduce(|acc, val| (self.reducer)(acc, val));

        if let Some(new_value) = reduced {
            self.value = if let Some(current) = self.value.take() {
                Some((self.reducer)(current, new_value))
            } else {
                Some(new_value)
            };
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn checkpoint(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("binary_operator".to_string()))
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.value = Some(snapshot);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_value_channel() {
        let mut channel = LastValueChannel::new();
        assert!(!channel.is_available());

        let updated = channel.update(vec![serde_json::json!(42)]).unwrap();
        assert!(updated);
        assert!(channel.is_available());
        assert_eq!(channel.get().unwrap(), serde_json::json!(42));

        channel.update(vec![serde_json::json!(100)]).unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!(100));
    }

    #[test]
    fn test_last_value_channel_takes_last_of_sequence() {
        let mut channel = LastValueChannel::new();
        channel
            .update(vec![serde_json::json!(1), serde_json::json!(2)])
            .unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!(2));
    }

    #[test]
    fn test_last_value_empty_get() {
        let channel = LastValueChannel::new();
        let error = channel.get().unwrap_err();
        assert!(error.is_empty_channel());
    }

    #[test]
    fn test_topic_channel() {
        let mut channel = TopicChannel::new();
        assert!(!channel.is_available());

        channel
            .update(vec![serde_json::json!(1), serde_json::json!(2)])
            .unwrap();
        assert_eq!(channel.get_all().len(), 2);

        channel.update(vec![serde_json::json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_topic_channel_reset_on_consume() {
        let mut channel = TopicChannel::with_reset_on_consume();
        channel.update(vec![serde_json::json!("a")]).unwrap();
        assert!(channel.is_available());

        assert!(channel.consume());
        assert!(!channel.is_available());
        assert!(!channel.consume());
    }

    #[test]
    fn test_topic_channel_ordering_preserved() {
        let mut channel = TopicChannel::new();
        channel.update(vec![serde_json::json!(1)]).unwrap();
        channel.update(vec![serde_json::json!(2)]).unwrap();
        channel.update(vec![serde_json::json!(3)]).unwrap();

        assert_eq!(channel.get().unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_binary_operator_sum() {
        let mut channel = BinaryOperatorChannel::sum();

        channel
            .update(vec![
                serde_json::json!(1.0),
                serde_json::json!(2.0),
                serde_json::json!(3.0),
            ])
            .unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!(6.0));

        channel.update(vec![serde_json::json!(4.0)]).unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!(10.0));
    }

    #[test]
    fn test_binary_operator_append() {
        let mut channel = BinaryOperatorChannel::append();

        channel
            .update(vec![serde_json::json!(1), serde_json::json!(2)])
            .unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!([1, 2]));

        channel.update(vec![serde_json::json!(3)]).unwrap();
        assert_eq!(channel.get().unwrap(), serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_binary_operator_clone_box() {
        let mut channel = BinaryOperatorChannel::sum();
        channel.update(vec![serde_json::json!(5.0)]).unwrap();

        let mut cloned = channel.clone_box();
        cloned.update(vec![serde_json::json!(7.0)]).unwrap();

        assert_eq!(channel.get().unwrap(), serde_json::json!(5.0));
        assert_eq!(cloned.get().unwrap(), serde_json::json!(12.0));
    }

    #[test]
    fn test_checkpoint_restore() {
        let mut channel = LastValueChannel::new();
        channel.update(vec![serde_json::json!(42)]).unwrap();

        let snapshot = channel.checkpoint().unwrap();

        let mut channel2 = LastValueChannel::new();
        channel2.restore(snapshot).unwrap();

        assert_eq!(channel2.get().unwrap(), serde_json::json!(42));
    }

    #[test]
    fn test_checkpoint_restore_nested_structures() {
        let complex_value = serde_json::json!({
            "nested": {
                "array": [1, 2, 3],
                "object": {"key": "value"},
                "null": null,
                "bool": true,
                "number": 42.5
            }
        });

        let mut channel = LastValueChannel::new();
        channel.update(vec![complex_value.clone()]).unwrap();

        let snapshot = channel.checkpoint().unwrap();
        let mut restored = LastValueChannel::new();
        restored.restore(snapshot).unwrap();

        assert_eq!(restored.get().unwrap(), complex_value);
    }

    #[test]
    fn test_channel_update_empty_values() {
        let mut channel = LastValueChannel::new();
        let updated = channel.update(vec![]).unwrap();
        assert!(!updated, "empty update should return false");
        assert!(!channel.is_available());
    }

    #[test]
    fn test_topic_channel_restore_rejects_non_array() {
        let mut channel = TopicChannel::new();
        let result = channel.restore(serde_json::json!({"not": "an array"}));
        assert!(matches!(result, Err(CheckpointError::InvalidUpdate(_))));
    }
}
