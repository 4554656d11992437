//! Step-scoped and synchronization channel variants
//!
//! [`EphemeralValueChannel`] carries a value for exactly one superstep and
//! is cleared by the empty update every channel receives at the next step
//! boundary. [`NamedBarrierChannel`] holds readers back until a declared
//! set of contributors have all written, then releases a sentinel once.

use crate::channels::Channel;
use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ephemeral channel - a value visible for exactly one step
///
/// Any value written in step N is readable during step N+1 and cleared at
/// the N+1 → N+2 boundary (the write applier's empty `update([])` call).
/// Used for graph entry points and branch decision channels, where a
/// trigger must fire once and not linger.
///
/// Guarded by default: more than one value per step is an invalid update.
/// The unguarded form keeps the last value instead, for engine channels
/// where duplicate sentinel writes are expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EphemeralValueChannel {
    value: Option<serde_json::Value>,
    guard: bool,
}

impl EphemeralValueChannel {
    pub fn new() -> Self {
        Self {
            value: None,
            guard: true,
        }
    }

    /// Ephemeral channel accepting multiple writes per step, last one wins
    pub fn unguarded() -> Self {
        Self {
            value: None,
            guard: false,
        }
    }
}

impl Default for EphemeralValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for EphemeralValueChannel {
    fn get(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral_value".to_string()))
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            // step boundary with no writes: clear the held value
            return Ok(self.value.take().is_some());
        }
        if self.guard && values.len() > 1 {
            return Err(CheckpointError::InvalidUpdate(
                "EphemeralValue channel can receive only one value per step".to_string(),
            ));
        }
        self.value = values.into_iter().last();
        Ok(true)
    }

    fn checkpoint(&self) -> Result<serde_json::Value> {
        self.value
            .clone()
            .ok_or_else(|| CheckpointError::EmptyChannel("ephemeral_value".to_string()))
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

/// Internal barrier lifecycle.
///
/// Priming: no wait-set declared, unreadable, contributor writes rejected.
/// Waiting: wait-set declared, unreadable until every name has written.
/// Ready (waiting with all names seen): readable, returns a sentinel;
/// consume resets back to priming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum BarrierState {
    Priming,
    Waiting {
        names: BTreeSet<String>,
        seen: BTreeSet<String>,
    },
}

/// NamedBarrier channel - releases once every named contributor has written
///
/// The wait-set is declared with a control update of the form
/// `{"wait_for": ["a", "b"]}`; subsequent writes must be contributor names
/// from that set. Reading before the set is complete fails with
/// `EmptyChannelError`; once complete, reads return a null sentinel and
/// `consume` resets the barrier to its priming state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedBarrierChannel {
    state: BarrierState,
}

impl NamedBarrierChannel {
    /// Create a barrier in the priming state
    pub fn new() -> Self {
        Self {
            state: BarrierState::Priming,
        }
    }

    /// Create a barrier already waiting for the given contributors
    pub fn waiting_for<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: BarrierState::Waiting {
                names: names.into_iter().map(Into::into).collect(),
                seen: BTreeSet::new(),
            },
        }
    }

    /// Build the control update that declares a wait-set
    pub fn wait_for<I, S>(names: I) -> serde_json::Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        serde_json::json!({ "wait_for": names })
    }

    fn is_ready(&self) -> bool {
        match &self.state {
            BarrierState::Priming => false,
            BarrierState::Waiting { names, seen } => !names.is_empty() && names == seen,
        }
    }

    fn apply_one(&mut self, value: serde_json::Value) -> Result<()> {
        // control update: (re)declare the wait-set
        if let Some(wait_for) = value.get("wait_for").and_then(|v| v.as_array()) {
            let names: BTreeSet<String> = wait_for
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            if names.len() != wait_for.len() {
                return Err(CheckpointError::InvalidUpdate(
                    "barrier wait_for entries must be strings".to_string(),
                ));
            }
            self.state = BarrierState::Waiting {
                names,
                seen: BTreeSet::new(),
            };
            return Ok(());
        }

        let contributor = value.as_str().ok_or_else(|| {
            CheckpointError::InvalidUpdate(
                "barrier contributions must be contributor name strings".to_string(),
            )
        })?;

        match &mut self.state {
            BarrierState::Priming => Err(CheckpointError::InvalidUpdate(format!(
                "barrier received '{contributor}' before a wait_for declaration"
            ))),
            BarrierState::Waiting { names, seen } => {
                if !names.contains(contributor) {
                    return Err(CheckpointError::InvalidUpdate(format!(
                        "'{contributor}' is not in the barrier wait-set"
                    )));
                }
                seen.insert(contributor.to_string());
                Ok(())
            }
        }
    }
}

impl Default for NamedBarrierChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for NamedBarrierChannel {
    fn get(&self) -> Result<serde_json::Value> {
        if self.is_ready() {
            Ok(serde_json::Value::Null)
        } else {
            Err(CheckpointError::EmptyChannel("named_barrier".to_string()))
        }
    }

    fn update(&mut self, values: Vec<serde_json::Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        for value in values {
            self.apply_one(value)?;
        }
        Ok(true)
    }

    fn checkpoint(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.state)?)
    }

    fn restore(&mut self, snapshot: serde_json::Value) -> Result<()> {
        self.state = serde_json::from_value(snapshot)?;
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.is_ready()
    }

    fn consume(&mut self) -> bool {
        if self.is_ready() {
            self.state = BarrierState::Priming;
            true
        } else {
            false
        }
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}
