//! Interrupt payloads and the resume scratchpad
//!
//! An interrupt is a control-flow signal, not a failure: a node body calls
//! [`NodeContext::interrupt`](crate::node::NodeContext::interrupt) to
//! suspend the run and request external input. The engine records the
//! payload against the committed checkpoint, and a later invocation on the
//! same thread supplies a resume value.
//!
//! Interrupts are **idempotent by position**: the nth `interrupt()` call
//! within a node body consumes the nth recorded resume value. A node that
//! interrupts twice is resumed twice, in the order the interrupts were
//! originally raised - the payload value plays no part in matching.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// When an interrupt fired relative to node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptWhen {
    /// Raised from inside the node body
    During,
    /// Static breakpoint before the node ran
    Before,
    /// Static breakpoint after the node ran
    After,
}

/// A suspend-and-wait-for-input signal raised during execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Payload supplied by the raising node (null for static breakpoints)
    pub value: serde_json::Value,
    /// Node the interrupt belongs to
    pub node: String,
    /// Ordinal of the `interrupt()` call within the node body
    pub index: usize,
    /// Where in the node lifecycle the interrupt fired
    pub when: InterruptWhen,
}

impl Interrupt {
    /// Interrupt raised from inside a node body
    pub fn during(node: impl Into<String>, index: usize, value: serde_json::Value) -> Self {
        Self {
            value,
            node: node.into(),
            index,
            when: InterruptWhen::During,
        }
    }

    /// Static breakpoint before a node runs
    pub fn before(node: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::Null,
            node: node.into(),
            index: 0,
            when: InterruptWhen::Before,
        }
    }

    /// Static breakpoint after a node ran
    pub fn after(node: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::Null,
            node: node.into(),
            index: 0,
            when: InterruptWhen::After,
        }
    }
}

/// Resume values per node, consumed positionally on re-entry
///
/// Persisted alongside the interrupted checkpoint so that resumption
/// survives process restarts: each resume invocation appends one value,
/// and on re-entry the node's `interrupt()` calls read values back in
/// raise order.
#[derive(Debug, Clone, Default)]
pub struct ResumeLedger {
    values: HashMap<String, Vec<serde_json::Value>>,
}

impl ResumeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resume value for a node
    pub fn push(&mut self, node: &str, value: serde_json::Value) {
        self.values.entry(node.to_string()).or_default().push(value);
    }

    /// Replace a node's resume values (used when loading persisted state)
    pub fn load(&mut self, node: &str, values: Vec<serde_json::Value>) {
        self.values.insert(node.to_string(), values);
    }

    /// All resume values recorded for a node, in raise order
    pub fn values_for(&self, node: &str) -> Vec<serde_json::Value> {
        self.values.get(node).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_positional_order() {
        let mut ledger = ResumeLedger::new();
        ledger.push("ask", serde_json::json!("first"));
        ledger.push("ask", serde_json::json!("second"));

        let values = ledger.values_for("ask");
        assert_eq!(values[0], serde_json::json!("first"));
        assert_eq!(values[1], serde_json::json!("second"));
        assert!(ledger.values_for("other").is_empty());
    }

    #[test]
    fn test_interrupt_serde_round_trip() {
        let interrupt = Interrupt::during("ask", 1, serde_json::json!({"q": "proceed?"}));
        let json = serde_json::to_value(&interrupt).unwrap();
        let restored: Interrupt = serde_json::from_value(json).unwrap();
        assert_eq!(restored, interrupt);
        assert_eq!(restored.when, InterruptWhen::During);
    }
}
