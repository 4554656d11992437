//! Superstep-based graph execution engine
//!
//! Stepgraph executes a statically declared graph of named nodes
//! communicating through versioned, typed channels. Execution proceeds in
//! supersteps: every node whose subscribed channels advanced (and every
//! explicitly targeted push task) runs concurrently, the barrier merges
//! their writes into the channels, and the result commits as an immutable
//! checkpoint. Runs can suspend at an interrupt and resume later on the
//! same thread lineage, survive process restarts through a pluggable
//! checkpoint store, and retry failing tasks with backoff.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use stepgraph_checkpoint::{InMemorySaver, LastValueChannel};
//! use stepgraph_core::{node_fn, GraphBuilder, NodeOutput};
//!
//! # async fn example() -> stepgraph_core::Result<()> {
//! let mut builder = GraphBuilder::new();
//! builder
//!     .add_channel("x", Box::new(LastValueChannel::new()))
//!     .add_node("double", node_fn(|input, _ctx| async move {
//!         let x = input["x"].as_i64().unwrap_or(0);
//!         NodeOutput::update_value(json!({"x": x * 2}))
//!     }))
//!     .set_entry_point("double")
//!     .set_finish_point("double");
//!
//! let graph = builder
//!     .compile()?
//!     .with_checkpointer(Arc::new(InMemorySaver::new()));
//!
//! let state = graph.invoke(json!({"x": 21})).await?;
//! assert_eq!(state, json!({"x": 42}));
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`graph`] - builder, validation, conditional branches
//! - [`node`] - node body contract and per-invocation context
//! - [`pregel`] - scheduler, runner, write applier, superstep loop
//! - [`compiled`] - the executable facade (`invoke` / `run` / `stream`)
//! - [`interrupt`] - suspend/resume payloads and the resume ledger
//! - [`retry`] - exponential backoff policies
//! - [`stream`] - execution events for transports

pub mod compiled;
pub mod error;
pub mod graph;
pub mod interrupt;
pub mod io;
pub mod node;
pub mod pregel;
pub mod retry;
pub mod stream;

pub use compiled::{CompiledGraph, RunRequest};
pub use error::{GraphError, Result};
pub use graph::{CompiledBranch, GraphBuilder, GraphTopology, RouterFn, RouterResult, BRANCH_PREFIX};
pub use interrupt::{Interrupt, InterruptWhen, ResumeLedger};
pub use node::{node_fn, Goto, NodeBody, NodeContext, NodeFuture, NodeOutput, WriteSink};
pub use pregel::{LoopOptions, NodeSpec, PregelLoop, Task, TaskPath, TaskWrites, END, START};
pub use retry::{RetryPolicy, RetryPredicate};
pub use stream::ExecutionEvent;

pub use stepgraph_checkpoint::SendPacket;
