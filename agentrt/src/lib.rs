#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(tail_expr_drop_order)]
//! `agentrt` is the agent-step engine for an LLM-powered coding assistant:
//! a message log with strict tool-call pairing invariants, a tag-grammar
//! stream parser, a tool dispatcher with a serialization spine, a step
//! runner and outer orchestrator loop, a credit gate, and the external
//! ports a host wires up to actually talk to a model, a tool surface, and a
//! billing backend.
//!
//! The crate never performs its own I/O: everything that touches the
//! network, a clock, or a random/uuid generator is behind a trait in
//! [`ports`], injected at [`orchestrator::AgentOrchestrator::new`].

pub mod builtin_tools;
pub mod credit;
pub mod dispatch;
pub mod error;
pub mod log;
pub mod message;
pub mod orchestrator;
pub mod ports;
pub mod prelude;
pub mod state;
pub mod step;
pub mod stream;
pub mod template;
pub mod tool;
pub mod usage;

#[cfg(feature = "derive")]
#[cfg_attr(docsrs, doc(cfg(feature = "derive")))]
pub use agentrt_derive::tool;

/// Re-exported so `#[agentrt_derive::tool]`'s generated code has a stable
/// path to `async_trait` without requiring callers to depend on it
/// directly.
#[cfg(feature = "derive")]
#[doc(hidden)]
pub use async_trait;
