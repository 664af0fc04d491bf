//! # scribe-core - Recursive planning kernel for long-form generation
//!
//! A root goal ("write a report on X", "write a novel about Y") is
//! recursively decomposed into a two-dimensional task graph: an outer
//! containment tree of PLAN and EXECUTE nodes, and per-PLAN inner DAGs of
//! lateral dependencies. The scheduler drives nodes through their state
//! machine by invoking registered capabilities (LLM prompt pipelines,
//! search backends) until atomic results aggregate back into the final
//! artifact.
//!
//! ## Architecture
//!
//! ```text
//!  RunManager ── start/status/result/subscribe/cancel
//!      │
//!      ▼
//!   Engine ──────────── EventBus ──► subscribers (replay + live)
//!      │ tick
//!      ▼
//!  NodeArena (graph + state machine)
//!      │ context            │ results
//!      ▼                    ▲
//!   Memory ──► CapabilityRegistry ──► providers
//!                     │
//!                     ▼
//!               CallCache (single-flight, durable)
//! ```
//!
//! ## Module Organization
//!
//! - [`node`] / [`graph`] - the task graph and its invariants
//! - [`engine`] - scheduler loop, dispatch, retries, cancellation
//! - [`memory`] - per-node context collection
//! - [`event`] - ordered lifecycle event bus
//! - [`capability`] - provider contract and registry
//! - [`scripted`] - deterministic capabilities for tests and demos
//! - [`api`] - run lifecycle management
//! - [`config`] / [`error`] - configuration and error taxonomy

pub mod api;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod graph;
pub mod memory;
pub mod node;
pub mod scripted;
pub mod viz;

pub use api::{RunManager, RunState, RunStatus};
pub use capability::{
    ActionResult, Capability, CapabilityRegistry, CapabilityReply, CapabilityRequest, SubtaskSpec,
};
pub use config::{CacheEnabled, Mode, ScribeConfig};
pub use engine::{Engine, RunSnapshot};
pub use error::{EngineError, ErrorClass, Result};
pub use event::{
    EventBus, EventPayload, EventRecord, RunFinishReason, RunId, SubscriberItem, TokenUsage,
    ToolCallState,
};
pub use graph::{GraphView, InnerGraph, NodeArena, PlanApplication};
pub use memory::{Memory, MemoryState, NodeContext};
pub use node::{
    action_for, ActionName, Nid, Node, NodeId, NodeKind, NodeOutcome, NodeStatus, Passage,
    TaskType,
};
