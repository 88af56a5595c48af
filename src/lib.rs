//! AIDOS core — the orchestration engine that turns a natural-language
//! development objective into a task graph and drives that graph to
//! completion across a bounded pool of agents.
//!
//! This crate covers the six cooperating components named in the design
//! (Task Decomposer, Dependency Graph, Resource Optimizer/Scheduler,
//! Agent Manager, Subprocess Agent, Orchestrator) plus the Safety
//! Guardrails/Safe Executor and the layered Config Manager. The CLI, TUI,
//! session-history persistence, and prompt-template rendering are external
//! collaborators that consume this crate's event bus and public APIs —
//! they are not implemented here.

pub mod agent_manager;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod events;
pub mod graph;
pub mod guardrails;
pub mod logging;
pub mod orchestrator;
pub mod safe_executor;
pub mod scheduler;
pub mod self_healing;
pub mod subprocess_agent;
pub mod types;

pub use error::{AidosError, AidosResult};
pub use events::{AidosEvent, EventBus};
pub use orchestrator::{Orchestrator, SessionOptions};
