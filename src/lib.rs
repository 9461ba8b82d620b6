//! # graph-agent
//!
//! Verified execution of compiled web-interaction task graphs.
//!
//! This library provides:
//! - A graph executor that runs typed steps against a single live page
//! - A dual verifier that scores every step outcome before it commits
//! - Local repair: failure classification, a static repair table and
//!   graph-aware rollback that keeps completed work
//! - A cost-aware router choosing between no model, a small model and a
//!   large model at every judgment point
//!
//! ## Architecture
//!
//! ```text
//!   compile(text) ──► TaskGraph
//!                        │
//!                        ▼
//!              ┌───────────────────┐      ┌──────────────┐
//!              │   GraphExecutor   │─────►│  BrowserEnv  │ (PageLock)
//!              └─────────┬─────────┘      └──────────────┘
//!                        │ outcome + snapshot
//!                        ▼
//!              ┌───────────────────┐      ┌──────────────┐
//!              │   DualVerifier    │─────►│ CostAware    │──► ModelBackend
//!              └─────────┬─────────┘      │ Router       │
//!                        │ fail           └──────▲───────┘
//!                        ▼                       │
//!     classify ──► plan ──► RollbackManager ─────┘
//! ```
//!
//! ## Modules
//! - `graph`: task graph arena, node lifecycle, predicates, splicing
//! - `executor`: scheduling loop and node-type handlers
//! - `verify`: hard, soft and consistency checks
//! - `repair`: classifier, repair planner, rollback manager
//! - `router`: model tier selection and cost accounting
//! - `browser` / `llm`: collaborator traits and HTTP clients
//! - `compiler`: natural-language task to graph

pub mod browser;
pub mod compiler;
pub mod config;
pub mod executor;
pub mod graph;
pub mod llm;
pub mod repair;
pub mod router;
pub mod verify;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use executor::{ExecutionContext, ExecutionResult, GraphExecutor, TaskOutcome};
pub use graph::TaskGraph;
pub use router::CostAwareRouter;
pub use verify::DualVerifier;
