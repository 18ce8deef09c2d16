//! Drover - multi-agent orchestration core.
//!
//! Drover accepts high-level tasks, decomposes them into concurrent
//! worker agents running in isolated workspaces, supervises their
//! lifecycles with bounded resources, coordinates them over a durable
//! event bus, and enforces cost and safety budgets:
//!
//! - Agent lifecycle state machine with retry-and-backoff
//! - Team orchestration (parallel, pipeline, map/reduce, tree)
//! - Event bus with bounded replay and sync/async subscriptions
//! - Hierarchical token/cost budgets with a warn/throttle/kill ladder
//! - SQLite persistence (WAL) with embedded migrations
//! - Shared auto-reconnecting gateway client for remote execution
//! - Periodic self-inspection spawning tightly budgeted repair teams

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;
