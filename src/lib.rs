//! # Batch Scheduler
//!
//! A resource-aware batch scheduler for container-composition jobs.
//!
//! Tasks declare a CPU/RAM cost, an earliest start, a maximum execution time
//! and an action (a compose document, or an in-process dummy). A single loop
//! admits them against a fixed budget: among the tasks whose start has
//! passed and that fit the free resources, the one with the lowest karma
//! (smallest footprint over time) runs first. Each run gets a private working
//! directory and an execution scope ending at its deadline or on cancel.
//!
//! ## Key Features
//!
//! - **Resource Accounting**: reservations are released when their scope ends
//! - **Karma Ordering**: short, small jobs overtake long, heavy ones
//! - **Retries and Periodic Tasks**: `retry`, `every` and `cron` re-arm tasks
//! - **Event Bus**: every transition is published to subscribers
//! - **Validation**: pluggable rules per action kind, compose hardening built in
//! - **Recomposition**: optional private /24 network per composition
//! - **Persistence**: write-through JSONL store restored on start
//!
//! ```rust,ignore
//! use batch_scheduler::builders::build_scheduler;
//! use batch_scheduler::config::SchedulerConfig;
//! use batch_scheduler::runtime::TokioSpawner;
//! use tokio_util::sync::CancellationToken;
//!
//! let cfg = SchedulerConfig::from_env()?;
//! let scheduler = build_scheduler(&cfg, TokioSpawner::current()).await?;
//! let scope = CancellationToken::new();
//! scheduler.start(&scope);
//! ```

/// Core scheduling: tasks, actions, resource accounting and the scheduler loop.
pub mod core;
/// Configuration from the environment or JSON.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters for task persistence.
pub mod infra;
/// Runtime adapters and the transport-agnostic API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
