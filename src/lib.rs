//! # Prospector Core - Lead-Acquisition Pipeline Orchestrator
//!
//! Sequences four long-running external phases (search, analysis, content
//! generation, content refinement) for one project at a time:
//! - Durable run and job rows with optimistic, version-checked writes
//! - A change feed that wakes waiters when a job row moves
//! - One server-resident driver per running pipeline
//! - A watchdog that fails jobs whose heartbeat went quiet
//! - Idempotent `recover` and cooperative `cancel`
//! - Composite 0-100 progress derived from per-phase counters
//! - TCP+msgpack IPC for the UI layer and the external execution system
//!
//! ## Architecture
//!
//! ```text
//!   IPC clients ─►  Orchestrator ──► RecoveryController ──► PhaseExecutor ──► HTTP
//!                       │                  ▲
//!                       ├─ DriverRegistry ─┤ (one PipelineDriver per run)
//!                       └─ Watchdog ───────┘
//!                       │
//!                  StateStore (memory | sqlite) ──► ChangeFeed
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod ipc;
pub mod orchestrator;
pub mod store;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
