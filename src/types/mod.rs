//! Core types for the prospector orchestrator.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (PipelineId, PhaseJobId, etc.)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for server, orchestration, executor and store

mod config;
mod errors;
mod ids;

pub use config::{
    Config, ExecutorConfig, IpcConfig, ObservabilityConfig, OrchestrationConfig, PhaseTimeouts,
    ProgressConfig, ServerConfig, StoreConfig,
};
pub use errors::{Error, Result};
pub use ids::{PhaseJobId, PipelineId, ProjectId, UserId};
