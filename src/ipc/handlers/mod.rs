//! Per-service IPC handlers.

pub mod phase_job;
pub mod pipeline;
pub mod validation;
