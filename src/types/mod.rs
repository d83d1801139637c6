//! Core types for the office kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (ProcessId, FlowId, EscalationId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for teams, governance and timeouts

mod config;
mod errors;
mod ids;

pub use config::{
    AsynchronousFlowConfig, ExecutorConfig, GovernanceConfig, KernelConfig, ObservabilityConfig,
    ShutdownConfig, TeamConfig,
};
pub use errors::{BoxError, Error, Result};
pub use ids::{EscalationId, FlowId, ProcessId};
