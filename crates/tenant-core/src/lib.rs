//! Tenant lifecycle orchestration: ordered provisioning steps executed as a
//! saga, with reverse-order compensation when a step fails.

pub mod config;
pub mod directory;
pub mod error;
pub mod io;
pub mod model;
pub mod orchestrator;
pub mod status;
pub mod step;
pub mod tx;

pub use error::{CompensationFailure, Result, TenantError};
pub use orchestrator::TenantOrchestrator;
