//! Shared foundations of the Platform API
//!
//! Holds everything the subsystem crates agree on: the immutable startup
//! configuration, the error taxonomy, workload kinds, user-config schemas,
//! the job-template engine and telemetry initialization.

pub mod config;
pub mod error;
pub mod kinds;
pub mod retry;
pub mod schema;
pub mod telemetry;
pub mod template;

pub use config::{EnvConfig, MainConfig, WorkloadAssets};
pub use error::{Error, Result};
pub use kinds::WorkloadKind;
