//! Typed client for the scheduler HTTP API
//!
//! PAPI holds no persistent deployment state of its own: the scheduler's
//! jobs and allocations are the source of truth, and this crate translates
//! them into the scheduler-independent records the rest of the API serves.

pub mod client;
pub mod deployments;
pub mod nodes;
pub mod types;

pub use client::NomadClient;
pub use deployments::{Deployment, DeploymentStatus};
