//! HTTP surface of the Platform API
//!
//! Brokers researcher access to the shared compute cluster: catalog
//! resolution, deployment lifecycle, quota admission, secrets, snapshots,
//! try-me sandboxes, function services, stats and the LLM proxy.

pub mod auth;
pub mod cache;
pub mod catalog;
pub mod clients;
pub mod deployments;
pub mod error;
pub mod inference;
pub mod llm;
pub mod quotas;
pub mod router;
pub mod secrets;
pub mod snapshots;
pub mod state;
pub mod stats;
pub mod tryme;

pub use router::build_router;
pub use state::AppState;
