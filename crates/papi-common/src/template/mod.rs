//! Job-template engine with two-phase placeholder resolution
//!
//! Scheduler job templates mix two classes of `${...}` placeholders:
//!
//! - **User placeholders** (`${UPPERCASE}`) are substituted by PAPI from a
//!   user-supplied + system-derived map before submission.
//! - **Runtime placeholders** (`${meta.domain}`, `${attr.unique.hostname}`,
//!   anything not all-uppercase) are left untouched for the scheduler to
//!   resolve at launch.
//!
//! The engine tokenizes a template into literal / user / runtime fragments
//! and substitutes only the user kind. Substituted values are escaped so
//! they can never introduce new placeholders.

mod context;
mod engine;
mod error;

pub use context::SubstitutionMap;
pub use engine::{Fragment, JobTemplate};
pub use error::TemplateError;
