//! Error type for template rendering

use thiserror::Error;

/// Errors produced while rendering a job template
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// A user placeholder in the template has no entry in the substitution map
    #[error("missing placeholder: template references ${{{0}}} but no value was provided")]
    MissingPlaceholder(String),
}

impl TemplateError {
    /// Name of the placeholder involved in this error
    pub fn placeholder(&self) -> &str {
        match self {
            TemplateError::MissingPlaceholder(name) => name,
        }
    }
}
