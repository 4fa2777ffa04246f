//! Compilation error types

use ephemera_common::Error;

/// Errors raised while validating or compiling a request
#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    /// A field failed validation
    #[error("{field}: {message}")]
    InvalidField {
        /// Field path (e.g., "overrides.devices[0].hostPath")
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// The request is missing a name the builder needs
    #[error("request has no {0} assigned")]
    MissingName(&'static str),
}

impl CompilationError {
    /// Create an invalid-field error
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<CompilationError> for Error {
    fn from(e: CompilationError) -> Self {
        match e {
            CompilationError::InvalidField { field, message } => {
                Error::validation_for_field(field.clone(), format!("{field}: {message}"))
            }
            other => Error::validation(other.to_string()),
        }
    }
}
