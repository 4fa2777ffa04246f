//! Error types for the Ephemera operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants follow the failure categories the orchestrator distinguishes:
//! validation and lookup failures are returned to the caller, cluster
//! mutation failures are recorded against the request, and everything else
//! is operational.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Ephemera operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Request rejected before any mutation
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.resources.cpuLimit")
        field: Option<String>,
    },

    /// Unknown project or request
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("project", "request")
        kind: &'static str,
        /// The identifier that did not resolve
        id: String,
    },

    /// Uniqueness or state conflict
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflict
        message: String,
    },

    /// A cluster object could not be created, updated or deleted
    #[error("cluster error [{kind}/{name}]: {message}")]
    Cluster {
        /// Object kind (Deployment, Service, Secret, Ingress)
        kind: String,
        /// Object name
        name: String,
        /// Underlying cause
        message: String,
    },

    /// Persistence store error
    #[error("store error [{context}]: {message}")]
    Store {
        /// Operation that failed
        context: String,
        /// Underlying cause
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for a request id
    pub fn request_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "request",
            id: id.to_string(),
        }
    }

    /// Create a not-found error for a project id
    pub fn project_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            kind: "project",
            id: id.to_string(),
        }
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a cluster mutation error for an object
    pub fn cluster(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl ToString,
    ) -> Self {
        Self::Cluster {
            kind: kind.into(),
            name: name.into(),
            message: msg.to_string(),
        }
    }

    /// Create a store error
    pub fn store(context: impl Into<String>, msg: impl ToString) -> Self {
        Self::Store {
            context: context.into(),
            message: msg.to_string(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, lookup and conflict errors require a different request.
    /// Kubernetes errors are retryable unless the API server answered 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::NotFound { .. } => false,
            Error::Conflict { .. } => false,
            Error::Cluster { .. } => true,
            Error::Store { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_field_and_are_not_retryable() {
        let err = Error::validation_for_field("spec.ttlSeconds", "ttl must be positive");
        assert!(err.to_string().contains("ttl must be positive"));
        assert!(!err.is_retryable());
        match err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("spec.ttlSeconds")),
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn not_found_names_the_kind() {
        let err = Error::request_not_found("abc");
        assert_eq!(err.to_string(), "request not found: abc");
        let err = Error::project_not_found("p1");
        assert_eq!(err.to_string(), "project not found: p1");
    }

    #[test]
    fn cluster_errors_preserve_cause_and_object() {
        let err = Error::cluster("Deployment", "eph-0123", "admission webhook denied");
        let msg = err.to_string();
        assert!(msg.contains("Deployment/eph-0123"));
        assert!(msg.contains("admission webhook denied"));
        assert!(err.is_retryable());
    }

    #[test]
    fn kube_client_errors_are_not_retryable() {
        let err = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "forbidden".to_string(),
            reason: "Forbidden".to_string(),
            code: 403,
        }));
        assert!(!err.is_retryable());

        let err = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcdserver: request timed out".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }));
        assert!(err.is_retryable());
    }
}
