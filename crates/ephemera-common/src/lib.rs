//! Common types for Ephemera: request model, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod lease;
pub mod model;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Default namespace for ephemeral workloads and the coordination lease
pub const DEFAULT_NAMESPACE: &str = "ephemera";

/// Port every ephemeral container listens on; the Service exposes the same port
pub const CONTAINER_PORT: i32 = 80;

/// Field manager used for all server-side writes
pub const FIELD_MANAGER: &str = "ephemera-operator";

/// Standard Kubernetes label for the application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";

/// Value of [`LABEL_NAME`] on every object this operator creates
pub const LABEL_NAME_EPHEMERA: &str = "ephemera";

/// Standard Kubernetes label for the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every object this operator creates
pub const LABEL_MANAGED_BY_EPHEMERA: &str = "ephemera";

/// Label carrying the owning request id
pub const LABEL_REQUEST_ID: &str = "ephemera.dev/request-id";

/// Label carrying the owning project id
pub const LABEL_PROJECT_ID: &str = "ephemera.dev/project-id";
