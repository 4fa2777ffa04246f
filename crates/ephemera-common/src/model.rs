//! Ephemeral request model
//!
//! An [`EphemeralRequest`] is one time-bounded, URL-addressable workload.
//! Its lifecycle status is the closed set [`RequestStatus`]; its log is an
//! append-only list of [`LogEntry`] values.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;

/// Identifier of an ephemeral request
pub type RequestId = Uuid;

/// Identifier of a project
pub type ProjectId = Uuid;

/// Placeholder expiry for requests that have not reached `active`.
///
/// Expiry sweeps select on `expire_at <= now`, so this value keeps
/// pre-active requests out of every sweep.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Lifecycle status of an ephemeral request
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    /// Accepted but no cluster objects exist
    #[default]
    Draft,
    /// Cluster objects are being created
    Creating,
    /// Objects exist, waiting for the workload to become ready
    Waiting,
    /// Workload is ready and the expiry clock is running
    Active,
    /// Teardown in progress
    Deleting,
    /// Teardown attempted; row purged after the retention window
    Deleted,
    /// Creation or readiness failed
    Failed,
}

impl RequestStatus {
    /// Every status, in lifecycle order
    pub const ALL: [RequestStatus; 7] = [
        Self::Draft,
        Self::Creating,
        Self::Waiting,
        Self::Active,
        Self::Deleting,
        Self::Deleted,
        Self::Failed,
    ];

    /// Statuses from which an explicit deploy is accepted
    pub const DEPLOYABLE: [RequestStatus; 5] = [
        Self::Draft,
        Self::Creating,
        Self::Waiting,
        Self::Active,
        Self::Failed,
    ];

    /// Statuses from which a delete starts teardown
    pub const DELETABLE: [RequestStatus; 5] = [
        Self::Draft,
        Self::Creating,
        Self::Waiting,
        Self::Active,
        Self::Failed,
    ];

    /// Statuses the expiry sweep may reclaim
    pub const RECLAIMABLE: [RequestStatus; 3] = [Self::Active, Self::Waiting, Self::Failed];

    /// Statuses the reconciler compares against observed cluster state
    pub const IN_FLIGHT: [RequestStatus; 3] = [Self::Creating, Self::Waiting, Self::Active];

    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Creating => "creating",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "creating" => Ok(Self::Creating),
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "deleting" => Ok(Self::Deleting),
            "deleted" => Ok(Self::Deleted),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::serialization(format!("unknown request status: {s}"))),
        }
    }
}

/// Severity of a log entry
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Normal progress
    Info,
    /// Degraded but not failed
    Warning,
    /// Failure
    Error,
}

/// One lifecycle event in a request's log
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct LogEntry {
    /// When the event happened
    pub at: DateTime<Utc>,
    /// Severity
    pub level: LogLevel,
    /// Human-readable description
    pub message: String,
}

impl LogEntry {
    /// Informational entry stamped now
    pub fn info(message: impl Into<String>) -> Self {
        Self::at(Utc::now(), LogLevel::Info, message)
    }

    /// Warning entry stamped now
    pub fn warning(message: impl Into<String>) -> Self {
        Self::at(Utc::now(), LogLevel::Warning, message)
    }

    /// Error entry stamped now
    pub fn error(message: impl Into<String>) -> Self {
        Self::at(Utc::now(), LogLevel::Error, message)
    }

    /// Entry with an explicit timestamp
    pub fn at(at: DateTime<Utc>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            at,
            level,
            message: message.into(),
        }
    }
}

/// A name/value environment entry
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    pub value: String,
}

impl EnvVar {
    /// Create an env entry
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// CPU and memory requests and limits
///
/// Absent values are filled with defaults by the resource builder; a blank
/// limit never reaches the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// CPU request (e.g., "100m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    /// CPU limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Memory request (e.g., "128Mi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    /// Memory limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// A host device exposed inside the container
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMapping {
    /// Absolute device path on the node
    pub host_path: String,
    /// Absolute path inside the container; defaults to the host path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
}

/// Container-level overrides
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverrides {
    /// Working directory (absolute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Entrypoint override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Arguments override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Allocate a TTY
    #[serde(default)]
    pub tty: bool,
    /// Keep stdin open
    #[serde(default)]
    pub stdin: bool,
    /// Host device mappings
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceMapping>,
}

impl ContainerOverrides {
    /// True when no override is set
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Caller-supplied definition of an ephemeral workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    /// Routing path, unique within the project (e.g., "/pr-42")
    pub path: String,
    /// Container image reference
    pub image: String,
    /// Ordered environment entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    /// Replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Resource requests and limits
    #[serde(default)]
    pub resources: ResourceSpec,
    /// Container overrides
    #[serde(default, skip_serializing_if = "ContainerOverrides::is_empty")]
    pub overrides: ContainerOverrides,
    /// Time-to-live in seconds, counted from the moment the request becomes active
    pub ttl_seconds: i64,
    /// Routing host override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_host: Option<String>,
}

/// Partial update of the mutable fields of a request
///
/// `None` leaves a field unchanged. `ingress_host: Some(None)` clears the
/// host override.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestPatch {
    /// New image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Replacement environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,
    /// New replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Replacement resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    /// Replacement overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ContainerOverrides>,
    /// New time-to-live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<i64>,
    /// New host override; an explicit `null` clears it
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub ingress_host: Option<Option<String>>,
}

/// Marks a field as present even when its value is `null`
fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl RequestPatch {
    /// Apply this patch to a spec, returning the merged spec
    pub fn apply_to(&self, spec: &RequestSpec) -> RequestSpec {
        let mut merged = spec.clone();
        if let Some(ref image) = self.image {
            merged.image = image.clone();
        }
        if let Some(ref env) = self.env {
            merged.env = env.clone();
        }
        if let Some(replicas) = self.replicas {
            merged.replicas = Some(replicas);
        }
        if let Some(ref resources) = self.resources {
            merged.resources = resources.clone();
        }
        if let Some(ref overrides) = self.overrides {
            merged.overrides = overrides.clone();
        }
        if let Some(ttl) = self.ttl_seconds {
            merged.ttl_seconds = ttl;
        }
        if let Some(ref host) = self.ingress_host {
            merged.ingress_host = host.clone();
        }
        merged
    }
}

/// A project, owned by the external CRUD layer
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Project {
    /// Project id
    pub id: ProjectId,
    /// Display name
    pub name: String,
}

/// The central entity: one ephemeral URL and its backing objects
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralRequest {
    /// Identity
    pub id: RequestId,
    /// Owning project
    pub project_id: ProjectId,
    /// Caller-supplied definition
    pub spec: RequestSpec,
    /// Lifecycle status
    pub status: RequestStatus,
    /// Incremented by every deploy and delete; fences readiness watches
    pub generation: i64,
    /// Deployment name (fixed at creation)
    pub workload_name: String,
    /// Service name (fixed at creation)
    pub service_name: String,
    /// Secret name, present only when env entries were declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    /// Last failure surfaced to callers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Append-only lifecycle log
    #[serde(default)]
    pub log: Vec<LogEntry>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write
    pub updated_at: DateTime<Utc>,
    /// When the request became active
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Expiry instant; [`far_future`] until active
    pub expire_at: DateTime<Utc>,
}

impl EphemeralRequest {
    /// Build a new request in the given initial status with names assigned
    pub fn new(
        project_id: ProjectId,
        spec: RequestSpec,
        status: RequestStatus,
        now: DateTime<Utc>,
    ) -> Self {
        let id = Uuid::new_v4();
        let names = crate::kube_utils::ResourceNames::for_request(&id, !spec.env.is_empty());
        Self {
            id,
            project_id,
            spec,
            status,
            generation: 1,
            workload_name: names.workload,
            service_name: names.service,
            secret_name: names.secret,
            error_message: None,
            log: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            expire_at: far_future(),
        }
    }

    /// Expiry instant for a request that becomes active at `started_at`
    pub fn expiry_from(&self, started_at: DateTime<Utc>) -> DateTime<Utc> {
        started_at + chrono::Duration::seconds(self.spec.ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn patch_distinguishes_null_host_from_absent() {
        let cleared: RequestPatch = serde_json::from_str(r#"{"ingressHost": null}"#).unwrap();
        assert_eq!(cleared.ingress_host, Some(None));

        let untouched: RequestPatch = serde_json::from_str("{}").unwrap();
        assert_eq!(untouched.ingress_host, None);

        let set: RequestPatch =
            serde_json::from_str(r#"{"ingressHost": "pr.example.com"}"#).unwrap();
        assert_eq!(set.ingress_host, Some(Some("pr.example.com".to_string())));

        let json = serde_json::to_string(&cleared).unwrap();
        assert_eq!(json, r#"{"ingressHost":null}"#);
        let back: RequestPatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cleared);
    }

    #[test]
    fn cleared_host_patch_removes_override() {
        let spec = RequestSpec {
            ingress_host: Some("pr.example.com".to_string()),
            ..Default::default()
        };
        let patch: RequestPatch = serde_json::from_str(r#"{"ingressHost": null}"#).unwrap();
        assert_eq!(patch.apply_to(&spec).ingress_host, None);
    }

    #[test]
    fn status_round_trips_through_storage_string() {
        for status in RequestStatus::ALL {
            assert_eq!(RequestStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(RequestStatus::from_str("running").is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&RequestStatus::Deleting).unwrap();
        assert_eq!(json, "\"deleting\"");
    }

    #[test]
    fn new_request_is_immune_to_expiry() {
        let spec = RequestSpec {
            path: "/demo".to_string(),
            image: "nginx:latest".to_string(),
            ttl_seconds: 30,
            ..Default::default()
        };
        let req = EphemeralRequest::new(Uuid::new_v4(), spec, RequestStatus::Creating, Utc::now());
        assert_eq!(req.expire_at, far_future());
        assert!(req.started_at.is_none());
        assert!(req.secret_name.is_none());
        assert_eq!(req.workload_name, req.service_name);
    }

    #[test]
    fn secret_name_assigned_only_with_env() {
        let spec = RequestSpec {
            path: "/demo".to_string(),
            image: "nginx:latest".to_string(),
            env: vec![EnvVar::new("MODE", "preview")],
            ttl_seconds: 60,
            ..Default::default()
        };
        let req = EphemeralRequest::new(Uuid::new_v4(), spec, RequestStatus::Creating, Utc::now());
        assert_eq!(
            req.secret_name.as_deref(),
            Some(format!("{}-env", req.workload_name).as_str())
        );
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let spec = RequestSpec {
            path: "/demo".to_string(),
            image: "nginx:1.25".to_string(),
            ttl_seconds: 600,
            ingress_host: Some("demo.example.com".to_string()),
            ..Default::default()
        };
        let patch = RequestPatch {
            image: Some("nginx:1.27".to_string()),
            ingress_host: Some(None),
            ..Default::default()
        };
        let merged = patch.apply_to(&spec);
        assert_eq!(merged.image, "nginx:1.27");
        assert_eq!(merged.ttl_seconds, 600);
        assert_eq!(merged.path, "/demo");
        assert!(merged.ingress_host.is_none());
    }
}
