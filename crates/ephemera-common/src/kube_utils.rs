//! Shared Kubernetes utilities using kube-rs
//!
//! Naming, ownership labels and API error classification used by the
//! resource builder, the resource client and the route multiplexer.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Client, Config};
use uuid::Uuid;

use crate::model::{ProjectId, RequestId};
use crate::Error;

/// Number of hex characters of an id used in object names
pub const NAME_ID_LEN: usize = 12;

/// Prefix of workload and service names
pub const WORKLOAD_PREFIX: &str = "eph-";

/// Prefix of per-project routing object names
pub const ROUTE_PREFIX: &str = "eph-route-";

/// Suffix of env secret names
pub const SECRET_SUFFIX: &str = "-env";

/// Default connect timeout for API server connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for API server requests
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..NAME_ID_LEN].to_string()
}

/// Object names derived from a request id
///
/// Computed once at request creation and stored; never recomputed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceNames {
    /// Deployment name
    pub workload: String,
    /// Service name
    pub service: String,
    /// Secret name when the request declares env entries
    pub secret: Option<String>,
}

impl ResourceNames {
    /// Derive names for a request
    pub fn for_request(id: &RequestId, with_secret: bool) -> Self {
        let base = format!("{}{}", WORKLOAD_PREFIX, short_id(id));
        Self {
            secret: with_secret.then(|| format!("{}{}", base, SECRET_SUFFIX)),
            service: base.clone(),
            workload: base,
        }
    }
}

/// Name of the routing object shared by all requests of a project
pub fn route_name(project_id: &ProjectId) -> String {
    format!("{}{}", ROUTE_PREFIX, short_id(project_id))
}

/// Ownership labels attached to every object created for a request
pub fn ownership_labels(request_id: &RequestId, project_id: &ProjectId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            crate::LABEL_NAME.to_string(),
            crate::LABEL_NAME_EPHEMERA.to_string(),
        ),
        (crate::LABEL_REQUEST_ID.to_string(), request_id.to_string()),
        (crate::LABEL_PROJECT_ID.to_string(), project_id.to_string()),
        (
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_EPHEMERA.to_string(),
        ),
    ])
}

/// Labels for a routing object, which belongs to a project rather than a request
pub fn project_labels(project_id: &ProjectId) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            crate::LABEL_NAME.to_string(),
            crate::LABEL_NAME_EPHEMERA.to_string(),
        ),
        (crate::LABEL_PROJECT_ID.to_string(), project_id.to_string()),
        (
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_EPHEMERA.to_string(),
        ),
    ])
}

/// ObjectMeta for a namespaced object with the given labels
pub fn object_meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// True if the error is an API 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True if the error is an API 409 (already exists / resourceVersion mismatch)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True if a JSON patch `test` operation failed (422 Unprocessable Entity)
pub fn is_patch_test_failure(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 422)
}

/// Create a kube client with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an explicit kubeconfig or the ambient configuration
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kc, &kube::config::KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("invalid kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context(
                "create_client",
                format!("failed to infer kube config: {}", e),
            )
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);

    Client::try_from(config).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn names_are_deterministic_and_fixed_length() {
        let id = Uuid::parse_str("0123456789abcdef0123456789abcdef").unwrap();
        let names = ResourceNames::for_request(&id, true);
        assert_eq!(names.workload, "eph-0123456789ab");
        assert_eq!(names.service, "eph-0123456789ab");
        assert_eq!(names.secret.as_deref(), Some("eph-0123456789ab-env"));
        assert_eq!(ResourceNames::for_request(&id, true), names);
        assert!(ResourceNames::for_request(&id, false).secret.is_none());
    }

    #[test]
    fn route_name_is_per_project() {
        let a = Uuid::parse_str("aaaaaaaaaaaa4aaa8aaaaaaaaaaaaaaa").unwrap();
        assert_eq!(route_name(&a), "eph-route-aaaaaaaaaaaa");
    }

    #[test]
    fn ownership_labels_identify_request_and_project() {
        let req = Uuid::new_v4();
        let project = Uuid::new_v4();
        let labels = ownership_labels(&req, &project);
        assert_eq!(labels.get(crate::LABEL_REQUEST_ID), Some(&req.to_string()));
        assert_eq!(labels.get(crate::LABEL_PROJECT_ID), Some(&project.to_string()));
        assert_eq!(
            labels.get(crate::LABEL_MANAGED_BY).map(String::as_str),
            Some("ephemera")
        );
        assert!(!project_labels(&project).contains_key(crate::LABEL_REQUEST_ID));
    }

    #[test]
    fn classifies_api_errors() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(is_conflict(&api_error(409)));
        assert!(is_patch_test_failure(&api_error(422)));
    }
}
