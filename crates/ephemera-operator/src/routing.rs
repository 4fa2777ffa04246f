//! Per-project routing
//!
//! Every project owns one Ingress and each ephemeral path is one rule inside
//! it. Many requests mutate the same object, so writes are JSON patches
//! guarded by `test` operations: an append tests the resourceVersion it was
//! computed against, a removal tests the path and backend at the index it
//! targets. A failed guard (409/422) re-reads the object and tries again.

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, TestOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use ephemera_common::kube_utils::{
    is_conflict, is_patch_test_failure, object_meta, project_labels, route_name,
};
use ephemera_common::model::ProjectId;
use ephemera_common::retry::{retry_with_backoff_if, RetryConfig};
use ephemera_common::{Error, CONTAINER_PORT};

/// Attempts per routing mutation before giving up
pub const ROUTE_PATCH_ATTEMPTS: u32 = 5;

/// One path rule inside a project's routing object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    /// Owning project
    pub project_id: ProjectId,
    /// Host the rule matches; any host when unset
    pub host: Option<String>,
    /// Path prefix
    pub path: String,
    /// Backend service
    pub service_name: String,
}

/// Adds and removes path rules on a project's routing object
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteMultiplexer: Send + Sync {
    /// Ensure a rule for the target exists; a no-op when it already does
    async fn add_path(&self, route: &RouteTarget) -> Result<(), Error>;

    /// Remove the rule for the target; a no-op when it is already gone
    async fn remove_path(&self, route: &RouteTarget) -> Result<(), Error>;
}

/// Rule for a single route
pub fn rule_for(route: &RouteTarget) -> IngressRule {
    IngressRule {
        host: route.host.clone(),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some(route.path.clone()),
                path_type: "Prefix".to_string(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: route.service_name.clone(),
                        port: Some(ServiceBackendPort {
                            number: Some(CONTAINER_PORT),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

fn rule_path(rule: &IngressRule) -> Option<&str> {
    rule.http
        .as_ref()
        .and_then(|h| h.paths.first())
        .and_then(|p| p.path.as_deref())
}

fn rule_service(rule: &IngressRule) -> Option<&str> {
    rule.http
        .as_ref()
        .and_then(|h| h.paths.first())
        .and_then(|p| p.backend.service.as_ref())
        .map(|s| s.name.as_str())
}

/// Index of the rule matching the target's host and path
pub fn find_rule(ingress: &Ingress, route: &RouteTarget) -> Option<usize> {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())?
        .iter()
        .position(|rule| rule.host == route.host && rule_path(rule) == Some(route.path.as_str()))
}

/// Patch appending the target's rule, guarded by the object's resourceVersion
pub fn append_patch(ingress: &Ingress, route: &RouteTarget) -> Result<json_patch::Patch, Error> {
    let mut ops = Vec::new();
    if let Some(rv) = &ingress.metadata.resource_version {
        ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(["metadata", "resourceVersion"]),
            value: Value::String(rv.clone()),
        }));
    }

    let rule = serde_json::to_value(rule_for(route))?;
    let has_rules = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .is_some();
    if has_rules {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "rules", "-"]),
            value: rule,
        }));
    } else {
        ops.push(PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "rules"]),
            value: Value::Array(vec![rule]),
        }));
    }
    Ok(json_patch::Patch(ops))
}

/// Patch removing the rule at `index`, guarded by that rule's path and backend
pub fn remove_patch(ingress: &Ingress, index: usize) -> Result<json_patch::Patch, Error> {
    let rule = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .and_then(|rules| rules.get(index))
        .ok_or_else(|| Error::internal_with_context("routing", format!("no rule at index {index}")))?;
    let idx = index.to_string();

    let mut ops = Vec::new();
    if let Some(path) = rule_path(rule) {
        ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens(["spec", "rules", idx.as_str(), "http", "paths", "0", "path"]),
            value: Value::String(path.to_string()),
        }));
    }
    if let Some(service) = rule_service(rule) {
        ops.push(PatchOperation::Test(TestOperation {
            path: PointerBuf::from_tokens([
                "spec", "rules", idx.as_str(), "http", "paths", "0", "backend", "service", "name",
            ]),
            value: Value::String(service.to_string()),
        }));
    }
    ops.push(PatchOperation::Remove(RemoveOperation {
        path: PointerBuf::from_tokens(["spec", "rules", idx.as_str()]),
    }));
    Ok(json_patch::Patch(ops))
}

/// New routing object holding exactly one rule
pub fn build_ingress(
    name: &str,
    namespace: &str,
    ingress_class: Option<&str>,
    tls_secret: Option<&str>,
    route: &RouteTarget,
) -> Ingress {
    Ingress {
        metadata: object_meta(name, namespace, project_labels(&route.project_id)),
        spec: Some(IngressSpec {
            ingress_class_name: ingress_class.map(str::to_string),
            rules: Some(vec![rule_for(route)]),
            tls: tls_secret.map(|secret| {
                vec![IngressTLS {
                    hosts: None,
                    secret_name: Some(secret.to_string()),
                }]
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Route multiplexer writing networking.k8s.io/v1 Ingress objects
pub struct IngressRouteMultiplexer {
    client: Client,
    namespace: String,
    ingress_class: Option<String>,
    tls_secret: Option<String>,
    retry: RetryConfig,
}

impl IngressRouteMultiplexer {
    /// Create a multiplexer writing into `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            ingress_class: None,
            tls_secret: None,
            retry: RetryConfig::with_max_attempts(ROUTE_PATCH_ATTEMPTS),
        }
    }

    /// Set the IngressClass of created routing objects
    pub fn with_ingress_class(mut self, class: Option<String>) -> Self {
        self.ingress_class = class;
        self
    }

    /// Terminate TLS with the given secret
    pub fn with_tls_secret(mut self, secret: Option<String>) -> Self {
        self.tls_secret = secret;
        self
    }

    fn api(&self) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn try_add(&self, name: &str, route: &RouteTarget) -> Result<(), Error> {
        let api = self.api();
        match api.get_opt(name).await? {
            None => {
                let ingress = build_ingress(
                    name,
                    &self.namespace,
                    self.ingress_class.as_deref(),
                    self.tls_secret.as_deref(),
                    route,
                );
                // A concurrent create surfaces as 409 and is retried as an append
                api.create(&PostParams::default(), &ingress).await?;
                info!(route = %name, path = %route.path, "Created routing object");
            }
            Some(ingress) => {
                if find_rule(&ingress, route).is_some() {
                    debug!(route = %name, path = %route.path, "Rule already present");
                    return Ok(());
                }
                let patch = append_patch(&ingress, route)?;
                api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
                    .await?;
                info!(route = %name, path = %route.path, "Appended rule");
            }
        }
        Ok(())
    }

    async fn try_remove(&self, name: &str, route: &RouteTarget) -> Result<(), Error> {
        let api = self.api();
        let Some(ingress) = api.get_opt(name).await? else {
            debug!(route = %name, "Routing object absent, nothing to remove");
            return Ok(());
        };
        let Some(index) = find_rule(&ingress, route) else {
            debug!(route = %name, path = %route.path, "Rule already gone");
            return Ok(());
        };
        let patch = remove_patch(&ingress, index)?;
        api.patch(name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await?;
        info!(route = %name, path = %route.path, "Removed rule");
        Ok(())
    }
}

fn is_contended(e: &kube::Error) -> bool {
    is_conflict(e) || is_patch_test_failure(e)
}

fn should_retry(e: &Error) -> bool {
    matches!(e, Error::Kube { source } if is_contended(source))
}

fn into_cluster_error(name: &str, e: Error) -> Error {
    match e {
        Error::Kube { source } => Error::cluster("Ingress", name, source),
        other => other,
    }
}

#[async_trait]
impl RouteMultiplexer for IngressRouteMultiplexer {
    async fn add_path(&self, route: &RouteTarget) -> Result<(), Error> {
        let name = route_name(&route.project_id);
        retry_with_backoff_if(&self.retry, "add_path", should_retry, || {
            self.try_add(&name, route)
        })
        .await
        .map_err(|e| into_cluster_error(&name, e))
    }

    async fn remove_path(&self, route: &RouteTarget) -> Result<(), Error> {
        let name = route_name(&route.project_id);
        retry_with_backoff_if(&self.retry, "remove_path", should_retry, || {
            self.try_remove(&name, route)
        })
        .await
        .map_err(|e| into_cluster_error(&name, e))
    }
}
