//! Resource client for the objects backing a request
//!
//! Create-or-update goes through server-side apply so a re-deploy converges
//! the existing objects instead of failing on "already exists". Deletes are
//! idempotent: a 404 is success, since teardown may be retried or finished by
//! another pass.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use ephemera_common::kube_utils::is_not_found;
use ephemera_common::{Error, FIELD_MANAGER};

/// Observed readiness of a workload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Ready replicas have caught up with desired replicas
    Ready,
    /// The workload exists but is not ready yet
    Pending {
        /// Desired replica count
        desired: i32,
        /// Ready replica count
        ready: i32,
    },
    /// No workload with that name exists
    Missing,
}

/// Cluster operations on the objects of one request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Create or update a Deployment
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error>;

    /// Create or update a Service
    async fn apply_service(&self, service: &Service) -> Result<(), Error>;

    /// Create or update a Secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error>;

    /// Delete a Deployment by name (404 is success)
    async fn delete_deployment(&self, name: &str) -> Result<(), Error>;

    /// Delete a Service by name (404 is success)
    async fn delete_service(&self, name: &str) -> Result<(), Error>;

    /// Delete a Secret by name (404 is success)
    async fn delete_secret(&self, name: &str) -> Result<(), Error>;

    /// Compare desired and ready replicas of a Deployment
    async fn readiness(&self, workload_name: &str) -> Result<Readiness, Error>;
}

/// Readiness of a fetched Deployment
pub fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0);
    if ready >= desired {
        Readiness::Ready
    } else {
        Readiness::Pending { desired, ready }
    }
}

/// Resource client backed by the API server
pub struct KubeResourceClient {
    client: Client,
    namespace: String,
}

impl KubeResourceClient {
    /// Create a client scoped to `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply<K>(&self, kind: &'static str, obj: &K) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + Serialize
            + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| Error::cluster(kind, "<unnamed>", "object has no name"))?;
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api::<K>()
            .patch(&name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| Error::cluster(kind, &name, e))?;
        debug!(kind = kind, name = %name, "Applied object");
        Ok(())
    }

    async fn delete<K>(&self, kind: &'static str, name: &str) -> Result<(), Error>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + std::fmt::Debug
            + DeserializeOwned,
        <K as Resource>::DynamicType: Default,
    {
        match self.api::<K>().delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = kind, name = %name, "Deleted object");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(kind = kind, name = %name, "Object already absent");
                Ok(())
            }
            Err(e) => Err(Error::cluster(kind, name, e)),
        }
    }
}

#[async_trait]
impl ResourceClient for KubeResourceClient {
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.apply("Deployment", deployment).await
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        self.apply("Service", service).await
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        self.apply("Secret", secret).await
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), Error> {
        self.delete::<Deployment>("Deployment", name).await
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        self.delete::<Service>("Service", name).await
    }

    async fn delete_secret(&self, name: &str) -> Result<(), Error> {
        self.delete::<Secret>("Secret", name).await
    }

    async fn readiness(&self, workload_name: &str) -> Result<Readiness, Error> {
        match self.api::<Deployment>().get(workload_name).await {
            Ok(deployment) => Ok(deployment_readiness(&deployment)),
            Err(e) if is_not_found(&e) => Ok(Readiness::Missing),
            Err(e) => Err(e.into()),
        }
    }
}
