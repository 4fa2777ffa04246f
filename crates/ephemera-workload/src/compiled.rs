//! Compiled output types

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};

/// Cluster objects backing one ephemeral request
#[derive(Clone, Debug)]
pub struct CompiledResources {
    /// Workload controller
    pub deployment: Deployment,
    /// ClusterIP service in front of the workload
    pub service: Service,
    /// Env secret, present only when the request declares env entries
    pub secret: Option<Secret>,
}
