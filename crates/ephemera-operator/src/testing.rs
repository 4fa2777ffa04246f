//! In-memory fakes for scenario tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Secret, Service};
use tokio::sync::Mutex;
use uuid::Uuid;

use ephemera_common::model::{EphemeralRequest, Project, ProjectId, RequestSpec, RequestStatus};
use ephemera_common::Error;

use crate::client::{Readiness, ResourceClient};
use crate::config::OrchestratorConfig;
use crate::orchestrator::{Cluster, Orchestrator};
use crate::routing::{RouteMultiplexer, RouteTarget};
use crate::store::MemoryStore;

#[derive(Default)]
struct ClusterState {
    deployments: HashSet<String>,
    ready: HashSet<String>,
    services: HashSet<String>,
    secrets: HashSet<String>,
}

/// Cluster that records applied object names
#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn add_deployment(&self, name: &str) {
        self.state.lock().await.deployments.insert(name.to_string());
    }

    pub(crate) async fn mark_ready(&self, name: &str) {
        self.state.lock().await.ready.insert(name.to_string());
    }

    /// Simulates an out-of-band deletion
    pub(crate) async fn remove_deployment(&self, name: &str) {
        let mut state = self.state.lock().await;
        state.deployments.remove(name);
        state.ready.remove(name);
    }

    pub(crate) async fn has_deployment(&self, name: &str) -> bool {
        self.state.lock().await.deployments.contains(name)
    }

    pub(crate) async fn has_service(&self, name: &str) -> bool {
        self.state.lock().await.services.contains(name)
    }

    pub(crate) async fn has_secret(&self, name: &str) -> bool {
        self.state.lock().await.secrets.contains(name)
    }

    pub(crate) async fn deployment_count(&self) -> usize {
        self.state.lock().await.deployments.len()
    }
}

fn name_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}

#[async_trait]
impl ResourceClient for FakeCluster {
    async fn apply_deployment(&self, deployment: &Deployment) -> Result<(), Error> {
        self.add_deployment(&name_of(&deployment.metadata)).await;
        Ok(())
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        let name = name_of(&service.metadata);
        self.state.lock().await.services.insert(name);
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), Error> {
        let name = name_of(&secret.metadata);
        self.state.lock().await.secrets.insert(name);
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), Error> {
        self.remove_deployment(name).await;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        self.state.lock().await.services.remove(name);
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), Error> {
        self.state.lock().await.secrets.remove(name);
        Ok(())
    }

    async fn readiness(&self, name: &str) -> Result<Readiness, Error> {
        let state = self.state.lock().await;
        Ok(if !state.deployments.contains(name) {
            Readiness::Missing
        } else if state.ready.contains(name) {
            Readiness::Ready
        } else {
            Readiness::Pending {
                desired: 1,
                ready: 0,
            }
        })
    }
}

type Rule = (Option<String>, String);

/// Routing that keeps one (host, path) rule list per project
#[derive(Default)]
pub(crate) struct FakeRoutes {
    rules: Mutex<HashMap<ProjectId, Vec<Rule>>>,
    failure: Mutex<Option<String>>,
}

impl FakeRoutes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn rules(&self, project: &ProjectId) -> Vec<Rule> {
        self.rules
            .lock()
            .await
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn paths(&self, project: &ProjectId) -> Vec<String> {
        self.rules(project).await.into_iter().map(|(_, path)| path).collect()
    }

    /// Make every subsequent `add_path` fail with `message`
    pub(crate) async fn fail_with(&self, message: &str) {
        *self.failure.lock().await = Some(message.to_string());
    }
}

#[async_trait]
impl RouteMultiplexer for FakeRoutes {
    async fn add_path(&self, route: &RouteTarget) -> Result<(), Error> {
        if let Some(message) = self.failure.lock().await.clone() {
            return Err(Error::cluster(
                "Ingress",
                ephemera_common::kube_utils::route_name(&route.project_id),
                message,
            ));
        }
        let rule = (route.host.clone(), route.path.clone());
        let mut rules = self.rules.lock().await;
        let project = rules.entry(route.project_id).or_default();
        if !project.contains(&rule) {
            project.push(rule);
        }
        Ok(())
    }

    async fn remove_path(&self, route: &RouteTarget) -> Result<(), Error> {
        if let Some(project) = self.rules.lock().await.get_mut(&route.project_id) {
            project.retain(|(host, path)| host != &route.host || path != &route.path);
        }
        Ok(())
    }
}

pub(crate) fn nginx_spec(path: &str, ttl_seconds: i64) -> RequestSpec {
    RequestSpec {
        path: path.to_string(),
        image: "nginx:latest".to_string(),
        ttl_seconds,
        ..Default::default()
    }
}

/// A request already in `waiting`, owned by an unregistered project
pub(crate) fn waiting_request(ttl_seconds: i64) -> EphemeralRequest {
    EphemeralRequest::new(
        Uuid::new_v4(),
        nginx_spec("/watch", ttl_seconds),
        RequestStatus::Waiting,
        Utc::now(),
    )
}

pub(crate) async fn add_project(store: &Arc<MemoryStore>) -> ProjectId {
    let project = Project {
        id: Uuid::new_v4(),
        name: "preview".to_string(),
    };
    let id = project.id;
    store.add_project(project).await;
    id
}

pub(crate) struct Harness {
    pub(crate) orchestrator: Arc<Orchestrator>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) cluster: Arc<FakeCluster>,
    pub(crate) routes: Arc<FakeRoutes>,
    pub(crate) project: ProjectId,
}

pub(crate) fn default_config() -> OrchestratorConfig {
    OrchestratorConfig {
        ingress_host: Some("preview.example.com".to_string()),
        ..Default::default()
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with(default_config()).await
}

pub(crate) async fn harness_with(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let cluster = Arc::new(FakeCluster::new());
    let routes = Arc::new(FakeRoutes::new());
    let project = add_project(&store).await;
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Some(Cluster {
            resources: cluster.clone(),
            routes: routes.clone(),
        }),
        config,
    ));
    Harness {
        orchestrator,
        store,
        cluster,
        routes,
        project,
    }
}
