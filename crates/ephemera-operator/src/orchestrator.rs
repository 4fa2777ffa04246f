//! Lifecycle orchestrator
//!
//! The only component that starts lifecycle transitions on behalf of
//! callers. Validation runs before anything is written; cluster mutation
//! failures during a synchronous create or deploy leave the request in
//! `failed` with the cause recorded, and are returned to the caller.
//!
//! ```text
//! (none) ──create──► creating ──objects applied──► waiting ──ready──► active
//!    │                  │                             │                  │
//!    └─no cluster─► draft   └──apply error──► failed ◄─timeout/vanished──┘
//!
//! any of draft/creating/waiting/active/failed ──delete/expiry──► deleting ──► deleted
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use ephemera_common::kube_utils::ResourceNames;
use ephemera_common::model::{
    EphemeralRequest, LogEntry, ProjectId, RequestId, RequestPatch, RequestSpec, RequestStatus,
};
use ephemera_common::Error;
use ephemera_workload::{validate_spec, ResourceBuilder};

use crate::client::ResourceClient;
use crate::config::OrchestratorConfig;
use crate::routing::{RouteMultiplexer, RouteTarget};
use crate::store::{Clock, RequestStore, Transition};
use crate::watcher::ReadinessWatcher;

/// Cluster-side collaborators; absent when cluster access is disabled
#[derive(Clone)]
pub struct Cluster {
    /// Workload, service and secret operations
    pub resources: Arc<dyn ResourceClient>,
    /// Per-project routing
    pub routes: Arc<dyn RouteMultiplexer>,
}

/// A request together with the URL it is reachable at
#[derive(Clone, Debug, Serialize)]
pub struct RequestView {
    /// Stored state, including the log
    #[serde(flatten)]
    pub request: EphemeralRequest,
    /// Reachable URL
    pub url: String,
}

/// Drives requests through their lifecycle
pub struct Orchestrator {
    store: Arc<dyn RequestStore>,
    cluster: Option<Cluster>,
    watcher: Option<ReadinessWatcher>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator. Without a cluster every new request is a draft.
    pub fn new(
        store: Arc<dyn RequestStore>,
        cluster: Option<Cluster>,
        config: OrchestratorConfig,
    ) -> Self {
        let watcher = cluster.as_ref().map(|c| {
            ReadinessWatcher::new(store.clone(), c.resources.clone(), config.watch)
        });
        Self {
            store,
            cluster,
            watcher,
            config,
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Cluster collaborators, when cluster access is enabled
    pub fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    /// Readiness watcher, when cluster access is enabled
    pub fn watcher(&self) -> Option<&ReadinessWatcher> {
        self.watcher.as_ref()
    }

    /// Configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Reachable URL of a request
    pub fn url_for(&self, request: &EphemeralRequest) -> String {
        let scheme = if self.config.tls_enabled { "https" } else { "http" };
        let host = self
            .route_host(request)
            .unwrap_or_else(|| "localhost".to_string());
        format!("{scheme}://{host}{}", request.spec.path)
    }

    fn route_host(&self, request: &EphemeralRequest) -> Option<String> {
        request
            .spec
            .ingress_host
            .clone()
            .or_else(|| self.config.ingress_host.clone())
    }

    fn route_for(&self, request: &EphemeralRequest) -> RouteTarget {
        RouteTarget {
            project_id: request.project_id,
            host: self.route_host(request),
            path: request.spec.path.clone(),
            service_name: request.service_name.clone(),
        }
    }

    fn view(&self, request: EphemeralRequest) -> RequestView {
        let url = self.url_for(&request);
        RequestView { request, url }
    }

    async fn load(&self, id: &RequestId) -> Result<EphemeralRequest, Error> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| Error::request_not_found(id))
    }

    /// Accept a new request. Lands in `creating` and is deployed immediately
    /// when cluster access is available, otherwise in `draft`.
    pub async fn create(&self, project_id: ProjectId, spec: RequestSpec) -> Result<RequestView, Error> {
        validate_spec(&spec, &self.config.builder)?;
        if self.store.project(&project_id).await?.is_none() {
            return Err(Error::project_not_found(project_id));
        }

        let now = Utc::now();
        let (status, entry) = match self.cluster {
            Some(_) => (RequestStatus::Creating, LogEntry::info("request accepted; creating objects")),
            None => (
                RequestStatus::Draft,
                LogEntry::warning("request accepted as draft; cluster access unavailable"),
            ),
        };
        let mut request = EphemeralRequest::new(project_id, spec, status, now);
        request.log.push(entry);
        self.store.insert(&request).await?;
        info!(
            request = %request.id,
            project = %project_id,
            path = %request.spec.path,
            status = %request.status,
            "Request created"
        );

        if request.status == RequestStatus::Creating {
            request = self.provision(request).await?;
        }
        Ok(self.view(request))
    }

    /// Current state of a request, including its log
    pub async fn get(&self, id: &RequestId) -> Result<RequestView, Error> {
        Ok(self.view(self.load(id).await?))
    }

    /// Change mutable fields. Status is untouched; a TTL change on an active
    /// request restarts the expiry clock from now.
    pub async fn update(&self, id: &RequestId, patch: RequestPatch) -> Result<RequestView, Error> {
        let current = self.load(id).await?;
        if matches!(
            current.status,
            RequestStatus::Deleting | RequestStatus::Deleted
        ) {
            return Err(Error::conflict(format!(
                "request {id} is {} and can no longer be updated",
                current.status
            )));
        }

        let spec = patch.apply_to(&current.spec);
        validate_spec(&spec, &self.config.builder)?;

        let mut updated = current.clone();
        updated.spec = spec;
        if !updated.spec.env.is_empty() && updated.secret_name.is_none() {
            updated.secret_name = ResourceNames::for_request(&updated.id, true).secret;
        }

        let changed = changed_fields(&patch);
        let restart_expiry = patch
            .ttl_seconds
            .map(|ttl| Utc::now() + chrono::Duration::seconds(ttl));
        let mut message = format!("updated {}", changed.join(", "));
        if let (Some(expire_at), RequestStatus::Active) = (restart_expiry, current.status) {
            message.push_str(&format!("; expires at {}", expire_at.to_rfc3339()));
        }

        let stored = self
            .store
            .update_spec(&updated, restart_expiry, LogEntry::info(message))
            .await?
            .ok_or_else(|| Error::request_not_found(id))?;
        info!(request = %id, fields = ?changed, "Request updated");
        let stored = self.move_route(&current, stored).await?;
        Ok(self.view(stored))
    }

    /// Routes are matched on host and path, so a host change has to drop the
    /// rule under the old host. Waiting and active requests are re-routed
    /// right away; others pick up the new host on their next deploy.
    async fn move_route(
        &self,
        before: &EphemeralRequest,
        after: EphemeralRequest,
    ) -> Result<EphemeralRequest, Error> {
        let Some(cluster) = &self.cluster else {
            return Ok(after);
        };
        let old = self.route_for(before);
        let new = self.route_for(&after);
        if old.host == new.host || before.status == RequestStatus::Draft {
            return Ok(after);
        }

        let mut failures = Vec::new();
        if let Err(e) = cluster.routes.remove_path(&old).await {
            failures.push(e);
        }
        if matches!(after.status, RequestStatus::Waiting | RequestStatus::Active) {
            if let Err(e) = cluster.routes.add_path(&new).await {
                failures.push(e);
            }
        }
        if failures.is_empty() {
            info!(request = %after.id, old = ?old.host, new = ?new.host, "Route moved");
            return Ok(after);
        }

        for e in &failures {
            warn!(request = %after.id, error = %e, "Route move failed");
            self.store
                .append_log(&after.id, LogEntry::warning(format!("route unavailable: {e}")))
                .await?;
        }
        self.load(&after.id).await
    }

    /// Apply the request's objects again. Valid from `draft`, `creating`,
    /// `waiting`, `active` and `failed`; an active request stays active.
    pub async fn deploy(&self, id: &RequestId) -> Result<RequestView, Error> {
        let current = self.load(id).await?;
        if !RequestStatus::DEPLOYABLE.contains(&current.status) {
            return Err(Error::conflict(format!(
                "request {id} cannot be deployed from {}",
                current.status
            )));
        }
        if self.cluster.is_none() {
            return Err(Error::conflict(format!(
                "request {id} cannot be deployed: cluster access unavailable"
            )));
        }

        if current.status == RequestStatus::Active {
            let transition = Transition::new(
                &[RequestStatus::Active],
                RequestStatus::Active,
                LogEntry::info("redeploying active request"),
            )
            .fenced(current.generation)
            .bump_generation();
            let request = self
                .store
                .transition(id, &transition)
                .await?
                .ok_or_else(|| Error::conflict(format!("request {id} changed during deploy")))?;
            let request = self.apply_objects(request).await?;
            return Ok(self.view(request));
        }

        let transition = Transition::new(
            &RequestStatus::DEPLOYABLE,
            RequestStatus::Creating,
            LogEntry::info(format!("deploy requested from {}", current.status)),
        )
        .fenced(current.generation)
        .bump_generation()
        .clock(Clock::Reset);
        let request = self
            .store
            .transition(id, &transition)
            .await?
            .ok_or_else(|| Error::conflict(format!("request {id} changed during deploy")))?;
        info!(request = %id, generation = request.generation, "Deploying request");
        let request = self.provision(request).await?;
        Ok(self.view(request))
    }

    /// Delete a request. Idempotent: an already deleted request is left as is.
    pub async fn delete(&self, id: &RequestId) -> Result<(), Error> {
        let current = self.load(id).await?;
        match current.status {
            RequestStatus::Deleted => Ok(()),
            RequestStatus::Deleting => self.teardown(current).await.map(|_| ()),
            _ => {
                self.reclaim(&current, "delete requested").await?;
                Ok(())
            }
        }
    }

    /// Move a request to `deleting` and tear it down. Returns false when the
    /// request was no longer in a deletable state.
    pub async fn reclaim(&self, request: &EphemeralRequest, reason: &str) -> Result<bool, Error> {
        let transition = Transition::new(
            &RequestStatus::DELETABLE,
            RequestStatus::Deleting,
            LogEntry::info(reason),
        )
        .bump_generation();
        let Some(deleting) = self.store.transition(&request.id, &transition).await? else {
            return Ok(false);
        };
        info!(request = %request.id, reason = %reason, "Tearing down request");
        self.teardown(deleting).await?;
        Ok(true)
    }

    /// Attempt every deletion, then mark the request `deleted`. The first
    /// failure is recorded but never blocks the transition.
    async fn teardown(&self, request: EphemeralRequest) -> Result<EphemeralRequest, Error> {
        let mut first_error: Option<Error> = None;
        let mut record = |e: Error| {
            warn!(request = %request.id, error = %e, "Teardown step failed");
            first_error.get_or_insert(e);
        };

        if let Some(cluster) = &self.cluster {
            if let Err(e) = cluster.routes.remove_path(&self.route_for(&request)).await {
                record(e);
            }
            if let Err(e) = cluster.resources.delete_deployment(&request.workload_name).await {
                record(e);
            }
            if let Err(e) = cluster.resources.delete_service(&request.service_name).await {
                record(e);
            }
            if let Some(secret) = &request.secret_name {
                if let Err(e) = cluster.resources.delete_secret(secret).await {
                    record(e);
                }
            }
        }

        let mut transition = match &first_error {
            None => Transition::new(
                &[RequestStatus::Deleting],
                RequestStatus::Deleted,
                LogEntry::info("teardown complete"),
            ),
            Some(e) => Transition::new(
                &[RequestStatus::Deleting],
                RequestStatus::Deleted,
                LogEntry::warning(format!("teardown finished with errors: {e}")),
            )
            .error(e.to_string()),
        };
        transition = transition.fenced(request.generation);

        match self.store.transition(&request.id, &transition).await? {
            Some(deleted) => {
                info!(request = %request.id, "Request deleted");
                Ok(deleted)
            }
            None => Ok(request),
        }
    }

    /// Apply objects for a request in `creating`, then hand it to the
    /// readiness watcher in `waiting`. Failures mark the request `failed`.
    async fn provision(&self, request: EphemeralRequest) -> Result<EphemeralRequest, Error> {
        let id = request.id;
        let generation = request.generation;
        let request = self.apply_objects(request).await?;

        let transition = Transition::new(
            &[RequestStatus::Creating],
            RequestStatus::Waiting,
            LogEntry::info("objects applied; waiting for readiness"),
        )
        .fenced(generation);
        let Some(waiting) = self.store.transition(&id, &transition).await? else {
            return Ok(request);
        };
        info!(request = %id, "Request waiting for readiness");

        if let Some(watcher) = &self.watcher {
            watcher.arm(id, waiting.generation).await;
        }
        Ok(waiting)
    }

    /// Build and apply the request's objects and route. A route failure is
    /// logged against the request but does not fail it.
    async fn apply_objects(&self, request: EphemeralRequest) -> Result<EphemeralRequest, Error> {
        let Some(cluster) = &self.cluster else {
            return Err(Error::internal_with_context(
                "orchestrator",
                "cluster access unavailable",
            ));
        };

        if let Err(e) = self.apply_workload(cluster, &request).await {
            return Err(self.mark_failed(&request, e).await);
        }

        if let Err(e) = cluster.routes.add_path(&self.route_for(&request)).await {
            warn!(request = %request.id, error = %e, "Route unavailable");
            self.store
                .append_log(
                    &request.id,
                    LogEntry::warning(format!("route unavailable: {e}")),
                )
                .await?;
        }
        Ok(request)
    }

    async fn apply_workload(&self, cluster: &Cluster, request: &EphemeralRequest) -> Result<(), Error> {
        let compiled = ResourceBuilder::new(&self.config.builder, &self.config.namespace)
            .build(request)?;

        match (&compiled.secret, &request.secret_name) {
            (Some(secret), _) => cluster.resources.apply_secret(secret).await?,
            // Env was cleared since the secret was created
            (None, Some(stale)) => cluster.resources.delete_secret(stale).await?,
            (None, None) => {}
        }
        cluster.resources.apply_deployment(&compiled.deployment).await?;
        cluster.resources.apply_service(&compiled.service).await?;
        Ok(())
    }

    async fn mark_failed(&self, request: &EphemeralRequest, cause: Error) -> Error {
        let message = cause.to_string();
        let transition = Transition::new(
            &[
                RequestStatus::Creating,
                RequestStatus::Waiting,
                RequestStatus::Active,
            ],
            RequestStatus::Failed,
            LogEntry::error(format!("object creation failed: {message}")),
        )
        .fenced(request.generation)
        .error(message.clone());
        match self.store.transition(&request.id, &transition).await {
            Ok(_) => warn!(request = %request.id, error = %message, "Request failed"),
            Err(e) => warn!(request = %request.id, error = %e, "Could not record failure"),
        }
        cause
    }
}

fn changed_fields(patch: &RequestPatch) -> Vec<String> {
    let mut fields = Vec::new();
    if patch.image.is_some() {
        fields.push("image".to_string());
    }
    if patch.env.is_some() {
        fields.push("env".to_string());
    }
    if patch.replicas.is_some() {
        fields.push("replicas".to_string());
    }
    if patch.resources.is_some() {
        fields.push("resources".to_string());
    }
    if patch.overrides.is_some() {
        fields.push("overrides".to_string());
    }
    if patch.ttl_seconds.is_some() {
        fields.push("ttl".to_string());
    }
    if patch.ingress_host.is_some() {
        fields.push("ingress host".to_string());
    }
    if fields.is_empty() {
        fields.push("nothing".to_string());
    }
    fields
}
