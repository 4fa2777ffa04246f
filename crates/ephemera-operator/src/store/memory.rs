//! Process-local request store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use ephemera_common::model::{
    EphemeralRequest, LogEntry, Project, ProjectId, RequestId, RequestStatus,
};
use ephemera_common::Error;

use super::{RequestStore, Transition};

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    requests: HashMap<RequestId, EphemeralRequest>,
}

/// In-memory store for single-instance runs and tests
///
/// One lock covers both tables, so every operation is atomic in the same way
/// a single-statement database write is.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a project
    pub async fn add_project(&self, project: Project) {
        self.tables.write().await.projects.insert(project.id, project);
    }

    /// Forget a project, leaving its requests behind as orphans
    pub async fn remove_project(&self, id: &ProjectId) {
        self.tables.write().await.projects.remove(id);
    }
}

fn oldest_first(mut requests: Vec<EphemeralRequest>) -> Vec<EphemeralRequest> {
    requests.sort_by_key(|r| r.created_at);
    requests
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>, Error> {
        Ok(self.tables.read().await.projects.get(id).cloned())
    }

    async fn insert(&self, request: &EphemeralRequest) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        let taken = tables.requests.values().any(|r| {
            r.project_id == request.project_id
                && r.spec.path == request.spec.path
                && r.status != RequestStatus::Deleted
        });
        if taken {
            return Err(Error::conflict(format!(
                "path {} is already in use in project {}",
                request.spec.path, request.project_id
            )));
        }
        if tables.requests.contains_key(&request.id) {
            return Err(Error::conflict(format!("request {} already exists", request.id)));
        }
        tables.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: &RequestId) -> Result<Option<EphemeralRequest>, Error> {
        Ok(self.tables.read().await.requests.get(id).cloned())
    }

    async fn update_spec(
        &self,
        request: &EphemeralRequest,
        restart_expiry: Option<DateTime<Utc>>,
        entry: LogEntry,
    ) -> Result<Option<EphemeralRequest>, Error> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.requests.get_mut(&request.id) else {
            return Ok(None);
        };
        row.spec = request.spec.clone();
        row.secret_name = request.secret_name.clone();
        if let (Some(expire_at), RequestStatus::Active) = (restart_expiry, row.status) {
            row.expire_at = expire_at;
        }
        row.log.push(entry);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn transition(
        &self,
        id: &RequestId,
        transition: &Transition,
    ) -> Result<Option<EphemeralRequest>, Error> {
        let mut tables = self.tables.write().await;
        let Some(row) = tables.requests.get_mut(id) else {
            return Ok(None);
        };
        if !transition.matches(row) {
            return Ok(None);
        }
        transition.apply_to(row, Utc::now());
        Ok(Some(row.clone()))
    }

    async fn append_log(&self, id: &RequestId, entry: LogEntry) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if let Some(row) = tables.requests.get_mut(id) {
            row.log.push(entry);
            row.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let tables = self.tables.read().await;
        Ok(oldest_first(
            tables
                .requests
                .values()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect(),
        ))
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let tables = self.tables.read().await;
        let mut expired: Vec<_> = tables
            .requests
            .values()
            .filter(|r| RequestStatus::RECLAIMABLE.contains(&r.status) && r.expire_at <= now)
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expire_at);
        expired.truncate(limit);
        Ok(expired)
    }

    async fn list_stuck(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<EphemeralRequest>, Error> {
        let tables = self.tables.read().await;
        Ok(oldest_first(
            tables
                .requests
                .values()
                .filter(|r| r.status == status && r.updated_at < older_than)
                .cloned()
                .collect(),
        ))
    }

    async fn delete_orphans(&self) -> Result<Vec<RequestId>, Error> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let orphans: Vec<RequestId> = tables
            .requests
            .values()
            .filter(|r| !tables.projects.contains_key(&r.project_id))
            .map(|r| r.id)
            .collect();
        for id in &orphans {
            tables.requests.remove(id);
        }
        Ok(orphans)
    }

    async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, Error> {
        let mut tables = self.tables.write().await;
        let before = tables.requests.len();
        tables
            .requests
            .retain(|_, r| !(r.status == RequestStatus::Deleted && r.updated_at < older_than));
        Ok((before - tables.requests.len()) as u64)
    }

    async fn count_active_in_project(&self, project_id: &ProjectId) -> Result<u64, Error> {
        let tables = self.tables.read().await;
        Ok(tables
            .requests
            .values()
            .filter(|r| &r.project_id == project_id && r.status != RequestStatus::Deleted)
            .count() as u64)
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Overwrite a row directly, bypassing transition rules
    pub(crate) async fn put(&self, request: EphemeralRequest) {
        self.tables
            .write()
            .await
            .requests
            .insert(request.id, request);
    }
}
