//! Persistence for ephemeral requests
//!
//! Every status change is one conditional single-row write: a [`Transition`]
//! names the statuses it may start from and, optionally, the generation it
//! was computed against. A transition that no longer matches the row does
//! nothing and reports so, which is how concurrent writers (orchestrator,
//! readiness watcher, reconciler) avoid clobbering each other.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use ephemera_common::model::{
    far_future, EphemeralRequest, LogEntry, Project, ProjectId, RequestId, RequestStatus,
};
use ephemera_common::Error;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Effect of a transition on the expiry clock
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Clock {
    /// Leave `started_at` and `expire_at` untouched
    #[default]
    Keep,
    /// Start the clock: the request just became active
    Start {
        /// Activation instant
        started_at: DateTime<Utc>,
        /// `started_at` + TTL
        expire_at: DateTime<Utc>,
    },
    /// Return to the pre-active placeholder
    Reset,
}

/// A conditional status change
#[derive(Clone, Debug)]
pub struct Transition {
    /// Statuses the row must currently be in
    pub from: Vec<RequestStatus>,
    /// Status written on success
    pub to: RequestStatus,
    /// Generation the row must currently have
    pub expected_generation: Option<i64>,
    /// Increment the generation on success
    pub bump_generation: bool,
    /// Effect on `started_at` / `expire_at`
    pub clock: Clock,
    /// New `error_message`; `None` clears it
    pub error: Option<String>,
    /// Log entry appended on success
    pub entry: LogEntry,
}

impl Transition {
    /// Transition from any of `from` to `to`, recording `entry`
    pub fn new(from: &[RequestStatus], to: RequestStatus, entry: LogEntry) -> Self {
        Self {
            from: from.to_vec(),
            to,
            expected_generation: None,
            bump_generation: false,
            clock: Clock::Keep,
            error: None,
            entry,
        }
    }

    /// Only apply if the row is still at `generation`
    pub fn fenced(mut self, generation: i64) -> Self {
        self.expected_generation = Some(generation);
        self
    }

    /// Start a new generation
    pub fn bump_generation(mut self) -> Self {
        self.bump_generation = true;
        self
    }

    /// Set the clock effect
    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Record a failure message
    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    /// True if the transition applies to `request`
    pub fn matches(&self, request: &EphemeralRequest) -> bool {
        self.from.contains(&request.status)
            && self
                .expected_generation
                .is_none_or(|g| g == request.generation)
    }

    /// Apply the transition to an in-memory copy of a row
    pub fn apply_to(&self, request: &mut EphemeralRequest, now: DateTime<Utc>) {
        request.status = self.to;
        if self.bump_generation {
            request.generation += 1;
        }
        match self.clock {
            Clock::Keep => {}
            Clock::Start {
                started_at,
                expire_at,
            } => {
                request.started_at = Some(started_at);
                request.expire_at = expire_at;
            }
            Clock::Reset => {
                request.started_at = None;
                request.expire_at = far_future();
            }
        }
        request.error_message = self.error.clone();
        request.log.push(self.entry.clone());
        request.updated_at = now;
    }
}

/// Storage for requests; projects are read-only
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Look up a project
    async fn project(&self, id: &ProjectId) -> Result<Option<Project>, Error>;

    /// Insert a new request; `Conflict` if the project already uses its path
    async fn insert(&self, request: &EphemeralRequest) -> Result<(), Error>;

    /// Fetch a request
    async fn get(&self, id: &RequestId) -> Result<Option<EphemeralRequest>, Error>;

    /// Write the spec and secret name of `request` and append `entry`. When
    /// `restart_expiry` is set and the row is `active` at write time, its
    /// expiry moves to that instant. Returns the stored row, or `None` if it
    /// no longer exists.
    async fn update_spec(
        &self,
        request: &EphemeralRequest,
        restart_expiry: Option<DateTime<Utc>>,
        entry: LogEntry,
    ) -> Result<Option<EphemeralRequest>, Error>;

    /// Apply a conditional transition. Returns the updated row when it
    /// applied, `None` when the row is missing or no longer matches.
    async fn transition(
        &self,
        id: &RequestId,
        transition: &Transition,
    ) -> Result<Option<EphemeralRequest>, Error>;

    /// Append a log entry without changing status
    async fn append_log(&self, id: &RequestId, entry: LogEntry) -> Result<(), Error>;

    /// Requests in any of `statuses`, oldest first
    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
    ) -> Result<Vec<EphemeralRequest>, Error>;

    /// Reclaimable requests whose expiry has passed, oldest expiry first
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EphemeralRequest>, Error>;

    /// Requests in `status` not written since `older_than`
    async fn list_stuck(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<EphemeralRequest>, Error>;

    /// Delete requests whose project no longer exists; returns their ids
    async fn delete_orphans(&self) -> Result<Vec<RequestId>, Error>;

    /// Physically remove `deleted` rows last written before `older_than`
    async fn purge_deleted(&self, older_than: DateTime<Utc>) -> Result<u64, Error>;

    /// Requests of a project that are not yet `deleted`
    async fn count_active_in_project(&self, project_id: &ProjectId) -> Result<u64, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_common::model::RequestSpec;
    use uuid::Uuid;

    fn request(status: RequestStatus) -> EphemeralRequest {
        let spec = RequestSpec {
            path: "/demo".to_string(),
            image: "nginx:latest".to_string(),
            ttl_seconds: 60,
            ..Default::default()
        };
        EphemeralRequest::new(Uuid::new_v4(), spec, status, Utc::now())
    }

    #[test]
    fn matches_requires_source_status_and_generation() {
        let req = request(RequestStatus::Waiting);
        let t = Transition::new(
            &[RequestStatus::Waiting],
            RequestStatus::Active,
            LogEntry::info("ready"),
        );
        assert!(t.matches(&req));
        assert!(t.clone().fenced(1).matches(&req));
        assert!(!t.clone().fenced(2).matches(&req));

        let creating = request(RequestStatus::Creating);
        assert!(!t.matches(&creating));
    }

    #[test]
    fn apply_appends_one_entry_and_moves_clock() {
        let mut req = request(RequestStatus::Waiting);
        let now = Utc::now();
        let expire_at = now + chrono::Duration::seconds(60);
        Transition::new(
            &[RequestStatus::Waiting],
            RequestStatus::Active,
            LogEntry::info("ready"),
        )
        .clock(Clock::Start {
            started_at: now,
            expire_at,
        })
        .apply_to(&mut req, now);

        assert_eq!(req.status, RequestStatus::Active);
        assert_eq!(req.log.len(), 1);
        assert_eq!(req.expire_at, expire_at);
        assert_eq!(req.generation, 1);

        Transition::new(
            &[RequestStatus::Active],
            RequestStatus::Creating,
            LogEntry::info("redeploy"),
        )
        .bump_generation()
        .clock(Clock::Reset)
        .apply_to(&mut req, now);
        assert_eq!(req.generation, 2);
        assert_eq!(req.expire_at, far_future());
        assert!(req.started_at.is_none());
        assert_eq!(req.log.len(), 2);
    }
}
