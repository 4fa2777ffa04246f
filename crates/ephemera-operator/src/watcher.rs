//! Readiness watcher
//!
//! One task per request that entered `waiting`. It polls the workload on a
//! fixed interval until it is ready (promote to `active`, which starts the
//! expiry clock), vanishes (`failed`) or the ceiling elapses (`failed` with a
//! timeout message). There is no backoff; the ceiling bounds the work.
//!
//! Every write is fenced on the generation the watch was armed with. A delete
//! or re-deploy bumps the generation, so a watch that outlives its request
//! stops at its next poll instead of overwriting the newer state.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ephemera_common::model::{LogEntry, RequestId, RequestStatus};
use ephemera_common::Error;

use crate::client::{Readiness, ResourceClient};
use crate::config::WatchSettings;
use crate::store::{Clock, RequestStore, Transition};

/// How a watch ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The request was promoted to `active`
    Activated,
    /// The workload disappeared
    Vanished,
    /// Readiness never arrived within the ceiling
    TimedOut,
    /// The request moved on (deleted, re-deployed, promoted elsewhere)
    Superseded,
}

/// Spawns and runs readiness watches
#[derive(Clone)]
pub struct ReadinessWatcher {
    store: Arc<dyn RequestStore>,
    resources: Arc<dyn ResourceClient>,
    settings: WatchSettings,
    watching: Arc<Mutex<HashSet<(RequestId, i64)>>>,
}

impl ReadinessWatcher {
    /// Create a watcher
    pub fn new(
        store: Arc<dyn RequestStore>,
        resources: Arc<dyn ResourceClient>,
        settings: WatchSettings,
    ) -> Self {
        Self {
            store,
            resources,
            settings,
            watching: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Start a background watch unless one is already running for this
    /// request generation
    pub async fn arm(&self, id: RequestId, generation: i64) -> Option<JoinHandle<WatchOutcome>> {
        if !self.watching.lock().await.insert((id, generation)) {
            debug!(request = %id, "Readiness watch already running");
            return None;
        }
        let watcher = self.clone();
        Some(tokio::spawn(async move {
            let outcome = match watcher.watch(id, generation).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(request = %id, error = %e, "Readiness watch aborted");
                    WatchOutcome::Superseded
                }
            };
            watcher.watching.lock().await.remove(&(id, generation));
            outcome
        }))
    }

    /// True if a watch is running for the request
    pub async fn is_watching(&self, id: &RequestId) -> bool {
        self.watching.lock().await.iter().any(|(watched, _)| watched == id)
    }

    /// Poll until the request resolves
    pub async fn watch(&self, id: RequestId, generation: i64) -> Result<WatchOutcome, Error> {
        let start = Instant::now();
        info!(request = %id, generation, "Watching for readiness");

        loop {
            let Some(request) = self.store.get(&id).await? else {
                return Ok(WatchOutcome::Superseded);
            };
            if request.status != RequestStatus::Waiting || request.generation != generation {
                debug!(request = %id, status = %request.status, "Watch superseded");
                return Ok(WatchOutcome::Superseded);
            }

            if start.elapsed() > self.settings.timeout {
                let message = format!(
                    "workload not ready after {}s",
                    self.settings.timeout.as_secs()
                );
                return self
                    .fail(id, generation, message, WatchOutcome::TimedOut)
                    .await;
            }

            match self.resources.readiness(&request.workload_name).await {
                Ok(Readiness::Ready) => {
                    let started_at = Utc::now();
                    let expire_at = request.expiry_from(started_at);
                    let transition = Transition::new(
                        &[RequestStatus::Waiting],
                        RequestStatus::Active,
                        LogEntry::info(format!(
                            "workload ready; request active, expires at {}",
                            expire_at.to_rfc3339()
                        )),
                    )
                    .fenced(generation)
                    .clock(Clock::Start {
                        started_at,
                        expire_at,
                    });
                    return Ok(match self.store.transition(&id, &transition).await? {
                        Some(_) => {
                            info!(request = %id, expire_at = %expire_at, "Request active");
                            WatchOutcome::Activated
                        }
                        None => WatchOutcome::Superseded,
                    });
                }
                Ok(Readiness::Missing) => {
                    let message = format!("workload {} disappeared", request.workload_name);
                    return self
                        .fail(id, generation, message, WatchOutcome::Vanished)
                        .await;
                }
                Ok(Readiness::Pending { desired, ready }) => {
                    debug!(request = %id, desired, ready, "Workload not ready yet");
                }
                Err(e) => {
                    warn!(request = %id, error = %e, "Readiness poll failed, retrying");
                }
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn fail(
        &self,
        id: RequestId,
        generation: i64,
        message: String,
        outcome: WatchOutcome,
    ) -> Result<WatchOutcome, Error> {
        let transition = Transition::new(
            &[RequestStatus::Waiting],
            RequestStatus::Failed,
            LogEntry::error(message.clone()),
        )
        .fenced(generation)
        .error(message.clone());
        match self.store.transition(&id, &transition).await? {
            Some(_) => {
                warn!(request = %id, error = %message, "Request failed");
                Ok(outcome)
            }
            None => Ok(WatchOutcome::Superseded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::client::MockResourceClient;
    use crate::store::MemoryStore;
    use crate::testing::{waiting_request, FakeCluster};

    fn settings() -> WatchSettings {
        WatchSettings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn promotes_once_ready_and_starts_clock() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(FakeCluster::new());
        let request = waiting_request(3600);
        cluster.add_deployment(&request.workload_name).await;
        store.put(request.clone()).await;

        let watcher = ReadinessWatcher::new(store.clone(), cluster.clone(), settings());
        let handle = watcher.arm(request.id, request.generation).await.unwrap();

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(
            store.get(&request.id).await.unwrap().unwrap().status,
            RequestStatus::Waiting
        );

        cluster.mark_ready(&request.workload_name).await;
        assert_eq!(handle.await.unwrap(), WatchOutcome::Activated);

        let row = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Active);
        let started = row.started_at.unwrap();
        assert!(started >= row.created_at);
        assert_eq!(row.expire_at, started + chrono::Duration::seconds(3600));
        assert_eq!(row.log.len(), 1);
        assert!(row.log[0].message.contains("expires at"));
        assert!(!watcher.is_watching(&request.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_never_ready() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(FakeCluster::new());
        let request = waiting_request(60);
        cluster.add_deployment(&request.workload_name).await;
        store.put(request.clone()).await;

        let watcher = ReadinessWatcher::new(store.clone(), cluster, settings());
        let outcome = watcher.watch(request.id, request.generation).await.unwrap();
        assert_eq!(outcome, WatchOutcome::TimedOut);

        let row = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Failed);
        assert!(row.error_message.unwrap().contains("not ready after 300s"));
        assert_eq!(row.expire_at, ephemera_common::model::far_future());
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_workload_fails_request() {
        let store = Arc::new(MemoryStore::new());
        let request = waiting_request(60);
        store.put(request.clone()).await;

        let mut client = MockResourceClient::new();
        client
            .expect_readiness()
            .times(1)
            .returning(|_| Ok(Readiness::Missing));

        let watcher = ReadinessWatcher::new(store.clone(), Arc::new(client), settings());
        let outcome = watcher.watch(request.id, request.generation).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Vanished);
        assert_eq!(
            store.get(&request.id).await.unwrap().unwrap().status,
            RequestStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_errors_keep_watching() {
        let store = Arc::new(MemoryStore::new());
        let request = waiting_request(60);
        store.put(request.clone()).await;

        let mut client = MockResourceClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_readiness()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        client
            .expect_readiness()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Readiness::Ready));

        let watcher = ReadinessWatcher::new(store.clone(), Arc::new(client), settings());
        let outcome = watcher.watch(request.id, request.generation).await.unwrap();
        assert_eq!(outcome, WatchOutcome::Activated);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_generation_fences_stale_watch() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(FakeCluster::new());
        let request = waiting_request(60);
        cluster.add_deployment(&request.workload_name).await;
        store.put(request.clone()).await;

        let watcher = ReadinessWatcher::new(store.clone(), cluster.clone(), settings());
        let handle = watcher.arm(request.id, request.generation).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        // A delete lands while the watch is between polls
        let delete = Transition::new(
            &[RequestStatus::Waiting],
            RequestStatus::Deleting,
            LogEntry::info("delete requested"),
        )
        .bump_generation();
        store.transition(&request.id, &delete).await.unwrap().unwrap();
        cluster.mark_ready(&request.workload_name).await;

        assert_eq!(handle.await.unwrap(), WatchOutcome::Superseded);
        let row = store.get(&request.id).await.unwrap().unwrap();
        assert_eq!(row.status, RequestStatus::Deleting);
        assert_eq!(row.log.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn arming_twice_runs_one_watch() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Arc::new(FakeCluster::new());
        let request = waiting_request(60);
        cluster.add_deployment(&request.workload_name).await;
        store.put(request.clone()).await;

        let watcher = ReadinessWatcher::new(store, cluster, settings());
        let first = watcher.arm(request.id, request.generation).await;
        let second = watcher.arm(request.id, request.generation).await;
        assert!(first.is_some());
        assert!(second.is_none());
        // A re-deploy starts a new generation, which gets its own watch
        assert!(watcher.arm(request.id, request.generation + 1).await.is_some());
    }
}
