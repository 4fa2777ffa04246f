//! Periodic reconciliation and cleanup
//!
//! Each tick runs under the distributed lock and performs, in order:
//!
//! 1. Orphan sweep: drop requests whose project no longer exists
//! 2. Status reconciliation: compare recorded status with observed workload
//!    readiness, then purge old `deleted` rows
//! 3. Stuck sweep: fail requests that never left `creating`
//! 4. Expiry sweep: tear down requests whose TTL has elapsed
//!
//! A failing step is logged and the next one still runs. Every step is safe
//! to re-run, so an interrupted tick is simply finished by the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ephemera_common::lease::DistributedLock;
use ephemera_common::model::{EphemeralRequest, LogEntry, RequestStatus};
use ephemera_common::Error;

use crate::client::Readiness;
use crate::config::{Environment, ReconcilerSettings};
use crate::orchestrator::Orchestrator;
use crate::store::{Clock, Transition};

/// What one tick changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Requests removed because their project is gone
    pub orphans: usize,
    /// Requests promoted to `active` by observation
    pub promoted: usize,
    /// Requests whose workload vanished (failed or demoted)
    pub missing: usize,
    /// Waiting requests handed back to the readiness watcher
    pub rearmed: usize,
    /// `deleted` rows physically removed
    pub purged: u64,
    /// Requests failed for sitting in `creating` too long
    pub stuck: usize,
    /// Expired requests torn down
    pub expired: usize,
}

/// Lock-guarded periodic sweeper
pub struct Reconciler {
    orchestrator: Arc<Orchestrator>,
    lock: Arc<dyn DistributedLock>,
    settings: ReconcilerSettings,
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now - chrono::Duration::seconds(age.as_secs() as i64)
}

impl Reconciler {
    /// Create a reconciler
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        lock: Arc<dyn DistributedLock>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            orchestrator,
            lock,
            settings,
        }
    }

    /// Run ticks on the configured period until `shutdown` resolves
    pub async fn run(&self, shutdown: impl std::future::Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.settings.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Reconciler stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Reconcile tick failed");
                    }
                }
            }
        }
    }

    /// Run one tick. Returns `None` when another instance holds the lock.
    pub async fn tick(&self) -> Result<Option<TickReport>, Error> {
        if !self.lock.try_acquire().await? {
            debug!(identity = %self.lock.identity(), "Reconcile lock held elsewhere, skipping tick");
            return Ok(None);
        }

        let report = self.sweep().await;

        if let Err(e) = self.lock.release().await {
            warn!(error = %e, "Failed to release reconcile lock");
        }
        info!(
            orphans = report.orphans,
            promoted = report.promoted,
            missing = report.missing,
            rearmed = report.rearmed,
            purged = report.purged,
            stuck = report.stuck,
            expired = report.expired,
            "Reconcile tick complete"
        );
        Ok(Some(report))
    }

    async fn sweep(&self) -> TickReport {
        let mut report = TickReport::default();

        match self.sweep_orphans().await {
            Ok(n) => report.orphans = n,
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }
        if let Err(e) = self.reconcile_statuses(&mut report).await {
            warn!(error = %e, "Status reconciliation failed");
        }
        let now = Utc::now();
        match self
            .orchestrator
            .store()
            .purge_deleted(before(now, self.settings.deleted_retention))
            .await
        {
            Ok(n) => report.purged = n,
            Err(e) => warn!(error = %e, "Purge of deleted requests failed"),
        }
        match self.sweep_stuck().await {
            Ok(n) => report.stuck = n,
            Err(e) => warn!(error = %e, "Stuck sweep failed"),
        }
        match self.sweep_expired().await {
            Ok(n) => report.expired = n,
            Err(e) => warn!(error = %e, "Expiry sweep failed"),
        }
        report
    }

    async fn sweep_orphans(&self) -> Result<usize, Error> {
        let removed = self.orchestrator.store().delete_orphans().await?;
        for id in &removed {
            info!(request = %id, "Removed orphaned request");
        }
        Ok(removed.len())
    }

    async fn reconcile_statuses(&self, report: &mut TickReport) -> Result<(), Error> {
        let Some(cluster) = self.orchestrator.cluster() else {
            debug!("No cluster access, skipping status reconciliation");
            return Ok(());
        };

        let grace_start = before(Utc::now(), self.settings.creating_grace);
        let requests = self
            .orchestrator
            .store()
            .list_by_status(&RequestStatus::IN_FLIGHT)
            .await?;

        for request in requests {
            // Fresh `creating` rows belong to an in-progress create or deploy
            if request.status == RequestStatus::Creating && request.updated_at > grace_start {
                continue;
            }
            let observed = match cluster.resources.readiness(&request.workload_name).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(request = %request.id, error = %e, "Readiness check failed");
                    continue;
                }
            };
            match self.reconcile_one(&request, observed).await {
                Ok(Some(Outcome::Promoted)) => report.promoted += 1,
                Ok(Some(Outcome::Missing)) => report.missing += 1,
                Ok(Some(Outcome::Rearmed)) => report.rearmed += 1,
                Ok(None) => {}
                Err(e) => warn!(request = %request.id, error = %e, "Failed to reconcile request"),
            }
        }
        Ok(())
    }

    async fn reconcile_one(
        &self,
        request: &EphemeralRequest,
        observed: Readiness,
    ) -> Result<Option<Outcome>, Error> {
        let store = self.orchestrator.store();
        match observed {
            Readiness::Missing => {
                let message = format!("workload {} is missing", request.workload_name);
                let transition = match self.orchestrator.config().environment {
                    Environment::Production => Transition::new(
                        &[request.status],
                        RequestStatus::Failed,
                        LogEntry::error(message.clone()),
                    )
                    .error(message.clone()),
                    Environment::Development => Transition::new(
                        &[request.status],
                        RequestStatus::Draft,
                        LogEntry::warning(format!("{message}; demoted to draft")),
                    )
                    .clock(Clock::Reset),
                }
                .fenced(request.generation);

                Ok(match store.transition(&request.id, &transition).await? {
                    Some(updated) => {
                        warn!(
                            request = %request.id,
                            status = %updated.status,
                            "Workload missing"
                        );
                        Some(Outcome::Missing)
                    }
                    None => None,
                })
            }
            Readiness::Ready if request.status != RequestStatus::Active => {
                let started_at = Utc::now();
                let expire_at = request.expiry_from(started_at);
                let transition = Transition::new(
                    &[request.status],
                    RequestStatus::Active,
                    LogEntry::info(format!(
                        "workload observed ready; request active, expires at {}",
                        expire_at.to_rfc3339()
                    )),
                )
                .fenced(request.generation)
                .clock(Clock::Start {
                    started_at,
                    expire_at,
                });

                Ok(match store.transition(&request.id, &transition).await? {
                    Some(_) => {
                        info!(request = %request.id, expire_at = %expire_at, "Request promoted");
                        Some(Outcome::Promoted)
                    }
                    None => None,
                })
            }
            Readiness::Pending { .. } if request.status == RequestStatus::Waiting => {
                let Some(watcher) = self.orchestrator.watcher() else {
                    return Ok(None);
                };
                Ok(watcher
                    .arm(request.id, request.generation)
                    .await
                    .map(|_| Outcome::Rearmed))
            }
            _ => Ok(None),
        }
    }

    async fn sweep_stuck(&self) -> Result<usize, Error> {
        let store = self.orchestrator.store();
        let cutoff = before(Utc::now(), self.settings.stuck_after);
        let stuck = store.list_stuck(RequestStatus::Creating, cutoff).await?;

        let mut failed = 0;
        for request in stuck {
            let message = format!(
                "stuck in creating for more than {} minutes",
                self.settings.stuck_after.as_secs() / 60
            );
            let transition = Transition::new(
                &[RequestStatus::Creating],
                RequestStatus::Failed,
                LogEntry::error(message.clone()),
            )
            .fenced(request.generation)
            .error(message);
            match store.transition(&request.id, &transition).await {
                Ok(Some(_)) => {
                    warn!(request = %request.id, "Request stuck in creating, marked failed");
                    failed += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(request = %request.id, error = %e, "Failed to fail stuck request"),
            }
        }
        Ok(failed)
    }

    async fn sweep_expired(&self) -> Result<usize, Error> {
        let expired = self
            .orchestrator
            .store()
            .list_expired(Utc::now(), self.settings.expiry_batch)
            .await?;

        let mut reclaimed = 0;
        for request in expired {
            match self.orchestrator.reclaim(&request, "expired").await {
                Ok(true) => {
                    info!(request = %request.id, expire_at = %request.expire_at, "Expired request reclaimed");
                    reclaimed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(request = %request.id, error = %e, "Failed to reclaim expired request"),
            }
        }
        Ok(reclaimed)
    }
}

enum Outcome {
    Promoted,
    Missing,
    Rearmed,
}
