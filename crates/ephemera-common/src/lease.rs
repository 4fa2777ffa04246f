//! Distributed lock backed by a Kubernetes Lease
//!
//! One well-known Lease serializes the reconciler across operator instances.
//! Acquisition is "set if not already held": an instance takes the lease when
//! it does not exist, when it has no holder, or when the previous holder's
//! lease has expired. There is no renewal; a holder that crashes frees the
//! key when the lease duration elapses.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the write fails with 409 Conflict and acquisition
//! reports "not acquired" rather than retrying.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kube_utils::{is_conflict, is_not_found};
use crate::{Error, FIELD_MANAGER};

/// Lease name guarding the reconciler tick
pub const RECONCILER_LOCK_NAME: &str = "ephemera-reconciler-lock";

/// Lease duration; a tick running longer than this may overlap another instance
pub const LOCK_LEASE_DURATION: Duration = Duration::from_secs(30 * 60);

/// Mutual exclusion across operator instances
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to take the lock without waiting. Returns false when another holder
    /// has a live lease.
    async fn try_acquire(&self) -> Result<bool, Error>;

    /// Release the lock if this instance holds it
    async fn release(&self) -> Result<(), Error>;

    /// Identity of this instance
    fn identity(&self) -> &str;
}

fn lease_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };
    if spec.holder_identity.is_none() {
        return true;
    }
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    }
}

/// Distributed lock using a coordination.k8s.io/v1 Lease
pub struct LeaseLock {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
}

impl LeaseLock {
    /// Create a lock with the default 30 minute lease
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LOCK_LEASE_DURATION,
        }
    }

    fn lease_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool, Error> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.lease_name, "Created lock lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lock lease created concurrently by another instance");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        existing: &Lease,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let rv = existing.metadata.resource_version.clone().ok_or_else(|| {
            Error::internal_with_context("lease", "lock lease missing resourceVersion")
        })?;
        let transitions = existing
            .spec
            .as_ref()
            .and_then(|s| s.lease_transitions)
            .unwrap_or(0);

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions + 1)),
        };

        match api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over free lock lease"
                );
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                debug!(identity = %self.identity, "Lock takeover conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl DistributedLock for LeaseLock {
    async fn try_acquire(&self) -> Result<bool, Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        let existing = match api.get(&self.lease_name).await {
            Ok(lease) => Some(lease),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => self.create_lease(&api, now).await,
            Some(lease) => {
                // A crashed tick of our own still blocks until the lease expires
                if lease_expired(lease.spec.as_ref(), now) {
                    self.take_over_lease(&api, &lease, now).await
                } else {
                    debug!(
                        identity = %self.identity,
                        holder = ?lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref()),
                        "Lock held by another instance"
                    );
                    Ok(false)
                }
            }
        }
    }

    async fn release(&self) -> Result<(), Error> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);

        let lease = match api.get(&self.lease_name).await {
            Ok(l) => l,
            Err(e) if is_not_found(&e) => {
                debug!(identity = %self.identity, "Lock lease not found, nothing to release");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            warn!(identity = %self.identity, holder = ?holder, "Not the lock holder, skipping release");
            return Ok(());
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "holderIdentity": null }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lock released");
                Ok(())
            }
            // Lease changed hands after expiry; nothing left to release
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

/// Lease state shared between [`LocalLock`] handles
#[derive(Debug, Default)]
pub struct LocalLockState {
    holder: Option<(String, tokio::time::Instant)>,
}

/// In-process lock with the same semantics as [`LeaseLock`]
///
/// Handles created from the same shared state behave like separate operator
/// instances contending for one lease. Used for single-instance runs and tests.
pub struct LocalLock {
    state: Arc<Mutex<LocalLockState>>,
    identity: String,
    lease_duration: Duration,
}

impl LocalLock {
    /// Create a standalone lock
    pub fn new(identity: &str) -> Self {
        Self::shared(Arc::new(Mutex::new(LocalLockState::default())), identity)
    }

    /// Create a handle onto shared lock state
    pub fn shared(state: Arc<Mutex<LocalLockState>>, identity: &str) -> Self {
        Self {
            state,
            identity: identity.to_string(),
            lease_duration: LOCK_LEASE_DURATION,
        }
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_acquire(&self) -> Result<bool, Error> {
        let mut state = self.state.lock().await;
        let now = tokio::time::Instant::now();
        let free = match &state.holder {
            None => true,
            Some((_, expires)) => now >= *expires,
        };
        if free {
            state.holder = Some((self.identity.clone(), now + self.lease_duration));
        }
        Ok(free)
    }

    async fn release(&self) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        if matches!(&state.holder, Some((holder, _)) if holder == &self.identity) {
            state.holder = None;
        }
        Ok(())
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_without_holder_is_free() {
        let now = Utc::now();
        let spec = LeaseSpec {
            holder_identity: None,
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(1800),
            ..Default::default()
        };
        assert!(lease_expired(Some(&spec), now));
        assert!(lease_expired(None, now));
    }

    #[test]
    fn live_lease_is_held_until_duration_elapses() {
        let now = Utc::now();
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            renew_time: Some(MicroTime(now)),
            lease_duration_seconds: Some(1800),
            ..Default::default()
        };
        assert!(!lease_expired(Some(&spec), now + chrono::Duration::seconds(60)));
        assert!(lease_expired(Some(&spec), now + chrono::Duration::seconds(1801)));
    }

    #[tokio::test]
    async fn only_one_instance_acquires_shared_lock() {
        let state = Arc::new(Mutex::new(LocalLockState::default()));
        let a = LocalLock::shared(state.clone(), "instance-a");
        let b = LocalLock::shared(state, "instance-b");

        let (got_a, got_b) = tokio::join!(a.try_acquire(), b.try_acquire());
        assert!(got_a.unwrap() ^ got_b.unwrap());
    }

    #[tokio::test]
    async fn release_frees_lock_for_next_instance() {
        let state = Arc::new(Mutex::new(LocalLockState::default()));
        let a = LocalLock::shared(state.clone(), "instance-a");
        let b = LocalLock::shared(state, "instance-b");

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        // Releasing someone else's lock is a no-op
        b.release().await.unwrap();
        assert!(!b.try_acquire().await.unwrap());
        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_holder_frees_lock_after_lease() {
        let state = Arc::new(Mutex::new(LocalLockState::default()));
        let crashed = LocalLock::shared(state.clone(), "crashed");
        let next = LocalLock::shared(state, "next");

        assert!(crashed.try_acquire().await.unwrap());
        tokio::time::advance(LOCK_LEASE_DURATION - Duration::from_secs(1)).await;
        assert!(!next.try_acquire().await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(next.try_acquire().await.unwrap());
    }
}
