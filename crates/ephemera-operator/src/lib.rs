//! Ephemera operator: turns ephemeral URL requests into running workloads
//!
//! The [`orchestrator::Orchestrator`] drives each request through its
//! lifecycle, the [`watcher::ReadinessWatcher`] promotes requests once their
//! workload is ready, and the [`reconciler::Reconciler`] periodically repairs
//! drift and reclaims expired requests under a distributed lock.

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod orchestrator;
pub mod reconciler;
pub mod routing;
pub mod store;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{KubeResourceClient, Readiness, ResourceClient};
pub use config::{Environment, OperatorArgs, OrchestratorConfig, ReconcilerSettings};
pub use orchestrator::{Cluster, Orchestrator, RequestView};
pub use reconciler::{Reconciler, TickReport};
pub use routing::{IngressRouteMultiplexer, RouteMultiplexer, RouteTarget};
pub use store::{MemoryStore, PostgresStore, RequestStore};
