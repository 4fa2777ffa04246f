//! Ephemera operator - ephemeral URL lifecycle management

use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use ephemera_common::kube_utils::create_client;
use ephemera_common::lease::{DistributedLock, LeaseLock, LocalLock, RECONCILER_LOCK_NAME};
use ephemera_common::model::{EnvVar, Project, ProjectId, RequestId, RequestSpec, RequestStatus};
use ephemera_common::telemetry::{init_telemetry, TelemetryConfig};

use ephemera_operator::config::OperatorArgs;
use ephemera_operator::{
    Cluster, IngressRouteMultiplexer, KubeResourceClient, MemoryStore, Orchestrator,
    PostgresStore, Reconciler, ReconcilerSettings, RequestStore,
};

/// Ephemera - short-lived preview URLs backed by Kubernetes workloads
#[derive(Parser, Debug)]
#[command(name = "ephemera-operator", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    args: OperatorArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the readiness watchers and the reconciler loop (default mode)
    Controller,
    /// Run one reconciler tick and exit
    Sweep,
    /// Create a request and print it
    Create {
        /// Owning project id
        #[arg(long)]
        project: ProjectId,
        /// Routing path, e.g. /pr-42
        #[arg(long)]
        path: String,
        /// Container image
        #[arg(long)]
        image: String,
        /// Time-to-live in seconds, counted from activation
        #[arg(long, default_value_t = 3600)]
        ttl: i64,
        /// Replica count
        #[arg(long)]
        replicas: Option<i32>,
        /// Environment entry as NAME=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_env)]
        env: Vec<EnvVar>,
    },
    /// Print a request with its log
    Get {
        /// Request id
        id: RequestId,
    },
    /// Delete a request and its cluster objects
    Delete {
        /// Request id
        id: RequestId,
    },
    /// Apply a request's objects again
    Deploy {
        /// Request id
        id: RequestId,
    },
}

fn parse_env(raw: &str) -> Result<EnvVar, String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok(EnvVar::new(name, value)),
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::default())?;

    let cli = Cli::parse();
    let seed_project = match &cli.command {
        Some(Commands::Create { project, .. }) => Some(*project),
        _ => None,
    };

    let store = open_store(&cli.args, seed_project).await?;
    let kube = if cli.args.no_cluster {
        info!("Cluster access disabled; new requests land in draft");
        None
    } else {
        Some(create_client(cli.args.kubeconfig.as_deref()).await?)
    };

    let cluster = kube.as_ref().map(|client| Cluster {
        resources: Arc::new(KubeResourceClient::new(client.clone(), &cli.args.namespace)),
        routes: Arc::new(
            IngressRouteMultiplexer::new(client.clone(), &cli.args.namespace)
                .with_ingress_class(cli.args.ingress_class.clone())
                .with_tls_secret(cli.args.tls_secret.clone()),
        ),
    });
    let orchestrator = Arc::new(Orchestrator::new(
        store,
        cluster,
        cli.args.orchestrator_config(),
    ));

    let identity = cli.args.resolved_identity();
    let lock: Arc<dyn DistributedLock> = match &kube {
        Some(client) => Arc::new(LeaseLock::new(
            client.clone(),
            RECONCILER_LOCK_NAME,
            &cli.args.namespace,
            &identity,
        )),
        None => Arc::new(LocalLock::new(&identity)),
    };

    match cli.command {
        Some(Commands::Controller) | None => run_controller(orchestrator, lock).await,
        Some(Commands::Sweep) => {
            let reconciler = Reconciler::new(orchestrator, lock, ReconcilerSettings::default());
            match reconciler.tick().await? {
                Some(report) => info!(?report, "Sweep finished"),
                None => info!("Reconcile lock held by another instance; nothing done"),
            }
            Ok(())
        }
        Some(Commands::Create {
            project,
            path,
            image,
            ttl,
            replicas,
            env,
        }) => {
            let spec = RequestSpec {
                path,
                image,
                env,
                replicas,
                ttl_seconds: ttl,
                ..Default::default()
            };
            print_json(&orchestrator.create(project, spec).await?)
        }
        Some(Commands::Get { id }) => print_json(&orchestrator.get(&id).await?),
        Some(Commands::Delete { id }) => {
            orchestrator.delete(&id).await?;
            print_json(&orchestrator.get(&id).await?)
        }
        Some(Commands::Deploy { id }) => print_json(&orchestrator.deploy(&id).await?),
    }
}

async fn open_store(
    args: &OperatorArgs,
    seed_project: Option<ProjectId>,
) -> anyhow::Result<Arc<dyn RequestStore>> {
    if let Some(url) = &args.database_url {
        return Ok(Arc::new(PostgresStore::connect(url).await?));
    }

    info!("No database configured; requests are kept in memory");
    let store = MemoryStore::new();
    // Projects normally come from the external CRUD layer
    if let Some(id) = seed_project {
        store
            .add_project(Project {
                id,
                name: id.to_string(),
            })
            .await;
    }
    Ok(Arc::new(store))
}

async fn run_controller(
    orchestrator: Arc<Orchestrator>,
    lock: Arc<dyn DistributedLock>,
) -> anyhow::Result<()> {
    info!(identity = %lock.identity(), "Starting ephemera controller");

    if let Some(watcher) = orchestrator.watcher() {
        let waiting = orchestrator
            .store()
            .list_by_status(&[RequestStatus::Waiting])
            .await?;
        info!(count = waiting.len(), "Re-arming readiness watches");
        for request in waiting {
            watcher.arm(request.id, request.generation).await;
        }
    }

    let reconciler = Reconciler::new(orchestrator, lock, ReconcilerSettings::default());
    reconciler
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    info!("Shutting down");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use uuid::Uuid;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_env_pairs() {
        let env = parse_env("MODE=a=b").unwrap();
        assert_eq!(env.name, "MODE");
        assert_eq!(env.value, "a=b");
        assert!(parse_env("=x").is_err());
        assert!(parse_env("NOVALUE").is_err());
    }

    #[test]
    fn create_subcommand_collects_repeated_env() {
        let project = Uuid::new_v4();
        let cli = Cli::try_parse_from([
            "ephemera-operator",
            "--no-cluster",
            "create",
            "--project",
            &project.to_string(),
            "--path",
            "/pr-1",
            "--image",
            "nginx:latest",
            "--env",
            "A=1",
            "--env",
            "B=2",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Create { env, ttl, .. }) => {
                assert_eq!(env.len(), 2);
                assert_eq!(ttl, 3600);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(cli.args.no_cluster);
    }
}
