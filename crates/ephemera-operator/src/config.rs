//! Operator configuration
//!
//! Every knob is a command line flag with an environment fallback. Timings
//! that callers should not tune are constants.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};

use ephemera_common::DEFAULT_NAMESPACE;
use ephemera_workload::BuilderConfig;

/// Interval between readiness polls of a waiting request
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Longest a request may sit in `waiting` before it is failed
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Period of the reconciler loop
pub const RECONCILE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Age after which a request still in `creating` is considered stuck
pub const STUCK_CREATING_AFTER: Duration = Duration::from_secs(30 * 60);

/// How long `deleted` rows are kept before they are purged
pub const DELETED_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Largest number of expired requests reclaimed per tick
pub const EXPIRY_BATCH_SIZE: usize = 50;

/// Deployment mode; decides how a vanished workload is resolved
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Environment {
    /// A missing workload marks the request `failed`
    Production,
    /// A missing workload demotes the request to `draft`
    #[default]
    Development,
}

/// Flags shared by every subcommand
#[derive(Args, Clone, Debug)]
pub struct OperatorArgs {
    /// Namespace for ephemeral workloads, routes and the reconciler lease
    #[arg(long, env = "EPHEMERA_NAMESPACE", default_value = DEFAULT_NAMESPACE, global = true)]
    pub namespace: String,

    /// Postgres connection string; requests are kept in memory when unset
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Deployment mode
    #[arg(long, env = "EPHEMERA_ENVIRONMENT", value_enum, default_value_t = Environment::Development, global = true)]
    pub environment: Environment,

    /// Default routing host for requests without an override
    #[arg(long, env = "EPHEMERA_INGRESS_HOST", global = true)]
    pub ingress_host: Option<String>,

    /// IngressClass for per-project routing objects
    #[arg(long, env = "EPHEMERA_INGRESS_CLASS", global = true)]
    pub ingress_class: Option<String>,

    /// TLS secret referenced by routing objects; switches URLs to https
    #[arg(long, env = "EPHEMERA_TLS_SECRET", global = true)]
    pub tls_secret: Option<String>,

    /// CPU limit applied when a request leaves it blank
    #[arg(long, env = "EPHEMERA_DEFAULT_CPU_LIMIT", default_value = "500m", global = true)]
    pub default_cpu_limit: String,

    /// Memory limit applied when a request leaves it blank
    #[arg(long, env = "EPHEMERA_DEFAULT_MEMORY_LIMIT", default_value = "512Mi", global = true)]
    pub default_memory_limit: String,

    /// Highest replica count a request may ask for
    #[arg(long, env = "EPHEMERA_MAX_REPLICAS", default_value_t = 10, global = true)]
    pub max_replicas: i32,

    /// Longest TTL a request may ask for, in seconds
    #[arg(long, env = "EPHEMERA_MAX_TTL_SECONDS", default_value_t = 7 * 24 * 60 * 60, global = true)]
    pub max_ttl_seconds: i64,

    /// Lock holder identity (defaults to the pod name or hostname)
    #[arg(long, env = "POD_NAME", global = true)]
    pub identity: Option<String>,

    /// Path to a kubeconfig; in-cluster or ambient config is used when unset
    #[arg(long, env = "KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Run without cluster access; new requests land in `draft`
    #[arg(long, env = "EPHEMERA_NO_CLUSTER", global = true)]
    pub no_cluster: bool,
}

impl OperatorArgs {
    /// Settings for validation and the resource builder
    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            default_cpu_limit: self.default_cpu_limit.clone(),
            default_memory_limit: self.default_memory_limit.clone(),
            max_replicas: self.max_replicas,
            max_ttl_seconds: self.max_ttl_seconds,
            ..Default::default()
        }
    }

    /// Settings for the lifecycle orchestrator
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            namespace: self.namespace.clone(),
            environment: self.environment,
            builder: self.builder_config(),
            ingress_host: self.ingress_host.clone(),
            tls_enabled: self.tls_secret.is_some(),
            watch: WatchSettings::default(),
        }
    }

    /// Lock holder identity, falling back to the hostname
    pub fn resolved_identity(&self) -> String {
        self.identity
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| format!("ephemera-{}", std::process::id()))
    }
}

/// Readiness watch timing
#[derive(Clone, Copy, Debug)]
pub struct WatchSettings {
    /// Delay between polls
    pub poll_interval: Duration,
    /// Ceiling on total watch time
    pub timeout: Duration,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: WATCH_POLL_INTERVAL,
            timeout: WATCH_TIMEOUT,
        }
    }
}

/// Reconciler timing and batch limits
#[derive(Clone, Copy, Debug)]
pub struct ReconcilerSettings {
    /// Delay between ticks
    pub period: Duration,
    /// Age after which `creating` is stuck
    pub stuck_after: Duration,
    /// Retention of `deleted` rows
    pub deleted_retention: Duration,
    /// Expired requests reclaimed per tick
    pub expiry_batch: usize,
    /// `creating` requests younger than this are left to the orchestrator
    pub creating_grace: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            period: RECONCILE_PERIOD,
            stuck_after: STUCK_CREATING_AFTER,
            deleted_retention: DELETED_RETENTION,
            expiry_batch: EXPIRY_BATCH_SIZE,
            creating_grace: WATCH_TIMEOUT,
        }
    }
}

/// Everything the orchestrator needs besides its collaborators
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Namespace for request objects
    pub namespace: String,
    /// Deployment mode
    pub environment: Environment,
    /// Validation and builder settings
    pub builder: BuilderConfig,
    /// Default routing host
    pub ingress_host: Option<String>,
    /// Whether routing objects terminate TLS
    pub tls_enabled: bool,
    /// Readiness watch timing
    pub watch: WatchSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            environment: Environment::default(),
            builder: BuilderConfig::default(),
            ingress_host: None,
            tls_enabled: false,
            watch: WatchSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: OperatorArgs,
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = TestCli::parse_from(["ephemera-operator"]);
        assert_eq!(cli.args.namespace, DEFAULT_NAMESPACE);
        assert_eq!(cli.args.environment, Environment::Development);
        assert_eq!(cli.args.max_replicas, 10);
        assert_eq!(cli.args.max_ttl_seconds, 604_800);
        assert!(!cli.args.no_cluster);

        let config = cli.args.orchestrator_config();
        assert!(!config.tls_enabled);
        assert_eq!(config.builder.default_cpu_limit, "500m");
        assert_eq!(config.watch.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn tls_secret_enables_https() {
        let cli = TestCli::parse_from([
            "ephemera-operator",
            "--tls-secret",
            "wildcard-tls",
            "--environment",
            "production",
        ]);
        let config = cli.args.orchestrator_config();
        assert!(config.tls_enabled);
        assert_eq!(config.environment, Environment::Production);
    }

    #[test]
    fn explicit_identity_wins() {
        let cli = TestCli::parse_from(["ephemera-operator", "--identity", "op-0"]);
        assert_eq!(cli.args.resolved_identity(), "op-0");
    }
}
