//! Defaults and ceilings applied while validating and compiling requests

/// CPU request used when a request leaves it blank
pub const DEFAULT_CPU_REQUEST: &str = "50m";

/// Memory request used when a request leaves it blank
pub const DEFAULT_MEMORY_REQUEST: &str = "64Mi";

/// Host paths that must never be mapped into a container.
///
/// Matched as prefixes, so `/dev/sd` covers every SCSI disk and partition.
pub const DEFAULT_SENSITIVE_PATH_PREFIXES: &[&str] = &[
    "/dev/mem",
    "/dev/kmem",
    "/dev/port",
    "/dev/sd",
    "/dev/nvme",
    "/dev/hd",
    "/dev/vd",
    "/dev/xvd",
    "/dev/dm-",
    "/dev/loop",
    "/dev/disk",
    "/proc",
    "/sys",
];

/// Settings shared by validation and the resource builder
#[derive(Clone, Debug)]
pub struct BuilderConfig {
    /// CPU limit when a request leaves it blank
    pub default_cpu_limit: String,
    /// Memory limit when a request leaves it blank
    pub default_memory_limit: String,
    /// Highest replica count a request may ask for
    pub max_replicas: i32,
    /// Longest TTL a request may ask for
    pub max_ttl_seconds: i64,
    /// Host path prefixes rejected for device mappings
    pub sensitive_path_prefixes: Vec<String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            default_cpu_limit: "500m".to_string(),
            default_memory_limit: "512Mi".to_string(),
            max_replicas: 10,
            max_ttl_seconds: 7 * 24 * 60 * 60,
            sensitive_path_prefixes: DEFAULT_SENSITIVE_PATH_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl BuilderConfig {
    /// True if `path` falls under a sensitive prefix
    pub fn is_sensitive_path(&self, path: &str) -> bool {
        self.sensitive_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}
