//! Request validation
//!
//! Every check here runs before the orchestrator touches the cluster or the
//! store. A failure is returned to the caller and changes nothing.

use ephemera_common::model::{ContainerOverrides, RequestSpec, ResourceSpec};

use crate::config::BuilderConfig;
use crate::error::CompilationError;

/// Characters that may appear in an image reference besides alphanumerics
const IMAGE_PUNCTUATION: &[char] = &['.', '_', '-', '/', ':', '@'];

/// Validate a full request spec
pub fn validate_spec(spec: &RequestSpec, config: &BuilderConfig) -> Result<(), CompilationError> {
    validate_path(&spec.path)?;
    validate_image(&spec.image)?;
    validate_env(spec)?;
    if let Some(replicas) = spec.replicas {
        validate_replicas(replicas, config)?;
    }
    validate_ttl(spec.ttl_seconds, config)?;
    validate_resources(&spec.resources)?;
    validate_overrides(&spec.overrides, config)?;
    if let Some(ref host) = spec.ingress_host {
        validate_host(host)?;
    }
    Ok(())
}

/// Validate the routing path (e.g., "/pr-42")
pub fn validate_path(path: &str) -> Result<(), CompilationError> {
    if !path.starts_with('/') {
        return Err(CompilationError::invalid("path", format!("'{path}' must start with '/'")));
    }
    if path.len() < 2 {
        return Err(CompilationError::invalid("path", "root path '/' cannot be claimed"));
    }
    if path.contains("//") || path.ends_with('/') {
        return Err(CompilationError::invalid(
            "path",
            format!("'{path}' must not contain empty segments or a trailing '/'"),
        ));
    }
    let valid = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'));
    if !valid {
        return Err(CompilationError::invalid(
            "path",
            format!("'{path}' may only contain alphanumerics, '/', '-', '_' and '.'"),
        ));
    }
    Ok(())
}

/// Validate an image reference ("nginx:latest", "ghcr.io/org/app@sha256:...")
pub fn validate_image(image: &str) -> Result<(), CompilationError> {
    if image.is_empty() {
        return Err(CompilationError::invalid("image", "image cannot be empty"));
    }
    if image
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || IMAGE_PUNCTUATION.contains(&c)))
    {
        return Err(CompilationError::invalid(
            "image",
            format!("'{image}' contains invalid characters"),
        ));
    }

    let (name, digest) = match image.split_once('@') {
        Some((name, digest)) => (name, Some(digest)),
        None => (image, None),
    };
    if let Some(digest) = digest {
        let Some((algo, hex)) = digest.split_once(':') else {
            return Err(CompilationError::invalid(
                "image",
                format!("'{image}' has a malformed digest"),
            ));
        };
        if algo.is_empty() || hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CompilationError::invalid(
                "image",
                format!("'{image}' has a malformed digest"),
            ));
        }
    }

    // A tag is the text after the last ':' that follows the last '/'
    let last_segment = name.rsplit('/').next().unwrap_or(name);
    let repository = match last_segment.split_once(':') {
        Some((_, tag)) if tag.is_empty() || tag.len() > 128 => {
            return Err(CompilationError::invalid(
                "image",
                format!("'{image}' has an invalid tag"),
            ));
        }
        Some((repo, _)) => repo,
        None => last_segment,
    };
    if repository.is_empty() || name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(CompilationError::invalid(
            "image",
            format!("'{image}' has an empty repository component"),
        ));
    }
    if repository.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(CompilationError::invalid(
            "image",
            format!("'{image}' repository must be lowercase"),
        ));
    }
    Ok(())
}

/// Validate env entry names (C identifiers) and reject duplicates
fn validate_env(spec: &RequestSpec) -> Result<(), CompilationError> {
    let mut seen = std::collections::HashSet::new();
    for (i, var) in spec.env.iter().enumerate() {
        let field = format!("env[{i}].name");
        if !is_env_name(&var.name) {
            return Err(CompilationError::invalid(
                field,
                format!(
                    "'{}' must start with a letter or '_' and contain only letters, digits and '_'",
                    var.name
                ),
            ));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(CompilationError::invalid(
                field,
                format!("duplicate env name '{}'", var.name),
            ));
        }
    }
    Ok(())
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate replica count against the configured ceiling
pub fn validate_replicas(replicas: i32, config: &BuilderConfig) -> Result<(), CompilationError> {
    if replicas < 1 || replicas > config.max_replicas {
        return Err(CompilationError::invalid(
            "replicas",
            format!("{replicas} is outside 1..={}", config.max_replicas),
        ));
    }
    Ok(())
}

/// Validate TTL against the configured ceiling
pub fn validate_ttl(ttl_seconds: i64, config: &BuilderConfig) -> Result<(), CompilationError> {
    if ttl_seconds < 1 || ttl_seconds > config.max_ttl_seconds {
        return Err(CompilationError::invalid(
            "ttlSeconds",
            format!("{ttl_seconds} is outside 1..={}", config.max_ttl_seconds),
        ));
    }
    Ok(())
}

/// Validate resource quantity strings
pub fn validate_resources(resources: &ResourceSpec) -> Result<(), CompilationError> {
    for (field, qty) in [
        ("resources.cpuRequest", &resources.cpu_request),
        ("resources.cpuLimit", &resources.cpu_limit),
    ] {
        if let Some(qty) = qty {
            validate_cpu_quantity(qty, field)?;
        }
    }
    for (field, qty) in [
        ("resources.memoryRequest", &resources.memory_request),
        ("resources.memoryLimit", &resources.memory_limit),
    ] {
        if let Some(qty) = qty {
            validate_memory_quantity(qty, field)?;
        }
    }
    Ok(())
}

/// Validate CPU quantity format (e.g., "100m", "1", "0.5")
fn validate_cpu_quantity(qty: &str, field: &str) -> Result<(), CompilationError> {
    let is_valid = if let Some(stripped) = qty.strip_suffix('m') {
        stripped.parse::<u64>().is_ok()
    } else {
        qty.parse::<f64>().map(|v| v.is_finite() && v > 0.0).unwrap_or(false)
    };

    if !is_valid {
        return Err(CompilationError::invalid(
            field,
            format!("invalid quantity '{qty}' (expected e.g., '100m', '1', '0.5')"),
        ));
    }
    Ok(())
}

/// Validate memory quantity format (e.g., "128Mi", "1Gi", "1000000")
fn validate_memory_quantity(qty: &str, field: &str) -> Result<(), CompilationError> {
    let suffixes = [
        "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "k", "M", "G", "T", "P", "E",
    ];

    let is_valid = if let Some(suffix) = suffixes.iter().find(|s| qty.ends_with(*s)) {
        let prefix = &qty[..qty.len() - suffix.len()];
        prefix.parse::<u64>().is_ok() || prefix.parse::<f64>().is_ok()
    } else {
        qty.parse::<u64>().is_ok()
    };

    if !is_valid {
        return Err(CompilationError::invalid(
            field,
            format!("invalid quantity '{qty}' (expected e.g., '128Mi', '1Gi')"),
        ));
    }
    Ok(())
}

/// Validate container overrides: absolute paths, no sensitive device mappings
pub fn validate_overrides(
    overrides: &ContainerOverrides,
    config: &BuilderConfig,
) -> Result<(), CompilationError> {
    if let Some(ref dir) = overrides.working_dir {
        require_absolute(dir, "overrides.workingDir")?;
    }
    if matches!(overrides.command.as_deref(), Some([])) {
        return Err(CompilationError::invalid(
            "overrides.command",
            "command override cannot be empty",
        ));
    }

    for (i, device) in overrides.devices.iter().enumerate() {
        let field = format!("overrides.devices[{i}].hostPath");
        require_canonical(&device.host_path, &field)?;
        if config.is_sensitive_path(&device.host_path) {
            return Err(CompilationError::invalid(
                field,
                format!("'{}' is a sensitive host path", device.host_path),
            ));
        }
        if let Some(ref container_path) = device.container_path {
            require_canonical(container_path, &format!("overrides.devices[{i}].containerPath"))?;
        }
    }
    Ok(())
}

/// Absolute, with no empty, `.` or `..` segments and no trailing '/'.
/// Prefix checks are only meaningful on paths in this form.
fn require_canonical(path: &str, field: &str) -> Result<(), CompilationError> {
    require_absolute(path, field)?;
    let rest = &path[1..];
    if rest.split('/').any(|seg| seg == "..") {
        return Err(CompilationError::invalid(field, "path traversal is not allowed"));
    }
    if rest.split('/').any(|seg| seg.is_empty() || seg == ".") {
        return Err(CompilationError::invalid(
            field,
            format!("'{path}' is not a canonical path"),
        ));
    }
    Ok(())
}

fn require_absolute(path: &str, field: &str) -> Result<(), CompilationError> {
    if !path.starts_with('/') {
        return Err(CompilationError::invalid(
            field,
            format!("'{path}' must be an absolute path"),
        ));
    }
    Ok(())
}

/// Validate a routing host (lowercase DNS name, optional leading wildcard)
pub fn validate_host(host: &str) -> Result<(), CompilationError> {
    let name = host.strip_prefix("*.").unwrap_or(host);
    let valid = !name.is_empty()
        && name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        });
    if !valid {
        return Err(CompilationError::invalid(
            "ingressHost",
            format!("'{host}' is not a valid DNS name"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_common::model::{DeviceMapping, EnvVar};
    use rstest::rstest;

    fn spec() -> RequestSpec {
        RequestSpec {
            path: "/demo".to_string(),
            image: "nginx:latest".to_string(),
            ttl_seconds: 3600,
            ..Default::default()
        }
    }

    #[test]
    fn minimal_spec_is_valid() {
        assert!(validate_spec(&spec(), &BuilderConfig::default()).is_ok());
    }

    #[rstest]
    #[case("nginx")]
    #[case("nginx:latest")]
    #[case("ghcr.io/org/app:v1.2.3")]
    #[case("localhost:5000/app")]
    #[case("registry.example.com/team/app@sha256:0123abcd")]
    fn accepts_image_references(#[case] image: &str) {
        assert!(validate_image(image).is_ok(), "{image} should be valid");
    }

    #[rstest]
    #[case("")]
    #[case("nginx latest")]
    #[case("nginx:")]
    #[case("nginx;rm -rf /")]
    #[case("/nginx")]
    #[case("Nginx")]
    #[case("app@sha256")]
    fn rejects_image_references(#[case] image: &str) {
        assert!(validate_image(image).is_err(), "{image} should be invalid");
    }

    #[rstest]
    #[case("demo")]
    #[case("/")]
    #[case("/a//b")]
    #[case("/trailing/")]
    #[case("/has space")]
    fn rejects_paths(#[case] path: &str) {
        assert!(validate_path(path).is_err());
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(10, true)]
    #[case(11, false)]
    fn replica_ceiling(#[case] replicas: i32, #[case] ok: bool) {
        assert_eq!(validate_replicas(replicas, &BuilderConfig::default()).is_ok(), ok);
    }

    #[rstest]
    #[case(0, false)]
    #[case(30, true)]
    #[case(7 * 24 * 3600, true)]
    #[case(7 * 24 * 3600 + 1, false)]
    fn ttl_ceiling(#[case] ttl: i64, #[case] ok: bool) {
        assert_eq!(validate_ttl(ttl, &BuilderConfig::default()).is_ok(), ok);
    }

    #[rstest]
    #[case("DATABASE_URL", true)]
    #[case("_private", true)]
    #[case("9LIVES", false)]
    #[case("WITH-DASH", false)]
    #[case("", false)]
    fn env_names(#[case] name: &str, #[case] ok: bool) {
        let mut s = spec();
        s.env = vec![EnvVar::new(name, "x")];
        assert_eq!(validate_spec(&s, &BuilderConfig::default()).is_ok(), ok);
    }

    #[test]
    fn duplicate_env_names_rejected() {
        let mut s = spec();
        s.env = vec![EnvVar::new("A", "1"), EnvVar::new("A", "2")];
        let err = validate_spec(&s, &BuilderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[rstest]
    #[case(Some("100m"), Some("256Mi"), true)]
    #[case(Some("0.5"), Some("1Gi"), true)]
    #[case(Some("lots"), None, false)]
    #[case(None, Some("12XB"), false)]
    #[case(Some("1.5m"), None, false)]
    fn resource_quantities(
        #[case] cpu: Option<&str>,
        #[case] memory: Option<&str>,
        #[case] ok: bool,
    ) {
        let resources = ResourceSpec {
            cpu_limit: cpu.map(String::from),
            memory_limit: memory.map(String::from),
            ..Default::default()
        };
        assert_eq!(validate_resources(&resources).is_ok(), ok);
    }

    #[rstest]
    #[case("/dev/mem")]
    #[case("/dev/sda1")]
    #[case("/dev/nvme0n1")]
    #[case("/proc/kcore")]
    fn rejects_sensitive_devices(#[case] host_path: &str) {
        let overrides = ContainerOverrides {
            devices: vec![DeviceMapping {
                host_path: host_path.to_string(),
                container_path: None,
            }],
            ..Default::default()
        };
        let err = validate_overrides(&overrides, &BuilderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("sensitive"));
    }

    #[rstest]
    #[case("//dev/mem")]
    #[case("/dev/./mem")]
    #[case("/dev//sda")]
    #[case("/./proc/kcore")]
    #[case("/dev/mem/")]
    #[case("/")]
    fn rejects_non_canonical_device_paths(#[case] host_path: &str) {
        let overrides = ContainerOverrides {
            devices: vec![DeviceMapping {
                host_path: host_path.to_string(),
                container_path: None,
            }],
            ..Default::default()
        };
        let err = validate_overrides(&overrides, &BuilderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("hostPath"));
    }

    #[test]
    fn rejects_non_canonical_container_path() {
        let overrides = ContainerOverrides {
            devices: vec![DeviceMapping {
                host_path: "/dev/fuse".to_string(),
                container_path: Some("/dev//fuse".to_string()),
            }],
            ..Default::default()
        };
        let err = validate_overrides(&overrides, &BuilderConfig::default()).unwrap_err();
        assert!(err.to_string().contains("containerPath"));
    }

    #[test]
    fn accepts_non_sensitive_device() {
        let overrides = ContainerOverrides {
            devices: vec![DeviceMapping {
                host_path: "/dev/fuse".to_string(),
                container_path: Some("/dev/fuse".to_string()),
            }],
            ..Default::default()
        };
        assert!(validate_overrides(&overrides, &BuilderConfig::default()).is_ok());
    }

    #[test]
    fn rejects_relative_paths_and_traversal() {
        let config = BuilderConfig::default();
        let overrides = ContainerOverrides {
            working_dir: Some("app".to_string()),
            ..Default::default()
        };
        assert!(validate_overrides(&overrides, &config).is_err());

        let overrides = ContainerOverrides {
            devices: vec![DeviceMapping {
                host_path: "/dev/../dev/mem".to_string(),
                container_path: None,
            }],
            ..Default::default()
        };
        assert!(validate_overrides(&overrides, &config).is_err());
    }

    #[rstest]
    #[case("preview.example.com", true)]
    #[case("*.example.com", true)]
    #[case("Preview.example.com", false)]
    #[case("-bad.example.com", false)]
    #[case("a..b", false)]
    fn hosts(#[case] host: &str, #[case] ok: bool) {
        assert_eq!(validate_host(host).is_ok(), ok);
    }
}
