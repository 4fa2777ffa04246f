//! ResourceBuilder: translates a request into Deployment, Service and Secret
//!
//! Pure and deterministic: the same request always compiles to the same
//! objects. Names come from the request (assigned once at creation), labels
//! from its identity, and every blank resource field is filled with a default
//! so no container runs without limits.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EnvVar as K8sEnvVar, EnvVarSource, HostPathVolumeSource,
    PodSecurityContext, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile,
    Secret, SecretKeySelector, SecurityContext, Service, ServicePort, ServiceSpec,
    TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use ephemera_common::kube_utils::{object_meta, ownership_labels};
use ephemera_common::model::{ContainerOverrides, EphemeralRequest, ResourceSpec};
use ephemera_common::{CONTAINER_PORT, LABEL_REQUEST_ID};

use crate::compiled::CompiledResources;
use crate::config::{BuilderConfig, DEFAULT_CPU_REQUEST, DEFAULT_MEMORY_REQUEST};
use crate::error::CompilationError;
use crate::validation::validate_overrides;

/// Name of the single container in every ephemeral pod
pub const CONTAINER_NAME: &str = "app";

/// Builds the cluster objects for a request
pub struct ResourceBuilder<'a> {
    config: &'a BuilderConfig,
    namespace: &'a str,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a builder targeting `namespace`
    pub fn new(config: &'a BuilderConfig, namespace: &'a str) -> Self {
        Self { config, namespace }
    }

    /// Compile a request into its cluster objects
    pub fn build(&self, request: &EphemeralRequest) -> Result<CompiledResources, CompilationError> {
        validate_overrides(&request.spec.overrides, self.config)?;
        if request.workload_name.is_empty() {
            return Err(CompilationError::MissingName("workload name"));
        }
        if request.service_name.is_empty() {
            return Err(CompilationError::MissingName("service name"));
        }

        let secret = if request.spec.env.is_empty() {
            None
        } else {
            let name = request
                .secret_name
                .as_deref()
                .ok_or(CompilationError::MissingName("secret name"))?;
            Some(self.build_secret(request, name))
        };

        Ok(CompiledResources {
            deployment: self.build_deployment(request),
            service: self.build_service(request),
            secret,
        })
    }

    fn labels(&self, request: &EphemeralRequest) -> BTreeMap<String, String> {
        ownership_labels(&request.id, &request.project_id)
    }

    fn selector(request: &EphemeralRequest) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_REQUEST_ID.to_string(), request.id.to_string())])
    }

    fn build_deployment(&self, request: &EphemeralRequest) -> Deployment {
        let labels = self.labels(request);
        let overrides = &request.spec.overrides;
        let (volumes, volume_mounts) = device_volumes(overrides);

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(request.spec.image.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: CONTAINER_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: env_from_secret(request),
            resources: Some(self.resources(&request.spec.resources)),
            working_dir: overrides.working_dir.clone(),
            command: overrides.command.clone(),
            args: overrides.args.clone(),
            tty: overrides.tty.then_some(true),
            stdin: overrides.stdin.then_some(true),
            volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
            readiness_probe: Some(tcp_probe(5, 5)),
            liveness_probe: Some(tcp_probe(15, 20)),
            security_context: Some(SecurityContext {
                run_as_non_root: Some(true),
                allow_privilege_escalation: Some(false),
                capabilities: Some(Capabilities {
                    drop: Some(vec!["ALL".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Deployment {
            metadata: object_meta(&request.workload_name, self.namespace, labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(request.spec.replicas.unwrap_or(1)),
                selector: LabelSelector {
                    match_labels: Some(Self::selector(request)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: (!volumes.is_empty()).then_some(volumes),
                        automount_service_account_token: Some(false),
                        security_context: Some(PodSecurityContext {
                            run_as_non_root: Some(true),
                            seccomp_profile: Some(SeccompProfile {
                                type_: "RuntimeDefault".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_service(&self, request: &EphemeralRequest) -> Service {
        Service {
            metadata: object_meta(&request.service_name, self.namespace, self.labels(request)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(Self::selector(request)),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: CONTAINER_PORT,
                    target_port: Some(IntOrString::Int(CONTAINER_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_secret(&self, request: &EphemeralRequest, name: &str) -> Secret {
        let string_data = request
            .spec
            .env
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect();
        Secret {
            metadata: object_meta(name, self.namespace, self.labels(request)),
            string_data: Some(string_data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    fn resources(&self, spec: &ResourceSpec) -> ResourceRequirements {
        let pick = |value: &Option<String>, default: &str| {
            Quantity(
                value
                    .as_deref()
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or(default)
                    .to_string(),
            )
        };
        ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), pick(&spec.cpu_request, DEFAULT_CPU_REQUEST)),
                (
                    "memory".to_string(),
                    pick(&spec.memory_request, DEFAULT_MEMORY_REQUEST),
                ),
            ])),
            limits: Some(BTreeMap::from([
                (
                    "cpu".to_string(),
                    pick(&spec.cpu_limit, &self.config.default_cpu_limit),
                ),
                (
                    "memory".to_string(),
                    pick(&spec.memory_limit, &self.config.default_memory_limit),
                ),
            ])),
            ..Default::default()
        }
    }
}

/// Env entries reference the request's secret key by key; declaration order is kept
fn env_from_secret(request: &EphemeralRequest) -> Option<Vec<K8sEnvVar>> {
    let secret_name = request.secret_name.as_ref()?;
    if request.spec.env.is_empty() {
        return None;
    }
    Some(
        request
            .spec
            .env
            .iter()
            .map(|var| K8sEnvVar {
                name: var.name.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name.clone(),
                        key: var.name.clone(),
                        optional: Some(false),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect(),
    )
}

fn device_volumes(overrides: &ContainerOverrides) -> (Vec<Volume>, Vec<VolumeMount>) {
    overrides
        .devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let name = format!("device-{i}");
            let volume = Volume {
                name: name.clone(),
                host_path: Some(HostPathVolumeSource {
                    path: device.host_path.clone(),
                    type_: Some("CharDevice".to_string()),
                }),
                ..Default::default()
            };
            let mount = VolumeMount {
                name,
                mount_path: device
                    .container_path
                    .clone()
                    .unwrap_or_else(|| device.host_path.clone()),
                ..Default::default()
            };
            (volume, mount)
        })
        .unzip()
}

fn tcp_probe(initial_delay_seconds: i32, period_seconds: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(CONTAINER_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(period_seconds),
        ..Default::default()
    }
}
