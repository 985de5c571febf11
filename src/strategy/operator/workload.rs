//! Workload builders for the default strategy
//!
//! Pure functions assembling Deployments, StatefulSets and their pod
//! templates from a normalized component configuration.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, StatefulSet, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Probe, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crd::ResourceConfig;

use super::resources::{pvc_name, shared_volume_name};
use super::sanitize_name;

/// Image used by the data-directory init container.
const INIT_IMAGE: &str = "busybox:1.36";

/// Everything the workload builders need for one component.
pub struct WorkloadInputs<'a> {
    pub namespace: &'a str,
    pub instance: &'a str,
    pub config: &'a ResourceConfig,
    pub labels: &'a BTreeMap<String, String>,
    pub selector: &'a BTreeMap<String, String>,
    pub pod_annotations: &'a BTreeMap<String, String>,
}

// ============================================================================
// Deployment
// ============================================================================

pub fn build_deployment(inputs: &WorkloadInputs) -> Deployment {
    let strategy = inputs
        .config
        .update_strategy
        .as_ref()
        .map(|type_| DeploymentStrategy {
            type_: Some(type_.clone()),
            ..Default::default()
        });

    Deployment {
        metadata: ObjectMeta {
            name: Some(inputs.instance.to_string()),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(inputs.labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: inputs.config.replicas,
            selector: LabelSelector {
                match_labels: Some(inputs.selector.clone()),
                ..Default::default()
            },
            template: build_pod_template(inputs, false),
            strategy,
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// StatefulSet
// ============================================================================

pub fn build_statefulset(inputs: &WorkloadInputs) -> StatefulSet {
    let update_strategy =
        inputs
            .config
            .update_strategy
            .as_ref()
            .map(|type_| StatefulSetUpdateStrategy {
                type_: Some(type_.clone()),
                ..Default::default()
            });

    let volume_claim_templates = inputs
        .config
        .storage
        .as_ref()
        .filter(|s| s.enabled)
        .map(|storage| vec![super::resources::build_volume_claim_template(storage)]);

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(inputs.instance.to_string()),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(inputs.labels.clone()),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: inputs.config.replicas,
            selector: LabelSelector {
                match_labels: Some(inputs.selector.clone()),
                ..Default::default()
            },
            service_name: format!("{}-headless", inputs.instance),
            template: build_pod_template(inputs, true),
            volume_claim_templates,
            pod_management_policy: inputs.config.pod_management_policy.clone(),
            update_strategy,
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Pod Template
// ============================================================================

fn build_pod_template(inputs: &WorkloadInputs, stateful: bool) -> PodTemplateSpec {
    let config = inputs.config;
    let container = build_main_container(inputs, stateful);

    let mut init_containers = config.init_containers.clone().unwrap_or_default();
    if let Some(init) = build_data_dir_init(config, stateful) {
        init_containers.push(init);
    }

    let volumes = build_volumes(inputs, stateful);

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(inputs.labels.clone()),
            annotations: if inputs.pod_annotations.is_empty() {
                None
            } else {
                Some(inputs.pod_annotations.clone())
            },
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            init_containers: if init_containers.is_empty() {
                None
            } else {
                Some(init_containers)
            },
            volumes: if volumes.is_empty() {
                None
            } else {
                Some(volumes)
            },
            node_selector: config.node_selector.clone(),
            tolerations: config.tolerations.clone(),
            affinity: config.affinity.clone(),
            security_context: config.pod_security_context.clone(),
            service_account_name: service_account_name(config, inputs.instance),
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
    }
}

fn build_main_container(inputs: &WorkloadInputs, stateful: bool) -> Container {
    let config = inputs.config;
    // Validation guarantees an image; an empty reference never reaches
    // the API server.
    let (image, image_pull_policy) = config
        .image
        .as_ref()
        .map(|image| (image.reference(), image.effective_pull_policy()))
        .unwrap_or_default();

    let ports = config
        .ports
        .iter()
        .map(|port| ContainerPort {
            name: Some(port.effective_name()),
            container_port: port.container_port,
            protocol: Some(port.protocol().to_string()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Container {
        name: inputs.instance.to_string(),
        image: Some(image),
        image_pull_policy: Some(image_pull_policy),
        command: config.command.clone(),
        args: config.args.clone(),
        ports: Some(ports),
        env: config.env.clone(),
        env_from: config.env_from.clone(),
        resources: config.resources.clone(),
        liveness_probe: config.liveness_probe.clone().map(with_probe_defaults),
        readiness_probe: config.readiness_probe.clone().map(with_probe_defaults),
        startup_probe: config.startup_probe.clone().map(with_probe_defaults),
        security_context: config.security_context.clone(),
        volume_mounts: {
            let mounts = build_volume_mounts(inputs, stateful);
            if mounts.is_empty() {
                None
            } else {
                Some(mounts)
            }
        },
        ..Default::default()
    }
}

/// Probe defaulting: period 10s, timeout 1s, one success, three failures,
/// HTTP scheme HTTP.
fn with_probe_defaults(mut probe: Probe) -> Probe {
    probe.period_seconds.get_or_insert(10);
    probe.timeout_seconds.get_or_insert(1);
    probe.success_threshold.get_or_insert(1);
    probe.failure_threshold.get_or_insert(3);
    if let Some(http) = probe.http_get.as_mut() {
        http.scheme.get_or_insert_with(|| "HTTP".to_string());
    }
    probe
}

/// Init container preparing the data directory of persistent workloads.
/// UID/GID come from the container security context; GID falls back to
/// the pod fsGroup; both default to 1000.
fn build_data_dir_init(config: &ResourceConfig, stateful: bool) -> Option<Container> {
    let (volume, mount_path) = data_volume(config, stateful)?;

    let uid = config
        .security_context
        .as_ref()
        .and_then(|c| c.run_as_user)
        .unwrap_or(1000);
    let gid = config
        .security_context
        .as_ref()
        .and_then(|c| c.run_as_group)
        .or_else(|| {
            config
                .pod_security_context
                .as_ref()
                .and_then(|p| p.fs_group)
        })
        .unwrap_or(1000);

    Some(Container {
        name: "init-ensure-data-dir".to_string(),
        image: Some(INIT_IMAGE.to_string()),
        command: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("mkdir -p {mount_path} && chown {uid}:{gid} {mount_path}"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: volume,
            mount_path,
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Name and mount path of the data volume, when persistent storage is on.
fn data_volume(config: &ResourceConfig, stateful: bool) -> Option<(String, String)> {
    if stateful {
        let storage = config.storage.as_ref().filter(|s| s.enabled)?;
        Some((
            storage.claim_template.clone().unwrap_or_else(|| "data".to_string()),
            storage.mount_path.clone()?,
        ))
    } else {
        let persistence = config.persistence.as_ref().filter(|p| p.enabled)?;
        Some((
            shared_volume_name(persistence),
            persistence.mount_path.clone()?,
        ))
    }
}

// ============================================================================
// Volumes and Mounts
// ============================================================================

fn build_volumes(inputs: &WorkloadInputs, stateful: bool) -> Vec<Volume> {
    let config = inputs.config;
    let mut volumes = Vec::new();

    for mounted in &config.config_maps {
        volumes.push(Volume {
            name: config_map_volume_name(&mounted.name),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(mounted.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    for mounted in &config.secrets {
        volumes.push(Volume {
            name: secret_volume_name(&mounted.name),
            secret: Some(SecretVolumeSource {
                secret_name: Some(mounted.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    // The shared claim is a pod volume only on Deployments; StatefulSets
    // get per-replica claims through the volume-claim template instead.
    if !stateful {
        if let Some(persistence) = config.persistence.as_ref().filter(|p| p.enabled) {
            volumes.push(Volume {
                name: shared_volume_name(persistence),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc_name(inputs.instance),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    if let Some(additional) = &config.additional_volumes {
        volumes.extend(additional.iter().cloned());
    }

    volumes
}

fn build_volume_mounts(inputs: &WorkloadInputs, stateful: bool) -> Vec<VolumeMount> {
    let config = inputs.config;
    let mut mounts = Vec::new();

    for mounted in &config.config_maps {
        mounts.push(VolumeMount {
            name: config_map_volume_name(&mounted.name),
            mount_path: mounted.mount_path.clone(),
            sub_path: mounted.sub_path.clone(),
            ..Default::default()
        });
    }

    for mounted in &config.secrets {
        mounts.push(VolumeMount {
            name: secret_volume_name(&mounted.name),
            mount_path: mounted.mount_path.clone(),
            sub_path: mounted.sub_path.clone(),
            ..Default::default()
        });
    }

    if stateful {
        if let Some(storage) = config.storage.as_ref().filter(|s| s.enabled) {
            if let Some(mount_path) = &storage.mount_path {
                mounts.push(VolumeMount {
                    name: storage
                        .claim_template
                        .clone()
                        .unwrap_or_else(|| "data".to_string()),
                    mount_path: mount_path.clone(),
                    sub_path: storage.sub_path.clone(),
                    ..Default::default()
                });
            }
        }
    } else if let Some(persistence) = config.persistence.as_ref().filter(|p| p.enabled) {
        if let Some(mount_path) = &persistence.mount_path {
            mounts.push(VolumeMount {
                name: shared_volume_name(persistence),
                mount_path: mount_path.clone(),
                ..Default::default()
            });
        }
    }

    if let Some(additional) = &config.additional_volume_mounts {
        mounts.extend(additional.iter().cloned());
    }

    mounts
}

fn config_map_volume_name(name: &str) -> String {
    sanitize_name(&format!("cm-{name}"))
}

fn secret_volume_name(name: &str) -> String {
    sanitize_name(&format!("secret-{name}"))
}

/// Derived pod serviceAccountName: none when creation is disabled, else
/// the configured name lowercased, else `<instance>-sa`.
pub fn service_account_name(config: &ResourceConfig, instance: &str) -> Option<String> {
    match &config.service_account {
        Some(sa) if !sa.should_create() => None,
        Some(sa) => Some(
            sa.name
                .as_ref()
                .map(|name| name.to_lowercase())
                .unwrap_or_else(|| format!("{instance}-sa")),
        ),
        None => Some(format!("{instance}-sa")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ImageConfig, PersistenceConfig, PortConfig, ServiceAccountConfig, StorageConfig,
    };
    use k8s_openapi::api::core::v1::{HTTPGetAction, PodSecurityContext, SecurityContext};

    fn base_config() -> ResourceConfig {
        ResourceConfig {
            image: Some(ImageConfig {
                repository: "nginx".into(),
                tag: Some("1.27".into()),
                pull_policy: None,
            }),
            ports: vec![PortConfig {
                name: Some("http".into()),
                container_port: 80,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn inputs<'a>(
        config: &'a ResourceConfig,
        labels: &'a BTreeMap<String, String>,
        selector: &'a BTreeMap<String, String>,
        annotations: &'a BTreeMap<String, String>,
    ) -> WorkloadInputs<'a> {
        WorkloadInputs {
            namespace: "prod",
            instance: "web",
            config,
            labels,
            selector,
            pod_annotations: annotations,
        }
    }

    #[test]
    fn probe_defaults_are_applied() {
        let probe = with_probe_defaults(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/healthz".into()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(probe.period_seconds, Some(10));
        assert_eq!(probe.timeout_seconds, Some(1));
        assert_eq!(probe.success_threshold, Some(1));
        assert_eq!(probe.failure_threshold, Some(3));
        assert_eq!(probe.http_get.unwrap().scheme.as_deref(), Some("HTTP"));
    }

    #[test]
    fn probe_defaults_keep_explicit_values() {
        let probe = with_probe_defaults(Probe {
            period_seconds: Some(30),
            ..Default::default()
        });
        assert_eq!(probe.period_seconds, Some(30));
    }

    #[test]
    fn init_container_uses_security_context_ids() {
        let config = ResourceConfig {
            security_context: Some(SecurityContext {
                run_as_user: Some(472),
                run_as_group: Some(473),
                ..Default::default()
            }),
            storage: Some(StorageConfig {
                enabled: true,
                size: Some("1Gi".into()),
                mount_path: Some("/var/lib/data".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        let init = build_data_dir_init(&config, true).unwrap();
        let script = &init.command.unwrap()[2];
        assert!(script.contains("mkdir -p /var/lib/data"), "{script}");
        assert!(script.contains("chown 472:473"), "{script}");
    }

    #[test]
    fn init_container_gid_falls_back_to_fs_group_then_default() {
        let config = ResourceConfig {
            pod_security_context: Some(PodSecurityContext {
                fs_group: Some(2000),
                ..Default::default()
            }),
            persistence: Some(PersistenceConfig {
                enabled: true,
                size: Some("1Gi".into()),
                mount_path: Some("/data".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        let init = build_data_dir_init(&config, false).unwrap();
        assert!(init.command.unwrap()[2].contains("chown 1000:2000"));

        let bare = ResourceConfig {
            persistence: Some(PersistenceConfig {
                enabled: true,
                size: Some("1Gi".into()),
                mount_path: Some("/data".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        let init = build_data_dir_init(&bare, false).unwrap();
        assert!(init.command.unwrap()[2].contains("chown 1000:1000"));
    }

    #[test]
    fn no_init_container_without_persistent_storage() {
        assert!(build_data_dir_init(&base_config(), false).is_none());
        assert!(build_data_dir_init(&base_config(), true).is_none());
    }

    #[test]
    fn deployment_mounts_the_shared_claim() {
        let config = ResourceConfig {
            persistence: Some(PersistenceConfig {
                enabled: true,
                size: Some("10Gi".into()),
                mount_path: Some("/data".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        let labels = BTreeMap::new();
        let selector = BTreeMap::new();
        let annotations = BTreeMap::new();
        let deployment = build_deployment(&inputs(&config, &labels, &selector, &annotations));

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        let data = volumes.iter().find(|v| v.name == "data").unwrap();
        assert_eq!(
            data.persistent_volume_claim.as_ref().unwrap().claim_name,
            "web-pvc"
        );
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.name == "data" && m.mount_path == "/data"));
    }

    #[test]
    fn statefulset_mounts_the_claim_template_not_a_pod_volume() {
        let config = ResourceConfig {
            storage: Some(StorageConfig {
                enabled: true,
                size: Some("1Gi".into()),
                mount_path: Some("/data".into()),
                sub_path: Some("state".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        let labels = BTreeMap::new();
        let selector = BTreeMap::new();
        let annotations = BTreeMap::new();
        let sts = build_statefulset(&inputs(&config, &labels, &selector, &annotations));

        let spec = sts.spec.unwrap();
        assert!(spec.volume_claim_templates.is_some());
        let pod = spec.template.spec.unwrap();
        assert!(pod.volumes.is_none());
        let mounts = pod.containers[0].volume_mounts.as_ref().unwrap();
        let data = mounts.iter().find(|m| m.name == "data").unwrap();
        assert_eq!(data.mount_path, "/data");
        assert_eq!(data.sub_path.as_deref(), Some("state"));
    }

    #[test]
    fn service_account_name_derivation() {
        assert_eq!(
            service_account_name(&base_config(), "web"),
            Some("web-sa".to_string())
        );

        let named = ResourceConfig {
            service_account: Some(ServiceAccountConfig {
                name: Some("Custom-SA".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        assert_eq!(
            service_account_name(&named, "web"),
            Some("custom-sa".to_string())
        );

        let disabled = ResourceConfig {
            service_account: Some(ServiceAccountConfig {
                create: Some(false),
                name: Some("ignored".into()),
                ..Default::default()
            }),
            ..base_config()
        };
        assert_eq!(service_account_name(&disabled, "web"), None);
    }

    #[test]
    fn pod_restart_policy_is_always() {
        let config = base_config();
        let labels = BTreeMap::new();
        let selector = BTreeMap::new();
        let annotations = BTreeMap::new();
        let deployment = build_deployment(&inputs(&config, &labels, &selector, &annotations));
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Always"));
        assert_eq!(pod.service_account_name.as_deref(), Some("web-sa"));
    }
}
