//! Default "operator" builder strategy
//!
//! Materializes a component's normalized configuration into its full
//! resource graph: primary workload, services, generated ConfigMap,
//! ServiceAccount, storage claims and disruption budget, all sharing one
//! label set and one selector.

mod resources;
mod workload;

use std::collections::BTreeMap;

use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::crd::{
    ApplicationComponent, ApplicationDefinition, ResourceConfig, ANNOTATION_RESTARTED_AT,
    LABEL_APPLICATION_NAME, LABEL_COMPONENT_INSTANCE, LABEL_COMPONENT_NAME, LABEL_INSTANCE,
    LABEL_MANAGED_BY, LABEL_NAME, MANAGER_NAME,
};
use crate::error::{Error, Result};

use super::{
    BuildOutput, Builder, DesiredResource, PrimaryWorkload, ReconcileHook, TaskResult,
    WorkloadKind,
};

pub use workload::WorkloadInputs;

/// The built-in strategy behind the "operator" component type.
pub struct OperatorStrategy;

impl Builder for OperatorStrategy {
    fn workload_kind(&self, component: &ApplicationComponent) -> WorkloadKind {
        WorkloadKind::from_component(component)
    }

    fn build(
        &self,
        app: &ApplicationDefinition,
        component: &ApplicationComponent,
    ) -> Result<BuildOutput> {
        let config = ResourceConfig::from_properties(component.properties.as_ref())
            .map_err(|e| build_error(component, format!("invalid properties: {e}")))?;
        let kind = self.workload_kind(component);
        validate(component, &config, kind)?;

        let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
        let instance = sanitize_name(&component.name);
        let labels = common_labels(app, component);
        let selector = selector_labels(component);

        let mut resources = Vec::new();
        let mut config_hashes = BTreeMap::new();
        let mut pod_annotations = BTreeMap::new();

        // Inline config files render into one generated ConfigMap. A
        // changed (or new) content hash rolls the workload's pods; while
        // the hash is stable the previously stamped timestamp is
        // re-applied so the pod template stays byte-identical.
        if !config.config_files.is_empty() {
            let config_map =
                resources::build_config_map(&instance, &namespace, &labels, &config.config_files);
            let name = config_map.metadata.name.clone().unwrap_or_default();
            let hash = hash_config_data(config_map.data.as_ref().unwrap_or(&BTreeMap::new()));
            let restart_key = restart_stamp_key(&name);
            let status_annotations = app.status.as_ref().map(|s| &s.annotations);
            let stored = status_annotations
                .and_then(|a| a.get(&name))
                .map(String::as_str);
            if stored != Some(hash.as_str()) {
                let stamp = chrono::Utc::now().to_rfc3339();
                pod_annotations.insert(ANNOTATION_RESTARTED_AT.to_string(), stamp.clone());
                config_hashes.insert(restart_key, stamp);
            } else if let Some(stamp) = status_annotations.and_then(|a| a.get(&restart_key)) {
                pod_annotations.insert(ANNOTATION_RESTARTED_AT.to_string(), stamp.clone());
            }
            config_hashes.insert(name, hash);
            resources.push(DesiredResource::ConfigMap(config_map));
        }

        if let Some(name) = workload::service_account_name(&config, &instance) {
            let annotations = config
                .service_account
                .as_ref()
                .and_then(|sa| sa.annotations.clone());
            resources.push(DesiredResource::ServiceAccount(
                resources::build_service_account(&name, &namespace, &labels, annotations),
            ));
        }

        if kind == WorkloadKind::Deployment {
            if let Some(persistence) = config.persistence.as_ref().filter(|p| p.enabled) {
                resources.push(DesiredResource::PersistentVolumeClaim(
                    resources::build_shared_pvc(&instance, &namespace, &labels, persistence),
                ));
            }
        }

        let inputs = WorkloadInputs {
            namespace: &namespace,
            instance: &instance,
            config: &config,
            labels: &labels,
            selector: &selector,
            pod_annotations: &pod_annotations,
        };
        let workload_name = instance.clone();
        match kind {
            WorkloadKind::Deployment => {
                resources.push(DesiredResource::Deployment(workload::build_deployment(
                    &inputs,
                )));
            }
            WorkloadKind::StatefulSet => {
                resources.push(DesiredResource::StatefulSet(workload::build_statefulset(
                    &inputs,
                )));
                resources.push(DesiredResource::Service(resources::build_headless_service(
                    &inputs,
                )));
            }
        }

        if let Some(service) = &config.service {
            if service.is_enabled() {
                resources.push(DesiredResource::Service(resources::build_client_service(
                    &inputs, service,
                )));
            }
        }

        if let Some(pdb) = &config.pod_disruption_budget {
            resources.push(DesiredResource::PodDisruptionBudget(resources::build_pdb(
                &inputs, pdb,
            )));
        }

        Ok(BuildOutput {
            resources,
            primary: PrimaryWorkload {
                api_version: WorkloadKind::API_VERSION.to_string(),
                kind: kind.as_str().to_string(),
                name: workload_name,
            },
            config_hashes,
        })
    }
}

impl ReconcileHook for OperatorStrategy {
    fn cleanup(
        &self,
        app: &ApplicationDefinition,
        component: &ApplicationComponent,
    ) -> TaskResult {
        // Children carry a controller owner reference; the API server's
        // garbage collector removes them once the declaration goes.
        debug!(
            app = %app.name_any(),
            component = %component.name,
            "no external cleanup required"
        );
        TaskResult::Complete
    }
}

/// Fail-closed validation of the normalized configuration.
fn validate(
    component: &ApplicationComponent,
    config: &ResourceConfig,
    kind: WorkloadKind,
) -> Result<()> {
    config
        .validate()
        .map_err(|m| build_error(component, m))?;

    match &config.image {
        Some(image) if !image.repository.is_empty() => {}
        _ => return Err(build_error(component, "image is required".to_string())),
    }

    if config.ports.is_empty() {
        return Err(build_error(
            component,
            "at least one container port is required".to_string(),
        ));
    }
    ensure_unique_port_names(component, &config.ports)?;
    if let Some(service) = &config.service {
        ensure_unique_port_names(component, &service.ports)?;
    }

    if kind == WorkloadKind::StatefulSet {
        match &config.storage {
            Some(storage) if storage.enabled => {
                if storage.size.is_none() || storage.mount_path.is_none() {
                    return Err(build_error(
                        component,
                        "storage.size and storage.mountPath are required for StatefulSet"
                            .to_string(),
                    ));
                }
            }
            _ => {
                return Err(build_error(
                    component,
                    "StatefulSet components require enabled storage".to_string(),
                ))
            }
        }
    }

    if let Some(persistence) = &config.persistence {
        if persistence.enabled
            && (persistence.size.is_none() || persistence.mount_path.is_none())
        {
            return Err(build_error(
                component,
                "persistence.size and persistence.mountPath are required".to_string(),
            ));
        }
    }

    Ok(())
}

fn ensure_unique_port_names(
    component: &ApplicationComponent,
    ports: &[crate::crd::PortConfig],
) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for port in ports {
        let name = port.effective_name();
        if !seen.insert(name.clone()) {
            return Err(build_error(
                component,
                format!("duplicate port name: {name}"),
            ));
        }
    }
    Ok(())
}

fn build_error(component: &ApplicationComponent, message: String) -> Error {
    Error::BuildError {
        component: component.name.clone(),
        message,
    }
}

/// Kubernetes object name from a component instance: lowercased, `_`
/// replaced by `-`, truncated to 63 chars, trailing `-` stripped.
pub fn sanitize_name(name: &str) -> String {
    let mut sanitized = name.to_lowercase().replace('_', "-");
    sanitized.truncate(63);
    sanitized.trim_end_matches('-').to_string()
}

/// The full label set stamped on every owned resource.
pub fn common_labels(
    app: &ApplicationDefinition,
    component: &ApplicationComponent,
) -> BTreeMap<String, String> {
    let instance = sanitize_name(&component.name);
    let mut labels = selector_labels(component);
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGER_NAME.to_string());
    labels.insert(LABEL_APPLICATION_NAME.to_string(), app.name_any());
    labels.insert(
        LABEL_COMPONENT_NAME.to_string(),
        component.strategy_key().to_string(),
    );
    labels.insert(LABEL_COMPONENT_INSTANCE.to_string(), instance);
    labels
}

/// The two-label selector shared by workloads and services.
pub fn selector_labels(component: &ApplicationComponent) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        LABEL_NAME.to_string(),
        component.strategy_key().to_string(),
    );
    labels.insert(
        LABEL_INSTANCE.to_string(),
        sanitize_name(&component.name),
    );
    labels
}

/// Status-annotation key caching the restart timestamp last stamped for
/// a ConfigMap.
fn restart_stamp_key(config_map_name: &str) -> String {
    format!("{config_map_name}.restartedAt")
}

/// SHA-256 over the ConfigMap data map. BTreeMap iteration is key-sorted,
/// so the digest is stable for identical content.
pub fn hash_config_data(data: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in data {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApplicationDefinitionSpec, ApplicationDefinitionStatus};

    fn app() -> ApplicationDefinition {
        let mut app = ApplicationDefinition::new(
            "demo-app",
            ApplicationDefinitionSpec {
                components: vec![],
                suspend: None,
            },
        );
        app.metadata.namespace = Some("prod".to_string());
        app
    }

    fn statefulset_component() -> ApplicationComponent {
        ApplicationComponent {
            name: "test-comp".into(),
            type_: String::new(),
            api_version: Some("apps/v1".into()),
            kind: Some("StatefulSet".into()),
            properties: Some(serde_json::json!({
                "image": {"repository": "nginx", "tag": "latest"},
                "replicas": 3,
                "ports": [{"containerPort": 80, "name": "http"}],
                "storage": {"enabled": true, "size": "1Gi", "mountPath": "/data"}
            })),
        }
    }

    #[test]
    fn sanitize_lowercases_and_strips() {
        assert_eq!(sanitize_name("My_Comp"), "my-comp");
        assert_eq!(sanitize_name("comp-"), "comp");
        let long = "a".repeat(80);
        assert_eq!(sanitize_name(&long).len(), 63);
        let trailing = format!("{}-x", "b".repeat(62));
        assert_eq!(sanitize_name(&trailing).len(), 62);
    }

    #[test]
    fn statefulset_component_builds_the_full_graph() {
        let output = OperatorStrategy
            .build(&app(), &statefulset_component())
            .unwrap();

        assert_eq!(output.primary.kind, "StatefulSet");
        assert_eq!(output.primary.name, "test-comp");

        let kinds: Vec<_> = output
            .resources
            .iter()
            .map(|r| (r.kind(), r.name()))
            .collect();
        assert!(kinds.contains(&("ServiceAccount", "test-comp-sa".to_string())));
        assert!(kinds.contains(&("StatefulSet", "test-comp".to_string())));
        assert!(kinds.contains(&("Service", "test-comp-headless".to_string())));

        let sts = output
            .resources
            .iter()
            .find_map(|r| match r {
                DesiredResource::StatefulSet(s) => Some(s),
                _ => None,
            })
            .unwrap();
        let spec = sts.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "test-comp-headless");
        let vcts = spec.volume_claim_templates.as_ref().unwrap();
        assert_eq!(vcts[0].metadata.name.as_deref(), Some("data"));
    }

    #[test]
    fn every_resource_carries_the_standard_labels() {
        let the_app = app();
        let component = statefulset_component();
        let output = OperatorStrategy.build(&the_app, &component).unwrap();
        for resource in &output.resources {
            let labels = resource.metadata().labels.as_ref().unwrap();
            assert_eq!(labels.get(LABEL_MANAGED_BY).unwrap(), MANAGER_NAME);
            assert_eq!(labels.get(LABEL_APPLICATION_NAME).unwrap(), "demo-app");
            assert_eq!(labels.get(LABEL_COMPONENT_NAME).unwrap(), "operator");
            assert_eq!(labels.get(LABEL_COMPONENT_INSTANCE).unwrap(), "test-comp");
            assert!(labels.contains_key(LABEL_NAME));
            assert!(labels.contains_key(LABEL_INSTANCE));
        }
    }

    #[test]
    fn selector_is_a_subset_of_pod_labels() {
        let the_app = app();
        let component = statefulset_component();
        let selector = selector_labels(&component);
        let labels = common_labels(&the_app, &component);
        for (key, value) in &selector {
            assert_eq!(labels.get(key), Some(value));
        }
    }

    #[test]
    fn missing_image_fails_closed() {
        let mut component = statefulset_component();
        component.properties = Some(serde_json::json!({
            "ports": [{"containerPort": 80}],
            "storage": {"enabled": true, "size": "1Gi", "mountPath": "/data"}
        }));
        let err = OperatorStrategy.build(&app(), &component).unwrap_err();
        assert!(err.to_string().contains("image is required"), "{err}");
    }

    #[test]
    fn missing_ports_fail_closed() {
        let mut component = statefulset_component();
        component.properties = Some(serde_json::json!({
            "image": {"repository": "nginx"},
            "storage": {"enabled": true, "size": "1Gi", "mountPath": "/data"}
        }));
        let err = OperatorStrategy.build(&app(), &component).unwrap_err();
        assert!(err.to_string().contains("container port"), "{err}");
    }

    #[test]
    fn statefulset_without_storage_fails_closed() {
        let mut component = statefulset_component();
        component.properties = Some(serde_json::json!({
            "image": {"repository": "nginx"},
            "ports": [{"containerPort": 80}]
        }));
        let err = OperatorStrategy.build(&app(), &component).unwrap_err();
        assert!(err.to_string().contains("storage"), "{err}");
    }

    #[test]
    fn duplicate_port_names_fail_closed() {
        let mut component = statefulset_component();
        component.properties = Some(serde_json::json!({
            "image": {"repository": "nginx"},
            "ports": [{"containerPort": 80}, {"containerPort": 80}],
            "storage": {"enabled": true, "size": "1Gi", "mountPath": "/data"}
        }));
        let err = OperatorStrategy.build(&app(), &component).unwrap_err();
        assert!(err.to_string().contains("duplicate port name"), "{err}");
    }

    #[test]
    fn new_config_hash_stamps_a_restart_annotation() {
        let mut component = statefulset_component();
        component.properties = Some(serde_json::json!({
            "image": {"repository": "nginx"},
            "ports": [{"containerPort": 80}],
            "storage": {"enabled": true, "size": "1Gi", "mountPath": "/data"},
            "configFiles": {"app.yml": "a: 1"}
        }));

        let the_app = app();
        let output = OperatorStrategy.build(&the_app, &component).unwrap();
        let hash = output.config_hashes.get("test-comp-config").unwrap().clone();

        let sts = output
            .resources
            .iter()
            .find_map(|r| match r {
                DesiredResource::StatefulSet(s) => Some(s),
                _ => None,
            })
            .unwrap();
        let annotations = sts
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert!(annotations.contains_key(ANNOTATION_RESTARTED_AT));

        // Same content with the hash already cached: the recorded stamp
        // is re-applied unchanged, so the pod template stays stable.
        let recorded = "2026-01-01T00:00:00+00:00".to_string();
        let mut cached = app();
        cached.status = Some(ApplicationDefinitionStatus {
            annotations: [
                ("test-comp-config".to_string(), hash),
                (
                    restart_stamp_key("test-comp-config"),
                    recorded.clone(),
                ),
            ]
            .into(),
            ..Default::default()
        });
        let output = OperatorStrategy.build(&cached, &component).unwrap();
        let sts = output
            .resources
            .iter()
            .find_map(|r| match r {
                DesiredResource::StatefulSet(s) => Some(s),
                _ => None,
            })
            .unwrap();
        let annotations = sts
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .annotations
            .as_ref()
            .unwrap();
        assert_eq!(annotations.get(ANNOTATION_RESTARTED_AT), Some(&recorded));
        // An unchanged hash must not re-stamp a fresh timestamp.
        assert!(!output.config_hashes.contains_key(&restart_stamp_key("test-comp-config")));
    }

    #[test]
    fn changed_config_content_changes_the_hash() {
        let a = hash_config_data(&[("f".to_string(), "1".to_string())].into());
        let b = hash_config_data(&[("f".to_string(), "2".to_string())].into());
        assert_ne!(a, b);
        let again = hash_config_data(&[("f".to_string(), "1".to_string())].into());
        assert_eq!(a, again);
    }

    #[test]
    fn unknown_strategy_keys_pass_through_untouched() {
        let component = ApplicationComponent {
            name: "web".into(),
            type_: "custom".into(),
            api_version: None,
            kind: None,
            properties: None,
        };
        assert_eq!(component.strategy_key(), "custom");
    }
}
