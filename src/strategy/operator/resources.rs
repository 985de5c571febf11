//! Supporting resource builders for the default strategy
//!
//! Services, generated ConfigMaps, ServiceAccounts, storage claims and
//! disruption budgets surrounding a component's primary workload.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolumeClaim, PersistentVolumeClaimSpec, Service, ServiceAccount,
    ServicePort, ServiceSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crd::{PdbConfig, PersistenceConfig, ServiceConfig, StorageConfig};

use super::WorkloadInputs;

pub fn config_map_name(instance: &str) -> String {
    format!("{instance}-config")
}

pub fn pvc_name(instance: &str) -> String {
    format!("{instance}-pvc")
}

pub fn headless_service_name(instance: &str) -> String {
    format!("{instance}-headless")
}

pub fn pdb_name(instance: &str) -> String {
    format!("{instance}-pdb")
}

/// Pod volume name for the shared claim.
pub fn shared_volume_name(persistence: &PersistenceConfig) -> String {
    persistence
        .volume_name
        .clone()
        .unwrap_or_else(|| "data".to_string())
}

// ============================================================================
// ConfigMap
// ============================================================================

pub fn build_config_map(
    instance: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    files: &BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(instance)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: Some(files.clone()),
        ..Default::default()
    }
}

// ============================================================================
// ServiceAccount
// ============================================================================

pub fn build_service_account(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    annotations: Option<BTreeMap<String, String>>,
) -> ServiceAccount {
    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Shared claim backing a Deployment's persistence config.
pub fn build_shared_pvc(
    instance: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    persistence: &PersistenceConfig,
) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    if let Some(size) = &persistence.size {
        requests.insert("storage".to_string(), Quantity(size.clone()));
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(pvc_name(instance)),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(
                persistence
                    .access_modes
                    .clone()
                    .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]),
            ),
            storage_class_name: persistence.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

/// Per-replica claim template for StatefulSets. Size and mount path are
/// validated before the build reaches this point.
pub fn build_volume_claim_template(storage: &StorageConfig) -> PersistentVolumeClaim {
    let mut requests = BTreeMap::new();
    if let Some(size) = &storage.size {
        requests.insert("storage".to_string(), Quantity(size.clone()));
    }

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(
                storage
                    .claim_template
                    .clone()
                    .unwrap_or_else(|| "data".to_string()),
            ),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(
                storage
                    .access_modes
                    .clone()
                    .unwrap_or_else(|| vec!["ReadWriteOnce".to_string()]),
            ),
            storage_class_name: storage.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Services
// ============================================================================

/// Headless service for StatefulSet pod identity; ports mirror the
/// component's container ports.
pub fn build_headless_service(inputs: &WorkloadInputs) -> Service {
    let ports = inputs
        .config
        .ports
        .iter()
        .map(|port| ServicePort {
            name: Some(port.effective_name()),
            port: port.container_port,
            protocol: Some(port.protocol().to_string()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Service {
        metadata: ObjectMeta {
            name: Some(headless_service_name(inputs.instance)),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(inputs.labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            selector: Some(inputs.selector.clone()),
            ports: Some(ports),
            ..Default::default()
        }),
        status: None,
    }
}

/// Client-facing service from the component's service sub-config.
pub fn build_client_service(inputs: &WorkloadInputs, service: &ServiceConfig) -> Service {
    let service_type = service.effective_type();
    let ports = service
        .ports
        .iter()
        .map(|port| ServicePort {
            name: Some(port.effective_name()),
            port: port.container_port,
            protocol: Some(port.protocol().to_string()),
            target_port: port.target_port.clone(),
            node_port: if service_type == "NodePort" {
                port.node_port
            } else {
                None
            },
            ..Default::default()
        })
        .collect::<Vec<_>>();

    Service {
        metadata: ObjectMeta {
            name: Some(inputs.instance.to_string()),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(inputs.labels.clone()),
            annotations: service.annotations.clone(),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(service_type.to_string()),
            selector: Some(inputs.selector.clone()),
            ports: Some(ports),
            session_affinity: service.session_affinity.clone(),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// PodDisruptionBudget
// ============================================================================

pub fn build_pdb(inputs: &WorkloadInputs, pdb: &PdbConfig) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: ObjectMeta {
            name: Some(pdb_name(inputs.instance)),
            namespace: Some(inputs.namespace.to_string()),
            labels: Some(inputs.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: pdb.min_available.clone(),
            max_unavailable: pdb.max_unavailable.clone(),
            selector: Some(LabelSelector {
                match_labels: Some(inputs.selector.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    }
}
