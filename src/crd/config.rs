//! Normalized component configuration (`ResourceConfig`)
//!
//! The recognized schema of a component's opaque `properties` blob, as
//! interpreted by the default "operator" builder strategy. Pod-level
//! fields reuse the native k8s-openapi types so user YAML passes through
//! untouched. This type is deliberately not part of the CRD schema: the
//! blob stays opaque to the API server and only the selected strategy
//! parses it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvFromSource, EnvVar, PodSecurityContext, Probe, ResourceRequirements,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};

/// Parsed form of a component's `properties`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    /// Desired workload replicas; nil means the API default of 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<EnvVar>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_from: Option<Vec<EnvFromSource>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_security_context: Option<PodSecurityContext>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<ServiceAccountConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Per-replica storage via StatefulSet volume-claim templates.
    /// Mutually exclusive with `persistence`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    /// Shared claim mounted by every replica (Deployment only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceConfig>,

    /// Existing ConfigMaps mounted into the main container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_maps: Vec<MountedSource>,

    /// Existing Secrets mounted into the main container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<MountedSource>,

    /// Inline configuration files (filename -> content), rendered into a
    /// generated ConfigMap.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_files: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_containers: Option<Vec<Container>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_volumes: Option<Vec<Volume>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_volume_mounts: Option<Vec<VolumeMount>>,

    /// Workload update strategy type (RollingUpdate, OnDelete, Recreate).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<String>,

    /// StatefulSet pod management policy (OrderedReady, Parallel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_management_policy: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PdbConfig>,
}

impl ResourceConfig {
    /// Parse the opaque properties blob; an absent blob is an empty config.
    pub fn from_properties(
        properties: Option<&serde_json::Value>,
    ) -> Result<ResourceConfig, serde_json::Error> {
        match properties {
            Some(value) => serde_json::from_value(value.clone()),
            None => Ok(ResourceConfig::default()),
        }
    }

    /// Kind-independent validation: storage and persistence are mutually
    /// exclusive ways to attach data volumes.
    pub fn validate(&self) -> Result<(), String> {
        let storage_on = self.storage.as_ref().map(|s| s.enabled).unwrap_or(false);
        let persistence_on = self
            .persistence
            .as_ref()
            .map(|p| p.enabled)
            .unwrap_or(false);
        if storage_on && persistence_on {
            return Err("storage and persistence are mutually exclusive".to_string());
        }
        Ok(())
    }
}

/// Container image coordinates.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
}

impl ImageConfig {
    /// Full image reference; a missing tag means `latest`.
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag.as_deref().unwrap_or("latest"))
    }

    /// Explicit policy wins; otherwise `latest` pulls Always and pinned
    /// tags pull IfNotPresent.
    pub fn effective_pull_policy(&self) -> String {
        if let Some(policy) = &self.pull_policy {
            return policy.clone();
        }
        match self.tag.as_deref() {
            Some("latest") | None => "Always".to_string(),
            Some(_) => "IfNotPresent".to_string(),
        }
    }
}

/// One exposed container port.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

impl PortConfig {
    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("TCP")
    }

    /// Port name with the `port-N-proto` default applied.
    pub fn effective_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!(
                "port-{}-{}",
                self.container_port,
                self.protocol().to_lowercase()
            ),
        }
    }
}

/// Service exposure sub-config.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Service type; defaults to ClusterIP. The string "None" disables
    /// client service creation entirely.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
}

impl ServiceConfig {
    /// A client service is built iff ports exist and the type isn't "None".
    pub fn is_enabled(&self) -> bool {
        !self.ports.is_empty() && self.type_.as_deref() != Some("None")
    }

    pub fn effective_type(&self) -> &str {
        self.type_.as_deref().unwrap_or("ClusterIP")
    }
}

/// ServiceAccount intent.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    /// Create a dedicated account; nil means true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ServiceAccountConfig {
    pub fn should_create(&self) -> bool {
        self.create.unwrap_or(true)
    }
}

/// Per-replica storage via volume-claim templates (StatefulSet).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Claim-template name; defaults to "data".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
    /// Sub-path inside the claim to mount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// Shared-claim persistence (Deployment).
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    /// Volume name used inside the pod; defaults to "data".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_modes: Option<Vec<String>>,
}

/// Reference to an existing ConfigMap or Secret to mount.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MountedSource {
    pub name: String,
    pub mount_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

/// Disruption-budget intent for the component's pods.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdbConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
}
