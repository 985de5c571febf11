//! ApplicationDefinition custom resource
//!
//! The user-authored declaration: an ordered bag of typed components that
//! the operator continuously drives the cluster toward.

use std::collections::BTreeMap;

use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    Condition, Phase, ANNOTATION_CHANGE_ID, ANNOTATION_CHANGE_WEBHOOK_URL, ANNOTATION_CLUSTER_ID,
    DEFAULT_STRATEGY,
};

/// Spec of the ApplicationDefinition CRD.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "infini.cloud",
    version = "v1",
    kind = "ApplicationDefinition",
    plural = "applicationdefinitions",
    shortname = "appdef",
    namespaced,
    status = "ApplicationDefinitionStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Components","type":"string","jsonPath":".status.components[*].name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDefinitionSpec {
    /// Ordered components of the application; names must be unique.
    pub components: Vec<ApplicationComponent>,

    /// Scale every workload to zero while keeping the declaration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<bool>,
}

/// One entry in a declaration, bound to a builder strategy by its type.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationComponent {
    /// DNS-subdomain name, unique within the declaration.
    pub name: String,

    /// Builder strategy key; empty selects the default "operator" strategy.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,

    /// Advertised apiVersion of the primary workload (e.g. "apps/v1").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Advertised kind of the primary workload (Deployment or StatefulSet).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Opaque, strategy-interpreted configuration. Unknown fields are
    /// preserved; only the selected strategy gives them meaning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
}

impl ApplicationComponent {
    /// Strategy key with the default applied.
    pub fn strategy_key(&self) -> &str {
        if self.type_.is_empty() {
            DEFAULT_STRATEGY
        } else {
            &self.type_
        }
    }
}

/// Status subresource of an ApplicationDefinition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDefinitionStatus {
    /// Spec generation last fully processed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current lifecycle phase.
    #[serde(default)]
    pub phase: Phase,

    /// Conditions keyed by type; "Ready" mirrors overall readiness.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-component status, keyed by component name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentStatusReference>,

    /// Replica counts captured when suspending, restored on resume.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub suspended_replicas: BTreeMap<String, i32>,

    /// Change-id of the last fully successful reconcile.
    #[serde(default, rename = "lastChangeID", skip_serializing_if = "Option::is_none")]
    pub last_change_id: Option<String>,

    /// Operator-managed cache, currently config content hashes keyed by
    /// ConfigMap name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Pointer from a component to its primary workload plus health.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatusReference {
    /// Component name, matching the spec entry.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Name of the primary workload resource, populated post-build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// True once the per-kind readiness predicate holds.
    #[serde(default)]
    pub healthy: bool,

    /// Human-readable state or failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApplicationDefinition {
    /// Whether spec.suspend is set.
    pub fn is_suspended(&self) -> bool {
        self.spec.suspend.unwrap_or(false)
    }

    /// Phase currently recorded in status.
    pub fn phase(&self) -> Phase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Opaque caller-supplied correlation token, if any.
    pub fn change_id(&self) -> Option<&str> {
        self.annotations().get(ANNOTATION_CHANGE_ID).map(String::as_str)
    }

    /// Cluster identifier embedded in webhook payloads.
    pub fn cluster_id(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_CLUSTER_ID)
            .map(String::as_str)
    }

    /// Destination for structured change-events, if configured.
    pub fn webhook_url(&self) -> Option<&str> {
        self.annotations()
            .get(ANNOTATION_CHANGE_WEBHOOK_URL)
            .map(String::as_str)
    }

    /// Validate component naming: at least one component, every name
    /// non-empty and unique.
    pub fn validate_components(&self) -> Result<(), String> {
        if self.spec.components.is_empty() {
            return Err("declaration must contain at least one component".to_string());
        }
        let mut seen = std::collections::BTreeSet::new();
        for component in &self.spec.components {
            if component.name.is_empty() {
                return Err("component name must not be empty".to_string());
            }
            if !seen.insert(component.name.as_str()) {
                return Err(format!("duplicate component name: {}", component.name));
            }
        }
        Ok(())
    }
}
