//! Shared types and wire constants for ApplicationDefinition resources
//!
//! These types are used across the CRD definitions and controller logic.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the declaration CRD.
pub const API_GROUP: &str = "infini.cloud";

/// Finalizer token holding deletion open until cleanup has run.
pub const FINALIZER: &str = "infini.cloud/finalizer";

/// Field manager identity used for every server-side apply.
pub const MANAGER_NAME: &str = "runtime-operator";

/// Default builder strategy key.
pub const DEFAULT_STRATEGY: &str = "operator";

// Annotations consumed on the declaration (external -> operator).
pub const ANNOTATION_CHANGE_ID: &str = "infini.cloud/change-id";
pub const ANNOTATION_CLUSTER_ID: &str = "infini.cloud/cluster-id";
pub const ANNOTATION_CHANGE_WEBHOOK_URL: &str = "infini.cloud/change-webhook-url";

/// Annotation stamped on pod templates to trigger a rolling restart.
pub const ANNOTATION_RESTARTED_AT: &str = "runtime-operator/restartedAt";

// Annotations carried on emitted events; the webhook sink copies them
// into the payload's phase/status/step fields.
pub const ANNOTATION_EVENT_PHASE: &str = "infini.cloud/phase";
pub const ANNOTATION_EVENT_STATUS: &str = "infini.cloud/status";
pub const ANNOTATION_EVENT_STEP: &str = "infini.cloud/step";

// Labels set on every owned resource.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_APPLICATION_NAME: &str = "infini.cloud/application-name";
pub const LABEL_COMPONENT_NAME: &str = "infini.cloud/component-name";
pub const LABEL_COMPONENT_INSTANCE: &str = "infini.cloud/component-instance";

/// Lifecycle phase of an ApplicationDefinition.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Phase {
    /// Declaration accepted, nothing reconciled yet
    #[default]
    Pending,
    /// First pass is materializing resources
    Creating,
    /// Resources exist but at least one component is still rolling out
    Updating,
    /// Every component reports healthy
    Running,
    /// Previously ready, now at least one component is unhealthy
    Degraded,
    /// spec.suspend=true; workloads scaled to zero
    Suspended,
    /// Deletion timestamp set; cleanup in progress
    Deleting,
    /// A build or apply error stopped the pass
    Failed,
}

impl Phase {
    /// Whether every component was healthy when this phase was computed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Phase::Running)
    }

    /// Whether this phase was reached from an all-healthy state.
    pub fn was_ready(&self) -> bool {
        matches!(self, Phase::Running | Phase::Degraded)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Updating => "Updating",
            Phase::Running => "Running",
            Phase::Degraded => "Degraded",
            Phase::Suspended => "Suspended",
            Phase::Deleting => "Deleting",
            Phase::Failed => "Failed",
        };
        write!(f, "{}", s)
    }
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "Progressing")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl Condition {
    /// Create a new Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a new Progressing condition
    pub fn progressing(reason: &str, message: &str) -> Self {
        Self {
            type_: "Progressing".to_string(),
            status: "True".to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
        }
    }

    /// Equality ignoring the transition timestamp. Status writes are
    /// elided when nothing but the timestamp would change.
    pub fn same_apart_from_time(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Upsert a condition into a list keyed by type, keeping the previous
/// transition timestamp unless the status actually flipped.
pub fn upsert_condition(conditions: &mut Vec<Condition>, mut next: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == next.type_) {
        if existing.same_apart_from_time(&next) {
            return;
        }
        if existing.status == next.status {
            next.last_transition_time = existing.last_transition_time.clone();
        }
        *existing = next;
    } else {
        conditions.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serializes_as_bare_name() {
        assert_eq!(
            serde_json::to_string(&Phase::Running).unwrap(),
            "\"Running\""
        );
        let p: Phase = serde_json::from_str("\"Degraded\"").unwrap();
        assert_eq!(p, Phase::Degraded);
    }

    #[test]
    fn upsert_keeps_timestamp_when_unchanged() {
        let mut conditions = vec![];
        upsert_condition(&mut conditions, Condition::ready(true, "AllHealthy", "ok"));
        let stamped = conditions[0].last_transition_time.clone();

        upsert_condition(&mut conditions, Condition::ready(true, "AllHealthy", "ok"));
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, stamped);
    }

    #[test]
    fn upsert_replaces_on_status_flip() {
        let mut conditions = vec![];
        upsert_condition(&mut conditions, Condition::ready(true, "AllHealthy", "ok"));
        upsert_condition(
            &mut conditions,
            Condition::ready(false, "Degraded", "web unhealthy"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].reason, "Degraded");
    }

    #[test]
    fn ready_phases() {
        assert!(Phase::Running.is_ready());
        assert!(!Phase::Degraded.is_ready());
        assert!(Phase::Degraded.was_ready());
        assert!(!Phase::Updating.was_ready());
    }
}
