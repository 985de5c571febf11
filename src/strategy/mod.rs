//! Builder strategy dispatch
//!
//! Maps a component's type string to the strategy that materializes its
//! opaque properties into concrete Kubernetes resources. Registries are
//! populated once before the controller starts and are read-only after.

pub mod operator;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::crd::{ApplicationComponent, ApplicationDefinition, DEFAULT_STRATEGY};
use crate::error::Result;

/// Kind of the single controller-producing resource of a component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl WorkloadKind {
    pub const API_VERSION: &'static str = "apps/v1";

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::StatefulSet => "StatefulSet",
        }
    }

    /// Workload kind advertised by the component; Deployment unless the
    /// component explicitly asks for StatefulSet.
    pub fn from_component(component: &ApplicationComponent) -> WorkloadKind {
        match component.kind.as_deref() {
            Some("StatefulSet") => WorkloadKind::StatefulSet,
            _ => WorkloadKind::Deployment,
        }
    }
}

/// GVK + name of the workload that represents a component's health.
#[derive(Clone, Debug, PartialEq)]
pub struct PrimaryWorkload {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// A fully-formed resource emitted by a builder, ready for server-side
/// apply. Typed rather than dynamic: every kind the built-in strategy
/// emits is known at compile time, and the suspend transform, immutable-
/// field handling and health dispatch all need kind-specific access.
#[derive(Clone, Debug)]
pub enum DesiredResource {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    Service(Service),
    ConfigMap(ConfigMap),
    ServiceAccount(ServiceAccount),
    PersistentVolumeClaim(PersistentVolumeClaim),
    PodDisruptionBudget(PodDisruptionBudget),
}

impl DesiredResource {
    pub fn kind(&self) -> &'static str {
        match self {
            DesiredResource::Deployment(_) => "Deployment",
            DesiredResource::StatefulSet(_) => "StatefulSet",
            DesiredResource::Service(_) => "Service",
            DesiredResource::ConfigMap(_) => "ConfigMap",
            DesiredResource::ServiceAccount(_) => "ServiceAccount",
            DesiredResource::PersistentVolumeClaim(_) => "PersistentVolumeClaim",
            DesiredResource::PodDisruptionBudget(_) => "PodDisruptionBudget",
        }
    }

    pub fn api_version(&self) -> &'static str {
        match self {
            DesiredResource::Deployment(_) | DesiredResource::StatefulSet(_) => "apps/v1",
            DesiredResource::PodDisruptionBudget(_) => "policy/v1",
            _ => "v1",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            DesiredResource::Deployment(o) => &o.metadata,
            DesiredResource::StatefulSet(o) => &o.metadata,
            DesiredResource::Service(o) => &o.metadata,
            DesiredResource::ConfigMap(o) => &o.metadata,
            DesiredResource::ServiceAccount(o) => &o.metadata,
            DesiredResource::PersistentVolumeClaim(o) => &o.metadata,
            DesiredResource::PodDisruptionBudget(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> String {
        self.metadata().name.clone().unwrap_or_default()
    }

    /// Workload replica count, when this resource carries one.
    pub fn replicas(&self) -> Option<i32> {
        match self {
            DesiredResource::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            DesiredResource::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
            _ => None,
        }
    }

    /// Overwrite the workload replica count; no-op for other kinds.
    pub fn set_replicas(&mut self, replicas: i32) {
        match self {
            DesiredResource::Deployment(d) => {
                if let Some(spec) = d.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
            }
            DesiredResource::StatefulSet(s) => {
                if let Some(spec) = s.spec.as_mut() {
                    spec.replicas = Some(replicas);
                }
            }
            _ => {}
        }
    }

    pub fn is_workload(&self) -> bool {
        matches!(
            self,
            DesiredResource::Deployment(_) | DesiredResource::StatefulSet(_)
        )
    }
}

/// Everything a builder hands back for one component.
#[derive(Clone, Debug)]
pub struct BuildOutput {
    /// Desired objects in apply order; the order is stable across passes.
    pub resources: Vec<DesiredResource>,
    /// The workload that represents this component in status and health.
    pub primary: PrimaryWorkload,
    /// ConfigMap name -> sha256 of its data, computed this pass. The
    /// reconciler persists these in status so the next pass can detect
    /// config drift.
    pub config_hashes: BTreeMap<String, String>,
}

/// A builder strategy: materializes one component into its resource
/// graph. Pure with respect to cluster state.
pub trait Builder: Send + Sync {
    /// Expected kind of the component's primary workload.
    fn workload_kind(&self, component: &ApplicationComponent) -> WorkloadKind;

    /// Materialize the component. The strategy parses the opaque
    /// properties itself; nothing outside it interprets them.
    fn build(
        &self,
        app: &ApplicationDefinition,
        component: &ApplicationComponent,
    ) -> Result<BuildOutput>;
}

/// Outcome of one reconcile task step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskResult {
    Complete,
    /// Requeue without error.
    Pending,
    Failed(String),
}

/// Per-type hooks run by the reconcile loop outside the build path,
/// currently the cleanup step executed before finalizer removal.
pub trait ReconcileHook: Send + Sync {
    fn cleanup(
        &self,
        app: &ApplicationDefinition,
        component: &ApplicationComponent,
    ) -> TaskResult;
}

/// Write-once registries keyed by component type.
pub struct StrategyRegistry {
    builders: HashMap<String, Arc<dyn Builder>>,
    hooks: HashMap<String, Arc<dyn ReconcileHook>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
            hooks: HashMap::new(),
        }
    }

    /// Registry holding every built-in strategy.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builder(DEFAULT_STRATEGY, Arc::new(operator::OperatorStrategy));
        registry.register_hook(DEFAULT_STRATEGY, Arc::new(operator::OperatorStrategy));
        registry
    }

    /// Register a builder. Registration is write-once; a second
    /// registration for the same key is a programmer error.
    pub fn register_builder(&mut self, key: &str, builder: Arc<dyn Builder>) {
        if self.builders.insert(key.to_string(), builder).is_some() {
            panic!("builder strategy {key:?} registered twice");
        }
    }

    pub fn register_hook(&mut self, key: &str, hook: Arc<dyn ReconcileHook>) {
        if self.hooks.insert(key.to_string(), hook).is_some() {
            panic!("reconcile hook {key:?} registered twice");
        }
    }

    pub fn builder(&self, key: &str) -> Option<Arc<dyn Builder>> {
        self.builders.get(key).cloned()
    }

    pub fn hook(&self, key: &str) -> Option<Arc<dyn ReconcileHook>> {
        self.hooks.get(key).cloned()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
