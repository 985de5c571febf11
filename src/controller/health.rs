//! Per-kind health evaluation for managed resources
//!
//! Pure readiness predicates over fetched objects, plus the dispatching
//! entry point. A fetch or conversion failure is a process error (the
//! check itself failed); an existing-but-not-ready resource is a routine
//! not-ready answer.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, PersistentVolumeClaim, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;

use crate::error::Result;

/// Outcome of a health check that itself succeeded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Health {
    pub healthy: bool,
    pub message: String,
}

impl Health {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    pub fn not_ready(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }
}

/// Evaluate the health of one managed resource. `Err` means the check
/// could not run (transport failure); the caller retries with backoff.
pub async fn check_resource(
    client: &Client,
    namespace: &str,
    name: &str,
    api_version: &str,
    kind: &str,
) -> Result<Health> {
    match (api_version, kind) {
        ("apps/v1", "Deployment") => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(name).await? {
                Some(deployment) => Ok(deployment_health(&deployment)),
                None => Ok(missing(kind, namespace, name)),
            }
        }
        ("apps/v1", "StatefulSet") => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(name).await? {
                Some(statefulset) => Ok(statefulset_health(&statefulset)),
                None => Ok(missing(kind, namespace, name)),
            }
        }
        ("v1", "Service") => {
            let api: Api<Service> = Api::namespaced(client.clone(), namespace);
            let Some(service) = api.get_opt(name).await? else {
                return Ok(missing(kind, namespace, name));
            };
            let endpoints = if needs_endpoints(&service) {
                let endpoints_api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
                endpoints_api.get_opt(name).await?
            } else {
                None
            };
            Ok(service_health(&service, endpoints.as_ref()))
        }
        ("v1", "PersistentVolumeClaim") => {
            let api: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(name).await? {
                Some(pvc) => Ok(pvc_health(&pvc)),
                None => Ok(missing(kind, namespace, name)),
            }
        }
        ("policy/v1", "PodDisruptionBudget") => {
            let api: Api<PodDisruptionBudget> = Api::namespaced(client.clone(), namespace);
            match api.get_opt(name).await? {
                Some(pdb) => Ok(pdb_health(&pdb)),
                None => Ok(missing(kind, namespace, name)),
            }
        }
        ("v1", "ConfigMap") => {
            let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
            Ok(existence(api.get_opt(name).await?.is_some(), kind, namespace, name))
        }
        ("v1", "Secret") => {
            let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
            Ok(existence(api.get_opt(name).await?.is_some(), kind, namespace, name))
        }
        ("v1", "ServiceAccount") => {
            let api: Api<ServiceAccount> = Api::namespaced(client.clone(), namespace);
            Ok(existence(api.get_opt(name).await?.is_some(), kind, namespace, name))
        }
        _ => {
            // No specific check registered; fall back to existence.
            let gvk = match api_version.split_once('/') {
                Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
                None => GroupVersionKind::gvk("", api_version, kind),
            };
            let resource = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> =
                Api::namespaced_with(client.clone(), namespace, &resource);
            match api.get_opt(name).await? {
                Some(_) => Ok(Health::ok(format!(
                    "{kind} {namespace}/{name} exists; no specific health check registered"
                ))),
                None => Ok(missing(kind, namespace, name)),
            }
        }
    }
}

fn needs_endpoints(service: &Service) -> bool {
    let spec = service.spec.as_ref();
    let type_ = spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");
    !matches!(type_, "ExternalName" | "LoadBalancer")
}

fn missing(kind: &str, namespace: &str, name: &str) -> Health {
    Health::not_ready(format!("{kind} {namespace}/{name} not found"))
}

fn existence(exists: bool, kind: &str, namespace: &str, name: &str) -> Health {
    if exists {
        Health::ok(format!("{kind} {namespace}/{name} exists"))
    } else {
        missing(kind, namespace, name)
    }
}

/// Deployment readiness: not paused, generation observed, Available and
/// fully-progressed conditions, and every replica counter caught up.
pub fn deployment_health(deployment: &Deployment) -> Health {
    let Some(spec) = deployment.spec.as_ref() else {
        return Health::not_ready("deployment has no spec");
    };
    if spec.paused == Some(true) {
        return Health::not_ready("deployment is paused");
    }
    let Some(status) = deployment.status.as_ref() else {
        return Health::not_ready("deployment has not reported status yet");
    };

    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Health::not_ready("waiting for the deployment controller to observe the spec");
    }

    let conditions = status.conditions.as_deref().unwrap_or_default();
    let available = conditions
        .iter()
        .any(|c| c.type_ == "Available" && c.status == "True");
    if !available {
        return Health::not_ready("deployment is not Available");
    }
    let progressed = conditions.iter().any(|c| {
        c.type_ == "Progressing"
            && c.status == "True"
            && c.reason.as_deref() == Some("NewReplicaSetAvailable")
    });
    if !progressed {
        return Health::not_ready("deployment rollout is still progressing");
    }

    let desired = spec.replicas.unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available_replicas = status.available_replicas.unwrap_or(0);
    if updated < desired || ready < desired || available_replicas < desired {
        return Health::not_ready(format!(
            "deployment has {ready}/{desired} ready replicas ({updated} updated, {available_replicas} available)"
        ));
    }

    Health::ok(format!("deployment has {ready}/{desired} ready replicas"))
}

/// StatefulSet readiness, honoring a rolling-update partition.
pub fn statefulset_health(statefulset: &StatefulSet) -> Health {
    let Some(spec) = statefulset.spec.as_ref() else {
        return Health::not_ready("statefulset has no spec");
    };
    let Some(status) = statefulset.status.as_ref() else {
        return Health::not_ready("statefulset has not reported status yet");
    };

    let generation = statefulset.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Health::not_ready("waiting for the statefulset controller to observe the spec");
    }

    let desired = spec.replicas.unwrap_or(1);
    let partition = spec
        .update_strategy
        .as_ref()
        .and_then(|s| s.rolling_update.as_ref())
        .and_then(|r| r.partition);
    let need_updated = match partition {
        Some(partition) => desired - partition,
        None => desired,
    };

    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let current = status.current_replicas.unwrap_or(0);
    if updated < need_updated {
        return Health::not_ready(format!(
            "statefulset has {updated}/{need_updated} updated replicas"
        ));
    }
    if ready < desired || current < desired {
        return Health::not_ready(format!(
            "statefulset has {ready}/{desired} ready replicas ({current} current)"
        ));
    }

    Health::ok(format!("statefulset has {ready}/{desired} ready replicas"))
}

/// Service readiness by type: headless and ClusterIP services are judged
/// by their endpoints, LoadBalancers by ingress assignment, ExternalName
/// by existence.
pub fn service_health(service: &Service, endpoints: Option<&Endpoints>) -> Health {
    let spec = service.spec.as_ref();
    let type_ = spec.and_then(|s| s.type_.as_deref()).unwrap_or("ClusterIP");

    if type_ == "ExternalName" {
        return Health::ok("externalname service exists");
    }

    if type_ == "LoadBalancer" {
        let assigned = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .map(|ingress| {
                ingress.iter().any(|i| {
                    i.ip.as_deref().map_or(false, |ip| !ip.is_empty())
                        || i.hostname.as_deref().map_or(false, |h| !h.is_empty())
                })
            })
            .unwrap_or(false);
        return if assigned {
            Health::ok("loadbalancer ingress is assigned")
        } else {
            Health::not_ready("waiting for loadbalancer ingress")
        };
    }

    let headless = spec.and_then(|s| s.cluster_ip.as_deref()) == Some("None");
    let Some(endpoints) = endpoints else {
        return Health::not_ready("service has no endpoints object");
    };
    let subsets = endpoints.subsets.as_deref().unwrap_or_default();

    if headless {
        // Headless services back StatefulSet identity; even a not-ready
        // address means the pods are resolvable.
        let any_address = subsets.iter().any(|s| {
            s.addresses.as_deref().map_or(false, |a| !a.is_empty())
                || s.not_ready_addresses
                    .as_deref()
                    .map_or(false, |a| !a.is_empty())
        });
        return if any_address {
            Health::ok("headless service has addresses")
        } else {
            Health::not_ready("headless service has no addresses")
        };
    }

    let ready_address = subsets
        .iter()
        .any(|s| s.addresses.as_deref().map_or(false, |a| !a.is_empty()));
    if ready_address {
        Health::ok("service has ready endpoints")
    } else {
        Health::not_ready("service has no ready endpoints")
    }
}

/// Claim readiness: only Bound counts.
pub fn pvc_health(pvc: &PersistentVolumeClaim) -> Health {
    match pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
    {
        "Bound" => Health::ok("claim is bound"),
        "Pending" => Health::not_ready("claim is pending binding"),
        "Lost" => Health::not_ready("claim lost its backing volume"),
        phase => Health::not_ready(format!("claim is in phase {phase:?}")),
    }
}

pub fn pdb_health(pdb: &PodDisruptionBudget) -> Health {
    let Some(status) = pdb.status.as_ref() else {
        return Health::not_ready("disruption budget has not reported status yet");
    };
    let generation = pdb.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return Health::not_ready("waiting for the disruption budget to observe the spec");
    }
    if status.current_healthy < status.desired_healthy {
        return Health::not_ready(format!(
            "disruption budget has {}/{} healthy pods",
            status.current_healthy, status.desired_healthy
        ));
    }
    Health::ok("disruption budget is satisfied")
}
