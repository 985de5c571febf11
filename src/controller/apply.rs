//! Server-side apply executor
//!
//! Applies desired resources with the operator's field-manager identity,
//! injecting the controller owner reference and preserving fields the API
//! server treats as immutable.

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::crd::ApplicationDefinition;
use crate::error::{Error, Result};
use crate::strategy::DesiredResource;

/// What a single apply did on the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Created => "Created",
            Operation::Updated => "Updated",
            Operation::Unchanged => "Unchanged",
        };
        write!(f, "{}", s)
    }
}

/// Wraps server-side apply for every resource kind a builder can emit.
pub struct ApplyExecutor {
    client: Client,
    field_manager: String,
}

impl ApplyExecutor {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Idempotently apply one desired resource owned by the declaration.
    pub async fn apply(
        &self,
        app: &ApplicationDefinition,
        resource: DesiredResource,
    ) -> Result<Operation> {
        match resource {
            DesiredResource::Service(mut service) => {
                let namespace = object_namespace(app, &service.metadata);
                let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
                let name = required_name(&service.metadata, "Service")?;
                let current = api
                    .get_opt(&name)
                    .await
                    .map_err(|e| apply_error("Service", &namespace, &name, e))?;
                preserve_cluster_ip(&mut service, current.as_ref());
                self.apply_with_current(app, &api, service, current).await
            }
            DesiredResource::Deployment(o) => self.apply_kind(app, o).await,
            DesiredResource::StatefulSet(o) => self.apply_kind(app, o).await,
            DesiredResource::ConfigMap(o) => self.apply_kind(app, o).await,
            DesiredResource::ServiceAccount(o) => self.apply_kind(app, o).await,
            DesiredResource::PersistentVolumeClaim(o) => self.apply_kind(app, o).await,
            DesiredResource::PodDisruptionBudget(o) => self.apply_kind(app, o).await,
        }
    }

    async fn apply_kind<K>(&self, app: &ApplicationDefinition, obj: K) -> Result<Operation>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
    {
        let kind = K::kind(&()).into_owned();
        let namespace = object_namespace(app, obj.meta());
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let name = required_name(obj.meta(), &kind)?;
        let current = api
            .get_opt(&name)
            .await
            .map_err(|e| apply_error(&kind, &namespace, &name, e))?;
        self.apply_with_current(app, &api, obj, current).await
    }

    async fn apply_with_current<K>(
        &self,
        app: &ApplicationDefinition,
        api: &Api<K>,
        mut obj: K,
        current: Option<K>,
    ) -> Result<Operation>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Serialize
            + DeserializeOwned
            + Clone
            + std::fmt::Debug,
    {
        let kind = K::kind(&()).into_owned();
        let namespace = object_namespace(app, obj.meta());
        let name = required_name(obj.meta(), &kind)?;

        ensure_controller_reference(
            app,
            &kind,
            obj.meta_mut(),
            current.as_ref().map(|c| c.meta()),
        )?;

        // Typed k8s-openapi objects serialize without their type meta;
        // server-side apply requires it in the patch body.
        let mut body = serde_json::to_value(&obj).map_err(|e| Error::ApplyError {
            kind: kind.clone(),
            namespace: namespace.clone(),
            name: name.clone(),
            message: format!("serialization failed: {e}"),
            conflict: false,
        })?;
        body["apiVersion"] = serde_json::Value::String(K::api_version(&()).into_owned());
        body["kind"] = serde_json::Value::String(kind.clone());

        let params = PatchParams::apply(&self.field_manager).force();
        let applied = api
            .patch(&name, &params, &Patch::Apply(&body))
            .await
            .map_err(|e| apply_error(&kind, &namespace, &name, e))?;

        let operation = classify(current.as_ref(), &applied);
        debug!(%kind, %namespace, %name, %operation, "applied resource");
        Ok(operation)
    }
}

/// Set the controller owner reference on the desired object, rejecting
/// resources already controlled by someone else.
pub fn ensure_controller_reference(
    app: &ApplicationDefinition,
    kind: &str,
    meta: &mut ObjectMeta,
    current: Option<&ObjectMeta>,
) -> Result<()> {
    let app_uid = app.metadata.uid.clone().unwrap_or_default();
    if let Some(existing) = current
        .and_then(|m| m.owner_references.as_ref())
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
    {
        if existing.uid != app_uid {
            return Err(Error::OwnerRefError {
                kind: kind.to_string(),
                name: meta.name.clone().unwrap_or_default(),
                message: format!(
                    "already controlled by {} {}",
                    existing.kind, existing.name
                ),
            });
        }
    }
    meta.owner_references = Some(vec![controller_reference(app)]);
    Ok(())
}

/// The controller owner reference pointing back at the declaration.
pub fn controller_reference(app: &ApplicationDefinition) -> OwnerReference {
    OwnerReference {
        api_version: ApplicationDefinition::api_version(&()).to_string(),
        kind: ApplicationDefinition::kind(&()).to_string(),
        name: app.name_any(),
        uid: app.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Copy an already-assigned clusterIP into the desired Service so the
/// apply doesn't trip over the immutable field.
fn preserve_cluster_ip(desired: &mut Service, current: Option<&Service>) {
    let assigned = current
        .and_then(|c| c.spec.as_ref())
        .and_then(|s| s.cluster_ip.clone())
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = assigned {
        desired.spec.get_or_insert_with(Default::default).cluster_ip = Some(ip);
    }
}

fn classify<K: Resource>(current: Option<&K>, applied: &K) -> Operation {
    match current {
        None => Operation::Created,
        Some(c) if c.meta().resource_version == applied.meta().resource_version => {
            Operation::Unchanged
        }
        _ => Operation::Updated,
    }
}

fn object_namespace(app: &ApplicationDefinition, meta: &ObjectMeta) -> String {
    meta.namespace
        .clone()
        .or_else(|| app.namespace())
        .unwrap_or_else(|| "default".to_string())
}

fn required_name(meta: &ObjectMeta, kind: &str) -> Result<String> {
    meta.name
        .clone()
        .ok_or_else(|| Error::ConfigError(format!("{kind} resource is missing a name")))
}

fn apply_error(kind: &str, namespace: &str, name: &str, err: kube::Error) -> Error {
    let conflict = matches!(&err, kube::Error::Api(e) if e.code == 409);
    Error::ApplyError {
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        message: err.to_string(),
        conflict,
    }
}
