//! Main reconciler for ApplicationDefinition resources
//!
//! Implements the controller pattern using kube-rs runtime. Each pass
//! runs a fixed pipeline: fetch, status snapshot, component-status init,
//! finalizer lifecycle, build, suspend/resume transform, apply, health,
//! phase computation, status write, events, requeue.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::Reporter,
        watcher::Config,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    upsert_condition, ApplicationDefinition, ApplicationDefinitionStatus, ComponentStatusReference,
    Condition, Phase, FINALIZER, MANAGER_NAME,
};
use crate::error::{Error, Result};
use crate::events::{ChangeEvent, EventSink, EventStatus, ResourceChange};
use crate::settings::Settings;
use crate::strategy::{DesiredResource, StrategyRegistry, TaskResult};

use super::apply::{ApplyExecutor, Operation};
use super::health;

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub settings: Settings,
    pub registry: Arc<StrategyRegistry>,
    pub reporter: Reporter,
}

impl ControllerState {
    pub fn new(client: Client, settings: Settings, registry: Arc<StrategyRegistry>) -> Self {
        Self {
            client,
            settings,
            registry,
            reporter: Reporter {
                controller: MANAGER_NAME.into(),
                instance: None,
            },
        }
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>) -> Result<()> {
    let client = state.client.clone();
    let namespace = state.settings.watch_namespace.clone();
    let apps: Api<ApplicationDefinition> = scoped_api(&client, namespace.as_deref());

    info!("Starting ApplicationDefinition controller");

    // Verify CRD exists
    match apps.list(&Default::default()).await {
        Ok(_) => info!("ApplicationDefinition CRD is available"),
        Err(e) => {
            error!(
                "ApplicationDefinition CRD not found. Please install the CRD first: {:?}",
                e
            );
            return Err(Error::ConfigError(
                "ApplicationDefinition CRD not installed".to_string(),
            ));
        }
    }

    Controller::new(apps, Config::default())
        // Watch owned resources for changes
        .owns(
            scoped_api::<Deployment>(&client, namespace.as_deref()),
            Config::default(),
        )
        .owns(
            scoped_api::<StatefulSet>(&client, namespace.as_deref()),
            Config::default(),
        )
        .owns(
            scoped_api::<Service>(&client, namespace.as_deref()),
            Config::default(),
        )
        .owns(
            scoped_api::<ConfigMap>(&client, namespace.as_deref()),
            Config::default(),
        )
        .owns(
            scoped_api::<PersistentVolumeClaim>(&client, namespace.as_deref()),
            Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Invoked whenever the declaration changes, an owned resource changes,
/// or the requeue timer expires.
#[instrument(skip(ctx, app), fields(name = %app.name_any(), namespace = app.namespace()))]
async fn reconcile(app: Arc<ApplicationDefinition>, ctx: Arc<ControllerState>) -> Result<Action> {
    let client = ctx.client.clone();
    let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<ApplicationDefinition> = Api::namespaced(client.clone(), &namespace);
    let name = app.name_any();

    // 1. Re-fetch the declaration; not-found means it went away.
    let Some(app) = api.get_opt(&name).await? else {
        return Ok(Action::await_change());
    };

    // 2. Snapshot the status for post-pipeline diffing.
    let original = app.status.clone().unwrap_or_default();
    let sink = EventSink::for_app(
        &client,
        &ctx.reporter,
        &app,
        original.last_change_id.as_deref(),
    );

    // Deletion path: cleanup hooks, then release the finalizer.
    if app.meta().deletion_timestamp.is_some() {
        if app.finalizers().iter().any(|f| f == FINALIZER) {
            if original.phase != Phase::Deleting {
                let mut status = original.clone();
                status.phase = Phase::Deleting;
                upsert_condition(
                    &mut status.conditions,
                    Condition::ready(false, "Deleting", "application is being deleted"),
                );
                if let Err(e) = patch_status_with_retry(&api, &name, &status).await {
                    // The object is on its way out; a failed phase write
                    // must not block cleanup.
                    warn!("could not record Deleting phase for {namespace}/{name}: {e}");
                }
            }
            sink.record(
                ChangeEvent::normal("Deleting", format!("cleaning up application {name}"))
                    .with_phase(Phase::Deleting)
                    .with_status(EventStatus::InProgress)
                    .with_step("cleanup"),
            )
            .await;
            for component in &app.spec.components {
                if let Some(hook) = ctx.registry.hook(component.strategy_key()) {
                    match hook.cleanup(&app, component) {
                        TaskResult::Complete => {}
                        TaskResult::Pending => return Ok(Action::requeue(Duration::from_secs(5))),
                        TaskResult::Failed(message) => {
                            return Err(Error::FinalizerError(format!(
                                "cleanup of component {} failed: {message}",
                                component.name
                            )))
                        }
                    }
                }
            }
            update_finalizers(&api, &name, false).await?;
            info!("Removed finalizer from {namespace}/{name}");
        }
        return Ok(Action::await_change());
    }

    // 3. Per-component status skeleton; bad names fail the pass.
    if let Err(message) = app.validate_components() {
        warn!("Validation failed for {namespace}/{name}: {message}");
        let mut status = original.clone();
        status.phase = Phase::Failed;
        upsert_condition(
            &mut status.conditions,
            Condition::ready(false, "ProcessingFailed", &message),
        );
        if !statuses_equal(&original, &status) {
            patch_status_with_retry(&api, &name, &status).await?;
        }
        sink.record(
            ChangeEvent::warning("ProcessingFailed", message.clone())
                .with_phase(Phase::Failed)
                .with_status(EventStatus::Failure)
                .with_step("validate"),
        )
        .await;
        return Err(Error::ValidationError(message));
    }
    let mut components: Vec<ComponentStatusReference> = app
        .spec
        .components
        .iter()
        .map(|component| ComponentStatusReference {
            name: component.name.clone(),
            healthy: false,
            message: Some("Initializing".to_string()),
            ..Default::default()
        })
        .collect();

    // 4. Finalizer add path.
    if !app.finalizers().iter().any(|f| f == FINALIZER) {
        update_finalizers(&api, &name, true).await?;
        debug!("Added finalizer to {namespace}/{name}");
        return Ok(Action::requeue(Duration::ZERO));
    }

    let suspended = app.is_suspended();
    let resuming = !suspended && original.phase == Phase::Suspended;

    // 5. Suspended fast-path: nothing to drive while already parked.
    if suspended && original.phase == Phase::Suspended {
        return Ok(Action::requeue(ctx.settings.requeue_interval()));
    }

    // 6. Initial-phase bump, persisted on its own so watchers see the
    // declaration was picked up.
    if original.phase == Phase::Pending {
        let mut status = original.clone();
        status.phase = Phase::Creating;
        upsert_condition(
            &mut status.conditions,
            Condition::progressing("Creating", "creating application resources"),
        );
        patch_status_with_retry(&api, &name, &status).await?;
        sink.record(
            ChangeEvent::normal("Creating", format!("creating resources for {name}"))
                .with_phase(Phase::Creating)
                .with_status(EventStatus::InProgress)
                .with_step("initialize"),
        )
        .await;
        return Ok(Action::requeue(Duration::ZERO));
    }

    // 7. Build phase: dispatch every component to its strategy.
    let mut first_error: Option<Error> = None;
    let mut desired: Vec<(String, DesiredResource)> = Vec::new();
    let mut new_hashes: BTreeMap<String, String> = BTreeMap::new();
    for (index, component) in app.spec.components.iter().enumerate() {
        let key = component.strategy_key();
        let Some(builder) = ctx.registry.builder(key) else {
            let err = Error::BuildError {
                component: component.name.clone(),
                message: format!("unknown strategy type: {key}"),
            };
            components[index].message = Some(format!("ProcessingFailed: {err}"));
            first_error = Some(err);
            break;
        };
        match builder.build(&app, component) {
            Ok(output) => {
                components[index].api_version = Some(output.primary.api_version);
                components[index].kind = Some(output.primary.kind);
                components[index].resource_name = Some(output.primary.name);
                components[index].namespace = Some(namespace.clone());
                desired.extend(
                    output
                        .resources
                        .into_iter()
                        .map(|resource| (component.name.clone(), resource)),
                );
                new_hashes.extend(output.config_hashes);
            }
            Err(err) => {
                components[index].message = Some(format!("ProcessingFailed: {err}"));
                first_error = Some(err);
                break;
            }
        }
    }

    // 8. Suspend/resume transform over the desired set.
    let mut suspended_replicas = original.suspended_replicas.clone();
    let mut replicas_parked = 0;
    let mut replicas_restored = 0;
    if first_error.is_none() {
        if suspended {
            replicas_parked = suspend_workloads(&mut desired, &mut suspended_replicas);
        } else if resuming {
            replicas_restored = resume_workloads(&mut desired, &mut suspended_replicas);
        }
    }

    // 9. Apply phase. Owner-ref conflicts abort; other failures are
    // recorded and the remaining resources still go out so partial
    // progress stays visible.
    let mut changed_resources = 0usize;
    if first_error.is_none() {
        let executor = ApplyExecutor::new(client.clone(), &ctx.settings.field_manager);
        let index_of: BTreeMap<&str, usize> = app
            .spec
            .components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();
        for (component, resource) in &desired {
            match executor.apply(&app, resource.clone()).await {
                Ok(Operation::Unchanged) => {}
                Ok(_) => changed_resources += 1,
                Err(err @ Error::OwnerRefError { .. }) => {
                    first_error = Some(err);
                    break;
                }
                Err(err) => {
                    if let Some(&index) = index_of.get(component.as_str()) {
                        components[index].message = Some(err.to_string());
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
    }

    // 10. Health phase: every component, aggregated.
    let mut all_healthy = false;
    if first_error.is_none() {
        all_healthy = true;
        for (index, component) in app.spec.components.iter().enumerate() {
            let reference = components[index].clone();
            let (Some(api_version), Some(kind), Some(resource_name)) = (
                reference.api_version.as_deref(),
                reference.kind.as_deref(),
                reference.resource_name.as_deref(),
            ) else {
                all_healthy = false;
                continue;
            };
            match health::check_resource(&client, &namespace, resource_name, api_version, kind)
                .await
            {
                Ok(health) => {
                    components[index].healthy = health.healthy;
                    components[index].message = Some(health.message);
                    if !components[index].healthy {
                        all_healthy = false;
                    }
                }
                Err(err) => {
                    components[index].healthy = false;
                    components[index].message = Some(format!("health check failed: {err}"));
                    all_healthy = false;
                    if first_error.is_none() {
                        first_error = Some(Error::HealthError {
                            component: component.name.clone(),
                            message: err.to_string(),
                        });
                    }
                }
            }
        }
    } else if let Some(err) = &first_error {
        let derived = format!("reconcile error: {err}");
        for reference in components.iter_mut() {
            reference.healthy = false;
            if reference.message.as_deref() == Some("Initializing") {
                reference.message = Some(derived.clone());
            }
        }
    }

    // 11. Final phase.
    let phase = compute_phase(
        suspended,
        resuming,
        first_error.as_ref(),
        all_healthy,
        original.phase,
    );

    // 12. Change-id gating: recorded only on the terminal successful path.
    let last_change_id = next_change_id(
        original.last_change_id.as_deref(),
        app.change_id(),
        all_healthy && first_error.is_none(),
    );
    let change_recorded = last_change_id != original.last_change_id;

    // 13. Status diff and write.
    let healthy_count = components.iter().filter(|c| c.healthy).count();
    let total = components.len();
    let mut status = ApplicationDefinitionStatus {
        observed_generation: if first_error.is_none() {
            app.metadata.generation
        } else {
            original.observed_generation
        },
        phase,
        conditions: original.conditions.clone(),
        components,
        suspended_replicas,
        last_change_id,
        annotations: {
            let mut annotations = original.annotations.clone();
            annotations.extend(new_hashes);
            annotations
        },
    };
    upsert_condition(
        &mut status.conditions,
        ready_condition(phase, first_error.as_ref(), healthy_count, total),
    );

    let status_changed = !statuses_equal(&original, &status);
    let mut status_conflict = false;
    if status_changed {
        match patch_status_with_retry(&api, &name, &status).await {
            Ok(()) => {}
            Err(err) if err.is_conflict() => {
                warn!("Status write conflict for {namespace}/{name}, requeueing");
                status_conflict = true;
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(Error::StatusError(err.to_string()));
                }
            }
        }
    }

    // 14. Events, then the requeue decision.
    let phase_changed = phase != original.phase;
    if let Some(err) = &first_error {
        if !err.is_conflict() {
            sink.record(
                ChangeEvent::warning(err.phase_reason(), err.to_string())
                    .with_phase(phase)
                    .with_status(EventStatus::Failure)
                    .with_step("reconcile"),
            )
            .await;
        }
    } else if phase_changed || (phase == Phase::Running && change_recorded) {
        sink.record(transition_event(
            &name,
            phase,
            resuming,
            replicas_parked,
            replicas_restored,
            healthy_count,
            total,
        ))
        .await;
    } else if changed_resources > 0 {
        sink.record(
            ChangeEvent::normal(
                "ResourcesApplied",
                format!("applied {changed_resources} changed resources"),
            )
            .with_phase(phase)
            .with_status(EventStatus::InProgress)
            .with_step("apply"),
        )
        .await;
    }

    if status_conflict || first_error.as_ref().map_or(false, |e| e.is_conflict()) {
        return Ok(Action::requeue(ctx.settings.conflict_requeue_interval()));
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    if phase == Phase::Running && !status_changed && changed_resources == 0 {
        // Steady state: owned-resource watches wake us when it matters.
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ctx.settings.requeue_interval()))
}

/// Error policy determines how to handle reconciliation errors
pub fn error_policy(
    app: Arc<ApplicationDefinition>,
    error: &Error,
    _ctx: Arc<ControllerState>,
) -> Action {
    error!("Reconciliation error for {}: {:?}", app.name_any(), error);

    // Use shorter retry for retriable errors
    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };

    Action::requeue(retry_duration)
}

// ============================================================================
// Pipeline helpers
// ============================================================================

/// Park every workload at zero replicas, recording the pre-suspend count
/// exactly once per component. Returns the total replicas parked.
fn suspend_workloads(
    desired: &mut [(String, DesiredResource)],
    suspended_replicas: &mut BTreeMap<String, i32>,
) -> i32 {
    let mut parked = 0;
    for (component, resource) in desired.iter_mut() {
        if !resource.is_workload() {
            continue;
        }
        let current = resource.replicas().unwrap_or(1);
        suspended_replicas
            .entry(component.clone())
            .or_insert(current);
        parked += suspended_replicas.get(component).copied().unwrap_or(current);
        resource.set_replicas(0);
    }
    parked
}

/// Restore recorded replica counts and clear the bookkeeping entries.
/// Returns the total replicas restored.
fn resume_workloads(
    desired: &mut [(String, DesiredResource)],
    suspended_replicas: &mut BTreeMap<String, i32>,
) -> i32 {
    let mut restored = 0;
    for (component, resource) in desired.iter_mut() {
        if !resource.is_workload() {
            continue;
        }
        if let Some(replicas) = suspended_replicas.remove(component) {
            resource.set_replicas(replicas);
            restored += replicas;
        }
    }
    restored
}

/// Final phase per the precedence rules: suspension wins, then the first
/// recorded error (conflicts and failed health probes stay non-terminal),
/// then aggregate health.
fn compute_phase(
    suspended: bool,
    resuming: bool,
    error: Option<&Error>,
    all_healthy: bool,
    previous: Phase,
) -> Phase {
    if suspended {
        return Phase::Suspended;
    }
    if let Some(err) = error {
        if err.is_conflict() {
            return Phase::Updating;
        }
        if matches!(err, Error::HealthError { .. }) {
            return if previous.was_ready() {
                Phase::Degraded
            } else {
                Phase::Updating
            };
        }
        return Phase::Failed;
    }
    if all_healthy {
        return Phase::Running;
    }
    if resuming {
        return Phase::Updating;
    }
    if previous.was_ready() {
        Phase::Degraded
    } else {
        Phase::Updating
    }
}

/// Record the incoming change-id once the application is fully ready.
fn next_change_id(
    original: Option<&str>,
    annotation: Option<&str>,
    all_ready: bool,
) -> Option<String> {
    match (annotation, all_ready) {
        (Some(change_id), true) if original != Some(change_id) => Some(change_id.to_string()),
        _ => original.map(str::to_string),
    }
}

fn ready_condition(
    phase: Phase,
    error: Option<&Error>,
    healthy: usize,
    total: usize,
) -> Condition {
    match phase {
        Phase::Running => Condition::ready(
            true,
            "AllComponentsReady",
            &format!("{healthy}/{total} components ready"),
        ),
        Phase::Suspended => Condition::ready(false, "Suspended", "application is suspended"),
        Phase::Degraded => Condition::ready(
            false,
            "ComponentUnhealthy",
            &format!("{healthy}/{total} components ready"),
        ),
        Phase::Failed => {
            let reason = error.map(Error::phase_reason).unwrap_or("ReconcileFailed");
            let message = error
                .map(ToString::to_string)
                .unwrap_or_else(|| "reconcile failed".to_string());
            Condition::ready(false, reason, &message)
        }
        _ => Condition::ready(
            false,
            "Progressing",
            &format!("{healthy}/{total} components ready"),
        ),
    }
}

fn transition_event(
    name: &str,
    phase: Phase,
    resuming: bool,
    replicas_parked: i32,
    replicas_restored: i32,
    healthy: usize,
    total: usize,
) -> ChangeEvent {
    match phase {
        Phase::Running => ChangeEvent::normal(
            "ReconcileCompleted",
            format!("application {name} is running ({healthy}/{total} components ready)"),
        )
        .with_phase(phase)
        .with_status(EventStatus::Success)
        .with_step("finalize"),
        Phase::Suspended => ChangeEvent::normal(
            "Suspended",
            format!("application {name} suspended; workloads scaled to zero"),
        )
        .with_phase(phase)
        .with_status(EventStatus::Success)
        .with_step("suspend")
        .with_resource_change(ResourceChange {
            before_replicas: Some(replicas_parked),
            after_replicas: Some(0),
            ..Default::default()
        }),
        Phase::Degraded => ChangeEvent::warning(
            "Degraded",
            format!("application {name} degraded ({healthy}/{total} components ready)"),
        )
        .with_phase(phase)
        .with_status(EventStatus::Failure)
        .with_step("health"),
        _ if resuming => ChangeEvent::normal(
            "Resumed",
            format!("application {name} resumed; restoring workload replicas"),
        )
        .with_phase(phase)
        .with_status(EventStatus::InProgress)
        .with_step("resume")
        .with_resource_change(ResourceChange {
            before_replicas: Some(0),
            after_replicas: Some(replicas_restored),
            ..Default::default()
        }),
        _ => ChangeEvent::normal(
            "Updating",
            format!("application {name} is updating ({healthy}/{total} components ready)"),
        )
        .with_phase(phase)
        .with_status(EventStatus::InProgress)
        .with_step("reconcile"),
    }
}

/// Status equality modulo condition transition timestamps; an equal
/// status elides the write entirely.
fn statuses_equal(a: &ApplicationDefinitionStatus, b: &ApplicationDefinitionStatus) -> bool {
    a.phase == b.phase
        && a.observed_generation == b.observed_generation
        && a.components == b.components
        && a.last_change_id == b.last_change_id
        && a.suspended_replicas == b.suspended_replicas
        && a.annotations == b.annotations
        && a.conditions.len() == b.conditions.len()
        && a
            .conditions
            .iter()
            .zip(&b.conditions)
            .all(|(x, y)| x.same_apart_from_time(y))
}

/// Add or remove the finalizer with optimistic-concurrency retries.
async fn update_finalizers(
    api: &Api<ApplicationDefinition>,
    name: &str,
    add: bool,
) -> Result<()> {
    for attempt in 1..=3 {
        let Some(mut current) = api
            .get_opt(name)
            .await
            .map_err(|e| Error::FinalizerError(e.to_string()))?
        else {
            return Ok(());
        };
        let finalizers = current.metadata.finalizers.get_or_insert_with(Vec::new);
        let present = finalizers.iter().any(|f| f == FINALIZER);
        if present == add {
            return Ok(());
        }
        if add {
            finalizers.push(FINALIZER.to_string());
        } else {
            finalizers.retain(|f| f != FINALIZER);
        }
        match api.replace(name, &PostParams::default(), &current).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 && attempt < 3 => continue,
            Err(e) => return Err(Error::FinalizerError(e.to_string())),
        }
    }
    Err(Error::FinalizerError(
        "finalizer update conflicted 3 times".to_string(),
    ))
}

/// Write the status subresource, retrying transient failures.
async fn patch_status_with_retry(
    api: &Api<ApplicationDefinition>,
    name: &str,
    status: &ApplicationDefinitionStatus,
) -> Result<()> {
    let patch = serde_json::json!({ "status": status });
    let mut attempt = 0;
    loop {
        attempt += 1;
        match api
            .patch_status(
                name,
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(e)) if (e.code == 409 || e.code >= 500) && attempt < 3 => {
                continue
            }
            Err(e) => return Err(Error::KubeError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
    use k8s_openapi::api::core::v1::Service;

    fn conflict() -> Error {
        Error::ApplyError {
            kind: "StatefulSet".into(),
            namespace: "prod".into(),
            name: "web".into(),
            message: "the object has been modified".into(),
            conflict: true,
        }
    }

    fn build_failure() -> Error {
        Error::BuildError {
            component: "web".into(),
            message: "image is required".into(),
        }
    }

    #[test]
    fn suspension_overrides_everything() {
        assert_eq!(
            compute_phase(true, false, Some(&build_failure()), false, Phase::Running),
            Phase::Suspended
        );
    }

    #[test]
    fn build_errors_fail_the_pass() {
        assert_eq!(
            compute_phase(false, false, Some(&build_failure()), false, Phase::Creating),
            Phase::Failed
        );
    }

    #[test]
    fn conflicts_never_reach_failed() {
        assert_eq!(
            compute_phase(false, false, Some(&conflict()), false, Phase::Running),
            Phase::Updating
        );
    }

    #[test]
    fn health_process_errors_degrade_instead_of_failing() {
        let err = Error::HealthError {
            component: "web".into(),
            message: "timeout".into(),
        };
        assert_eq!(
            compute_phase(false, false, Some(&err), false, Phase::Running),
            Phase::Degraded
        );
        assert_eq!(
            compute_phase(false, false, Some(&err), false, Phase::Creating),
            Phase::Updating
        );
    }

    #[test]
    fn all_healthy_runs() {
        assert_eq!(
            compute_phase(false, false, None, true, Phase::Updating),
            Phase::Running
        );
    }

    #[test]
    fn unhealthy_after_ready_degrades() {
        assert_eq!(
            compute_phase(false, false, None, false, Phase::Running),
            Phase::Degraded
        );
        assert_eq!(
            compute_phase(false, false, None, false, Phase::Degraded),
            Phase::Degraded
        );
        assert_eq!(
            compute_phase(false, false, None, false, Phase::Creating),
            Phase::Updating
        );
    }

    #[test]
    fn resuming_updates_until_healthy() {
        assert_eq!(
            compute_phase(false, true, None, false, Phase::Suspended),
            Phase::Updating
        );
        assert_eq!(
            compute_phase(false, true, None, true, Phase::Suspended),
            Phase::Running
        );
    }

    fn workload(replicas: i32) -> DesiredResource {
        DesiredResource::StatefulSet(StatefulSet {
            spec: Some(StatefulSetSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn suspend_records_once_and_zeroes() {
        let mut desired = vec![
            ("web".to_string(), workload(3)),
            (
                "web".to_string(),
                DesiredResource::Service(Service::default()),
            ),
        ];
        let mut recorded = BTreeMap::new();
        let parked = suspend_workloads(&mut desired, &mut recorded);
        assert_eq!(parked, 3);
        assert_eq!(recorded.get("web"), Some(&3));
        assert_eq!(desired[0].1.replicas(), Some(0));

        // A second suspended pass must not overwrite the recorded count
        // with the now-zero desired replicas.
        let mut desired = vec![("web".to_string(), workload(3))];
        suspend_workloads(&mut desired, &mut recorded);
        assert_eq!(recorded.get("web"), Some(&3));
    }

    #[test]
    fn resume_restores_and_clears() {
        let mut desired = vec![("web".to_string(), workload(3))];
        let mut recorded = BTreeMap::from([("web".to_string(), 5)]);
        let restored = resume_workloads(&mut desired, &mut recorded);
        assert_eq!(restored, 5);
        assert_eq!(desired[0].1.replicas(), Some(5));
        assert!(recorded.is_empty());
    }

    #[test]
    fn change_id_recorded_only_when_ready() {
        assert_eq!(
            next_change_id(None, Some("chg-1"), true),
            Some("chg-1".to_string())
        );
        assert_eq!(next_change_id(None, Some("chg-1"), false), None);
        assert_eq!(
            next_change_id(Some("chg-1"), Some("chg-1"), true),
            Some("chg-1".to_string())
        );
        assert_eq!(
            next_change_id(Some("chg-1"), Some("chg-2"), true),
            Some("chg-2".to_string())
        );
        assert_eq!(
            next_change_id(Some("chg-1"), None, true),
            Some("chg-1".to_string())
        );
    }

    fn status_with(phase: Phase) -> ApplicationDefinitionStatus {
        ApplicationDefinitionStatus {
            phase,
            observed_generation: Some(2),
            conditions: vec![Condition::ready(phase == Phase::Running, "r", "m")],
            components: vec![ComponentStatusReference {
                name: "web".into(),
                healthy: phase == Phase::Running,
                message: Some("ok".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn statuses_equal_ignores_condition_timestamps() {
        let a = status_with(Phase::Running);
        let mut b = a.clone();
        b.conditions[0].last_transition_time = "2001-01-01T00:00:00Z".to_string();
        assert!(statuses_equal(&a, &b));
    }

    #[test]
    fn statuses_differ_on_phase_or_components() {
        let a = status_with(Phase::Running);
        assert!(!statuses_equal(&a, &status_with(Phase::Degraded)));

        let mut c = a.clone();
        c.components[0].message = Some("different".into());
        assert!(!statuses_equal(&a, &c));
    }

    #[test]
    fn statuses_differ_on_config_hash_cache() {
        let a = status_with(Phase::Running);
        let mut b = a.clone();
        b.annotations
            .insert("web-config".to_string(), "abc123".to_string());
        assert!(!statuses_equal(&a, &b));
    }

    #[test]
    fn ready_condition_mirrors_phase() {
        let running = ready_condition(Phase::Running, None, 2, 2);
        assert_eq!(running.status, "True");
        assert_eq!(running.reason, "AllComponentsReady");

        let failed = ready_condition(Phase::Failed, Some(&build_failure()), 0, 2);
        assert_eq!(failed.status, "False");
        assert_eq!(failed.reason, "ProcessingFailed");

        let suspended = ready_condition(Phase::Suspended, None, 0, 2);
        assert_eq!(suspended.reason, "Suspended");
    }

    #[test]
    fn completion_event_is_a_success_with_the_running_phase() {
        let event = transition_event("demo", Phase::Running, false, 0, 0, 2, 2);
        assert_eq!(event.reason, "ReconcileCompleted");
        assert_eq!(event.status_annotation(), "success");
        assert_eq!(event.phase_annotation(), "Running");
    }

    #[test]
    fn suspend_event_carries_the_replica_change() {
        let event = transition_event("demo", Phase::Suspended, false, 3, 0, 2, 2);
        let change = event.resource_change.as_ref().unwrap();
        assert_eq!(change.before_replicas, Some(3));
        assert_eq!(change.after_replicas, Some(0));
    }
}
