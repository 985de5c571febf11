//! Dual-sink event recording
//!
//! Every observable reconcile step emits one event. Local Kubernetes
//! events always flow; when the declaration carries a change-id and a
//! webhook URL, a webhook tee posts the structured payload as well.

mod webhook;

pub use webhook::{is_fatal_network_error, ResourceChange, WebhookPayload, WebhookSender};

use std::collections::BTreeMap;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::{
    ApplicationDefinition, Phase, ANNOTATION_EVENT_PHASE, ANNOTATION_EVENT_STATUS,
    ANNOTATION_EVENT_STEP,
};

/// Delivery status carried on a change event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventStatus {
    Success,
    Failure,
    InProgress,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failure => "failure",
            EventStatus::InProgress => "in_progress",
        }
    }
}

/// One observable reconcile step. The phase/status/step facts travel in
/// the annotation map; the webhook sink copies them into its payload.
#[derive(Clone, Debug)]
pub struct ChangeEvent {
    pub reason: String,
    pub message: String,
    pub warning: bool,
    pub annotations: BTreeMap<String, String>,
    pub resource_change: Option<ResourceChange>,
}

impl ChangeEvent {
    pub fn normal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
            warning: false,
            annotations: BTreeMap::new(),
            resource_change: None,
        }
    }

    pub fn warning(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            warning: true,
            ..Self::normal(reason, message)
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.annotations
            .insert(ANNOTATION_EVENT_PHASE.to_string(), phase.to_string());
        self
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.annotations
            .insert(ANNOTATION_EVENT_STATUS.to_string(), status.as_str().to_string());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.annotations
            .insert(ANNOTATION_EVENT_STEP.to_string(), step.into());
        self
    }

    pub fn with_resource_change(mut self, change: ResourceChange) -> Self {
        self.resource_change = Some(change);
        self
    }

    pub fn phase_annotation(&self) -> &str {
        self.annotations
            .get(ANNOTATION_EVENT_PHASE)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn status_annotation(&self) -> &str {
        self.annotations
            .get(ANNOTATION_EVENT_STATUS)
            .map(String::as_str)
            .unwrap_or(EventStatus::InProgress.as_str())
    }

    pub fn step_annotation(&self) -> &str {
        self.annotations
            .get(ANNOTATION_EVENT_STEP)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Recorder selected per declaration: always the local Kubernetes event
/// sink, plus the webhook tee when the declaration asks for one.
pub struct EventSink {
    recorder: Recorder,
    webhook: Option<WebhookSender>,
}

impl EventSink {
    /// Build the sink for one reconcile pass. `last_change_id` is the
    /// value recorded in status when the pass started; de-duplication
    /// compares against that snapshot.
    pub fn for_app(
        client: &Client,
        reporter: &Reporter,
        app: &ApplicationDefinition,
        last_change_id: Option<&str>,
    ) -> Self {
        let recorder = Recorder::new(client.clone(), reporter.clone(), app.object_ref(&()));
        let webhook = match (app.change_id(), app.webhook_url()) {
            (Some(change_id), Some(url)) => Some(WebhookSender::new(
                url,
                change_id,
                app.cluster_id().unwrap_or_default(),
                last_change_id == Some(change_id),
            )),
            _ => None,
        };
        Self { recorder, webhook }
    }

    /// Emit one event to every configured sink. Webhook delivery is
    /// fire-and-forget; failures are logged, never surfaced.
    pub async fn record(&self, event: ChangeEvent) {
        let local = Event {
            type_: if event.warning {
                EventType::Warning
            } else {
                EventType::Normal
            },
            reason: event.reason.clone(),
            note: Some(event.message.clone()),
            action: if event.step_annotation().is_empty() {
                "Reconcile".to_string()
            } else {
                event.step_annotation().to_string()
            },
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(local).await {
            warn!(reason = %event.reason, "failed to publish local event: {e}");
        }

        if let Some(sender) = &self.webhook {
            if sender.should_send(&event) {
                let payload = sender.payload(&event);
                let sender = sender.clone();
                tokio::spawn(async move { sender.post(payload).await });
            }
        }
    }
}
