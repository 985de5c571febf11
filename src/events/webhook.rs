//! Structured webhook delivery
//!
//! Posts change events as JSON to the URL named by the declaration's
//! annotations. Delivery is asynchronous with bounded retries and an
//! exponential backoff; clearly non-transient network failures skip the
//! remaining attempts.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::ChangeEvent;

/// Per-attempt request timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total delivery attempts per event.
const MAX_ATTEMPTS: u32 = 3;

/// Error fragments that mark an endpoint as unreachable rather than
/// transiently busy; these skip the remaining retries. Matched against
/// the lowercased error chain (the OS reports "Connection refused").
const FATAL_NETWORK_ERRORS: [&str; 4] = [
    "connection refused",
    "eof",
    "no such host",
    "network is unreachable",
];

/// Wire format of one webhook event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct WebhookPayload {
    pub change_id: String,
    pub cluster_id: String,
    pub phase: String,
    /// "Normal" or "Warning"
    pub level: String,
    pub message: String,
    /// RFC3339 with nanoseconds, UTC
    pub timestamp: String,
    /// Free-form details; always carries at least "reason".
    pub payload: BTreeMap<String, String>,
    /// "success", "failure" or "in_progress"
    pub status: String,
    pub step: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_change: Option<ResourceChange>,
}

/// Before/after resource footprint attached to scaling events.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourceChange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_cpu: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_memory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_disk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_disk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before_replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_replicas: Option<i32>,
}

/// Posts events for one declaration and change-id.
#[derive(Clone)]
pub struct WebhookSender {
    url: String,
    change_id: String,
    cluster_id: String,
    client: reqwest::Client,
    /// The pass started with status.lastChangeID already equal to the
    /// declaration's change-id: terminal success events were delivered.
    deduped: bool,
}

impl WebhookSender {
    pub fn new(
        url: impl Into<String>,
        change_id: impl Into<String>,
        cluster_id: impl Into<String>,
        deduped: bool,
    ) -> Self {
        Self {
            url: url.into(),
            change_id: change_id.into(),
            cluster_id: cluster_id.into(),
            client: reqwest::Client::new(),
            deduped,
        }
    }

    /// Suppress only repeat terminal-success events for an already
    /// recorded change-id; events with any other status still flow.
    pub fn should_send(&self, event: &ChangeEvent) -> bool {
        !(self.deduped && event.status_annotation() == super::EventStatus::Success.as_str())
    }

    /// Shape an event into the wire payload.
    pub fn payload(&self, event: &ChangeEvent) -> WebhookPayload {
        let mut payload = BTreeMap::new();
        payload.insert("reason".to_string(), event.reason.clone());

        WebhookPayload {
            change_id: self.change_id.clone(),
            cluster_id: self.cluster_id.clone(),
            phase: event.phase_annotation().to_string(),
            level: if event.warning { "Warning" } else { "Normal" }.to_string(),
            message: event.message.clone(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true),
            payload,
            status: event.status_annotation().to_string(),
            step: event.step_annotation().to_string(),
            resource_change: event.resource_change.clone(),
        }
    }

    /// Deliver one payload, retrying with exponential backoff. Errors are
    /// logged and swallowed; the reconcile result never depends on them.
    pub async fn post(self, payload: WebhookPayload) {
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .client
                .post(&self.url)
                .timeout(ATTEMPT_TIMEOUT)
                .json(&payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %self.url, change_id = %self.change_id, "webhook delivered");
                    return;
                }
                Ok(response) => {
                    warn!(
                        url = %self.url,
                        status = %response.status(),
                        attempt,
                        "webhook endpoint rejected the event"
                    );
                }
                Err(e) => {
                    let message = error_chain(&e);
                    if is_fatal_network_error(&message) {
                        warn!(url = %self.url, attempt, "webhook endpoint unreachable, giving up: {message}");
                        return;
                    }
                    warn!(url = %self.url, attempt, "webhook delivery failed: {message}");
                }
            }
            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff(attempt)).await;
            }
        }
        error!(
            url = %self.url,
            change_id = %self.change_id,
            "webhook delivery failed after {MAX_ATTEMPTS} attempts"
        );
    }
}

/// Backoff before the attempt following `attempt`: 10s * 2^(attempt-1).
fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(10 * 2u64.pow(attempt - 1))
}

/// Whether an error message marks the endpoint as plainly unreachable.
pub fn is_fatal_network_error(message: &str) -> bool {
    let message = message.to_lowercase();
    FATAL_NETWORK_ERRORS
        .iter()
        .any(|fragment| message.contains(fragment))
}

/// Flatten an error and its sources into one searchable string.
fn error_chain(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::Phase;
    use crate::events::EventStatus;

    fn sender(deduped: bool) -> WebhookSender {
        WebhookSender::new("http://hook.local/events", "chg-1", "cluster-a", deduped)
    }

    fn success_event() -> ChangeEvent {
        ChangeEvent::normal("ReconcileCompleted", "all components ready")
            .with_phase(Phase::Running)
            .with_status(EventStatus::Success)
            .with_step("health")
    }

    #[test]
    fn payload_uses_the_fixed_field_names() {
        let payload = sender(false).payload(&success_event());
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["change_id"], "chg-1");
        assert_eq!(json["cluster_id"], "cluster-a");
        assert_eq!(json["phase"], "Running");
        assert_eq!(json["level"], "Normal");
        assert_eq!(json["status"], "success");
        assert_eq!(json["step"], "health");
        assert_eq!(json["payload"]["reason"], "ReconcileCompleted");
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(json.get("resource_change").is_none());
    }

    #[test]
    fn warnings_map_to_the_warning_level() {
        let event = ChangeEvent::warning("ApplyFailed", "apply rejected")
            .with_status(EventStatus::Failure);
        let payload = sender(false).payload(&event);
        assert_eq!(payload.level, "Warning");
        assert_eq!(payload.status, "failure");
    }

    #[test]
    fn dedup_suppresses_only_repeat_success() {
        let deduped = sender(true);
        assert!(!deduped.should_send(&success_event()));

        let failure = ChangeEvent::warning("ApplyFailed", "boom").with_status(EventStatus::Failure);
        assert!(deduped.should_send(&failure));

        let progress =
            ChangeEvent::normal("Reconciling", "working").with_status(EventStatus::InProgress);
        assert!(deduped.should_send(&progress));

        assert!(sender(false).should_send(&success_event()));
    }

    #[test]
    fn backoff_doubles_from_ten_seconds() {
        assert_eq!(backoff(1), Duration::from_secs(10));
        assert_eq!(backoff(2), Duration::from_secs(20));
    }

    #[test]
    fn fatal_network_errors_short_circuit() {
        assert!(is_fatal_network_error(
            "error sending request: Connection refused (os error 111)"
        ));
        assert!(is_fatal_network_error("unexpected EOF during handshake"));
        assert!(is_fatal_network_error("dns error: no such host"));
        assert!(is_fatal_network_error("Network is unreachable"));
        assert!(!is_fatal_network_error("operation timed out"));
    }

    #[test]
    fn delivers_the_payload_to_a_listening_endpoint() {
        tokio_test::block_on(async {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = tokio::spawn(async move {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut received = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = socket.read(&mut buf).await.unwrap();
                    received.extend_from_slice(&buf[..n]);
                    if n == 0 || String::from_utf8_lossy(&received).contains("\"step\"") {
                        break;
                    }
                }
                socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await
                    .unwrap();
                socket.flush().await.unwrap();
                String::from_utf8_lossy(&received).to_string()
            });

            let sender = WebhookSender::new(
                format!("http://127.0.0.1:{port}/events"),
                "chg-1",
                "cluster-a",
                false,
            );
            let payload = sender.payload(&success_event());
            sender.post(payload).await;

            let request = server.await.unwrap();
            assert!(request.starts_with("POST /events"), "{request}");
            assert!(request.contains("application/json"), "{request}");
            assert!(request.contains("\"change_id\":\"chg-1\""), "{request}");
        });
    }

    #[test]
    fn unreachable_endpoint_fails_fast_without_backoff() {
        tokio_test::block_on(async {
            // Bind then drop so the port is known-closed; the connection
            // is refused immediately.
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let sender = WebhookSender::new(
                format!("http://127.0.0.1:{port}/events"),
                "chg-1",
                "cluster-a",
                false,
            );
            let payload = sender.payload(&success_event());
            let finished =
                tokio::time::timeout(Duration::from_secs(5), sender.post(payload)).await;
            assert!(
                finished.is_ok(),
                "a refused connection must skip the retry backoff"
            );
        });
    }

    #[test]
    fn resource_change_round_trips() {
        let change = ResourceChange {
            before_replicas: Some(3),
            after_replicas: Some(0),
            before_memory: Some("4Gi".into()),
            after_memory: Some("4Gi".into()),
            ..Default::default()
        };
        let event = success_event().with_resource_change(change.clone());
        let payload = sender(false).payload(&event);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["resource_change"]["before_replicas"], 3);
        assert_eq!(json["resource_change"]["after_replicas"], 0);
        let back: WebhookPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.resource_change, Some(change));
    }
}
