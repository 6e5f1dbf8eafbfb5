//! Webhook delivery of lifecycle events.
//!
//! Each event is POSTed as JSON from its own task so request handlers never
//! wait on the receiver. Delivery failures are logged and dropped.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use vmctl_provision::{EventSink, LifecycleEvent};

/// Per-request deadline for webhook delivery.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// JSON body sent to the webhook endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookPayload {
    pub object: &'static str,
    pub node_id: String,
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Map<String, Value>,
    pub message: String,
    /// RFC 3339
    pub timestamp: String,
}

impl WebhookPayload {
    pub fn new(node_id: &str, event: LifecycleEvent) -> Self {
        Self {
            object: "event",
            node_id: node_id.to_string(),
            event_type: event.event_type(),
            id: event.id,
            data: event.data,
            message: event.message,
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }
}

/// Posts lifecycle events to a configured URL.
pub struct WebhookNotifier {
    url: String,
    node_id: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, node_id: impl Into<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;

        Ok(Self {
            url: url.into(),
            node_id: node_id.into(),
            http_client,
        })
    }

    async fn send(client: reqwest::Client, url: String, payload: WebhookPayload) {
        let result = client.post(&url).json(&payload).send().await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, event = %payload.event_type, "Webhook delivered");
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    url = %url,
                    event = %payload.event_type,
                    status = %status,
                    body = %body,
                    "Webhook returned non-success status"
                );
            }
            Err(e) => {
                warn!(url = %url, event = %payload.event_type, error = %e, "Webhook delivery failed");
            }
        }
    }
}

impl EventSink for WebhookNotifier {
    fn notify(&self, event: LifecycleEvent) {
        let payload = WebhookPayload::new(&self.node_id, event);
        let client = self.http_client.clone();
        let url = self.url.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::send(client, url, payload));
            }
            Err(_) => {
                warn!(event = %payload.event_type, "No async runtime, dropping webhook");
            }
        }
    }
}

/// Logs events when no webhook is configured.
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn notify(&self, event: LifecycleEvent) {
        info!(
            id = %event.id,
            event = %event.event_type(),
            message = %event.message,
            "Lifecycle event"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmctl_provision::EventKind;

    #[test]
    fn test_payload_shape() {
        let event = LifecycleEvent::failed("vm-1", EventKind::Created, "define domain failed")
            .with_data("step", "define domain");
        let payload = WebhookPayload::new("node-a", event);

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["object"], "event");
        assert_eq!(json["node_id"], "node-a");
        assert_eq!(json["id"], "vm-1");
        assert_eq!(json["type"], "vm.created.failed");
        assert_eq!(json["data"]["step"], "define domain");
        assert_eq!(json["message"], "define domain failed");

        let timestamp = json["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    /// Serve `POST /hook` on an ephemeral port, forwarding each body.
    async fn spawn_receiver() -> (String, tokio::sync::mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let app = axum::Router::new().route(
            "/hook",
            axum::routing::post(move |axum::Json(body): axum::Json<Value>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(body);
                    axum::http::StatusCode::NO_CONTENT
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/hook", addr), rx)
    }

    #[tokio::test]
    async fn test_notify_delivers_payload() {
        let (url, mut received) = spawn_receiver().await;
        let notifier = WebhookNotifier::new(url, "node-a").unwrap();

        notifier.notify(LifecycleEvent::succeeded("vm-1", EventKind::Started, "VM started"));

        let body = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body["object"], "event");
        assert_eq!(body["node_id"], "node-a");
        assert_eq!(body["id"], "vm-1");
        assert_eq!(body["type"], "vm.started");
        assert_eq!(body["message"], "VM started");
    }

    #[tokio::test]
    async fn test_notify_does_not_wait_on_stalled_receiver() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                let _ = accepted_tx.send(());
                held.push(socket);
            }
        });

        let notifier = WebhookNotifier::new(format!("http://{}/hook", addr), "node-a").unwrap();
        let started = std::time::Instant::now();
        notifier.notify(LifecycleEvent::failed("vm-1", EventKind::Stopped, "stop failed"));
        assert!(started.elapsed() < Duration::from_millis(500));

        // Delivery is still attempted in the background.
        tokio::time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_notify_without_runtime_drops_event() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", "node-a").unwrap();
        notifier.notify(LifecycleEvent::succeeded("vm-1", EventKind::Started, "VM started"));
    }
}
