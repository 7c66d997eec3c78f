//! Fire-and-forget client events posted to the observability endpoint. Never allowed to block or
//! fail a caller: a send failure is logged and dropped.

use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct ClientEvent {
    pub request_id: Option<String>,
    pub client_id: String,
    pub kind: String,
    pub name: String,
    pub fields: serde_json::Value,
    pub t_client_ms: i64,
}

/// Posts [`ClientEvent`]s to the server's event ingestion endpoint on a best-effort basis.
#[derive(Clone)]
pub struct EventSink {
    http: reqwest::Client,
    base_url: Arc<url::Url>,
    client_id: String,
}

impl EventSink {
    pub fn new(http: reqwest::Client, base_url: url::Url, client_id: String) -> Self {
        Self {
            http,
            base_url: Arc::new(base_url),
            client_id,
        }
    }

    pub fn emit(&self, request_id: Option<&str>, name: &str, fields: serde_json::Value) {
        let event = ClientEvent {
            request_id: request_id.map(str::to_string),
            client_id: self.client_id.clone(),
            kind: "client_event".to_string(),
            name: name.to_string(),
            fields,
            t_client_ms: now_ms(),
        };

        let Ok(url) = self.base_url.join("/api/events") else {
            tracing::warn!(name, "could not construct events url");
            return;
        };
        let http = self.http.clone();
        tokio::spawn(async move {
            if let Err(err) = http.post(url).json(&event).send().await {
                tracing::debug!(?err, event = event.name, "failed to post client event");
            }
        });
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
