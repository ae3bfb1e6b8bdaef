//! Outbound transport used to deliver stored batches.

use crate::{HandlerError, HandlerResult};
use async_trait::async_trait;
use offline_core::{Payload, TelemetryEvent};
use reqwest::Client;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Content type of newline-delimited JSON batches.
pub const JSON_STREAM_CONTENT_TYPE: &str = "application/x-json-stream";

/// One POST to the collector.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Payload,
}

impl SendRequest {
    /// Request carrying a stored batch to `endpoint`.
    pub fn for_event(endpoint: &str, event: &TelemetryEvent) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), JSON_STREAM_CONTENT_TYPE.to_string());
        if !event.ikey.is_empty() {
            headers.insert("apikey".to_string(), event.ikey.clone());
        }
        Self {
            url: endpoint.to_string(),
            headers,
            body: event.data.clone(),
        }
    }
}

/// What came back from the collector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl TransportResponse {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Sender capability.
///
/// `sync` asks the transport to finish before the host shuts down; an
/// async implementation satisfies it by completing the returned future.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_post(&self, request: SendRequest, sync: bool) -> HandlerResult<TransportResponse>;

    /// Whether the sender has capacity for another request right now.
    fn is_idle(&self) -> bool {
        true
    }
}

/// HTTP configuration.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Concurrent requests before the transport reports busy.
    pub max_in_flight: usize,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_in_flight: 1,
        }
    }
}

/// reqwest-backed [`Transport`].
pub struct HttpTransport {
    config: HttpTransportConfig,
    client: Client,
    in_flight: Arc<AtomicUsize>,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> HandlerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            config,
            client,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_post(&self, request: SendRequest, sync: bool) -> HandlerResult<TransportResponse> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlight(self.in_flight.clone());

        debug!(url = %request.url, bytes = request.body.len(), sync, "Posting stored batch");

        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let builder = match request.body {
            Payload::Text(text) => builder.body(text),
            Payload::Binary(bytes) => builder.body(bytes),
        };

        let response = builder.send().await.map_err(|e| {
            warn!(url = %request.url, error = %e, "Collector request failed");
            HandlerError::from(e)
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await.unwrap_or_default();

        Ok(TransportResponse { status, headers, body })
    }

    fn is_idle(&self) -> bool {
        self.in_flight() < self.config.max_in_flight
    }
}
