//! Health probe
//!
//! Cheap out-of-band reachability check performed before the WebSocket
//! handshake. Only an explicit negative answer stops the handshake; any
//! failure to get an answer is ambiguous.

use crate::feed::state::ProbeOutcome;
use crate::FeedError;
use reqwest::StatusCode;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Reachability check run before opening the transport
pub trait HealthProbe: Send + Sync + 'static {
    /// Probe the server, giving up after `timeout`
    fn probe(&self, timeout: Duration) -> impl Future<Output = ProbeOutcome> + Send;
}

/// Probe over HTTP GET against a liveness endpoint
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: Option<String>,
}

impl HttpHealthProbe {
    /// Probe `url`; `None` disables probing (always ambiguous)
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Map a health answer to a probe outcome.
    ///
    /// Only 503 or an explicit `"status": "unhealthy"` body is negative.
    /// Any other non-2xx answer (missing route, proxy error) says nothing
    /// about the feed and stays ambiguous.
    pub fn classify(status: StatusCode, body: &str) -> ProbeOutcome {
        if status == StatusCode::SERVICE_UNAVAILABLE || reports_unhealthy(body) {
            ProbeOutcome::Negative
        } else if status.is_success() {
            ProbeOutcome::Reachable
        } else {
            ProbeOutcome::Ambiguous
        }
    }

    /// Fetch the endpoint's status code and body
    pub async fn check(&self, timeout: Duration) -> crate::Result<(StatusCode, String)> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| FeedError::Probe("health probing disabled".to_string()))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FeedError::Probe(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FeedError::Probe(e.to_string()))?;
        Ok((status, body))
    }
}

fn reports_unhealthy(body: &str) -> bool {
    serde_json::from_str::<Value>(body)
        .map(|json| json["status"] == "unhealthy")
        .unwrap_or(false)
}

impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, timeout: Duration) -> ProbeOutcome {
        match self.check(timeout).await {
            Ok((status, body)) => {
                let outcome = Self::classify(status, &body);
                tracing::debug!(target: "feed", %status, ?outcome, "health probe answered");
                outcome
            }
            Err(e) => {
                tracing::debug!(target: "feed", error = %e, "health probe inconclusive");
                ProbeOutcome::Ambiguous
            }
        }
    }
}

/// Probe with a fixed answer
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub ProbeOutcome);

impl HealthProbe for StaticProbe {
    async fn probe(&self, _timeout: Duration) -> ProbeOutcome {
        self.0
    }
}
