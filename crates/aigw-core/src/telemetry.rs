//! Best-effort per-request telemetry.  Transport errors are swallowed.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

const POST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct RequestSummary {
    pub request_id: String,
    pub provider: String,
    pub model: String,
    pub streamed: bool,
    pub success: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Clone)]
pub struct Telemetry {
    endpoint: String,
    client: wreq::Client,
}

impl Telemetry {
    pub fn new(endpoint: String) -> Option<Self> {
        let client = wreq::Client::builder().timeout(POST_TIMEOUT).build().ok()?;
        Some(Self { endpoint, client })
    }

    /// Fire-and-forget: one summary record per request.
    pub fn post(&self, summary: RequestSummary) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(err) = client.post(&endpoint).json(&summary).send().await {
                debug!(event = "telemetry.post_failed", error = %err);
            }
        });
    }
}
