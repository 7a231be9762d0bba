//! Health endpoint probing and outcome classification.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::state::{
    BackendStatus, ERROR_BACKEND_DOWN, ERROR_DEGRADED, ERROR_INVALID_PAYLOAD, ERROR_TIMEOUT,
};

/// Default bound on a single health check.
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5000;

/// Body of a successful health response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthPayload {
    pub status: String,
}

/// What a single probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Response {
        status: u16,
        payload: Option<HealthPayload>,
    },
    Timeout,
    Network(String),
}

/// Status and error marker derived from a probe outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: BackendStatus,
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn classify(&self) -> Classification {
        let (status, error) = match self {
            ProbeOutcome::Response { status, payload } => match *status {
                200..=299 => match payload.as_ref().map(|p| p.status.as_str()) {
                    Some("ok") => (BackendStatus::Healthy, None),
                    Some("degraded") => (BackendStatus::Degraded, Some(ERROR_DEGRADED.to_string())),
                    Some("down") => (BackendStatus::Down, Some(ERROR_BACKEND_DOWN.to_string())),
                    _ => (
                        BackendStatus::Degraded,
                        Some(ERROR_INVALID_PAYLOAD.to_string()),
                    ),
                },
                500..=599 => (BackendStatus::Down, Some(format!("http_{}", status))),
                _ => (BackendStatus::Degraded, Some(format!("http_{}", status))),
            },
            // Thrown requests are functionally down; the marker stays the same either way.
            ProbeOutcome::Timeout | ProbeOutcome::Network(_) => {
                (BackendStatus::Down, Some(ERROR_TIMEOUT.to_string()))
            }
        };
        Classification { status, error }
    }
}

/// Something that can ask the backend whether it is healthy.
pub trait HealthProbe: Send + Sync {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome>;
}

/// Probes a health URL with a bounded-timeout GET.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpHealthProbe {
    client: Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build health check client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn get(&self) -> ProbeOutcome {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return ProbeOutcome::Timeout,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Health request failed");
                return ProbeOutcome::Network(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ProbeOutcome::Response {
                status: status.as_u16(),
                payload: None,
            };
        }

        match response.json::<HealthPayload>().await {
            Ok(payload) => ProbeOutcome::Response {
                status: status.as_u16(),
                payload: Some(payload),
            },
            Err(e) if e.is_timeout() => ProbeOutcome::Timeout,
            Err(e) => {
                debug!(url = %self.url, error = %e, "Failed to parse health payload");
                ProbeOutcome::Response {
                    status: status.as_u16(),
                    payload: None,
                }
            }
        }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self) -> BoxFuture<'_, ProbeOutcome> {
        self.get().boxed()
    }
}
