//! Backend reachability indicator.

use std::fmt;
use std::time::Duration;

use crate::utils::url::construct_api_url;

const HEALTH_ENDPOINT: &str = "health";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Connected,
    Disconnected,
    Checking,
}

impl fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectivityStatus::Connected => "connected",
            ConnectivityStatus::Disconnected => "disconnected",
            ConnectivityStatus::Checking => "checking",
        };
        write!(f, "{label}")
    }
}

/// Tracks whether the backend is reachable. Explicit probes hit the health
/// endpoint; every real request/response cycle also reports its outcome
/// here, so the indicator reflects actual traffic between probes.
pub struct ConnectivityProbe {
    client: reqwest::Client,
    base_url: String,
    status: ConnectivityStatus,
}

impl ConnectivityProbe {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            status: ConnectivityStatus::Checking,
        }
    }

    pub fn status(&self) -> ConnectivityStatus {
        self.status
    }

    /// Lightweight reachability check against the health endpoint.
    pub async fn probe(&mut self) -> ConnectivityStatus {
        self.status = ConnectivityStatus::Checking;
        let url = construct_api_url(&self.base_url, HEALTH_ENDPOINT);
        let reachable = match self.client.get(url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        self.status = if reachable {
            ConnectivityStatus::Connected
        } else {
            ConnectivityStatus::Disconnected
        };
        self.status
    }

    /// Outcome of a real request/response cycle.
    pub fn note_success(&mut self) {
        self.status = ConnectivityStatus::Connected;
    }

    pub fn note_failure(&mut self) {
        self.status = ConnectivityStatus::Disconnected;
    }
}
