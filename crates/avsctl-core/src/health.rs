//! Node health probing
//!
//! Instances that declare an API target expose
//! `GET /eigen/node/health`; the response code maps onto the health
//! scale below.

use serde::Serialize;
use std::time::Duration;

const HEALTH_PATH: &str = "/eigen/node/health";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Health of a node instance as reported by its own endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    PartiallyHealthy,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::PartiallyHealthy => write!(f, "partially healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl NodeHealth {
    /// Map an HTTP status code onto the health scale
    pub fn from_status(status: u16) -> Self {
        match status {
            200 => Self::Healthy,
            206 => Self::PartiallyHealthy,
            503 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

/// HTTP client for the node health endpoint
#[derive(Debug, Clone)]
pub struct HealthClient {
    client: reqwest::Client,
}

impl Default for HealthClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .expect("reqwest client with a static configuration");
        Self { client }
    }

    /// Probe a node's health endpoint. Transport failures read as Unknown;
    /// the node may simply not implement the endpoint.
    pub async fn check(&self, host: &str, port: u16) -> NodeHealth {
        let url = format!("http://{}:{}{}", host, port, HEALTH_PATH);
        match self.client.get(&url).send().await {
            Ok(response) => NodeHealth::from_status(response.status().as_u16()),
            Err(e) => {
                tracing::debug!("health check against {} failed: {}", url, e);
                NodeHealth::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(NodeHealth::from_status(200), NodeHealth::Healthy);
        assert_eq!(NodeHealth::from_status(206), NodeHealth::PartiallyHealthy);
        assert_eq!(NodeHealth::from_status(503), NodeHealth::Unhealthy);
        assert_eq!(NodeHealth::from_status(404), NodeHealth::Unknown);
        assert_eq!(NodeHealth::from_status(500), NodeHealth::Unknown);
    }

    #[test]
    fn test_display() {
        assert_eq!(NodeHealth::Healthy.to_string(), "healthy");
        assert_eq!(NodeHealth::PartiallyHealthy.to_string(), "partially healthy");
    }
}
