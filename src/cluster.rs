//! Cluster coordination client.
//!
//! Before starting metachannels the disconnect monitor asks every peer
//! appliance how much of its channel population is connected. Peers answer
//! on `GET {engineURL}/ConnectedPVCountForAppliance` with a JSON object
//! whose `total` and `disconnected` fields are string-encoded integers. A
//! peer that cannot be reached or parsed is treated as unknown, never as a
//! reason to fail the tick.

use crate::config::ApplianceInfo;
use crate::error::EngineError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Connected/disconnected channel counts reported by one appliance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectedPvCount {
    pub total: u64,
    pub disconnected: u64,
}

impl ConnectedPvCount {
    /// Percentage of channels currently disconnected; 0 for an empty
    /// appliance.
    pub fn disconnected_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.disconnected as f64 * 100.0 / self.total as f64
    }
}

/// Source of peer connection counts.
#[async_trait]
pub trait PeerCountSource: Send + Sync {
    async fn connected_pv_count(
        &self,
        appliance: &ApplianceInfo,
    ) -> Result<ConnectedPvCount, EngineError>;
}

/// Both fields arrive string-encoded.
#[derive(Deserialize)]
struct ConnectedPvCountBody {
    total: String,
    disconnected: String,
}

/// HTTP implementation of [`PeerCountSource`].
pub struct HttpPeerCountClient {
    client: reqwest::Client,
}

impl HttpPeerCountClient {
    pub fn new(request_timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Cluster(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PeerCountSource for HttpPeerCountClient {
    async fn connected_pv_count(
        &self,
        appliance: &ApplianceInfo,
    ) -> Result<ConnectedPvCount, EngineError> {
        let url = format!("{}/ConnectedPVCountForAppliance", appliance.engine_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Cluster(format!("Request to {url} failed: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::Cluster(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }
        let body: ConnectedPvCountBody = response
            .json()
            .await
            .map_err(|e| EngineError::Cluster(format!("Malformed count body from {url}: {e}")))?;
        parse_counts(&body, &url)
    }
}

fn parse_counts(body: &ConnectedPvCountBody, url: &str) -> Result<ConnectedPvCount, EngineError> {
    let total = body
        .total
        .parse()
        .map_err(|e| EngineError::Cluster(format!("Bad total count from {url}: {e}")))?;
    let disconnected = body
        .disconnected
        .parse()
        .map_err(|e| EngineError::Cluster(format!("Bad disconnected count from {url}: {e}")))?;
    Ok(ConnectedPvCount {
        total,
        disconnected,
    })
}
