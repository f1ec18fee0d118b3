//! Client for the external parking-occupancy provider.
//!
//! The provider answers `GET /get_parking_occupancy` with a JSON object mapping
//! each parking lot name to its spot readings:
//!
//! ```json
//! { "lot-north": [ { "name": "N-01", "occupied": true } ] }
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProviderConfig;

/// Lot name → readings for that lot.
pub type Snapshot = BTreeMap<String, Vec<SpotReading>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpotReading {
    pub name: String,
    pub occupied: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("provider request failed: {0}")]
    Http(String),
    #[error("provider returned HTTP {0}")]
    Status(u16),
    #[error("malformed provider payload: {0}")]
    Decode(String),
    #[error("provider request timed out")]
    Timeout,
}

impl FetchError {
    /// Transport failures, timeouts and 5xx are worth another try; a bad
    /// payload or a 4xx will not fix itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http(_) | FetchError::Timeout => true,
            FetchError::Status(code) => *code >= 500,
            FetchError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Http(e.to_string())
        }
    }
}

#[async_trait]
pub trait OccupancyProvider: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError>;
}

pub struct PpmClient {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
    retries: u32,
    backoff: Duration,
}

impl PpmClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            url: format!("{}/get_parking_occupancy", config.base_url.trim_end_matches('/')),
            username: config.username.clone(),
            password: config.password.clone(),
            retries: config.retries,
            backoff: config.backoff,
        })
    }

    async fn fetch_once(&self) -> Result<Snapshot, FetchError> {
        let response = self
            .http
            .get(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl OccupancyProvider for PpmClient {
    /// Retries with doubling backoff; spot writes are never retried, only this fetch.
    async fn fetch_snapshot(&self) -> Result<Snapshot, FetchError> {
        let mut attempt = 0;
        let mut delay = self.backoff;
        loop {
            match self.fetch_once().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < self.retries && e.is_retryable() => {
                    attempt += 1;
                    warn!("provider fetch failed ({e}), retry {attempt}/{} in {delay:?}", self.retries);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
