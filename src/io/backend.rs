//! Positioning backend client
//!
//! The `Backend` trait is the seam to the remote service that serves
//! building lists and radio maps, accepts tracked-position batches, and
//! runs infrastructure-based positioning. `HttpBackend` speaks JSON over
//! HTTP with reqwest.

use crate::domain::position::InfrastructureEstimate;
use crate::domain::types::{Building, BuildingId};
use crate::domain::TrackedPosition;
use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Shallow buildings (identity, name, permissible APs)
    async fn fetch_building_list(&self) -> anyhow::Result<Vec<Building>>;

    /// Full building including its radio map
    async fn fetch_building(&self, id: BuildingId) -> anyhow::Result<Building>;

    async fn upload_tracked_positions(&self, batch: Vec<TrackedPosition>) -> anyhow::Result<()>;

    async fn start_infrastructure_positioning(&self, client_id: &str) -> anyhow::Result<()>;

    /// Latest backend-computed position, if any
    async fn poll_infrastructure_position(
        &self,
        client_id: &str,
    ) -> anyhow::Result<Option<InfrastructureEstimate>>;

    async fn stop_infrastructure_positioning(&self, client_id: &str) -> anyhow::Result<()>;
}

/// JSON-over-HTTP backend client
pub struct HttpBackend {
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let (base_url, username, password) = Self::parse_url_with_auth(base_url);
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { base_url: base_url.trim_end_matches('/').to_string(), username, password, client })
    }

    /// Parse URL and extract basic auth credentials if present
    fn parse_url_with_auth(url: &str) -> (String, Option<String>, Option<String>) {
        for scheme in ["http://", "https://"] {
            if let Some(rest) = url.strip_prefix(scheme) {
                let host_end = rest.find('/').unwrap_or(rest.len());
                if let Some(at_pos) = rest[..host_end].rfind('@') {
                    let auth_part = &rest[..at_pos];
                    let host_part = &rest[at_pos + 1..];

                    if let Some(colon_pos) = auth_part.find(':') {
                        let username = auth_part[..colon_pos].to_string();
                        let password = auth_part[colon_pos + 1..].to_string();
                        let clean_url = format!("{}{}", scheme, host_part);
                        return (clean_url, Some(username), Some(password));
                    }
                }
            }
        }
        (url.to_string(), None, None)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                let encoded = STANDARD.encode(format!("{}:{}", username, password).as_bytes());
                request.header("Authorization", format!("Basic {}", encoded))
            }
            _ => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = self.url(path);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()?;
        let body = response.json::<T>().await.with_context(|| format!("Invalid JSON from {}", url))?;
        debug!(url = %url, "backend_get");
        Ok(body)
    }

    async fn post_json<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> anyhow::Result<()> {
        let url = self.url(path);
        self.authorized(self.client.post(&url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", url))?
            .error_for_status()?;
        debug!(url = %url, "backend_post");
        Ok(())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn fetch_building_list(&self) -> anyhow::Result<Vec<Building>> {
        self.get_json("buildings").await
    }

    async fn fetch_building(&self, id: BuildingId) -> anyhow::Result<Building> {
        self.get_json(&format!("buildings/{}", id)).await
    }

    async fn upload_tracked_positions(&self, batch: Vec<TrackedPosition>) -> anyhow::Result<()> {
        self.post_json("tracked-positions", &batch).await
    }

    async fn start_infrastructure_positioning(&self, client_id: &str) -> anyhow::Result<()> {
        self.post_json(&format!("infrastructure/{}/start", client_id), &()).await
    }

    async fn poll_infrastructure_position(
        &self,
        client_id: &str,
    ) -> anyhow::Result<Option<InfrastructureEstimate>> {
        self.get_json(&format!("infrastructure/{}/position", client_id)).await
    }

    async fn stop_infrastructure_positioning(&self, client_id: &str) -> anyhow::Result<()> {
        self.post_json(&format!("infrastructure/{}/stop", client_id), &()).await
    }
}
