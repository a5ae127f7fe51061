//! HTTP client for the aggregator's read API

use anyhow::{Context, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// GET a JSON resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// GET a plain-text resource, returning (success, body).
    pub async fn get_text(&self, path: &str) -> Result<(bool, String)> {
        let url = self.base_url.join(path).context("Invalid path")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let ok = response.status().is_success();
        let body = response.text().await.unwrap_or_default();
        Ok((ok, body))
    }
}

/// Percent-encode a metric name for use as one path segment; metric names
/// contain slashes (`cpu/usage`).
pub fn encode_metric(metric: &str) -> String {
    metric.replace('%', "%25").replace('/', "%2F")
}
