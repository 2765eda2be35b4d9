use anyhow::{Context, Result};
use async_trait::async_trait;

use super::types::{ActivityEntry, NowPlayingEntry, SystemInfo};
use super::UmsClient;

/// reqwest-backed client for one UMS instance.
pub struct HttpUmsClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpUmsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("failed to build UMS HTTP client")?;

        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl UmsClient for HttpUmsClient {
    async fn system_info(&self) -> Result<SystemInfo> {
        let response = self
            .client
            .get(self.url("/System/Info"))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .context("failed to reach /System/Info")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("UMS /System/Info error {}: {}", status, body);
        }

        response.json().await.context("failed to parse /System/Info response")
    }

    async fn sessions(&self) -> Result<Vec<NowPlayingEntry>> {
        let response = self
            .client
            .get(self.url("/Sessions"))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .context("failed to reach /Sessions")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("UMS /Sessions error {}: {}", status, body);
        }

        response.json().await.context("failed to parse /Sessions response")
    }

    async fn activities(&self, start_index: i64, limit: i64) -> Result<Vec<ActivityEntry>> {
        let response = self
            .client
            .get(self.url("/System/ActivityLog/Entries"))
            .query(&[("startIndex", start_index), ("limit", limit)])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .context("failed to reach activity log endpoint")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("UMS activity log error {}: {}", status, body);
        }

        #[derive(serde::Deserialize)]
        struct ActivityPage {
            items: Vec<ActivityEntry>,
        }

        let page: ActivityPage = response.json().await.context("failed to parse activity log response")?;
        Ok(page.items)
    }
}
