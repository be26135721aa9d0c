use anyhow::{anyhow, bail, Result};
use livedraw_core::{ConfigUpdate, ScheduleConfig, SealedRound, StatusReport};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// HTTP client for a running `livedraw serve`.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ForceFinalResponse {
    result: SealedRound,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn admin(&self, path: &str) -> Result<RequestBuilder> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| anyhow!("Admin token required (use --token or ADMIN_TOKEN)"))?;
        Ok(self.http.post(self.url(path)).header("x-admin-token", token))
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["error"].as_str().unwrap_or("unknown error");
            bail!("Server returned {}: {}", status, message);
        }
        Ok(response.json().await?)
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let response = self.http.get(self.url("/api/status")).send().await?;
        Self::parse(response).await
    }

    pub async fn update_config(&self, update: &ConfigUpdate) -> Result<ScheduleConfig> {
        let response = self.admin("/api/config")?.json(update).send().await?;
        Self::parse(response).await
    }

    pub async fn force_preview(&self) -> Result<()> {
        let response = self.admin("/api/force-preview")?.send().await?;
        Self::parse::<serde_json::Value>(response).await?;
        Ok(())
    }

    pub async fn force_final(&self) -> Result<SealedRound> {
        let response = self.admin("/api/force-final")?.send().await?;
        let body: ForceFinalResponse = Self::parse(response).await?;
        Ok(body.result)
    }
}
