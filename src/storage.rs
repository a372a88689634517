//! Client for the storage service (PostgREST-style REST API).
//!
//! The persisted schema belongs to the dashboard side of the product; this
//! client is the orchestration core's only touchpoint with it. The service
//! key is sent with every request.

use reqwest::Client;

use crate::config::Config;
use crate::memory::{MemoryEntry, NewMemory};

#[derive(Debug, Clone)]
pub struct StorageClient {
    client: Client,
    url: String,
    service_key: String,
}

#[derive(Debug, serde::Deserialize)]
struct ProfileRow {
    #[serde(default)]
    bio: Option<String>,
}

impl StorageClient {
    pub fn new(url: &str, service_key: &str) -> Self {
        Self {
            client: Client::new(),
            url: url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        }
    }

    /// Build from config when both endpoint and key are present.
    pub fn from_config(config: &Config) -> Option<Self> {
        match (&config.storage_url, &config.storage_key) {
            (Some(url), Some(key)) => Some(Self::new(url, key)),
            _ => {
                tracing::info!("storage service not configured; profile and memory lookups disabled");
                None
            }
        }
    }

    fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url)
    }

    fn get(&self, path_and_query: String) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/{}", self.rest_url(), path_and_query))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    /// The user's profile text, if any.
    pub async fn fetch_profile(&self, user_id: &str) -> anyhow::Result<Option<String>> {
        let resp = self
            .get(format!("profiles?user_id=eq.{user_id}&select=bio&limit=1"))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("profile fetch failed: {} - {}", status, text);
        }

        let rows: Vec<ProfileRow> = resp.json().await?;
        Ok(rows.into_iter().next().and_then(|row| row.bio))
    }

    /// Persistent-tier memories in insertion order; importance sorting is
    /// the orchestrator's concern.
    pub async fn list_persistent_memories(
        &self,
        user_id: &str,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let resp = self
            .get(format!(
                "memories?user_id=eq.{user_id}&tier=eq.persistent&order=created_at.asc"
            ))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("memory list failed: {} - {}", status, text);
        }

        Ok(resp.json().await?)
    }

    /// Store one memory entry and return the created row.
    pub async fn save_memory(&self, memory: &NewMemory) -> anyhow::Result<MemoryEntry> {
        let resp = self
            .client
            .post(format!("{}/memories", self.rest_url()))
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(memory)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("memory save failed: {} - {}", status, text);
        }

        let rows: Vec<MemoryEntry> = serde_json::from_str(&text)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no memory row returned"))
    }

    /// Case-insensitive substring search over a user's memories.
    pub async fn search_memories(
        &self,
        user_id: &str,
        query: &str,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let pattern = format!("*{}*", query.replace(['*', ','], " ").trim());
        let resp = self
            .get(format!(
                "memories?user_id=eq.{user_id}&content=ilike.{pattern}&order=importance.desc"
            ))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("memory search failed: {} - {}", status, text);
        }

        Ok(resp.json().await?)
    }
}
