//! HTTP access to the portal API for the CLI.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::sync::{AbsenceNote, MessageDraft, SettingsPatch, WriteReplayer};

/// Stable, fixed-length cache key for a URL.
pub fn cache_key(url: &Url) -> String {
  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  format!("http:{}", hex::encode(hasher.finalize()))
}

/// Portal API client: fetches JSON documents and replays queued writes.
#[derive(Clone)]
pub struct PortalClient {
  client: reqwest::Client,
  base_url: Option<Url>,
}

impl PortalClient {
  pub fn new(client: reqwest::Client, base_url: Option<Url>) -> Self {
    Self { client, base_url }
  }

  /// GET `url` and parse the body as JSON.
  pub async fn fetch_json(&self, url: &Url) -> Result<Value> {
    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", url, e))
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    let base = self
      .base_url
      .as_ref()
      .ok_or_else(|| eyre!("No API base URL configured. Set api.base_url in satchel.yaml"))?;
    base
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {} under {}: {}", path, base, e))
  }

  async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<()> {
    let url = self.endpoint(path)?;
    self
      .client
      .post(url.clone())
      .json(body)
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| eyre!("POST {} failed: {}", url, e))?;
    Ok(())
  }
}

#[async_trait]
impl WriteReplayer for PortalClient {
  async fn settings_patch(&self, patch: &SettingsPatch) -> Result<()> {
    let url = self.endpoint("settings")?;
    self
      .client
      .patch(url.clone())
      .json(&patch.values)
      .send()
      .await
      .and_then(|response| response.error_for_status())
      .map_err(|e| eyre!("PATCH {} failed: {}", url, e))?;
    Ok(())
  }

  async fn message_draft(&self, draft: &MessageDraft) -> Result<()> {
    self.post("messages", draft).await
  }

  async fn absence_note(&self, note: &AbsenceNote) -> Result<()> {
    self.post("absences", note).await
  }
}
