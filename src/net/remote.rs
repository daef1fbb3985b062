use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::RemoteApi;

/// Backend API client used to replay queued writes.
#[derive(Clone)]
pub struct HttpRemoteApi {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemoteApi {
  pub fn new(base_url: Url, token: Option<String>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create backend client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  /// Send a request and treat any non-success status as a failure.
  async fn send(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<()> {
    let url = self.endpoint(path)?;
    let mut request = self.client.request(method.clone(), url.clone());
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to {} {}: {}", method, url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(eyre!("{} {} returned status {}", method, url, status));
    }

    debug!(%method, %url, status = status.as_u16(), "Backend call succeeded");
    Ok(())
  }
}

/// Extract the diary id from a payload; accepts string or numeric ids.
fn diary_id(data: &Value) -> Result<String> {
  match data.get("id") {
    Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
    Some(Value::Number(id)) => Ok(id.to_string()),
    _ => Err(eyre!("Diary payload has no id")),
  }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
  async fn create_diary(&self, data: &Value) -> Result<()> {
    self
      .send(reqwest::Method::POST, "api/diary", Some(data))
      .await
  }

  async fn update_diary(&self, data: &Value) -> Result<()> {
    let id = diary_id(data)?;
    self
      .send(reqwest::Method::PUT, &format!("api/diary/{}", id), Some(data))
      .await
  }

  async fn delete_diary(&self, data: &Value) -> Result<()> {
    let id = diary_id(data)?;
    self
      .send(reqwest::Method::DELETE, &format!("api/diary/{}", id), None)
      .await
  }

  async fn update_settings(&self, data: &Value) -> Result<()> {
    self
      .send(reqwest::Method::PUT, "api/settings", Some(data))
      .await
  }
}
