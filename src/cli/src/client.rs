//! HTTP client for the Chronicle API.

use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response envelope returned by every /api/v1 endpoint.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<Value>,
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str, actor_id: &str, actor_role: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-actor-id",
            HeaderValue::from_str(actor_id).context("invalid actor id")?,
        );
        headers.insert(
            "x-actor-role",
            HeaderValue::from_str(actor_role).context("invalid actor role")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", url))?;
        Self::unwrap_envelope(response).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", url))?;
        Self::unwrap_envelope(response).await
    }

    /// GET an endpoint that returns plain JSON without the response envelope.
    pub async fn get_raw<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("server returned {}: {}", status, body));
        }
        response.json().await.context("failed to parse response")
    }

    /// GET an endpoint that returns a raw text body (markdown, exports).
    pub async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("failed to connect to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{}", extract_error_message(status, &body)));
        }
        response.text().await.context("failed to read response body")
    }

    async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await.context("failed to read response")?;

        if !status.is_success() {
            return Err(anyhow!("{}", extract_error_message(status, &body)));
        }

        let envelope: ApiResponse<T> =
            serde_json::from_str(&body).context("failed to parse API response")?;
        if envelope.success {
            envelope
                .data
                .ok_or_else(|| anyhow!("API returned success without data"))
        } else {
            Err(anyhow!(
                "{}",
                envelope
                    .error
                    .as_ref()
                    .map(describe_error)
                    .unwrap_or_else(|| "unknown API error".to_string())
            ))
        }
    }
}

/// Pull a readable message out of the server's error envelope, falling
/// back to the raw body when it is not JSON.
fn extract_error_message(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .get("error")
            .map(describe_error)
            .unwrap_or_else(|| format!("server returned {}", status)),
        Err(_) => format!("server returned {}: {}", status, body),
    }
}

fn describe_error(error: &Value) -> String {
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    match error.get("code").and_then(Value::as_str) {
        Some(code) => format!("{} ({})", message, code),
        None => message.to_string(),
    }
}
