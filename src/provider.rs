use crate::config::ProviderConfig;
use crate::error::{Error, ErrorDetails, ProviderErrorKind};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use url::Url;

/// Remote image-generation collaborator. Only success/failure and an opaque
/// message are consumed; the pipeline never looks inside the payload.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Generate an image for `prompt`, returning raw artifact bytes.
    async fn generate(&self, prompt: &str) -> Result<Bytes, Error>;
    /// Produce a new image from `source` guided by `prompt`.
    async fn edit(&self, source: &[u8], prompt: &str) -> Result<Bytes, Error>;
}

/// Hugging-Face-style inference endpoint: POST a JSON body, get image bytes
/// back on 200.
pub struct HttpImageProvider {
    client: reqwest::Client,
    base_url: Url,
    api_key: SecretString,
}

fn classify_status(status: StatusCode) -> ProviderErrorKind {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Permanent
    }
}

fn handle_reqwest_error(e: reqwest::Error) -> Error {
    // Connection-level trouble is worth retrying; anything else is not.
    let kind = if e.is_connect() || e.is_timeout() || e.is_request() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Permanent
    };
    Error::new(ErrorDetails::Provider {
        message: format!("Request to image provider failed: {e}"),
        status_code: e.status().map(|s| s.as_u16()),
        kind,
    })
}

impl HttpImageProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<Bytes, Error> {
        let response = self
            .client
            .post(self.base_url.clone())
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(handle_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::new(ErrorDetails::Provider {
                message,
                status_code: Some(status.as_u16()),
                kind: classify_status(status),
            }));
        }

        let bytes = response.bytes().await.map_err(handle_reqwest_error)?;
        if bytes.is_empty() {
            return Err(Error::new(ErrorDetails::Provider {
                message: "Provider returned an empty body".to_string(),
                status_code: Some(status.as_u16()),
                kind: ProviderErrorKind::Transient,
            }));
        }
        Ok(bytes)
    }
}

#[async_trait]
impl ImageProvider for HttpImageProvider {
    async fn generate(&self, prompt: &str) -> Result<Bytes, Error> {
        self.post(json!({ "inputs": prompt })).await
    }

    async fn edit(&self, source: &[u8], prompt: &str) -> Result<Bytes, Error> {
        self.post(json!({
            "inputs": prompt,
            "image": BASE64.encode(source),
        }))
        .await
    }
}
