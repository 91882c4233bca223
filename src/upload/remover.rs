//! Client for the remote background removal service.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RemoverConfig;
use crate::error::RemoteError;

/// Header carrying the access credential
pub const API_KEY_HEADER: &str = "x-api-key";

/// Something that can take the background off a base64 PNG payload.
///
/// Implementations receive the bare payload (no data URL prefix) and return
/// the processed payload in the same form.
#[async_trait]
pub trait BackgroundRemover: Send + Sync {
    async fn remove_background(&self, image_b64: &str) -> Result<String, RemoteError>;
}

#[derive(Serialize)]
struct RemovalRequest<'a> {
    image_file_b64: &'a str,
}

#[derive(Deserialize)]
struct RemovalResponse {
    result_b64: String,
}

/// [`BackgroundRemover`] talking JSON over HTTP.
pub struct HttpRemover {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpRemover {
    pub fn new(config: &RemoverConfig) -> Result<Self, RemoteError> {
        let mut builder = Client::builder().user_agent(concat!("cutout/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(RemoteError::Client)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BackgroundRemover for HttpRemover {
    async fn remove_background(&self, image_b64: &str) -> Result<String, RemoteError> {
        let transport = |source: reqwest::Error| RemoteError::Transport {
            endpoint: self.endpoint.clone(),
            source,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::ACCEPT, "application/json")
            .header(API_KEY_HEADER, &self.api_key)
            .json(&RemovalRequest { image_file_b64: image_b64 })
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        debug!(endpoint = %self.endpoint, status = status.as_u16(), "Removal service responded");
        if status.is_client_error() || status.is_server_error() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        let parsed: RemovalResponse = serde_json::from_str(&body)
            .map_err(|e| RemoteError::UnexpectedBody(e.to_string()))?;
        Ok(parsed.result_b64)
    }
}

impl std::fmt::Debug for HttpRemover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemover")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
