//! HTTP implementation of the remote gateway.
//!
//! Talks to the `/resources` CRUD endpoints. Every response body is wrapped
//! in a `{status, data}` envelope; errors carry `{status, message}`.

use crate::{
    error::Result, Error, GatewayConfig, NewRecord, Record, RecordPatch, RemoteGateway,
};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

/// Header carrying the create operation id.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[allow(dead_code)]
    status: String,
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

/// Remote gateway over HTTP using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    /// Build a gateway. The per-call timeout comes from the config.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url_for(&self, id: &str) -> String {
        format!("{}/{}", self.base_url, id)
    }

    async fn check(response: Response, id: Option<&str>) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .ok()
            .and_then(|body| body.message)
            .unwrap_or(text);

        Err(classify(status, message, id))
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let envelope: Envelope<T> = response.json().await.map_err(|e| Error::Server {
            status: status.as_u16(),
            message: format!("malformed response body: {}", e),
        })?;
        Ok(envelope.data)
    }
}

/// Map a non-success status to the engine's error taxonomy.
fn classify(status: StatusCode, message: String, id: Option<&str>) -> Error {
    if status == StatusCode::NOT_FOUND {
        return Error::NotFound(id.unwrap_or_default().to_string());
    }
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return Error::Server {
            status: status.as_u16(),
            message,
        };
    }
    Error::Rejected(format!("HTTP {}: {}", status.as_u16(), message))
}

fn transport(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn list(&self) -> Result<Vec<Record>> {
        debug!(url = %self.base_url, "GET");
        let response = self.client.get(&self.base_url).send().await.map_err(transport)?;
        let response = Self::check(response, None).await?;
        Self::decode(response).await
    }

    async fn create(&self, op_id: &str, input: &NewRecord) -> Result<Record> {
        debug!(url = %self.base_url, op_id, "POST");
        let response = self
            .client
            .post(&self.base_url)
            .header(IDEMPOTENCY_HEADER, op_id)
            .json(input)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response, None).await?;
        Self::decode(response).await
    }

    async fn update(&self, id: &str, patch: &RecordPatch) -> Result<Record> {
        let url = self.url_for(id);
        debug!(url = %url, "PUT");
        let response = self
            .client
            .put(&url)
            .json(patch)
            .send()
            .await
            .map_err(transport)?;
        let response = Self::check(response, Some(id)).await?;
        Self::decode(response).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let url = self.url_for(id);
        debug!(url = %url, "DELETE");
        let response = self.client.delete(&url).send().await.map_err(transport)?;
        Self::check(response, Some(id)).await?;
        Ok(())
    }
}
