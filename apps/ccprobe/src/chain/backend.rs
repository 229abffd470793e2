use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::ClientError;

/// Body of the certificate request that opens a card read.
#[derive(Debug, Clone, Serialize)]
pub struct ReadRequestBody {
    /// Session id of the agent the read will go through. Omitted from the
    /// wire entirely when no session is known yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Fresh correlation id for this read, a v4 UUID.
    pub cms: String,
}

/// The decrypting backend: hands out per-read certificates and decrypts what
/// the agent returned.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn read_request(&self, body: &ReadRequestBody) -> Result<Value, ClientError>;
    async fn read_delivery(&self, payload: &Value) -> Result<Value, ClientError>;
}

pub struct HttpBackendClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpBackendClient {
    pub fn new(base_url: Url) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { base_url, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|err| ClientError::InvalidEndpoint(format!("{path}: {err}")))
    }

    async fn post_json(&self, path: &str, body: &impl Serialize) -> Result<Value, ClientError> {
        let endpoint = self.endpoint(path)?;
        let response = self.client.post(endpoint).json(body).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn read_request(&self, body: &ReadRequestBody) -> Result<Value, ClientError> {
        self.post_json("read/request", body).await
    }

    async fn read_delivery(&self, payload: &Value) -> Result<Value, ClientError> {
        self.post_json("read/delivery", payload).await
    }
}
