use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use url::Url;

use super::ClientError;

/// Path of the agent's card read endpoint, relative to the discovered base
/// URL.
const READ_PATH: &str = "cc-read";

/// The card agent itself. Takes the accumulated request parameters as a
/// multipart form and answers with the encrypted card payload.
#[async_trait]
pub trait PluginClient: Send + Sync {
    async fn read_card(
        &self,
        base_url: &Url,
        fields: &Map<String, Value>,
    ) -> Result<Value, ClientError>;
}

pub struct HttpPluginClient {
    client: reqwest::Client,
}

impl HttpPluginClient {
    pub fn new() -> Result<Self, ClientError> {
        // No overall timeout: a card read blocks on the holder presenting
        // their card to the reader, which takes as long as it takes.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PluginClient for HttpPluginClient {
    async fn read_card(
        &self,
        base_url: &Url,
        fields: &Map<String, Value>,
    ) -> Result<Value, ClientError> {
        let endpoint = base_url
            .join(READ_PATH)
            .map_err(|err| ClientError::InvalidEndpoint(format!("{READ_PATH}: {err}")))?;

        let mut form = reqwest::multipart::Form::new();
        for (key, value) in fields {
            form = form.text(key.clone(), form_value(value));
        }

        let response = self.client.post(endpoint).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(ClientError::HttpStatus(response.status()));
        }
        Ok(response.json().await?)
    }
}

/// Multipart fields are text; strings go through verbatim, everything else as
/// its JSON rendering.
fn form_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
