use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use url::Url;

use super::candidates::EndpointCandidate;

/// Liveness endpoint exposed by every agent build, local or cloud.
const LIVENESS_PATH: &str = "isAlive";

/// A liveness response from a candidate, kept together with the URL that
/// produced it so the winner can be turned into a session.
#[derive(Debug, Clone)]
pub struct ProbeHit {
    pub url: Url,
    pub body: Value,
}

impl ProbeHit {
    /// Session identifier minted by the agent, when it sent one.
    pub fn session_uuid(&self) -> Option<&str> {
        self.body.get("uuid").and_then(Value::as_str)
    }

    /// Protocol the agent claims to speak, when it advertises one.
    pub fn proto(&self) -> Option<&str> {
        self.body.get("proto").and_then(Value::as_str)
    }
}

/// Terminal result of probing one candidate. Failures and timeouts are data,
/// not errors: the race inspects them and moves on.
#[derive(Debug)]
pub enum ProbeOutcome {
    Success(ProbeHit),
    Failure { reason: String },
    TimedOut,
}

#[derive(Debug, Error)]
enum ProbeFailure {
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(StatusCode),
}

/// Seam between the race coordinator and the network, so races can be run
/// against scripted probers in tests.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        candidate: &EndpointCandidate,
        attempt_timeout: Duration,
    ) -> ProbeOutcome;
}

/// Probes candidates over HTTP by POSTing to their liveness endpoint and
/// parsing the JSON body.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Proxies get in the way of loopback probing, and candidate URLs are
        // all explicit hosts anyway.
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(
        &self,
        candidate: &EndpointCandidate,
        attempt_timeout: Duration,
    ) -> ProbeOutcome {
        let target = match candidate.url.join(LIVENESS_PATH) {
            Ok(url) => url,
            Err(err) => {
                return ProbeOutcome::Failure {
                    reason: format!("invalid liveness url: {err}"),
                };
            }
        };

        let request = async {
            let response = self
                .client
                .post(target)
                .send()
                .await
                .map_err(ProbeFailure::from)?;
            if !response.status().is_success() {
                return Err(ProbeFailure::Status(response.status()));
            }
            let body = response
                .json::<Value>()
                .await
                .map_err(ProbeFailure::from)?;
            Ok(body)
        };

        match timeout(attempt_timeout, request).await {
            Ok(Ok(body)) => ProbeOutcome::Success(ProbeHit {
                url: candidate.url.clone(),
                body,
            }),
            Ok(Err(failure)) => ProbeOutcome::Failure {
                reason: failure.to_string(),
            },
            Err(_) => ProbeOutcome::TimedOut,
        }
    }
}
