pub mod backend;
pub mod plugin;

use std::sync::Arc;

use reqwest::StatusCode;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ChainConfig, DiscoveryConfig, StepPolicy};
use crate::discovery::{
    self, DiscoveredEndpoint, DiscoveryError, EndpointCandidate, HttpProber, ProbeOutcome, Prober,
};

pub use backend::{BackendClient, HttpBackendClient, ReadRequestBody};
pub use plugin::{HttpPluginClient, PluginClient};

pub const STEP_DISCOVERY: &str = "discovery";
pub const STEP_LIVENESS: &str = "liveness";
pub const STEP_READ_REQUEST: &str = "read_request";
pub const STEP_CC_READ: &str = "cc_read";
pub const STEP_READ_DELIVERY: &str = "read_delivery";

/// Errors shared by the HTTP clients the chain drives.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Why a chain run stopped early. Only produced under [`StepPolicy::Halt`];
/// the default policy records failures in the log and keeps going.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("step {step} failed: {message}")]
    Step { step: &'static str, message: String },
}

/// Where a chain run is, or where it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Discovering,
    LivenessChecking,
    RequestingCertificates,
    ReadingCard,
    Decrypting,
    Done,
    Failed,
}

/// One step's result in the order it happened.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub step: &'static str,
    pub outcome: Result<Value, String>,
}

impl LogEntry {
    fn success(step: &'static str, value: Value) -> Self {
        Self {
            step,
            outcome: Ok(value),
        }
    }

    fn error(step: &'static str, message: String) -> Self {
        Self {
            step,
            outcome: Err(message),
        }
    }

    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn to_json(&self) -> Value {
        match &self.outcome {
            Ok(value) => serde_json::json!({ "step": self.step, "response": value }),
            Err(message) => serde_json::json!({ "step": self.step, "error": message }),
        }
    }
}

/// Accumulated request state for one run. `request_params` is what the agent
/// will be asked to sign with the card; `encrypted` is what came back and
/// goes to the backend for decryption.
#[derive(Debug, Clone, Default)]
pub struct ChainState {
    request_params: Map<String, Value>,
    encrypted: Map<String, Value>,
}

impl ChainState {
    pub fn request_params(&self) -> &Map<String, Value> {
        &self.request_params
    }

    pub fn encrypted(&self) -> &Map<String, Value> {
        &self.encrypted
    }

    fn merge_request_params(&mut self, value: &Value) {
        merge_into(&mut self.request_params, value);
    }

    fn merge_encrypted(&mut self, value: &Value) {
        merge_into(&mut self.encrypted, value);
    }

    /// Version and behavior flags the agent expects on every read.
    fn apply_read_flags(&mut self) {
        self.request_params.insert("nc".to_string(), Value::Bool(true));
        self.request_params
            .insert("ccv2".to_string(), Value::Bool(true));
    }
}

fn merge_into(target: &mut Map<String, Value>, value: &Value) {
    if let Some(object) = value.as_object() {
        for (key, entry) in object {
            target.insert(key.clone(), entry.clone());
        }
    }
}

/// Everything a finished run produced, whether or not it got to the end.
#[derive(Debug)]
pub struct ChainRun {
    pub phase: ChainPhase,
    pub log: Vec<LogEntry>,
    pub state: ChainState,
    pub error: Option<ChainError>,
}

impl ChainRun {
    fn completed(log: Vec<LogEntry>, state: ChainState) -> Self {
        Self {
            phase: ChainPhase::Done,
            log,
            state,
            error: None,
        }
    }

    fn failed(log: Vec<LogEntry>, state: ChainState, error: ChainError) -> Self {
        Self {
            phase: ChainPhase::Failed,
            log,
            state,
            error: Some(error),
        }
    }

    /// Latest successful response of the named step, if it has one.
    pub fn step_response(&self, step: &str) -> Option<&Value> {
        self.log
            .iter()
            .rev()
            .find(|entry| entry.step == step)
            .and_then(|entry| entry.outcome.as_ref().ok())
    }
}

/// Drives one read end to end: make sure an agent is reachable, fetch the
/// read certificates from the backend, hand them to the agent for the card
/// read, then send the encrypted result back for decryption.
pub struct ChainRunner {
    discovery: DiscoveryConfig,
    chain: ChainConfig,
    prober: Arc<dyn Prober>,
    backend: Arc<dyn BackendClient>,
    plugin: Arc<dyn PluginClient>,
}

impl ChainRunner {
    pub fn new(chain: ChainConfig, discovery: DiscoveryConfig) -> Result<Self, ClientError> {
        let prober = HttpProber::new()?;
        let backend = HttpBackendClient::new(chain.backend_url.clone())?;
        let plugin = HttpPluginClient::new()?;
        Ok(Self {
            discovery,
            chain,
            prober: Arc::new(prober),
            backend: Arc::new(backend),
            plugin: Arc::new(plugin),
        })
    }

    #[cfg(test)]
    fn with_clients(
        chain: ChainConfig,
        discovery: DiscoveryConfig,
        prober: Arc<dyn Prober>,
        backend: Arc<dyn BackendClient>,
        plugin: Arc<dyn PluginClient>,
    ) -> Self {
        Self {
            discovery,
            chain,
            prober,
            backend,
            plugin,
        }
    }

    /// Runs the chain against `session`, reusing an endpoint discovered by an
    /// earlier run when one is present. Every step appends to the returned
    /// log; failures only end the run early under [`StepPolicy::Halt`].
    pub async fn run(&self, session: &mut Option<DiscoveredEndpoint>) -> ChainRun {
        let mut log: Vec<LogEntry> = Vec::new();
        let mut state = ChainState::default();

        debug!(policy = ?self.chain.step_policy, "starting read chain");

        if session.is_some() {
            if let Some(error) = self.recheck_step(session, &mut log).await {
                return ChainRun::failed(log, state, error);
            }
        } else if let Some(error) = self.discover_step(session, &mut log).await {
            return ChainRun::failed(log, state, error);
        }

        debug!(phase = ?ChainPhase::RequestingCertificates, "entering phase");
        let body = ReadRequestBody {
            agent: session
                .as_ref()
                .and_then(|endpoint| endpoint.session_id.clone()),
            cms: Uuid::new_v4().to_string(),
        };
        match self.backend.read_request(&body).await {
            Ok(value) => {
                state.merge_request_params(&value);
                log.push(LogEntry::success(STEP_READ_REQUEST, value));
            }
            Err(err) => {
                if let Some(error) = self.step_failure(&mut log, STEP_READ_REQUEST, err.to_string())
                {
                    return ChainRun::failed(log, state, error);
                }
            }
        }

        debug!(phase = ?ChainPhase::ReadingCard, "entering phase");
        if session.is_none() {
            // A failed discovery under the continue policy lands here; try
            // once more before giving up on the read.
            if let Some(error) = self.discover_step(session, &mut log).await {
                return ChainRun::failed(log, state, error);
            }
        }
        state.apply_read_flags();
        match session.as_ref() {
            Some(endpoint) => {
                match self
                    .plugin
                    .read_card(&endpoint.base_url, state.request_params())
                    .await
                {
                    Ok(value) => {
                        state.merge_encrypted(&value);
                        log.push(LogEntry::success(STEP_CC_READ, value));
                    }
                    Err(err) => {
                        if let Some(error) =
                            self.step_failure(&mut log, STEP_CC_READ, err.to_string())
                        {
                            return ChainRun::failed(log, state, error);
                        }
                    }
                }
            }
            None => {
                let message = "no reachable agent to read from".to_string();
                if let Some(error) = self.step_failure(&mut log, STEP_CC_READ, message) {
                    return ChainRun::failed(log, state, error);
                }
            }
        }

        debug!(phase = ?ChainPhase::Decrypting, "entering phase");
        let payload = Value::Object(state.encrypted().clone());
        match self.backend.read_delivery(&payload).await {
            Ok(value) => log.push(LogEntry::success(STEP_READ_DELIVERY, value)),
            Err(err) => {
                if let Some(error) =
                    self.step_failure(&mut log, STEP_READ_DELIVERY, err.to_string())
                {
                    return ChainRun::failed(log, state, error);
                }
            }
        }

        info!(steps = log.len(), "read chain finished");
        ChainRun::completed(log, state)
    }

    /// Full discovery race, folding the winner into `session`.
    async fn discover_step(
        &self,
        session: &mut Option<DiscoveredEndpoint>,
        log: &mut Vec<LogEntry>,
    ) -> Option<ChainError> {
        debug!(phase = ?ChainPhase::Discovering, "entering phase");
        match self.discover_once(session).await {
            Ok(summary) => {
                log.push(LogEntry::success(STEP_DISCOVERY, summary));
                None
            }
            Err(err) => {
                warn!(step = STEP_DISCOVERY, error = %err, "chain step failed");
                log.push(LogEntry::error(STEP_DISCOVERY, err.to_string()));
                match self.chain.step_policy {
                    StepPolicy::Halt => Some(ChainError::Discovery(err)),
                    StepPolicy::Continue => None,
                }
            }
        }
    }

    async fn discover_once(
        &self,
        session: &mut Option<DiscoveredEndpoint>,
    ) -> Result<Value, DiscoveryError> {
        let candidates = {
            let mut rng = rand::thread_rng();
            discovery::generate(&self.discovery, &mut rng)?
        };
        let endpoint = discovery::discover(
            self.prober.as_ref(),
            &candidates,
            self.discovery.attempt_timeout,
            self.discovery.overall_timeout,
        )
        .await?;

        let summary = match session {
            Some(existing) => {
                existing.absorb(endpoint);
                existing.summary()
            }
            None => {
                let summary = endpoint.summary();
                *session = Some(endpoint);
                summary
            }
        };
        Ok(summary)
    }

    /// Re-checks the cached endpoint before reusing it. A dead endpoint is
    /// evicted and discovery runs again in its place.
    async fn recheck_step(
        &self,
        session: &mut Option<DiscoveredEndpoint>,
        log: &mut Vec<LogEntry>,
    ) -> Option<ChainError> {
        debug!(phase = ?ChainPhase::LivenessChecking, "entering phase");
        let Some(current) = session.clone() else {
            return self.discover_step(session, log).await;
        };

        let candidate = EndpointCandidate::new(current.base_url.clone());
        match self
            .prober
            .probe(&candidate, self.discovery.attempt_timeout)
            .await
        {
            ProbeOutcome::Success(hit) => {
                if let Some(endpoint) = session.as_mut() {
                    endpoint.refresh_session(hit.session_uuid().map(str::to_string));
                }
                log.push(LogEntry::success(STEP_LIVENESS, hit.body));
                None
            }
            ProbeOutcome::Failure { reason } => {
                self.evict_and_rediscover(session, log, reason).await
            }
            ProbeOutcome::TimedOut => {
                let reason = "liveness probe timed out".to_string();
                self.evict_and_rediscover(session, log, reason).await
            }
        }
    }

    async fn evict_and_rediscover(
        &self,
        session: &mut Option<DiscoveredEndpoint>,
        log: &mut Vec<LogEntry>,
        reason: String,
    ) -> Option<ChainError> {
        warn!(%reason, "cached agent no longer answers, rediscovering");
        log.push(LogEntry::error(STEP_LIVENESS, reason));
        *session = None;
        self.discover_step(session, log).await
    }

    fn step_failure(
        &self,
        log: &mut Vec<LogEntry>,
        step: &'static str,
        message: String,
    ) -> Option<ChainError> {
        warn!(step, %message, "chain step failed");
        log.push(LogEntry::error(step, message.clone()));
        match self.chain.step_policy {
            StepPolicy::Halt => Some(ChainError::Step { step, message }),
            StepPolicy::Continue => None,
        }
    }
}
