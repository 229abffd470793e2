use std::time::Duration;

use thiserror::Error;
use url::Url;

/// Candidates probed per tier: the first five configured ports locally, and
/// five randomly sampled cloud instances reusing the same ports.
pub const CANDIDATES_PER_TIER: usize = 5;

/// Placeholder substituted with the sampled instance number in the cloud
/// URL template, e.g. `https://m{n}.mordomo.gov.pt`.
pub const INSTANCE_PLACEHOLDER: &str = "{n}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("discovery needs at least {want} candidate ports, got {got}")]
    TooFewPorts { want: usize, got: usize },
    #[error("instance pool of {max} cannot yield {want} distinct cloud instances")]
    InstancePoolTooSmall { max: u32, want: usize },
    #[error("cloud url template '{template}' is missing the {placeholder} placeholder")]
    MissingInstancePlaceholder {
        template: String,
        placeholder: &'static str,
    },
    #[error("invalid candidate url '{url}': {source}")]
    InvalidCandidateUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid backend url '{url}': {source}")]
    InvalidBackendUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Where and how long to look for a running card agent.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Ports the agent may listen on. Only the first [`CANDIDATES_PER_TIER`]
    /// are raced; they are reused verbatim for the cloud tier.
    pub ports: Vec<u16>,
    /// Base URL for same-host probes, without a port.
    pub local_url: String,
    /// URL template for cloud-hosted agent instances. Must contain
    /// [`INSTANCE_PLACEHOLDER`].
    pub cloud_url: String,
    /// Upper bound (inclusive) of the cloud instance numbers to sample from.
    pub max_instances: u32,
    /// How long a single candidate probe may take before it is written off.
    pub attempt_timeout: Duration,
    /// How long the whole discovery race may take before it fails.
    pub overall_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![35153, 43456, 47920, 57379, 64704],
            local_url: "http://127.0.0.1".to_string(),
            cloud_url: "https://m{n}.mordomo.gov.pt".to_string(),
            max_instances: 20,
            attempt_timeout: Duration::from_millis(5000),
            overall_timeout: Duration::from_millis(5000),
        }
    }
}

impl DiscoveryConfig {
    /// Checks that candidate generation can succeed. Run before every
    /// discovery attempt so misconfiguration surfaces immediately instead of
    /// as an endless resample loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ports.len() < CANDIDATES_PER_TIER {
            return Err(ConfigError::TooFewPorts {
                want: CANDIDATES_PER_TIER,
                got: self.ports.len(),
            });
        }
        if (self.max_instances as usize) < CANDIDATES_PER_TIER {
            return Err(ConfigError::InstancePoolTooSmall {
                max: self.max_instances,
                want: CANDIDATES_PER_TIER,
            });
        }
        if !self.cloud_url.contains(INSTANCE_PLACEHOLDER) {
            return Err(ConfigError::MissingInstancePlaceholder {
                template: self.cloud_url.clone(),
                placeholder: INSTANCE_PLACEHOLDER,
            });
        }
        Ok(())
    }
}

/// What the chain does when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPolicy {
    /// Record the failure in the response log and keep going. Matches how a
    /// debugging session normally wants to see every step's behavior at once.
    #[default]
    Continue,
    /// Stop the run at the first failing step.
    Halt,
}

/// Settings for a chain run against the decrypting backend.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub backend_url: Url,
    pub step_policy: StepPolicy,
}

impl ChainConfig {
    pub fn new(backend: &str, step_policy: StepPolicy) -> Result<Self, ConfigError> {
        let raw = if backend.contains("://") {
            backend.to_string()
        } else {
            format!("http://{backend}")
        };
        let backend_url = Url::parse(&raw).map_err(|source| ConfigError::InvalidBackendUrl {
            url: backend.to_string(),
            source,
        })?;
        Ok(Self {
            backend_url,
            step_policy,
        })
    }
}
