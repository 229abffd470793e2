use clap::{Args, Parser, builder::BoolishValueParser};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ChainConfig, ConfigError, DiscoveryConfig, StepPolicy};
use crate::telemetry::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "ccprobe",
    about = "💳 Find a running citizen-card agent and exercise its read/decrypt chain",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "CCPROBE_BACKEND_URL",
        default_value = "http://127.0.0.1:8000",
        help = "Base URL for the decrypting backend"
    )]
    pub backend_url: String,

    #[arg(
        long = "halt-on-error",
        env = "CCPROBE_HALT_ON_ERROR",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new(),
        value_name = "BOOL",
        help = "Stop the chain at the first failing step instead of logging and continuing"
    )]
    pub halt_on_error: Option<bool>,

    #[command(flatten)]
    pub discovery: DiscoveryArgs,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    #[arg(
        long,
        env = "CCPROBE_PORTS",
        value_delimiter = ',',
        default_value = "35153,43456,47920,57379,64704",
        help = "Candidate ports, probed locally and reused for the cloud tier"
    )]
    pub ports: Vec<u16>,

    #[arg(
        long = "local-url",
        env = "CCPROBE_LOCAL_URL",
        default_value = "http://127.0.0.1",
        help = "Base URL for same-host agent probes, without a port"
    )]
    pub local_url: String,

    #[arg(
        long = "cloud-url",
        env = "CCPROBE_CLOUD_URL",
        default_value = "https://m{n}.mordomo.gov.pt",
        help = "Cloud agent URL template; {n} is replaced with the sampled instance number"
    )]
    pub cloud_url: String,

    #[arg(
        long = "max-instances",
        env = "CCPROBE_MAX_INSTANCES",
        default_value_t = 20,
        help = "Upper bound of the cloud instance numbers sampled per attempt"
    )]
    pub max_instances: u32,

    #[arg(
        long = "attempt-timeout-ms",
        env = "CCPROBE_ATTEMPT_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5000,
        help = "How long a single liveness probe may take"
    )]
    pub attempt_timeout_ms: u64,

    #[arg(
        long = "overall-timeout-ms",
        env = "CCPROBE_OVERALL_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 5000,
        help = "How long the whole discovery race may take"
    )]
    pub overall_timeout_ms: u64,
}

impl DiscoveryArgs {
    pub fn to_config(&self) -> Result<DiscoveryConfig, ConfigError> {
        let config = DiscoveryConfig {
            ports: self.ports.clone(),
            local_url: self.local_url.clone(),
            cloud_url: self.cloud_url.clone(),
            max_instances: self.max_instances,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            overall_timeout: Duration::from_millis(self.overall_timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CCPROBE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CCPROBE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn step_policy(&self) -> StepPolicy {
        if self.halt_on_error.unwrap_or(false) {
            StepPolicy::Halt
        } else {
            StepPolicy::Continue
        }
    }

    pub fn chain_config(&self) -> Result<ChainConfig, ConfigError> {
        ChainConfig::new(&self.backend_url, self.step_policy())
    }
}
