pub mod chain;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod telemetry;
