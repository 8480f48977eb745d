//! Configuration for Conduit
//!
//! Loaded from a TOML file with `{{ env.VAR }}` placeholders expanded before
//! deserialization. Every section rejects unknown keys.

#![allow(clippy::must_use_candidate)]

mod env;
pub mod llm;
mod loader;
pub mod telemetry;

use serde::Deserialize;

pub use env::ExpandError;
pub use llm::*;
pub use telemetry::{LogFormat, TelemetryConfig};

/// Top-level Conduit configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// LLM provider configuration
    #[serde(default)]
    pub llm: LlmConfig,
    /// Logging configuration
    #[serde(default)]
    pub telemetry: Option<TelemetryConfig>,
}
