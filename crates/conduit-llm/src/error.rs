use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::classify::{ErrorClassification, ErrorKind};

/// Errors raised while talking to a single provider
#[derive(Debug, Error)]
pub enum LlmError {
    /// Upstream answered with a non-success status
    #[error("provider returned {status}: {body}")]
    Upstream {
        /// HTTP status code
        status: u16,
        /// Leading fragment of the response body
        body: String,
    },

    /// Request never reached the provider or the connection broke
    #[error("network error: {0}")]
    Transport(String),

    /// Stream framing or payload could not be decoded
    #[error("stream error: {0}")]
    Streaming(String),

    /// Per-request deadline elapsed
    #[error("request timeout after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Caller cancelled the request
    #[error("request aborted")]
    Aborted,

    /// Driver lacks a model or credentials
    #[error("provider not configured: {0}")]
    NotConfigured(String),

    /// Breaker rejected the attempt
    #[error("circuit breaker open for provider {provider}")]
    CircuitOpen { provider: String },

    /// Provider was marked unhealthy and awaits a manual reset
    #[error("provider {provider} is marked unhealthy")]
    Unhealthy { provider: String },

    /// Caller supplied a request the provider cannot express
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unexpected internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl LlmError {
    /// Map a transport failure from `reqwest`
    pub(crate) fn transport(error: &reqwest::Error) -> Self {
        if error.is_decode() || error.is_body() {
            Self::Streaming(format!("failed to read response body: {error}"))
        } else {
            Self::Transport(format!("connection failed: {error}"))
        }
    }

    /// Status code carried by the error, if any
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(error: reqwest::Error) -> Self {
        Self::transport(&error)
    }
}

/// How seriously the host should treat a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    /// Driver is unusable until a manual health reset
    Critical,
}

/// Error surfaced to callers of the orchestration core
///
/// Retries and credential rotation happen below this type; a caller sees at
/// most one of these per request.
#[derive(Debug, Error)]
#[error("{provider} request {request_id} failed ({category}): {source}")]
pub struct RequestError {
    pub category: ErrorKind,
    pub severity: Severity,
    pub provider: String,
    pub request_id: String,
    pub http_status: Option<u16>,
    pub user_message: String,
    #[source]
    pub source: LlmError,
}

impl RequestError {
    pub(crate) fn new(
        provider: &str,
        request_id: &str,
        classification: &ErrorClassification,
        source: LlmError,
    ) -> Self {
        let severity = match source {
            LlmError::NotConfigured(_) => Severity::Critical,
            _ => classification.kind.severity(),
        };

        Self {
            category: classification.kind,
            severity,
            provider: provider.to_owned(),
            request_id: request_id.to_owned(),
            http_status: classification.http_status,
            user_message: classification.kind.user_message().to_owned(),
            source,
        }
    }

    /// Whether the request ended because the caller cancelled it
    pub const fn is_abort(&self) -> bool {
        matches!(self.category, ErrorKind::Abort)
    }
}

impl ErrorKind {
    /// Default severity for the category
    pub const fn severity(self) -> Severity {
        match self {
            Self::Auth => Severity::High,
            Self::Client | Self::Abort => Severity::Low,
            Self::RateLimit
            | Self::Quota
            | Self::Server
            | Self::Network
            | Self::Timeout
            | Self::StreamParse
            | Self::Unknown => Severity::Medium,
        }
    }

    /// Message suitable for showing to an end user
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Auth => "The AI provider rejected the configured credentials. Review the API keys in your configuration.",
            Self::RateLimit | Self::Quota => "The AI provider is rate limiting requests. Please try again later.",
            Self::Network | Self::Timeout => {
                "Could not reach the AI provider. Check your network connection and try again."
            }
            Self::Abort => "The request was cancelled.",
            Self::Client => "The AI provider rejected the request as invalid.",
            Self::Server | Self::StreamParse | Self::Unknown => {
                "The AI service returned an error. Please try again in a moment."
            }
        }
    }
}
