//! Upstream error classification
//!
//! Classification is split in two steps. Any error first becomes an
//! [`ErrorShape`] (name, message, status, status text), then [`classify`]
//! walks a fixed rule table over that shape. The first matching rule wins.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::LlmError;

static STATUS_IN_TEXT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(4\d{2}|5\d{2})\b").expect("status regex must compile"));

/// Error taxonomy shared by every provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    Auth,
    Quota,
    Network,
    Timeout,
    Server,
    StreamParse,
    Abort,
    Client,
    Unknown,
}

impl ErrorKind {
    /// Whether a fresh credential can change the outcome
    pub const fn is_credential_scoped(self) -> bool {
        matches!(self, Self::Auth | Self::RateLimit | Self::Quota)
    }
}

/// Result of classifying one error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorClassification {
    pub kind: ErrorKind,
    pub retryable: bool,
    pub http_status: Option<u16>,
    pub reason: String,
    pub raw: String,
}

/// Provider-neutral view of an error
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorShape {
    /// Marker name such as `AbortError`
    pub name: Option<String>,
    pub message: String,
    pub status: Option<u16>,
    pub status_text: Option<String>,
}

impl ErrorShape {
    /// Plain message without status
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// Normalize a JSON error value
    ///
    /// Understands `{"error": {"message", "status", "code"}}`,
    /// `{"status", "statusText"}` and `{"name", "message"}` objects, and bare
    /// strings.
    pub fn from_value(value: &Value) -> Self {
        if let Some(text) = value.as_str() {
            return Self::message(text);
        }

        let nested = value.get("error").filter(|e| e.is_object()).unwrap_or(value);
        let text = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(ToOwned::to_owned);
        let code = |v: &Value, key: &str| {
            v.get(key)
                .and_then(Value::as_u64)
                .and_then(|n| u16::try_from(n).ok())
        };

        let message = text(nested, "message")
            .or_else(|| value.get("error").and_then(Value::as_str).map(ToOwned::to_owned))
            .unwrap_or_default();

        Self {
            name: text(value, "name"),
            message,
            status: code(value, "status").or_else(|| code(nested, "code")).or_else(|| code(nested, "status")),
            status_text: text(value, "statusText").or_else(|| text(nested, "status")),
        }
    }

    /// Status from the structured field or, failing that, from the message
    pub fn effective_status(&self) -> Option<u16> {
        self.status.or_else(|| {
            STATUS_IN_TEXT
                .captures(&self.message)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
    }

    fn haystack(&self) -> String {
        let mut text = self.message.to_lowercase();
        if let Some(status_text) = &self.status_text {
            text.push(' ');
            text.push_str(&status_text.to_lowercase().replace('_', " "));
        }
        text
    }
}

impl From<&LlmError> for ErrorShape {
    fn from(error: &LlmError) -> Self {
        match error {
            LlmError::Upstream { status, body } => {
                let parsed = serde_json::from_str::<Value>(body).ok().map(|v| Self::from_value(&v));
                let canonical = reqwest::StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .map(ToOwned::to_owned);

                match parsed {
                    Some(shape) if !shape.message.is_empty() => Self {
                        status: Some(*status),
                        status_text: shape.status_text.or(canonical),
                        ..shape
                    },
                    _ => Self {
                        name: None,
                        message: body.clone(),
                        status: Some(*status),
                        status_text: canonical,
                    },
                }
            }
            LlmError::Aborted => Self {
                name: Some("AbortError".to_owned()),
                message: error.to_string(),
                ..Self::default()
            },
            other => Self::message(other.to_string()),
        }
    }
}

enum StatusMatch {
    Never,
    AnyOf(&'static [u16]),
    Between(u16, u16),
}

impl StatusMatch {
    fn matches(&self, status: Option<u16>) -> bool {
        match (self, status) {
            (Self::AnyOf(codes), Some(status)) => codes.contains(&status),
            (Self::Between(low, high), Some(status)) => (*low..=*high).contains(&status),
            _ => false,
        }
    }
}

struct Rule {
    kind: ErrorKind,
    retryable: bool,
    names: &'static [&'static str],
    status: StatusMatch,
    needles: &'static [&'static str],
    reason: &'static str,
}

impl Rule {
    fn matches(&self, shape: &ErrorShape, status: Option<u16>, haystack: &str) -> bool {
        shape.name.as_deref().is_some_and(|name| self.names.contains(&name))
            || self.status.matches(status)
            || self.needles.iter().any(|needle| haystack.contains(needle))
    }
}

static RULES: &[Rule] = &[
    Rule {
        kind: ErrorKind::Abort,
        retryable: false,
        names: &["AbortError"],
        status: StatusMatch::Never,
        needles: &["abort"],
        reason: "request was cancelled",
    },
    Rule {
        kind: ErrorKind::Timeout,
        retryable: true,
        names: &["TimeoutError"],
        status: StatusMatch::Never,
        needles: &["timeout"],
        reason: "request timed out",
    },
    Rule {
        kind: ErrorKind::RateLimit,
        retryable: true,
        names: &[],
        status: StatusMatch::AnyOf(&[429]),
        needles: &["rate limit"],
        reason: "rate limited by provider",
    },
    Rule {
        kind: ErrorKind::Quota,
        retryable: true,
        names: &[],
        status: StatusMatch::Never,
        needles: &["quota", "exceeded"],
        reason: "provider quota exceeded",
    },
    Rule {
        kind: ErrorKind::Auth,
        retryable: true,
        names: &[],
        status: StatusMatch::AnyOf(&[401, 403]),
        needles: &["unauthorized", "forbidden", "invalid api key", "api key"],
        reason: "credential rejected",
    },
    Rule {
        kind: ErrorKind::Server,
        retryable: true,
        names: &[],
        status: StatusMatch::Between(500, 599),
        needles: &["service unavailable", "overloaded", "server error"],
        reason: "provider server error",
    },
    Rule {
        kind: ErrorKind::Network,
        retryable: true,
        names: &[],
        status: StatusMatch::Never,
        needles: &["network", "failed to fetch", "connection"],
        reason: "network failure",
    },
    Rule {
        kind: ErrorKind::StreamParse,
        retryable: true,
        names: &[],
        status: StatusMatch::Never,
        needles: &["failed to parse stream", "stream error", "parsing error", "malformed response"],
        reason: "response stream could not be decoded",
    },
    Rule {
        kind: ErrorKind::Client,
        retryable: false,
        names: &[],
        status: StatusMatch::Between(400, 499),
        needles: &[],
        reason: "request rejected by provider",
    },
];

/// Classify a normalized error shape
pub fn classify(provider: &str, shape: &ErrorShape) -> ErrorClassification {
    let status = shape.effective_status();
    let haystack = shape.haystack();

    let (kind, retryable, reason) = RULES
        .iter()
        .find(|rule| rule.matches(shape, status, &haystack))
        .map_or((ErrorKind::Unknown, false, "unrecognized error"), |rule| {
            (rule.kind, rule.retryable, rule.reason)
        });

    tracing::debug!(provider, category = %kind, retryable, status, "classified error");

    ErrorClassification {
        kind,
        retryable,
        http_status: status,
        reason: reason.to_owned(),
        raw: shape.message.clone(),
    }
}

/// Normalize and classify a driver error
pub fn classify_error(provider: &str, error: &LlmError) -> ErrorClassification {
    classify(provider, &ErrorShape::from(error))
}
