//! Per-request supervision of a provider driver
//!
//! One [`Orchestrator`] wraps one driver. Each request runs through the rate
//! gate, the configuration, health and breaker gates, and a retry loop that
//! rotates credentials between attempts. Counters, rolling windows and the
//! breaker live behind a mutex so concurrent requests on the same driver
//! serialize their updates.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use conduit_config::LlmProviderConfig;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::classify::{ErrorKind, classify_error};
use crate::credentials::{CredentialSet, KeyRotation, SharedCredentials};
use crate::error::{LlmError, RequestError};
use crate::health::{BreakerRejection, BreakerSettings, HealthSnapshot, OrchestrationState};
use crate::provider::{Provider, ProviderCapabilities, ProviderRequest};
use crate::retry::{RetryPolicy, sleep_cancellable};
use crate::throttle::RequestWindow;
use crate::types::StreamEvent;

/// Events of one supervised request
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, RequestError>> + Send>>;

/// Retry, pacing and breaker settings for one driver
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub requests_per_minute: u32,
    pub breaker: BreakerSettings,
    pub rotate_on_success: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            requests_per_minute: 60,
            breaker: BreakerSettings::default(),
            rotate_on_success: false,
        }
    }
}

impl OrchestratorSettings {
    /// Settings from a provider configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a duration field does not parse
    pub fn from_config(config: &LlmProviderConfig) -> anyhow::Result<Self> {
        Ok(Self {
            retry: RetryPolicy::try_from(&config.retry)?,
            requests_per_minute: config.rate_limit.requests_per_minute,
            breaker: BreakerSettings::try_from(&config.circuit_breaker)?,
            rotate_on_success: config.rotate_on_success,
        })
    }
}

struct Inner {
    provider: Arc<dyn Provider>,
    credentials: SharedCredentials,
    key_count: usize,
    settings: OrchestratorSettings,
    state: Mutex<OrchestrationState>,
    window: Mutex<RequestWindow>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, OrchestrationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        self.provider.name()
    }

    /// Wait until the sliding window has room for another attempt
    async fn pace(&self, cancel: &CancellationToken) -> Result<(), LlmError> {
        loop {
            let acquired = self
                .window
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .try_acquire(Instant::now());

            let Err(wait) = acquired else {
                return Ok(());
            };

            tracing::debug!(
                provider = self.name(),
                wait_ms = millis(wait),
                "rate limit reached, waiting"
            );
            sleep_cancellable(wait, cancel).await?;
        }
    }

    /// Configuration, health and breaker gates
    fn admit(&self) -> Result<(), LlmError> {
        let missing_key = self.provider.requires_api_key() && self.key_count == 0;
        if !self.provider.is_configured() || missing_key {
            return Err(LlmError::NotConfigured(format!(
                "{}: model or API key missing",
                self.name()
            )));
        }

        let mut state = self.state();
        if !state.healthy {
            return Err(LlmError::Unhealthy {
                provider: self.name().to_owned(),
            });
        }

        match state.breaker.admit(Instant::now()) {
            Ok(()) => Ok(()),
            Err(rejection) => {
                if let BreakerRejection::Open { remaining } = rejection {
                    tracing::debug!(
                        provider = self.name(),
                        remaining_ms = millis(remaining),
                        "circuit breaker rejected request"
                    );
                }
                Err(LlmError::CircuitOpen {
                    provider: self.name().to_owned(),
                })
            }
        }
    }

    /// Wrap a terminal error and account for it
    ///
    /// Aborts are neither failures nor breaker events.
    fn fail(&self, request_id: &str, error: LlmError, count_in_breaker: bool) -> RequestError {
        let classification = classify_error(self.name(), &error);
        let now = Instant::now();

        if classification.kind != ErrorKind::Abort {
            let mut state = self.state();
            if count_in_breaker {
                state.breaker.record_failure(now);
            }
            if matches!(error, LlmError::NotConfigured(_)) {
                state.healthy = false;
            }
            state.record_error(now, error.to_string());
        }

        let error = RequestError::new(self.name(), request_id, &classification, error);
        if error.is_abort() {
            tracing::debug!(provider = self.name(), request_id, "request aborted");
        } else {
            tracing::error!(
                provider = self.name(),
                request_id,
                category = %error.category,
                severity = %error.severity,
                status = error.http_status,
                "request failed: {}",
                error.source
            );
        }
        error
    }
}

/// Records latency and outcome however the request ends, including when the
/// caller drops the stream
struct Completion {
    inner: Arc<Inner>,
    started: Instant,
    success: bool,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let now = Instant::now();
        self.inner
            .state()
            .record_request(now, self.success, now.duration_since(self.started));
    }
}

/// Supervisor for one provider driver
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn Provider>, credentials: CredentialSet, settings: OrchestratorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                key_count: credentials.len(),
                credentials: Arc::new(Mutex::new(credentials)),
                window: Mutex::new(RequestWindow::new(settings.requests_per_minute)),
                state: Mutex::new(OrchestrationState::new(settings.breaker)),
                settings,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn capabilities(&self) -> ProviderCapabilities {
        self.inner.provider.capabilities()
    }

    pub fn health(&self) -> HealthSnapshot {
        self.inner.state().snapshot(Instant::now())
    }

    /// Reject every request until [`Orchestrator::reset_health`]
    pub fn mark_unhealthy(&self) {
        tracing::warn!(provider = self.name(), "provider marked unhealthy");
        self.inner.state().healthy = false;
    }

    /// Mark healthy again and close the breaker
    pub fn reset_health(&self) {
        let mut state = self.inner.state();
        state.healthy = true;
        state.breaker.record_success();
        tracing::info!(provider = self.name(), "provider health reset");
    }

    /// Stream a response, retrying and rotating credentials as needed
    ///
    /// Events are forwarded in driver order. Once any event has reached the
    /// caller, a failure is surfaced instead of retried so output is never
    /// replayed. Cancelling `cancel` stops the in-flight attempt and any
    /// pending wait.
    pub fn send_message_stream(&self, request: ProviderRequest, cancel: CancellationToken) -> ResponseStream {
        let inner = Arc::clone(&self.inner);

        Box::pin(async_stream::stream! {
            let request_id = Uuid::new_v4().to_string();
            let provider = inner.name().to_owned();
            let retry = inner.settings.retry.clone();

            inner.state().counters.requests += 1;
            let mut completion = Completion {
                inner: Arc::clone(&inner),
                started: Instant::now(),
                success: false,
            };
            let mut rotation = KeyRotation::begin(Arc::clone(&inner.credentials), inner.settings.rotate_on_success);

            tracing::debug!(provider, request_id, "request started");

            let mut attempt = 1;
            let mut previous_delay = None;

            loop {
                if let Err(e) = inner.pace(&cancel).await {
                    yield Err(inner.fail(&request_id, e, false));
                    return;
                }

                if let Err(e) = inner.admit() {
                    yield Err(inner.fail(&request_id, e, false));
                    return;
                }

                if cancel.is_cancelled() {
                    inner.state().breaker.release_probe();
                    yield Err(inner.fail(&request_id, LlmError::Aborted, false));
                    return;
                }

                let key = rotation.on_before_attempt(attempt);
                let attempt_cancel = cancel.child_token();
                let _abort_on_drop = attempt_cancel.clone().drop_guard();

                tracing::debug!(provider, request_id, attempt, "attempt started");

                let mut committed = false;
                let failure = match inner.provider.stream(&request, key.as_ref(), attempt_cancel).await {
                    Err(e) => Some(e),
                    Ok(mut events) => {
                        let mut failure = None;
                        while let Some(item) = events.next().await {
                            match item {
                                Ok(event) => {
                                    committed = true;
                                    yield Ok(event);
                                }
                                Err(e) => {
                                    failure = Some(e);
                                    break;
                                }
                            }
                        }
                        failure
                    }
                };

                let Some(error) = failure else {
                    inner.state().breaker.record_success();
                    rotation.on_success();
                    completion.success = true;
                    tracing::debug!(provider, request_id, attempt, "request completed");
                    return;
                };

                if matches!(error, LlmError::Aborted) || cancel.is_cancelled() {
                    inner.state().breaker.release_probe();
                    yield Err(inner.fail(&request_id, LlmError::Aborted, false));
                    return;
                }

                let classification = classify_error(&provider, &error);
                let retryable = classification.retryable && !committed && !matches!(error, LlmError::NotConfigured(_));
                if retryable {
                    rotation.on_retryable_error();
                }

                let keys_exhausted = classification.kind.is_credential_scoped() && rotation.has_tried_all();
                if !retryable || attempt >= retry.max_attempts || keys_exhausted {
                    if committed && classification.retryable {
                        tracing::warn!(provider, request_id, "not retrying after partial output");
                    }
                    yield Err(inner.fail(&request_id, error, true));
                    return;
                }

                let delay = retry.compute_delay(attempt, previous_delay);
                previous_delay = Some(delay);

                tracing::warn!(
                    provider,
                    request_id,
                    attempt,
                    category = %classification.kind,
                    delay_ms = millis(delay),
                    "retrying after error: {error}"
                );

                if let Err(e) = sleep_cancellable(delay, &cancel).await {
                    yield Err(inner.fail(&request_id, e, false));
                    return;
                }

                attempt += 1;
            }
        })
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
