//! Per-driver health: circuit breaker, counters and rolling windows
//!
//! Everything here is plain state mutated under the orchestrator's lock.
//! Transitions are evaluated lazily when a request arrives; there is no
//! background timer.

use std::collections::VecDeque;
use std::time::Duration;

use conduit_config::CircuitBreakerConfig;
use jiff::Timestamp;
use serde::Serialize;
use tokio::time::Instant;

/// Span covered by the rolling windows
pub const WINDOW: Duration = Duration::from_secs(5 * 60);
const MAX_RECENT_REQUESTS: usize = 200;
const MAX_RECENT_ERRORS: usize = 10;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Requests flow through
    Closed,
    /// Requests are rejected until the cooldown elapses
    Open,
    /// A limited number of probes may test recovery
    HalfOpen,
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }
}

impl TryFrom<&CircuitBreakerConfig> for BreakerSettings {
    type Error = anyhow::Error;

    fn try_from(config: &CircuitBreakerConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: config.cooldown()?,
            half_open_max_attempts: config.half_open_max_attempts.max(1),
        })
    }
}

/// Why the breaker refused an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    /// Still cooling down
    Open { remaining: Duration },
    /// Too many concurrent probes; the breaker re-opened
    ProbeLimit,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_attempts: u32,
}

impl CircuitBreaker {
    pub const fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_attempts: 0,
        }
    }

    pub const fn state(&self) -> CircuitState {
        self.state
    }

    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Decide whether an attempt may proceed
    ///
    /// An open breaker whose cooldown has elapsed moves to half-open. Each
    /// admitted half-open attempt counts as a probe.
    pub fn admit(&mut self, now: Instant) -> Result<(), BreakerRejection> {
        if self.state == CircuitState::Open {
            let elapsed = self.last_failure.map_or(self.settings.cooldown, |at| now.duration_since(at));
            if elapsed < self.settings.cooldown {
                return Err(BreakerRejection::Open {
                    remaining: self.settings.cooldown - elapsed,
                });
            }
            self.state = CircuitState::HalfOpen;
            self.half_open_attempts = 0;
            tracing::warn!(cooldown_ms = millis(self.settings.cooldown), "circuit breaker half-open");
        }

        if self.state == CircuitState::HalfOpen {
            self.half_open_attempts += 1;
            if self.half_open_attempts > self.settings.half_open_max_attempts {
                self.open(now);
                return Err(BreakerRejection::ProbeLimit);
            }
        }

        Ok(())
    }

    /// Give back a probe slot for an attempt that ended without a verdict
    pub fn release_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_attempts = self.half_open_attempts.saturating_sub(1);
        }
    }

    pub fn record_success(&mut self) {
        if self.state != CircuitState::Closed {
            tracing::warn!(previous = %self.state, "circuit breaker closed");
        }
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_attempts = 0;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        let trip = self.state == CircuitState::HalfOpen || self.failure_count >= self.settings.failure_threshold;
        if trip && self.state != CircuitState::Open {
            self.open(now);
        }
    }

    fn open(&mut self, now: Instant) {
        tracing::warn!(
            failures = self.failure_count,
            previous = %self.state,
            cooldown_ms = millis(self.settings.cooldown),
            "circuit breaker opened"
        );
        self.state = CircuitState::Open;
        self.last_failure = Some(now);
        self.half_open_attempts = 0;
    }
}

/// Bounded, time-trimmed ring
#[derive(Debug)]
struct Window<T> {
    entries: VecDeque<(Instant, T)>,
    cap: usize,
}

impl<T> Window<T> {
    const fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
        }
    }

    fn push(&mut self, now: Instant, value: T) {
        self.entries.push_back((now, value));
        self.trim(now);
    }

    fn trim(&mut self, now: Instant) {
        while self
            .entries
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > WINDOW)
        {
            self.entries.pop_front();
        }
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    fn live(&self, now: Instant) -> impl Iterator<Item = &T> {
        self.entries
            .iter()
            .filter(move |(at, _)| now.duration_since(*at) <= WINDOW)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestSample {
    success: bool,
    latency: Duration,
}

#[derive(Debug, Clone)]
struct ErrorSample {
    timestamp: Timestamp,
    message: String,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Counters {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
}

/// Everything the orchestrator tracks about one driver
#[derive(Debug)]
pub struct OrchestrationState {
    pub healthy: bool,
    pub breaker: CircuitBreaker,
    pub counters: Counters,
    pub last_error: Option<String>,
    recent_requests: Window<RequestSample>,
    recent_errors: Window<ErrorSample>,
}

impl OrchestrationState {
    pub const fn new(breaker: BreakerSettings) -> Self {
        Self {
            healthy: true,
            breaker: CircuitBreaker::new(breaker),
            counters: Counters {
                requests: 0,
                successes: 0,
                failures: 0,
                total_latency_ms: 0,
            },
            last_error: None,
            recent_requests: Window::new(MAX_RECENT_REQUESTS),
            recent_errors: Window::new(MAX_RECENT_ERRORS),
        }
    }

    /// Account for a finished request
    pub fn record_request(&mut self, now: Instant, success: bool, latency: Duration) {
        if success {
            self.counters.successes += 1;
        }
        self.counters.total_latency_ms = self.counters.total_latency_ms.saturating_add(millis(latency));
        self.recent_requests.push(now, RequestSample { success, latency });
    }

    /// Account for a surfaced failure
    pub fn record_error(&mut self, now: Instant, message: String) {
        self.counters.failures += 1;
        self.last_error = Some(message.clone());
        self.recent_errors.push(
            now,
            ErrorSample {
                timestamp: Timestamp::now(),
                message,
            },
        );
    }

    pub fn snapshot(&self, now: Instant) -> HealthSnapshot {
        let (count, successes, latency) = self
            .recent_requests
            .live(now)
            .fold((0_u32, 0_u32, Duration::ZERO), |(n, ok, total), sample| {
                (n + 1, ok + u32::from(sample.success), total + sample.latency)
            });

        let (success_rate, avg_latency_ms) = if count == 0 {
            (1.0, 0.0)
        } else {
            (
                f64::from(successes) / f64::from(count),
                latency.as_secs_f64() * 1000.0 / f64::from(count),
            )
        };

        HealthSnapshot {
            healthy: self.healthy,
            breaker_state: self.breaker.state(),
            failure_count: self.breaker.failure_count(),
            counters: self.counters,
            rolling_window: RollingWindow {
                window_secs: WINDOW.as_secs(),
                count,
                success_rate,
                avg_latency_ms,
            },
            recent_errors: self
                .recent_errors
                .live(now)
                .map(|e| RecentError {
                    timestamp: e.timestamp.to_string(),
                    message: e.message.clone(),
                })
                .collect(),
            last_error: self.last_error.clone(),
        }
    }
}

/// Serializable health report for dashboards
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub breaker_state: CircuitState,
    pub failure_count: u32,
    pub counters: Counters,
    pub rolling_window: RollingWindow,
    pub recent_errors: Vec<RecentError>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollingWindow {
    pub window_secs: u64,
    pub count: u32,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentError {
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub message: String,
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            half_open_max_attempts: 1,
        }
    }

    fn tripped(now: Instant) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::new(settings());
        for _ in 0..3 {
            breaker.record_failure(now);
        }
        breaker
    }

    #[test]
    fn closed_breaker_admits() {
        let mut breaker = CircuitBreaker::new(settings());
        assert!(breaker.admit(Instant::now()).is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failures_below_threshold_stay_closed() {
        let now = Instant::now();
        let mut breaker = CircuitBreaker::new(settings());
        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.admit(now).is_ok());
    }

    #[test]
    fn threshold_opens_and_rejects_during_cooldown() {
        let now = Instant::now();
        let mut breaker = tripped(now);
        assert_eq!(breaker.state(), CircuitState::Open);

        let rejection = breaker.admit(now + Duration::from_secs(10)).unwrap_err();
        assert_eq!(
            rejection,
            BreakerRejection::Open {
                remaining: Duration::from_secs(20)
            }
        );
    }

    #[test]
    fn cooldown_allows_single_probe() {
        let now = Instant::now();
        let mut breaker = tripped(now);
        let later = now + Duration::from_secs(30);

        assert!(breaker.admit(later).is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert_eq!(breaker.admit(later).unwrap_err(), BreakerRejection::ProbeLimit);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn successful_probe_closes() {
        let now = Instant::now();
        let mut breaker = tripped(now);
        breaker.admit(now + Duration::from_secs(31)).unwrap();

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn failed_probe_reopens_with_fresh_cooldown() {
        let now = Instant::now();
        let mut breaker = tripped(now);
        let probe_at = now + Duration::from_secs(31);
        breaker.admit(probe_at).unwrap();

        breaker.record_failure(probe_at);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.admit(probe_at + Duration::from_secs(29)).is_err());
        assert!(breaker.admit(probe_at + Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn released_probe_can_be_reused() {
        let now = Instant::now();
        let mut breaker = tripped(now);
        let later = now + Duration::from_secs(30);

        breaker.admit(later).unwrap();
        breaker.release_probe();
        assert!(breaker.admit(later).is_ok());
    }

    #[test]
    fn windows_trim_by_age_and_cap() {
        let start = Instant::now();
        let mut state = OrchestrationState::new(settings());

        for i in 0..250 {
            state.record_request(start, i % 2 == 0, Duration::from_millis(10));
        }
        let snapshot = state.snapshot(start);
        assert_eq!(snapshot.rolling_window.count, 200);
        assert!((snapshot.rolling_window.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((snapshot.rolling_window.avg_latency_ms - 10.0).abs() < 1e-9);

        let later = start + WINDOW + Duration::from_secs(1);
        state.record_request(later, true, Duration::from_millis(30));
        let snapshot = state.snapshot(later);
        assert_eq!(snapshot.rolling_window.count, 1);
        assert_eq!(snapshot.counters.successes, 126);
    }

    #[test]
    fn recent_errors_keep_last_ten() {
        let now = Instant::now();
        let mut state = OrchestrationState::new(settings());
        for i in 0..15 {
            state.record_error(now, format!("e{i}"));
        }

        let snapshot = state.snapshot(now);
        assert_eq!(snapshot.recent_errors.len(), 10);
        assert_eq!(snapshot.recent_errors[0].message, "e5");
        assert_eq!(snapshot.last_error.as_deref(), Some("e14"));
        assert_eq!(snapshot.counters.failures, 15);
    }

    #[test]
    fn snapshot_serializes_breaker_state_in_caps() {
        let state = OrchestrationState::new(settings());
        let value = serde_json::to_value(state.snapshot(Instant::now())).unwrap();
        assert_eq!(value["breakerState"], "CLOSED");
        assert_eq!(value["rollingWindow"]["windowSecs"], 300);
    }
}
