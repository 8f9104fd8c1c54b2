//! Call pacing for external enrichment providers.
//!
//! [`RatePacer`] combines a minimum-delay rate limiter with a consecutive-
//! failure circuit breaker. It is a single-caller, process-lifetime object:
//! each enrichment run owns its own instance and drives every gated call
//! through it. No internal synchronization — the orchestrator is strictly
//! sequential.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use chatcorpus_shared::EnrichmentSettings;

/// Pacing parameters.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    /// Minimum delay between calls.
    pub min_delay: Duration,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open once tripped.
    pub cooldown: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl From<&EnrichmentSettings> for PacerConfig {
    fn from(settings: &EnrichmentSettings) -> Self {
        Self {
            min_delay: Duration::from_millis(settings.rate_limit_ms),
            failure_threshold: settings.failure_threshold,
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }
}

/// Rate limiter and circuit breaker state.
///
/// Circuit transitions: Closed → (failure streak ≥ threshold) → Open →
/// (cool-down elapses) → Closed, with the failure counter reset on the
/// transition back to Closed.
#[derive(Debug)]
pub struct RatePacer {
    config: PacerConfig,
    last_call: Option<Instant>,
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl RatePacer {
    /// Create a pacer with the given parameters.
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            last_call: None,
            consecutive_failures: 0,
            open_until: None,
        }
    }

    /// How long the caller must wait before the next call. Zero when the
    /// minimum delay has already elapsed (or no call has been made yet).
    pub fn should_rate_limit(&self) -> Duration {
        match self.last_call {
            Some(last) => self.config.min_delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Mark "a call is being made now".
    pub fn record_call(&mut self) {
        self.last_call = Some(Instant::now());
    }

    /// A gated call succeeded; the failure streak ends.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// A gated call failed. At the configured threshold the circuit opens
    /// for the cool-down period.
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        debug!(
            consecutive_failures = self.consecutive_failures,
            threshold = self.config.failure_threshold,
            "provider failure recorded"
        );
        if self.consecutive_failures >= self.config.failure_threshold {
            self.open_until = Some(Instant::now() + self.config.cooldown);
            warn!(
                cooldown_ms = self.config.cooldown.as_millis(),
                "circuit breaker opened"
            );
        }
    }

    /// Whether the circuit is currently open. An elapsed cool-down closes the
    /// circuit and resets the failure counter.
    pub fn is_circuit_open(&mut self) -> bool {
        match self.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                debug!("circuit breaker closed after cool-down");
                false
            }
            None => false,
        }
    }

    /// Current failure streak (for logging and tests).
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
