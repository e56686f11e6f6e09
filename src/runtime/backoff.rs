//! Retry timing and exhaustion routing. Pure functions, no I/O.

use super::definition::WorkflowDefinition;
use super::options::WorkflowSettings;

/// Outcome of a failed (or explicitly retried) state execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run the same state again at `activation` with the incremented retry count.
    Retry { activation: u64, retries: u32 },
    /// Retries exhausted; move to the failure state registered for the state.
    FailureState(String),
    /// Retries exhausted and no failure state; move to the definition's error state.
    ErrorState(String),
    /// Exhausted while already in the error state. Terminal, no activation.
    Stop,
}

/// Exponential backoff: `now + clamp(min * 2^(retry_count + 1), min, max)`.
///
/// Overflow clamps to `max`.
pub fn error_transition_delay(settings: &WorkflowSettings, retry_count: u32, now: u64) -> u64 {
    let min = settings.min_error_transition_delay.as_millis() as u64;
    let max = settings.max_error_transition_delay.as_millis() as u64;
    let delay = retry_count
        .checked_add(1)
        .and_then(|exp| 1u64.checked_shl(exp))
        .and_then(|factor| min.checked_mul(factor))
        .unwrap_or(max);
    now.saturating_add(delay.max(min).min(max))
}

/// Activation used to break a busy loop.
pub fn short_transition_activation(settings: &WorkflowSettings, now: u64) -> u64 {
    now.saturating_add(settings.short_transition_delay.as_millis() as u64)
}

/// Where an instance goes once `state` has no retries left.
pub fn exhaustion_route(definition: &WorkflowDefinition, state: &str) -> RetryDecision {
    if let Some(failure) = definition.failure_state_of(state) {
        return RetryDecision::FailureState(failure.to_string());
    }
    if state == definition.error_state() {
        RetryDecision::Stop
    } else {
        RetryDecision::ErrorState(definition.error_state().to_string())
    }
}

/// Decide what happens after a failed attempt in `state`.
///
/// `requested` is an activation asked for by the handler (`RetryAfter`); when
/// absent the exponential backoff applies.
pub fn decide_retry(
    definition: &WorkflowDefinition,
    state: &str,
    retries: u32,
    requested: Option<u64>,
    now: u64,
) -> RetryDecision {
    let settings = definition.settings();
    if retries >= settings.max_retries {
        return exhaustion_route(definition, state);
    }
    let activation = requested.unwrap_or_else(|| error_transition_delay(settings, retries, now));
    RetryDecision::Retry {
        activation,
        retries: retries + 1,
    }
}
