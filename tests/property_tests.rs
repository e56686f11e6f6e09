//! Property-based tests for retry timing and queue bounds

use durastate::runtime::backoff::{RetryDecision, decide_retry, error_transition_delay};
use durastate::runtime::queue::BoundedWorkQueue;
use durastate::runtime::{NextAction, StateType, WorkflowDefinition, WorkflowSettings};
use proptest::prelude::*;
use std::time::Duration;

fn arb_settings() -> impl Strategy<Value = WorkflowSettings> {
    (1u64..10_000, 0u64..1_000_000, 0u32..30).prop_map(|(min, extra, max_retries)| WorkflowSettings {
        max_retries,
        min_error_transition_delay: Duration::from_millis(min),
        max_error_transition_delay: Duration::from_millis(min + extra),
        ..Default::default()
    })
}

fn definition(settings: WorkflowSettings, with_failure_state: bool) -> WorkflowDefinition {
    let builder = WorkflowDefinition::builder("prop")
        .register_state("work", StateType::Start)
        .register_state("done", StateType::End)
        .register_state("compensate", StateType::Manual)
        .register_state("error", StateType::Manual)
        .initial_state("work")
        .error_state("error")
        .settings(settings)
        .on_state("work", |_ctx| async { Ok(NextAction::move_to_state("done", "ok")) });
    let builder = if with_failure_state {
        builder.permit_with_failure("work", "done", "compensate")
    } else {
        builder.permit("work", "done")
    };
    builder.build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Backoff stays inside [min, max] and never shrinks as retries grow.
    #[test]
    fn prop_backoff_bounded_and_monotonic(settings in arb_settings(), now in 0u64..u64::MAX / 2, retries in 0u32..200) {
        let min = settings.min_error_transition_delay.as_millis() as u64;
        let max = settings.max_error_transition_delay.as_millis() as u64;

        let delay = error_transition_delay(&settings, retries, now) - now;
        prop_assert!(delay >= min && delay <= max, "delay {delay} outside [{min}, {max}]");

        let next = error_transition_delay(&settings, retries + 1, now) - now;
        prop_assert!(next >= delay);
    }

    /// Repeated failures leave the state after exactly `max_retries` retries.
    #[test]
    fn prop_retries_terminate(settings in arb_settings(), with_failure_state in any::<bool>()) {
        let max_retries = settings.max_retries;
        let definition = definition(settings, with_failure_state);

        let mut retries = 0;
        let mut now = 0;
        let route = loop {
            match decide_retry(&definition, "work", retries, None, now) {
                RetryDecision::Retry { activation, retries: next } => {
                    prop_assert_eq!(next, retries + 1);
                    prop_assert!(activation > now);
                    retries = next;
                    now = activation;
                }
                other => break other,
            }
            prop_assert!(retries <= max_retries);
        };

        prop_assert_eq!(retries, max_retries);
        let expected = if with_failure_state {
            RetryDecision::FailureState("compensate".to_string())
        } else {
            RetryDecision::ErrorState("error".to_string())
        };
        prop_assert_eq!(route, expected);
    }

    /// A handler-requested activation replaces the backoff while retries remain.
    #[test]
    fn prop_requested_activation_wins(settings in arb_settings(), requested in 0u64..u64::MAX, retries in 0u32..30) {
        let max_retries = settings.max_retries;
        let definition = definition(settings, false);
        let decision = decide_retry(&definition, "work", retries, Some(requested), 0);
        if retries < max_retries {
            prop_assert_eq!(decision, RetryDecision::Retry { activation: requested, retries: retries + 1 });
        } else {
            prop_assert_eq!(decision, RetryDecision::ErrorState("error".to_string()));
        }
    }

    /// The work queue never holds more than its capacity.
    #[test]
    fn prop_queue_never_exceeds_capacity(capacity in 1usize..32, ops in prop::collection::vec(any::<bool>(), 0..200)) {
        let queue = BoundedWorkQueue::new(capacity, capacity / 2);
        let mut accepted = 0usize;
        let mut next = 0i64;
        for offer in ops {
            if offer {
                if queue.offer(next).is_ok() {
                    accepted += 1;
                }
                next += 1;
            } else if let Some(_id) = queue.try_take() {
                accepted -= 1;
            }
            prop_assert!(queue.len() <= capacity);
            prop_assert_eq!(queue.len(), accepted);
        }
    }
}
