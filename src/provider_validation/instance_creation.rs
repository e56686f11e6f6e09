use super::{TEST_TYPE, new_instance};
use crate::provider_validations::ProviderFactory;
use crate::{DEFAULT_EXECUTOR_GROUP, InstanceStatus, NewWorkflowInstance};

/// Run all instance creation tests
pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_create_is_idempotent(factory).await;
    test_create_requires_state(factory).await;
    test_create_defaults(factory).await;
}

/// Creating the same (type, external id, group) twice returns the first row.
pub async fn test_create_is_idempotent<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instance creation: idempotent on external id");
    let provider = factory.create_provider().await;

    let first = provider.create_instance(new_instance("order-1")).await.unwrap();
    let second = provider
        .create_instance(new_instance("order-1").with_variable("ignored", "yes"))
        .await
        .unwrap();
    assert_eq!(first, second);
    let stored = provider.load_instance(first).await.unwrap().unwrap();
    assert!(stored.state_variables.is_empty(), "duplicate create must not modify the row");

    // Different group is a different instance
    let mut other_group = new_instance("order-1");
    other_group.executor_group = Some("other".to_string());
    let third = provider.create_instance(other_group).await.unwrap();
    assert_ne!(first, third);
    tracing::info!("✓ Test passed: idempotent creation verified");
}

pub async fn test_create_requires_state<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instance creation: state required");
    let provider = factory.create_provider().await;
    let err = provider
        .create_instance(NewWorkflowInstance::new(TEST_TYPE))
        .await
        .unwrap_err();
    assert!(!err.is_retryable());
    tracing::info!("✓ Test passed: unresolved state rejected");
}

pub async fn test_create_defaults<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing instance creation: defaults");
    let provider = factory.create_provider().await;
    let before = provider.now();

    let a = provider
        .create_instance(NewWorkflowInstance::new(TEST_TYPE).with_state("begin"))
        .await
        .unwrap();
    let b = provider
        .create_instance(NewWorkflowInstance::new(TEST_TYPE).with_state("begin"))
        .await
        .unwrap();
    assert_ne!(a, b, "generated external ids must be unique");

    let instance = provider.load_instance(a).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Created);
    assert_eq!(instance.executor_group, DEFAULT_EXECUTOR_GROUP);
    assert_eq!(instance.executor_id, None);
    assert_eq!(instance.retries, 0);
    assert_eq!(instance.started, None);
    assert!(!instance.external_id.is_empty());
    assert!(instance.next_activation.unwrap() >= before);
    tracing::info!("✓ Test passed: creation defaults verified");
}
