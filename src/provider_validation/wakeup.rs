use super::{create_claimed, new_instance, park_commit};
use crate::provider_validations::ProviderFactory;
use crate::{ActionType, ExternalChange, InstanceStatus};

/// Run all wakeup and external change tests
pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_wakeup_idle_instance(factory).await;
    test_wakeup_respects_claim_and_states(factory).await;
    test_external_change_applies_to_unclaimed_only(factory).await;
}

pub async fn test_wakeup_idle_instance<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing wakeup: parked instance");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "parked", 1).await;
    provider.persist(park_commit(id, 1, "waiting")).await.unwrap();
    assert!(!provider.claim(id, 1).await.unwrap());

    assert!(provider.wakeup_if_idle(id, &[]).await.unwrap());
    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert!(instance.next_activation.unwrap() <= provider.now());
    assert!(provider.claim(id, 1).await.unwrap());
    tracing::info!("✓ Test passed: parked instance woken");
}

pub async fn test_wakeup_respects_claim_and_states<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing wakeup: claim and expected states");
    let provider = factory.create_provider().await;
    let id = provider
        .create_instance(new_instance("later").with_next_activation(provider.now() + 3_600_000))
        .await
        .unwrap();

    assert!(!provider.wakeup_if_idle(id, &["other".to_string()]).await.unwrap());
    assert!(
        provider
            .wakeup_if_idle(id, &["other".to_string(), "begin".to_string()])
            .await
            .unwrap()
    );
    assert!(!provider.wakeup_if_idle(id, &[]).await.unwrap(), "already due");

    assert!(provider.claim(id, 3).await.unwrap());
    let mut commit = park_commit(id, 3, "begin");
    commit.executor_id = Some(3);
    provider.persist(commit).await.unwrap();
    assert!(!provider.wakeup_if_idle(id, &[]).await.unwrap(), "claimed instance untouched");

    assert!(!provider.wakeup_if_idle(999_999, &[]).await.unwrap());
    tracing::info!("✓ Test passed: wakeup conditions verified");
}

pub async fn test_external_change_applies_to_unclaimed_only<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing external change");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "manual", 1).await;
    let mut commit = park_commit(id, 1, "review");
    commit.status = InstanceStatus::Manual;
    commit.retries = 4;
    commit.state_variables.insert("kept".to_string(), "yes".to_string());
    provider.persist(commit).await.unwrap();

    let mut change = ExternalChange {
        state: Some("approved".to_string()),
        state_text: Some("approved by operator".to_string()),
        next_activation: Some(provider.now()),
        ..Default::default()
    };
    change.state_variables.insert("approver".to_string(), "ops".to_string());
    assert!(provider.apply_external_change(id, change).await.unwrap());

    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "approved");
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.retries, 0);
    assert_eq!(instance.state_variables.get("kept").map(String::as_str), Some("yes"));
    assert_eq!(instance.state_variables.get("approver").map(String::as_str), Some("ops"));

    let actions = provider.list_actions(id).await.unwrap();
    let last = actions.last().unwrap();
    assert_eq!(last.action_type, ActionType::ExternalChange);
    assert_eq!(last.state, "approved");

    assert!(provider.claim(id, 2).await.unwrap());
    assert!(!provider.apply_external_change(id, ExternalChange::default()).await.unwrap());
    assert!(
        !provider
            .apply_external_change(999_999, ExternalChange::default())
            .await
            .unwrap()
    );
    tracing::info!("✓ Test passed: external change verified");
}
