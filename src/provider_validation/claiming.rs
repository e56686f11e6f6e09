use super::{create_claimed, new_instance};
use crate::provider_validations::ProviderFactory;
use crate::{DEFAULT_EXECUTOR_GROUP, InstanceStatus};
use std::sync::Arc;

/// Run all claiming tests
pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_claim_exclusive(factory).await;
    test_claim_only_when_due(factory).await;
    test_poll_ordering_and_groups(factory).await;
    test_release_by_owner_only(factory).await;
    test_concurrent_claims_single_winner(factory).await;
}

pub async fn test_claim_exclusive<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing claiming: exclusive claim");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "a", 1).await;

    assert!(!provider.claim(id, 2).await.unwrap());
    assert!(!provider.claim(id, 1).await.unwrap(), "re-claiming an owned row must fail");
    assert_eq!(provider.load_instance(id).await.unwrap().unwrap().executor_id, Some(1));
    assert!(
        provider
            .poll_claimable_ids(DEFAULT_EXECUTOR_GROUP, 10)
            .await
            .unwrap()
            .is_empty()
    );
    tracing::info!("✓ Test passed: exclusive claim verified");
}

pub async fn test_claim_only_when_due<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing claiming: activation must be due");
    let provider = factory.create_provider().await;
    let future = provider
        .create_instance(new_instance("later").with_next_activation(provider.now() + 3_600_000))
        .await
        .unwrap();
    assert!(!provider.claim(future, 1).await.unwrap());

    // Parked instance (no activation)
    let parked = create_claimed(provider.as_ref(), "parked", 1).await;
    provider
        .persist(super::park_commit(parked, 1, "waiting"))
        .await
        .unwrap();
    assert!(!provider.claim(parked, 1).await.unwrap());
    tracing::info!("✓ Test passed: only due instances claimable");
}

pub async fn test_poll_ordering_and_groups<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing claiming: poll ordering and group isolation");
    let provider = factory.create_provider().await;
    let now = provider.now();

    let old = provider
        .create_instance(new_instance("old").with_next_activation(now - 2_000))
        .await
        .unwrap();
    let newer = provider
        .create_instance(new_instance("newer").with_next_activation(now - 1_000))
        .await
        .unwrap();
    let urgent = provider
        .create_instance(
            new_instance("urgent")
                .with_next_activation(now - 500)
                .with_priority(10),
        )
        .await
        .unwrap();
    let mut elsewhere = new_instance("elsewhere").with_next_activation(now - 5_000);
    elsewhere.executor_group = Some("other".to_string());
    let foreign = provider.create_instance(elsewhere).await.unwrap();

    let ids = provider.poll_claimable_ids(DEFAULT_EXECUTOR_GROUP, 10).await.unwrap();
    assert_eq!(ids, vec![urgent, old, newer]);
    assert_eq!(provider.poll_claimable_ids(DEFAULT_EXECUTOR_GROUP, 1).await.unwrap(), vec![urgent]);
    assert_eq!(provider.poll_claimable_ids("other", 10).await.unwrap(), vec![foreign]);
    tracing::info!("✓ Test passed: poll ordering verified");
}

pub async fn test_release_by_owner_only<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing claiming: release by owner only");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "a", 1).await;

    assert!(!provider.release(id, 2).await.unwrap());
    assert!(provider.release(id, 1).await.unwrap());
    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.executor_id, None);
    assert_ne!(instance.status, InstanceStatus::Executing);
    assert!(provider.claim(id, 2).await.unwrap());
    tracing::info!("✓ Test passed: release semantics verified");
}

/// Many concurrent claimers: every instance ends up with exactly one owner.
pub async fn test_concurrent_claims_single_winner<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing claiming: concurrent claims");
    let provider = factory.create_provider().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(provider.create_instance(new_instance(&format!("c-{i}"))).await.unwrap());
    }
    let ids = Arc::new(ids);

    let handles: Vec<_> = (1..=8)
        .map(|executor_id| {
            let provider = provider.clone();
            let ids = ids.clone();
            tokio::spawn(async move {
                let mut won = Vec::new();
                for &id in ids.iter() {
                    if provider.claim(id, executor_id).await.unwrap() {
                        won.push(id);
                    }
                }
                won
            })
        })
        .collect();

    let mut all_won: Vec<i64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    all_won.sort();
    let mut expected = (*ids).clone();
    expected.sort();
    assert_eq!(all_won, expected, "each instance claimed exactly once");
    tracing::info!("✓ Test passed: concurrent claims verified");
}
