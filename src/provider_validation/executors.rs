use super::create_claimed;
use crate::ActionType;
use crate::provider_validations::ProviderFactory;
use std::time::Duration;

const GROUP: &str = "validation";

/// Run all executor registry tests
pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_register_and_heartbeat(factory).await;
    test_recover_expired_executor(factory).await;
    test_recover_ignores_live_and_self(factory).await;
}

pub async fn test_register_and_heartbeat<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing executors: register and heartbeat");
    let provider = factory.create_provider().await;
    let a = provider
        .register_executor(GROUP, "host-a", 11, Duration::from_millis(10))
        .await
        .unwrap();
    let b = provider
        .register_executor(GROUP, "host-b", 12, Duration::from_secs(60))
        .await
        .unwrap();
    assert_ne!(a, b);

    let before = provider.list_executors(GROUP).await.unwrap();
    assert_eq!(before.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(before[0].host, "host-a");
    assert_eq!(before[0].pid, 11);

    provider.heartbeat_executor(a, Duration::from_secs(120)).await.unwrap();
    let after = provider.list_executors(GROUP).await.unwrap();
    assert!(after[0].expires > before[0].expires);
    assert!(!after[0].is_expired_at(provider.now()));

    provider.mark_executor_stopped(a, false).await.unwrap();
    let stopped = provider.list_executors(GROUP).await.unwrap();
    assert!(stopped[0].stopped.is_some());
    assert_eq!(stopped[0].expires, after[0].expires, "stop without expire keeps the lease");

    provider.mark_executor_stopped(b, true).await.unwrap();
    let stopped = provider.list_executors(GROUP).await.unwrap();
    assert!(stopped[1].stopped.is_some());
    assert!(stopped[1].is_expired_at(provider.now() + 1));
    assert!(provider.list_executors("nobody").await.unwrap().is_empty());
    tracing::info!("✓ Test passed: register and heartbeat verified");
}

pub async fn test_recover_expired_executor<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing executors: recovery of expired executor");
    let provider = factory.create_provider().await;
    let dead = provider
        .register_executor(GROUP, "dead", 1, Duration::ZERO)
        .await
        .unwrap();
    let survivor = provider
        .register_executor(GROUP, "alive", 2, Duration::from_secs(60))
        .await
        .unwrap();

    let mut orphans = Vec::new();
    for i in 0..3 {
        let mut instance = super::new_instance(&format!("orphan-{i}"));
        instance.executor_group = Some(GROUP.to_string());
        let id = provider.create_instance(instance).await.unwrap();
        assert!(provider.claim(id, dead).await.unwrap());
        orphans.push(id);
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    let mut recovered = provider.recover_expired_executors(GROUP, survivor).await.unwrap();
    recovered.sort();
    assert_eq!(recovered, orphans);

    for id in &orphans {
        let instance = provider.load_instance(*id).await.unwrap().unwrap();
        assert_eq!(instance.executor_id, None);
        let actions = provider.list_actions(*id).await.unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::Recovery);
    }
    let executors = provider.list_executors(GROUP).await.unwrap();
    assert!(executors.iter().find(|e| e.id == dead).unwrap().recovered.is_some());
    assert!(executors.iter().find(|e| e.id == survivor).unwrap().recovered.is_none());
    tracing::info!("✓ Test passed: expired executor recovered");
}

pub async fn test_recover_ignores_live_and_self<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing executors: live executors untouched");
    let provider = factory.create_provider().await;
    let me = provider
        .register_executor(crate::DEFAULT_EXECUTOR_GROUP, "me", 1, Duration::ZERO)
        .await
        .unwrap();
    let peer = provider
        .register_executor(crate::DEFAULT_EXECUTOR_GROUP, "peer", 2, Duration::from_secs(60))
        .await
        .unwrap();
    let mine = create_claimed(provider.as_ref(), "mine", me).await;
    let theirs = create_claimed(provider.as_ref(), "theirs", peer).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Self is expired but never recovers itself
    assert!(
        provider
            .recover_expired_executors(crate::DEFAULT_EXECUTOR_GROUP, me)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(provider.load_instance(mine).await.unwrap().unwrap().executor_id, Some(me));
    assert_eq!(provider.load_instance(theirs).await.unwrap().unwrap().executor_id, Some(peer));
    tracing::info!("✓ Test passed: live executors untouched");
}
