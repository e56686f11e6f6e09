use super::{create_claimed, execution_action, new_instance, park_commit};
use crate::provider_validations::ProviderFactory;
use crate::{ActionType, InstanceStatus};

/// Run all persistence tests
pub async fn run_tests<F: ProviderFactory>(factory: &F) {
    test_persist_commits_everything(factory).await;
    test_persist_rejects_non_owner(factory).await;
    test_persist_is_atomic(factory).await;
    test_persist_keeps_first_started(factory).await;
}

/// Instance update, action row and child instances land together.
pub async fn test_persist_commits_everything<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing persistence: full commit");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "parent", 7).await;

    let mut commit = park_commit(id, 7, "waitChildren");
    commit.retries = 2;
    commit.business_key = Some("bk-1".to_string());
    commit.state_variables.insert("count".to_string(), "3".to_string());
    commit.started = Some(100);
    let mut action = execution_action(7, "begin");
    action.updated_state_variables.insert("count".to_string(), "3".to_string());
    commit.action = Some(action);
    for i in 0..2 {
        let mut child = new_instance(&format!("child-{i}"));
        child.parent_workflow_id = Some(id);
        commit.new_instances.push(child);
    }

    let action_id = provider.persist(commit).await.unwrap().expect("action id");

    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "waitChildren");
    assert_eq!(instance.state_text.as_deref(), Some("moved to waitChildren"));
    assert_eq!(instance.status, InstanceStatus::InProgress);
    assert_eq!(instance.executor_id, None);
    assert_eq!(instance.next_activation, None);
    assert_eq!(instance.retries, 2);
    assert_eq!(instance.business_key.as_deref(), Some("bk-1"));
    assert_eq!(instance.state_variables.get("count").map(String::as_str), Some("3"));

    let actions = provider.list_actions(id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].id, action_id);
    assert_eq!(actions[0].executor_id, Some(7));
    assert_eq!(actions[0].action_type, ActionType::StateExecution);
    assert_eq!(actions[0].updated_state_variables.get("count").map(String::as_str), Some("3"));

    let children = provider.list_children(id).await.unwrap();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(|c| c.parent_action_id == Some(action_id)));
    assert!(children.iter().all(|c| c.status == InstanceStatus::Created));
    tracing::info!("✓ Test passed: full commit verified");
}

pub async fn test_persist_rejects_non_owner<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing persistence: ownership check");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "owned", 1).await;

    let mut commit = park_commit(id, 2, "done");
    commit.action = Some(execution_action(2, "begin"));
    let err = provider.persist(commit).await.unwrap_err();
    assert!(!err.is_retryable(), "lost ownership is not retryable");

    // Released instances are not owned by anyone either
    assert!(provider.release(id, 1).await.unwrap());
    assert!(provider.persist(park_commit(id, 1, "done")).await.is_err());

    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "begin");
    assert!(provider.list_actions(id).await.unwrap().is_empty());
    tracing::info!("✓ Test passed: non-owner commit rejected");
}

/// A failing child insert rolls back the instance update and the action.
pub async fn test_persist_is_atomic<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing persistence: atomic rollback");
    let provider = factory.create_provider().await;
    provider.create_instance(new_instance("existing")).await.unwrap();
    let id = create_claimed(provider.as_ref(), "atomic", 1).await;

    let mut commit = park_commit(id, 1, "done");
    commit.action = Some(execution_action(1, "begin"));
    commit.new_instances.push(new_instance("fresh"));
    commit.new_instances.push(new_instance("existing"));
    assert!(provider.persist(commit).await.is_err());

    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.state, "begin");
    assert_eq!(instance.executor_id, Some(1));
    assert!(provider.list_actions(id).await.unwrap().is_empty());
    assert!(provider.list_children(id).await.unwrap().is_empty());
    tracing::info!("✓ Test passed: rollback verified");
}

pub async fn test_persist_keeps_first_started<F: ProviderFactory>(factory: &F) {
    tracing::info!("→ Testing persistence: started stamped once");
    let provider = factory.create_provider().await;
    let id = create_claimed(provider.as_ref(), "started", 1).await;

    let mut first = park_commit(id, 1, "begin");
    first.executor_id = Some(1);
    first.status = InstanceStatus::Executing;
    first.next_activation = Some(provider.now());
    first.started = Some(1_000);
    provider.persist(first).await.unwrap();

    let mut second = park_commit(id, 1, "done");
    second.started = Some(2_000);
    provider.persist(second).await.unwrap();

    let instance = provider.load_instance(id).await.unwrap().unwrap();
    assert_eq!(instance.started, Some(1_000));
    assert_eq!(instance.state, "done");
    tracing::info!("✓ Test passed: started kept");
}
