//! Several executors sharing one store.

use durastate::providers::Provider;
use durastate::providers::sqlite::SqliteProvider;
use durastate::runtime::claim::{ClaimError, claim_batch};
use durastate::runtime::{NextAction, Runtime, StateType, WorkflowDefinition, WorkflowRegistry};
use durastate::{DEFAULT_EXECUTOR_GROUP, InstanceStatus, NewWorkflowInstance};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

async fn second_connection(db_dir: &tempfile::TempDir) -> Arc<dyn Provider> {
    let db_url = format!("sqlite:{}", db_dir.path().join("test.db").display());
    Arc::new(SqliteProvider::new(&db_url, None).await.unwrap())
}

/// Two claimers race for the same ten due rows with a batch size of ten.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_claimers_never_share_an_instance() {
    let (store_a, td) = common::create_sqlite_store_disk().await;
    let store_b = second_connection(&td).await;

    for round in 0..5 {
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(
                store_a
                    .create_instance(
                        NewWorkflowInstance::new("race")
                            .with_external_id(format!("r{round}-{i}"))
                            .with_state("begin"),
                    )
                    .await
                    .unwrap(),
            );
        }

        let claim = |store: Arc<dyn Provider>, executor_id: i64| {
            tokio::spawn(async move {
                let mut won = Vec::new();
                // Keep going until the poll comes back empty
                loop {
                    match claim_batch(store.as_ref(), DEFAULT_EXECUTOR_GROUP, executor_id, 10).await {
                        Ok(ids) if ids.is_empty() => break,
                        Ok(ids) => won.extend(ids),
                        Err(ClaimError::Race { retained }) => won.extend(retained),
                        Err(ClaimError::Provider { error, retained }) => {
                            assert!(error.is_retryable(), "unexpected store error: {error}");
                            won.extend(retained);
                        }
                    }
                }
                won
            })
        };
        let (a, b) = tokio::join!(claim(store_a.clone(), 1), claim(store_b.clone(), 2));
        let (a, b) = (a.unwrap(), b.unwrap());

        let mut all: Vec<i64> = a.iter().chain(b.iter()).copied().collect();
        all.sort();
        ids.sort();
        assert_eq!(all, ids, "round {round}: every id claimed exactly once");

        for id in a {
            assert_eq!(store_a.load_instance(id).await.unwrap().unwrap().executor_id, Some(1));
        }
        for id in b {
            assert_eq!(store_a.load_instance(id).await.unwrap().unwrap().executor_id, Some(2));
        }
    }
}

/// Two runtimes drain a shared backlog; every instance runs its start state once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_runtimes_process_each_instance_once() {
    let (store_a, td) = common::create_sqlite_store_disk().await;
    let store_b = second_connection(&td).await;

    let runs: Arc<Mutex<HashMap<i64, Vec<i64>>>> = Arc::new(Mutex::new(HashMap::new()));
    let workflows = {
        let runs = runs.clone();
        let definition = WorkflowDefinition::builder("job")
            .register_state("run", StateType::Start)
            .register_state("done", StateType::End)
            .register_state("error", StateType::Manual)
            .initial_state("run")
            .error_state("error")
            .permit("run", "done")
            .on_state("run", move |ctx| {
                let runs = runs.clone();
                async move {
                    runs.lock()
                        .unwrap()
                        .entry(ctx.workflow_instance_id())
                        .or_default()
                        .push(ctx.executor_id());
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(NextAction::move_to_state("done", "ran"))
                }
            })
            .build()
            .unwrap();
        WorkflowRegistry::builder().register(definition).build()
    };

    let mut ids = Vec::new();
    for i in 0..40 {
        ids.push(
            store_a
                .create_instance(NewWorkflowInstance::new("job").with_external_id(format!("job-{i}")).with_state("run"))
                .await
                .unwrap(),
        );
    }

    let rt_a = Runtime::start(store_a.clone(), workflows.clone(), common::fast_options())
        .await
        .unwrap();
    let rt_b = Runtime::start(store_b.clone(), workflows.clone(), common::fast_options())
        .await
        .unwrap();

    for id in &ids {
        common::wait_for_status(&store_a, *id, InstanceStatus::Finished, 20_000).await;
    }
    rt_a.shutdown().await;
    rt_b.shutdown().await;

    let runs = runs.lock().unwrap();
    assert_eq!(runs.len(), ids.len());
    for (id, executors) in runs.iter() {
        assert_eq!(executors.len(), 1, "instance {id} ran {} times", executors.len());
    }
    let executors: HashSet<i64> = runs.values().flatten().copied().collect();
    assert!(executors.is_subset(&HashSet::from([rt_a.executor_id(), rt_b.executor_id()])));
    let claims = rt_a.metrics_snapshot().claims + rt_b.metrics_snapshot().claims;
    assert!(claims >= ids.len() as u64);
}
