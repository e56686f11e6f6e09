#![allow(dead_code)]

use durastate::providers::Provider;
use durastate::providers::sqlite::SqliteProvider;
use durastate::runtime::RuntimeOptions;
use durastate::{InstanceStatus, WorkflowInstance};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url, None).await.unwrap()) as Arc<dyn Provider>;
    (store, td)
}

pub async fn create_sqlite_store_memory() -> Arc<dyn Provider> {
    Arc::new(SqliteProvider::new_in_memory().await.unwrap())
}

/// Options tuned for tests: quick polling, small pool.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(20),
        worker_count: 4,
        queue_capacity: 8,
        queue_low_water_mark: 2,
        shutdown_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Poll until `predicate` holds for the instance, or give up after `timeout_ms`.
pub async fn wait_for_instance<F>(
    store: &Arc<dyn Provider>,
    id: i64,
    predicate: F,
    timeout_ms: u64,
) -> Option<WorkflowInstance>
where
    F: Fn(&WorkflowInstance) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Some(instance) = store.load_instance(id).await.unwrap() {
            if predicate(&instance) {
                return Some(instance);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(
    store: &Arc<dyn Provider>,
    id: i64,
    status: InstanceStatus,
    timeout_ms: u64,
) -> WorkflowInstance {
    match wait_for_instance(store, id, |i| i.status == status, timeout_ms).await {
        Some(instance) => instance,
        None => panic!(
            "instance {id} did not reach {status} within {timeout_ms}ms: {:?}",
            store.load_instance(id).await.unwrap()
        ),
    }
}
