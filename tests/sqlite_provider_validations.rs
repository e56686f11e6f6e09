//! Provider validation tests for SQLite
//!
//! Runs the reusable suites from `durastate::provider_validations` against
//! both the in-memory and the file-backed SQLite store.

#[cfg(feature = "provider-test")]
mod tests {
    use durastate::provider_validations::{
        ProviderFactory, run_all_tests, test_claim_exclusive, test_claim_only_when_due,
        test_concurrent_claims_single_winner, test_create_defaults, test_create_is_idempotent,
        test_create_requires_state, test_external_change_applies_to_unclaimed_only, test_persist_commits_everything,
        test_persist_is_atomic, test_persist_keeps_first_started, test_persist_rejects_non_owner,
        test_poll_ordering_and_groups, test_recover_expired_executor, test_recover_ignores_live_and_self,
        test_register_and_heartbeat, test_release_by_owner_only, test_wakeup_idle_instance,
        test_wakeup_respects_claim_and_states,
    };
    use durastate::providers::Provider;
    use durastate::providers::sqlite::SqliteProvider;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct SqliteTestFactory;

    #[async_trait::async_trait]
    impl ProviderFactory for SqliteTestFactory {
        async fn create_provider(&self) -> Arc<dyn Provider> {
            Arc::new(SqliteProvider::new_in_memory().await.unwrap())
        }
    }

    /// One database file per provider; directories live as long as the factory.
    #[derive(Default)]
    struct SqliteFileFactory {
        dirs: Mutex<Vec<TempDir>>,
    }

    #[async_trait::async_trait]
    impl ProviderFactory for SqliteFileFactory {
        async fn create_provider(&self) -> Arc<dyn Provider> {
            let td = tempfile::tempdir().unwrap();
            let db_url = format!("sqlite:{}?mode=rwc", td.path().join("validation.db").display());
            self.dirs.lock().unwrap().push(td);
            Arc::new(SqliteProvider::new(&db_url, None).await.unwrap())
        }
    }

    // Instance creation tests
    #[tokio::test]
    async fn test_sqlite_create_is_idempotent() {
        test_create_is_idempotent(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_create_requires_state() {
        test_create_requires_state(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_create_defaults() {
        test_create_defaults(&SqliteTestFactory).await;
    }

    // Claiming tests
    #[tokio::test]
    async fn test_sqlite_claim_exclusive() {
        test_claim_exclusive(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_claim_only_when_due() {
        test_claim_only_when_due(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_poll_ordering_and_groups() {
        test_poll_ordering_and_groups(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_release_by_owner_only() {
        test_release_by_owner_only(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_claims_single_winner() {
        test_concurrent_claims_single_winner(&SqliteTestFactory).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sqlite_file_concurrent_claims_single_winner() {
        test_concurrent_claims_single_winner(&SqliteFileFactory::default()).await;
    }

    // Persistence tests
    #[tokio::test]
    async fn test_sqlite_persist_commits_everything() {
        test_persist_commits_everything(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_persist_rejects_non_owner() {
        test_persist_rejects_non_owner(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_persist_is_atomic() {
        test_persist_is_atomic(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_persist_keeps_first_started() {
        test_persist_keeps_first_started(&SqliteTestFactory).await;
    }

    // Wakeup and external change tests
    #[tokio::test]
    async fn test_sqlite_wakeup_idle_instance() {
        test_wakeup_idle_instance(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_wakeup_respects_claim_and_states() {
        test_wakeup_respects_claim_and_states(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_external_change_applies_to_unclaimed_only() {
        test_external_change_applies_to_unclaimed_only(&SqliteTestFactory).await;
    }

    // Executor tests
    #[tokio::test]
    async fn test_sqlite_register_and_heartbeat() {
        test_register_and_heartbeat(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_recover_expired_executor() {
        test_recover_expired_executor(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_recover_ignores_live_and_self() {
        test_recover_ignores_live_and_self(&SqliteTestFactory).await;
    }

    #[tokio::test]
    async fn test_sqlite_file_all_suites() {
        run_all_tests(&SqliteFileFactory::default()).await;
    }
}
