//! Provider Validation Infrastructure
//!
//! Reusable checks for custom [`Provider`] implementations. Enable the
//! `provider-test` feature to use them.
//!
//! # Example
//!
//! ```rust,ignore
//! use durastate::providers::Provider;
//! use durastate::provider_validations::ProviderFactory;
//! use std::sync::Arc;
//!
//! struct MyProviderFactory;
//!
//! #[async_trait::async_trait]
//! impl ProviderFactory for MyProviderFactory {
//!     async fn create_provider(&self) -> Arc<dyn Provider> {
//!         Arc::new(MyProvider::new().await.unwrap())
//!     }
//! }
//!
//! #[tokio::test]
//! async fn test_my_provider() {
//!     durastate::provider_validations::run_all_tests(&MyProviderFactory).await;
//! }
//! ```

use crate::providers::Provider;
use std::sync::Arc;

/// Creates providers for the validation suites.
#[async_trait::async_trait]
pub trait ProviderFactory: Send + Sync {
    /// A fresh, empty, isolated provider per call.
    async fn create_provider(&self) -> Arc<dyn Provider>;
}

/// Available test functions:
///
/// **Instance Creation Tests:**
/// - `test_create_is_idempotent` - Same type, external id and group yield one row
/// - `test_create_requires_state` - Unresolved state is rejected
/// - `test_create_defaults` - Status, group, activation and generated external id
///
/// **Claiming Tests:**
/// - `test_claim_exclusive` - Second claim of the same row fails
/// - `test_claim_only_when_due` - Future or absent activation cannot be claimed
/// - `test_poll_ordering_and_groups` - Priority first, then activation; groups isolated
/// - `test_release_by_owner_only` - Only the owner can release
/// - `test_concurrent_claims_single_winner` - Many tasks, one owner
///
/// **Persistence Tests:**
/// - `test_persist_commits_everything` - Instance, action and children in one call
/// - `test_persist_rejects_non_owner` - Stale owner is refused
/// - `test_persist_is_atomic` - Failing child insert leaves nothing behind
/// - `test_persist_keeps_first_started` - `started` only set once
///
/// **Wakeup Tests:**
/// - `test_wakeup_idle_instance` - Parked instance becomes due
/// - `test_wakeup_respects_claim_and_states` - Claimed or unexpected state is left alone
/// - `test_external_change_applies_to_unclaimed_only` - Change and its action row
///
/// **Executor Tests:**
/// - `test_register_and_heartbeat` - Row created; heartbeat pushes expiry
/// - `test_recover_expired_executor` - Instances released with a recovery action
/// - `test_recover_ignores_live_and_self` - Live executors and self are untouched
pub use crate::provider_validation::claiming::{
    test_claim_exclusive, test_claim_only_when_due, test_concurrent_claims_single_winner,
    test_poll_ordering_and_groups, test_release_by_owner_only,
};
pub use crate::provider_validation::executors::{
    test_recover_expired_executor, test_recover_ignores_live_and_self, test_register_and_heartbeat,
};
pub use crate::provider_validation::instance_creation::{
    test_create_defaults, test_create_is_idempotent, test_create_requires_state,
};
pub use crate::provider_validation::persistence::{
    test_persist_commits_everything, test_persist_is_atomic, test_persist_keeps_first_started,
    test_persist_rejects_non_owner,
};
pub use crate::provider_validation::wakeup::{
    test_external_change_applies_to_unclaimed_only, test_wakeup_idle_instance, test_wakeup_respects_claim_and_states,
};

/// Run every validation suite.
pub async fn run_all_tests<F: ProviderFactory>(factory: &F) {
    crate::provider_validation::instance_creation::run_tests(factory).await;
    crate::provider_validation::claiming::run_tests(factory).await;
    crate::provider_validation::persistence::run_tests(factory).await;
    crate::provider_validation::wakeup::run_tests(factory).await;
    crate::provider_validation::executors::run_tests(factory).await;
}
