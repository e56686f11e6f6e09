//! Poll-then-claim over the store.
//!
//! Each id from the poll is claimed on its own with a conditional update.
//! Losing any claim means another executor is polling the same rows: the
//! whole batch is handed back and the caller backs off.

use std::fmt;
use tracing::{debug, warn};

use crate::providers::{Provider, ProviderError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    /// Another executor claimed a polled id first. Expected under contention.
    Race {
        /// Ids claimed in this batch whose release failed; the caller still owns them.
        retained: Vec<i64>,
    },
    /// The store failed mid-batch.
    Provider {
        error: ProviderError,
        retained: Vec<i64>,
    },
}

impl ClaimError {
    pub fn is_race(&self) -> bool {
        matches!(self, ClaimError::Race { .. })
    }

    /// Ids the caller still owns and must process or release.
    pub fn retained(&self) -> &[i64] {
        match self {
            ClaimError::Race { retained } | ClaimError::Provider { retained, .. } => retained,
        }
    }
}

impl fmt::Display for ClaimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimError::Race { .. } => f.write_str("claim race: instance already claimed by another executor"),
            ClaimError::Provider { error, .. } => write!(f, "claim failed: {error}"),
        }
    }
}

impl std::error::Error for ClaimError {}

impl From<ProviderError> for ClaimError {
    fn from(error: ProviderError) -> Self {
        ClaimError::Provider {
            error,
            retained: Vec::new(),
        }
    }
}

/// Claim up to `limit` due instances of `group` for `executor_id`.
///
/// Returns the claimed ids in poll order; an empty vector means nothing was due.
pub async fn claim_batch(
    store: &dyn Provider,
    group: &str,
    executor_id: i64,
    limit: usize,
) -> Result<Vec<i64>, ClaimError> {
    if limit == 0 {
        return Ok(Vec::new());
    }
    let ids = store.poll_claimable_ids(group, limit).await?;
    let mut claimed = Vec::with_capacity(ids.len());

    for id in ids {
        match store.claim(id, executor_id).await {
            Ok(true) => claimed.push(id),
            Ok(false) => {
                debug!(
                    target: "durastate::runtime::claim",
                    instance_id = id,
                    executor_id,
                    abandoned = claimed.len(),
                    "Claim race, abandoning batch"
                );
                let retained = release_all(store, &claimed, executor_id).await;
                return Err(ClaimError::Race { retained });
            }
            Err(error) => {
                let retained = release_all(store, &claimed, executor_id).await;
                return Err(ClaimError::Provider { error, retained });
            }
        }
    }

    Ok(claimed)
}

/// Release `ids`; returns the ones that could not be released.
async fn release_all(store: &dyn Provider, ids: &[i64], executor_id: i64) -> Vec<i64> {
    let mut retained = Vec::new();
    for &id in ids {
        match store.release(id, executor_id).await {
            Ok(_) => {}
            Err(e) => {
                warn!(
                    target: "durastate::runtime::claim",
                    instance_id = id,
                    executor_id,
                    error = %e,
                    "Failed to release claim from abandoned batch"
                );
                retained.push(id);
            }
        }
    }
    retained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::sqlite::SqliteProvider;
    use crate::{DEFAULT_EXECUTOR_GROUP, NewWorkflowInstance};

    async fn store_with(count: usize) -> (SqliteProvider, Vec<i64>) {
        let store = SqliteProvider::new_in_memory().await.unwrap();
        let mut ids = Vec::new();
        for i in 0..count {
            let id = store
                .create_instance(
                    NewWorkflowInstance::new("order")
                        .with_external_id(format!("ext-{i}"))
                        .with_state("begin"),
                )
                .await
                .unwrap();
            ids.push(id);
        }
        (store, ids)
    }

    #[tokio::test]
    async fn test_claim_batch_claims_up_to_limit() {
        let (store, ids) = store_with(5).await;
        let claimed = claim_batch(&store, DEFAULT_EXECUTOR_GROUP, 1, 3).await.unwrap();
        assert_eq!(claimed.len(), 3);
        assert!(claimed.iter().all(|id| ids.contains(id)));

        let rest = claim_batch(&store, DEFAULT_EXECUTOR_GROUP, 2, 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert!(claim_batch(&store, DEFAULT_EXECUTOR_GROUP, 2, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_does_not_poll() {
        let (store, _) = store_with(1).await;
        assert!(claim_batch(&store, DEFAULT_EXECUTOR_GROUP, 1, 0).await.unwrap().is_empty());
        assert_eq!(store.poll_claimable_ids(DEFAULT_EXECUTOR_GROUP, 10).await.unwrap().len(), 1);
    }

    /// Provider wrapper that lets a competitor win the claim on one id.
    struct Contended {
        inner: SqliteProvider,
        stolen: i64,
    }

    #[async_trait::async_trait]
    impl Provider for Contended {
        fn name(&self) -> &str {
            "contended"
        }
        async fn create_instance(&self, i: NewWorkflowInstance) -> Result<i64, ProviderError> {
            self.inner.create_instance(i).await
        }
        async fn load_instance(&self, id: i64) -> Result<Option<crate::WorkflowInstance>, ProviderError> {
            self.inner.load_instance(id).await
        }
        async fn list_actions(&self, id: i64) -> Result<Vec<crate::WorkflowInstanceAction>, ProviderError> {
            self.inner.list_actions(id).await
        }
        async fn list_children(&self, id: i64) -> Result<Vec<crate::WorkflowInstance>, ProviderError> {
            self.inner.list_children(id).await
        }
        async fn poll_claimable_ids(&self, group: &str, limit: usize) -> Result<Vec<i64>, ProviderError> {
            self.inner.poll_claimable_ids(group, limit).await
        }
        async fn claim(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
            if id == self.stolen {
                self.inner.claim(id, 99).await?;
            }
            self.inner.claim(id, executor_id).await
        }
        async fn release(&self, id: i64, executor_id: i64) -> Result<bool, ProviderError> {
            self.inner.release(id, executor_id).await
        }
        async fn persist(&self, c: crate::providers::ExecutionCommit) -> Result<Option<i64>, ProviderError> {
            self.inner.persist(c).await
        }
        async fn wakeup_if_idle(&self, id: i64, s: &[String]) -> Result<bool, ProviderError> {
            self.inner.wakeup_if_idle(id, s).await
        }
        async fn apply_external_change(&self, id: i64, c: crate::ExternalChange) -> Result<bool, ProviderError> {
            self.inner.apply_external_change(id, c).await
        }
        async fn register_executor(
            &self,
            g: &str,
            h: &str,
            p: u32,
            t: std::time::Duration,
        ) -> Result<i64, ProviderError> {
            self.inner.register_executor(g, h, p, t).await
        }
        async fn heartbeat_executor(&self, id: i64, t: std::time::Duration) -> Result<(), ProviderError> {
            self.inner.heartbeat_executor(id, t).await
        }
        async fn mark_executor_stopped(&self, id: i64, expire: bool) -> Result<(), ProviderError> {
            self.inner.mark_executor_stopped(id, expire).await
        }
        async fn recover_expired_executors(&self, g: &str, id: i64) -> Result<Vec<i64>, ProviderError> {
            self.inner.recover_expired_executors(g, id).await
        }
        async fn list_executors(&self, g: &str) -> Result<Vec<crate::ExecutorInfo>, ProviderError> {
            self.inner.list_executors(g).await
        }
    }

    #[tokio::test]
    async fn test_race_releases_claimed_part_of_batch() {
        let (inner, ids) = store_with(3).await;
        let polled = inner.poll_claimable_ids(DEFAULT_EXECUTOR_GROUP, 10).await.unwrap();
        let store = Contended {
            inner,
            stolen: polled[1],
        };

        let err = claim_batch(&store, DEFAULT_EXECUTOR_GROUP, 1, 10).await.unwrap_err();
        assert!(err.is_race());
        assert!(err.retained().is_empty());

        // First id was released again, second belongs to the competitor
        let first = store.load_instance(polled[0]).await.unwrap().unwrap();
        assert_eq!(first.executor_id, None);
        let second = store.load_instance(polled[1]).await.unwrap().unwrap();
        assert_eq!(second.executor_id, Some(99));
        assert_eq!(ids.len(), 3);
    }
}
