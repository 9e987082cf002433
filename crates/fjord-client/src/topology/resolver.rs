//! Bounded waits for topology facts.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::RefreshCoordinator;
use super::TopologyCache;
use crate::error::ClientError;
use crate::error::Result;
use crate::pending::Completion;
use crate::pending::PendingRequestRegistry;
use crate::pending::RequestKind;
use crate::types::BrokerAddress;
use crate::types::PartitionId;
use crate::types::TopicName;

/// Resolves partition leaders and topic partition sets, refreshing the
/// topology until the answer is known or the resolution budget runs out.
///
/// The budget is registered as a deadline in a pending-request registry,
/// so it expires through the same timeout sweep as every other request.
#[derive(Debug)]
pub struct LeaderResolver {
    cache: Arc<TopologyCache>,
    coordinator: Arc<RefreshCoordinator>,
    deadlines: Arc<PendingRequestRegistry<()>>,
    budget: Duration,
    retry_delay: Duration,
}

impl LeaderResolver {
    pub fn new(
        cache: Arc<TopologyCache>,
        coordinator: Arc<RefreshCoordinator>,
        deadlines: Arc<PendingRequestRegistry<()>>,
        budget: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            cache,
            coordinator,
            deadlines,
            budget,
            retry_delay,
        }
    }

    /// Resolution budget in whole seconds, as reported in errors.
    pub fn budget_secs(&self) -> u64 {
        self.budget.as_secs()
    }

    /// Leader of `partition_id`.
    ///
    /// A cached leader is returned without contacting the cluster. When the
    /// budget runs out, fails with the error built by `unresolved`.
    pub async fn leader_for(
        &self,
        partition_id: PartitionId,
        unresolved: impl FnOnce() -> ClientError,
    ) -> Result<BrokerAddress> {
        self.resolve(RequestKind::LeaderResolution { partition_id }, |cache| cache.get(partition_id), unresolved)
            .await
    }

    /// Partition set of `topic`.
    pub async fn partitions_of(&self, topic: &TopicName) -> Result<BTreeSet<PartitionId>> {
        let timeout_secs = self.budget_secs();
        self.resolve(
            RequestKind::TopicResolution { topic: topic.clone() },
            |cache| cache.partitions_of(topic),
            || ClientError::TopicUnresolved {
                topic: topic.clone(),
                timeout_secs,
            },
        )
        .await
    }

    async fn resolve<R>(
        &self,
        kind: RequestKind,
        lookup: impl Fn(&TopologyCache) -> Option<R>,
        unresolved: impl FnOnce() -> ClientError,
    ) -> Result<R> {
        if let Some(found) = lookup(&self.cache) {
            return Ok(found);
        }

        let mut deadline = self.deadlines.register(kind, self.budget);
        debug!(kind = ?deadline.kind(), deadline_ms = deadline.deadline_ms(), "resolving through topology refresh");
        loop {
            tokio::select! {
                biased;
                completion = deadline.wait() => {
                    return match completion {
                        Completion::Failed(error) => Err(error),
                        Completion::Expired | Completion::Response(()) => {
                            debug!(kind = ?deadline.kind(), "resolution budget exhausted");
                            Err(unresolved())
                        }
                    };
                }
                attempt = self.attempt(&lookup) => {
                    if let Some(found) = attempt? {
                        return Ok(found);
                    }
                }
            }
        }
    }

    /// One refresh followed by a lookup. On a miss, pauses and looks again,
    /// since another caller may have refreshed the cache meanwhile. The cache
    /// is checked first on every attempt.
    async fn attempt<R>(&self, lookup: &impl Fn(&TopologyCache) -> Option<R>) -> Result<Option<R>> {
        if let Some(found) = lookup(&self.cache) {
            return Ok(Some(found));
        }
        match self.coordinator.refresh().await {
            Ok(_) => {}
            Err(ClientError::Shutdown) => return Err(ClientError::Shutdown),
            Err(error) => debug!(%error, "topology refresh failed, retrying"),
        }
        if let Some(found) = lookup(&self.cache) {
            return Ok(Some(found));
        }
        tokio::time::sleep(self.retry_delay).await;
        Ok(lookup(&self.cache))
    }
}
