//! Lock coordination for workflow verbs.
//!
//! Two granularities, both TTL leases in the topology store:
//! - **Keyspace lock** (`keyspaces/<ks>`): coarse, held during cutover
//!   steps; serializes workflows on the same keyspace.
//! - **Named lock** (`workflows/<ks>/<workflow>`): fine, held for the
//!   whole verb so two invocations of the same workflow verb exclude
//!   each other without blocking unrelated workflows.
//!
//! Release is deliberately infallible: a failed unlock is logged and the
//! TTL reclaims the lease, so releasing can never mask the error the verb
//! is already returning. Operations that may outlive the TTL call
//! `check` at each major step and fail fast if the lease was lost.

use std::sync::Arc;
use std::time::Duration;

use kestrel_common::error::KestrelResult;

use crate::store::{LockLease, TopoStore};

/// Coarse keyspace lock guard.
pub struct KeyspaceLock {
    store: Arc<dyn TopoStore>,
    lease: LockLease,
    keyspace: String,
}

impl KeyspaceLock {
    /// Acquire the lock on `keyspace`, or fail with `ABORTED` when another
    /// holder has an unexpired lease.
    pub async fn acquire(
        store: Arc<dyn TopoStore>,
        keyspace: &str,
        reason: &str,
        ttl: Duration,
    ) -> KestrelResult<Self> {
        let path = format!("keyspaces/{keyspace}");
        let lease = store.lock(&path, ttl, reason).await?;
        tracing::debug!(keyspace, reason, ttl_ms = ttl.as_millis() as u64, "keyspace locked");
        Ok(Self {
            store,
            lease,
            keyspace: keyspace.to_string(),
        })
    }

    /// Fail fast if the lease expired or was taken over.
    pub async fn check(&self) -> KestrelResult<()> {
        self.store
            .check_lock(&self.lease)
            .await
            .map_err(|e| e.wrap(format!("keyspace {} lock lost", self.keyspace)))
    }

    /// Release. Failures are logged, never returned.
    pub async fn release(self) {
        if let Err(e) = self.store.unlock(&self.lease).await {
            tracing::warn!(keyspace = %self.keyspace, error = %e, "keyspace unlock failed; TTL will reclaim");
        }
    }
}

/// Fine-grained per-workflow lock guard.
pub struct NamedLock {
    store: Arc<dyn TopoStore>,
    lease: LockLease,
    name: String,
}

impl NamedLock {
    /// Acquire `workflows/<keyspace>/<workflow>`.
    pub async fn acquire(
        store: Arc<dyn TopoStore>,
        keyspace: &str,
        workflow: &str,
        reason: &str,
        ttl: Duration,
    ) -> KestrelResult<Self> {
        let name = format!("{keyspace}/{workflow}");
        let path = format!("workflows/{name}");
        let lease = store.lock(&path, ttl, reason).await?;
        tracing::debug!(workflow = %name, reason, "workflow locked");
        Ok(Self { store, lease, name })
    }

    pub async fn check(&self) -> KestrelResult<()> {
        self.store
            .check_lock(&self.lease)
            .await
            .map_err(|e| e.wrap(format!("workflow {} lock lost", self.name)))
    }

    pub async fn release(self) {
        if let Err(e) = self.store.unlock(&self.lease).await {
            tracing::warn!(workflow = %self.name, error = %e, "workflow unlock failed; TTL will reclaim");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTopoStore;

    fn store() -> Arc<dyn TopoStore> {
        Arc::new(MemoryTopoStore::new())
    }

    #[tokio::test]
    async fn test_keyspace_lock_excludes_and_releases() {
        let store = store();
        let lock = KeyspaceLock::acquire(Arc::clone(&store), "ks1", "switch writes", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(lock.check().await.is_ok());

        let contended =
            KeyspaceLock::acquire(Arc::clone(&store), "ks1", "delete", Duration::from_secs(30)).await;
        assert!(contended.is_err());

        // A different keyspace locks concurrently.
        let other =
            KeyspaceLock::acquire(Arc::clone(&store), "ks2", "create", Duration::from_secs(30))
                .await
                .unwrap();
        other.release().await;

        lock.release().await;
        KeyspaceLock::acquire(store, "ks1", "retry", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_named_lock_is_per_workflow() {
        let store = store();
        let a = NamedLock::acquire(Arc::clone(&store), "ks1", "wf1", "update", Duration::from_secs(30))
            .await
            .unwrap();
        // Same workflow contends, a different workflow does not.
        assert!(NamedLock::acquire(
            Arc::clone(&store),
            "ks1",
            "wf1",
            "delete",
            Duration::from_secs(30)
        )
        .await
        .is_err());
        NamedLock::acquire(Arc::clone(&store), "ks1", "wf2", "update", Duration::from_secs(30))
            .await
            .unwrap()
            .release()
            .await;
        a.release().await;
    }

    #[tokio::test]
    async fn test_check_detects_expired_lease() {
        let store = store();
        let lock =
            KeyspaceLock::acquire(Arc::clone(&store), "ks1", "slow verb", Duration::from_millis(10))
                .await
                .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(lock.check().await.is_err());
    }
}
