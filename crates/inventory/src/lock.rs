//! Short-lived exclusive leases over named resources.
//!
//! Acquisition never blocks: a busy key yields `None` and the caller decides
//! whether to try again. [`acquire_with_retry`] is the bounded retry every
//! ledger operation uses. A lease that is never released lapses after its
//! duration, so a crashed holder cannot block a product forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Clock, RetryPolicy, SystemClock, deadline, retry};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::LockError;

/// Proof of holding a lease. Only the matching token can release it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Tries once to take the lease on `key`. `None` means someone else holds
    /// an unexpired lease.
    async fn acquire(
        &self,
        key: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseToken>, LockError>;

    /// Gives the lease back. Returns false when `token` is not the current
    /// holder, e.g. because the lease lapsed and was taken over.
    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError>;
}

/// A held lease.
#[derive(Debug)]
#[must_use = "a lease should be released once the guarded work is done"]
pub struct Lease {
    key: String,
    token: LeaseToken,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> LeaseToken {
        self.token
    }

    /// Releases the lease, logging instead of failing: the lease lapses on
    /// its own if the release does not go through.
    pub async fn release(self, lock: &dyn LockService) {
        match lock.release(&self.key, &self.token).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %self.key, "lease lapsed before release");
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to release lease");
            }
        }
    }
}

/// Takes the lease on `key`, retrying a busy key per `policy`.
pub async fn acquire_with_retry(
    lock: &dyn LockService,
    key: &str,
    lease_duration: Duration,
    policy: &RetryPolicy,
) -> Result<Lease, LockError> {
    let attempts = &AtomicU32::new(0);

    let result = retry(
        policy,
        || async move {
            if attempts.fetch_add(1, Ordering::Relaxed) > 0 {
                metrics::counter!("lock_acquire_retries_total").increment(1);
            }
            match lock.acquire(key, lease_duration).await? {
                Some(token) => Ok(token),
                None => Err(LockError::Unavailable {
                    resource_key: key.to_string(),
                    attempts: attempts.load(Ordering::Relaxed),
                }),
            }
        },
        |e| matches!(e, LockError::Unavailable { .. }),
    )
    .await;

    match result {
        Ok(token) => Ok(Lease {
            key: key.to_string(),
            token,
        }),
        Err(e @ LockError::Unavailable { .. }) => {
            metrics::counter!("lock_unavailable_total").increment(1);
            tracing::warn!(key, error = %e, "lease acquisition exhausted");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// In-process lease table.
#[derive(Debug, Clone)]
pub struct InMemoryLockService {
    leases: Arc<Mutex<HashMap<String, (LeaseToken, DateTime<Utc>)>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Arc::default(),
            clock,
        }
    }

    /// Number of leases that have not lapsed.
    pub async fn held_count(&self) -> usize {
        let now = self.clock.now();
        self.leases
            .lock()
            .await
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }
}

impl Default for InMemoryLockService {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire(
        &self,
        key: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeaseToken>, LockError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().await;

        if let Some((_, expires_at)) = leases.get(key)
            && *expires_at > now
        {
            return Ok(None);
        }

        let token = LeaseToken::new();
        leases.insert(key.to_string(), (token, deadline(now, lease_duration)));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LeaseToken) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().await;
        match leases.get(key) {
            Some((holder, _)) if holder == token => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::ManualClock;

    use super::*;

    const LEASE: Duration = Duration::from_secs(5);

    fn service() -> (InMemoryLockService, ManualClock) {
        let clock = ManualClock::default();
        (InMemoryLockService::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn lease_is_exclusive() {
        let (lock, _) = service();
        let token = lock.acquire("product:milk", LEASE).await.unwrap();
        assert!(token.is_some());
        assert!(lock.acquire("product:milk", LEASE).await.unwrap().is_none());
        assert!(lock.acquire("product:eggs", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let (lock, _) = service();
        let token = lock.acquire("product:milk", LEASE).await.unwrap().unwrap();

        assert!(!lock.release("product:milk", &LeaseToken::new()).await.unwrap());
        assert!(lock.release("product:milk", &token).await.unwrap());
        assert!(lock.acquire("product:milk", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lapsed_lease_is_taken_over_and_old_holder_cannot_release() {
        let (lock, clock) = service();
        let stale = lock.acquire("product:milk", LEASE).await.unwrap().unwrap();

        clock.advance(LEASE + Duration::from_millis(1));
        let fresh = lock.acquire("product:milk", LEASE).await.unwrap().unwrap();

        assert!(!lock.release("product:milk", &stale).await.unwrap());
        assert_eq!(lock.held_count().await, 1);
        assert!(lock.release("product:milk", &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn retry_gives_up_with_attempt_count() {
        let (lock, _) = service();
        let _held = lock.acquire("product:milk", LEASE).await.unwrap();

        let err = acquire_with_retry(
            &lock,
            "product:milk",
            LEASE,
            &RetryPolicy::new(3, Duration::ZERO),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            LockError::Unavailable { attempts: 3, ref resource_key } if resource_key == "product:milk"
        ));
    }

    #[tokio::test]
    async fn retry_succeeds_once_holder_releases() {
        let lock = InMemoryLockService::default();
        let token = lock.acquire("order:1", LEASE).await.unwrap().unwrap();

        let releaser = {
            let lock = lock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                lock.release("order:1", &token).await.unwrap();
            })
        };

        let lease = acquire_with_retry(
            &lock,
            "order:1",
            LEASE,
            &RetryPolicy::new(50, Duration::from_millis(5)),
        )
        .await
        .unwrap();
        releaser.await.unwrap();

        assert_eq!(lease.key(), "order:1");
        lease.release(&lock).await;
        assert_eq!(lock.held_count().await, 0);
    }
}
