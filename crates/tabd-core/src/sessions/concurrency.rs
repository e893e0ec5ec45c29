//! Per-user bound on in-flight operations, with a bounded FIFO wait and a
//! hard wait deadline.
//!
//! Built on `tokio::sync::Semaphore`: its internal waiter queue is already
//! FIFO, and dropping an `acquire().await` future (which `tokio::time::timeout`
//! does on expiry) already removes that waiter from the queue — exactly the
//! "cancellation must remove the waiter" contract, for free.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tabd_types::{CoreError, CoreResult, UserId};
use tokio::sync::Semaphore;

const WAIT_DEADLINE: Duration = Duration::from_secs(30);

struct UserBucket {
    semaphore: Semaphore,
    refcount: AtomicUsize,
}

pub struct ConcurrencyLimiter {
    default_max_per_user: usize,
    wait_deadline: Duration,
    buckets: DashMap<UserId, Arc<UserBucket>>,
}

impl ConcurrencyLimiter {
    pub fn new(default_max_per_user: usize) -> Self {
        Self {
            default_max_per_user,
            wait_deadline: WAIT_DEADLINE,
            buckets: DashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_wait_deadline(default_max_per_user: usize, wait_deadline: Duration) -> Self {
        Self {
            default_max_per_user,
            wait_deadline,
            buckets: DashMap::new(),
        }
    }

    /// Run `op` once a permit for `user_id` is available. `max` governs the
    /// bucket's capacity the first time this user is seen; later calls for
    /// the same user reuse the already-sized bucket (config is immutable
    /// for the life of the process, so this never needs to change size).
    pub async fn with_user_limit<F, Fut, T>(&self, user_id: &UserId, max: usize, op: F) -> CoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let max = if max == 0 { self.default_max_per_user } else { max };
        let bucket = self
            .buckets
            .entry(user_id.clone())
            .or_insert_with(|| {
                Arc::new(UserBucket {
                    semaphore: Semaphore::new(max),
                    refcount: AtomicUsize::new(0),
                })
            })
            .clone();
        bucket.refcount.fetch_add(1, Ordering::SeqCst);

        let permit = match tokio::time::timeout(self.wait_deadline, bucket.semaphore.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.release(user_id, &bucket);
                return Err(CoreError::concurrency_busy(format!(
                    "concurrency semaphore closed for user {user_id}"
                )));
            }
            Err(_) => {
                self.release(user_id, &bucket);
                return Err(CoreError::concurrency_busy(format!(
                    "user {user_id} exceeded {:?} wait for a concurrency slot",
                    self.wait_deadline
                )));
            }
        };

        let result = op().await;
        drop(permit);
        self.release(user_id, &bucket);
        result
    }

    fn release(&self, user_id: &UserId, bucket: &Arc<UserBucket>) {
        let remaining = bucket.refcount.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 {
            self.buckets
                .remove_if(user_id, |_, b| Arc::ptr_eq(b, bucket) && b.refcount.load(Ordering::SeqCst) == 0);
        }
    }

    pub fn active_count(&self, user_id: &UserId) -> usize {
        self.buckets
            .get(user_id)
            .map(|b| b.refcount.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uid(s: &str) -> UserId {
        UserId::new(s).unwrap()
    }

    #[tokio::test]
    async fn bounds_in_flight_operations_per_user() {
        let limiter = Arc::new(ConcurrencyLimiter::new(2));
        let user = uid("u1");
        let active = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let user = user.clone();
            let active = active.clone();
            let max_observed = max_observed.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .with_user_limit(&user, 2, || async {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_observed.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CoreError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn wait_deadline_fails_without_holding_active() {
        let limiter = Arc::new(ConcurrencyLimiter::with_wait_deadline(1, Duration::from_millis(50)));
        let user = uid("u1");

        let blocker = {
            let limiter = limiter.clone();
            let user = user.clone();
            tokio::spawn(async move {
                limiter
                    .with_user_limit(&user, 1, || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, CoreError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = limiter
            .with_user_limit(&user, 1, || async { Ok::<_, CoreError>(()) })
            .await;
        assert!(matches!(result, Err(CoreError::ConcurrencyBusy(_))));

        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bucket_is_dropped_once_idle() {
        let limiter = ConcurrencyLimiter::new(3);
        let user = uid("u1");
        limiter
            .with_user_limit(&user, 3, || async { Ok::<_, CoreError>(()) })
            .await
            .unwrap();
        assert_eq!(limiter.active_count(&user), 0);
        assert!(limiter.buckets.get(&user).is_none());
    }
}
