//! Dynamically resizable concurrency token pool.
//!
//! A semaphore sized at `max_limit` whose effective capacity is lowered by
//! parking "reserved" permits inside the limiter itself. Shrinking never
//! interrupts in-flight holders; it only restricts future admissions, which
//! is what lets the tuner drop the target while workers are mid-download.

use tokio::sync::{Mutex, Semaphore};

pub struct AdaptiveLimiter {
    max_limit: usize,
    sem: Semaphore,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    target: usize,
    reserved: usize,
}

impl AdaptiveLimiter {
    pub fn new(max_limit: usize, initial: usize) -> Self {
        let max_limit = max_limit.max(1);
        AdaptiveLimiter {
            max_limit,
            sem: Semaphore::new(max_limit),
            state: Mutex::new(LimiterState {
                target: initial.clamp(1, max_limit),
                reserved: 0,
            }),
        }
    }

    pub fn max_limit(&self) -> usize {
        self.max_limit
    }

    /// Park the permits needed to bring capacity down to the initial target.
    /// Call once before handing the limiter to workers.
    pub async fn initialize(&self) {
        let target = self.state.lock().await.target;
        self.set_target(target).await;
    }

    /// Block until a token is available.
    pub async fn acquire(&self) {
        self.sem
            .acquire()
            .await
            .expect("limiter semaphore closed")
            .forget();
    }

    /// Return a token to the pool.
    pub fn release(&self) {
        self.sem.add_permits(1);
    }

    /// Adjust the admission target within `[1, max_limit]`. Shrinking awaits
    /// tokens back from the pool (not from holders); growing releases
    /// previously parked tokens.
    pub async fn set_target(&self, target: usize) -> usize {
        let target = target.clamp(1, self.max_limit);
        let mut state = self.state.lock().await;
        state.target = target;
        let desired_reserved = (self.max_limit - target).min(self.max_limit - 1);
        while state.reserved < desired_reserved {
            self.sem
                .acquire()
                .await
                .expect("limiter semaphore closed")
                .forget();
            state.reserved += 1;
        }
        while state.reserved > desired_reserved {
            self.sem.add_permits(1);
            state.reserved -= 1;
        }
        target
    }

    pub async fn get_target(&self) -> usize {
        self.state.lock().await.target
    }

    /// Tokens currently held by workers.
    pub async fn in_use(&self) -> usize {
        let reserved = self.state.lock().await.reserved;
        self.max_limit - reserved - self.sem.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn capacity_accounting_holds_after_resizes() {
        let limiter = AdaptiveLimiter::new(8, 3);
        limiter.initialize().await;
        assert_eq!(limiter.get_target().await, 3);
        assert_eq!(limiter.in_use().await, 0);

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.in_use().await, 2);

        limiter.set_target(6).await;
        assert_eq!(limiter.get_target().await, 6);
        assert_eq!(limiter.in_use().await, 2);

        limiter.release();
        limiter.release();
        assert_eq!(limiter.in_use().await, 0);
    }

    #[tokio::test]
    async fn in_use_never_exceeds_target() {
        let limiter = Arc::new(AdaptiveLimiter::new(4, 2));
        limiter.initialize().await;

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.in_use().await, 2);

        // Third acquire must block while the target is 2.
        let blocked = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                limiter.acquire().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());
        assert_eq!(limiter.in_use().await, 2);

        limiter.release();
        blocked.await.unwrap();
        assert_eq!(limiter.in_use().await, 2);
        limiter.release();
        limiter.release();
    }

    #[tokio::test]
    async fn shrinking_waits_for_free_tokens_not_holders() {
        let limiter = Arc::new(AdaptiveLimiter::new(4, 4));
        limiter.initialize().await;
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Dropping the target to 1 needs three reservations but only one
        // token is free; the call completes as holders release.
        let shrink = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.set_target(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shrink.is_finished());

        limiter.release();
        limiter.release();
        assert_eq!(shrink.await.unwrap(), 1);
        // The remaining holder was never interrupted.
        assert_eq!(limiter.in_use().await, 1);
        limiter.release();
        assert_eq!(limiter.in_use().await, 0);
    }

    #[tokio::test]
    async fn target_is_clamped() {
        let limiter = AdaptiveLimiter::new(5, 99);
        limiter.initialize().await;
        assert_eq!(limiter.get_target().await, 5);
        assert_eq!(limiter.set_target(0).await, 1);
        assert_eq!(limiter.set_target(50).await, 5);
    }
}
