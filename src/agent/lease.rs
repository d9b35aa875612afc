//! Per-thread leases: at most one in-flight turn per thread id in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type ThreadLease = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct ThreadLeases {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ThreadLeases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other turn holds `thread_id`. Released on drop.
    pub async fn acquire(&self, thread_id: &str) -> ThreadLease {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Idle entries are only referenced by the map.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_same_thread_is_serialized() {
        let leases = Arc::new(ThreadLeases::new());
        let first = leases.acquire("t-1").await;

        let contender = {
            let leases = leases.clone();
            tokio::spawn(async move {
                let _lease = leases.acquire("t-1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_threads_do_not_block() {
        let leases = ThreadLeases::new();
        let _a = leases.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_secs(1), leases.acquire("b"))
            .await
            .unwrap();
        assert_eq!(leases.active(), 2);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let leases = ThreadLeases::new();
        drop(leases.acquire("gone").await);
        let _held = leases.acquire("kept").await;
        assert_eq!(leases.locks.lock().unwrap().len(), 1);
    }
}
