//! Per-execution advisory locks.
//!
//! The lock serializes "replay, decide, append" for one execution across
//! every path that touches its log. Locks are created on first use and
//! never shared between executions.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Arena of per-execution mutexes
#[derive(Default)]
pub struct ExecutionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to an execution
    pub async fn acquire(&self, execution_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(execution_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop the lock entry for a finished execution if nobody holds it
    pub fn release(&self, execution_id: &str) {
        self.locks
            .remove_if(execution_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_execution_is_exclusive() {
        let locks = Arc::new(ExecutionLocks::new());
        let guard = locks.acquire("exec_1").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("exec_1").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_different_executions_do_not_block() {
        let locks = ExecutionLocks::new();
        let _a = locks.acquire("exec_a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("exec_b"))
            .await
            .unwrap();
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn test_release_keeps_held_locks() {
        let locks = ExecutionLocks::new();
        let guard = locks.acquire("exec_1").await;
        locks.release("exec_1");
        assert_eq!(locks.len(), 1);

        drop(guard);
        locks.release("exec_1");
        assert!(locks.is_empty());
    }
}
