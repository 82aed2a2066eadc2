//! Handoff quiesce lock.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Reader/writer gate around registry activity.
///
/// Normal work (dispatcher command processing, listing scans) holds the
/// shared side. The handoff is the only exclusive user: while it holds the
/// gate no registry read or write can observe a half-written snapshot.
///
/// Guards are `Send`, so a listing task may hold one across an await.
#[derive(Debug, Default)]
pub struct Quiesce {
    gate: RwLock<()>,
}

impl Quiesce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for shared access.
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Waits until every shared holder is gone, then blocks new ones.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let quiesce = Quiesce::new();
        let _a = quiesce.shared().await;
        let _b = quiesce.shared().await;
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_shared() {
        let quiesce = Arc::new(Quiesce::new());
        let shared = quiesce.shared().await;

        let waiter = Arc::clone(&quiesce);
        let task = tokio::spawn(async move {
            let _exclusive = waiter.exclusive().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        drop(shared);
        task.await.unwrap();
    }
}
