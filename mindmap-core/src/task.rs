//! Owned background tasks.

use std::future::Future;
use tokio::task::JoinHandle;

/// A spawned task that is aborted when the guard is dropped.
///
/// Whatever the task holds (a position subscription, a pending storage
/// read) is released with it, even if the task is still mid-await.
#[derive(Debug)]
pub struct TaskGuard(JoinHandle<()>);

impl TaskGuard {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let (tx, rx) = oneshot::channel::<()>();
        let guard = TaskGuard::spawn(async move {
            // Held until the task is torn down.
            let _tx = tx;
            std::future::pending::<()>().await;
        });

        drop(guard);
        // The sender is dropped once the aborted task is cleaned up.
        assert!(rx.await.is_err());
    }
}
