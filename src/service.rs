//! Lifecycle of long-running components

use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::Result;

/// A component with an explicit start/stop lifecycle
#[async_trait]
pub trait Service: Send + Sync {
    /// Name used in logs
    fn name(&self) -> String;

    /// Start background work
    ///
    /// # Errors
    ///
    /// Returns error if the service cannot start or was already started
    async fn start(&self) -> Result<()>;

    /// Stop background work and wait for it to exit
    ///
    /// # Errors
    ///
    /// Returns error if shutdown fails
    async fn close(&self) -> Result<()>;
}

/// A spawned loop that exits when its shutdown channel fires
#[derive(Debug)]
pub struct BackgroundTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `run`, handing it the shutdown receiver to `select!` on
    pub fn spawn<F, Fut>(run: F) -> Self
    where
        F: FnOnce(mpsc::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(run(shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal shutdown and wait for the loop to exit
    pub async fn stop(self) {
        // loop may already have exited and dropped the receiver
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn stop_waits_for_exit() {
        let exited = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&exited);

        let task = BackgroundTask::spawn(|mut shutdown_rx| async move {
            shutdown_rx.recv().await;
            flag.store(true, Ordering::SeqCst);
        });

        task.stop().await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_after_loop_finished() {
        let task = BackgroundTask::spawn(|_shutdown_rx| async {});
        tokio::task::yield_now().await;
        task.stop().await;
    }
}
