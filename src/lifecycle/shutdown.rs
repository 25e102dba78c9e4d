//! Shutdown coordination for the proxy.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How long in-flight requests (open streams included) may run after the
/// listener stops accepting.
pub const DEFAULT_DRAIN_PERIOD: Duration = Duration::from_secs(30);

/// Broadcast coordinator. The server and any background task subscribe; one
/// `trigger` stops them all.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Subscribers that have not dropped their receiver yet.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait for `task` to finish, aborting it after `period`. Returns `true` when
/// it finished on its own.
pub async fn drain<T>(mut task: JoinHandle<T>, period: Duration) -> bool {
    match tokio::time::timeout(period, &mut task).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Server task failed during drain");
            true
        }
        Err(_) => {
            tracing::warn!(drain_secs = period.as_secs(), "Drain period elapsed, closing remaining connections");
            task.abort();
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.subscribe();
        assert_eq!(shutdown.receiver_count(), 2);

        shutdown.trigger();
        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }

    #[tokio::test]
    async fn drain_aborts_stuck_tasks() {
        let quick = tokio::spawn(async {});
        assert!(drain(quick, Duration::from_secs(1)).await);

        let stuck = tokio::spawn(std::future::pending::<()>());
        assert!(!drain(stuck, Duration::from_millis(20)).await);
    }
}
