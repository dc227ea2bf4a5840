use crate::error::Result;
use crate::types::ChunkNotification;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Blocks a reader until the chunk it needs may exist.
///
/// Returning is only a hint: callers always re-check storage afterwards, so
/// an implementation may return early or simply sleep for the timeout.
#[async_trait]
pub trait ChunkWaiter: Send + Sync {
    async fn wait_for_chunk(&self, notification: &ChunkNotification);
}

/// Announces that a chunk finished writing. Best-effort; a lost notification
/// only delays readers until their next poll.
#[async_trait]
pub trait ChunkNotifier: Send + Sync {
    async fn notify(&self, notification: &ChunkNotification) -> Result<()>;
}

/// Poll-only waiter: sleeps one timeout window.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollingWaiter;

#[async_trait]
impl ChunkWaiter for PollingWaiter {
    async fn wait_for_chunk(&self, notification: &ChunkNotification) {
        tokio::time::sleep(notification.timeout).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl ChunkNotifier for NoopNotifier {
    async fn notify(&self, _notification: &ChunkNotification) -> Result<()> {
        Ok(())
    }
}

/// In-process waiter and notifier backed by a broadcast channel.
///
/// Waiters only wake for notifications on their own chunk directory that
/// cover the chunk they are waiting for. Slow waiters that lag behind the
/// channel return immediately and fall back to polling.
#[derive(Debug, Clone)]
pub struct LocalChunkBroadcaster {
    sender: broadcast::Sender<ChunkNotification>,
}

impl LocalChunkBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalChunkBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl ChunkNotifier for LocalChunkBroadcaster {
    async fn notify(&self, notification: &ChunkNotification) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(notification.clone());
        Ok(())
    }
}

#[async_trait]
impl ChunkWaiter for LocalChunkBroadcaster {
    async fn wait_for_chunk(&self, notification: &ChunkNotification) {
        let mut receiver = self.sender.subscribe();
        let wait = async {
            loop {
                match receiver.recv().await {
                    Ok(seen)
                        if seen.key == notification.key && seen.chunk >= notification.chunk =>
                    {
                        return;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "Chunk waiter for {} lagged by {} notifications",
                            notification.key,
                            skipped
                        );
                        return;
                    }
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };
        let _ = tokio::time::timeout(notification.timeout, wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn notification(key: &str, chunk: u64, timeout: Duration) -> ChunkNotification {
        ChunkNotification {
            key: key.to_string(),
            chunk,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_polling_waiter_sleeps_for_timeout() {
        let started = Instant::now();
        PollingWaiter
            .wait_for_chunk(&notification("a/b", 1, Duration::from_millis(30)))
            .await;
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_broadcaster_wakes_matching_waiter() {
        let broadcaster = Arc::new(LocalChunkBroadcaster::default());
        let waiter = Arc::clone(&broadcaster);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_chunk(&notification("a/b", 2, Duration::from_secs(10)))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster
            .notify(&notification("a/b", 2, Duration::from_secs(10)))
            .await
            .unwrap();

        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_broadcaster_ignores_other_keys() {
        let broadcaster = Arc::new(LocalChunkBroadcaster::default());
        let waiter = Arc::clone(&broadcaster);

        let started = Instant::now();
        let handle = tokio::spawn(async move {
            waiter
                .wait_for_chunk(&notification("a/b", 1, Duration::from_millis(150)))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        broadcaster
            .notify(&notification("a/other", 1, Duration::ZERO))
            .await
            .unwrap();
        broadcaster
            .notify(&notification("a/b", 0, Duration::ZERO))
            .await
            .unwrap();

        handle.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
