//! Batch coalescing for sink ingest queues.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Coalescing parameters for one sink queue.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Flush as soon as this many items have accumulated.
    pub max_size: usize,
    /// Flush this long after the first item of a batch arrived, full or not.
    pub flush_interval: Duration,
}

/// Receive the next batch from `rx`.
///
/// Blocks until at least one item is available, then keeps accumulating
/// until either `max_size` items are in hand or `flush_interval` has
/// elapsed since the first one. Returns `None` once the channel is closed
/// and drained.
pub async fn next_batch<T>(rx: &mut mpsc::Receiver<T>, config: &BatchConfig) -> Option<Vec<T>> {
    let first = rx.recv().await?;
    let mut batch = Vec::with_capacity(config.max_size.min(64));
    batch.push(first);

    let deadline = Instant::now() + config.flush_interval;
    while batch.len() < config.max_size {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(item)) => batch.push(item),
            // Channel closed: flush what we have.
            Ok(None) => break,
            // Interval elapsed.
            Err(_) => break,
        }
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const CONFIG: BatchConfig = BatchConfig {
        max_size: 3,
        flush_interval: Duration::from_millis(100),
    };

    #[tokio::test]
    async fn flushes_when_full() {
        let (tx, mut rx) = mpsc::channel(16);
        for i in 0..5 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(next_batch(&mut rx, &CONFIG).await, Some(vec![0, 1, 2]));
        assert_eq!(next_batch(&mut rx, &CONFIG).await, Some(vec![3, 4]));
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_partial_batch_after_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        tx.send(1).await.unwrap();
        let batch = tokio::spawn(async move { next_batch(&mut rx, &CONFIG).await });
        // Nothing else arrives; the interval elapses under paused time.
        assert_eq!(batch.await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn closed_channel_yields_none() {
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        drop(tx);
        assert_eq!(next_batch(&mut rx, &CONFIG).await, None);
    }

    #[tokio::test]
    async fn closed_channel_flushes_remainder() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(7).await.unwrap();
        tx.send(8).await.unwrap();
        drop(tx);
        assert_eq!(next_batch(&mut rx, &CONFIG).await, Some(vec![7, 8]));
        assert_eq!(next_batch(&mut rx, &CONFIG).await, None);
    }
}
