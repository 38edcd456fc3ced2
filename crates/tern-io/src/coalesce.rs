//! Batching stage between the encoder and the uploader.
//!
//! Buffers items and flushes on whichever fires first: `max_len` items
//! buffered, or `max_wait` elapsed since the first buffered item. Ordering
//! is preserved, and any residue is flushed when the input closes. The
//! point is to amortize one mapping round-trip over many chunks without
//! stalling short streams.

use std::time::Duration;

use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// Run the coalescer until the input closes or the output is dropped.
pub(crate) async fn coalesce<T: Send + 'static>(
    mut rx: Receiver<T>,
    tx: Sender<Vec<T>>,
    max_len: usize,
    max_wait: Duration,
) {
    let max_len = max_len.max(1);
    let mut buf: Vec<T> = Vec::with_capacity(max_len);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    if buf.is_empty() {
                        deadline = Some(Instant::now() + max_wait);
                    }
                    buf.push(item);
                    if buf.len() >= max_len {
                        trace!(len = buf.len(), "coalescer flush: length cap");
                        deadline = None;
                        if tx.send(std::mem::take(&mut buf)).await.is_err() {
                            return;
                        }
                    }
                }
                None => break,
            },
            // Armed only while something is buffered.
            _ = async { sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                trace!(len = buf.len(), "coalescer flush: deadline");
                deadline = None;
                if !buf.is_empty()
                    && tx.send(std::mem::take(&mut buf)).await.is_err()
                {
                    return;
                }
            }
        }
    }

    // Input closed: flush the residue.
    if !buf.is_empty() {
        trace!(len = buf.len(), "coalescer flush: residue");
        let _ = tx.send(buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn spawn_coalescer(
        max_len: usize,
        max_wait: Duration,
    ) -> (mpsc::Sender<u32>, mpsc::Receiver<Vec<u32>>) {
        let (tx_in, rx_in) = mpsc::channel(64);
        let (tx_out, rx_out) = mpsc::channel(64);
        tokio::spawn(coalesce(rx_in, tx_out, max_len, max_wait));
        (tx_in, rx_out)
    }

    #[tokio::test]
    async fn test_flush_on_length() {
        let (tx, mut rx) = spawn_coalescer(3, Duration::from_secs(3600));
        for i in 0..7u32 {
            tx.send(i).await.unwrap();
        }
        assert_eq!(rx.recv().await.unwrap(), vec![0, 1, 2]);
        assert_eq!(rx.recv().await.unwrap(), vec![3, 4, 5]);
        drop(tx);
        assert_eq!(rx.recv().await.unwrap(), vec![6], "residue flushed on close");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_on_deadline() {
        let (tx, mut rx) = spawn_coalescer(100, Duration::from_millis(10));
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        // Nothing reaches the length cap; the deadline must flush.
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_measured_from_first_item() {
        let (tx, mut rx) = spawn_coalescer(100, Duration::from_millis(50));
        tx.send(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(2).await.unwrap();
        // 50 ms after the FIRST item the batch flushes, containing both.
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_order_preserved_across_batches() {
        let (tx, mut rx) = spawn_coalescer(5, Duration::from_millis(1));
        for i in 0..23u32 {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        let mut all = Vec::new();
        while let Some(batch) = rx.recv().await {
            all.extend(batch);
        }
        assert_eq!(all, (0..23).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_empty_input_produces_no_batches() {
        let (tx, mut rx) = spawn_coalescer(5, Duration::from_millis(1));
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_output_dropped() {
        let (tx_in, rx_in) = mpsc::channel(4);
        let (tx_out, rx_out) = mpsc::channel::<Vec<u32>>(1);
        let handle = tokio::spawn(coalesce(rx_in, tx_out, 1, Duration::from_millis(1)));
        drop(rx_out);
        tx_in.send(1).await.unwrap();
        // The stage must terminate instead of spinning.
        handle.await.unwrap();
    }
}
