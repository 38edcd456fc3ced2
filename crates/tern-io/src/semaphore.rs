//! Concurrency governors: the stream byte semaphore and keyed read limits.
//!
//! The byte gate is the engine's sole memory-admission mechanism — every
//! upload and every read-stream pull reserves its byte footprint here
//! before touching data, so total in-flight bytes stay under the
//! configured cap without any unbounded queues. Acquisition carries a
//! timeout; sustained timeouts indicate endpoint overload and are reported
//! upstream at most once per hour.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tern_types::NodeId;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::IoError;

/// Seconds between stress reports for the same gate.
const STRESS_REPORT_INTERVAL_SECS: u64 = 3600;

/// Byte-denominated admission semaphore with acquisition timeout.
pub struct ByteGate {
    permits: Arc<Semaphore>,
    cap: u64,
    timeout: Duration,
    /// Tasks currently blocked in `acquire` — the prefetch gate reads this.
    waiters: AtomicUsize,
    /// Unix seconds of the last stress report, zero when none was sent.
    last_stress_report: AtomicU64,
}

/// An admission slot measured in bytes. Dropping it returns the bytes.
#[derive(Debug)]
pub struct BytePermit {
    _permit: OwnedSemaphorePermit,
    bytes: u64,
}

impl BytePermit {
    /// Bytes reserved by this permit.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl ByteGate {
    /// Create a gate admitting up to `cap` bytes.
    pub fn new(cap: u64, timeout: Duration) -> Self {
        // Tokio permits are usize-denominated; clamp huge byte caps.
        let permits = cap.min(Semaphore::MAX_PERMITS as u64) as usize;
        Self {
            permits: Arc::new(Semaphore::new(permits)),
            cap,
            timeout,
            waiters: AtomicUsize::new(0),
            last_stress_report: AtomicU64::new(0),
        }
    }

    /// Total capacity in bytes.
    pub fn cap(&self) -> u64 {
        self.cap
    }

    /// Bytes currently available.
    pub fn available(&self) -> u64 {
        self.permits.available_permits() as u64
    }

    /// Tasks currently waiting to acquire.
    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Reserve `bytes` (clamped to the cap), failing with
    /// [`IoError::StreamItemTimeout`] when the gate stays full past the
    /// configured timeout.
    pub async fn acquire(&self, bytes: u64) -> Result<BytePermit, IoError> {
        let clamped = bytes.clamp(1, self.cap).min(u32::MAX as u64) as u32;
        self.waiters.fetch_add(1, Ordering::Relaxed);
        let acquired = tokio::time::timeout(
            self.timeout,
            Arc::clone(&self.permits).acquire_many_owned(clamped),
        )
        .await;
        self.waiters.fetch_sub(1, Ordering::Relaxed);

        match acquired {
            Ok(Ok(permit)) => Ok(BytePermit {
                _permit: permit,
                bytes: clamped as u64,
            }),
            Ok(Err(_)) => Err(IoError::Pipeline("byte gate closed".to_string())),
            Err(_) => {
                warn!(bytes, timeout = ?self.timeout, "stream admission timed out");
                Err(IoError::StreamItemTimeout(self.timeout))
            }
        }
    }

    /// Whether a stress report should be sent now. Rate-limited to one per
    /// hour via compare-and-swap on the last report timestamp.
    pub fn should_report_stress(&self) -> bool {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let last = self.last_stress_report.load(Ordering::Relaxed);
        if now.saturating_sub(last) < STRESS_REPORT_INTERVAL_SECS {
            return false;
        }
        self.last_stress_report
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

/// Lazily-created per-agent semaphores, keyed by [`NodeId`].
pub struct KeyedSemaphores {
    per_key: usize,
    map: Mutex<HashMap<NodeId, Arc<Semaphore>>>,
}

impl KeyedSemaphores {
    /// Create a keyed set with `per_key` slots per agent.
    pub fn new(per_key: usize) -> Self {
        Self {
            per_key: per_key.max(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// The semaphore for one agent, created on first use.
    pub fn get(&self, node_id: NodeId) -> Arc<Semaphore> {
        let mut map = self.map.lock().expect("keyed semaphore lock poisoned");
        Arc::clone(
            map.entry(node_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_key))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let gate = ByteGate::new(1000, Duration::from_secs(1));
        let permit = gate.acquire(600).await.unwrap();
        assert_eq!(permit.bytes(), 600);
        assert_eq!(gate.available(), 400);
        drop(permit);
        assert_eq!(gate.available(), 1000);
    }

    #[tokio::test]
    async fn test_oversized_request_clamps_to_cap() {
        let gate = ByteGate::new(1000, Duration::from_secs(1));
        let permit = gate.acquire(u64::MAX).await.unwrap();
        assert_eq!(permit.bytes(), 1000, "request must clamp to the cap");
        assert_eq!(gate.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_full() {
        let gate = ByteGate::new(100, Duration::from_millis(50));
        let _held = gate.acquire(100).await.unwrap();
        let err = gate.acquire(1).await.unwrap_err();
        assert!(matches!(err, IoError::StreamItemTimeout(_)));
    }

    #[tokio::test]
    async fn test_waiters_gauge() {
        let gate = Arc::new(ByteGate::new(100, Duration::from_secs(5)));
        let _held = gate.acquire(100).await.unwrap();
        assert_eq!(gate.waiting(), 0);

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(50).await })
        };
        // Give the waiter a chance to block.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.waiting(), 1);

        drop(_held);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test]
    async fn test_stress_report_once_per_hour() {
        let gate = ByteGate::new(1, Duration::from_millis(1));
        assert!(gate.should_report_stress(), "first report goes through");
        assert!(!gate.should_report_stress(), "second within the hour is dropped");
    }

    #[tokio::test]
    async fn test_concurrent_holds_bounded_by_cap() {
        let gate = Arc::new(ByteGate::new(300, Duration::from_secs(5)));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(100).await.unwrap();
                // While held, no more than cap/100 permits can coexist.
                assert!(gate.available() <= 200);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(gate.available(), 300);
    }

    #[tokio::test]
    async fn test_keyed_semaphores_isolated_per_agent() {
        let keyed = KeyedSemaphores::new(2);
        let a = NodeId::from_data(b"agent-a");
        let b = NodeId::from_data(b"agent-b");

        let sem_a = keyed.get(a);
        let _p1 = sem_a.clone().acquire_owned().await.unwrap();
        let _p2 = sem_a.clone().acquire_owned().await.unwrap();
        assert_eq!(sem_a.available_permits(), 0, "agent a is saturated");

        // Agent b is unaffected.
        assert_eq!(keyed.get(b).available_permits(), 2);

        // Same key returns the same semaphore.
        assert_eq!(keyed.get(a).available_permits(), 0);
    }
}
