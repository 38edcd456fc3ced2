//! Byte-bounded LRU cache of aligned object ranges.
//!
//! Keyed by `(obj_id, aligned_start)` where `aligned_start` is the read
//! offset rounded down to the configured alignment. An entry stores the
//! loaded buffer (or `None` past EOF) together with the object-metadata
//! snapshot taken at load time; the read path revalidates that snapshot on
//! every hit, so overwritten objects are never served from cache.
//!
//! Eviction is LRU by total bytes, with empty entries charged a nominal
//! cost so EOF markers cannot grow without bound. Per-key gates give the
//! read path at-most-one in-flight load per range.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tern_types::{MdSnapshot, ObjId};
use tracing::debug;

/// Cache key: object plus aligned range start.
pub(crate) type RangeKey = (ObjId, u64);

/// Accounting cost of an entry with no buffer.
const NULL_ENTRY_COST: u64 = 1024;

/// One cached aligned range.
#[derive(Debug, Clone)]
pub(crate) struct RangeEntry {
    /// Object metadata at load time; revalidated on every hit.
    pub snapshot: MdSnapshot,
    /// The aligned range's bytes, or `None` when the range starts past EOF.
    pub buf: Option<Bytes>,
}

impl RangeEntry {
    fn cost(&self) -> u64 {
        self.buf.as_ref().map_or(NULL_ENTRY_COST, |b| b.len() as u64)
    }
}

struct CacheInner {
    /// Access order: front = oldest (eviction candidate), back = newest.
    order: VecDeque<RangeKey>,
    entries: HashMap<RangeKey, RangeEntry>,
    used_bytes: u64,
}

/// Thread-safe byte-bounded LRU over aligned ranges.
pub(crate) struct RangeCache {
    max_bytes: u64,
    inner: Mutex<CacheInner>,
    /// Per-key load gates for single-flight misses.
    gates: Mutex<HashMap<RangeKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl RangeCache {
    /// Create a cache bounded by `max_bytes`. Zero disables caching.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
                used_bytes: 0,
            }),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an entry and promote it to most-recently-used.
    pub fn lookup(&self, key: &RangeKey) -> Option<RangeEntry> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let entry = inner.entries.get(key)?.clone();
        inner.order.retain(|k| k != key);
        inner.order.push_back(*key);
        Some(entry)
    }

    /// Insert an entry, evicting least-recently-used entries over the cap.
    pub fn insert(&self, key: RangeKey, entry: RangeEntry) {
        let cost = entry.cost();
        if cost > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(old) = inner.entries.remove(&key) {
            inner.used_bytes -= old.cost();
            inner.order.retain(|k| k != &key);
        }

        while inner.used_bytes + cost > self.max_bytes {
            let Some(evict) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&evict) {
                inner.used_bytes -= evicted.cost();
                debug!(obj_id = %evict.0, aligned_start = evict.1, "evicted cached range");
            }
        }

        inner.used_bytes += cost;
        inner.entries.insert(key, entry);
        inner.order.push_back(key);
    }

    /// Drop one entry (snapshot mismatch).
    pub fn invalidate(&self, key: &RangeKey) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(old) = inner.entries.remove(key) {
            inner.used_bytes -= old.cost();
            inner.order.retain(|k| k != key);
        }
    }

    /// The load gate for one key. Holding its lock makes this task the
    /// single loader; waiters re-check the cache once the gate opens.
    pub fn gate(&self, key: RangeKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().expect("gate lock poisoned");
        Arc::clone(
            gates
                .entry(key)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Retire a key's gate after its load completed. Queued waiters keep
    /// their clone of the gate and drain through it.
    pub fn release_gate(&self, key: &RangeKey) {
        self.gates.lock().expect("gate lock poisoned").remove(key);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    /// Total accounted bytes.
    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().expect("cache lock poisoned").used_bytes
    }

    /// Whether a key is currently cached, without promoting it.
    pub fn contains(&self, key: &RangeKey) -> bool {
        self.inner
            .lock()
            .expect("cache lock poisoned")
            .entries
            .contains_key(key)
    }
}
