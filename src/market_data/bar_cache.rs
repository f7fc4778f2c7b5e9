// =============================================================================
// BarCache — bounded ring of closed bars per (symbol, timeframe)
// =============================================================================
//
// Writers are the feed poll tasks; readers take snapshot copies. No shared
// mutable frame ever escapes the cache. Bars must arrive in ascending
// timestamp order per key; stale or duplicate timestamps are ignored, and
// bars stamped in the future (clock skew) are discarded.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{Bar, Timeframe};

/// Composite key identifying one bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct FeedKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl FeedKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for FeedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Thread-safe ring buffer of the most recent closed bars per key.
pub struct BarCache {
    buffers: RwLock<HashMap<FeedKey, VecDeque<Bar>>>,
    max_bars: usize,
}

impl BarCache {
    /// Create a cache retaining at most `max_bars` closed bars per key. The
    /// capacity must cover the largest indicator lookback in use.
    pub fn new(max_bars: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Append closed bars for `key`, maintaining ascending timestamps.
    ///
    /// Returns the number of bars actually admitted. Bars at or before the
    /// current tail are skipped (incremental fetches overlap on purpose);
    /// invalid bars and bars stamped beyond `now_ms` are dropped.
    pub fn extend(&self, key: &FeedKey, bars: &[Bar], now_ms: i64) -> usize {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_bars + 1));

        let mut admitted = 0;
        for bar in bars {
            if !bar.is_valid() {
                warn!(key = %key, timestamp = bar.timestamp, "dropping invalid bar");
                continue;
            }
            if bar.timestamp > now_ms {
                warn!(
                    key = %key,
                    timestamp = bar.timestamp,
                    now = now_ms,
                    "dropping future-stamped bar (clock skew)"
                );
                continue;
            }
            if let Some(tail) = ring.back() {
                if bar.timestamp <= tail.timestamp {
                    continue;
                }
            }
            ring.push_back(*bar);
            admitted += 1;

            while ring.len() > self.max_bars {
                ring.pop_front();
            }
        }

        if admitted > 0 {
            debug!(key = %key, admitted, total = ring.len(), "bars admitted");
        }
        admitted
    }

    /// Snapshot of the most recent `count` bars (oldest first).
    pub fn recent(&self, key: &FeedKey, count: usize) -> Vec<Bar> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Timestamp of the newest bar for `key`, if any.
    pub fn tail_timestamp(&self, key: &FeedKey) -> Option<i64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back()).map(|b| b.timestamp)
    }

    /// Number of bars currently stored for `key`.
    pub fn len(&self, key: &FeedKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }

    /// Drop every series. Used by recovery when caches are suspected stale.
    pub fn clear(&self) {
        self.buffers.write().clear();
    }
}
