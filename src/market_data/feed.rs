// =============================================================================
// MarketDataFeed — poll-driven bar refresh with per-subscription health
// =============================================================================
//
// One background task ticks once per second. A subscription is refreshed when
// its cache tail is old enough that a new closed bar must exist on the
// exchange. Fetches are incremental windows; still-forming bars are filtered
// before they reach the cache. Transient fetch errors back off exponentially
// per subscription; after enough consecutive failures the subscription is
// marked degraded and surfaced through `health_status()` while retries
// continue.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::exchange::client::backoff_delay;
use crate::exchange::ExchangeClient;
use crate::market_data::bar_cache::{BarCache, FeedKey};
use crate::market_data::HistoricalDataSource;
use crate::types::{Bar, Timeframe};

/// Consecutive failures after which a subscription reads degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Window size of an incremental fetch. Wide enough to bridge short outages
/// without a full reprime.
const INCREMENTAL_FETCH_BARS: usize = 50;

/// Health of one subscription, surfaced to the health check and the API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeedHealth {
    pub degraded: bool,
    pub consecutive_failures: u32,
    /// Epoch ms of the last successful refresh.
    pub last_ok_ms: Option<i64>,
}

struct SubscriptionState {
    health: FeedHealth,
    /// Epoch ms before which the next retry is suppressed.
    next_attempt_ms: i64,
}

/// Poll-driven market data feed over the exchange client.
pub struct MarketDataFeed {
    cache: Arc<BarCache>,
    client: Arc<dyn ExchangeClient>,
    subscriptions: RwLock<Vec<FeedKey>>,
    states: RwLock<HashMap<FeedKey, SubscriptionState>>,
    shutdown: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    backoff_base_secs: u64,
    backoff_cap_secs: u64,
}

impl MarketDataFeed {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        cache_bars: usize,
        backoff_base_secs: u64,
        backoff_cap_secs: u64,
    ) -> Self {
        Self {
            cache: Arc::new(BarCache::new(cache_bars)),
            client,
            subscriptions: RwLock::new(Vec::new()),
            states: RwLock::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            backoff_base_secs,
            backoff_cap_secs,
        }
    }

    // -------------------------------------------------------------------------
    // Subscription management
    // -------------------------------------------------------------------------

    /// Register interest in a (symbol, timeframe) series. Idempotent.
    pub fn subscribe(&self, symbol: &str, timeframe: Timeframe) {
        let key = FeedKey::new(symbol, timeframe);
        let mut subs = self.subscriptions.write();
        if !subs.contains(&key) {
            info!(key = %key, "feed subscription registered");
            subs.push(key.clone());
            self.states.write().insert(
                key,
                SubscriptionState {
                    health: FeedHealth::default(),
                    next_attempt_ms: 0,
                },
            );
        }
    }

    /// Snapshot of the most recent `count` closed bars, oldest first.
    pub fn get_recent_bars(&self, symbol: &str, timeframe: Timeframe, count: usize) -> Vec<Bar> {
        self.cache
            .recent(&FeedKey::new(symbol, timeframe), count)
    }

    /// Per-subscription health snapshot.
    pub fn health_status(&self) -> HashMap<FeedKey, FeedHealth> {
        self.states
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.health.clone()))
            .collect()
    }

    /// True when any subscription is currently degraded.
    pub fn any_degraded(&self) -> bool {
        self.states.read().values().any(|s| s.health.degraded)
    }

    /// Drop all cached bars. The next poll cycle refetches from scratch.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // -------------------------------------------------------------------------
    // Priming
    // -------------------------------------------------------------------------

    /// Load `history_bars` of history for every subscription before the
    /// first live evaluation.
    pub async fn prime(
        &self,
        source: &dyn HistoricalDataSource,
        history_bars: usize,
    ) {
        let subs = self.subscriptions.read().clone();
        let now_ms = Utc::now().timestamp_millis();

        for key in subs {
            let start = now_ms - key.timeframe.millis() * history_bars as i64;
            match source.load(&key.symbol, key.timeframe, start, now_ms).await {
                Ok(bars) => {
                    let admitted = self.cache.extend(&key, &bars, now_ms);
                    info!(key = %key, admitted, "history primed");
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "history prime failed");
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Background task
    // -------------------------------------------------------------------------

    /// Spawn the poll task. Call once after subscriptions are registered.
    pub fn start(self: Arc<Self>) {
        let feed = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            info!("market data feed started");

            while !feed.shutdown.load(Ordering::Relaxed) {
                ticker.tick().await;
                feed.poll_cycle().await;
            }

            info!("market data feed stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Ask the poll task to finish its current iteration and exit.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    /// One pass over all subscriptions.
    async fn poll_cycle(&self) {
        let subs = self.subscriptions.read().clone();
        let now_ms = Utc::now().timestamp_millis();

        for key in subs {
            let due = {
                let states = self.states.read();
                states
                    .get(&key)
                    .map(|s| now_ms >= s.next_attempt_ms)
                    .unwrap_or(true)
            };
            if !due {
                continue;
            }

            let tail = self.cache.tail_timestamp(&key);
            if !needs_refresh(tail, now_ms, key.timeframe) {
                continue;
            }

            self.poll_subscription(&key, now_ms).await;
        }
    }

    /// Fetch an incremental window for one subscription and update health.
    async fn poll_subscription(&self, key: &FeedKey, now_ms: i64) {
        match self
            .client
            .fetch_ohlcv(&key.symbol, key.timeframe, INCREMENTAL_FETCH_BARS)
            .await
        {
            Ok(bars) => {
                let closed = filter_closed(&bars, key.timeframe, now_ms);
                let admitted = self.cache.extend(key, &closed, now_ms);
                debug!(key = %key, fetched = bars.len(), admitted, "feed refresh");

                let mut states = self.states.write();
                if let Some(state) = states.get_mut(key) {
                    if state.health.degraded {
                        info!(key = %key, "feed subscription recovered");
                    }
                    state.health.degraded = false;
                    state.health.consecutive_failures = 0;
                    state.health.last_ok_ms = Some(now_ms);
                    state.next_attempt_ms = 0;
                }
            }
            Err(e) => {
                let mut states = self.states.write();
                if let Some(state) = states.get_mut(key) {
                    state.health.consecutive_failures += 1;
                    let failures = state.health.consecutive_failures;
                    let delay =
                        backoff_delay(failures - 1, self.backoff_base_secs, self.backoff_cap_secs);
                    state.next_attempt_ms = now_ms + delay.as_millis() as i64;

                    if failures >= DEGRADED_AFTER_FAILURES && !state.health.degraded {
                        state.health.degraded = true;
                        error!(
                            key = %key,
                            failures,
                            error = %e,
                            "feed subscription marked degraded"
                        );
                    } else {
                        warn!(
                            key = %key,
                            failures,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %e,
                            "feed refresh failed"
                        );
                    }
                }
            }
        }
    }
}

/// Whether a new closed bar should exist given the cache tail.
///
/// A bar stamped `tail` closes at `tail + interval`; the following bar closes
/// one interval later. An empty cache always refreshes.
fn needs_refresh(tail: Option<i64>, now_ms: i64, timeframe: Timeframe) -> bool {
    match tail {
        None => true,
        Some(tail_ms) => now_ms - tail_ms >= 2 * timeframe.millis(),
    }
}

/// Keep only bars whose interval has fully elapsed; the exchange includes the
/// still-forming bar at the end of every kline window.
fn filter_closed(bars: &[Bar], timeframe: Timeframe, now_ms: i64) -> Vec<Bar> {
    bars.iter()
        .filter(|b| b.timestamp + timeframe.millis() <= now_ms)
        .copied()
        .collect()
}

impl std::fmt::Debug for MarketDataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataFeed")
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}
