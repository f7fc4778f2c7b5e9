// =============================================================================
// Market Data Module
// =============================================================================

pub mod bar_cache;
pub mod feed;

use std::sync::Arc;

use async_trait::async_trait;

use crate::exchange::{ExchangeClient, ExchangeError};
use crate::types::{Bar, Timeframe};

pub use bar_cache::{BarCache, FeedKey};
pub use feed::{FeedHealth, MarketDataFeed};

/// Source of historical bars used to prime caches before live polling and by
/// any replay driver. Implementations must return bars in ascending
/// timestamp order.
#[async_trait]
pub trait HistoricalDataSource: Send + Sync {
    async fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>, ExchangeError>;
}

/// History source backed by the exchange's kline endpoint.
pub struct ExchangeHistory(pub Arc<dyn ExchangeClient>);

#[async_trait]
impl HistoricalDataSource for ExchangeHistory {
    async fn load(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let span = (end - start).max(0);
        let limit = (span / timeframe.millis()).max(1) as usize;
        let bars = self.0.fetch_ohlcv(symbol, timeframe, limit).await?;
        Ok(bars
            .into_iter()
            .filter(|b| b.timestamp >= start && b.timestamp <= end)
            .collect())
    }
}
