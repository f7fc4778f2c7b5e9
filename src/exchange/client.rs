// =============================================================================
// Exchange Client Trait — normalized operations and errors
// =============================================================================
//
// Every exchange operation returns either a normalized result or a normalized
// error. Raw exchange codes are preserved inside `ExchangeError::Rejected` so
// log lines stay reproducible against exchange documentation.
//
// The trait is object-safe; the executor holds an `Arc<dyn ExchangeClient>`
// injected at construction, so tests drive it with a scripted stub.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AccountSnapshot, Bar, Quote, Side, Timeframe};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Which wallet a balance query targets. The executor tries these in a fixed
/// order (primary first) and records which one answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceEndpoint {
    Margin,
    Spot,
}

impl std::fmt::Display for BalanceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Margin => write!(f, "margin"),
            Self::Spot => write!(f, "spot"),
        }
    }
}

/// Per-symbol order constraints from exchange metadata.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolMeta {
    /// Quantity increment; order quantities are snapped down to a multiple.
    pub lot_step: f64,
    /// Minimum order notional in quote currency.
    pub min_notional: f64,
    /// Price increment.
    pub price_tick: f64,
}

/// An open position as reported by the exchange. The id is the composite
/// `symbol:side` key, which is how one-way position mode identifies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

impl ExchangePosition {
    pub fn composite_id(symbol: &str, side: Side) -> String {
        format!("{symbol}:{side}")
    }
}

/// An executed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Normalized reason for an exchange-side order rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientFunds,
    MarketClosed,
    PriceOutOfBounds,
    InvalidSymbol,
    RateLimited,
    Unknown,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientFunds => "insufficient_funds",
            Self::MarketClosed => "market_closed",
            Self::PriceOutOfBounds => "price_out_of_bounds",
            Self::InvalidSymbol => "invalid_symbol",
            Self::RateLimited => "rate_limited",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Normalized exchange failure.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Network-level failure; retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request deadline elapsed; retryable.
    #[error("request deadline exceeded")]
    Timeout,

    /// Exchange throttled the request; retryable after backoff.
    #[error("rate limited by exchange")]
    RateLimited,

    /// The exchange refused the request. Not retryable.
    #[error("exchange rejected request (code {code}): {reason}")]
    Rejected { code: i64, reason: RejectReason },

    /// Response arrived but could not be interpreted. Not retryable.
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout | Self::RateLimited)
    }
}

/// Map a Binance-style error code onto the normalized reason.
pub fn normalize_reject_code(code: i64) -> RejectReason {
    match code {
        -2010 | -2019 => RejectReason::InsufficientFunds,
        -1013 => RejectReason::PriceOutOfBounds,
        -1121 => RejectReason::InvalidSymbol,
        -1003 | -1015 => RejectReason::RateLimited,
        -1021 | -2011 => RejectReason::Unknown,
        -4141 => RejectReason::MarketClosed,
        _ => RejectReason::Unknown,
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff delay for retry `attempt` (0-based): `base * 2^attempt`
/// capped at `cap`, plus up to 25% jitter so synchronized retries spread out.
pub fn backoff_delay(attempt: u32, base_secs: u64, cap_secs: u64) -> std::time::Duration {
    use rand::Rng;

    let exp = base_secs.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(cap_secs).max(1);
    let jitter_ms = rand::thread_rng().gen_range(0..=capped * 250);
    std::time::Duration::from_millis(capped * 1_000 + jitter_ms)
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Normalized exchange operations consumed by the executor and the feed.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<Fill, ExchangeError>;

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Fill, ExchangeError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;

    async fn fetch_balance(
        &self,
        endpoint: BalanceEndpoint,
    ) -> Result<AccountSnapshot, ExchangeError>;

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError>;

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, ExchangeError>;
}
