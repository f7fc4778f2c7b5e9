// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1.0 for longs, -1.0 for shorts. Multiplying a price move by the sign
    /// yields the favorable-direction profit.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Self::Long => Side::Short,
            Self::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Directional verdict of a signal evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Buy,
    Sell,
    None,
}

impl SignalKind {
    /// The position side this signal would open, if any.
    pub fn side(&self) -> Option<Side> {
        match self {
            Self::Buy => Some(Side::Long),
            Self::Sell => Some(Side::Short),
            Self::None => None,
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
            Self::None => write!(f, "NONE"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine modes
// ---------------------------------------------------------------------------

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Bar interval. Serialized with the exchange's short notation ("1m", "4h").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Interval length in seconds.
    pub fn secs(&self) -> u64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }

    /// Interval length in milliseconds (bar timestamps are in ms).
    pub fn millis(&self) -> i64 {
        self.secs() as i64 * 1_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market data records
// ---------------------------------------------------------------------------

/// A single closed OHLCV bar. Timestamps are exchange epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// OHLC ordering invariant: `low <= min(open, close)`,
    /// `max(open, close) <= high`, volume non-negative, all values finite.
    pub fn is_valid(&self) -> bool {
        let vals = [self.open, self.high, self.low, self.close, self.volume];
        if vals.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.low <= body_low && body_high <= self.high && self.volume >= 0.0
    }
}

/// Best bid/ask snapshot for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    /// Epoch milliseconds at which the quote was observed.
    pub as_of: i64,
}

impl Quote {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    /// (ask - bid) / mid. `None` when the book is crossed or empty.
    pub fn spread_ratio(&self) -> Option<f64> {
        let mid = self.mid();
        if self.bid <= 0.0 || self.ask <= 0.0 || self.ask < self.bid || mid <= 0.0 {
            return None;
        }
        Some((self.ask - self.bid) / mid)
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Quote-currency balance snapshot. Re-fetched on every sizing decision and
/// never cached across decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub free_quote_balance: f64,
    pub total_quote_balance: f64,
    pub as_of: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Exit reasons
// ---------------------------------------------------------------------------

/// Why a position was (or should be) closed. Serialized into the trade log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    SignalReversal,
    TimeExit,
    InsufficientLiquidity,
    /// Position vanished from the exchange while we tracked it as open.
    ExternallyClosed,
    /// Hedge pair resolved: combined pnl reached the offset target.
    CompensationOffset,
    /// Opposite-direction entry signal required closing this leg first.
    OppositeEntry,
    Shutdown,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "stop_loss",
            Self::TrailingStop => "trailing_stop",
            Self::TakeProfit => "take_profit",
            Self::SignalReversal => "signal_reversal",
            Self::TimeExit => "time_exit",
            Self::InsufficientLiquidity => "insufficient_liquidity",
            Self::ExternallyClosed => "externally_closed",
            Self::CompensationOffset => "compensation_offset",
            Self::OppositeEntry => "opposite_entry",
            Self::Shutdown => "shutdown",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            timestamp: 1_700_000_000_000,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    #[test]
    fn side_sign_and_opposite() {
        assert_eq!(Side::Long.sign(), 1.0);
        assert_eq!(Side::Short.sign(), -1.0);
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn signal_kind_maps_to_side() {
        assert_eq!(SignalKind::Buy.side(), Some(Side::Long));
        assert_eq!(SignalKind::Sell.side(), Some(Side::Short));
        assert_eq!(SignalKind::None.side(), None);
    }

    #[test]
    fn bar_validity() {
        assert!(bar(100.0, 105.0, 95.0, 102.0, 10.0).is_valid());
        // high below the body
        assert!(!bar(100.0, 101.0, 95.0, 102.0, 10.0).is_valid());
        // low above the body
        assert!(!bar(100.0, 105.0, 101.0, 102.0, 10.0).is_valid());
        // negative volume
        assert!(!bar(100.0, 105.0, 95.0, 102.0, -1.0).is_valid());
        // NaN anywhere
        assert!(!bar(f64::NAN, 105.0, 95.0, 102.0, 10.0).is_valid());
    }

    #[test]
    fn bar_validity_doji() {
        // open == close == high == low is a legal (if degenerate) bar
        assert!(bar(100.0, 100.0, 100.0, 100.0, 0.0).is_valid());
    }

    #[test]
    fn quote_spread_ratio() {
        let q = Quote {
            symbol: "BTCUSDT".into(),
            bid: 99.0,
            ask: 101.0,
            last: 100.0,
            as_of: 0,
        };
        let spread = q.spread_ratio().unwrap();
        assert!((spread - 0.02).abs() < 1e-12);

        let crossed = Quote {
            symbol: "BTCUSDT".into(),
            bid: 101.0,
            ask: 99.0,
            last: 100.0,
            as_of: 0,
        };
        assert!(crossed.spread_ratio().is_none());
    }

    #[test]
    fn timeframe_roundtrip() {
        let tf = Timeframe::H4;
        let json = serde_json::to_string(&tf).unwrap();
        assert_eq!(json, "\"4h\"");
        let back: Timeframe = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tf);
        assert_eq!(back.secs(), 14_400);
    }

    #[test]
    fn exit_reason_display_is_snake_case() {
        assert_eq!(ExitReason::TrailingStop.to_string(), "trailing_stop");
        assert_eq!(ExitReason::ExternallyClosed.to_string(), "externally_closed");
    }
}
