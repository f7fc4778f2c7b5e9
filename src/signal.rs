// =============================================================================
// Signal Engine — deterministic filters over scored feature frames
// =============================================================================
//
// Pipeline per ready bar:
//   1. Scorer confidence must sit inside [ml_threshold_min, ml_threshold_max]
//   2. Heikin-Ashi candle direction sets the trend
//   3. RSI must leave room in the trade direction
//   4. ATR / close must stay under the volatility cap
//   5. Volume must confirm against its SMA
//
// The engine is stateless between calls so the same code path serves live
// evaluation and replay. Exit decisions for open positions live here too so
// the monitor and the orchestrator share one source of truth.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

use crate::config::{RiskConfig, SignalConfig};
use crate::features::FeatureFrame;
use crate::store::Position;
use crate::types::{Bar, ExitReason, SignalKind};

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Why an evaluation accepted or refused to signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalReason {
    Accepted,
    FrameNotReady,
    ScorerUnavailable,
    ConfidenceOutOfRange,
    ExtremeVolatility,
    WeakVolume,
    NoTrendAlignment,
}

/// Result of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub confidence: f64,
    pub reason: SignalReason,
}

impl Signal {
    fn none(confidence: f64, reason: SignalReason) -> Self {
        Self {
            kind: SignalKind::None,
            confidence,
            reason,
        }
    }

    /// A refused signal for paths where no confidence was produced at all
    /// (scorer missing or frame not ready).
    pub fn refused(reason: SignalReason) -> Self {
        Self::none(0.0, reason)
    }
}

// ---------------------------------------------------------------------------
// Entry intent
// ---------------------------------------------------------------------------

/// A fully-specified entry decision, pre-sizing. Constructed only through
/// `SignalEngine::build_intent`, which upholds the price-side invariants.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntryIntent {
    pub symbol: String,
    pub side: crate::types::Side,
    pub entry_price: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub trailing_stop_fraction: f64,
    pub risk_fraction: f64,
    pub atr_at_entry: f64,
    pub confidence: f64,
}

impl EntryIntent {
    /// Reward-to-risk ratio implied by the intent prices.
    pub fn rr_ratio(&self) -> f64 {
        let risk = (self.entry_price - self.stop_loss_price).abs();
        let reward = (self.take_profit_price - self.entry_price).abs();
        if risk > 0.0 {
            reward / risk
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntentError {
    #[error("signal has no direction")]
    NoDirection,
    #[error("ATR is not usable for stop placement")]
    InvalidAtr,
    #[error("bar close is not a usable entry price")]
    InvalidPrice,
}

// ---------------------------------------------------------------------------
// Close decision
// ---------------------------------------------------------------------------

/// Verdict of `should_close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseDecision {
    pub close: bool,
    pub reason: Option<ExitReason>,
}

impl CloseDecision {
    pub fn hold() -> Self {
        Self {
            close: false,
            reason: None,
        }
    }

    pub fn close(reason: ExitReason) -> Self {
        Self {
            close: true,
            reason: Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Stateless signal engine parameterized by the current configuration.
/// Construct per evaluation pass; holding it across config reloads is safe
/// but sees stale thresholds.
pub struct SignalEngine {
    signal: SignalConfig,
    risk: RiskConfig,
}

impl SignalEngine {
    pub fn new(signal: SignalConfig, risk: RiskConfig) -> Self {
        Self { signal, risk }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate the latest ready frame under the scorer's confidence.
    pub fn evaluate(&self, frame: &FeatureFrame, confidence: f64) -> Signal {
        if !frame.ready {
            return Signal::refused(SignalReason::FrameNotReady);
        }

        // Confidence window: equality at the floor accepts, outside rejects.
        if confidence < self.signal.ml_threshold_min || confidence > self.signal.ml_threshold_max {
            return Signal::none(confidence, SignalReason::ConfidenceOutOfRange);
        }

        // Volatility cap.
        if frame.atr_ratio() >= self.signal.atr_ratio_cap {
            return Signal::none(confidence, SignalReason::ExtremeVolatility);
        }

        // Volume confirmation.
        if frame.volume_sma <= 0.0
            || frame.bar.volume < frame.volume_sma * self.signal.volume_ratio_min
        {
            return Signal::none(confidence, SignalReason::WeakVolume);
        }

        let bullish = frame.ha_close > frame.ha_open;
        let bearish = frame.ha_close < frame.ha_open;
        let rsi_room_long = frame.rsi < self.signal.rsi_overbought;
        let rsi_room_short = frame.rsi > self.signal.rsi_oversold;

        if bullish && rsi_room_long {
            Signal {
                kind: SignalKind::Buy,
                confidence,
                reason: SignalReason::Accepted,
            }
        } else if bearish && rsi_room_short {
            Signal {
                kind: SignalKind::Sell,
                confidence,
                reason: SignalReason::Accepted,
            }
        } else {
            Signal::none(confidence, SignalReason::NoTrendAlignment)
        }
    }

    // -------------------------------------------------------------------------
    // Intent construction
    // -------------------------------------------------------------------------

    /// Turn an accepted signal into a fully-specified entry intent.
    ///
    /// BUY:  stop = entry - atr * atr_stop_multiplier,
    ///       tp   = entry + (entry - stop) * min_rr_ratio. SELL mirrors.
    pub fn build_intent(
        &self,
        symbol: &str,
        signal: &Signal,
        last_bar: &Bar,
        atr: f64,
    ) -> Result<EntryIntent, IntentError> {
        let side = signal.kind.side().ok_or(IntentError::NoDirection)?;

        if !atr.is_finite() || atr <= 0.0 {
            return Err(IntentError::InvalidAtr);
        }
        let entry_price = last_bar.close;
        if !entry_price.is_finite() || entry_price <= 0.0 {
            return Err(IntentError::InvalidPrice);
        }

        let stop_distance = atr * self.signal.atr_stop_multiplier;
        let stop_loss_price = entry_price - side.sign() * stop_distance;
        let take_profit_price =
            entry_price + side.sign() * stop_distance * self.risk.min_rr_ratio;

        Ok(EntryIntent {
            symbol: symbol.to_string(),
            side,
            entry_price,
            stop_loss_price,
            take_profit_price,
            trailing_stop_fraction: self.signal.trailing_stop_fraction,
            risk_fraction: self.risk.risk_per_trade_fraction,
            atr_at_entry: atr,
            confidence: signal.confidence,
        })
    }

    // -------------------------------------------------------------------------
    // Exit decision
    // -------------------------------------------------------------------------

    /// Decide whether an open position should be closed at `current_price`.
    ///
    /// `fresh_signal` is the evaluation of the latest bar (for reversal
    /// detection); `features` the latest frame (for the liquidity floor);
    /// `bars_since_entry` drives the time exit.
    pub fn should_close(
        &self,
        position: &Position,
        current_price: f64,
        features: Option<&FeatureFrame>,
        fresh_signal: Option<&Signal>,
        bars_since_entry: u64,
    ) -> CloseDecision {
        let sign = position.side.sign();

        // 1. Stop crossing. The trailing flag decides how the exit is
        //    reported; the price test is identical.
        let stop_crossed = sign * (current_price - position.stop_loss) <= 0.0;
        if stop_crossed {
            let reason = if position.trailing_updated {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            return CloseDecision::close(reason);
        }

        // 2. Take profit.
        if sign * (current_price - position.take_profit) >= 0.0 {
            return CloseDecision::close(ExitReason::TakeProfit);
        }

        // 3. Signal reversal: an accepted opposite-direction signal at or
        //    above the confidence floor.
        if let Some(fresh) = fresh_signal {
            if fresh.reason == SignalReason::Accepted
                && fresh.kind.side() == Some(position.side.opposite())
                && fresh.confidence >= self.signal.ml_threshold_min
            {
                return CloseDecision::close(ExitReason::SignalReversal);
            }
        }

        // 4. Time exit (disabled when the configured bar count is zero).
        if self.signal.time_exit_bars > 0 && bars_since_entry >= self.signal.time_exit_bars {
            return CloseDecision::close(ExitReason::TimeExit);
        }

        // 5. Liquidity floor: volume collapsed far below its average.
        if let Some(frame) = features {
            if frame.ready
                && frame.volume_sma > 0.0
                && frame.bar.volume < frame.volume_sma * self.signal.liquidity_floor_ratio
            {
                return CloseDecision::close(ExitReason::InsufficientLiquidity);
            }
        }

        CloseDecision::hold()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::PositionStore;
    use crate::types::Side;

    fn engine() -> SignalEngine {
        SignalEngine::new(SignalConfig::default(), RiskConfig::default())
    }

    /// Frame matching scenario S1: bullish HA candle, RSI 55, healthy
    /// volume, close 30000, atr 300.
    fn s1_frame() -> FeatureFrame {
        FeatureFrame {
            bar: Bar {
                timestamp: 0,
                open: 29_900.0,
                high: 30_100.0,
                low: 29_800.0,
                close: 30_000.0,
                volume: 150.0,
            },
            atr: 300.0,
            rsi: 55.0,
            ha_open: 29_900.0,
            ha_close: 30_000.0,
            ema_fast: 29_950.0,
            ema_slow: 29_800.0,
            volume_sma: 100.0,
            ready: true,
        }
    }

    fn bearish_frame() -> FeatureFrame {
        let mut f = s1_frame();
        f.ha_open = 30_000.0;
        f.ha_close = 29_900.0;
        f.rsi = 45.0;
        f
    }

    fn open_long() -> Position {
        PositionStore::build_position(
            "BTCUSDT",
            Side::Long,
            100.0,
            1.0,
            95.0,
            112.5,
            0.65,
            2.0,
            0.6,
            None,
            None,
        )
    }

    // --- evaluate -----------------------------------------------------------

    #[test]
    fn s1_bullish_frame_produces_buy() {
        let sig = engine().evaluate(&s1_frame(), 0.6);
        assert_eq!(sig.kind, SignalKind::Buy);
        assert_eq!(sig.reason, SignalReason::Accepted);
        assert_eq!(sig.confidence, 0.6);
    }

    #[test]
    fn bearish_frame_produces_sell() {
        let sig = engine().evaluate(&bearish_frame(), 0.6);
        assert_eq!(sig.kind, SignalKind::Sell);
    }

    #[test]
    fn confidence_boundaries() {
        let e = engine();
        // Exactly at the floor: accepted.
        assert_eq!(e.evaluate(&s1_frame(), 0.4).kind, SignalKind::Buy);
        // Just under the floor: rejected.
        let under = e.evaluate(&s1_frame(), 0.399_999);
        assert_eq!(under.kind, SignalKind::None);
        assert_eq!(under.reason, SignalReason::ConfidenceOutOfRange);
        // Above the ceiling: rejected.
        let over = e.evaluate(&s1_frame(), 0.76);
        assert_eq!(over.reason, SignalReason::ConfidenceOutOfRange);
        // Exactly at the ceiling: accepted.
        assert_eq!(e.evaluate(&s1_frame(), 0.75).kind, SignalKind::Buy);
    }

    #[test]
    fn extreme_volatility_rejected() {
        let mut frame = s1_frame();
        frame.atr = frame.bar.close * 0.6; // ratio 0.6 >= cap 0.5
        let sig = engine().evaluate(&frame, 0.6);
        assert_eq!(sig.reason, SignalReason::ExtremeVolatility);
    }

    #[test]
    fn weak_volume_rejected() {
        let mut frame = s1_frame();
        frame.bar.volume = 20.0; // below 100 * 0.3
        let sig = engine().evaluate(&frame, 0.6);
        assert_eq!(sig.reason, SignalReason::WeakVolume);
    }

    #[test]
    fn overbought_rsi_blocks_long() {
        let mut frame = s1_frame();
        frame.rsi = 75.0;
        let sig = engine().evaluate(&frame, 0.6);
        assert_eq!(sig.kind, SignalKind::None);
        assert_eq!(sig.reason, SignalReason::NoTrendAlignment);
    }

    #[test]
    fn oversold_rsi_blocks_short() {
        let mut frame = bearish_frame();
        frame.rsi = 25.0;
        let sig = engine().evaluate(&frame, 0.6);
        assert_eq!(sig.kind, SignalKind::None);
    }

    #[test]
    fn not_ready_frame_refused() {
        let mut frame = s1_frame();
        frame.ready = false;
        let sig = engine().evaluate(&frame, 0.6);
        assert_eq!(sig.reason, SignalReason::FrameNotReady);
    }

    #[test]
    fn evaluate_is_deterministic() {
        let e = engine();
        let frame = s1_frame();
        assert_eq!(e.evaluate(&frame, 0.6), e.evaluate(&frame, 0.6));
    }

    // --- build_intent -------------------------------------------------------

    #[test]
    fn s1_intent_prices() {
        let e = engine();
        let sig = e.evaluate(&s1_frame(), 0.6);
        let intent = e
            .build_intent("BTCUSDT", &sig, &s1_frame().bar, 300.0)
            .unwrap();

        assert_eq!(intent.side, Side::Long);
        assert_eq!(intent.entry_price, 30_000.0);
        // stop = 30000 - 300 * 1.5
        assert!((intent.stop_loss_price - 29_550.0).abs() < 1e-9);
        // tp = 29550 + (30000 - 29550) * 2.5 ... mirrored from entry
        assert!((intent.take_profit_price - 31_125.0).abs() < 1e-9);
        assert!((intent.rr_ratio() - 2.5).abs() < 1e-9);
        assert!((intent.risk_fraction - 0.02).abs() < 1e-12);
        assert!((intent.trailing_stop_fraction - 0.65).abs() < 1e-12);
    }

    #[test]
    fn sell_intent_mirrors() {
        let e = engine();
        let sig = e.evaluate(&bearish_frame(), 0.6);
        let intent = e
            .build_intent("BTCUSDT", &sig, &bearish_frame().bar, 300.0)
            .unwrap();

        assert_eq!(intent.side, Side::Short);
        assert!(intent.stop_loss_price > intent.entry_price);
        assert!(intent.take_profit_price < intent.entry_price);
        assert!((intent.rr_ratio() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn intent_rejects_flat_signal() {
        let e = engine();
        let sig = Signal::refused(SignalReason::ConfidenceOutOfRange);
        assert_eq!(
            e.build_intent("BTCUSDT", &sig, &s1_frame().bar, 300.0),
            Err(IntentError::NoDirection)
        );
    }

    #[test]
    fn intent_rejects_bad_atr() {
        let e = engine();
        let sig = e.evaluate(&s1_frame(), 0.6);
        assert_eq!(
            e.build_intent("BTCUSDT", &sig, &s1_frame().bar, 0.0),
            Err(IntentError::InvalidAtr)
        );
        assert_eq!(
            e.build_intent("BTCUSDT", &sig, &s1_frame().bar, f64::NAN),
            Err(IntentError::InvalidAtr)
        );
    }

    // --- should_close -------------------------------------------------------

    #[test]
    fn stop_hit_without_trailing_reports_stop_loss() {
        let e = engine();
        let pos = open_long();
        let d = e.should_close(&pos, 94.9, None, None, 0);
        assert_eq!(d, CloseDecision::close(ExitReason::StopLoss));
    }

    #[test]
    fn s2_trailing_stop_distinguished_from_stop_loss() {
        let e = engine();
        let mut pos = open_long();
        // Price ran to 120; the monitor raised the stop to 113.
        pos.stop_loss = 113.0;
        pos.trailing_updated = true;
        pos.highest_favorable_price = 120.0;

        let d = e.should_close(&pos, 113.0, None, None, 0);
        assert_eq!(d, CloseDecision::close(ExitReason::TrailingStop));
    }

    #[test]
    fn take_profit_hit() {
        let e = engine();
        let pos = open_long();
        let d = e.should_close(&pos, 112.5, None, None, 0);
        assert_eq!(d, CloseDecision::close(ExitReason::TakeProfit));
    }

    #[test]
    fn short_position_exit_geometry() {
        let e = engine();
        let mut pos = open_long();
        pos.side = Side::Short;
        pos.stop_loss = 105.0;
        pos.take_profit = 87.5;

        assert_eq!(
            e.should_close(&pos, 105.0, None, None, 0),
            CloseDecision::close(ExitReason::StopLoss)
        );
        assert_eq!(
            e.should_close(&pos, 87.0, None, None, 0),
            CloseDecision::close(ExitReason::TakeProfit)
        );
        assert_eq!(e.should_close(&pos, 100.0, None, None, 0), CloseDecision::hold());
    }

    #[test]
    fn s3_signal_reversal_closes_long() {
        let e = engine();
        let pos = open_long();
        let reversal = Signal {
            kind: SignalKind::Sell,
            confidence: 0.6,
            reason: SignalReason::Accepted,
        };
        let d = e.should_close(&pos, 100.0, None, Some(&reversal), 0);
        assert_eq!(d, CloseDecision::close(ExitReason::SignalReversal));
    }

    #[test]
    fn same_direction_signal_does_not_close() {
        let e = engine();
        let pos = open_long();
        let confirm = Signal {
            kind: SignalKind::Buy,
            confidence: 0.6,
            reason: SignalReason::Accepted,
        };
        assert_eq!(
            e.should_close(&pos, 100.0, None, Some(&confirm), 0),
            CloseDecision::hold()
        );
    }

    #[test]
    fn rejected_reversal_does_not_close() {
        let e = engine();
        let pos = open_long();
        // Opposite direction but the signal itself was refused.
        let weak = Signal {
            kind: SignalKind::None,
            confidence: 0.2,
            reason: SignalReason::ConfidenceOutOfRange,
        };
        assert_eq!(
            e.should_close(&pos, 100.0, None, Some(&weak), 0),
            CloseDecision::hold()
        );
    }

    #[test]
    fn time_exit_when_configured() {
        let mut cfg = SignalConfig::default();
        cfg.time_exit_bars = 10;
        let e = SignalEngine::new(cfg, RiskConfig::default());
        let pos = open_long();

        assert_eq!(e.should_close(&pos, 100.0, None, None, 9), CloseDecision::hold());
        assert_eq!(
            e.should_close(&pos, 100.0, None, None, 10),
            CloseDecision::close(ExitReason::TimeExit)
        );
    }

    #[test]
    fn time_exit_disabled_by_default() {
        let e = engine();
        let pos = open_long();
        assert_eq!(
            e.should_close(&pos, 100.0, None, None, 100_000),
            CloseDecision::hold()
        );
    }

    #[test]
    fn liquidity_collapse_closes() {
        let e = engine();
        let pos = open_long();
        let mut frame = s1_frame();
        frame.bar.volume = 5.0; // below 100 * 0.1
        let d = e.should_close(&pos, 100.0, Some(&frame), None, 0);
        assert_eq!(d, CloseDecision::close(ExitReason::InsufficientLiquidity));
    }

    #[test]
    fn healthy_position_holds() {
        let e = engine();
        let pos = open_long();
        let frame = s1_frame();
        assert_eq!(
            e.should_close(&pos, 100.0, Some(&frame), None, 0),
            CloseDecision::hold()
        );
    }
}
