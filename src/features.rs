// =============================================================================
// Feature Computation — bars in, indicator-augmented frames out
// =============================================================================
//
// A FeatureFrame is one bar plus the named indicator columns the signal
// engine and scorer consume. Rows without enough lookback carry
// `ready = false` and must never reach the scorer.
//
// The column schema is fixed: atr, rsi, ha_open, ha_close, ema_fast,
// ema_slow, volume_sma. The computer preserves row order and yields the same
// columns for a given configuration.
// =============================================================================

use crate::config::SignalConfig;
use crate::indicators::{atr, ema, heikin_ashi, rsi, sma};
use crate::types::Bar;

/// One bar augmented with indicator columns.
#[derive(Debug, Clone, Copy)]
pub struct FeatureFrame {
    pub bar: Bar,
    pub atr: f64,
    pub rsi: f64,
    pub ha_open: f64,
    pub ha_close: f64,
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub volume_sma: f64,
    /// False while the row lacks lookback; such rows carry zeroed columns.
    pub ready: bool,
}

impl FeatureFrame {
    /// ATR as a fraction of the close price.
    pub fn atr_ratio(&self) -> f64 {
        if self.bar.close > 0.0 {
            self.atr / self.bar.close
        } else {
            0.0
        }
    }
}

/// Produces indicator columns for a window of bars.
pub trait FeatureComputer: Send + Sync {
    /// Compute one frame per input bar, preserving order.
    fn compute(&self, bars: &[Bar]) -> Vec<FeatureFrame>;

    /// Number of leading bars that come back not-ready.
    fn min_lookback(&self) -> usize;
}

/// Return the most recent ready frame, if any.
pub fn last_ready(frames: &[FeatureFrame]) -> Option<&FeatureFrame> {
    frames.iter().rev().find(|f| f.ready)
}

// ---------------------------------------------------------------------------
// Technical implementation
// ---------------------------------------------------------------------------

/// Standard implementation backed by the crate's indicator functions, with
/// periods taken from the signal configuration.
pub struct TechnicalFeatureComputer {
    ema_fast_period: usize,
    ema_slow_period: usize,
    rsi_period: usize,
    atr_period: usize,
    volume_sma_period: usize,
}

impl TechnicalFeatureComputer {
    pub fn new(cfg: &SignalConfig) -> Self {
        // Zero periods would wreck the series alignment; clamp to 1.
        Self {
            ema_fast_period: cfg.ema_fast_period.max(1),
            ema_slow_period: cfg.ema_slow_period.max(1),
            rsi_period: cfg.rsi_period.max(1),
            atr_period: cfg.atr_period.max(1),
            volume_sma_period: cfg.volume_sma_period.max(1),
        }
    }
}

impl FeatureComputer for TechnicalFeatureComputer {
    fn compute(&self, bars: &[Bar]) -> Vec<FeatureFrame> {
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();

        let ema_fast = ema::ema_series(&closes, self.ema_fast_period);
        let ema_slow = ema::ema_series(&closes, self.ema_slow_period);
        let rsi = rsi::rsi_series(&closes, self.rsi_period);
        let atr = atr::atr_series(bars, self.atr_period);
        let vol_sma = sma::sma_series(&volumes, self.volume_sma_period);
        let ha = heikin_ashi::ha_series(bars);

        let lookback = self.min_lookback();

        bars.iter()
            .enumerate()
            .map(|(i, bar)| {
                // Per-series offsets: each series starts at its own first
                // index with enough lookback.
                let fast = series_at(&ema_fast, i, self.ema_fast_period - 1);
                let slow = series_at(&ema_slow, i, self.ema_slow_period - 1);
                let rsi_v = series_at(&rsi, i, self.rsi_period);
                let atr_v = series_at(&atr, i, self.atr_period);
                let vol_v = series_at(&vol_sma, i, self.volume_sma_period - 1);

                let ready = i >= lookback
                    && fast.is_some()
                    && slow.is_some()
                    && rsi_v.is_some()
                    && atr_v.is_some()
                    && vol_v.is_some();

                FeatureFrame {
                    bar: *bar,
                    atr: atr_v.unwrap_or(0.0),
                    rsi: rsi_v.unwrap_or(0.0),
                    ha_open: ha[i].ha_open,
                    ha_close: ha[i].ha_close,
                    ema_fast: fast.unwrap_or(0.0),
                    ema_slow: slow.unwrap_or(0.0),
                    volume_sma: vol_v.unwrap_or(0.0),
                    ready,
                }
            })
            .collect()
    }

    fn min_lookback(&self) -> usize {
        (self.ema_slow_period - 1)
            .max(self.rsi_period)
            .max(self.atr_period)
            .max(self.volume_sma_period - 1)
            .max(self.ema_fast_period - 1)
    }
}

/// Value of a series at bar index `i`, where the series starts at bar index
/// `first_index`.
fn series_at(series: &[f64], i: usize, first_index: usize) -> Option<f64> {
    if i < first_index {
        return None;
    }
    series.get(i - first_index).copied()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bars(n: usize) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.4).sin() * 5.0 + i as f64 * 0.1;
                Bar {
                    timestamp: i as i64 * 60_000,
                    open: base - 0.5,
                    high: base + 2.0,
                    low: base - 2.0,
                    close: base + 0.5,
                    volume: 100.0 + (i % 7) as f64 * 10.0,
                }
            })
            .collect()
    }

    fn computer() -> TechnicalFeatureComputer {
        TechnicalFeatureComputer::new(&SignalConfig::default())
    }

    #[test]
    fn one_frame_per_bar_in_order() {
        let input = bars(60);
        let frames = computer().compute(&input);
        assert_eq!(frames.len(), input.len());
        for (frame, bar) in frames.iter().zip(&input) {
            assert_eq!(frame.bar.timestamp, bar.timestamp);
        }
    }

    #[test]
    fn readiness_boundary() {
        let c = computer();
        let frames = c.compute(&bars(60));
        let lookback = c.min_lookback();

        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.ready, i >= lookback, "frame {i} readiness");
        }
        // At the boundary every column is populated.
        let first_ready = &frames[lookback];
        assert!(first_ready.atr > 0.0);
        assert!(first_ready.rsi >= 0.0 && first_ready.rsi <= 100.0);
        assert!(first_ready.ema_fast > 0.0);
        assert!(first_ready.ema_slow > 0.0);
        assert!(first_ready.volume_sma > 0.0);
    }

    #[test]
    fn not_ready_below_lookback() {
        let frames = computer().compute(&bars(10));
        assert!(frames.iter().all(|f| !f.ready));
        assert!(last_ready(&frames).is_none());
    }

    #[test]
    fn last_ready_is_final_frame_when_warm() {
        let input = bars(60);
        let frames = computer().compute(&input);
        let last = last_ready(&frames).unwrap();
        assert_eq!(last.bar.timestamp, input.last().unwrap().timestamp);
    }

    #[test]
    fn compute_is_deterministic() {
        let input = bars(60);
        let c = computer();
        let a = c.compute(&input);
        let b = c.compute(&input);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.atr, y.atr);
            assert_eq!(x.rsi, y.rsi);
            assert_eq!(x.ema_fast, y.ema_fast);
            assert_eq!(x.ready, y.ready);
        }
    }

    #[test]
    fn atr_ratio_guards_zero_close() {
        let frame = FeatureFrame {
            bar: Bar {
                timestamp: 0,
                open: 0.0,
                high: 0.0,
                low: 0.0,
                close: 0.0,
                volume: 0.0,
            },
            atr: 1.0,
            rsi: 50.0,
            ha_open: 0.0,
            ha_close: 0.0,
            ema_fast: 0.0,
            ema_slow: 0.0,
            volume_sma: 0.0,
            ready: false,
        };
        assert_eq!(frame.atr_ratio(), 0.0);
    }
}
