// =============================================================================
// Heikin-Ashi Candles
// =============================================================================
//
// Smoothed candle representation used as the trend filter:
//
//   ha_close_t = (open_t + high_t + low_t + close_t) / 4
//   ha_open_t  = (ha_open_{t-1} + ha_close_{t-1}) / 2
//   ha_open_0  = (open_0 + close_0) / 2
//
// A bar with ha_close > ha_open reads bullish; the mirror reads bearish.
// Output is aligned 1:1 with the input bars.
// =============================================================================

use crate::types::Bar;

/// One Heikin-Ashi candle. Only open/close are needed by the signal filters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HaCandle {
    pub ha_open: f64,
    pub ha_close: f64,
}

impl HaCandle {
    pub fn is_bullish(&self) -> bool {
        self.ha_close > self.ha_open
    }

    pub fn is_bearish(&self) -> bool {
        self.ha_close < self.ha_open
    }
}

/// Compute the Heikin-Ashi series for `bars` (oldest first).
pub fn ha_series(bars: &[Bar]) -> Vec<HaCandle> {
    let mut out = Vec::with_capacity(bars.len());

    for (i, bar) in bars.iter().enumerate() {
        let ha_close = (bar.open + bar.high + bar.low + bar.close) / 4.0;
        let ha_open = if i == 0 {
            (bar.open + bar.close) / 2.0
        } else {
            let prev: &HaCandle = &out[i - 1];
            (prev.ha_open + prev.ha_close) / 2.0
        };
        out.push(HaCandle { ha_open, ha_close });
    }

    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar {
            timestamp: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn empty_input_empty_output() {
        assert!(ha_series(&[]).is_empty());
    }

    #[test]
    fn first_candle_seed() {
        let series = ha_series(&[bar(100.0, 110.0, 90.0, 104.0)]);
        assert_eq!(series.len(), 1);
        assert!((series[0].ha_open - 102.0).abs() < 1e-12);
        assert!((series[0].ha_close - 101.0).abs() < 1e-12);
    }

    #[test]
    fn recursive_open() {
        let series = ha_series(&[
            bar(100.0, 110.0, 90.0, 104.0),
            bar(104.0, 112.0, 100.0, 110.0),
        ]);
        // ha_open_1 = (102 + 101) / 2
        assert!((series[1].ha_open - 101.5).abs() < 1e-12);
        // ha_close_1 = (104 + 112 + 100 + 110) / 4
        assert!((series[1].ha_close - 106.5).abs() < 1e-12);
        assert!(series[1].is_bullish());
    }

    #[test]
    fn sustained_uptrend_reads_bullish() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                bar(base, base + 3.0, base - 1.0, base + 2.0)
            })
            .collect();
        let series = ha_series(&bars);
        // After the seed settles, every candle in a clean uptrend is bullish.
        for candle in &series[3..] {
            assert!(candle.is_bullish());
        }
    }

    #[test]
    fn sustained_downtrend_reads_bearish() {
        let bars: Vec<Bar> = (0..20)
            .map(|i| {
                let base = 200.0 - i as f64 * 2.0;
                bar(base, base + 1.0, base - 3.0, base - 2.0)
            })
            .collect();
        let series = ha_series(&bars);
        for candle in &series[3..] {
            assert!(candle.is_bearish());
        }
    }
}
