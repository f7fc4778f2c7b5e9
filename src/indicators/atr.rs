// =============================================================================
// Average True Range — Wilder's Smoothing Method
// =============================================================================
//
// True Range for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the smoothed average of TR:
//   ATR_0 = SMA of the first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period
//
// Output index 0 corresponds to bar index `period` (each TR needs a previous
// bar, and `period` TRs seed the average).
// =============================================================================

use crate::types::Bar;

/// Compute the ATR series for `bars` (oldest first) with the given `period`.
///
/// Returns an empty vec when `period` is zero, fewer than `period + 1` bars
/// are available, or an intermediate value is non-finite.
pub fn atr_series(bars: &[Bar], period: usize) -> Vec<f64> {
    if period == 0 || bars.len() < period + 1 {
        return Vec::new();
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let period_f = period as f64;
    let mut out = Vec::with_capacity(tr_values.len() - period + 1);
    out.push(seed);

    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            break;
        }
        out.push(atr);
    }

    out
}

/// Most recent ATR value, or `None` with insufficient data.
pub fn latest(bars: &[Bar], period: usize) -> Option<f64> {
    atr_series(bars, period).last().copied()
}
