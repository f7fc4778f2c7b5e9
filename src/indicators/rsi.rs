// =============================================================================
// Relative Strength Index — Wilder's Smoothing
// =============================================================================
//
// Step 1 — price deltas from consecutive closes.
// Step 2 — seed average gain / loss with the SMA of the first `period` deltas.
// Step 3 — Wilder smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + gain) / period
// Step 4 — RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS).
//
// Output index 0 corresponds to input close index `period`.
// =============================================================================

/// Compute the RSI series for `closes` with the given `period`.
///
/// Returns an empty vec when `period` is zero or fewer than `period + 1`
/// closes are available. When the average loss is zero RSI clamps to 100.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut out = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(first) => out.push(first),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(rsi) => out.push(rsi),
            None => break,
        }
    }

    out
}

/// Most recent RSI value, or `None` with insufficient data.
pub fn latest(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    if !avg_gain.is_finite() || !avg_loss.is_finite() {
        return None;
    }
    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    let rsi = 100.0 - 100.0 / (1.0 + rs);
    rsi.is_finite().then_some(rsi)
}
