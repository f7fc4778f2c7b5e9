// =============================================================================
// Exponential Moving Average
// =============================================================================
//
//   alpha = 2 / (period + 1)
//   EMA_0 = SMA of the first `period` values (seed)
//   EMA_t = alpha * value_t + (1 - alpha) * EMA_{t-1}
//
// The seed convention matters for reproducibility: the series starts at index
// `period - 1` of the input, so `values.len() - period + 1` values come back.
// =============================================================================

/// Compute the EMA series for `values` with the given `period`.
///
/// Returns an empty vec when `period` is zero or there are fewer than
/// `period` values. Output index 0 corresponds to input index `period - 1`.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(values.len() - period + 1);
    out.push(seed);

    let mut ema = seed;
    for &v in &values[period..] {
        ema = alpha * v + (1.0 - alpha) * ema;
        if !ema.is_finite() {
            break;
        }
        out.push(ema);
    }

    out
}

/// Most recent EMA value, or `None` with insufficient data.
pub fn latest(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_on_insufficient_data() {
        assert!(ema_series(&[1.0, 2.0], 3).is_empty());
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn seed_is_sma() {
        let series = ema_series(&[2.0, 4.0, 6.0], 3);
        assert_eq!(series.len(), 1);
        assert!((series[0] - 4.0).abs() < 1e-12);
    }

    #[test]
    fn constant_input_stays_constant() {
        let values = vec![50.0; 40];
        let series = ema_series(&values, 10);
        assert_eq!(series.len(), 31);
        for v in series {
            assert!((v - 50.0).abs() < 1e-9);
        }
    }

    #[test]
    fn tracks_rising_input_from_below() {
        let values: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let series = ema_series(&values, 10);
        let last = *series.last().unwrap();
        // EMA lags a rising series but must stay below the latest value.
        assert!(last < *values.last().unwrap());
        assert!(last > values[values.len() - 10]);
    }

    #[test]
    fn alignment_matches_length() {
        let values: Vec<f64> = (0..25).map(|i| i as f64).collect();
        let series = ema_series(&values, 9);
        assert_eq!(series.len(), values.len() - 9 + 1);
    }

    #[test]
    fn latest_matches_series_tail() {
        let values: Vec<f64> = (0..30).map(|i| (i as f64 * 0.7).sin() + 10.0).collect();
        assert_eq!(latest(&values, 9), ema_series(&values, 9).last().copied());
    }
}
