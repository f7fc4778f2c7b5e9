// =============================================================================
// Signal Scorer — confidence estimation seam
// =============================================================================
//
// The scorer maps a ready FeatureFrame to a confidence in [0, 1]. It is a
// pure function of (frame, model version): the same frame always scores the
// same under the same version. When no scorer is available the engine must
// refuse to produce signals; there is no neutral-confidence fallback.
// =============================================================================

use thiserror::Error;

use crate::features::FeatureFrame;

/// Why a score could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScorerError {
    /// Model unavailable (not loaded, version mismatch, backend down).
    #[error("scorer unavailable: {0}")]
    Unavailable(String),
    /// The frame lacks lookback and must not be scored.
    #[error("frame is not ready for scoring")]
    FrameNotReady,
}

/// Confidence model over feature frames.
pub trait SignalScorer: Send + Sync {
    /// Identifier of the model version; the feature schema is fixed per
    /// version.
    fn model_version(&self) -> &str;

    /// Confidence in [0, 1] for the given frame.
    fn score(&self, frame: &FeatureFrame) -> Result<f64, ScorerError>;
}

// ---------------------------------------------------------------------------
// Weighted ensemble implementation
// ---------------------------------------------------------------------------

/// Weight of one scoring component.
#[derive(Debug, Clone)]
struct Component {
    name: &'static str,
    weight: f64,
}

/// Deterministic ensemble scorer blending trend, momentum, and volume
/// sub-scores into a single confidence.
///
/// Each component emits a value in [-1, 1] (direction times strength); the
/// weighted sum is mapped into [0, 1] so that 0.5 reads neutral.
pub struct EnsembleScorer {
    components: Vec<Component>,
    version: String,
}

impl EnsembleScorer {
    pub fn new() -> Self {
        Self {
            components: vec![
                Component { name: "ema_trend", weight: 0.35 },
                Component { name: "ha_candle", weight: 0.30 },
                Component { name: "rsi_momentum", weight: 0.20 },
                Component { name: "volume", weight: 0.15 },
            ],
            version: "ensemble-v1".to_string(),
        }
    }

    fn component_value(name: &str, frame: &FeatureFrame) -> f64 {
        match name {
            // Fast/slow EMA separation, normalized by price.
            "ema_trend" => {
                if frame.bar.close <= 0.0 {
                    return 0.0;
                }
                let sep = (frame.ema_fast - frame.ema_slow) / frame.bar.close;
                (sep * 100.0).clamp(-1.0, 1.0)
            }
            // Heikin-Ashi body direction and relative size.
            "ha_candle" => {
                if frame.bar.close <= 0.0 {
                    return 0.0;
                }
                let body = (frame.ha_close - frame.ha_open) / frame.bar.close;
                (body * 200.0).clamp(-1.0, 1.0)
            }
            // Distance of RSI from the 50 midline.
            "rsi_momentum" => ((frame.rsi - 50.0) / 50.0).clamp(-1.0, 1.0),
            // Volume expansion relative to its SMA confirms either direction;
            // signed by the candle.
            "volume" => {
                if frame.volume_sma <= 0.0 {
                    return 0.0;
                }
                let expansion = (frame.bar.volume / frame.volume_sma - 1.0).clamp(-1.0, 1.0);
                let direction = if frame.ha_close >= frame.ha_open { 1.0 } else { -1.0 };
                expansion.max(0.0) * direction
            }
            _ => 0.0,
        }
    }
}

impl Default for EnsembleScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalScorer for EnsembleScorer {
    fn model_version(&self) -> &str {
        &self.version
    }

    fn score(&self, frame: &FeatureFrame) -> Result<f64, ScorerError> {
        if !frame.ready {
            return Err(ScorerError::FrameNotReady);
        }

        let mut total = 0.0;
        for c in &self.components {
            total += c.weight * Self::component_value(c.name, frame);
        }

        // Map the signed ensemble sum into [0, 1]; the engine measures
        // conviction by distance from 0.5 plus the trend filters.
        Ok((0.5 + 0.5 * total.clamp(-1.0, 1.0)).clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Fixed scorer (test scaffolding)
// ---------------------------------------------------------------------------

/// Scorer returning a constant confidence. Used by tests to drive the signal
/// pipeline through exact threshold boundaries.
pub struct FixedScorer(pub f64);

impl SignalScorer for FixedScorer {
    fn model_version(&self) -> &str {
        "fixed"
    }

    fn score(&self, frame: &FeatureFrame) -> Result<f64, ScorerError> {
        if !frame.ready {
            return Err(ScorerError::FrameNotReady);
        }
        Ok(self.0)
    }
}

/// Scorer that always fails, modelling a missing model in live mode.
pub struct UnavailableScorer;

impl SignalScorer for UnavailableScorer {
    fn model_version(&self) -> &str {
        "none"
    }

    fn score(&self, _frame: &FeatureFrame) -> Result<f64, ScorerError> {
        Err(ScorerError::Unavailable("no model loaded".into()))
    }
}
