// =============================================================================
// Risk Engine — portfolio circuit breakers protecting capital
// =============================================================================
//
// Circuit breakers:
//   1. Drawdown       — trips when peak-to-trough equity decline exceeds the
//                       configured fraction. Latched: requires manual reset.
//   2. Position Count — blocks new entries at the concurrent-position cap.
//   3. Portfolio Heat — blocks new entries when the sum of at-risk amounts
//                       across open positions exceeds the heat cap.
//
// A tripped breaker never interferes with managing existing positions; the
// monitor keeps running. The kill switch blocks everything until cleared.
// =============================================================================

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::store::Position;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a single circuit breaker for the status API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerInfo {
    pub name: String,
    pub current: f64,
    pub limit: f64,
    pub tripped: bool,
}

/// Serializable snapshot of the risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub risk_mode: String,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_fraction: f64,
    pub portfolio_heat: f64,
    pub session_realized_pnl: f64,
    pub wins: u32,
    pub losses: u32,
    pub circuit_breakers: Vec<CircuitBreakerInfo>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Inner {
    equity: f64,
    peak_equity: f64,
    session_realized_pnl: f64,
    wins: u32,
    losses: u32,
    /// Latched by the drawdown breaker; cleared only by `reset`.
    drawdown_tripped: bool,
    killed: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    state: RwLock<Inner>,
    max_drawdown_fraction: f64,
    max_portfolio_heat: f64,
    max_concurrent_positions: usize,
}

impl RiskEngine {
    pub fn new(cfg: &RiskConfig, starting_equity: f64) -> Self {
        info!(
            starting_equity,
            max_drawdown_fraction = cfg.max_drawdown_fraction,
            max_portfolio_heat = cfg.max_portfolio_heat,
            max_concurrent_positions = cfg.max_concurrent_positions,
            "RiskEngine initialised"
        );

        Self {
            state: RwLock::new(Inner {
                equity: starting_equity,
                peak_equity: starting_equity,
                session_realized_pnl: 0.0,
                wins: 0,
                losses: 0,
                drawdown_tripped: false,
                killed: false,
            }),
            max_drawdown_fraction: cfg.max_drawdown_fraction,
            max_portfolio_heat: cfg.max_portfolio_heat,
            max_concurrent_positions: cfg.max_concurrent_positions,
        }
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    /// Record the latest total equity from a balance fetch. Updates the peak
    /// and latches the drawdown breaker when the cap is crossed.
    pub fn observe_equity(&self, equity: f64) {
        if !equity.is_finite() || equity < 0.0 {
            warn!(equity, "ignoring non-finite equity observation");
            return;
        }

        let mut s = self.state.write();
        s.equity = equity;
        if equity > s.peak_equity {
            s.peak_equity = equity;
        }

        let dd = Self::drawdown(&s);
        if dd >= self.max_drawdown_fraction && !s.drawdown_tripped {
            s.drawdown_tripped = true;
            warn!(
                drawdown = dd,
                limit = self.max_drawdown_fraction,
                "drawdown breaker TRIPPED — new entries halted until manual reset"
            );
        }

        debug!(equity, peak = s.peak_equity, drawdown = dd, "equity observed");
    }

    /// Record the pnl of a completed trade.
    pub fn record_trade_result(&self, pnl: f64) {
        let mut s = self.state.write();
        s.session_realized_pnl += pnl;
        if pnl >= 0.0 {
            s.wins += 1;
        } else {
            s.losses += 1;
        }
        debug!(pnl, session_pnl = s.session_realized_pnl, "trade result recorded");
    }

    // -------------------------------------------------------------------------
    // Gates
    // -------------------------------------------------------------------------

    /// Whether a new entry is currently allowed. `candidate_risk` is the
    /// quote amount the proposed trade would put at risk.
    ///
    /// Returns `(true, None)` when all breakers are clear, or
    /// `(false, Some(reason))` otherwise.
    pub fn can_open(
        &self,
        open_positions: &[Position],
        candidate_risk: f64,
    ) -> (bool, Option<String>) {
        let s = self.state.read();

        if s.killed {
            return (false, Some("kill switch activated".to_string()));
        }

        if s.drawdown_tripped {
            let msg = format!(
                "drawdown breaker tripped: {:.2}% (limit {:.2}%)",
                Self::drawdown(&s) * 100.0,
                self.max_drawdown_fraction * 100.0
            );
            return (false, Some(msg));
        }

        if open_positions.len() >= self.max_concurrent_positions {
            let msg = format!(
                "position count cap reached: {}/{}",
                open_positions.len(),
                self.max_concurrent_positions
            );
            return (false, Some(msg));
        }

        let heat = Self::heat(open_positions, s.equity) + candidate_risk / s.equity.max(1e-9);
        if heat > self.max_portfolio_heat {
            let msg = format!(
                "portfolio heat cap exceeded: {:.2}% (limit {:.2}%)",
                heat * 100.0,
                self.max_portfolio_heat * 100.0
            );
            return (false, Some(msg));
        }

        (true, None)
    }

    /// Compensation is disabled once portfolio drawdown exceeds the cap.
    pub fn compensation_allowed(&self) -> bool {
        let s = self.state.read();
        !s.killed && !s.drawdown_tripped && Self::drawdown(&s) < self.max_drawdown_fraction
    }

    pub fn drawdown_fraction(&self) -> f64 {
        Self::drawdown(&self.state.read())
    }

    pub fn is_killed(&self) -> bool {
        self.state.read().killed
    }

    // -------------------------------------------------------------------------
    // Controls
    // -------------------------------------------------------------------------

    /// Block all trading until `reset` is called.
    pub fn kill(&self) {
        self.state.write().killed = true;
        warn!("kill switch activated — all trading halted");
    }

    /// Manual reset: clears the kill switch and the drawdown latch, and
    /// rebases the peak at current equity.
    pub fn reset(&self) {
        let mut s = self.state.write();
        s.killed = false;
        s.drawdown_tripped = false;
        s.peak_equity = s.equity;
        info!(equity = s.equity, "risk engine reset (manual)");
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn get_state(&self, open_positions: &[Position]) -> RiskState {
        let s = self.state.read();
        let dd = Self::drawdown(&s);
        let heat = Self::heat(open_positions, s.equity);

        let risk_mode = if s.killed {
            "KILLED".to_string()
        } else if s.drawdown_tripped {
            "BREAKER_TRIPPED".to_string()
        } else if dd >= self.max_drawdown_fraction * 0.75 {
            "Cautious".to_string()
        } else {
            "Normal".to_string()
        };

        let breakers = vec![
            CircuitBreakerInfo {
                name: "Drawdown".to_string(),
                current: dd * 100.0,
                limit: self.max_drawdown_fraction * 100.0,
                tripped: s.drawdown_tripped,
            },
            CircuitBreakerInfo {
                name: "Position Count".to_string(),
                current: open_positions.len() as f64,
                limit: self.max_concurrent_positions as f64,
                tripped: open_positions.len() >= self.max_concurrent_positions,
            },
            CircuitBreakerInfo {
                name: "Portfolio Heat".to_string(),
                current: heat * 100.0,
                limit: self.max_portfolio_heat * 100.0,
                tripped: heat > self.max_portfolio_heat,
            },
        ];

        RiskState {
            risk_mode,
            equity: s.equity,
            peak_equity: s.peak_equity,
            drawdown_fraction: dd,
            portfolio_heat: heat,
            session_realized_pnl: s.session_realized_pnl,
            wins: s.wins,
            losses: s.losses,
            circuit_breakers: breakers,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn drawdown(s: &Inner) -> f64 {
        if s.peak_equity > 0.0 {
            ((s.peak_equity - s.equity) / s.peak_equity).max(0.0)
        } else {
            0.0
        }
    }

    fn heat(open_positions: &[Position], equity: f64) -> f64 {
        if equity <= 0.0 {
            return 0.0;
        }
        let at_risk: f64 = open_positions.iter().map(|p| p.risk_amount()).sum();
        at_risk / equity
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.state.read();
        f.debug_struct("RiskEngine")
            .field("equity", &s.equity)
            .field("peak_equity", &s.peak_equity)
            .field("drawdown_tripped", &s.drawdown_tripped)
            .field("killed", &s.killed)
            .finish()
    }
}
