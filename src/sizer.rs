// =============================================================================
// Risk Sizer — bounded-risk position sizing
// =============================================================================
//
// Sizing pipeline:
//   1. Stop tightness gate (fraction of entry price)
//   2. risk_amount = free balance * risk fraction
//   3. base quantity = risk_amount / stop distance
//   4. Kelly-style confidence scaling, capped
//   5. Correlation decay when the asset class is already crowded
//   6. Notional cap as a fraction of total equity
//   7. Lot-step snap + minimum notional
//   8. Invariant: qty * stop_distance <= risk_amount * (1 + tolerance)
//
// Every rejection carries an enumerated reason; a rejection is a policy
// outcome, not an error.
// =============================================================================

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::RiskConfig;
use crate::exchange::SymbolMeta;
use crate::signal::EntryIntent;
use crate::store::Position;
use crate::types::{AccountSnapshot, Side};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// A fully sized order ready for execution.
#[derive(Debug, Clone, Serialize)]
pub struct SizedOrder {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub trailing_stop_fraction: f64,
    /// Quote amount at risk between entry and stop.
    pub risk_amount: f64,
    pub atr_at_entry: f64,
    pub confidence: f64,
    pub strategy_tag: Option<String>,
    /// Set when this order hedges an existing position.
    pub parent_id: Option<String>,
}

/// Enumerated sizing rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeReject {
    #[error("free balance cannot cover required margin")]
    InsufficientBalance,
    #[error("stop distance below the minimum fraction of entry price")]
    StopTooTight,
    #[error("concurrent position cap reached")]
    PositionCountCap,
    #[error("asset class concentration cap reached")]
    SectorConcentrationCap,
    #[error("portfolio heat cap exceeded")]
    PortfolioHeatCap,
    #[error("order notional below the exchange minimum")]
    BelowMinNotional,
}

// ---------------------------------------------------------------------------
// Asset classes
// ---------------------------------------------------------------------------

/// Crude sector bucketing for correlation control: the majors move together,
/// the rest of the book moves together harder.
pub fn asset_class(symbol: &str) -> &'static str {
    let base = symbol
        .strip_suffix("USDT")
        .or_else(|| symbol.strip_suffix("USDC"))
        .or_else(|| symbol.strip_suffix("BUSD"))
        .or_else(|| symbol.strip_suffix("USD"))
        .unwrap_or(symbol);

    match base {
        "BTC" | "ETH" => "crypto-major",
        _ => "crypto-alt",
    }
}

// ---------------------------------------------------------------------------
// Sizer
// ---------------------------------------------------------------------------

pub struct RiskSizer {
    cfg: RiskConfig,
    leverage: f64,
}

impl RiskSizer {
    pub fn new(cfg: RiskConfig, leverage: f64) -> Self {
        Self {
            cfg,
            leverage: leverage.max(1.0),
        }
    }

    /// Size an entry intent against a fresh account snapshot and the set of
    /// currently open positions.
    pub fn size(
        &self,
        intent: &EntryIntent,
        snapshot: &AccountSnapshot,
        open_positions: &[Position],
        meta: &SymbolMeta,
    ) -> Result<SizedOrder, SizeReject> {
        // --- 0. Position count -----------------------------------------------
        if open_positions.len() >= self.cfg.max_concurrent_positions {
            return Err(SizeReject::PositionCountCap);
        }

        // --- 1. Stop tightness -----------------------------------------------
        let stop_distance = (intent.entry_price - intent.stop_loss_price).abs();
        if stop_distance <= 0.0
            || stop_distance / intent.entry_price < self.cfg.min_stop_pct
        {
            return Err(SizeReject::StopTooTight);
        }

        // --- 2/3. Risk amount and base quantity ------------------------------
        let risk_amount = snapshot.free_quote_balance * intent.risk_fraction;
        let mut quantity = risk_amount / stop_distance;

        // --- 4. Kelly-style scaling ------------------------------------------
        let kelly_factor = (intent.confidence * self.cfg.kelly_base)
            .min(self.cfg.kelly_fraction_cap);
        quantity *= kelly_factor;

        // --- 5. Correlation adjustment ---------------------------------------
        let class = asset_class(&intent.symbol);
        let same_class = open_positions
            .iter()
            .filter(|p| asset_class(&p.symbol) == class)
            .count();

        if same_class >= self.cfg.max_same_class_positions {
            return Err(SizeReject::SectorConcentrationCap);
        }
        if same_class >= self.cfg.correlation_soft_threshold {
            quantity *= self.cfg.correlation_decay;
        }

        // --- 6. Notional cap -------------------------------------------------
        let max_notional =
            snapshot.total_quote_balance * self.cfg.max_position_notional_fraction;
        if quantity * intent.entry_price > max_notional {
            quantity = max_notional / intent.entry_price;
        }

        // --- Portfolio heat ---------------------------------------------------
        let open_risk: f64 = open_positions.iter().map(|p| p.risk_amount()).sum();
        let heat_cap = snapshot.total_quote_balance * self.cfg.max_portfolio_heat;
        if open_risk + quantity * stop_distance > heat_cap {
            return Err(SizeReject::PortfolioHeatCap);
        }

        // --- Margin ------------------------------------------------------------
        let required_margin = quantity * intent.entry_price / self.leverage;
        if required_margin > snapshot.free_quote_balance {
            return Err(SizeReject::InsufficientBalance);
        }

        // --- 7. Lot snap and minimum notional ---------------------------------
        quantity = snap_to_lot(quantity, meta.lot_step);
        if quantity <= 0.0 || quantity * intent.entry_price < meta.min_notional {
            return Err(SizeReject::BelowMinNotional);
        }

        // --- 8. Risk invariant -------------------------------------------------
        if quantity * stop_distance > risk_amount * (1.0 + self.cfg.sizing_tolerance) {
            quantity = snap_to_lot(risk_amount / stop_distance, meta.lot_step);
            if quantity <= 0.0 || quantity * intent.entry_price < meta.min_notional {
                return Err(SizeReject::BelowMinNotional);
            }
        }

        debug!(
            symbol = %intent.symbol,
            side = %intent.side,
            quantity,
            risk_amount,
            stop_distance,
            kelly_factor,
            same_class,
            "order sized"
        );

        Ok(SizedOrder {
            symbol: intent.symbol.clone(),
            side: intent.side,
            quantity,
            entry_price: intent.entry_price,
            stop_loss: intent.stop_loss_price,
            take_profit: intent.take_profit_price,
            trailing_stop_fraction: intent.trailing_stop_fraction,
            risk_amount: quantity * stop_distance,
            atr_at_entry: intent.atr_at_entry,
            confidence: intent.confidence,
            strategy_tag: None,
            parent_id: None,
        })
    }
}

/// Snap a quantity down to the exchange lot step. A zero step passes the
/// quantity through unchanged.
fn snap_to_lot(quantity: f64, lot_step: f64) -> f64 {
    if lot_step <= 0.0 {
        return quantity;
    }
    (quantity / lot_step).floor() * lot_step
}
