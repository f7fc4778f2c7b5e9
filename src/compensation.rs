// =============================================================================
// Compensation Engine — offsetting hedges for drawn-down positions
// =============================================================================
//
// State machine per parent position:
//
//   None ──(loss fraction >= threshold, hedge capacity free)──> Hedged
//   Hedged ──(child stop hit | combined pnl >= -epsilon |
//             parent closed externally)──> Closed
//
// The hedge child is opposite in side, sized as a fraction of the parent,
// with its stop distance a multiple of the parent's and its target chosen so
// that reaching it offsets the parent's unrealized loss at trigger time.
// When either leg closes, the link is cleared and the surviving leg is
// managed as a standalone position under its own stop and target.
//
// Bounds: at most `max_hedges` children exist globally; hedging is disabled
// entirely while portfolio drawdown exceeds the configured cap (the risk
// engine owns that verdict).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::CompensationConfig;
use crate::store::Position;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Link record
// ---------------------------------------------------------------------------

/// Pairing between a drawn-down parent and its offsetting hedge.
#[derive(Debug, Clone, Serialize)]
pub struct CompensationLink {
    pub parent_id: String,
    pub child_id: String,
    /// Quote amount the hedge is meant to recover.
    pub target_offset_amount: f64,
    /// Best combined-pnl improvement observed so far.
    pub achieved_offset: f64,
    pub reason: String,
}

/// A hedge order the monitor should submit.
#[derive(Debug, Clone)]
pub struct HedgeOrder {
    pub parent_id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub target_offset_amount: f64,
}

/// What happened to a link when one of its legs closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkResolution {
    /// The parent closed; the named child continues standalone.
    ChildReleased { child_id: String },
    /// The child closed; the named parent continues standalone.
    ParentReleased { parent_id: String },
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct CompensationEngine {
    cfg: CompensationConfig,
    /// Links keyed by parent id. Exactly one child per parent.
    links: RwLock<HashMap<String, CompensationLink>>,
}

impl CompensationEngine {
    pub fn new(cfg: CompensationConfig) -> Self {
        Self {
            cfg,
            links: RwLock::new(HashMap::new()),
        }
    }

    pub fn active_hedges(&self) -> usize {
        self.links.read().len()
    }

    pub fn link_for_parent(&self, parent_id: &str) -> Option<CompensationLink> {
        self.links.read().get(parent_id).cloned()
    }

    pub fn links_snapshot(&self) -> Vec<CompensationLink> {
        self.links.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // None -> Hedged
    // -------------------------------------------------------------------------

    /// Propose a hedge for `parent` if the trigger conditions hold.
    ///
    /// `hedging_allowed` is the risk engine's drawdown verdict; the engine
    /// itself enforces the enable flag, the loss threshold, the one-child
    /// rule, and the global hedge cap.
    pub fn maybe_open(&self, parent: &Position, hedging_allowed: bool) -> Option<HedgeOrder> {
        if !self.cfg.enabled || !hedging_allowed {
            return None;
        }
        // A hedge never hedges another hedge.
        if parent.parent_id.is_some() {
            return None;
        }

        let links = self.links.read();
        if links.contains_key(&parent.id) {
            return None;
        }
        if links.len() >= self.cfg.max_hedges {
            debug!(
                parent_id = %parent.id,
                active = links.len(),
                "hedge capacity exhausted"
            );
            return None;
        }
        drop(links);

        let loss_fraction = parent.unrealized_loss_fraction();
        if loss_fraction < self.cfg.threshold_fraction {
            return None;
        }

        let quantity = parent.quantity * self.cfg.size_fraction_of_parent;
        if quantity <= 0.0 {
            return None;
        }

        let side = parent.side.opposite();
        let entry_price = parent.current_price;
        let stop_distance = parent.stop_distance() * self.cfg.rr_multiplier;
        // Loss side for the hedge is the parent's profit side.
        let stop_loss = entry_price - side.sign() * stop_distance;

        let target_offset = (-parent.unrealized_pnl).max(0.0);
        // Per-unit move needed so the child's profit at target matches the
        // parent's current loss.
        let target_distance = target_offset / quantity;
        let take_profit = entry_price + side.sign() * target_distance;

        info!(
            parent_id = %parent.id,
            symbol = %parent.symbol,
            loss_fraction,
            quantity,
            stop_loss,
            take_profit,
            target_offset,
            "compensation trigger — proposing hedge"
        );

        Some(HedgeOrder {
            parent_id: parent.id.clone(),
            symbol: parent.symbol.clone(),
            side,
            quantity,
            entry_price,
            stop_loss,
            take_profit,
            target_offset_amount: target_offset,
        })
    }

    /// Record a successfully opened hedge.
    pub fn register(&self, parent_id: &str, child_id: &str, target_offset_amount: f64) {
        let link = CompensationLink {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            target_offset_amount,
            achieved_offset: 0.0,
            reason: "unrealized_loss_threshold".to_string(),
        };
        self.links.write().insert(parent_id.to_string(), link);
    }

    // -------------------------------------------------------------------------
    // Hedged -> Closed
    // -------------------------------------------------------------------------

    /// Whether the pair's combined pnl has reached the offset target.
    /// Updates the achieved-offset watermark as a side effect.
    pub fn offset_achieved(&self, parent: &Position, child: &Position) -> bool {
        let combined = parent.unrealized_pnl + child.unrealized_pnl;

        let mut links = self.links.write();
        if let Some(link) = links.get_mut(&parent.id) {
            let achieved = child.unrealized_pnl.max(0.0);
            if achieved > link.achieved_offset {
                link.achieved_offset = achieved;
            }
        }

        combined >= -self.cfg.offset_epsilon
    }

    /// Resolve the link containing `position_id`, if any. Called after any
    /// position close, including external ones discovered by reconciliation.
    pub fn on_closed(&self, position_id: &str) -> Option<LinkResolution> {
        let mut links = self.links.write();

        if let Some(link) = links.remove(position_id) {
            info!(
                parent_id = %link.parent_id,
                child_id = %link.child_id,
                "parent closed — hedge child released as standalone"
            );
            return Some(LinkResolution::ChildReleased {
                child_id: link.child_id,
            });
        }

        let parent_id = links
            .values()
            .find(|l| l.child_id == position_id)
            .map(|l| l.parent_id.clone())?;
        links.remove(&parent_id);
        info!(
            parent_id = %parent_id,
            child_id = %position_id,
            "hedge child closed — parent released as standalone"
        );
        Some(LinkResolution::ParentReleased { parent_id })
    }
}

impl std::fmt::Debug for CompensationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationEngine")
            .field("enabled", &self.cfg.enabled)
            .field("active_hedges", &self.links.read().len())
            .finish()
    }
}
