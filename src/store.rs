// =============================================================================
// PositionStore — exclusive owner of open positions
// =============================================================================
//
// Every mutation goes through the store-wide lock; operations are short and
// never perform I/O. Other components hold position ids only and read
// snapshot copies. The pending-close flag is checked and set inside the lock
// so at most one close per position is ever in flight, without holding the
// lock across the exchange RPC.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{ExitReason, Side};

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A single tracked position. Exclusively owned by the store; mutated only
/// through `PositionStore::update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Fraction of accumulated profit protected by the trailing stop.
    pub trailing_stop_fraction: f64,
    /// Highest price seen for longs, lowest for shorts.
    pub highest_favorable_price: f64,
    pub entry_time: DateTime<Utc>,
    #[serde(default)]
    pub strategy_tag: Option<String>,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    pub atr_at_entry: f64,
    pub confidence_at_entry: f64,
    /// Set once the trailing stop has improved on the original stop.
    #[serde(default)]
    pub trailing_updated: bool,
    /// Id of the parent position when this is a compensation hedge.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// True while a close order is in flight for this position.
    #[serde(default)]
    pub pending_close: bool,
    pub status: PositionStatus,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub realized_pnl: f64,
}

impl Position {
    /// Unrealized pnl at `price` in quote currency.
    pub fn unrealized_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Distance from entry to the current stop.
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    /// Quote amount lost if the stop is hit from entry.
    pub fn risk_amount(&self) -> f64 {
        self.stop_distance() * self.quantity
    }

    /// Entry notional in quote currency.
    pub fn notional(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Unrealized loss as a fraction of entry notional; zero when in profit.
    pub fn unrealized_loss_fraction(&self) -> f64 {
        let notional = self.notional();
        if notional <= 0.0 {
            return 0.0;
        }
        (-self.unrealized_pnl / notional).max(0.0)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An OPEN position already exists for this (symbol, side) and
    /// pyramiding is disabled.
    #[error("open position already exists for {symbol} {side}")]
    DuplicateOpen { symbol: String, side: Side },

    /// Structurally invalid position (non-positive quantity or price).
    #[error("invariant violation: {0}")]
    Invariant(String),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Thread-safe owner of the open and recently closed position sets.
pub struct PositionStore {
    open: RwLock<HashMap<String, Position>>,
    closed: RwLock<Vec<Position>>,
    allow_pyramiding: bool,
}

impl PositionStore {
    pub fn new(allow_pyramiding: bool) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            allow_pyramiding,
        }
    }

    /// Build a fresh position record ready for insertion.
    #[allow(clippy::too_many_arguments)]
    pub fn build_position(
        symbol: &str,
        side: Side,
        entry_price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit: f64,
        trailing_stop_fraction: f64,
        atr_at_entry: f64,
        confidence_at_entry: f64,
        strategy_tag: Option<String>,
        parent_id: Option<String>,
    ) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price,
            quantity,
            stop_loss,
            take_profit,
            trailing_stop_fraction,
            highest_favorable_price: entry_price,
            entry_time: Utc::now(),
            strategy_tag,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            atr_at_entry,
            confidence_at_entry,
            trailing_updated: false,
            parent_id,
            pending_close: false,
            status: PositionStatus::Open,
            closed_at: None,
            exit_reason: None,
            realized_pnl: 0.0,
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Insert a new open position.
    pub fn insert(&self, position: Position) -> Result<(), StoreError> {
        if position.quantity <= 0.0 || position.entry_price <= 0.0 {
            return Err(StoreError::Invariant(format!(
                "position {} has non-positive quantity or price",
                position.id
            )));
        }

        let mut open = self.open.write();

        if !self.allow_pyramiding {
            let duplicate = open
                .values()
                .any(|p| p.symbol == position.symbol && p.side == position.side);
            if duplicate {
                return Err(StoreError::DuplicateOpen {
                    symbol: position.symbol.clone(),
                    side: position.side,
                });
            }
        }

        info!(
            id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            entry_price = position.entry_price,
            quantity = position.quantity,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "position opened"
        );

        open.insert(position.id.clone(), position);
        Ok(())
    }

    /// Apply `mutator` to the open position with `id`. Returns false when the
    /// id is unknown. Mutations are serialized through the store lock.
    pub fn update<F>(&self, id: &str, mutator: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let mut open = self.open.write();
        match open.get_mut(id) {
            Some(position) => {
                mutator(position);
                true
            }
            None => false,
        }
    }

    /// Atomically check-and-set the pending-close flag. Returns true when
    /// this caller won the right to submit the close order.
    pub fn try_begin_close(&self, id: &str) -> bool {
        let mut open = self.open.write();
        match open.get_mut(id) {
            Some(position) if !position.pending_close => {
                position.pending_close = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the pending-close flag after a failed close submission.
    pub fn clear_pending_close(&self, id: &str) {
        self.update(id, |p| p.pending_close = false);
    }

    /// Move an open position into the closed set, computing realized pnl at
    /// `exit_price`. Returns the closed record.
    pub fn mark_closed(&self, id: &str, exit_price: f64, reason: ExitReason) -> Option<Position> {
        let mut open = self.open.write();
        let mut position = open.remove(id)?;

        position.realized_pnl =
            (exit_price - position.entry_price) * position.quantity * position.side.sign();
        position.current_price = exit_price;
        position.unrealized_pnl = 0.0;
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());
        position.exit_reason = Some(reason);
        position.pending_close = false;

        info!(
            id = %position.id,
            symbol = %position.symbol,
            exit_price,
            realized_pnl = position.realized_pnl,
            reason = %reason,
            "position closed"
        );

        let record = position.clone();
        self.closed.write().push(position);
        Some(record)
    }

    /// Remove an open position without closing it (adoption rollback paths).
    pub fn remove(&self, id: &str) -> Option<Position> {
        let removed = self.open.write().remove(id);
        if let Some(ref p) = removed {
            warn!(id = %p.id, symbol = %p.symbol, "position removed from store without close");
        }
        removed
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<Position> {
        self.open.read().get(id).cloned()
    }

    /// Snapshot of all open positions.
    pub fn iter_open(&self) -> Vec<Position> {
        self.open.read().values().cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }

    pub fn find_by_symbol(&self, symbol: &str) -> Vec<Position> {
        self.open
            .read()
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect()
    }

    pub fn find_by_symbol_side(&self, symbol: &str, side: Side) -> Option<Position> {
        self.open
            .read()
            .values()
            .find(|p| p.symbol == symbol && p.side == side)
            .cloned()
    }

    /// The most recent `count` closed positions, newest first.
    pub fn closed_recent(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn all_closed(&self) -> Vec<Position> {
        self.closed.read().clone()
    }

    // -------------------------------------------------------------------------
    // Crash recovery
    // -------------------------------------------------------------------------

    /// Snapshot of open positions for persistence.
    pub fn snapshot(&self) -> Vec<Position> {
        self.iter_open()
    }

    /// Replace the open set from a persisted snapshot. Pending-close flags
    /// are cleared: any in-flight close at crash time is resolved by
    /// reconciliation, not by replaying the flag.
    pub fn restore(&self, positions: Vec<Position>) {
        let mut open = self.open.write();
        open.clear();
        for mut p in positions {
            if p.status != PositionStatus::Open {
                continue;
            }
            p.pending_close = false;
            open.insert(p.id.clone(), p);
        }
        info!(count = open.len(), "position store restored from snapshot");
    }
}

impl std::fmt::Debug for PositionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStore")
            .field("open", &self.open.read().len())
            .field("closed", &self.closed.read().len())
            .finish()
    }
}
