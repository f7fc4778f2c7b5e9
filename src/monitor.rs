// =============================================================================
// Position Monitor — periodic trailing-stop, exit, and compensation pass
// =============================================================================
//
// Each tick, for every open position:
//   1. Fetch the current price and update pnl + trailing stop. The stop only
//      ever moves in the position's favor.
//   2. Ask the signal engine whether to close (stop / tp crossing, reversal,
//      time exit, liquidity floor).
//   3. Run the compensation pass: resolve achieved offsets, propose hedges.
//
// Store mutations happen under the store lock; every exchange call happens
// after the lock is released. Closes and hedge opens collected during the
// iteration execute at the end of the tick, with a settle pause after each
// close so the exchange can propagate state.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::compensation::{CompensationEngine, HedgeOrder, LinkResolution};
use crate::config::EngineConfig;
use crate::executor::{ExecError, OrderExecutor};
use crate::features::{last_ready, FeatureComputer};
use crate::journal::TradeJournal;
use crate::market_data::MarketDataFeed;
use crate::risk::RiskEngine;
use crate::scorer::SignalScorer;
use crate::signal::SignalEngine;
use crate::sizer::SizedOrder;
use crate::store::{Position, PositionStore};
use crate::types::{ExitReason, Side, Timeframe};

pub struct PositionMonitor {
    config: Arc<RwLock<EngineConfig>>,
    store: Arc<PositionStore>,
    executor: Arc<OrderExecutor>,
    feed: Arc<MarketDataFeed>,
    computer: Arc<dyn FeatureComputer>,
    scorer: Arc<dyn SignalScorer>,
    compensation: Arc<CompensationEngine>,
    risk: Arc<RiskEngine>,
    journal: Arc<TradeJournal>,
    shutdown: Arc<AtomicBool>,
}

impl PositionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        store: Arc<PositionStore>,
        executor: Arc<OrderExecutor>,
        feed: Arc<MarketDataFeed>,
        computer: Arc<dyn FeatureComputer>,
        scorer: Arc<dyn SignalScorer>,
        compensation: Arc<CompensationEngine>,
        risk: Arc<RiskEngine>,
        journal: Arc<TradeJournal>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            store,
            executor,
            feed,
            computer,
            scorer,
            compensation,
            risk,
            journal,
            shutdown,
        }
    }

    /// Run until shutdown. Spawned as a background task by the orchestrator.
    pub async fn run(self: Arc<Self>) {
        let interval_secs = self.config.read().monitor.interval_seconds.max(1);
        info!(interval_secs, "position monitor started");

        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs));

        while !self.shutdown.load(Ordering::Relaxed) {
            ticker.tick().await;
            self.tick().await;
        }

        info!("position monitor stopped");
    }

    /// One monitoring pass over all open positions.
    pub async fn tick(&self) {
        let cfg = self.config.read().clone();
        let engine = SignalEngine::new(cfg.signal.clone(), cfg.risk.clone());

        let open = self.store.iter_open();
        if open.is_empty() {
            debug!("monitor: no open positions");
            return;
        }

        let mut to_close: Vec<(String, ExitReason)> = Vec::new();
        let mut hedges: Vec<HedgeOrder> = Vec::new();

        for position in &open {
            if position.pending_close {
                continue;
            }

            // --- 1. Price fetch (no lock held) ------------------------------
            let quote = match self.executor.current_price(&position.symbol).await {
                Ok(q) => q,
                Err(e) => {
                    warn!(
                        id = %position.id,
                        symbol = %position.symbol,
                        error = %e,
                        "monitor: price fetch failed — skipping position this tick"
                    );
                    continue;
                }
            };
            let price = quote.last;
            if price <= 0.0 {
                warn!(id = %position.id, price, "monitor: invalid price — skipping");
                continue;
            }

            // --- Trailing stop + pnl under the store lock --------------------
            self.store.update(&position.id, |p| {
                p.current_price = price;
                p.unrealized_pnl = p.unrealized_at(price);
                apply_trailing(p, price);
            });
            // Re-read the mutated state before deciding anything.
            let Some(position) = self.store.get(&position.id) else {
                continue;
            };

            // --- 2. Exit decision -------------------------------------------
            let bars = self
                .feed
                .get_recent_bars(&position.symbol, cfg.timeframe, cfg.history_bars);
            let frames = self.computer.compute(&bars);
            let frame = last_ready(&frames);
            let fresh_signal = frame.and_then(|f| {
                self.scorer
                    .score(f)
                    .ok()
                    .map(|confidence| engine.evaluate(f, confidence))
            });
            let bars_held = bars_since_entry(&position, cfg.timeframe);

            let decision =
                engine.should_close(&position, price, frame, fresh_signal.as_ref(), bars_held);
            if decision.close {
                let reason = decision.reason.unwrap_or(ExitReason::StopLoss);
                info!(
                    id = %position.id,
                    symbol = %position.symbol,
                    price,
                    reason = %reason,
                    "monitor: close triggered"
                );
                to_close.push((position.id.clone(), reason));
                continue;
            }

            // --- 3. Compensation pass ---------------------------------------
            if let Some(link) = self.compensation.link_for_parent(&position.id) {
                match self.store.get(&link.child_id) {
                    Some(child) => {
                        if self.compensation.offset_achieved(&position, &child) {
                            info!(
                                parent_id = %position.id,
                                child_id = %child.id,
                                "monitor: compensation offset achieved — closing both legs"
                            );
                            // Child first to release margin, then the parent.
                            to_close.push((child.id.clone(), ExitReason::CompensationOffset));
                            to_close.push((position.id.clone(), ExitReason::CompensationOffset));
                        }
                    }
                    None => {
                        // Child vanished outside our control; clear the link.
                        self.compensation.on_closed(&link.child_id);
                    }
                }
            } else if position.parent_id.is_none() {
                if let Some(hedge) = self
                    .compensation
                    .maybe_open(&position, self.risk.compensation_allowed())
                {
                    hedges.push(hedge);
                }
            }
        }

        // --- Execute collected closes ---------------------------------------
        // A position can be enqueued twice in one pass (its own exit plus a
        // compensation resolution); the first reason wins.
        let mut seen = std::collections::HashSet::new();
        to_close.retain(|(id, _)| seen.insert(id.clone()));

        let settle = std::time::Duration::from_millis(cfg.monitor.settle_delay_ms);
        for (id, reason) in to_close {
            match self.executor.close(&id, reason).await {
                Ok(closed) => {
                    self.resolve_compensation_on_close(&closed.id);
                    tokio::time::sleep(settle).await;
                }
                Err(ExecError::CloseAlreadyPending(_)) => {
                    debug!(id = %id, "monitor: close already in flight");
                }
                Err(e) => {
                    error!(id = %id, error = %e, "monitor: close failed");
                }
            }
        }

        // --- Execute collected hedges ---------------------------------------
        for hedge in hedges {
            self.open_hedge(hedge).await;
        }

        // --- Persist the snapshot for crash recovery -------------------------
        if let Err(e) = self.journal.write_snapshot(&self.store.snapshot()) {
            warn!(error = %e, "monitor: snapshot write failed");
        }
    }

    /// Clear any compensation link involving `position_id`; a surviving leg
    /// continues standalone.
    fn resolve_compensation_on_close(&self, position_id: &str) {
        match self.compensation.on_closed(position_id) {
            Some(LinkResolution::ChildReleased { child_id }) => {
                self.store.update(&child_id, |p| p.parent_id = None);
            }
            Some(LinkResolution::ParentReleased { parent_id }) => {
                // Parent keeps its own stop and target; nothing to rewrite.
                debug!(parent_id = %parent_id, "hedge closed — parent standalone");
            }
            None => {}
        }
    }

    async fn open_hedge(&self, hedge: HedgeOrder) {
        // Capacity can have changed since the proposal was collected.
        let max_hedges = self.config.read().compensation.max_hedges;
        if self.compensation.active_hedges() >= max_hedges {
            debug!(parent_id = %hedge.parent_id, "hedge capacity filled mid-tick");
            return;
        }

        let order = SizedOrder {
            symbol: hedge.symbol.clone(),
            side: hedge.side,
            quantity: hedge.quantity,
            entry_price: hedge.entry_price,
            stop_loss: hedge.stop_loss,
            take_profit: hedge.take_profit,
            trailing_stop_fraction: self.config.read().signal.trailing_stop_fraction,
            risk_amount: (hedge.entry_price - hedge.stop_loss).abs() * hedge.quantity,
            atr_at_entry: 0.0,
            confidence: 0.0,
            strategy_tag: Some("compensation".to_string()),
            parent_id: Some(hedge.parent_id.clone()),
        };

        match self.executor.open(&order).await {
            Ok(child) => {
                self.compensation
                    .register(&hedge.parent_id, &child.id, hedge.target_offset_amount);
                info!(
                    parent_id = %hedge.parent_id,
                    child_id = %child.id,
                    target_offset = hedge.target_offset_amount,
                    "hedge opened"
                );
            }
            Err(e) => {
                warn!(
                    parent_id = %hedge.parent_id,
                    error = %e,
                    "hedge open failed — parent continues under its own stop"
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Update the trailing stop and favorable-price watermark in place.
///
/// With profit `p = (price - entry) * sign`, the candidate stop is
/// `entry + sign * p * trailing_fraction`. The stop moves only when the
/// candidate improves on the stored stop for the side; it never moves
/// against the position.
pub fn apply_trailing(position: &mut Position, price: f64) {
    let sign = position.side.sign();

    if sign * (price - position.highest_favorable_price) > 0.0 {
        position.highest_favorable_price = price;
    }

    let profit = (price - position.entry_price) * sign;
    if profit <= 0.0 {
        return;
    }

    let candidate = position.entry_price + sign * profit * position.trailing_stop_fraction;
    let improved = match position.side {
        Side::Long => candidate > position.stop_loss,
        Side::Short => candidate < position.stop_loss,
    };

    if improved {
        debug!(
            id = %position.id,
            old_stop = position.stop_loss,
            new_stop = candidate,
            price,
            "trailing stop advanced"
        );
        position.stop_loss = candidate;
        position.trailing_updated = true;
    }
}

/// Whole bars elapsed since the position was opened.
fn bars_since_entry(position: &Position, timeframe: Timeframe) -> u64 {
    let elapsed = Utc::now()
        .signed_duration_since(position.entry_time)
        .num_seconds()
        .max(0) as u64;
    elapsed / timeframe.secs()
}
