// =============================================================================
// Orchestrator — top-level scheduler for the live trading engine
// =============================================================================
//
// Drives three concurrent activities on a one-second base tick:
//
//   | activity     | period              | work                               |
//   |--------------|---------------------|------------------------------------|
//   | signal pass  | every 60 ticks      | evaluate -> gate -> size -> open   |
//   | health check | every 300 ticks     | connectivity, feed, recovery       |
//   | monitor loop | monitor.interval_s  | spawned PositionMonitor task       |
//
// Pre-trade gates, in order: same (symbol, side) already open -> skip;
// opposite side open -> close it and wait for the ack; risk engine breakers
// (count, drawdown, heat) -> skip; sizer rejection -> skip with the logged
// reason. The orchestrator is the only component that turns component errors
// into control decisions.
//
// Shutdown (SIGINT or duration expiry): stop the loops, close every open
// position with market orders, persist the final snapshot and session
// result, save the config.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::compensation::LinkResolution;
use crate::executor::OrderExecutor;
use crate::features::{last_ready, FeatureComputer};
use crate::journal::SessionResult;
use crate::market_data::ExchangeHistory;
use crate::monitor::PositionMonitor;
use crate::scorer::SignalScorer;
use crate::signal::SignalEngine;
use crate::sizer::RiskSizer;
use crate::state::{DecisionRecord, EngineState};
use crate::types::{ExitReason, SignalKind, TradingMode};

/// Ticks between signal passes (one-second base tick).
const SIGNAL_PASS_TICKS: u64 = 60;
/// Ticks between health checks.
const HEALTH_CHECK_TICKS: u64 = 300;
/// Consecutive failed recoveries before the engine aborts.
const MAX_RECOVERY_FAILURES: u32 = 3;
/// Store/exchange divergence that forces a reconcile during recovery.
const RECONCILE_DIVERGENCE_LIMIT: usize = 1;

pub struct Orchestrator {
    state: Arc<EngineState>,
    executor: Arc<OrderExecutor>,
    computer: Arc<dyn FeatureComputer>,
    scorer: Arc<dyn SignalScorer>,
    history: Arc<ExchangeHistory>,
    session_started_at: DateTime<Utc>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<EngineState>,
        executor: Arc<OrderExecutor>,
        computer: Arc<dyn FeatureComputer>,
        scorer: Arc<dyn SignalScorer>,
        history: Arc<ExchangeHistory>,
    ) -> Self {
        Self {
            state,
            executor,
            computer,
            scorer,
            history,
            session_started_at: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until the duration expires or shutdown is requested.
    pub async fn run(&self, duration: Option<std::time::Duration>) -> Result<()> {
        self.startup().await;

        // Monitor task.
        let monitor = Arc::new(PositionMonitor::new(
            self.state.config.clone(),
            self.state.store.clone(),
            self.executor.clone(),
            self.state.feed.clone(),
            self.computer.clone(),
            self.scorer.clone(),
            self.state.compensation.clone(),
            self.state.risk.clone(),
            self.state.journal.clone(),
            self.state.shutdown.clone(),
        ));
        let mut monitor_handle = tokio::spawn(monitor.run());

        let started = std::time::Instant::now();
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut tick: u64 = 0;
        let mut recovery_failures: u32 = 0;

        info!("orchestrator main loop running");

        loop {
            ticker.tick().await;

            if self.state.shutdown_requested() {
                info!("shutdown requested — leaving main loop");
                break;
            }
            if let Some(limit) = duration {
                if started.elapsed() >= limit {
                    info!(elapsed_s = started.elapsed().as_secs(), "duration limit reached");
                    break;
                }
            }

            if tick % HEALTH_CHECK_TICKS == 0 {
                if !self.health_check().await {
                    warn!("health check failed — attempting recovery");
                    if self.attempt_recovery().await {
                        recovery_failures = 0;
                        info!("recovery succeeded");
                    } else {
                        recovery_failures += 1;
                        error!(recovery_failures, "recovery failed");
                        if recovery_failures >= MAX_RECOVERY_FAILURES {
                            error!("recovery limit exhausted — aborting session");
                            self.state.request_shutdown();
                            break;
                        }
                    }
                }
            }

            if tick % SIGNAL_PASS_TICKS == 0 {
                self.process_signals().await;
            }

            tick += 1;
        }

        self.state.request_shutdown();
        // Let the monitor finish its current iteration; past the deadline it
        // is abandoned and the next startup reconciles whatever it left.
        if tokio::time::timeout(std::time::Duration::from_secs(5), &mut monitor_handle)
            .await
            .is_err()
        {
            warn!("monitor did not stop within the deadline — aborting task");
            monitor_handle.abort();
        }
        self.shutdown().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    async fn startup(&self) {
        let cfg = self.state.config.read().clone();

        for symbol in &cfg.symbols {
            self.state.feed.subscribe(symbol, cfg.timeframe);
        }
        self.state
            .feed
            .prime(self.history.as_ref(), cfg.history_bars)
            .await;
        self.state.feed.clone().start();

        // Crash recovery: restore the last snapshot, then let the exchange
        // correct it.
        match self.state.journal.load_snapshot() {
            Ok(positions) if !positions.is_empty() => {
                info!(count = positions.len(), "restoring position snapshot");
                self.state.store.restore(positions);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "snapshot restore failed — starting empty"),
        }

        match self.executor.reconcile().await {
            Ok(report) => {
                for id in &report.externally_closed {
                    self.resolve_compensation(id);
                }
                *self.state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                *self.state.last_reconcile_error.write() = None;
            }
            Err(e) => {
                warn!(error = %e, "startup reconcile failed");
                *self.state.last_reconcile_error.write() = Some(e.to_string());
            }
        }

        info!(symbols = ?cfg.symbols, timeframe = %cfg.timeframe, "orchestrator started");
    }

    // -------------------------------------------------------------------------
    // Signal pass
    // -------------------------------------------------------------------------

    /// Evaluate every subscribed symbol and act on accepted intents.
    pub async fn process_signals(&self) {
        let cfg = self.state.config.read().clone();

        if cfg.trading_mode != TradingMode::Live {
            debug!(mode = %cfg.trading_mode, "signal pass skipped — engine not live");
            return;
        }

        let engine = SignalEngine::new(cfg.signal.clone(), cfg.risk.clone());
        let sizer = RiskSizer::new(cfg.risk.clone(), cfg.exchange.leverage);

        for symbol in &cfg.symbols {
            let bars = self
                .state
                .feed
                .get_recent_bars(symbol, cfg.timeframe, cfg.history_bars);
            let frames = self.computer.compute(&bars);
            let Some(frame) = last_ready(&frames) else {
                debug!(symbol, bars = bars.len(), "insufficient ready data");
                continue;
            };

            // No scorer, no signal: live mode never falls back to a neutral
            // confidence.
            let confidence = match self.scorer.score(frame) {
                Ok(c) => c,
                Err(e) => {
                    self.state
                        .push_decision(DecisionRecord::blocked(symbol, format!("scorer: {e}")));
                    warn!(symbol, error = %e, "scorer unavailable — refusing to signal");
                    continue;
                }
            };

            let signal = engine.evaluate(frame, confidence);
            if signal.kind == SignalKind::None {
                debug!(symbol, reason = ?signal.reason, confidence, "no signal");
                continue;
            }
            let side = signal.kind.side().expect("directional signal");

            // --- Gate 1: same (symbol, side) already open --------------------
            if self.state.store.find_by_symbol_side(symbol, side).is_some() {
                self.state.push_decision(DecisionRecord::skip(
                    symbol,
                    format!("{side} position already open"),
                ));
                continue;
            }

            // --- Gate 2: opposite side open -> close first, wait for ack -----
            if let Some(opposite) = self
                .state
                .store
                .find_by_symbol_side(symbol, side.opposite())
            {
                info!(
                    symbol,
                    opposite_id = %opposite.id,
                    "closing opposite position before new entry"
                );
                match self.executor.close(&opposite.id, ExitReason::OppositeEntry).await {
                    Ok(closed) => {
                        self.resolve_compensation(&closed.id);
                        // Let the exchange propagate the close before the
                        // new entry hits it.
                        tokio::time::sleep(std::time::Duration::from_millis(
                            cfg.monitor.settle_delay_ms,
                        ))
                        .await;
                    }
                    Err(e) => {
                        self.state
                            .push_error(format!("{symbol}: opposite close failed: {e}"));
                        continue;
                    }
                }
            }

            // --- Intent ------------------------------------------------------
            let intent = match engine.build_intent(symbol, &signal, &frame.bar, frame.atr) {
                Ok(intent) => intent,
                Err(e) => {
                    self.state
                        .push_decision(DecisionRecord::skip(symbol, format!("intent: {e}")));
                    continue;
                }
            };

            // --- Fresh balance (never cached across sizing decisions) --------
            let snapshot = match self.executor.fetch_balance().await {
                Ok(s) => s,
                Err(e) => {
                    self.state
                        .push_error(format!("{symbol}: balance fetch failed: {e}"));
                    continue;
                }
            };
            *self.state.last_balance.write() = Some(snapshot.clone());

            // --- Gate 3: risk engine breakers --------------------------------
            let open = self.state.store.iter_open();
            let candidate_risk = snapshot.free_quote_balance * intent.risk_fraction;
            let (allowed, reason) = self.state.risk.can_open(&open, candidate_risk);
            if !allowed {
                let reason = reason.unwrap_or_else(|| "risk breaker".to_string());
                warn!(symbol, %reason, "entry blocked by risk engine");
                self.state
                    .push_decision(DecisionRecord::blocked(symbol, reason));
                continue;
            }

            // --- Gate 4: sizer -----------------------------------------------
            let meta = match self.executor.symbol_meta(symbol).await {
                Ok(m) => m,
                Err(e) => {
                    self.state
                        .push_error(format!("{symbol}: symbol meta fetch failed: {e}"));
                    continue;
                }
            };

            let mut order = match sizer.size(&intent, &snapshot, &open, &meta) {
                Ok(order) => order,
                Err(reject) => {
                    // Policy rejection: info level, not an error.
                    info!(symbol, reason = %reject, "sizer rejected entry");
                    self.state
                        .push_decision(DecisionRecord::skip(symbol, format!("sizer: {reject}")));
                    continue;
                }
            };
            order.strategy_tag = Some("heikin-ashi-ml".to_string());

            // --- Execute -----------------------------------------------------
            match self.executor.open(&order).await {
                Ok(position) => {
                    info!(
                        symbol,
                        id = %position.id,
                        side = %position.side,
                        quantity = position.quantity,
                        "entry executed"
                    );
                    self.state.push_decision(DecisionRecord::open(symbol));
                }
                Err(e) => {
                    warn!(symbol, error = %e, "entry execution failed");
                    self.state
                        .push_decision(DecisionRecord::blocked(symbol, e.to_string()));
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Health & recovery
    // -------------------------------------------------------------------------

    /// Verify connectivity, feed health, and store/exchange agreement.
    async fn health_check(&self) -> bool {
        let mut issues: Vec<String> = Vec::new();

        match self.executor.fetch_balance().await {
            Ok(snapshot) => {
                *self.state.last_balance.write() = Some(snapshot);
            }
            Err(e) => issues.push(format!("exchange connectivity lost: {e}")),
        }

        if self.state.feed.any_degraded() {
            issues.push("market data subscription degraded".to_string());
        }

        if issues.is_empty() {
            debug!("health check passed");
            true
        } else {
            for issue in &issues {
                self.state.push_error(issue.clone());
            }
            warn!(?issues, "health check failed");
            false
        }
    }

    /// Reconnect, reconcile, and clear suspect caches.
    async fn attempt_recovery(&self) -> bool {
        info!("recovery: clearing market data caches");
        self.state.feed.clear_cache();

        // Reload the strategy configuration when it has gone missing.
        if self.state.config.read().symbols.is_empty() {
            match crate::config::EngineConfig::load(crate::config::DEFAULT_CONFIG_PATH) {
                Ok(fresh) => {
                    warn!("recovery: symbol list was empty — config reloaded from disk");
                    let mut config = self.state.config.write();
                    config.symbols = fresh.symbols;
                    config.signal = fresh.signal;
                    config.risk = fresh.risk;
                }
                Err(e) => {
                    error!(error = %e, "recovery: config reload failed");
                    return false;
                }
            }
        }

        match self.executor.reconcile().await {
            Ok(report) => {
                for id in &report.externally_closed {
                    self.resolve_compensation(id);
                }
                if report.divergence() > RECONCILE_DIVERGENCE_LIMIT {
                    warn!(
                        divergence = report.divergence(),
                        "recovery reconcile found heavy store/exchange drift"
                    );
                }
                *self.state.last_reconcile_ok.write() = Some(std::time::Instant::now());
                *self.state.last_reconcile_error.write() = None;
                true
            }
            Err(e) => {
                error!(error = %e, "recovery reconcile failed");
                *self.state.last_reconcile_error.write() = Some(e.to_string());
                false
            }
        }
    }

    fn resolve_compensation(&self, closed_id: &str) {
        if let Some(LinkResolution::ChildReleased { child_id }) =
            self.state.compensation.on_closed(closed_id)
        {
            self.state.store.update(&child_id, |p| p.parent_id = None);
        }
    }

    // -------------------------------------------------------------------------
    // Shutdown
    // -------------------------------------------------------------------------

    /// Close everything, persist final state, stop the feed.
    async fn shutdown(&self) {
        info!("shutdown: closing all open positions");

        for position in self.state.store.iter_open() {
            match self.executor.close(&position.id, ExitReason::Shutdown).await {
                Ok(closed) => {
                    self.resolve_compensation(&closed.id);
                    info!(
                        id = %closed.id,
                        symbol = %closed.symbol,
                        realized_pnl = closed.realized_pnl,
                        "position closed on shutdown"
                    );
                }
                Err(e) => {
                    // Reconciliation picks this up on the next startup.
                    error!(id = %position.id, error = %e, "shutdown close failed");
                }
            }
        }

        if let Err(e) = self
            .state
            .journal
            .write_snapshot(&self.state.store.snapshot())
        {
            warn!(error = %e, "final snapshot write failed");
        }

        let closed = self.state.store.all_closed();
        let result = SessionResult::from_closed(&closed, self.session_started_at);
        if let Err(e) = self.state.journal.write_session_result(&result) {
            warn!(error = %e, "session result write failed");
        }

        self.state.feed.stop();

        info!(
            total_trades = result.total_trades,
            net_pnl = result.total_net_pnl,
            "orchestrator shut down"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::compensation::CompensationEngine;
    use crate::config::EngineConfig;
    use crate::exchange::{
        BalanceEndpoint, ExchangeClient, ExchangeError, ExchangePosition, Fill, SymbolMeta,
    };
    use crate::features::TechnicalFeatureComputer;
    use crate::journal::TradeJournal;
    use crate::market_data::MarketDataFeed;
    use crate::risk::RiskEngine;
    use crate::scorer::{FixedScorer, UnavailableScorer};
    use crate::store::PositionStore;
    use crate::types::{AccountSnapshot, Bar, Quote, Side, Timeframe};
    use async_trait::async_trait;
    use parking_lot::RwLock;

    /// Bars engineered so the default filters produce a BUY on the last bar:
    /// mild alternation keeps RSI moderate, a strongly bullish tail keeps the
    /// Heikin-Ashi candle green, constant volume satisfies the volume gate,
    /// and wide ranges give an ATR large enough that the sized notional fits
    /// under the per-position cap.
    fn warm_bars(n: usize) -> Vec<Bar> {
        let now_ms = Utc::now().timestamp_millis();
        let mut bars = Vec::with_capacity(n);
        let mut close: f64 = 30_000.0;
        for i in 0..n {
            let delta = if i >= n - 4 {
                200.0
            } else if i % 2 == 0 {
                80.0
            } else {
                -60.0
            };
            let open = close;
            close += delta;
            let high = open.max(close) + 150.0;
            let low = open.min(close) - 150.0;
            bars.push(Bar {
                timestamp: now_ms - (n as i64 - i as i64) * 14_400_000,
                open,
                high,
                low,
                close,
                volume: 100.0,
            });
        }
        bars
    }

    struct OrchStub {
        bars: Vec<Bar>,
        fill_price: RwLock<f64>,
    }

    #[async_trait]
    impl ExchangeClient for OrchStub {
        async fn place_market_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
        ) -> Result<Fill, ExchangeError> {
            Ok(Fill {
                order_id: "1".into(),
                symbol: symbol.into(),
                side,
                quantity,
                price: *self.fill_price.read(),
                filled_at: Utc::now(),
            })
        }

        async fn place_limit_order(
            &self,
            _: &str,
            _: Side,
            _: f64,
            _: f64,
        ) -> Result<Fill, ExchangeError> {
            unimplemented!()
        }

        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn fetch_balance(
            &self,
            _: BalanceEndpoint,
        ) -> Result<AccountSnapshot, ExchangeError> {
            Ok(AccountSnapshot {
                free_quote_balance: 10_000.0,
                total_quote_balance: 10_000.0,
                as_of: Utc::now(),
            })
        }

        async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn fetch_ohlcv(
            &self,
            _: &str,
            _: Timeframe,
            limit: usize,
        ) -> Result<Vec<Bar>, ExchangeError> {
            let start = self.bars.len().saturating_sub(limit);
            Ok(self.bars[start..].to_vec())
        }

        async fn fetch_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError> {
            let p = *self.fill_price.read();
            Ok(Quote {
                symbol: symbol.into(),
                bid: p - 1.0,
                ask: p + 1.0,
                last: p,
                as_of: 0,
            })
        }

        async fn symbol_meta(&self, _: &str) -> Result<SymbolMeta, ExchangeError> {
            Ok(SymbolMeta {
                lot_step: 0.001,
                min_notional: 10.0,
                price_tick: 0.1,
            })
        }
    }

    struct OrchHarness {
        orchestrator: Orchestrator,
        state: Arc<EngineState>,
        _dir: tempfile::TempDir,
    }

    fn orch_harness(scorer: Arc<dyn SignalScorer>, mut cfg: EngineConfig) -> OrchHarness {
        let dir = tempfile::tempdir().unwrap();
        cfg.trading_mode = TradingMode::Live;
        cfg.symbols = vec!["BTCUSDT".to_string()];
        cfg.monitor.settle_delay_ms = 0;
        // The synthetic uptrend keeps RSI elevated; widen the room so the
        // test exercises the plumbing rather than the RSI threshold, which
        // has its own unit tests.
        cfg.signal.rsi_overbought = 95.0;
        cfg.exchange.max_retries = 0;

        let bars = warm_bars(60);
        let last_close = bars.last().unwrap().close;
        let stub = Arc::new(OrchStub {
            bars,
            fill_price: RwLock::new(last_close),
        });

        let config = Arc::new(RwLock::new(cfg.clone()));
        let store = Arc::new(PositionStore::new(false));
        let risk = Arc::new(RiskEngine::new(&cfg.risk, 10_000.0));
        let journal = Arc::new(TradeJournal::new(
            dir.path().join("trades.jsonl"),
            dir.path().join("positions.json"),
            dir.path().join("session.json"),
        ));
        let compensation = Arc::new(CompensationEngine::new(cfg.compensation.clone()));
        let feed = Arc::new(MarketDataFeed::new(
            stub.clone() as Arc<dyn ExchangeClient>,
            cfg.cache_bars,
            1,
            60,
        ));
        let executor = Arc::new(OrderExecutor::new(
            stub.clone() as Arc<dyn ExchangeClient>,
            store.clone(),
            risk.clone(),
            journal.clone(),
            cfg.exchange.clone(),
            cfg.timeframe,
            cfg.signal.trailing_stop_fraction,
        ));

        let state = Arc::new(EngineState::new(
            config,
            store,
            risk,
            compensation,
            feed.clone(),
            journal,
        ));

        // Prime the feed cache directly from the stub's bar history.
        feed.subscribe("BTCUSDT", cfg.timeframe);

        let orchestrator = Orchestrator::new(
            state.clone(),
            executor,
            Arc::new(TechnicalFeatureComputer::new(&cfg.signal)),
            scorer,
            Arc::new(ExchangeHistory(stub as Arc<dyn ExchangeClient>)),
        );

        OrchHarness {
            orchestrator,
            state,
            _dir: dir,
        }
    }

    async fn prime_feed(h: &OrchHarness) {
        let cfg = h.state.config.read().clone();
        let history = &h.orchestrator.history;
        h.state.feed.prime(history.as_ref(), cfg.history_bars).await;
    }

    #[tokio::test]
    async fn s1_signal_pass_opens_sized_long() {
        let h = orch_harness(Arc::new(FixedScorer(0.6)), EngineConfig::default());
        prime_feed(&h).await;

        h.orchestrator.process_signals().await;

        let open = h.state.store.iter_open();
        assert_eq!(open.len(), 1, "expected one entry, decisions: {:?}", h.state.recent_decisions.read());
        let p = &open[0];
        assert_eq!(p.side, Side::Long);

        // Geometry: stop below entry, tp above, rr = 2.5.
        assert!(p.stop_loss < p.entry_price);
        assert!(p.take_profit > p.entry_price);
        let rr = (p.take_profit - p.entry_price) / (p.entry_price - p.stop_loss);
        assert!((rr - 2.5).abs() < 1e-6, "rr {rr}");

        // Risk: quantity * stop_distance ~= 2% of free balance.
        let risked = p.quantity * p.stop_distance();
        assert!(
            (risked - 200.0).abs() < 5.0,
            "risked {risked}, expected ~200"
        );
    }

    #[tokio::test]
    async fn duplicate_side_entry_is_skipped() {
        let h = orch_harness(Arc::new(FixedScorer(0.6)), EngineConfig::default());
        prime_feed(&h).await;

        h.orchestrator.process_signals().await;
        assert_eq!(h.state.store.open_count(), 1);

        // Second pass sees the open long and skips.
        h.orchestrator.process_signals().await;
        assert_eq!(h.state.store.open_count(), 1);
        let decisions = h.state.recent_decisions.read();
        assert!(decisions.iter().any(|d| d.action == "skip"));
    }

    #[tokio::test]
    async fn opposite_position_is_closed_before_entry() {
        let h = orch_harness(Arc::new(FixedScorer(0.6)), EngineConfig::default());
        prime_feed(&h).await;

        // Seed an open short on the same symbol.
        let short = PositionStore::build_position(
            "BTCUSDT",
            Side::Short,
            30_000.0,
            0.1,
            30_450.0,
            28_875.0,
            0.65,
            300.0,
            0.6,
            None,
            None,
        );
        let short_id = short.id.clone();
        h.state.store.insert(short).unwrap();

        h.orchestrator.process_signals().await;

        // The short was closed with the opposite-entry reason and a long
        // now stands in its place.
        assert!(h.state.store.get(&short_id).is_none());
        let closed = h.state.store.closed_recent(5);
        assert!(closed
            .iter()
            .any(|p| p.id == short_id && p.exit_reason == Some(ExitReason::OppositeEntry)));
        assert!(h
            .state
            .store
            .find_by_symbol_side("BTCUSDT", Side::Long)
            .is_some());
    }

    #[tokio::test]
    async fn s6_tripped_breaker_blocks_new_entries() {
        let h = orch_harness(Arc::new(FixedScorer(0.6)), EngineConfig::default());
        prime_feed(&h).await;

        // 16% drawdown against the 15% cap.
        h.state.risk.observe_equity(8_400.0);

        h.orchestrator.process_signals().await;

        assert_eq!(h.state.store.open_count(), 0);
        let decisions = h.state.recent_decisions.read();
        assert!(
            decisions
                .iter()
                .any(|d| d.action == "blocked"
                    && d.reason.as_deref().unwrap_or("").contains("drawdown")),
            "decisions: {decisions:?}"
        );
    }

    #[tokio::test]
    async fn paused_engine_produces_no_entries() {
        let mut cfg = EngineConfig::default();
        cfg.trading_mode = TradingMode::Paused;
        let h = orch_harness(Arc::new(FixedScorer(0.6)), cfg);
        prime_feed(&h).await;

        // orch_harness forces Live; flip back to Paused for this test.
        h.state.config.write().trading_mode = TradingMode::Paused;
        h.orchestrator.process_signals().await;
        assert_eq!(h.state.store.open_count(), 0);
    }

    #[tokio::test]
    async fn missing_scorer_refuses_to_signal() {
        let h = orch_harness(Arc::new(UnavailableScorer), EngineConfig::default());
        prime_feed(&h).await;

        h.orchestrator.process_signals().await;

        assert_eq!(h.state.store.open_count(), 0);
        let decisions = h.state.recent_decisions.read();
        assert!(decisions
            .iter()
            .any(|d| d.reason.as_deref().unwrap_or("").contains("scorer")));
    }

    #[tokio::test]
    async fn out_of_range_confidence_produces_no_entry() {
        let h = orch_harness(Arc::new(FixedScorer(0.3)), EngineConfig::default());
        prime_feed(&h).await;

        h.orchestrator.process_signals().await;
        assert_eq!(h.state.store.open_count(), 0);
    }
}
