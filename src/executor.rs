// =============================================================================
// Order Executor — reconciles intended state with exchange-reported state
// =============================================================================
//
// All exchange traffic from the trading path flows through here:
//   - opens, with gap and spread pre-checks and post-fill slippage logging
//   - closes, guarded by the store's pending-close flag
//   - balance queries with primary -> secondary endpoint fallback
//   - reconciliation between the local store and exchange positions
//
// Every call carries a hard deadline; transient failures retry with bounded
// exponential backoff. Exchange rejections surface with the raw code and the
// normalized reason.
// =============================================================================

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ExchangeConfig;
use crate::exchange::client::backoff_delay;
use crate::exchange::{
    BalanceEndpoint, ExchangeClient, ExchangeError, ExchangePosition,
};
use crate::journal::TradeJournal;
use crate::risk::RiskEngine;
use crate::sizer::SizedOrder;
use crate::store::{Position, PositionStore, StoreError};
use crate::types::{AccountSnapshot, Bar, ExitReason, Quote, Timeframe};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ExchangeError },

    #[error("max consecutive-bar gap {observed:.4} exceeds limit {limit:.4}")]
    GapExceeded { observed: f64, limit: f64 },

    #[error("spread ratio {observed:.5} exceeds limit {limit:.5}")]
    SpreadTooWide { observed: f64, limit: f64 },

    #[error("close already in flight for position {0}")]
    CloseAlreadyPending(String),

    #[error("position {0} not found")]
    PositionNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("every balance endpoint failed; last: {0}")]
    BalanceEndpointsExhausted(ExchangeError),
}

// ---------------------------------------------------------------------------
// Reconciliation report
// ---------------------------------------------------------------------------

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Ids of remote positions adopted into the local store.
    pub adopted: Vec<String>,
    /// Ids of local positions marked externally closed.
    pub externally_closed: Vec<String>,
    /// Local positions refreshed from exchange-reported state.
    pub updated: u32,
}

impl ReconcileReport {
    pub fn divergence(&self) -> usize {
        self.adopted.len() + self.externally_closed.len()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct OrderExecutor {
    client: Arc<dyn ExchangeClient>,
    store: Arc<PositionStore>,
    risk: Arc<RiskEngine>,
    journal: Arc<TradeJournal>,
    cfg: ExchangeConfig,
    timeframe: Timeframe,
    /// Trailing fraction given to adopted positions, which arrive without
    /// risk parameters.
    default_trailing_fraction: f64,
    /// Ordered endpoint list; primary first, fixed at construction.
    balance_endpoints: Vec<BalanceEndpoint>,
    last_good_endpoint: RwLock<BalanceEndpoint>,
}

impl OrderExecutor {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: Arc<PositionStore>,
        risk: Arc<RiskEngine>,
        journal: Arc<TradeJournal>,
        cfg: ExchangeConfig,
        timeframe: Timeframe,
        default_trailing_fraction: f64,
    ) -> Self {
        let primary = if cfg.default_type.eq_ignore_ascii_case("spot") {
            BalanceEndpoint::Spot
        } else {
            BalanceEndpoint::Margin
        };
        let secondary = match primary {
            BalanceEndpoint::Margin => BalanceEndpoint::Spot,
            BalanceEndpoint::Spot => BalanceEndpoint::Margin,
        };

        Self {
            client,
            store,
            risk,
            journal,
            cfg,
            timeframe,
            default_trailing_fraction,
            balance_endpoints: vec![primary, secondary],
            last_good_endpoint: RwLock::new(primary),
        }
    }

    /// Endpoint that served the most recent successful balance query.
    pub fn last_good_endpoint(&self) -> BalanceEndpoint {
        *self.last_good_endpoint.read()
    }

    // -------------------------------------------------------------------------
    // Retry wrapper
    // -------------------------------------------------------------------------

    /// Run `op` under the configured deadline, retrying transient failures
    /// with exponential backoff.
    async fn call<T, F, Fut>(&self, op: F) -> Result<T, ExecError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let deadline = std::time::Duration::from_secs(self.cfg.request_deadline_secs);
        let mut last = ExchangeError::Timeout;

        for attempt in 0..=self.cfg.max_retries {
            match tokio::time::timeout(deadline, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_transient() => {
                    warn!(attempt, error = %e, "transient exchange error");
                    last = e;
                }
                Ok(Err(e)) => return Err(ExecError::Exchange(e)),
                Err(_) => {
                    warn!(attempt, "exchange call exceeded deadline");
                    last = ExchangeError::Timeout;
                }
            }

            if attempt < self.cfg.max_retries {
                tokio::time::sleep(backoff_delay(
                    attempt,
                    self.cfg.backoff_base_secs,
                    self.cfg.backoff_cap_secs,
                ))
                .await;
            }
        }

        Err(ExecError::RetriesExhausted {
            attempts: self.cfg.max_retries + 1,
            last,
        })
    }

    // -------------------------------------------------------------------------
    // Market data helpers
    // -------------------------------------------------------------------------

    pub async fn current_price(&self, symbol: &str) -> Result<Quote, ExecError> {
        self.call(|| self.client.fetch_ticker(symbol)).await
    }

    pub async fn symbol_meta(
        &self,
        symbol: &str,
    ) -> Result<crate::exchange::SymbolMeta, ExecError> {
        self.call(|| self.client.symbol_meta(symbol)).await
    }

    /// Exchange-reported open positions.
    pub async fn fetch_open_positions(&self) -> Result<Vec<ExchangePosition>, ExecError> {
        self.call(|| self.client.fetch_positions()).await
    }

    // -------------------------------------------------------------------------
    // Balance with endpoint fallback
    // -------------------------------------------------------------------------

    /// Fetch the account snapshot, trying the primary endpoint first and
    /// falling back to the secondary. The winning endpoint is recorded; the
    /// configured primary stays primary for the next call.
    pub async fn fetch_balance(&self) -> Result<AccountSnapshot, ExecError> {
        let mut last_err = ExchangeError::Timeout;

        for &endpoint in &self.balance_endpoints {
            match self.call(|| self.client.fetch_balance(endpoint)).await {
                Ok(snapshot) => {
                    *self.last_good_endpoint.write() = endpoint;
                    self.risk.observe_equity(snapshot.total_quote_balance);
                    debug!(
                        endpoint = %endpoint,
                        free = snapshot.free_quote_balance,
                        total = snapshot.total_quote_balance,
                        "balance fetched"
                    );
                    return Ok(snapshot);
                }
                Err(ExecError::Exchange(e)) | Err(ExecError::RetriesExhausted { last: e, .. }) => {
                    warn!(endpoint = %endpoint, error = %e, "balance endpoint failed");
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ExecError::BalanceEndpointsExhausted(last_err))
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Submit a sized order and insert the resulting position.
    pub async fn open(&self, order: &SizedOrder) -> Result<Position, ExecError> {
        // Gap check over the recent window.
        let bars = self
            .call(|| {
                self.client
                    .fetch_ohlcv(&order.symbol, self.timeframe, self.cfg.gap_check_bars)
            })
            .await?;
        let gap = max_consecutive_gap_pct(&bars);
        if gap > self.cfg.max_gap_pct {
            return Err(ExecError::GapExceeded {
                observed: gap,
                limit: self.cfg.max_gap_pct,
            });
        }

        // Spread check.
        let quote = self.current_price(&order.symbol).await?;
        let spread = quote.spread_ratio().unwrap_or(f64::INFINITY);
        if spread > self.cfg.max_spread_ratio {
            return Err(ExecError::SpreadTooWide {
                observed: spread,
                limit: self.cfg.max_spread_ratio,
            });
        }

        // Submit.
        let fill = self
            .call(|| {
                self.client
                    .place_market_order(&order.symbol, order.side, order.quantity)
            })
            .await?;

        // Post-fill slippage. Logged, never fatal.
        let fill_price = if fill.price > 0.0 {
            fill.price
        } else {
            order.entry_price
        };
        let slippage = (fill_price - order.entry_price).abs() / order.entry_price;
        if slippage > self.cfg.slippage_warn_ratio {
            warn!(
                symbol = %order.symbol,
                requested = order.entry_price,
                executed = fill_price,
                slippage,
                "excessive slippage on fill"
            );
        } else {
            debug!(symbol = %order.symbol, slippage, "fill slippage");
        }

        let position = PositionStore::build_position(
            &order.symbol,
            order.side,
            fill_price,
            fill.quantity,
            order.stop_loss,
            order.take_profit,
            order.trailing_stop_fraction,
            order.atr_at_entry,
            order.confidence,
            order.strategy_tag.clone(),
            order.parent_id.clone(),
        );

        self.store.insert(position.clone())?;

        if let Err(e) = self.journal.record_open(&position) {
            warn!(error = %e, id = %position.id, "failed to journal open record");
        }

        info!(
            id = %position.id,
            symbol = %order.symbol,
            side = %order.side,
            fill_price,
            quantity = fill.quantity,
            "order executed and position recorded"
        );

        Ok(position)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close an open position with a market order. At most one close per
    /// position is in flight; losers of the flag race get
    /// `CloseAlreadyPending`.
    pub async fn close(&self, position_id: &str, reason: ExitReason) -> Result<Position, ExecError> {
        let position = self
            .store
            .get(position_id)
            .ok_or_else(|| ExecError::PositionNotFound(position_id.to_string()))?;

        if !self.store.try_begin_close(position_id) {
            return Err(ExecError::CloseAlreadyPending(position_id.to_string()));
        }

        let result = self
            .call(|| {
                self.client.place_market_order(
                    &position.symbol,
                    position.side.opposite(),
                    position.quantity,
                )
            })
            .await;

        let fill = match result {
            Ok(fill) => fill,
            Err(e) => {
                // Release the flag so the next monitor pass can retry.
                self.store.clear_pending_close(position_id);
                return Err(e);
            }
        };

        let exit_price = if fill.price > 0.0 {
            fill.price
        } else {
            position.current_price
        };

        let closed = self
            .store
            .mark_closed(position_id, exit_price, reason)
            .ok_or_else(|| ExecError::PositionNotFound(position_id.to_string()))?;

        self.risk.record_trade_result(closed.realized_pnl);
        if let Err(e) = self.journal.record_close(&closed) {
            warn!(error = %e, id = %closed.id, "failed to journal close record");
        }

        Ok(closed)
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Synchronize the local store with exchange-reported positions. The
    /// exchange is the source of truth:
    ///
    ///   remote-only -> adopted with conservative defaults
    ///   local-only  -> marked externally closed at last known price
    ///   both        -> quantity and mark price refreshed from remote
    ///
    /// Running twice with no market changes is a no-op the second time.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ExecError> {
        let remote = self.fetch_open_positions().await?;
        let mut report = ReconcileReport::default();

        let local_open = self.store.iter_open();

        // Local positions that vanished from the exchange.
        for position in &local_open {
            let remote_match = remote
                .iter()
                .any(|r| r.symbol == position.symbol && r.side == position.side);
            if !remote_match {
                let last_price = if position.current_price > 0.0 {
                    position.current_price
                } else {
                    position.entry_price
                };
                if let Some(closed) =
                    self.store
                        .mark_closed(&position.id, last_price, ExitReason::ExternallyClosed)
                {
                    warn!(
                        id = %closed.id,
                        symbol = %closed.symbol,
                        realized_pnl = closed.realized_pnl,
                        "position closed externally — reconciled"
                    );
                    self.risk.record_trade_result(closed.realized_pnl);
                    if let Err(e) = self.journal.record_close(&closed) {
                        warn!(error = %e, "failed to journal external close");
                    }
                    report.externally_closed.push(closed.id);
                }
            }
        }

        // Remote positions we are not tracking, and overlaps.
        for r in &remote {
            match self.store.find_by_symbol_side(&r.symbol, r.side) {
                Some(local) => {
                    let updated = self.store.update(&local.id, |p| {
                        p.quantity = r.quantity;
                        p.current_price = r.mark_price;
                        p.unrealized_pnl = p.unrealized_at(r.mark_price);
                    });
                    if updated {
                        report.updated += 1;
                    }
                }
                None => {
                    let adopted = self.adopt_remote(r)?;
                    report.adopted.push(adopted);
                }
            }
        }

        info!(
            adopted = report.adopted.len(),
            externally_closed = report.externally_closed.len(),
            updated = report.updated,
            "reconciliation pass complete"
        );

        Ok(report)
    }

    /// Adopt an exchange position we have no record of, with conservative
    /// defaults: no strategy tag, stop a configured distance from the mark.
    fn adopt_remote(&self, r: &ExchangePosition) -> Result<String, ExecError> {
        let sign = r.side.sign();
        let mark = if r.mark_price > 0.0 {
            r.mark_price
        } else {
            r.entry_price
        };
        let stop_distance = mark * self.cfg.adopted_stop_fraction;
        let stop_loss = mark - sign * stop_distance;
        let take_profit = mark + sign * 2.0 * stop_distance;

        let entry_price = if r.entry_price > 0.0 {
            r.entry_price
        } else {
            mark
        };
        let mut position = PositionStore::build_position(
            &r.symbol,
            r.side,
            entry_price,
            r.quantity,
            stop_loss,
            take_profit,
            self.default_trailing_fraction,
            0.0,
            0.0,
            None,
            None,
        );
        position.current_price = mark;
        position.unrealized_pnl = position.unrealized_at(mark);

        let id = position.id.clone();
        warn!(
            id = %id,
            symbol = %r.symbol,
            side = %r.side,
            quantity = r.quantity,
            stop_loss,
            "adopting untracked exchange position with conservative defaults"
        );

        self.store.insert(position.clone())?;
        if let Err(e) = self.journal.record_open(&position) {
            warn!(error = %e, "failed to journal adopted position");
        }

        Ok(id)
    }
}

/// Largest close-to-open gap between consecutive bars, as a fraction of the
/// earlier close.
fn max_consecutive_gap_pct(bars: &[Bar]) -> f64 {
    bars.windows(2)
        .map(|w| {
            if w[0].close > 0.0 {
                (w[1].open - w[0].close).abs() / w[0].close
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max)
}

impl std::fmt::Debug for OrderExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderExecutor")
            .field("store", &self.store)
            .field("balance_endpoints", &self.balance_endpoints)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::exchange::{Fill, RejectReason, SymbolMeta};
    use crate::types::Side;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    // -----------------------------------------------------------------------
    // Scripted exchange stub
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct StubExchange {
        fill_price: RwLock<f64>,
        bars: RwLock<Vec<Bar>>,
        quote: RwLock<Option<Quote>>,
        positions: RwLock<Vec<ExchangePosition>>,
        margin_balance_fails: RwLock<bool>,
        transport_failures_left: AtomicU32,
        order_calls: AtomicU32,
    }

    impl StubExchange {
        fn with_clean_market(fill_price: f64) -> Self {
            let stub = Self::default();
            *stub.fill_price.write() = fill_price;
            *stub.bars.write() = (0..48)
                .map(|i| Bar {
                    timestamp: i * 60_000,
                    open: 30_000.0,
                    high: 30_050.0,
                    low: 29_950.0,
                    close: 30_000.0,
                    volume: 10.0,
                })
                .collect();
            *stub.quote.write() = Some(Quote {
                symbol: "BTCUSDT".into(),
                bid: 29_999.0,
                ask: 30_001.0,
                last: 30_000.0,
                as_of: 0,
            });
            stub
        }
    }

    #[async_trait]
    impl ExchangeClient for StubExchange {
        async fn place_market_order(
            &self,
            symbol: &str,
            side: Side,
            quantity: f64,
        ) -> Result<Fill, ExchangeError> {
            self.order_calls.fetch_add(1, Ordering::SeqCst);
            if self.transport_failures_left.load(Ordering::SeqCst) > 0 {
                self.transport_failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ExchangeError::Transport("connection reset".into()));
            }
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
            unimplemented!("not used")
        }

        async fn cancel_order(&self, _: &str, _: &str) -> Result<(), ExchangeError> {
            Ok(())
        }

        async fn fetch_balance(
            &self,
            endpoint: BalanceEndpoint,
        ) -> Result<AccountSnapshot, ExchangeError> {
            if endpoint == BalanceEndpoint::Margin && *self.margin_balance_fails.read() {
                return Err(ExchangeError::Rejected {
                    code: -2015,
                    reason: RejectReason::Unknown,
                });
            }
            Ok(AccountSnapshot {
                free_quote_balance: 10_000.0,
                total_quote_balance: 10_000.0,
                as_of: Utc::now(),
            })
        }

        async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(self.positions.read().clone())
        }

        async fn fetch_ohlcv(
            &self,
            _: &str,
            _: Timeframe,
            _: usize,
        ) -> Result<Vec<Bar>, ExchangeError> {
            Ok(self.bars.read().clone())
        }

        async fn fetch_ticker(&self, _: &str) -> Result<Quote, ExchangeError> {
            Ok(self.quote.read().clone().expect("quote scripted"))
        }

        async fn symbol_meta(&self, _: &str) -> Result<SymbolMeta, ExchangeError> {
            Ok(SymbolMeta {
                lot_step: 0.001,
                min_notional: 10.0,
                price_tick: 0.1,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Harness
    // -----------------------------------------------------------------------

    struct Harness {
        executor: OrderExecutor,
        store: Arc<PositionStore>,
        journal: Arc<TradeJournal>,
        stub: Arc<StubExchange>,
        _dir: tempfile::TempDir,
    }

    fn harness(stub: StubExchange) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(stub);
        let store = Arc::new(PositionStore::new(false));
        let risk = Arc::new(RiskEngine::new(&RiskConfig::default(), 10_000.0));
        let journal = Arc::new(TradeJournal::new(
            dir.path().join("trades.jsonl"),
            dir.path().join("positions.json"),
            dir.path().join("session.json"),
        ));
        let cfg = ExchangeConfig {
            max_retries: 0,
            ..ExchangeConfig::default()
        };
        let executor = OrderExecutor::new(
            stub.clone() as Arc<dyn ExchangeClient>,
            store.clone(),
            risk,
            journal.clone(),
            cfg,
            Timeframe::H4,
            0.65,
        );
        Harness {
            executor,
            store,
            journal,
            stub,
            _dir: dir,
        }
    }

    fn sized_order() -> SizedOrder {
        SizedOrder {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 0.444,
            entry_price: 30_000.0,
            stop_loss: 29_550.0,
            take_profit: 31_125.0,
            trailing_stop_fraction: 0.65,
            risk_amount: 199.8,
            atr_at_entry: 300.0,
            confidence: 0.6,
            strategy_tag: Some("heikin-ashi".into()),
            parent_id: None,
        }
    }

    // -----------------------------------------------------------------------
    // Open
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn open_creates_position_and_journals() {
        let h = harness(StubExchange::with_clean_market(30_010.0));
        let position = h.executor.open(&sized_order()).await.unwrap();

        // Entry price follows the fill, not the request.
        assert_eq!(position.entry_price, 30_010.0);
        assert_eq!(position.side, Side::Long);
        assert_eq!(h.store.open_count(), 1);

        let records = h.journal.read_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "open");
        assert_eq!(records[0].id, position.id);
    }

    #[tokio::test]
    async fn open_rejected_on_gap() {
        let stub = StubExchange::with_clean_market(30_000.0);
        {
            let mut bars = stub.bars.write();
            // 10% overnight gap in the middle of the window.
            let len = bars.len();
            bars[len - 10].open = 33_000.0;
            bars[len - 10].high = 33_100.0;
            bars[len - 10].close = 33_000.0;
            bars[len - 10].low = 32_900.0;
        }
        let h = harness(stub);

        let err = h.executor.open(&sized_order()).await.unwrap_err();
        assert!(matches!(err, ExecError::GapExceeded { .. }));
        assert_eq!(h.store.open_count(), 0);
        // The order never reached the exchange.
        assert_eq!(h.stub.order_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_rejected_on_wide_spread() {
        let stub = StubExchange::with_clean_market(30_000.0);
        *stub.quote.write() = Some(Quote {
            symbol: "BTCUSDT".into(),
            bid: 29_000.0,
            ask: 31_000.0,
            last: 30_000.0,
            as_of: 0,
        });
        let h = harness(stub);

        let err = h.executor.open(&sized_order()).await.unwrap_err();
        assert!(matches!(err, ExecError::SpreadTooWide { .. }));
    }

    #[tokio::test]
    async fn open_retries_exhausted_surfaces_transport_error() {
        let stub = StubExchange::with_clean_market(30_000.0);
        stub.transport_failures_left.store(10, Ordering::SeqCst);
        let h = harness(stub);

        let err = h.executor.open(&sized_order()).await.unwrap_err();
        assert!(matches!(err, ExecError::RetriesExhausted { .. }));
        assert_eq!(h.store.open_count(), 0);
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn close_computes_pnl_and_journals() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let position = h.executor.open(&sized_order()).await.unwrap();

        *h.stub.fill_price.write() = 31_125.0;
        let closed = h
            .executor
            .close(&position.id, ExitReason::TakeProfit)
            .await
            .unwrap();

        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        let expected = (31_125.0 - 30_000.0) * 0.444;
        assert!((closed.realized_pnl - expected).abs() < 1e-6);
        assert_eq!(h.store.open_count(), 0);

        let records = h.journal.read_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event, "close");
    }

    #[tokio::test]
    async fn close_is_single_flight() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let position = h.executor.open(&sized_order()).await.unwrap();

        // Another task already holds the pending-close flag.
        assert!(h.store.try_begin_close(&position.id));

        let err = h
            .executor
            .close(&position.id, ExitReason::StopLoss)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::CloseAlreadyPending(_)));
    }

    #[tokio::test]
    async fn failed_close_releases_flag_for_retry() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let position = h.executor.open(&sized_order()).await.unwrap();

        h.stub.transport_failures_left.store(10, Ordering::SeqCst);
        let err = h
            .executor
            .close(&position.id, ExitReason::StopLoss)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::RetriesExhausted { .. }));

        // Flag released: the retry path is open again.
        h.stub.transport_failures_left.store(0, Ordering::SeqCst);
        assert!(h
            .executor
            .close(&position.id, ExitReason::StopLoss)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn close_unknown_position() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let err = h
            .executor
            .close("missing", ExitReason::StopLoss)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::PositionNotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Balance fallback
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn balance_uses_primary_when_healthy() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let snapshot = h.executor.fetch_balance().await.unwrap();
        assert_eq!(snapshot.total_quote_balance, 10_000.0);
        assert_eq!(h.executor.last_good_endpoint(), BalanceEndpoint::Margin);
    }

    #[tokio::test]
    async fn balance_falls_back_to_spot() {
        let stub = StubExchange::with_clean_market(30_000.0);
        *stub.margin_balance_fails.write() = true;
        let h = harness(stub);

        let snapshot = h.executor.fetch_balance().await.unwrap();
        assert_eq!(snapshot.free_quote_balance, 10_000.0);
        // The fallback endpoint answered and was recorded.
        assert_eq!(h.executor.last_good_endpoint(), BalanceEndpoint::Spot);
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn s5_externally_filled_position_reconciles_closed() {
        let h = harness(StubExchange::with_clean_market(30_000.0));
        let position = h.executor.open(&sized_order()).await.unwrap();

        // While "offline" the exchange filled the TP; remote set is empty.
        h.store.update(&position.id, |p| {
            p.current_price = 31_125.0;
            p.unrealized_pnl = p.unrealized_at(31_125.0);
        });

        let report = h.executor.reconcile().await.unwrap();
        assert_eq!(report.externally_closed, vec![position.id.clone()]);
        assert_eq!(h.store.open_count(), 0);

        let closed = &h.store.closed_recent(1)[0];
        assert_eq!(closed.exit_reason, Some(ExitReason::ExternallyClosed));
        // pnl computed from the last known price
        let expected = (31_125.0 - 30_000.0) * 0.444;
        assert!((closed.realized_pnl - expected).abs() < 1e-6);
    }

    #[tokio::test]
    async fn reconcile_adopts_untracked_remote_position() {
        let stub = StubExchange::with_clean_market(30_000.0);
        *stub.positions.write() = vec![ExchangePosition {
            id: "ETHUSDT:LONG".into(),
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            quantity: 2.0,
            entry_price: 2_000.0,
            mark_price: 2_040.0,
        }];
        let h = harness(stub);

        let report = h.executor.reconcile().await.unwrap();
        assert_eq!(report.adopted.len(), 1);

        let adopted = h.store.find_by_symbol_side("ETHUSDT", Side::Long).unwrap();
        assert!(adopted.strategy_tag.is_none());
        // stop 5% below the mark for a long
        assert!((adopted.stop_loss - 2_040.0 * 0.95).abs() < 1e-6);
        assert_eq!(adopted.quantity, 2.0);
    }

    #[tokio::test]
    async fn reconcile_updates_overlap_from_remote() {
        let stub = StubExchange::with_clean_market(30_000.0);
        let h = harness(stub);
        let position = h.executor.open(&sized_order()).await.unwrap();

        *h.stub.positions.write() = vec![ExchangePosition {
            id: "BTCUSDT:LONG".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            quantity: 0.400, // partially reduced on-exchange
            entry_price: 30_000.0,
            mark_price: 30_500.0,
        }];

        let report = h.executor.reconcile().await.unwrap();
        assert_eq!(report.updated, 1);
        assert!(report.externally_closed.is_empty());

        let p = h.store.get(&position.id).unwrap();
        assert_eq!(p.quantity, 0.400);
        assert_eq!(p.current_price, 30_500.0);
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let stub = StubExchange::with_clean_market(30_000.0);
        *stub.positions.write() = vec![ExchangePosition {
            id: "ETHUSDT:LONG".into(),
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            quantity: 2.0,
            entry_price: 2_000.0,
            mark_price: 2_040.0,
        }];
        let h = harness(stub);

        let first = h.executor.reconcile().await.unwrap();
        assert_eq!(first.adopted.len(), 1);

        let second = h.executor.reconcile().await.unwrap();
        assert!(second.adopted.is_empty());
        assert!(second.externally_closed.is_empty());
        // The overlap refresh touches the same position but changes nothing.
        assert_eq!(h.store.open_count(), 1);
    }

    // -----------------------------------------------------------------------
    // Gap math
    // -----------------------------------------------------------------------

    #[test]
    fn gap_pct_finds_largest_gap() {
        let mut bars: Vec<Bar> = (0..5)
            .map(|i| Bar {
                timestamp: i * 60_000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 1.0,
            })
            .collect();
        bars[3].open = 104.0;
        bars[3].high = 105.0;
        bars[3].close = 104.0;

        let gap = max_consecutive_gap_pct(&bars);
        assert!((gap - 0.04).abs() < 1e-9);
    }

    #[test]
    fn gap_pct_empty_and_single() {
        assert_eq!(max_consecutive_gap_pct(&[]), 0.0);
    }
}
