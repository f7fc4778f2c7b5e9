// =============================================================================
// Central Engine State
// =============================================================================
//
// Ties the shared subsystems together for the orchestrator, the monitor, and
// the status API, and provides the serializable snapshot the dashboard
// polls.
//
// Thread safety: atomic counter for version tracking, parking_lot::RwLock
// for mutable collections, Arc wrappers for subsystems with their own
// interior mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::compensation::{CompensationEngine, CompensationLink};
use crate::config::EngineConfig;
use crate::journal::TradeJournal;
use crate::market_data::{FeedHealth, MarketDataFeed};
use crate::risk::{RiskEngine, RiskState};
use crate::store::{Position, PositionStore};
use crate::types::AccountSnapshot;

/// Maximum retained error records.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum retained decision records.
const MAX_RECENT_DECISIONS: usize = 100;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A recorded error event for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Auditable record of one entry decision (taken or skipped).
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub symbol: String,
    /// "open", "skip", or "blocked".
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: String,
}

impl DecisionRecord {
    pub fn open(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: "open".to_string(),
            reason: None,
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn skip(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: "skip".to_string(),
            reason: Some(reason.into()),
            at: Utc::now().to_rfc3339(),
        }
    }

    pub fn blocked(symbol: &str, reason: impl Into<String>) -> Self {
        Self {
            symbol: symbol.to_string(),
            action: "blocked".to_string(),
            reason: Some(reason.into()),
            at: Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

/// Shared state across all engine tasks via `Arc<EngineState>`.
pub struct EngineState {
    /// Monotonically increasing version, bumped on meaningful mutation.
    pub state_version: AtomicU64,

    pub config: Arc<RwLock<EngineConfig>>,
    pub store: Arc<PositionStore>,
    pub risk: Arc<RiskEngine>,
    pub compensation: Arc<CompensationEngine>,
    pub feed: Arc<MarketDataFeed>,
    pub journal: Arc<TradeJournal>,

    /// Last fetched balance, for display only. Sizing always re-fetches.
    pub last_balance: RwLock<Option<AccountSnapshot>>,

    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub recent_decisions: RwLock<Vec<DecisionRecord>>,

    pub last_reconcile_ok: RwLock<Option<std::time::Instant>>,
    pub last_reconcile_error: RwLock<Option<String>>,

    /// Cooperative shutdown flag observed by every background task.
    pub shutdown: Arc<AtomicBool>,

    pub start_time: std::time::Instant,
}

impl EngineState {
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        store: Arc<PositionStore>,
        risk: Arc<RiskEngine>,
        compensation: Arc<CompensationEngine>,
        feed: Arc<MarketDataFeed>,
        journal: Arc<TradeJournal>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            config,
            store,
            risk,
            compensation,
            feed,
            journal,
            last_balance: RwLock::new(None),
            recent_errors: RwLock::new(Vec::new()),
            recent_decisions: RwLock::new(Vec::new()),
            last_reconcile_ok: RwLock::new(None),
            last_reconcile_error: RwLock::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------------
    // Ring buffers
    // -------------------------------------------------------------------------

    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    pub fn push_decision(&self, decision: DecisionRecord) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        self.increment_version();
    }

    // -------------------------------------------------------------------------
    // Snapshot builder
    // -------------------------------------------------------------------------

    /// Full engine snapshot for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.config.read();
        let positions = self.store.iter_open();
        let risk = self.risk.get_state(&positions);

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            trading_mode: config.trading_mode.to_string(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            symbols: config.symbols.clone(),
            positions,
            risk,
            compensation_links: self.compensation.links_snapshot(),
            feed_health: self
                .feed
                .health_status()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            balance: self.last_balance.read().clone(),
            recent_decisions: self.recent_decisions.read().clone(),
            recent_errors: self.recent_errors.read().clone(),
            reconcile_last_ok_age_s: self.last_reconcile_ok.read().map(|t| t.elapsed().as_secs()),
            reconcile_last_error: self.last_reconcile_error.read().clone(),
        }
    }
}

/// Serializable engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub trading_mode: String,
    pub uptime_secs: u64,
    pub symbols: Vec<String>,
    pub positions: Vec<Position>,
    pub risk: RiskState,
    pub compensation_links: Vec<CompensationLink>,
    pub feed_health: HashMap<String, FeedHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<AccountSnapshot>,
    pub recent_decisions: Vec<DecisionRecord>,
    pub recent_errors: Vec<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_last_ok_age_s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconcile_last_error: Option<String>,
}
