// =============================================================================
// Engine Configuration — Hot-reloadable settings with atomic save
// =============================================================================
//
// Every tunable parameter of the engine lives here, grouped by subsystem:
// risk, signal, compensation, monitor, exchange, journal. All fields carry
// `#[serde(default)]` so that adding new fields never breaks loading an older
// config file. Persistence uses a tmp + rename pattern so a crash mid-write
// cannot corrupt the file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Timeframe, TradingMode};

/// Default on-disk location of the engine configuration.
pub const DEFAULT_CONFIG_PATH: &str = "meridian_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()]
}

fn default_timeframe() -> Timeframe {
    Timeframe::H4
}

fn default_history_bars() -> usize {
    500
}

fn default_cache_bars() -> usize {
    500
}

// --- risk ---

fn default_risk_per_trade_fraction() -> f64 {
    0.02
}

fn default_max_drawdown_fraction() -> f64 {
    0.15
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_kelly_fraction_cap() -> f64 {
    1.0
}

fn default_kelly_base() -> f64 {
    2.0
}

fn default_min_rr_ratio() -> f64 {
    2.5
}

fn default_max_portfolio_heat() -> f64 {
    0.10
}

fn default_min_stop_pct() -> f64 {
    0.001
}

fn default_max_position_notional_fraction() -> f64 {
    2.0
}

fn default_correlation_decay() -> f64 {
    0.5
}

fn default_correlation_soft_threshold() -> usize {
    2
}

fn default_max_same_class_positions() -> usize {
    3
}

fn default_sizing_tolerance() -> f64 {
    0.05
}

// --- signal ---

fn default_ml_threshold_min() -> f64 {
    0.4
}

fn default_ml_threshold_max() -> f64 {
    0.75
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_atr_stop_multiplier() -> f64 {
    1.5
}

fn default_trailing_stop_fraction() -> f64 {
    0.65
}

fn default_volume_ratio_min() -> f64 {
    0.3
}

fn default_atr_ratio_cap() -> f64 {
    0.5
}

fn default_liquidity_floor_ratio() -> f64 {
    0.1
}

fn default_ema_fast_period() -> usize {
    9
}

fn default_ema_slow_period() -> usize {
    21
}

fn default_rsi_period() -> usize {
    14
}

fn default_atr_period() -> usize {
    14
}

fn default_volume_sma_period() -> usize {
    20
}

// --- compensation ---

fn default_compensation_threshold_fraction() -> f64 {
    0.03
}

fn default_compensation_size_fraction() -> f64 {
    0.5
}

fn default_compensation_rr_multiplier() -> f64 {
    1.5
}

fn default_compensation_max_hedges() -> usize {
    1
}

fn default_compensation_offset_epsilon() -> f64 {
    1e-6
}

// --- monitor ---

fn default_monitor_interval_seconds() -> u64 {
    60
}

fn default_settle_delay_ms() -> u64 {
    2_000
}

// --- exchange ---

fn default_default_type() -> String {
    "margin".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_leverage() -> f64 {
    3.0
}

fn default_request_deadline_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    1
}

fn default_backoff_cap_secs() -> u64 {
    60
}

fn default_max_gap_pct() -> f64 {
    0.08
}

fn default_max_spread_ratio() -> f64 {
    0.01
}

fn default_slippage_warn_ratio() -> f64 {
    0.005
}

fn default_gap_check_bars() -> usize {
    48
}

fn default_adopted_stop_fraction() -> f64 {
    0.05
}

// --- journal ---

fn default_trade_log_path() -> String {
    "meridian_trades.jsonl".to_string()
}

fn default_snapshot_path() -> String {
    "meridian_positions.json".to_string()
}

fn default_session_result_path() -> String {
    "meridian_session.json".to_string()
}

// =============================================================================
// Subsystem configs
// =============================================================================

/// Risk limits applied by the sizer, the risk engine, and the orchestrator's
/// pre-trade gates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of free balance put at risk per trade (distance to stop).
    #[serde(default = "default_risk_per_trade_fraction")]
    pub risk_per_trade_fraction: f64,

    /// Peak-to-trough equity decline that trips the drawdown breaker.
    #[serde(default = "default_max_drawdown_fraction")]
    pub max_drawdown_fraction: f64,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,

    /// Upper bound on the Kelly-style confidence scaling factor.
    #[serde(default = "default_kelly_fraction_cap")]
    pub kelly_fraction_cap: f64,

    /// Multiplier applied to scorer confidence before the Kelly cap.
    #[serde(default = "default_kelly_base")]
    pub kelly_base: f64,

    /// Minimum take-profit distance as a multiple of stop distance.
    #[serde(default = "default_min_rr_ratio")]
    pub min_rr_ratio: f64,

    /// Cap on the sum of at-risk amounts across open positions, as a
    /// fraction of total equity.
    #[serde(default = "default_max_portfolio_heat")]
    pub max_portfolio_heat: f64,

    /// Stops tighter than this fraction of entry price are rejected.
    #[serde(default = "default_min_stop_pct")]
    pub min_stop_pct: f64,

    /// Per-position notional cap as a fraction of total equity. May exceed
    /// 1.0 on leveraged accounts.
    #[serde(default = "default_max_position_notional_fraction")]
    pub max_position_notional_fraction: f64,

    /// Quantity multiplier applied once `correlation_soft_threshold` open
    /// positions exist in the same asset class.
    #[serde(default = "default_correlation_decay")]
    pub correlation_decay: f64,

    #[serde(default = "default_correlation_soft_threshold")]
    pub correlation_soft_threshold: usize,

    /// Hard cap on open positions per asset class.
    #[serde(default = "default_max_same_class_positions")]
    pub max_same_class_positions: usize,

    /// Slack allowed on the sizing invariant `qty * stop_distance <=
    /// risk_amount * (1 + tolerance)` after lot-step snapping.
    #[serde(default = "default_sizing_tolerance")]
    pub sizing_tolerance: f64,

    /// Allow more than one open position per (symbol, side).
    #[serde(default)]
    pub allow_pyramiding: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Signal-generation thresholds and feature periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Scorer confidence below this never produces an entry.
    #[serde(default = "default_ml_threshold_min")]
    pub ml_threshold_min: f64,

    /// Scorer confidence above this is treated as overfit-suspicious and
    /// rejected as well.
    #[serde(default = "default_ml_threshold_max")]
    pub ml_threshold_max: f64,

    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,

    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,

    /// Stop distance in ATR multiples.
    #[serde(default = "default_atr_stop_multiplier")]
    pub atr_stop_multiplier: f64,

    /// Fraction of accumulated profit locked in by the trailing stop.
    #[serde(default = "default_trailing_stop_fraction")]
    pub trailing_stop_fraction: f64,

    /// Entry requires `volume >= volume_sma * volume_ratio_min`.
    #[serde(default = "default_volume_ratio_min")]
    pub volume_ratio_min: f64,

    /// Entries are rejected while `atr / close >= atr_ratio_cap`.
    #[serde(default = "default_atr_ratio_cap")]
    pub atr_ratio_cap: f64,

    /// Open positions are closed when volume collapses below
    /// `volume_sma * liquidity_floor_ratio`.
    #[serde(default = "default_liquidity_floor_ratio")]
    pub liquidity_floor_ratio: f64,

    /// Bars since entry after which a position is force-closed. 0 disables.
    #[serde(default)]
    pub time_exit_bars: u64,

    #[serde(default = "default_ema_fast_period")]
    pub ema_fast_period: usize,

    #[serde(default = "default_ema_slow_period")]
    pub ema_slow_period: usize,

    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    #[serde(default = "default_volume_sma_period")]
    pub volume_sma_period: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Loss-compensation (hedging) parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Unrealized loss as a fraction of entry notional that triggers a hedge.
    #[serde(default = "default_compensation_threshold_fraction")]
    pub threshold_fraction: f64,

    /// Hedge quantity as a fraction of the parent's quantity.
    #[serde(default = "default_compensation_size_fraction")]
    pub size_fraction_of_parent: f64,

    /// Hedge stop distance as a multiple of the parent's stop distance.
    #[serde(default = "default_compensation_rr_multiplier")]
    pub rr_multiplier: f64,

    /// Global cap on concurrently open hedge children.
    #[serde(default = "default_compensation_max_hedges")]
    pub max_hedges: usize,

    /// Combined parent+child pnl above `-offset_epsilon` resolves the pair.
    #[serde(default = "default_compensation_offset_epsilon")]
    pub offset_epsilon: f64,
}

impl Default for CompensationConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Position-monitor cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval_seconds")]
    pub interval_seconds: u64,

    /// Pause after each close so the exchange can propagate state before the
    /// next evaluation.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Exchange adapter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Route all requests to the exchange testnet.
    #[serde(default = "default_true")]
    pub sandbox: bool,

    /// Primary balance endpoint: "margin" or "spot". The other becomes the
    /// fallback.
    #[serde(default = "default_default_type")]
    pub default_type: String,

    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,

    /// Account leverage used to derive required margin from notional.
    #[serde(default = "default_leverage")]
    pub leverage: f64,

    /// Hard deadline per exchange call, in seconds.
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,

    /// Orders are rejected when the max consecutive-bar gap over the recent
    /// window exceeds this fraction.
    #[serde(default = "default_max_gap_pct")]
    pub max_gap_pct: f64,

    #[serde(default = "default_gap_check_bars")]
    pub gap_check_bars: usize,

    /// Orders are rejected when (ask - bid) / mid exceeds this ratio.
    #[serde(default = "default_max_spread_ratio")]
    pub max_spread_ratio: f64,

    /// Fill slippage above this ratio is logged at warn level (never fatal).
    #[serde(default = "default_slippage_warn_ratio")]
    pub slippage_warn_ratio: f64,

    /// Stop distance (fraction of price) given to positions adopted during
    /// reconciliation, which arrive without risk parameters.
    #[serde(default = "default_adopted_stop_fraction")]
    pub adopted_stop_fraction: f64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

/// Paths of the persisted artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_trade_log_path")]
    pub trade_log_path: String,

    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    #[serde(default = "default_session_result_path")]
    pub session_result_path: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Current trading mode: Live, Paused, or Killed.
    #[serde(default)]
    pub trading_mode: TradingMode,

    /// Symbols the engine watches and trades.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Bar interval driving signal evaluation.
    #[serde(default = "default_timeframe")]
    pub timeframe: Timeframe,

    /// Bars loaded from history before the first evaluation.
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,

    /// Per-subscription ring capacity of the market data cache.
    #[serde(default = "default_cache_bars")]
    pub cache_bars: usize,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub signal: SignalConfig,

    #[serde(default)]
    pub compensation: CompensationConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub journal: JournalConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// Returns an error when the file is missing or malformed so the caller
    /// can fall back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            timeframe = %config.timeframe,
            trading_mode = %config.trading_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` atomically (write to a
    /// `.tmp` sibling, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }
}
