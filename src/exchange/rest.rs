// =============================================================================
// REST Exchange Client — HMAC-SHA256 signed requests
// =============================================================================
//
// Targets the Binance USDT-margined API. Orders, positions, and the margin
// wallet live on the derivatives host; the spot wallet (the balance fallback
// endpoint) lives on the spot host. Sandbox mode routes both to the public
// testnets.
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift against the exchange.
// =============================================================================

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::exchange::client::{
    normalize_reject_code, BalanceEndpoint, ExchangeClient, ExchangeError, ExchangePosition,
    Fill, SymbolMeta,
};
use crate::types::{AccountSnapshot, Bar, Quote, Side, Timeframe};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;

/// REST client with HMAC-SHA256 request signing.
pub struct RestExchangeClient {
    secret: String,
    /// Derivatives host: orders, positions, margin wallet.
    base_url: String,
    /// Spot host: the fallback wallet endpoint.
    spot_url: String,
    quote_asset: String,
    client: reqwest::Client,
}

impl RestExchangeClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new client.
    ///
    /// # Arguments
    /// * `api_key`     — sent as a header, never in query params.
    /// * `secret`      — used exclusively for HMAC signing.
    /// * `sandbox`     — route to the exchange testnets.
    /// * `quote_asset` — balance queries report this asset (e.g. "USDT").
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        sandbox: bool,
        quote_asset: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let (base_url, spot_url) = if sandbox {
            (
                "https://testnet.binancefuture.com".to_string(),
                "https://testnet.binance.vision".to_string(),
            )
        } else {
            (
                "https://fapi.binance.com".to_string(),
                "https://api.binance.com".to_string(),
            )
        };

        debug!(sandbox, base_url = %base_url, "RestExchangeClient initialised");

        Self {
            secret: secret.into(),
            base_url,
            spot_url,
            quote_asset: quote_asset.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 hex signature of `query`.
    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Full query string for a signed request (appends timestamp, recvWindow,
    /// and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Transport helpers
    // -------------------------------------------------------------------------

    async fn request_json(
        &self,
        method: reqwest::Method,
        url: &str,
    ) -> Result<serde_json::Value, ExchangeError> {
        let resp = self
            .client
            .request(method, url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = resp.status();

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(ExchangeError::RateLimited);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(format!("body decode failed: {e}")))?;

        if !status.is_success() {
            let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            let reason = normalize_reject_code(code);
            warn!(%status, code, %reason, "exchange rejected request");
            return Err(ExchangeError::Rejected { code, reason });
        }

        Ok(body)
    }

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value, field: &str) -> Result<f64, ExchangeError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| ExchangeError::Malformed(format!("field {field}: bad f64 '{s}'")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            Err(ExchangeError::Malformed(format!(
                "field {field}: expected string or number, got {val}"
            )))
        }
    }

    fn fill_from_order_response(
        body: &serde_json::Value,
        symbol: &str,
        side: Side,
        requested_qty: f64,
    ) -> Result<Fill, ExchangeError> {
        let order_id = body
            .get("orderId")
            .and_then(|v| v.as_u64())
            .map(|id| id.to_string())
            .ok_or_else(|| ExchangeError::Malformed("order response missing orderId".into()))?;

        let executed = body
            .get("executedQty")
            .map(|v| Self::parse_str_f64(v, "executedQty"))
            .transpose()?
            .filter(|q| *q > 0.0)
            .unwrap_or(requested_qty);

        // Market fills report avgPrice; fall back to price for limit acks.
        let price = match body.get("avgPrice") {
            Some(v) => Self::parse_str_f64(v, "avgPrice")?,
            None => body
                .get("price")
                .map(|v| Self::parse_str_f64(v, "price"))
                .transpose()?
                .unwrap_or(0.0),
        };

        Ok(Fill {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity: executed,
            price,
            filled_at: Utc::now(),
        })
    }

    fn order_side_param(side: Side) -> &'static str {
        match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ExchangeError {
    if e.is_timeout() {
        ExchangeError::Timeout
    } else {
        ExchangeError::Transport(e.to_string())
    }
}

// -------------------------------------------------------------------------
// Trait implementation
// -------------------------------------------------------------------------

#[async_trait]
impl ExchangeClient for RestExchangeClient {
    async fn place_market_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
    ) -> Result<Fill, ExchangeError> {
        let params = format!(
            "symbol={symbol}&side={}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT",
            Self::order_side_param(side)
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, %side, quantity, "placing market order");
        let body = self.request_json(reqwest::Method::POST, &url).await?;
        let fill = Self::fill_from_order_response(&body, symbol, side, quantity)?;
        debug!(symbol, order_id = %fill.order_id, price = fill.price, "market order filled");
        Ok(fill)
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
    ) -> Result<Fill, ExchangeError> {
        let params = format!(
            "symbol={symbol}&side={}&type=LIMIT&quantity={quantity}&price={price}&timeInForce=GTC",
            Self::order_side_param(side)
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, %side, quantity, price, "placing limit order");
        let body = self.request_json(reqwest::Method::POST, &url).await?;
        Self::fill_from_order_response(&body, symbol, side, quantity)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");
        self.request_json(reqwest::Method::DELETE, &url).await?;
        Ok(())
    }

    async fn fetch_balance(
        &self,
        endpoint: BalanceEndpoint,
    ) -> Result<AccountSnapshot, ExchangeError> {
        match endpoint {
            BalanceEndpoint::Margin => {
                let qs = self.signed_query("");
                let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);
                let body = self.request_json(reqwest::Method::GET, &url).await?;

                let entries = body.as_array().ok_or_else(|| {
                    ExchangeError::Malformed("balance response is not an array".into())
                })?;

                for entry in entries {
                    if entry.get("asset").and_then(|v| v.as_str())
                        == Some(self.quote_asset.as_str())
                    {
                        let free =
                            Self::parse_str_f64(&entry["availableBalance"], "availableBalance")?;
                        let total = Self::parse_str_f64(&entry["balance"], "balance")?;
                        return Ok(AccountSnapshot {
                            free_quote_balance: free,
                            total_quote_balance: total,
                            as_of: Utc::now(),
                        });
                    }
                }

                Err(ExchangeError::Malformed(format!(
                    "asset {} not present in margin balance response",
                    self.quote_asset
                )))
            }
            BalanceEndpoint::Spot => {
                let qs = self.signed_query("");
                let url = format!("{}/api/v3/account?{}", self.spot_url, qs);
                let body = self.request_json(reqwest::Method::GET, &url).await?;

                let balances = body["balances"].as_array().ok_or_else(|| {
                    ExchangeError::Malformed("account response missing 'balances'".into())
                })?;

                for b in balances {
                    if b.get("asset").and_then(|v| v.as_str()) == Some(self.quote_asset.as_str()) {
                        let free = Self::parse_str_f64(&b["free"], "free")?;
                        let locked = Self::parse_str_f64(&b["locked"], "locked")?;
                        return Ok(AccountSnapshot {
                            free_quote_balance: free,
                            total_quote_balance: free + locked,
                            as_of: Utc::now(),
                        });
                    }
                }

                Err(ExchangeError::Malformed(format!(
                    "asset {} not present in spot balance response",
                    self.quote_asset
                )))
            }
        }
    }

    async fn fetch_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);
        let body = self.request_json(reqwest::Method::GET, &url).await?;

        let entries = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("positionRisk is not an array".into()))?;

        let mut positions = Vec::new();
        for entry in entries {
            let amt = Self::parse_str_f64(&entry["positionAmt"], "positionAmt")?;
            if amt == 0.0 {
                continue;
            }
            let symbol = entry["symbol"]
                .as_str()
                .ok_or_else(|| ExchangeError::Malformed("position missing symbol".into()))?
                .to_string();
            let side = if amt > 0.0 { Side::Long } else { Side::Short };

            positions.push(ExchangePosition {
                id: ExchangePosition::composite_id(&symbol, side),
                symbol,
                side,
                quantity: amt.abs(),
                entry_price: Self::parse_str_f64(&entry["entryPrice"], "entryPrice")?,
                mark_price: Self::parse_str_f64(&entry["markPrice"], "markPrice")?,
            });
        }

        debug!(count = positions.len(), "open positions fetched");
        Ok(positions)
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ExchangeError> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol,
            timeframe.as_str(),
            limit
        );
        let body = self.request_json(reqwest::Method::GET, &url).await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("klines response is not an array".into()))?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry
                .as_array()
                .ok_or_else(|| ExchangeError::Malformed("kline entry is not an array".into()))?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed kline entry");
                continue;
            }

            bars.push(Bar {
                timestamp: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1], "open")?,
                high: Self::parse_str_f64(&arr[2], "high")?,
                low: Self::parse_str_f64(&arr[3], "low")?,
                close: Self::parse_str_f64(&arr[4], "close")?,
                volume: Self::parse_str_f64(&arr[5], "volume")?,
            });
        }

        debug!(symbol, interval = %timeframe, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Quote, ExchangeError> {
        let book_url = format!(
            "{}/fapi/v1/ticker/bookTicker?symbol={}",
            self.base_url, symbol
        );
        let book = self.request_json(reqwest::Method::GET, &book_url).await?;
        let bid = Self::parse_str_f64(&book["bidPrice"], "bidPrice")?;
        let ask = Self::parse_str_f64(&book["askPrice"], "askPrice")?;

        let price_url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let ticker = self.request_json(reqwest::Method::GET, &price_url).await?;
        let last = Self::parse_str_f64(&ticker["price"], "price")?;

        Ok(Quote {
            symbol: symbol.to_string(),
            bid,
            ask,
            last,
            as_of: Utc::now().timestamp_millis(),
        })
    }

    async fn symbol_meta(&self, symbol: &str) -> Result<SymbolMeta, ExchangeError> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.request_json(reqwest::Method::GET, &url).await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| {
                ExchangeError::Malformed("symbol not found in exchangeInfo response".into())
            })?;

        let filters = info["filters"]
            .as_array()
            .ok_or_else(|| ExchangeError::Malformed("exchangeInfo missing filters".into()))?;

        let mut lot_step = 0.0;
        let mut min_notional = 0.0;
        let mut price_tick = 0.0;

        for filter in filters {
            match filter.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    lot_step = Self::parse_str_f64(&filter["stepSize"], "stepSize")?;
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = Self::parse_str_f64(&filter["notional"], "notional")?;
                }
                Some("PRICE_FILTER") => {
                    price_tick = Self::parse_str_f64(&filter["tickSize"], "tickSize")?;
                }
                _ => {}
            }
        }

        Ok(SymbolMeta {
            lot_step,
            min_notional,
            price_tick,
        })
    }
}

impl std::fmt::Debug for RestExchangeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestExchangeClient")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("spot_url", &self.spot_url)
            .field("quote_asset", &self.quote_asset)
            .finish()
    }
}
