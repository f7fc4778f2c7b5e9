// =============================================================================
// Exchange Adapter — trait seam plus the signed REST implementation
// =============================================================================

pub mod client;
pub mod rest;

pub use client::{
    BalanceEndpoint, ExchangeClient, ExchangeError, ExchangePosition, Fill, RejectReason,
    SymbolMeta,
};
pub use rest::RestExchangeClient;
