//! Pluggable broker adapters: common trait, discovery, configuration and factory.

mod alpaca;
pub mod config;
mod demo;
mod error;
mod factory;
mod types;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::warn;

pub use alpaca::AlpacaBrokerAdapter;
pub use config::{adapter_name_for, discover_brokers, BrokerSettings, DiscoveredBroker, Settings};
pub use demo::DemoBrokerAdapter;
pub use error::{BrokerError, BrokerResult};
pub use factory::{ActiveBroker, ActiveBrokerSource, BrokerFactory};
pub use types::*;

/// Common interface every broker adapter implements.
///
/// Adapters are shared as `Arc<dyn BrokerAdapter>` between the trading loop
/// and the REST server, so connection state lives behind interior mutability.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Broker directory name, e.g. `alpaca`.
    fn broker_name(&self) -> &str;

    /// Verify credentials and mark the adapter connected.
    async fn connect(&self) -> BrokerResult<()>;

    async fn disconnect(&self) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;

    // ==================== Orders ====================

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderResponse>;

    /// Returns true when the broker accepted the cancel.
    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool>;

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderResponse>;

    async fn get_orders(
        &self,
        status: Option<&str>,
        limit: usize,
    ) -> BrokerResult<Vec<OrderResponse>>;

    // ==================== Account ====================

    async fn get_account(&self) -> BrokerResult<AccountInfo>;

    async fn get_positions(&self) -> BrokerResult<Vec<Position>>;

    /// `None` when nothing is held in `symbol`.
    async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>>;

    // ==================== Market data ====================

    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote>;

    /// Quotes for several symbols. Symbols that fail are skipped.
    async fn get_quotes(&self, symbols: &[String]) -> BrokerResult<Vec<Quote>> {
        let mut quotes = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.get_quote(symbol).await {
                Ok(quote) => quotes.push(quote),
                Err(e) => warn!(symbol = %symbol, error = %e, "Failed to get quote"),
            }
        }
        Ok(quotes)
    }

    /// Most recent `limit` bars, oldest first.
    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> BrokerResult<Vec<Bar>>;

    async fn is_market_open(&self) -> BrokerResult<bool>;

    async fn get_market_hours(&self, date: NaiveDate) -> BrokerResult<MarketHours>;

    /// Recent news for `symbols`, newest first. Brokers without a news feed
    /// return nothing.
    async fn get_news(&self, _symbols: &[String], _limit: usize) -> BrokerResult<Vec<NewsArticle>> {
        Ok(Vec::new())
    }
}

/// Error returned by data methods on a disconnected adapter.
pub(crate) fn not_connected(broker: &str) -> BrokerError {
    BrokerError::Connection(format!("{} adapter is not connected", broker))
}
