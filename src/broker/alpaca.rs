//! Alpaca REST adapter for trading and market data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::BrokerSettings;
use super::error::{BrokerError, BrokerResult};
use super::types::*;
use super::{not_connected, BrokerAdapter};

const BROKER_NAME: &str = "alpaca";
const PAPER_URL: &str = "https://paper-api.alpaca.markets";
const LIVE_URL: &str = "https://api.alpaca.markets";
const DATA_URL: &str = "https://data.alpaca.markets";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Alpaca Markets adapter.
pub struct AlpacaBrokerAdapter {
    client: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    data_url: String,
    connected: AtomicBool,
}

impl AlpacaBrokerAdapter {
    /// Create from resolved broker settings.
    pub fn new(settings: &BrokerSettings) -> BrokerResult<Self> {
        let api_key = settings.api_key().ok_or_else(|| BrokerError::MissingConfigField {
            broker: BROKER_NAME.to_string(),
            field: "alpaca_api_key".to_string(),
        })?;
        let secret_key = settings.secret_key().ok_or_else(|| BrokerError::MissingConfigField {
            broker: BROKER_NAME.to_string(),
            field: "alpaca_secret_key".to_string(),
        })?;

        let paper = settings.get_bool("paper_trading").unwrap_or(true);
        let base_url = settings
            .get_str("base_url")
            .map(str::to_string)
            .unwrap_or_else(|| if paper { PAPER_URL } else { LIVE_URL }.to_string());
        let data_url = settings
            .get_str("data_url")
            .unwrap_or(DATA_URL)
            .to_string();
        let timeout = settings
            .get_f64("timeout")
            .filter(|t| *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_TIMEOUT);

        info!(base_url = %base_url, paper = paper, "Configured Alpaca adapter");
        Self::build(api_key, secret_key, base_url, data_url, timeout)
    }

    /// Create with explicit endpoints (for testing).
    pub fn with_urls(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        base_url: impl Into<String>,
        data_url: impl Into<String>,
    ) -> BrokerResult<Self> {
        Self::build(
            api_key.into(),
            secret_key.into(),
            base_url.into(),
            data_url.into(),
            DEFAULT_TIMEOUT,
        )
    }

    fn build(
        api_key: String,
        secret_key: String,
        base_url: String,
        data_url: String,
        timeout: Duration,
    ) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            secret_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            data_url: data_url.trim_end_matches('/').to_string(),
            connected: AtomicBool::new(false),
        })
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(not_connected(BROKER_NAME))
        }
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
    }

    async fn send(&self, request: RequestBuilder, what: &str, order_call: bool) -> BrokerResult<Response> {
        let response = self.authed(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_error_status(status, &body, what, order_call))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> BrokerResult<T> {
        debug!(url = %url, "Fetching {}", what);
        let response = self.send(self.client.get(url), what, false).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Data(format!("Failed to parse {} response: {}", what, e)))
    }
}

/// Map a failed HTTP status onto the broker error taxonomy.
fn map_error_status(status: StatusCode, body: &str, what: &str, order_call: bool) -> BrokerError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            BrokerError::Authentication(format!("{} request failed: {} - {}", what, status, body))
        }
        StatusCode::UNPROCESSABLE_ENTITY if order_call => {
            BrokerError::Order(format!("Order rejected: {}", body))
        }
        _ => BrokerError::Data(format!("{} request failed: {} - {}", what, status, body)),
    }
}

// ==================== Wire types ====================

#[derive(Debug, Serialize)]
struct OrderBody<'a> {
    symbol: &'a str,
    qty: String,
    side: &'static str,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
    extended_hours: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trail_price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_order_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    take_profit: Option<TakeProfitLeg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_loss: Option<StopLossLeg>,
}

#[derive(Debug, Serialize)]
struct TakeProfitLeg {
    limit_price: String,
}

#[derive(Debug, Serialize)]
struct StopLossLeg {
    stop_price: String,
}

impl<'a> OrderBody<'a> {
    fn from_request(order: &'a OrderRequest) -> Self {
        let bracket = order.take_profit.zip(order.stop_loss);
        let price = |p: Decimal| p.round_dp(2).to_string();
        // Trailing stops carry the trail amount in stop_price
        let (stop_price, trail_price) = match order.order_type {
            OrderType::TrailingStop => (None, order.stop_price.map(price)),
            _ => (order.stop_price.map(price), None),
        };

        Self {
            symbol: &order.symbol,
            qty: order.quantity.normalize().to_string(),
            side: order.side.as_str(),
            order_type: order.order_type.as_str(),
            time_in_force: order.time_in_force.as_str(),
            extended_hours: order.extended_hours,
            limit_price: order.limit_price.map(price),
            stop_price,
            trail_price,
            client_order_id: order.client_order_id.as_deref(),
            order_class: bracket.map(|_| "bracket"),
            take_profit: bracket.map(|(tp, _)| TakeProfitLeg { limit_price: price(tp) }),
            stop_loss: bracket.map(|(_, sl)| StopLossLeg { stop_price: price(sl) }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaOrder {
    id: String,
    client_order_id: Option<String>,
    symbol: String,
    #[serde(default)]
    qty: Option<Decimal>,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: OrderType,
    status: OrderStatus,
    #[serde(default)]
    filled_qty: Option<Decimal>,
    filled_avg_price: Option<Decimal>,
    limit_price: Option<Decimal>,
    created_at: DateTime<Utc>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<AlpacaOrder> for OrderResponse {
    fn from(o: AlpacaOrder) -> Self {
        Self {
            order_id: o.id,
            client_order_id: o.client_order_id,
            symbol: o.symbol,
            quantity: o.qty.unwrap_or_default(),
            side: o.side,
            order_type: o.order_type,
            status: o.status,
            filled_quantity: o.filled_qty.unwrap_or_default(),
            filled_avg_price: o.filled_avg_price,
            limit_price: o.limit_price,
            created_at: o.created_at,
            updated_at: o.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaAccount {
    id: String,
    buying_power: Decimal,
    cash: Decimal,
    portfolio_value: Decimal,
    equity: Decimal,
    #[serde(default)]
    daytrading_buying_power: Decimal,
    #[serde(default)]
    pattern_day_trader: bool,
    #[serde(default)]
    daytrade_count: i64,
    status: String,
    #[serde(default = "default_currency")]
    currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Deserialize)]
struct AlpacaPosition {
    symbol: String,
    qty: Decimal,
    side: PositionSide,
    avg_entry_price: Decimal,
    #[serde(default)]
    current_price: Option<Decimal>,
    #[serde(default)]
    market_value: Option<Decimal>,
    #[serde(default)]
    cost_basis: Option<Decimal>,
    #[serde(default)]
    unrealized_pl: Option<Decimal>,
    #[serde(default)]
    unrealized_plpc: Option<Decimal>,
}

impl From<AlpacaPosition> for Position {
    fn from(p: AlpacaPosition) -> Self {
        let quantity = match p.side {
            PositionSide::Short if p.qty > Decimal::ZERO => -p.qty,
            _ => p.qty,
        };
        let current = p.current_price.unwrap_or(p.avg_entry_price);
        let mut position = Position::new(p.symbol, quantity, p.avg_entry_price, current);
        // Prefer broker-reported figures when present
        if let Some(v) = p.market_value {
            position.market_value = v;
        }
        if let Some(v) = p.cost_basis {
            position.cost_basis = v;
        }
        if let Some(v) = p.unrealized_pl {
            position.unrealized_pl = v;
        }
        if let Some(v) = p.unrealized_plpc {
            position.unrealized_pl_percent = v;
        }
        position
    }
}

#[derive(Debug, Deserialize)]
struct AlpacaClock {
    is_open: bool,
}

#[derive(Debug, Deserialize)]
struct AlpacaCalendarDay {
    date: NaiveDate,
    open: String,
    close: String,
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<AlpacaBar>>,
}

#[derive(Debug, Deserialize)]
struct AlpacaBar {
    t: DateTime<Utc>,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: i64,
    #[serde(default)]
    vw: Option<Decimal>,
    #[serde(default)]
    n: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LatestQuoteResponse {
    quote: AlpacaQuote,
}

#[derive(Debug, Deserialize)]
struct AlpacaQuote {
    t: DateTime<Utc>,
    #[serde(default)]
    ap: Decimal,
    #[serde(default, rename = "as")]
    ask_size: i64,
    #[serde(default)]
    bp: Decimal,
    #[serde(default)]
    bs: i64,
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    news: Vec<AlpacaNews>,
}

#[derive(Debug, Deserialize)]
struct AlpacaNews {
    id: i64,
    headline: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    symbols: Vec<String>,
    created_at: DateTime<Utc>,
}

impl From<AlpacaNews> for NewsArticle {
    fn from(n: AlpacaNews) -> Self {
        NewsArticle {
            id: n.id.to_string(),
            headline: n.headline,
            summary: n.summary,
            source: n.source,
            url: n.url.filter(|u| !u.is_empty()),
            symbols: n.symbols,
            created_at: n.created_at,
        }
    }
}

/// Page size cap of the news endpoint.
const MAX_NEWS_LIMIT: usize = 50;

// ==================== Adapter ====================

#[async_trait]
impl BrokerAdapter for AlpacaBrokerAdapter {
    fn broker_name(&self) -> &str {
        BROKER_NAME
    }

    async fn connect(&self) -> BrokerResult<()> {
        let url = format!("{}/v2/account", self.base_url);
        let response = self.send(self.client.get(&url), "Account", false).await?;
        let account: AlpacaAccount = response
            .json()
            .await
            .map_err(|e| BrokerError::Data(format!("Failed to parse account response: {}", e)))?;

        self.connected.store(true, Ordering::SeqCst);
        info!(account = %account.id, status = %account.status, "Connected to Alpaca");
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from Alpaca");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderResponse> {
        self.ensure_connected()?;
        validate_order(order)?;

        let url = format!("{}/v2/orders", self.base_url);
        let body = OrderBody::from_request(order);
        debug!(symbol = %order.symbol, side = %order.side, qty = %body.qty, "Placing order");

        let response = self
            .send(self.client.post(&url).json(&body), "Order", true)
            .await?;
        let placed: AlpacaOrder = response
            .json()
            .await
            .map_err(|e| BrokerError::Data(format!("Failed to parse order response: {}", e)))?;

        info!(order_id = %placed.id, symbol = %placed.symbol, status = %placed.status, "Order placed");
        Ok(placed.into())
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
        self.ensure_connected()?;
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let response = self.authed(self.client.delete(&url)).send().await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY => {
                warn!(order_id = %order_id, "Order not cancelable");
                Ok(false)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_error_status(status, &body, "Cancel", true))
            }
        }
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderResponse> {
        self.ensure_connected()?;
        let url = format!("{}/v2/orders/{}", self.base_url, order_id);
        let order: AlpacaOrder = self.get_json(&url, "order").await?;
        Ok(order.into())
    }

    async fn get_orders(&self, status: Option<&str>, limit: usize) -> BrokerResult<Vec<OrderResponse>> {
        self.ensure_connected()?;
        let url = format!(
            "{}/v2/orders?status={}&limit={}",
            self.base_url,
            status.unwrap_or("all"),
            limit.min(500)
        );
        let orders: Vec<AlpacaOrder> = self.get_json(&url, "orders").await?;
        Ok(orders.into_iter().map(OrderResponse::from).collect())
    }

    async fn get_account(&self) -> BrokerResult<AccountInfo> {
        self.ensure_connected()?;
        let url = format!("{}/v2/account", self.base_url);
        let a: AlpacaAccount = self.get_json(&url, "account").await?;
        Ok(AccountInfo {
            account_id: a.id,
            buying_power: a.buying_power,
            cash: a.cash,
            portfolio_value: a.portfolio_value,
            equity: a.equity,
            day_trading_power: a.daytrading_buying_power,
            pattern_day_trader: a.pattern_day_trader,
            day_trade_count: a.daytrade_count,
            status: a.status,
            currency: a.currency,
        })
    }

    async fn get_positions(&self) -> BrokerResult<Vec<Position>> {
        self.ensure_connected()?;
        let url = format!("{}/v2/positions", self.base_url);
        let positions: Vec<AlpacaPosition> = self.get_json(&url, "positions").await?;
        Ok(positions.into_iter().map(Position::from).collect())
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
        self.ensure_connected()?;
        let url = format!("{}/v2/positions/{}", self.base_url, symbol.to_uppercase());
        let response = self.authed(self.client.get(&url)).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let p: AlpacaPosition = response
                    .json()
                    .await
                    .map_err(|e| BrokerError::Data(format!("Failed to parse position response: {}", e)))?;
                Ok(Some(p.into()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(map_error_status(status, &body, "Position", false))
            }
        }
    }

    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        self.ensure_connected()?;
        let symbol = symbol.to_uppercase();
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        let latest: LatestQuoteResponse = self.get_json(&url, "quote").await?;
        let q = latest.quote;
        Ok(Quote {
            symbol,
            bid_price: q.bp,
            ask_price: q.ap,
            bid_size: q.bs,
            ask_size: q.ask_size,
            timestamp: q.t,
        })
    }

    async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> BrokerResult<Vec<Bar>> {
        self.ensure_connected()?;
        let symbol = symbol.to_uppercase();
        // Weekends and holidays need a wider calendar window than `limit` days
        let start = Utc::now() - chrono::Duration::days(limit as i64 * 2 + 10);
        let url = format!(
            "{}/v2/stocks/{}/bars?timeframe={}&limit={}&sort=desc&start={}",
            self.data_url,
            symbol,
            timeframe,
            limit,
            start.format("%Y-%m-%dT%H:%M:%SZ")
        );
        let response: BarsResponse = self.get_json(&url, "bars").await?;

        let mut bars: Vec<Bar> = response
            .bars
            .unwrap_or_default()
            .into_iter()
            .map(|b| Bar {
                timestamp: b.t,
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
                volume: b.v,
                vwap: b.vw,
                trade_count: b.n,
            })
            .collect();
        bars.sort_by_key(|b| b.timestamp);
        Ok(bars)
    }

    async fn is_market_open(&self) -> BrokerResult<bool> {
        self.ensure_connected()?;
        let url = format!("{}/v2/clock", self.base_url);
        let clock: AlpacaClock = self.get_json(&url, "clock").await?;
        Ok(clock.is_open)
    }

    async fn get_market_hours(&self, date: NaiveDate) -> BrokerResult<MarketHours> {
        self.ensure_connected()?;
        let url = format!(
            "{}/v2/calendar?start={}&end={}",
            self.base_url, date, date
        );
        let days: Vec<AlpacaCalendarDay> = self.get_json(&url, "calendar").await?;

        Ok(match days.into_iter().find(|d| d.date == date) {
            Some(day) => MarketHours {
                date,
                is_open: true,
                open: Some(day.open),
                close: Some(day.close),
            },
            None => MarketHours {
                date,
                is_open: false,
                open: None,
                close: None,
            },
        })
    }

    async fn get_news(&self, symbols: &[String], limit: usize) -> BrokerResult<Vec<NewsArticle>> {
        self.ensure_connected()?;
        if symbols.is_empty() {
            return Ok(Vec::new());
        }
        let joined = symbols
            .iter()
            .map(|s| s.to_uppercase())
            .collect::<Vec<_>>()
            .join(",");
        let url = format!(
            "{}/v1beta1/news?symbols={}&limit={}&sort=desc",
            self.data_url,
            joined,
            limit.clamp(1, MAX_NEWS_LIMIT)
        );
        let response: NewsResponse = self.get_json(&url, "news").await?;
        debug!(symbols = %joined, articles = response.news.len(), "Fetched news");
        Ok(response.news.into_iter().map(NewsArticle::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use rust_decimal_macros::dec;
    use serde_json::json;

    const ACCOUNT_BODY: &str = r#"{
        "id": "acc-1",
        "buying_power": "40000.50",
        "cash": "20000",
        "portfolio_value": "60000",
        "equity": "60000",
        "daytrading_buying_power": "0",
        "pattern_day_trader": false,
        "daytrade_count": 1,
        "status": "ACTIVE",
        "currency": "USD"
    }"#;

    async fn connected_adapter(server: &mut Server) -> AlpacaBrokerAdapter {
        server
            .mock("GET", "/v2/account")
            .match_header("APCA-API-KEY-ID", "key")
            .match_header("APCA-API-SECRET-KEY", "secret")
            .with_status(200)
            .with_body(ACCOUNT_BODY)
            .create_async()
            .await;

        let adapter = AlpacaBrokerAdapter::with_urls("key", "secret", server.url(), server.url()).unwrap();
        adapter.connect().await.unwrap();
        adapter
    }

    #[test]
    fn test_settings_select_endpoints() {
        let settings = BrokerSettings::new(
            BROKER_NAME,
            json!({"alpaca_api_key": "k", "alpaca_secret_key": "s", "paper_trading": false})
                .as_object()
                .cloned()
                .unwrap(),
        );
        let adapter = AlpacaBrokerAdapter::new(&settings).unwrap();
        assert_eq!(adapter.base_url, LIVE_URL);
        assert_eq!(adapter.data_url, DATA_URL);

        let settings = BrokerSettings::new(
            BROKER_NAME,
            json!({"api_key": "k"}).as_object().cloned().unwrap(),
        );
        match AlpacaBrokerAdapter::new(&settings) {
            Err(BrokerError::MissingConfigField { field, .. }) => assert_eq!(field, "alpaca_secret_key"),
            _ => panic!("expected missing secret"),
        }
    }

    #[tokio::test]
    async fn test_connect_and_account() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;
        assert!(adapter.is_connected());

        let account = adapter.get_account().await.unwrap();
        assert_eq!(account.account_id, "acc-1");
        assert_eq!(account.buying_power, dec!(40000.50));
        assert_eq!(account.day_trade_count, 1);
    }

    #[tokio::test]
    async fn test_connect_unauthorized() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/account")
            .with_status(401)
            .with_body(r#"{"message":"unauthorized"}"#)
            .create_async()
            .await;

        let adapter = AlpacaBrokerAdapter::with_urls("bad", "bad", server.url(), server.url()).unwrap();
        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Authentication(_)));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_place_bracket_order() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;

        let mock = server
            .mock("POST", "/v2/orders")
            .match_body(Matcher::PartialJson(json!({
                "symbol": "AAPL",
                "qty": "10",
                "side": "buy",
                "type": "market",
                "time_in_force": "day",
                "order_class": "bracket",
                "take_profit": {"limit_price": "162.00"},
                "stop_loss": {"stop_price": "145.50"}
            })))
            .with_status(200)
            .with_body(
                r#"{"id":"ord-1","client_order_id":"c-1","symbol":"AAPL","qty":"10","side":"buy",
                "type":"market","status":"accepted","filled_qty":"0","filled_avg_price":null,
                "limit_price":null,"created_at":"2024-01-02T15:00:00Z","updated_at":null}"#,
            )
            .create_async()
            .await;

        let order = OrderRequest::market("AAPL", OrderSide::Buy, dec!(10)).with_bracket(dec!(145.50), dec!(162.00));
        let response = adapter.place_order(&order).await.unwrap();
        mock.assert_async().await;
        assert_eq!(response.order_id, "ord-1");
        assert_eq!(response.status, OrderStatus::Accepted);
        assert_eq!(response.quantity, dec!(10));
    }

    #[tokio::test]
    async fn test_order_rejection_maps_to_order_error() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;
        server
            .mock("POST", "/v2/orders")
            .with_status(422)
            .with_body(r#"{"message":"insufficient buying power"}"#)
            .create_async()
            .await;

        let order = OrderRequest::market("AAPL", OrderSide::Buy, dec!(1));
        let err = adapter.place_order(&order).await.unwrap_err();
        assert!(matches!(err, BrokerError::Order(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_position_is_none() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;
        server
            .mock("GET", "/v2/positions/TSLA")
            .with_status(404)
            .with_body(r#"{"message":"position does not exist"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v2/positions/AAPL")
            .with_status(200)
            .with_body(
                r#"{"symbol":"AAPL","qty":"5","side":"long","avg_entry_price":"100",
                "current_price":"110","market_value":"550","cost_basis":"500",
                "unrealized_pl":"50","unrealized_plpc":"0.1"}"#,
            )
            .create_async()
            .await;

        assert!(adapter.get_position("tsla").await.unwrap().is_none());
        let position = adapter.get_position("AAPL").await.unwrap().unwrap();
        assert_eq!(position.quantity, dec!(5));
        assert_eq!(position.unrealized_pl, dec!(50));
    }

    #[tokio::test]
    async fn test_bars_and_quote_from_data_api() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;
        server
            .mock("GET", "/v2/stocks/AAPL/bars")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("timeframe".into(), "1Day".into()),
                Matcher::UrlEncoded("limit".into(), "2".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"symbol":"AAPL","bars":[
                {"t":"2024-01-03T05:00:00Z","o":101,"h":103,"l":100,"c":102,"v":2000,"vw":101.5,"n":20},
                {"t":"2024-01-02T05:00:00Z","o":100,"h":102,"l":99,"c":101,"v":1000}
                ]}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v2/stocks/AAPL/quotes/latest")
            .with_status(200)
            .with_body(r#"{"symbol":"AAPL","quote":{"t":"2024-01-03T15:00:00Z","ap":102.1,"as":3,"bp":101.9,"bs":4}}"#)
            .create_async()
            .await;

        let bars = adapter.get_bars("AAPL", "1Day", 2).await.unwrap();
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp < bars[1].timestamp);
        assert_eq!(bars[1].close, dec!(102));

        let quote = adapter.get_quote("AAPL").await.unwrap();
        assert_eq!(quote.mid(), dec!(102.0));
        assert_eq!(quote.ask_size, 3);
    }

    #[tokio::test]
    async fn test_news_from_data_api() {
        let mut server = Server::new_async().await;
        let adapter = connected_adapter(&mut server).await;
        let mock = server
            .mock("GET", "/v1beta1/news")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbols".into(), "AAPL,MSFT".into()),
                Matcher::UrlEncoded("limit".into(), "50".into()),
            ]))
            .with_status(200)
            .with_body(
                r#"{"news":[
                {"id":101,"headline":"Apple beats estimates","author":"x","summary":"Strong quarter",
                "content":"","url":"","images":[],"symbols":["AAPL"],"source":"benzinga",
                "created_at":"2024-01-03T14:00:00Z","updated_at":"2024-01-03T14:00:00Z"},
                {"id":100,"headline":"Microsoft faces inquiry","summary":"",
                "symbols":["MSFT","GOOGL"],"source":"benzinga","created_at":"2024-01-03T12:00:00Z"}
                ],"next_page_token":null}"#,
            )
            .create_async()
            .await;

        let news = adapter
            .get_news(&["aapl".to_string(), "MSFT".to_string()], 500)
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(news.len(), 2);
        assert_eq!(news[0].id, "101");
        assert!(news[0].url.is_none());
        assert!(news[0].mentions("aapl"));
        assert!(news[1].mentions("GOOGL"));
        assert!(adapter.get_news(&[], 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let adapter = AlpacaBrokerAdapter::with_urls("k", "s", "http://127.0.0.1:1", "http://127.0.0.1:1").unwrap();
        let err = adapter.get_positions().await.unwrap_err();
        assert!(matches!(err, BrokerError::Connection(_)));
    }
}
