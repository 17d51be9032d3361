//! Broker-neutral trading types shared by every adapter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::{BrokerError, BrokerResult};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(BrokerError::Order(format!(
                "Invalid order side '{}': must be buy or sell",
                other
            ))),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Stop => "stop",
            OrderType::StopLimit => "stop_limit",
            OrderType::TrailingStop => "trailing_stop",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            "stop" => Ok(OrderType::Stop),
            "stop_limit" => Ok(OrderType::StopLimit),
            "trailing_stop" => Ok(OrderType::TrailingStop),
            other => Err(BrokerError::Order(format!("Invalid order type '{}'", other))),
        }
    }
}

/// Time in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    Day,
    Gtc,
    Opg,
    Cls,
    Ioc,
    Fok,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Day => "day",
            TimeInForce::Gtc => "gtc",
            TimeInForce::Opg => "opg",
            TimeInForce::Cls => "cls",
            TimeInForce::Ioc => "ioc",
            TimeInForce::Fok => "fok",
        }
    }
}

impl FromStr for TimeInForce {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" => Ok(TimeInForce::Day),
            "gtc" => Ok(TimeInForce::Gtc),
            "opg" => Ok(TimeInForce::Opg),
            "cls" => Ok(TimeInForce::Cls),
            "ioc" => Ok(TimeInForce::Ioc),
            "fok" => Ok(TimeInForce::Fok),
            other => Err(BrokerError::Order(format!("Invalid time in force '{}'", other))),
        }
    }
}

/// Order lifecycle status as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    DoneForDay,
    #[serde(alias = "cancelled")]
    Canceled,
    Expired,
    Replaced,
    PendingCancel,
    PendingReplace,
    PendingReview,
    Rejected,
    Suspended,
    PendingNew,
    // Alpaca-specific states folded into the closest neutral one
    #[serde(alias = "accepted_for_bidding", alias = "calculated", alias = "held")]
    Accepted,
    Stopped,
}

impl OrderStatus {
    /// No further fills can happen once an order reaches a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Expired
                | OrderStatus::Rejected
                | OrderStatus::DoneForDay
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "new",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::Filled => "filled",
            OrderStatus::DoneForDay => "done_for_day",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Expired => "expired",
            OrderStatus::Replaced => "replaced",
            OrderStatus::PendingCancel => "pending_cancel",
            OrderStatus::PendingReplace => "pending_replace",
            OrderStatus::PendingReview => "pending_review",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Suspended => "suspended",
            OrderStatus::PendingNew => "pending_new",
            OrderStatus::Accepted => "accepted",
            OrderStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order placement request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    /// Stop trigger, or the trail amount for trailing stops
    pub stop_price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub extended_hours: bool,
    /// Bracket take-profit limit price
    pub take_profit: Option<Decimal>,
    /// Bracket stop-loss trigger price
    pub stop_loss: Option<Decimal>,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order, good for the day.
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            side,
            order_type: OrderType::Market,
            limit_price: None,
            stop_price: None,
            time_in_force: TimeInForce::Day,
            extended_hours: false,
            take_profit: None,
            stop_loss: None,
            client_order_id: None,
        }
    }

    /// Limit order, good for the day.
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            order_type: OrderType::Limit,
            limit_price: Some(limit_price),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Attach bracket exits.
    pub fn with_bracket(mut self, stop_loss: Decimal, take_profit: Decimal) -> Self {
        self.stop_loss = Some(stop_loss);
        self.take_profit = Some(take_profit);
        self
    }
}

/// Check an order request for structural problems before sending it.
pub fn validate_order(order: &OrderRequest) -> BrokerResult<()> {
    if order.symbol.trim().is_empty() {
        return Err(BrokerError::Order("Symbol is required".to_string()));
    }
    if order.quantity <= Decimal::ZERO {
        return Err(BrokerError::Order(format!(
            "Quantity must be positive, got {}",
            order.quantity
        )));
    }

    match order.order_type {
        OrderType::Market => {}
        OrderType::Limit if order.limit_price.is_none() => {
            return Err(BrokerError::Order("Limit orders require a limit price".to_string()));
        }
        OrderType::Stop if order.stop_price.is_none() => {
            return Err(BrokerError::Order("Stop orders require a stop price".to_string()));
        }
        OrderType::StopLimit if order.limit_price.is_none() || order.stop_price.is_none() => {
            return Err(BrokerError::Order(
                "Stop-limit orders require both a limit price and a stop price".to_string(),
            ));
        }
        OrderType::TrailingStop if order.stop_price.is_none() => {
            return Err(BrokerError::Order(
                "Trailing stop orders require a trail amount in stop_price".to_string(),
            ));
        }
        _ => {}
    }

    Ok(())
}

/// Broker response for a placed or queried order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub quantity: Decimal,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Long or short holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// Side of the order that closes this position.
    pub fn closing_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

impl FromStr for PositionSide {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(BrokerError::Data(format!("Invalid position side '{}'", other))),
        }
    }
}

/// Open position held at the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Signed quantity, negative for shorts
    pub quantity: Decimal,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub cost_basis: Decimal,
    pub unrealized_pl: Decimal,
    pub unrealized_pl_percent: Decimal,
}

impl Position {
    /// Build a position and derive value and P&L from prices.
    pub fn new(symbol: impl Into<String>, quantity: Decimal, entry_price: Decimal, current_price: Decimal) -> Self {
        let side = if quantity < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Long
        };
        let mut position = Self {
            symbol: symbol.into(),
            quantity,
            side,
            entry_price,
            current_price,
            market_value: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            unrealized_pl: Decimal::ZERO,
            unrealized_pl_percent: Decimal::ZERO,
        };
        position.reprice(current_price);
        position
    }

    /// Update the mark price and derived fields.
    pub fn reprice(&mut self, price: Decimal) {
        self.current_price = price;
        self.market_value = self.quantity * price;
        self.cost_basis = self.quantity * self.entry_price;
        self.unrealized_pl = self.market_value - self.cost_basis;
        self.unrealized_pl_percent = if self.cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            self.unrealized_pl / self.cost_basis.abs()
        };
    }

    pub fn abs_quantity(&self) -> Decimal {
        self.quantity.abs()
    }
}

/// Account balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: String,
    pub buying_power: Decimal,
    pub cash: Decimal,
    pub portfolio_value: Decimal,
    pub equity: Decimal,
    pub day_trading_power: Decimal,
    pub pattern_day_trader: bool,
    pub day_trade_count: i64,
    pub status: String,
    pub currency: String,
}

/// Top-of-book quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid_price: Decimal,
    pub ask_price: Decimal,
    pub bid_size: i64,
    pub ask_size: i64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Midpoint, falling back to whichever side is quoted.
    pub fn mid(&self) -> Decimal {
        match (self.bid_price.is_zero(), self.ask_price.is_zero()) {
            (false, false) => (self.bid_price + self.ask_price) / Decimal::from(2),
            (true, false) => self.ask_price,
            (false, true) => self.bid_price,
            (true, true) => Decimal::ZERO,
        }
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    pub vwap: Option<Decimal>,
    pub trade_count: Option<i64>,
}

/// Trading session for one calendar day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketHours {
    pub date: NaiveDate,
    pub is_open: bool,
    pub open: Option<String>,
    pub close: Option<String>,
}

/// News headline tagged with the symbols it mentions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewsArticle {
    pub id: String,
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl NewsArticle {
    /// Headline and summary joined for text analysis.
    pub fn text(&self) -> String {
        format!("{} {}", self.headline, self.summary)
    }

    pub fn mentions(&self, symbol: &str) -> bool {
        self.symbols.iter().any(|s| s.eq_ignore_ascii_case(symbol))
    }
}

/// Whole shares affordable with `pct` of `portfolio_value` at `price`.
pub fn calculate_position_size(portfolio_value: Decimal, pct: Decimal, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (portfolio_value * pct / price).floor()
}
