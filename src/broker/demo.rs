//! In-memory demo broker for paper runs and tests.
//!
//! Orders fill immediately, quotes straddle a per-symbol price, and bars are a
//! deterministic synthetic series so strategies produce repeatable output.
//! News is whatever was seeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::config::{credential_prefix, BrokerSettings};
use super::error::{BrokerError, BrokerResult};
use super::types::*;
use super::{not_connected, BrokerAdapter};

const BROKER_NAME: &str = "demo_broker";
const DEFAULT_PRICE: Decimal = dec!(100);
const HALF_SPREAD: Decimal = dec!(0.5);
const STARTING_CASH: Decimal = dec!(25000);
const STARTING_BUYING_POWER: Decimal = dec!(50000);
const STARTING_PORTFOLIO: Decimal = dec!(75000);

#[derive(Debug, Default)]
struct DemoState {
    cash: Decimal,
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, Position>,
    orders: Vec<OrderResponse>,
    news: Vec<NewsArticle>,
}

/// Demo broker adapter.
pub struct DemoBrokerAdapter {
    connected: AtomicBool,
    state: RwLock<DemoState>,
}

impl DemoBrokerAdapter {
    /// Build from resolved settings. Credentials must be present even though
    /// nothing is sent anywhere.
    pub fn new(settings: &BrokerSettings) -> BrokerResult<Self> {
        let prefix = credential_prefix(BROKER_NAME);
        if settings.api_key().is_none() {
            return Err(BrokerError::MissingConfigField {
                broker: BROKER_NAME.to_string(),
                field: format!("{}_api_key", prefix),
            });
        }
        if settings.secret_key().is_none() {
            return Err(BrokerError::MissingConfigField {
                broker: BROKER_NAME.to_string(),
                field: format!("{}_secret_key", prefix),
            });
        }
        Ok(Self::unauthenticated())
    }

    /// Adapter with default state and no credential check.
    pub fn unauthenticated() -> Self {
        Self {
            connected: AtomicBool::new(false),
            state: RwLock::new(DemoState {
                cash: STARTING_CASH,
                ..Default::default()
            }),
        }
    }

    /// Set the reference price for a symbol.
    pub async fn seed_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state.prices.insert(symbol.to_uppercase(), price);
        if let Some(position) = state.positions.get_mut(&symbol.to_uppercase()) {
            position.reprice(price);
        }
    }

    /// Add a headline to the news feed.
    pub async fn seed_news(&self, article: NewsArticle) {
        self.state.write().await.news.push(article);
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(not_connected(BROKER_NAME))
        }
    }

    fn price_of(state: &DemoState, symbol: &str) -> Decimal {
        state.prices.get(symbol).copied().unwrap_or(DEFAULT_PRICE)
    }

    fn apply_fill(state: &mut DemoState, symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };
        state.cash -= signed * price;

        let current = Self::price_of(state, symbol);
        let updated = match state.positions.remove(symbol) {
            None => Some(Position::new(symbol, signed, price, current)),
            Some(existing) => {
                let new_qty = existing.quantity + signed;
                if new_qty.is_zero() {
                    None
                } else if same_sign(existing.quantity, signed) {
                    // Adding to the position moves the average entry
                    let entry = (existing.quantity * existing.entry_price + signed * price) / new_qty;
                    Some(Position::new(symbol, new_qty, entry, current))
                } else if same_sign(existing.quantity, new_qty) {
                    Some(Position::new(symbol, new_qty, existing.entry_price, current))
                } else {
                    // Flipped through zero
                    Some(Position::new(symbol, new_qty, price, current))
                }
            }
        };

        if let Some(position) = updated {
            state.positions.insert(symbol.to_string(), position);
        }
    }
}

fn same_sign(a: Decimal, b: Decimal) -> bool {
    a.is_sign_negative() == b.is_sign_negative()
}

/// Deterministic per-symbol seed.
fn symbol_seed(symbol: &str) -> u32 {
    symbol.bytes().fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

#[async_trait]
impl BrokerAdapter for DemoBrokerAdapter {
    fn broker_name(&self) -> &str {
        BROKER_NAME
    }

    async fn connect(&self) -> BrokerResult<()> {
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to demo broker");
        Ok(())
    }

    async fn disconnect(&self) -> BrokerResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from demo broker");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderResponse> {
        self.ensure_connected()?;
        validate_order(order)?;

        let symbol = order.symbol.to_uppercase();
        let mut state = self.state.write().await;

        let fill_price = match order.order_type {
            OrderType::Limit | OrderType::StopLimit => order.limit_price.unwrap_or(DEFAULT_PRICE),
            _ => {
                let price = Self::price_of(&state, &symbol);
                match order.side {
                    OrderSide::Buy => price + HALF_SPREAD,
                    OrderSide::Sell => price - HALF_SPREAD,
                }
            }
        };

        if order.side == OrderSide::Buy {
            let held_short = state
                .positions
                .get(&symbol)
                .map(|p| p.quantity < Decimal::ZERO)
                .unwrap_or(false);
            let cost = order.quantity * fill_price;
            let buying_power = STARTING_BUYING_POWER + (state.cash - STARTING_CASH);
            if !held_short && cost > buying_power {
                return Err(BrokerError::Order(format!(
                    "Insufficient buying power: need {}, have {}",
                    cost.round_dp(2),
                    buying_power.round_dp(2)
                )));
            }
        }

        Self::apply_fill(&mut state, &symbol, order.side, order.quantity, fill_price);

        let now = Utc::now();
        let response = OrderResponse {
            order_id: format!("demo-{}", Uuid::new_v4()),
            client_order_id: order.client_order_id.clone(),
            symbol: symbol.clone(),
            quantity: order.quantity,
            side: order.side,
            order_type: order.order_type,
            status: OrderStatus::Filled,
            filled_quantity: order.quantity,
            filled_avg_price: Some(fill_price),
            limit_price: order.limit_price,
            created_at: now,
            updated_at: Some(now),
        };
        state.orders.push(response.clone());

        debug!(
            symbol = %symbol,
            side = %order.side,
            quantity = %order.quantity,
            price = %fill_price,
            "Demo order filled"
        );
        Ok(response)
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
        self.ensure_connected()?;
        let mut state = self.state.write().await;
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| BrokerError::Order(format!("Order {} not found", order_id)))?;

        if order.status.is_terminal() {
            return Ok(false);
        }
        order.status = OrderStatus::Canceled;
        order.updated_at = Some(Utc::now());
        Ok(true)
    }

    async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderResponse> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        state
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
            .ok_or_else(|| BrokerError::Order(format!("Order {} not found", order_id)))
    }

    async fn get_orders(&self, status: Option<&str>, limit: usize) -> BrokerResult<Vec<OrderResponse>> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let orders = state
            .orders
            .iter()
            .rev()
            .filter(|o| match status {
                None | Some("all") => true,
                Some("open") => !o.status.is_terminal(),
                Some("closed") => o.status.is_terminal(),
                Some(other) => o.status.as_str() == other,
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(orders)
    }

    async fn get_account(&self) -> BrokerResult<AccountInfo> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let cash_delta = state.cash - STARTING_CASH;
        let positions_value: Decimal = state.positions.values().map(|p| p.market_value).sum();
        let portfolio_value = STARTING_PORTFOLIO + cash_delta + positions_value;
        let buying_power = (STARTING_BUYING_POWER + cash_delta).max(Decimal::ZERO);

        Ok(AccountInfo {
            account_id: "demo-account".to_string(),
            buying_power,
            cash: state.cash,
            portfolio_value,
            equity: portfolio_value,
            day_trading_power: buying_power,
            pattern_day_trader: false,
            day_trade_count: 0,
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
        })
    }

    async fn get_positions(&self) -> BrokerResult<Vec<Position>> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        Ok(state.positions.get(&symbol.to_uppercase()).cloned())
    }

    async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote> {
        self.ensure_connected()?;
        let symbol = symbol.to_uppercase();
        let state = self.state.read().await;
        let price = Self::price_of(&state, &symbol);
        Ok(Quote {
            symbol,
            bid_price: price - HALF_SPREAD,
            ask_price: price + HALF_SPREAD,
            bid_size: 100,
            ask_size: 100,
            timestamp: Utc::now(),
        })
    }

    async fn get_bars(&self, symbol: &str, _timeframe: &str, limit: usize) -> BrokerResult<Vec<Bar>> {
        self.ensure_connected()?;
        let symbol = symbol.to_uppercase();
        let state = self.state.read().await;
        let base = Self::price_of(&state, &symbol).to_f64().unwrap_or(100.0);
        let seed = symbol_seed(&symbol);
        let phase = (seed % 17) as f64;
        let now = Utc::now();

        let bars = (0..limit)
            .map(|i| {
                // Slow sine swing with a faster ripple, ending near the seeded price
                let t = (i as f64 + phase) * 0.25;
                let back = (limit - 1 - i) as f64;
                let drift = 1.0 - back * 0.0005;
                let close = base * drift * (1.0 + 0.03 * t.sin() + 0.01 * (t * 3.0).cos());
                let open = close * (1.0 - 0.004 * (t * 2.0).sin());
                let high = open.max(close) * 1.006;
                let low = open.min(close) * 0.994;
                let volume = 500_000 + ((seed as i64 % 1000) * 1000) + (i as i64 % 10) * 25_000;

                Bar {
                    timestamp: now - Duration::days((limit - 1 - i) as i64),
                    open: to_price(open),
                    high: to_price(high),
                    low: to_price(low),
                    close: to_price(close),
                    volume,
                    vwap: Some(to_price((high + low + close) / 3.0)),
                    trade_count: Some(volume / 100),
                }
            })
            .collect();
        Ok(bars)
    }

    async fn is_market_open(&self) -> BrokerResult<bool> {
        self.ensure_connected()?;
        Ok(true)
    }

    async fn get_market_hours(&self, date: NaiveDate) -> BrokerResult<MarketHours> {
        self.ensure_connected()?;
        Ok(MarketHours {
            date,
            is_open: true,
            open: Some("09:30".to_string()),
            close: Some("16:00".to_string()),
        })
    }

    async fn get_news(&self, symbols: &[String], limit: usize) -> BrokerResult<Vec<NewsArticle>> {
        self.ensure_connected()?;
        let state = self.state.read().await;
        let mut news: Vec<NewsArticle> = state
            .news
            .iter()
            .filter(|a| symbols.iter().any(|s| a.mentions(s)))
            .cloned()
            .collect();
        news.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        news.truncate(limit);
        Ok(news)
    }
}

fn to_price(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(2)
}
