//! Order execution with retry, fill polling and timeout handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Constant;
use backoff::future::retry;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    validate_order, BrokerAdapter, BrokerError, OrderRequest, OrderResponse, OrderSide, OrderStatus, OrderType,
    Position, TimeInForce,
};
use crate::models::AggregatedSignal;

/// `trading.execution` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Total placement attempts
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub order_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub default_order_type: OrderType,
    pub default_time_in_force: TimeInForce,
    /// Absolute price offset for limit orders
    pub limit_price_buffer: Decimal,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
            order_timeout_secs: 60,
            poll_interval_secs: 2,
            default_order_type: OrderType::Market,
            default_time_in_force: TimeInForce::Day,
            limit_price_buffer: dec!(0.01),
        }
    }
}

/// Outcome of one order execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub order_id: Option<String>,
    /// Broker status, or `timeout` / `failed`
    pub status: String,
    pub filled_quantity: Decimal,
    pub filled_price: Option<Decimal>,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub error: Option<String>,
    #[serde(skip)]
    pub response: Option<OrderResponse>,
}

impl ExecutionResult {
    fn failed(error: impl Into<String>, attempts: u32, started: Instant) -> Self {
        Self {
            success: false,
            order_id: None,
            status: "failed".to_string(),
            filled_quantity: Decimal::ZERO,
            filled_price: None,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: Some(error.into()),
            response: None,
        }
    }
}

/// Pre-flight report for an order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetrics {
    pub total_orders: u64,
    pub successful: u64,
    pub failed: u64,
    pub fill_rate: f64,
    pub average_execution_ms: f64,
    pub average_attempts: f64,
}

#[derive(Debug, Default)]
struct ExecutionStats {
    total: u64,
    successful: u64,
    failed: u64,
    total_ms: u64,
    total_attempts: u64,
}

/// Places orders through a broker adapter.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerAdapter>,
    config: ExecutionConfig,
    stats: RwLock<ExecutionStats>,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn BrokerAdapter>, config: ExecutionConfig) -> Self {
        Self {
            broker,
            config,
            stats: RwLock::new(ExecutionStats::default()),
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Quantity for a money amount, rounded to 2 places.
    pub fn quantity_for(position_size: Decimal, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        (position_size / price).round_dp(2)
    }

    /// Turn an actionable signal into an order request.
    ///
    /// Returns `None` for holds or when the size buys nothing.
    pub fn build_order(
        &self,
        signal: &AggregatedSignal,
        position_size: Decimal,
        stops: Option<(Decimal, Decimal)>,
    ) -> Option<OrderRequest> {
        let side = signal.direction.order_side()?;
        let quantity = Self::quantity_for(position_size, signal.price);
        if quantity <= Decimal::ZERO {
            return None;
        }

        let mut order = match self.config.default_order_type {
            OrderType::Limit => {
                let price = match side {
                    OrderSide::Buy => signal.price + self.config.limit_price_buffer,
                    OrderSide::Sell => signal.price - self.config.limit_price_buffer,
                };
                OrderRequest::limit(&signal.symbol, side, quantity, price)
            }
            _ => OrderRequest::market(&signal.symbol, side, quantity),
        };
        order.time_in_force = self.config.default_time_in_force;
        order.client_order_id = Some(Uuid::new_v4().to_string());
        if let Some((stop_loss, take_profit)) = stops {
            order = order.with_bracket(stop_loss, take_profit);
        }
        Some(order)
    }

    /// Check an order before sending it.
    pub fn validate(order: &OrderRequest, market_open: bool) -> ValidationReport {
        let mut report = ValidationReport::default();
        if let Err(e) = validate_order(order) {
            report.errors.push(match e {
                BrokerError::Order(msg) => msg,
                other => other.to_string(),
            });
        }
        if !market_open {
            report
                .warnings
                .push("Market is closed; order will queue".to_string());
        }
        report.valid = report.errors.is_empty();
        report
    }

    /// Place with retries, then poll until the order settles or times out.
    pub async fn execute(&self, order: &OrderRequest) -> ExecutionResult {
        let started = Instant::now();
        if let Err(e) = validate_order(order) {
            let result = ExecutionResult::failed(e.to_string(), 0, started);
            self.record(&result).await;
            return result;
        }

        let max_attempts = self.config.max_retries.max(1);
        let policy = Constant::new(Duration::from_secs(self.config.retry_delay_secs));
        let mut attempts = 0u32;

        let placed = retry(policy, || {
            attempts += 1;
            let attempt = attempts;
            let broker = Arc::clone(&self.broker);
            async move {
                match broker.place_order(order).await {
                    Ok(response) => Ok(response),
                    Err(e) if e.is_transient() && attempt < max_attempts => {
                        warn!(
                            symbol = %order.symbol,
                            attempt = attempt,
                            error = %e,
                            "Order placement failed, retrying"
                        );
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        })
        .await;

        let placed = match placed {
            Ok(response) => response,
            Err(e) => {
                error!(symbol = %order.symbol, attempts = attempts, error = %e, "Order placement failed");
                let result = ExecutionResult::failed(e.to_string(), attempts, started);
                self.record(&result).await;
                return result;
            }
        };

        info!(
            order_id = %placed.order_id,
            symbol = %placed.symbol,
            side = %placed.side,
            quantity = %placed.quantity,
            "Order placed"
        );

        let (final_order, status) = self.await_fill(placed).await;
        let result = ExecutionResult {
            success: final_order.filled_quantity > Decimal::ZERO,
            order_id: Some(final_order.order_id.clone()),
            status,
            filled_quantity: final_order.filled_quantity,
            filled_price: final_order.filled_avg_price,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error: None,
            response: Some(final_order),
        };
        self.record(&result).await;
        result
    }

    /// Poll until terminal. On timeout, cancel best-effort and report `timeout`.
    async fn await_fill(&self, mut order: OrderResponse) -> (OrderResponse, String) {
        let deadline = Instant::now() + Duration::from_secs(self.config.order_timeout_secs);
        let poll = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            if order.status.is_terminal() {
                let status = order.status.to_string();
                return (order, status);
            }
            if Instant::now() >= deadline {
                warn!(order_id = %order.order_id, "Order monitoring timed out, cancelling");
                if let Err(e) = self.broker.cancel_order(&order.order_id).await {
                    warn!(order_id = %order.order_id, error = %e, "Cancel after timeout failed");
                }
                return (order, "timeout".to_string());
            }

            tokio::time::sleep(poll).await;
            match self.broker.get_order_status(&order.order_id).await {
                Ok(latest) => {
                    debug!(order_id = %latest.order_id, status = %latest.status, "Polled order");
                    order = latest;
                }
                Err(e) => warn!(order_id = %order.order_id, error = %e, "Order status poll failed"),
            }
        }
    }

    /// Close a position with a market order on the opposite side.
    pub async fn exit_position(&self, position: &Position) -> ExecutionResult {
        let mut order = OrderRequest::market(&position.symbol, position.side.closing_side(), position.abs_quantity());
        order.client_order_id = Some(Uuid::new_v4().to_string());
        info!(symbol = %position.symbol, quantity = %order.quantity, side = %order.side, "Exiting position");
        self.execute(&order).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> bool {
        match self.broker.cancel_order(order_id).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!(order_id = %order_id, error = %e, "Cancel failed");
                false
            }
        }
    }

    async fn record(&self, result: &ExecutionResult) {
        let mut stats = self.stats.write().await;
        stats.total += 1;
        if result.success {
            stats.successful += 1;
        } else {
            stats.failed += 1;
        }
        stats.total_ms += result.elapsed_ms;
        stats.total_attempts += result.attempts as u64;
    }

    pub async fn metrics(&self) -> ExecutionMetrics {
        let stats = self.stats.read().await;
        if stats.total == 0 {
            return ExecutionMetrics::default();
        }
        let total = stats.total as f64;
        ExecutionMetrics {
            total_orders: stats.total,
            successful: stats.successful,
            failed: stats.failed,
            fill_rate: stats.successful as f64 / total,
            average_execution_ms: stats.total_ms as f64 / total,
            average_attempts: stats.total_attempts as f64 / total,
        }
    }

    /// Simulated fill at `price`, for dry runs.
    pub async fn simulate(&self, order: &OrderRequest, price: Decimal) -> ExecutionResult {
        info!(
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            price = %price,
            "Dry run, simulating fill"
        );
        let result = ExecutionResult {
            success: true,
            order_id: Some(format!("dry-run-{}", Uuid::new_v4())),
            status: OrderStatus::Filled.to_string(),
            filled_quantity: order.quantity,
            filled_price: Some(price),
            attempts: 0,
            elapsed_ms: 0,
            error: None,
            response: None,
        };
        self.record(&result).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{AccountInfo, Bar, BrokerResult, DemoBrokerAdapter, MarketHours, Quote};
    use crate::models::SignalDirection;
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Demo broker that fails placement a set number of times and can leave
    /// orders open forever.
    struct FlakyBroker {
        inner: DemoBrokerAdapter,
        failures: AtomicU32,
        permanent: bool,
        never_fill: bool,
    }

    impl FlakyBroker {
        async fn new(failures: u32, permanent: bool, never_fill: bool) -> Arc<Self> {
            let inner = DemoBrokerAdapter::unauthenticated();
            inner.connect().await.unwrap();
            Arc::new(Self {
                inner,
                failures: AtomicU32::new(failures),
                permanent,
                never_fill,
            })
        }
    }

    #[async_trait]
    impl BrokerAdapter for FlakyBroker {
        fn broker_name(&self) -> &str {
            "flaky"
        }
        async fn connect(&self) -> BrokerResult<()> {
            self.inner.connect().await
        }
        async fn disconnect(&self) -> BrokerResult<()> {
            self.inner.disconnect().await
        }
        fn is_connected(&self) -> bool {
            self.inner.is_connected()
        }
        async fn place_order(&self, order: &OrderRequest) -> BrokerResult<OrderResponse> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(if self.permanent {
                    BrokerError::Order("rejected".to_string())
                } else {
                    BrokerError::Connection("reset".to_string())
                });
            }
            let mut response = self.inner.place_order(order).await?;
            if self.never_fill {
                response.status = OrderStatus::New;
                response.filled_quantity = Decimal::ZERO;
            }
            Ok(response)
        }
        async fn cancel_order(&self, order_id: &str) -> BrokerResult<bool> {
            self.inner.cancel_order(order_id).await
        }
        async fn get_order_status(&self, order_id: &str) -> BrokerResult<OrderResponse> {
            let mut response = self.inner.get_order_status(order_id).await?;
            if self.never_fill {
                response.status = OrderStatus::New;
                response.filled_quantity = Decimal::ZERO;
            }
            Ok(response)
        }
        async fn get_orders(&self, status: Option<&str>, limit: usize) -> BrokerResult<Vec<OrderResponse>> {
            self.inner.get_orders(status, limit).await
        }
        async fn get_account(&self) -> BrokerResult<AccountInfo> {
            self.inner.get_account().await
        }
        async fn get_positions(&self) -> BrokerResult<Vec<Position>> {
            self.inner.get_positions().await
        }
        async fn get_position(&self, symbol: &str) -> BrokerResult<Option<Position>> {
            self.inner.get_position(symbol).await
        }
        async fn get_quote(&self, symbol: &str) -> BrokerResult<Quote> {
            self.inner.get_quote(symbol).await
        }
        async fn get_bars(&self, symbol: &str, timeframe: &str, limit: usize) -> BrokerResult<Vec<Bar>> {
            self.inner.get_bars(symbol, timeframe, limit).await
        }
        async fn is_market_open(&self) -> BrokerResult<bool> {
            self.inner.is_market_open().await
        }
        async fn get_market_hours(&self, date: NaiveDate) -> BrokerResult<MarketHours> {
            self.inner.get_market_hours(date).await
        }
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            retry_delay_secs: 0,
            poll_interval_secs: 0,
            order_timeout_secs: 0,
            ..Default::default()
        }
    }

    fn signal(direction: SignalDirection) -> AggregatedSignal {
        AggregatedSignal {
            symbol: "AAPL".to_string(),
            direction,
            strength: 0.8,
            confidence: 0.8,
            price: dec!(150),
            contributing_strategies: vec![],
            signal_count: 2,
            method: "weighted_average".to_string(),
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_quantity_for() {
        assert_eq!(OrderExecutor::quantity_for(dec!(1000), dec!(300)), dec!(3.33));
        assert_eq!(OrderExecutor::quantity_for(dec!(1000), Decimal::ZERO), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_build_order() {
        let broker = FlakyBroker::new(0, false, false).await;
        let config = ExecutionConfig {
            default_order_type: OrderType::Limit,
            ..Default::default()
        };
        let executor = OrderExecutor::new(broker, config);

        let order = executor
            .build_order(&signal(SignalDirection::Buy), dec!(1500), Some((dec!(145.5), dec!(162))))
            .unwrap();
        assert_eq!(order.quantity, dec!(10));
        assert_eq!(order.limit_price, Some(dec!(150.01)));
        assert_eq!(order.stop_loss, Some(dec!(145.5)));
        assert!(order.client_order_id.is_some());

        let sell = executor.build_order(&signal(SignalDirection::Sell), dec!(1500), None).unwrap();
        assert_eq!(sell.limit_price, Some(dec!(149.99)));

        assert!(executor.build_order(&signal(SignalDirection::Hold), dec!(1500), None).is_none());
        assert!(executor.build_order(&signal(SignalDirection::Buy), dec!(0.1), None).is_none());
    }

    #[test]
    fn test_validate_report() {
        let order = OrderRequest::market("AAPL", OrderSide::Buy, dec!(1));
        let report = OrderExecutor::validate(&order, false);
        assert!(report.valid);
        assert_eq!(report.warnings, vec!["Market is closed; order will queue"]);

        let mut bad = OrderRequest::market("AAPL", OrderSide::Buy, dec!(1));
        bad.order_type = OrderType::Limit;
        let report = OrderExecutor::validate(&bad, true);
        assert!(!report.valid);
        assert_eq!(report.errors, vec!["Limit orders require a limit price"]);
    }

    #[tokio::test]
    async fn test_execute_retries_transient_errors() {
        let broker = FlakyBroker::new(2, false, false).await;
        let executor = OrderExecutor::new(broker, fast_config());
        let result = executor
            .execute(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await;
        assert!(result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.status, "filled");
        assert_eq!(result.filled_quantity, dec!(5));
    }

    #[tokio::test]
    async fn test_execute_gives_up_after_max_retries() {
        let broker = FlakyBroker::new(5, false, false).await;
        let executor = OrderExecutor::new(broker, fast_config());
        let result = executor
            .execute(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await;
        assert!(!result.success);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.status, "failed");
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let broker = FlakyBroker::new(1, true, false).await;
        let executor = OrderExecutor::new(broker, fast_config());
        let result = executor
            .execute(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await;
        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let broker = FlakyBroker::new(0, false, true).await;
        let executor = OrderExecutor::new(broker, fast_config());
        let result = executor
            .execute(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await;
        assert!(!result.success);
        assert_eq!(result.status, "timeout");
        assert!(result.order_id.is_some());

        let metrics = executor.metrics().await;
        assert_eq!(metrics.total_orders, 1);
        assert_eq!(metrics.failed, 1);
    }

    #[tokio::test]
    async fn test_exit_position_and_metrics() {
        let broker = FlakyBroker::new(0, false, false).await;
        let executor = OrderExecutor::new(broker.clone(), fast_config());
        executor
            .execute(&OrderRequest::market("AAPL", OrderSide::Buy, dec!(5)))
            .await;

        let position = broker.get_position("AAPL").await.unwrap().unwrap();
        let result = executor.exit_position(&position).await;
        assert!(result.success);
        assert!(broker.get_position("AAPL").await.unwrap().is_none());

        let metrics = executor.metrics().await;
        assert_eq!(metrics.total_orders, 2);
        assert_eq!(metrics.fill_rate, 1.0);
        assert_eq!(metrics.average_attempts, 1.0);
    }
}
