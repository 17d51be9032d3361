//! HTTP routes for health, portfolio, positions, signals, manual orders and
//! the trading stop control.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use rust_decimal::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, BrokerError, OrderRequest, OrderSide, OrderType, TimeInForce};
use crate::db::{Database, TradeRecord};
use crate::models::{PortfolioSummary, PositionView};
use crate::trading::OrderExecutor;

const DEFAULT_SIGNAL_HOURS: i64 = 24;
const DEFAULT_SIGNAL_LIMIT: i64 = 100;
const MAX_SIGNAL_LIMIT: i64 = 1000;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn BrokerAdapter>,
    pub db: Database,
    pub executor: Arc<OrderExecutor>,
    pub shutdown: Arc<AtomicBool>,
    /// Whether a trading loop runs alongside the server
    pub trading_enabled: bool,
    pub dry_run: bool,
}

/// Handler errors, rendered as `{error}` JSON.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    BrokerRejected(String),

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Broker(_) | ApiError::BrokerRejected(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(status = %status, error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/portfolio", get(portfolio))
        .route("/positions", get(positions))
        .route("/signals", get(signals))
        .route("/orders", post(place_order))
        .route("/controls/stop", post(stop_trading))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(state: AppState, host: &str, port: u16, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(addr = %addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")
}

// ==================== Handlers ====================

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "broker": state.broker.broker_name(),
        "broker_connected": state.broker.is_connected(),
        "trading_active": state.trading_enabled && !state.shutdown.load(Ordering::SeqCst),
        "dry_run": state.dry_run,
    }))
}

async fn portfolio(State(state): State<AppState>) -> ApiResult<PortfolioSummary> {
    let account = state.broker.get_account().await?;
    let positions = state.broker.get_positions().await?;
    let realized = Decimal::from_f64(state.db.total_realized_pnl().await?).unwrap_or_default();
    Ok(Json(PortfolioSummary::build(&account, &positions, realized.round_dp(2))))
}

async fn positions(State(state): State<AppState>) -> ApiResult<Vec<PositionView>> {
    let account = state.broker.get_account().await?;
    let positions = state.broker.get_positions().await?;
    Ok(Json(
        positions
            .iter()
            .map(|p| PositionView::from_position(p, account.portfolio_value))
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
struct SignalsQuery {
    hours: Option<i64>,
    limit: Option<i64>,
}

async fn signals(State(state): State<AppState>, Query(query): Query<SignalsQuery>) -> ApiResult<Value> {
    let hours = query.hours.unwrap_or(DEFAULT_SIGNAL_HOURS).max(1);
    let limit = query.limit.unwrap_or(DEFAULT_SIGNAL_LIMIT).clamp(1, MAX_SIGNAL_LIMIT);
    let signals = state.db.recent_signals(hours, limit).await?;
    Ok(Json(json!({
        "hours": hours,
        "count": signals.len(),
        "signals": signals,
    })))
}

/// Manual order request.
#[derive(Debug, Deserialize)]
pub struct OrderBody {
    pub symbol: String,
    pub side: String,
    pub quantity: Decimal,
    pub order_type: Option<String>,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<String>,
    #[serde(default)]
    pub extended_hours: bool,
}

impl OrderBody {
    fn into_order(self) -> Result<OrderRequest, ApiError> {
        let bad = |e: BrokerError| ApiError::BadRequest(e.to_string());
        let side: OrderSide = self.side.parse().map_err(bad)?;
        let order_type: OrderType = self.order_type.as_deref().unwrap_or("market").parse().map_err(bad)?;
        let time_in_force: TimeInForce = self.time_in_force.as_deref().unwrap_or("day").parse().map_err(bad)?;

        let mut order = OrderRequest::market(self.symbol.trim().to_uppercase(), side, self.quantity);
        order.order_type = order_type;
        order.limit_price = self.limit_price;
        order.stop_price = self.stop_price;
        order.time_in_force = time_in_force;
        order.extended_hours = self.extended_hours;
        Ok(order)
    }
}

async fn place_order(State(state): State<AppState>, Json(body): Json<OrderBody>) -> ApiResult<Value> {
    let order = body.into_order()?;
    let market_open = state.broker.is_market_open().await.unwrap_or(false);
    let report = OrderExecutor::validate(&order, market_open);
    if !report.valid {
        return Err(ApiError::BadRequest(report.errors.join("; ")));
    }

    info!(symbol = %order.symbol, side = %order.side, quantity = %order.quantity, "Manual order requested");
    let result = if state.dry_run {
        let quote = state.broker.get_quote(&order.symbol).await?;
        state.executor.simulate(&order, order.limit_price.unwrap_or_else(|| quote.mid())).await
    } else {
        state.executor.execute(&order).await
    };

    state
        .db
        .record_trade(&TradeRecord::from_execution(&order, &result, Some("manual"), None))
        .await?;

    if result.order_id.is_none() {
        let reason = result.error.unwrap_or_else(|| "Order was not accepted".to_string());
        return Err(ApiError::BrokerRejected(reason));
    }

    Ok(Json(json!({
        "success": result.success,
        "order_id": result.order_id,
        "status": result.status,
        "filled_quantity": result.filled_quantity,
        "filled_price": result.filled_price,
        "attempts": result.attempts,
        "warnings": report.warnings,
        "order": result.response,
    })))
}

async fn stop_trading(State(state): State<AppState>) -> ApiResult<Value> {
    state.shutdown.store(true, Ordering::SeqCst);
    warn!("Trading stop requested via API");
    state
        .db
        .log_event("warning", "api", "Trading stop requested", None)
        .await?;
    Ok(Json(json!({
        "status": "stopping",
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DemoBrokerAdapter;
    use crate::trading::ExecutionConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    async fn state(dry_run: bool) -> AppState {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(DemoBrokerAdapter::unauthenticated());
        broker.connect().await.unwrap();
        let executor = Arc::new(OrderExecutor::new(Arc::clone(&broker), ExecutionConfig::default()));
        AppState {
            broker,
            db: Database::in_memory().await.unwrap(),
            executor,
            shutdown: Arc::new(AtomicBool::new(false)),
            trading_enabled: true,
            dry_run,
        }
    }

    async fn call(state: AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(state(false).await, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["broker"], "demo_broker");
        assert_eq!(body["broker_connected"], true);
        assert_eq!(body["trading_active"], true);
    }

    #[tokio::test]
    async fn test_order_then_positions_and_portfolio() {
        let state = state(false).await;
        let (status, body) = call(
            state.clone(),
            post_json("/orders", json!({"symbol": "aapl", "side": "buy", "quantity": 10})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "filled");
        assert_eq!(body["order"]["symbol"], "AAPL");

        let (status, body) = call(state.clone(), get_req("/positions")).await;
        assert_eq!(status, StatusCode::OK);
        let positions = body.as_array().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0]["symbol"], "AAPL");
        assert!(positions[0].get("portfolio_percentage").is_some());

        let (status, body) = call(state.clone(), get_req("/portfolio")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["positions_count"], 1);

        let trades = state.db.recent_trades(5).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].strategy.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn test_invalid_orders_are_400() {
        let state = state(false).await;
        let (status, body) = call(
            state.clone(),
            post_json("/orders", json!({"symbol": "AAPL", "side": "buy", "quantity": 5, "order_type": "limit"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Limit orders require a limit price");

        let (status, _) = call(
            state.clone(),
            post_json("/orders", json!({"symbol": "AAPL", "side": "hold", "quantity": 5})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            state,
            post_json("/orders", json!({"symbol": "AAPL", "side": "buy", "quantity": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dry_run_order_is_simulated() {
        let state = state(true).await;
        let (status, body) = call(
            state.clone(),
            post_json("/orders", json!({"symbol": "MSFT", "side": "buy", "quantity": 2})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["order_id"].as_str().unwrap().starts_with("dry-run-"));

        let (_, positions) = call(state, get_req("/positions")).await;
        assert!(positions.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_broker_is_502() {
        let state = state(false).await;
        state.broker.disconnect().await.unwrap();
        let (status, body) = call(state, get_req("/portfolio")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("not connected"));
    }

    #[tokio::test]
    async fn test_signals_and_stop() {
        let state = state(false).await;
        let (status, body) = call(state.clone(), get_req("/signals?hours=12&limit=5")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hours"], 12);
        assert_eq!(body["count"], 0);

        let (status, body) = call(state.clone(), post_json("/controls/stop", json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopping");
        assert!(state.shutdown.load(Ordering::SeqCst));

        let logs = state.db.recent_logs(5).await.unwrap();
        assert_eq!(logs[0].component, "api");

        let (_, health) = call(state, get_req("/health")).await;
        assert_eq!(health["trading_active"], false);
    }
}
