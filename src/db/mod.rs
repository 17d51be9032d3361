//! SQLite persistence for trades, positions, signals, portfolio snapshots
//! and system logs.
//!
//! Money is stored as REAL and timestamps as TEXT in SQLite's
//! `datetime('now')` format.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::broker::OrderRequest;
use crate::models::{AggregatedSignal, PortfolioSummary, StrategySignal};
use crate::trading::ExecutionResult;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredTrade {
    pub id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub price: Option<f64>,
    pub order_type: String,
    pub status: String,
    pub strategy: Option<String>,
    pub signal_id: Option<i64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub attempts: i64,
    pub error_message: Option<String>,
    pub created_at: String,
    pub filled_at: Option<String>,
}

/// Stored position record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: i64,
    pub symbol: String,
    pub side: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub peak_price: f64,
    pub unrealized_pnl: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub status: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
    pub exit_reason: Option<String>,
    pub realized_pnl: Option<f64>,
}

impl StoredPosition {
    pub fn opened_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.opened_at)
    }
}

/// Stored signal record. Strategy signals and aggregated decisions share
/// this table; strategy rows use method `strategy`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredSignal {
    pub id: i64,
    pub symbol: String,
    pub direction: String,
    pub strength: f64,
    pub confidence: f64,
    pub price: f64,
    pub strategy_count: i64,
    pub contributing_strategies: String,
    pub method: String,
    pub status: String,
    pub reason: Option<String>,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StoredSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub portfolio_value: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub positions_value: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    pub positions_count: i64,
    pub daily_pnl: f64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SystemLogEntry {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub component: String,
    pub message: String,
    pub details: Option<String>,
}

/// Fields for a new trade row.
#[derive(Debug, Clone)]
pub struct TradeRecord<'a> {
    pub order_id: Option<&'a str>,
    pub symbol: &'a str,
    pub side: &'a str,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub order_type: &'a str,
    pub status: &'a str,
    pub strategy: Option<&'a str>,
    pub signal_id: Option<i64>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub attempts: u32,
    pub error_message: Option<&'a str>,
}

impl<'a> TradeRecord<'a> {
    /// Trade row for an executed (or failed) order.
    pub fn from_execution(
        order: &'a OrderRequest,
        result: &'a ExecutionResult,
        strategy: Option<&'a str>,
        signal_id: Option<i64>,
    ) -> Self {
        let quantity = if result.filled_quantity > Decimal::ZERO {
            result.filled_quantity
        } else {
            order.quantity
        };
        Self {
            order_id: result.order_id.as_deref(),
            symbol: &order.symbol,
            side: order.side.as_str(),
            quantity,
            price: result.filled_price.or(order.limit_price),
            order_type: order.order_type.as_str(),
            status: &result.status,
            strategy,
            signal_id,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            attempts: result.attempts,
            error_message: result.error.as_deref(),
        }
    }
}

/// Fields for opening a position.
#[derive(Debug, Clone)]
pub struct OpenPosition<'a> {
    pub symbol: &'a str,
    pub side: &'a str,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
}

fn money(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Parse a `datetime('now')` timestamp as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| DateTime::parse_from_rfc3339(value).ok().map(|dt| dt.with_timezone(&Utc)))
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

impl Database {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Private in-memory database on a single long-lived connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                order_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL,
                order_type TEXT NOT NULL DEFAULT 'market',
                status TEXT NOT NULL,
                strategy TEXT,
                signal_id INTEGER,
                stop_loss REAL,
                take_profit REAL,
                attempts INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                filled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL NOT NULL,
                peak_price REAL NOT NULL,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                stop_loss_price REAL,
                take_profit_price REAL,
                status TEXT NOT NULL DEFAULT 'open',
                opened_at TEXT NOT NULL DEFAULT (datetime('now')),
                closed_at TEXT,
                exit_reason TEXT,
                realized_pnl REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                direction TEXT NOT NULL,
                strength REAL NOT NULL,
                confidence REAL NOT NULL,
                price REAL NOT NULL,
                strategy_count INTEGER NOT NULL DEFAULT 1,
                contributing_strategies TEXT NOT NULL DEFAULT '',
                method TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                reason TEXT,
                generated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS portfolio_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                portfolio_value REAL NOT NULL,
                cash REAL NOT NULL,
                buying_power REAL NOT NULL,
                positions_value REAL NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                positions_count INTEGER NOT NULL DEFAULT 0,
                daily_pnl REAL NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL DEFAULT (datetime('now')),
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // One open row per symbol
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_symbol ON positions(symbol) WHERE status = 'open'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_signals_time ON signals(generated_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_time ON portfolio_snapshots(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Trades ====================

    /// Insert a trade and return its id.
    pub async fn record_trade(&self, trade: &TradeRecord<'_>) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, order_id, symbol, side, quantity, price, order_type, status,
                strategy, signal_id, stop_loss, take_profit, attempts, error_message, filled_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                CASE WHEN ? = 'filled' THEN datetime('now') ELSE NULL END)
            "#,
        )
        .bind(&id)
        .bind(trade.order_id)
        .bind(trade.symbol)
        .bind(trade.side)
        .bind(money(trade.quantity))
        .bind(trade.price.map(money))
        .bind(trade.order_type)
        .bind(trade.status)
        .bind(trade.strategy)
        .bind(trade.signal_id)
        .bind(trade.stop_loss.map(money))
        .bind(trade.take_profit.map(money))
        .bind(trade.attempts as i64)
        .bind(trade.error_message)
        .bind(trade.status)
        .execute(&self.pool)
        .await
        .context("Failed to record trade")?;

        Ok(id)
    }

    pub async fn recent_trades(&self, limit: i64) -> Result<Vec<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM trades ORDER BY created_at DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch trades")
    }

    // ==================== Positions ====================

    /// Open a position, or add to the open one for the same symbol.
    pub async fn open_position(&self, position: &OpenPosition<'_>) -> Result<i64> {
        let quantity = money(position.quantity);
        let entry = money(position.entry_price);

        if let Some(existing) = self.get_open_position(position.symbol).await? {
            let total = existing.quantity + quantity;
            let averaged = if total > 0.0 {
                (existing.entry_price * existing.quantity + entry * quantity) / total
            } else {
                entry
            };
            sqlx::query(
                r#"
                UPDATE positions SET
                    quantity = ?,
                    entry_price = ?,
                    stop_loss_price = COALESCE(?, stop_loss_price),
                    take_profit_price = COALESCE(?, take_profit_price)
                WHERE id = ?
                "#,
            )
            .bind(total)
            .bind(averaged)
            .bind(position.stop_loss_price.map(money))
            .bind(position.take_profit_price.map(money))
            .bind(existing.id)
            .execute(&self.pool)
            .await?;
            return Ok(existing.id);
        }

        let result = sqlx::query(
            r#"
            INSERT INTO positions (
                symbol, side, quantity, entry_price, current_price, peak_price,
                stop_loss_price, take_profit_price, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open')
            RETURNING id
            "#,
        )
        .bind(position.symbol)
        .bind(position.side)
        .bind(quantity)
        .bind(entry)
        .bind(entry)
        .bind(entry)
        .bind(position.stop_loss_price.map(money))
        .bind(position.take_profit_price.map(money))
        .fetch_one(&self.pool)
        .await
        .context("Failed to open position")?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    pub async fn get_open_positions(&self) -> Result<Vec<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE status = 'open' ORDER BY symbol")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch positions")
    }

    pub async fn get_open_position(&self, symbol: &str) -> Result<Option<StoredPosition>> {
        sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE symbol = ? AND status = 'open'")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch position")
    }

    /// Mark an open position and store its best price.
    pub async fn update_position_price(&self, symbol: &str, price: Decimal, peak: Decimal) -> Result<()> {
        let price = money(price);
        sqlx::query(
            r#"
            UPDATE positions SET
                current_price = ?,
                peak_price = ?,
                unrealized_pnl = CASE WHEN side = 'short'
                    THEN (entry_price - ?) * quantity
                    ELSE (? - entry_price) * quantity END
            WHERE symbol = ? AND status = 'open'
            "#,
        )
        .bind(price)
        .bind(money(peak))
        .bind(price)
        .bind(price)
        .bind(symbol)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Close the open position for `symbol`. Returns the realized P&L, or
    /// `None` when nothing was open.
    pub async fn close_position(&self, symbol: &str, exit_price: Decimal, reason: &str) -> Result<Option<f64>> {
        let Some(position) = self.get_open_position(symbol).await? else {
            return Ok(None);
        };

        let exit = money(exit_price);
        let realized = if position.side == "short" {
            (position.entry_price - exit) * position.quantity
        } else {
            (exit - position.entry_price) * position.quantity
        };

        sqlx::query(
            r#"
            UPDATE positions SET
                status = 'closed',
                current_price = ?,
                unrealized_pnl = 0,
                closed_at = datetime('now'),
                exit_reason = ?,
                realized_pnl = ?
            WHERE id = ?
            "#,
        )
        .bind(exit)
        .bind(reason)
        .bind(realized)
        .bind(position.id)
        .execute(&self.pool)
        .await
        .context("Failed to close position")?;

        Ok(Some(realized))
    }

    pub async fn total_realized_pnl(&self) -> Result<f64> {
        let (total,): (f64,) =
            sqlx::query_as("SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions WHERE status = 'closed'")
                .fetch_one(&self.pool)
                .await?;
        Ok(total)
    }

    /// Realized P&L of positions closed since midnight UTC.
    pub async fn realized_pnl_today(&self) -> Result<f64> {
        let (total,): (f64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(realized_pnl), 0.0) FROM positions WHERE status = 'closed' AND closed_at >= date('now')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    // ==================== Signals ====================

    /// Store a single strategy's signal.
    pub async fn save_strategy_signal(&self, signal: &StrategySignal) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (
                symbol, direction, strength, confidence, price, strategy_count,
                contributing_strategies, method, status, generated_at
            ) VALUES (?, ?, ?, ?, ?, 1, ?, 'strategy', 'recorded', ?)
            RETURNING id
            "#,
        )
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(signal.strength)
        .bind(signal.confidence)
        .bind(money(signal.price))
        .bind(&signal.strategy)
        .bind(format_timestamp(signal.generated_at))
        .fetch_one(&self.pool)
        .await
        .context("Failed to save strategy signal")?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Store an aggregated decision as `pending`.
    pub async fn save_aggregated_signal(&self, signal: &AggregatedSignal) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO signals (
                symbol, direction, strength, confidence, price, strategy_count,
                contributing_strategies, method, status, generated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            RETURNING id
            "#,
        )
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(signal.strength)
        .bind(signal.confidence)
        .bind(money(signal.price))
        .bind(signal.contributing_strategies.len() as i64)
        .bind(signal.contributing_strategies.join(","))
        .bind(&signal.method)
        .bind(format_timestamp(signal.generated_at))
        .fetch_one(&self.pool)
        .await
        .context("Failed to save aggregated signal")?;

        Ok(sqlx::Row::get(&result, "id"))
    }

    /// Set a signal's status (`executed`, `rejected`, `expired`).
    pub async fn update_signal_status(&self, id: i64, status: &str, reason: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE signals SET status = ?, reason = COALESCE(?, reason) WHERE id = ?")
            .bind(status)
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Expire pending signals older than `minutes`. Returns the count.
    pub async fn expire_pending_signals(&self, minutes: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE signals SET status = 'expired' WHERE status = 'pending' AND generated_at < datetime('now', ?)",
        )
        .bind(format!("-{} minutes", minutes))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Signals generated in the last `hours`, newest first.
    pub async fn recent_signals(&self, hours: i64, limit: i64) -> Result<Vec<StoredSignal>> {
        sqlx::query_as::<_, StoredSignal>(
            r#"
            SELECT * FROM signals
            WHERE generated_at >= datetime('now', ?)
            ORDER BY generated_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(format!("-{} hours", hours))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch signals")
    }

    // ==================== Portfolio Snapshots ====================

    pub async fn record_snapshot(&self, summary: &PortfolioSummary, daily_pnl: Decimal) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO portfolio_snapshots (
                portfolio_value, cash, buying_power, positions_value,
                unrealized_pnl, realized_pnl, positions_count, daily_pnl
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(money(summary.account_value))
        .bind(money(summary.cash))
        .bind(money(summary.buying_power))
        .bind(money(summary.positions_value))
        .bind(money(summary.unrealized_pnl))
        .bind(money(summary.realized_pnl))
        .bind(summary.positions_count as i64)
        .bind(money(daily_pnl))
        .execute(&self.pool)
        .await
        .context("Failed to record portfolio snapshot")?;

        Ok(())
    }

    pub async fn recent_snapshots(&self, limit: i64) -> Result<Vec<StoredSnapshot>> {
        sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM portfolio_snapshots ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch snapshots")
    }

    /// First snapshot taken today (UTC), the baseline for daily P&L.
    pub async fn first_snapshot_today(&self) -> Result<Option<StoredSnapshot>> {
        sqlx::query_as::<_, StoredSnapshot>(
            "SELECT * FROM portfolio_snapshots WHERE timestamp >= date('now') ORDER BY timestamp ASC, id ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch snapshot")
    }

    // ==================== System Logs ====================

    pub async fn log_event(&self, level: &str, component: &str, message: &str, details: Option<&Value>) -> Result<()> {
        sqlx::query("INSERT INTO system_logs (level, component, message, details) VALUES (?, ?, ?, ?)")
            .bind(level)
            .bind(component)
            .bind(message)
            .bind(details.map(Value::to_string))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent_logs(&self, limit: i64) -> Result<Vec<SystemLogEntry>> {
        sqlx::query_as::<_, SystemLogEntry>("SELECT * FROM system_logs ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch system logs")
    }
}
