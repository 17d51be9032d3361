//! Portfolio views served by the orchestrator and the REST API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::{AccountInfo, Position};

/// One open position as reported to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub symbol: String,
    pub quantity: Decimal,
    pub side: String,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pl: Decimal,
    pub unrealized_pl_percent: Decimal,
    /// Share of portfolio value, 0 to 100
    pub portfolio_percentage: Decimal,
}

impl PositionView {
    pub fn from_position(position: &Position, portfolio_value: Decimal) -> Self {
        let portfolio_percentage = if portfolio_value > Decimal::ZERO {
            (position.market_value.abs() / portfolio_value * Decimal::ONE_HUNDRED).round_dp(2)
        } else {
            Decimal::ZERO
        };

        Self {
            symbol: position.symbol.clone(),
            quantity: position.quantity,
            side: position.side.as_str().to_string(),
            entry_price: position.entry_price,
            current_price: position.current_price,
            market_value: position.market_value,
            unrealized_pl: position.unrealized_pl,
            unrealized_pl_percent: position.unrealized_pl_percent,
            portfolio_percentage,
        }
    }
}

/// Account and positions rolled up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub account_value: Decimal,
    pub cash: Decimal,
    pub buying_power: Decimal,
    pub positions_count: usize,
    pub positions_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub day_trade_count: i64,
    pub positions: Vec<PositionView>,
}

impl PortfolioSummary {
    pub fn build(account: &AccountInfo, positions: &[Position], realized_pnl: Decimal) -> Self {
        Self {
            account_value: account.portfolio_value,
            cash: account.cash,
            buying_power: account.buying_power,
            positions_count: positions.len(),
            positions_value: positions.iter().map(|p| p.market_value).sum(),
            unrealized_pnl: positions.iter().map(|p| p.unrealized_pl).sum(),
            realized_pnl,
            day_trade_count: account.day_trade_count,
            positions: positions
                .iter()
                .map(|p| PositionView::from_position(p, account.portfolio_value))
                .collect(),
        }
    }
}
