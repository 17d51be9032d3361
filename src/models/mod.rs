//! Data models for signals, market snapshots and portfolio views.

mod market;
mod portfolio;
mod signal;

pub use market::MarketSnapshot;
pub use portfolio::{PortfolioSummary, PositionView};
pub use signal::{AggregatedSignal, SignalDirection, StrategySignal};
