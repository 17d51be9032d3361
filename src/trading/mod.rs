//! Trading pipeline stages: screening, scoring, strategies, news sentiment,
//! aggregation, risk, execution and position monitoring.

mod aggregator;
mod executor;
pub mod indicators;
mod monitor;
mod news;
mod risk;
mod scorer;
mod screener;
mod strategies;

pub use aggregator::{signal_statistics, AggregationConfig, AggregationMethod, SignalAggregator, SignalStatistics};
pub use executor::{ExecutionConfig, ExecutionMetrics, ExecutionResult, OrderExecutor, ValidationReport};
pub use monitor::{
    summarize, AlertKind, AlertThresholds, ExitConditions, ExitReason, ExitSignal, ExitUrgency, MonitorSummary,
    MonitoredPosition, PositionAlert, PositionMonitor,
};
pub use news::{NewsAnalyzer, NewsConfig, NEWS_STRATEGY};
pub use risk::{RiskCheckResult, RiskLimits, RiskManager, RiskMetrics};
pub use scorer::{FactorWeights, StockScore, StockScorer};
pub use screener::{screen_snapshots, ScreenResult, ScreeningCriteria, ScreeningStatistics, StockScreener};
pub use strategies::{
    create_strategy, Strategy, StrategyDefinition, StrategyEngine, StrategyInfo, StrategyKind,
};
