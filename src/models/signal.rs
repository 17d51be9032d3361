//! Trading signals produced by strategies and the aggregator.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::OrderSide;

/// Direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Buy,
    Sell,
    Hold,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Buy => "buy",
            SignalDirection::Sell => "sell",
            SignalDirection::Hold => "hold",
        }
    }

    /// Order side for actionable directions.
    pub fn order_side(&self) -> Option<OrderSide> {
        match self {
            SignalDirection::Buy => Some(OrderSide::Buy),
            SignalDirection::Sell => Some(OrderSide::Sell),
            SignalDirection::Hold => None,
        }
    }
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "buy" => Ok(SignalDirection::Buy),
            "sell" => Ok(SignalDirection::Sell),
            "hold" => Ok(SignalDirection::Hold),
            other => bail!("Invalid signal direction: {}", other),
        }
    }
}

/// Signal emitted by a single strategy for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySignal {
    pub symbol: String,

    /// Name of the strategy that produced it
    pub strategy: String,

    pub direction: SignalDirection,

    /// 0.0 to 1.0
    pub strength: f64,

    /// 0.0 to 1.0
    pub confidence: f64,

    /// Close price the signal was computed on
    pub price: Decimal,

    pub generated_at: DateTime<Utc>,

    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl StrategySignal {
    /// Build a signal with confidence equal to strength.
    pub fn new(
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        direction: SignalDirection,
        strength: f64,
        price: Decimal,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        Self {
            symbol: symbol.into(),
            strategy: strategy.into(),
            direction,
            strength,
            confidence: strength,
            price,
            generated_at,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Combined decision for one symbol across strategies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedSignal {
    pub symbol: String,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub price: Decimal,
    pub contributing_strategies: Vec<String>,
    pub signal_count: usize,
    /// Aggregation method name, or `conflict_resolution`
    pub method: String,
    pub generated_at: DateTime<Utc>,
}

impl AggregatedSignal {
    /// Ranking key for actionable signals.
    pub fn score(&self) -> f64 {
        self.strength * self.confidence
    }
}
