//! Combine per-strategy signals into one decision per symbol.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{AggregatedSignal, SignalDirection, StrategySignal};

/// Required score gap between buy and sell sides before one wins.
const CONFLICT_MARGIN: f64 = 0.1;

/// Signal count at which weighted-average confidence stops growing.
const FULL_CONFIDENCE_SIGNALS: f64 = 5.0;

/// `strategies.aggregation` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub method: String,
    pub min_strategies: usize,
    pub lookback_minutes: i64,
    pub min_strength: f64,
    pub min_confidence: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            method: AggregationMethod::WeightedAverage.as_str().to_string(),
            min_strategies: 1,
            lookback_minutes: 60,
            min_strength: 0.6,
            min_confidence: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMethod {
    WeightedAverage,
    MajorityVote,
    StrongestSignal,
    Consensus,
}

impl AggregationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMethod::WeightedAverage => "weighted_average",
            AggregationMethod::MajorityVote => "majority_vote",
            AggregationMethod::StrongestSignal => "strongest_signal",
            AggregationMethod::Consensus => "consensus",
        }
    }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_average" => Ok(AggregationMethod::WeightedAverage),
            "majority_vote" => Ok(AggregationMethod::MajorityVote),
            "strongest_signal" => Ok(AggregationMethod::StrongestSignal),
            "consensus" => Ok(AggregationMethod::Consensus),
            other => bail!("Unknown aggregation method: {}", other),
        }
    }
}

/// Result of combining one side (all buys or all sells) of a symbol.
#[derive(Debug, Clone)]
struct SideResult {
    direction: SignalDirection,
    strength: f64,
    confidence: f64,
    price: Decimal,
    count: usize,
}

impl SideResult {
    fn score(&self) -> f64 {
        self.strength * self.confidence
    }
}

fn mean_price<'a>(signals: impl Iterator<Item = &'a StrategySignal>) -> Decimal {
    let prices: Vec<Decimal> = signals.map(|s| s.price).filter(|p| !p.is_zero()).collect();
    if prices.is_empty() {
        return Decimal::ZERO;
    }
    prices.iter().sum::<Decimal>() / Decimal::from(prices.len())
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// Merges strategy signals using a configured method and strategy weights.
pub struct SignalAggregator {
    method: AggregationMethod,
    min_strategies: usize,
    lookback: Duration,
    min_strength: f64,
    min_confidence: f64,
    weights: BTreeMap<String, f64>,
}

impl SignalAggregator {
    pub fn new(config: &AggregationConfig, weights: BTreeMap<String, f64>) -> Result<Self> {
        Ok(Self {
            method: config.method.parse()?,
            min_strategies: config.min_strategies,
            lookback: Duration::minutes(config.lookback_minutes),
            min_strength: config.min_strength,
            min_confidence: config.min_confidence,
            weights,
        })
    }

    pub fn method(&self) -> AggregationMethod {
        self.method
    }

    fn weight(&self, strategy: &str) -> f64 {
        self.weights.get(strategy).copied().unwrap_or(1.0)
    }

    /// Combine one side's signals. All inputs share a direction.
    fn combine(&self, signals: &[&StrategySignal]) -> Option<SideResult> {
        let first = signals.first()?;
        let direction = first.direction;

        match self.method {
            AggregationMethod::WeightedAverage => {
                let total_weight: f64 = signals.iter().map(|s| self.weight(&s.strategy)).sum();
                if total_weight <= 0.0 {
                    return None;
                }
                let strength = signals
                    .iter()
                    .map(|s| self.weight(&s.strategy) * s.strength)
                    .sum::<f64>()
                    / total_weight;
                let confidence = signals
                    .iter()
                    .map(|s| self.weight(&s.strategy) * s.confidence)
                    .sum::<f64>()
                    / total_weight;
                let breadth = (signals.len() as f64 / FULL_CONFIDENCE_SIGNALS).min(1.0);
                Some(SideResult {
                    direction,
                    strength,
                    confidence: confidence * breadth,
                    price: mean_price(signals.iter().copied()),
                    count: signals.len(),
                })
            }
            AggregationMethod::MajorityVote => {
                let mut votes: BTreeMap<SignalDirection, usize> = BTreeMap::new();
                for s in signals {
                    *votes.entry(s.direction).or_default() += 1;
                }
                let max_votes = votes.values().copied().max()?;
                let winners: Vec<SignalDirection> = votes
                    .iter()
                    .filter(|(_, n)| **n == max_votes)
                    .map(|(d, _)| *d)
                    .collect();
                if winners.len() > 1 {
                    return None;
                }
                let winner = winners[0];
                let majority: Vec<&StrategySignal> =
                    signals.iter().copied().filter(|s| s.direction == winner).collect();
                Some(SideResult {
                    direction: winner,
                    strength: mean(majority.iter().map(|s| s.strength)),
                    confidence: max_votes as f64 / signals.len() as f64,
                    price: mean_price(majority.iter().copied()),
                    count: max_votes,
                })
            }
            AggregationMethod::StrongestSignal => {
                let strongest = signals.iter().max_by(|a, b| a.strength.total_cmp(&b.strength))?;
                Some(SideResult {
                    direction: strongest.direction,
                    strength: strongest.strength,
                    confidence: strongest.strength,
                    price: strongest.price,
                    count: 1,
                })
            }
            AggregationMethod::Consensus => {
                if signals.iter().any(|s| s.direction != direction) {
                    return None;
                }
                Some(SideResult {
                    direction,
                    strength: mean(signals.iter().map(|s| s.strength)),
                    confidence: 1.0,
                    price: mean_price(signals.iter().copied()),
                    count: signals.len(),
                })
            }
        }
    }

    /// Aggregate recent signals into at most one decision per symbol.
    ///
    /// Signals older than the lookback window are ignored. When both sides
    /// are present and their scores are within the conflict margin, the
    /// result is a hold.
    pub fn aggregate(&self, signals: &[StrategySignal], now: DateTime<Utc>) -> Vec<AggregatedSignal> {
        let cutoff = now - self.lookback;
        let mut by_symbol: BTreeMap<&str, Vec<&StrategySignal>> = BTreeMap::new();
        for signal in signals.iter().filter(|s| s.generated_at >= cutoff) {
            by_symbol.entry(signal.symbol.as_str()).or_default().push(signal);
        }

        let mut aggregated = Vec::new();
        for (symbol, symbol_signals) in by_symbol {
            let strategies: BTreeSet<&str> = symbol_signals.iter().map(|s| s.strategy.as_str()).collect();
            if strategies.len() < self.min_strategies {
                debug!(
                    symbol = %symbol,
                    strategies = strategies.len(),
                    min = self.min_strategies,
                    "Not enough strategies, skipping"
                );
                continue;
            }

            let buys: Vec<&StrategySignal> = symbol_signals
                .iter()
                .copied()
                .filter(|s| s.direction == SignalDirection::Buy)
                .collect();
            let sells: Vec<&StrategySignal> = symbol_signals
                .iter()
                .copied()
                .filter(|s| s.direction == SignalDirection::Sell)
                .collect();

            let (resolved, method) = match (self.combine(&buys), self.combine(&sells)) {
                (None, None) => continue,
                (Some(side), None) | (None, Some(side)) => (side, self.method.as_str()),
                (Some(buy), Some(sell)) => {
                    if buy.score() > sell.score() + CONFLICT_MARGIN {
                        (buy, self.method.as_str())
                    } else if sell.score() > buy.score() + CONFLICT_MARGIN {
                        (sell, self.method.as_str())
                    } else {
                        debug!(symbol = %symbol, buy = buy.score(), sell = sell.score(), "Buy/sell conflict");
                        let hold = SideResult {
                            direction: SignalDirection::Hold,
                            strength: 0.5,
                            confidence: 0.5,
                            price: (buy.price + sell.price) / Decimal::from(2),
                            count: buy.count + sell.count,
                        };
                        (hold, "conflict_resolution")
                    }
                }
            };

            aggregated.push(AggregatedSignal {
                symbol: symbol.to_string(),
                direction: resolved.direction,
                strength: resolved.strength,
                confidence: resolved.confidence,
                price: resolved.price,
                contributing_strategies: strategies.into_iter().map(String::from).collect(),
                signal_count: symbol_signals.len(),
                method: method.to_string(),
                generated_at: now,
            });
        }

        info!(
            symbols = aggregated.len(),
            method = %self.method,
            "Aggregated signals"
        );
        aggregated
    }

    /// Drop holds and weak signals, strongest first.
    pub fn filter_actionable(&self, signals: Vec<AggregatedSignal>) -> Vec<AggregatedSignal> {
        let mut actionable: Vec<AggregatedSignal> = signals
            .into_iter()
            .filter(|s| {
                s.direction != SignalDirection::Hold
                    && s.strength >= self.min_strength
                    && s.confidence >= self.min_confidence
            })
            .collect();
        actionable.sort_by(|a, b| b.score().total_cmp(&a.score()));
        actionable
    }
}

/// Counts over a window of strategy signals.
#[derive(Debug, Clone, Serialize)]
pub struct SignalStatistics {
    pub total_signals: usize,
    pub period_days: i64,
    pub by_direction: BTreeMap<String, usize>,
    pub by_strategy: BTreeMap<String, usize>,
    /// Top 10 by count
    pub most_active_symbols: Vec<(String, usize)>,
    pub average_per_day: f64,
}

pub fn signal_statistics(signals: &[StrategySignal], days: i64, now: DateTime<Utc>) -> SignalStatistics {
    let cutoff = now - Duration::days(days);
    let recent: Vec<&StrategySignal> = signals.iter().filter(|s| s.generated_at >= cutoff).collect();

    let mut by_direction = BTreeMap::new();
    let mut by_strategy = BTreeMap::new();
    let mut by_symbol: HashMap<&str, usize> = HashMap::new();
    for s in &recent {
        *by_direction.entry(s.direction.to_string()).or_insert(0) += 1;
        *by_strategy.entry(s.strategy.clone()).or_insert(0) += 1;
        *by_symbol.entry(s.symbol.as_str()).or_insert(0) += 1;
    }

    let mut most_active: Vec<(String, usize)> = by_symbol.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    most_active.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    most_active.truncate(10);

    SignalStatistics {
        total_signals: recent.len(),
        period_days: days,
        by_direction,
        by_strategy,
        most_active_symbols: most_active,
        average_per_day: if days > 0 { recent.len() as f64 / days as f64 } else { 0.0 },
    }
}
