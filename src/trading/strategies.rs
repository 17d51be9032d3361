//! Signal-generating strategies and the engine that runs them.
//!
//! Every strategy looks at the latest bar of a symbol's history and emits at
//! most one signal per run. Parameters come from the `strategies.definitions`
//! section of the config and are validated before a strategy is loaded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::broker::Bar;
use crate::models::{SignalDirection, StrategySignal};

use super::indicators::{atr, bollinger, closes, pct_change, rsi, sma};

/// Built-in strategy types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    MovingAverageCrossover,
    Rsi,
    Momentum,
    MeanReversion,
    Volatility,
    MultiFactor,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::MovingAverageCrossover => "moving_average_crossover",
            StrategyKind::Rsi => "rsi",
            StrategyKind::Momentum => "momentum",
            StrategyKind::MeanReversion => "mean_reversion",
            StrategyKind::Volatility => "volatility",
            StrategyKind::MultiFactor => "multi_factor",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "moving_average_crossover" => Ok(StrategyKind::MovingAverageCrossover),
            "rsi" => Ok(StrategyKind::Rsi),
            "momentum" => Ok(StrategyKind::Momentum),
            "mean_reversion" => Ok(StrategyKind::MeanReversion),
            "volatility" => Ok(StrategyKind::Volatility),
            "multi_factor" => Ok(StrategyKind::MultiFactor),
            other => bail!("Unknown strategy type: {}", other),
        }
    }
}

/// Name, switch and aggregation weight shared by every strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyMeta {
    pub name: String,
    pub enabled: bool,
    pub weight: f64,
}

impl StrategyMeta {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            weight: 1.0,
        }
    }
}

/// A signal generator over bar history.
pub trait Strategy: Send + Sync {
    fn meta(&self) -> &StrategyMeta;
    fn meta_mut(&mut self) -> &mut StrategyMeta;
    fn kind(&self) -> StrategyKind;

    /// Reject contradictory parameters.
    fn validate(&self) -> Result<()>;

    /// Evaluate the latest bar. Bars are oldest first.
    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal>;

    /// Parameters as JSON, for reporting.
    fn params(&self) -> Value;

    fn name(&self) -> &str {
        &self.meta().name
    }

    fn enabled(&self) -> bool {
        self.meta().enabled
    }

    fn weight(&self) -> f64 {
        self.meta().weight
    }
}

fn parse_params<T: DeserializeOwned>(kind: StrategyKind, params: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(params.clone()))
        .with_context(|| format!("Invalid parameters for {} strategy", kind))
}

fn signal(
    strategy: &dyn Strategy,
    symbol: &str,
    direction: SignalDirection,
    strength: f64,
    bars: &[Bar],
    now: DateTime<Utc>,
) -> Option<StrategySignal> {
    let last = bars.last()?;
    Some(StrategySignal::new(symbol, strategy.name(), direction, strength, last.close, now))
}

// ==================== Moving Average Crossover ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossoverParams {
    pub short_window: usize,
    pub long_window: usize,
}

impl Default for CrossoverParams {
    fn default() -> Self {
        Self {
            short_window: 10,
            long_window: 30,
        }
    }
}

pub struct MovingAverageCrossover {
    meta: StrategyMeta,
    params: CrossoverParams,
}

impl MovingAverageCrossover {
    pub fn new(name: &str, params: CrossoverParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }
}

impl Strategy for MovingAverageCrossover {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MovingAverageCrossover
    }

    fn validate(&self) -> Result<()> {
        if self.params.short_window == 0 {
            bail!("short_window must be at least 1");
        }
        if self.params.short_window >= self.params.long_window {
            bail!(
                "short_window ({}) must be less than long_window ({})",
                self.params.short_window,
                self.params.long_window
            );
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let p = &self.params;
        if values.len() < p.long_window + 1 {
            return Vec::new();
        }

        let prev = &values[..values.len() - 1];
        let (Some(prev_short), Some(prev_long), Some(short), Some(long)) = (
            sma(prev, p.short_window),
            sma(prev, p.long_window),
            sma(&values, p.short_window),
            sma(&values, p.long_window),
        ) else {
            return Vec::new();
        };

        let direction = if prev_short <= prev_long && short > long {
            SignalDirection::Buy
        } else if prev_short >= prev_long && short < long {
            SignalDirection::Sell
        } else {
            return Vec::new();
        };

        signal(self, symbol, direction, 0.8, bars, now)
            .map(|s| s.with_metadata("short_ma", short).with_metadata("long_ma", long))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== RSI ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiParams {
    pub period: usize,
    pub oversold: f64,
    pub overbought: f64,
}

impl Default for RsiParams {
    fn default() -> Self {
        Self {
            period: 14,
            oversold: 30.0,
            overbought: 70.0,
        }
    }
}

pub struct RsiStrategy {
    meta: StrategyMeta,
    params: RsiParams,
}

impl RsiStrategy {
    pub fn new(name: &str, params: RsiParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }
}

impl Strategy for RsiStrategy {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Rsi
    }

    fn validate(&self) -> Result<()> {
        let p = &self.params;
        if p.period == 0 {
            bail!("period must be at least 1");
        }
        if p.oversold >= p.overbought {
            bail!(
                "oversold ({}) must be below overbought ({})",
                p.oversold,
                p.overbought
            );
        }
        if p.oversold < 0.0 || p.overbought > 100.0 {
            bail!("thresholds must lie within 0..=100");
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let p = &self.params;
        if values.len() < p.period + 2 {
            return Vec::new();
        }

        let (Some(prev), Some(current)) = (rsi(&values[..values.len() - 1], p.period), rsi(&values, p.period))
        else {
            return Vec::new();
        };

        let (direction, strength) = if prev < p.oversold && current >= p.oversold {
            (SignalDirection::Buy, ((p.oversold - prev) / 10.0).min(1.0))
        } else if prev > p.overbought && current <= p.overbought {
            (SignalDirection::Sell, ((prev - p.overbought) / 10.0).min(1.0))
        } else {
            return Vec::new();
        };

        signal(self, symbol, direction, strength.max(0.1), bars, now)
            .map(|s| s.with_metadata("rsi", current).with_metadata("previous_rsi", prev))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== Momentum ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MomentumParams {
    pub lookback: usize,
    /// Fractional change, 0.05 = 5%
    pub threshold: f64,
}

impl Default for MomentumParams {
    fn default() -> Self {
        Self {
            lookback: 20,
            threshold: 0.05,
        }
    }
}

pub struct MomentumStrategy {
    meta: StrategyMeta,
    params: MomentumParams,
}

impl MomentumStrategy {
    pub fn new(name: &str, params: MomentumParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }
}

impl Strategy for MomentumStrategy {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Momentum
    }

    fn validate(&self) -> Result<()> {
        if self.params.lookback == 0 {
            bail!("lookback must be at least 1");
        }
        if self.params.threshold <= 0.0 {
            bail!("threshold must be positive");
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let p = &self.params;
        let Some(momentum) = pct_change(&values, p.lookback) else {
            return Vec::new();
        };

        let direction = if momentum > p.threshold {
            SignalDirection::Buy
        } else if momentum < -p.threshold {
            SignalDirection::Sell
        } else {
            return Vec::new();
        };

        let strength = (momentum.abs() / (p.threshold * 2.0)).min(1.0);
        signal(self, symbol, direction, strength, bars, now)
            .map(|s| s.with_metadata("momentum", momentum))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== Mean Reversion ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeanReversionParams {
    pub window: usize,
    pub num_std: f64,
}

impl Default for MeanReversionParams {
    fn default() -> Self {
        Self {
            window: 20,
            num_std: 2.0,
        }
    }
}

pub struct MeanReversionStrategy {
    meta: StrategyMeta,
    params: MeanReversionParams,
}

impl MeanReversionStrategy {
    pub fn new(name: &str, params: MeanReversionParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }
}

impl Strategy for MeanReversionStrategy {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MeanReversion
    }

    fn validate(&self) -> Result<()> {
        if self.params.window < 2 {
            bail!("window must be at least 2");
        }
        if self.params.num_std <= 0.0 {
            bail!("num_std must be positive");
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let p = &self.params;
        let (Some(bands), Some(close)) = (bollinger(&values, p.window, p.num_std), values.last().copied()) else {
            return Vec::new();
        };
        if bands.std_dev <= 0.0 {
            return Vec::new();
        }

        let direction = if close < bands.lower {
            SignalDirection::Buy
        } else if close > bands.upper {
            SignalDirection::Sell
        } else {
            return Vec::new();
        };

        let z = (close - bands.middle) / bands.std_dev;
        let strength = (z.abs() - p.num_std + 0.5).min(1.0);
        signal(self, symbol, direction, strength, bars, now)
            .map(|s| s.with_metadata("z_score", z).with_metadata("middle_band", bands.middle))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== Volatility Breakout ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityParams {
    pub atr_period: usize,
    pub lookback: usize,
    pub multiplier: f64,
}

impl Default for VolatilityParams {
    fn default() -> Self {
        Self {
            atr_period: 14,
            lookback: 20,
            multiplier: 1.0,
        }
    }
}

pub struct VolatilityStrategy {
    meta: StrategyMeta,
    params: VolatilityParams,
}

impl VolatilityStrategy {
    pub fn new(name: &str, params: VolatilityParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }
}

impl Strategy for VolatilityStrategy {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::Volatility
    }

    fn validate(&self) -> Result<()> {
        if self.params.atr_period == 0 || self.params.lookback == 0 {
            bail!("atr_period and lookback must be at least 1");
        }
        if self.params.multiplier < 0.0 {
            bail!("multiplier must not be negative");
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let p = &self.params;
        if values.len() < p.lookback + 1 {
            return Vec::new();
        }
        let Some(range) = atr(bars, p.atr_period).filter(|r| *r > 0.0) else {
            return Vec::new();
        };

        let close = values[values.len() - 1];
        let prior = &values[values.len() - 1 - p.lookback..values.len() - 1];
        let highest = prior.iter().copied().fold(f64::MIN, f64::max);
        let lowest = prior.iter().copied().fold(f64::MAX, f64::min);
        let band = p.multiplier * range;

        let (direction, excess) = if close > highest + band {
            (SignalDirection::Buy, close - highest - band)
        } else if close < lowest - band {
            (SignalDirection::Sell, lowest - band - close)
        } else {
            return Vec::new();
        };

        let strength = (excess / range).min(1.0);
        signal(self, symbol, direction, strength, bars, now)
            .map(|s| s.with_metadata("atr", range))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== Multi Factor ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiFactorParams {
    pub short_window: usize,
    pub long_window: usize,
    pub rsi_period: usize,
    pub momentum_lookback: usize,
    pub momentum_threshold: f64,
    pub entry_threshold: f64,
}

impl Default for MultiFactorParams {
    fn default() -> Self {
        Self {
            short_window: 10,
            long_window: 30,
            rsi_period: 14,
            momentum_lookback: 20,
            momentum_threshold: 0.05,
            entry_threshold: 0.3,
        }
    }
}

pub struct MultiFactorStrategy {
    meta: StrategyMeta,
    params: MultiFactorParams,
}

impl MultiFactorStrategy {
    pub fn new(name: &str, params: MultiFactorParams) -> Self {
        Self {
            meta: StrategyMeta::new(name),
            params,
        }
    }

    /// Composite of trend, RSI and momentum sub-scores in [-1, 1].
    pub fn composite(&self, values: &[f64]) -> Option<f64> {
        let p = &self.params;
        let trend = match sma(values, p.short_window)?.partial_cmp(&sma(values, p.long_window)?)? {
            std::cmp::Ordering::Greater => 1.0,
            std::cmp::Ordering::Less => -1.0,
            std::cmp::Ordering::Equal => 0.0,
        };
        let rsi_score = (50.0 - rsi(values, p.rsi_period)?) / 50.0;
        let momentum = (pct_change(values, p.momentum_lookback)? / p.momentum_threshold).clamp(-1.0, 1.0);
        Some(((trend + rsi_score + momentum) / 3.0).clamp(-1.0, 1.0))
    }
}

impl Strategy for MultiFactorStrategy {
    fn meta(&self) -> &StrategyMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StrategyMeta {
        &mut self.meta
    }

    fn kind(&self) -> StrategyKind {
        StrategyKind::MultiFactor
    }

    fn validate(&self) -> Result<()> {
        let p = &self.params;
        if p.short_window == 0 || p.short_window >= p.long_window {
            bail!(
                "short_window ({}) must be between 1 and long_window ({})",
                p.short_window,
                p.long_window
            );
        }
        if p.rsi_period == 0 || p.momentum_lookback == 0 {
            bail!("rsi_period and momentum_lookback must be at least 1");
        }
        if p.momentum_threshold <= 0.0 {
            bail!("momentum_threshold must be positive");
        }
        if !(0.0..1.0).contains(&p.entry_threshold) {
            bail!("entry_threshold must be in [0, 1)");
        }
        Ok(())
    }

    fn generate(&self, symbol: &str, bars: &[Bar], now: DateTime<Utc>) -> Vec<StrategySignal> {
        let values = closes(bars);
        let Some(composite) = self.composite(&values) else {
            return Vec::new();
        };

        let threshold = self.params.entry_threshold;
        let direction = if composite > threshold {
            SignalDirection::Buy
        } else if composite < -threshold {
            SignalDirection::Sell
        } else {
            return Vec::new();
        };

        signal(self, symbol, direction, composite.abs(), bars, now)
            .map(|s| s.with_metadata("composite", composite))
            .into_iter()
            .collect()
    }

    fn params(&self) -> Value {
        json!(self.params)
    }
}

// ==================== Definitions ====================

/// One entry of `strategies.definitions` in the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

impl StrategyDefinition {
    fn builtin(kind: StrategyKind, weight: f64) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind: kind.as_str().to_string(),
            enabled: true,
            weight,
            params: Map::new(),
        }
    }

    /// One of each built-in strategy with default parameters.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::builtin(StrategyKind::MovingAverageCrossover, 1.0),
            Self::builtin(StrategyKind::Rsi, 1.0),
            Self::builtin(StrategyKind::Momentum, 1.0),
            Self::builtin(StrategyKind::MeanReversion, 1.0),
            Self::builtin(StrategyKind::Volatility, 0.8),
            Self::builtin(StrategyKind::MultiFactor, 1.2),
        ]
    }

    /// Instantiate without validating parameters.
    pub fn build(&self) -> Result<Box<dyn Strategy>> {
        let mut strategy = create_strategy(&self.kind, &self.name, &self.params)?;
        let meta = strategy.meta_mut();
        meta.enabled = self.enabled;
        meta.weight = self.weight;
        Ok(strategy)
    }
}

/// Instantiate a strategy by type name.
pub fn create_strategy(kind: &str, name: &str, params: &Map<String, Value>) -> Result<Box<dyn Strategy>> {
    let kind: StrategyKind = kind.parse()?;
    let strategy: Box<dyn Strategy> = match kind {
        StrategyKind::MovingAverageCrossover => Box::new(MovingAverageCrossover::new(name, parse_params(kind, params)?)),
        StrategyKind::Rsi => Box::new(RsiStrategy::new(name, parse_params(kind, params)?)),
        StrategyKind::Momentum => Box::new(MomentumStrategy::new(name, parse_params(kind, params)?)),
        StrategyKind::MeanReversion => Box::new(MeanReversionStrategy::new(name, parse_params(kind, params)?)),
        StrategyKind::Volatility => Box::new(VolatilityStrategy::new(name, parse_params(kind, params)?)),
        StrategyKind::MultiFactor => Box::new(MultiFactorStrategy::new(name, parse_params(kind, params)?)),
    };
    Ok(strategy)
}

// ==================== Engine ====================

/// Summary of a loaded strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub kind: StrategyKind,
    pub enabled: bool,
    pub weight: f64,
    pub params: Value,
}

/// Holds the loaded strategies and runs them over market data.
#[derive(Default)]
pub struct StrategyEngine {
    strategies: BTreeMap<String, Box<dyn Strategy>>,
}

impl StrategyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine loaded from config definitions. Invalid entries are skipped.
    pub fn from_definitions(definitions: &[StrategyDefinition]) -> Self {
        let mut engine = Self::new();
        engine.load_from_config(definitions);
        engine
    }

    pub fn load_strategy(&mut self, strategy: Box<dyn Strategy>) {
        let name = strategy.name().to_string();
        if self.strategies.contains_key(&name) {
            warn!(strategy = %name, "Replacing already loaded strategy");
        }
        info!(strategy = %name, kind = %strategy.kind(), "Loaded strategy");
        self.strategies.insert(name, strategy);
    }

    pub fn remove_strategy(&mut self, name: &str) -> bool {
        let removed = self.strategies.remove(name).is_some();
        if removed {
            info!(strategy = %name, "Removed strategy");
        }
        removed
    }

    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<()> {
        let strategy = self
            .strategies
            .get_mut(name)
            .ok_or_else(|| anyhow!("Strategy {} not found", name))?;
        strategy.meta_mut().enabled = enabled;
        info!(strategy = %name, enabled = enabled, "Strategy toggled");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn strategy_info(&self) -> Vec<StrategyInfo> {
        self.strategies
            .values()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                kind: s.kind(),
                enabled: s.enabled(),
                weight: s.weight(),
                params: s.params(),
            })
            .collect()
    }

    /// Strategy name to weight for the aggregator.
    pub fn weights(&self) -> BTreeMap<String, f64> {
        self.strategies
            .values()
            .map(|s| (s.name().to_string(), s.weight()))
            .collect()
    }

    /// Build and validate a strategy from its type name and parameters.
    pub fn create_from_config(kind: &str, name: &str, params: &Map<String, Value>) -> Result<Box<dyn Strategy>> {
        let strategy = create_strategy(kind, name, params)?;
        strategy.validate()?;
        Ok(strategy)
    }

    /// Load every definition, logging and skipping the ones that fail.
    pub fn load_from_config(&mut self, definitions: &[StrategyDefinition]) -> usize {
        let mut loaded = 0;
        for definition in definitions {
            match definition.build().and_then(|s| s.validate().map(|_| s)) {
                Ok(strategy) => {
                    self.load_strategy(strategy);
                    loaded += 1;
                }
                Err(e) => warn!(strategy = %definition.name, error = %e, "Skipping strategy"),
            }
        }
        loaded
    }

    /// Run every enabled strategy over every symbol.
    ///
    /// Returns signals keyed by strategy name. Strategies with no signals
    /// still get an (empty) entry.
    pub fn run_all(&self, data: &HashMap<String, Vec<Bar>>, now: DateTime<Utc>) -> HashMap<String, Vec<StrategySignal>> {
        let mut symbols: Vec<&String> = data.keys().collect();
        symbols.sort();

        let mut results = HashMap::new();
        for strategy in self.strategies.values().filter(|s| s.enabled()) {
            let signals: Vec<StrategySignal> = symbols
                .iter()
                .flat_map(|symbol| strategy.generate(symbol, &data[*symbol], now))
                .collect();
            debug!(strategy = %strategy.name(), signals = signals.len(), "Strategy run");
            results.insert(strategy.name().to_string(), signals);
        }
        results
    }

    /// Run a single strategy by name, enabled or not.
    pub fn run_strategy(
        &self,
        name: &str,
        data: &HashMap<String, Vec<Bar>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StrategySignal>> {
        let strategy = self
            .strategies
            .get(name)
            .ok_or_else(|| anyhow!("Strategy {} not found", name))?;

        let mut symbols: Vec<&String> = data.keys().collect();
        symbols.sort();
        Ok(symbols
            .into_iter()
            .flat_map(|symbol| strategy.generate(symbol, &data[symbol], now))
            .collect())
    }
}
