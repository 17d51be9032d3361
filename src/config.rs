//! Application configuration loaded from `config.yaml`.
//!
//! Every section has defaults, so a partial (or missing) file is valid.
//! Loading order: parse YAML, expand `${VAR}` placeholders, deserialize,
//! then apply `DATABASE_URL` / `LOG_LEVEL` / `ACTIVE_BROKER` overrides.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::broker::config::substitute_placeholders;
use crate::broker::Settings;
use crate::trading::{
    AggregationConfig, AggregationMethod, AlertThresholds, ExecutionConfig, ExitConditions,
    FactorWeights, NewsConfig, RiskLimits, ScreeningCriteria, StrategyDefinition, NEWS_STRATEGY,
};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required configuration field: {0}")]
    MissingField(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub database: DatabaseConfig,
    pub brokers: BrokersConfig,
    pub trading: TradingSection,
    pub strategies: StrategiesConfig,
    pub news: NewsConfig,
    pub screening: ScreeningConfig,
    pub scoring: ScoringConfig,
    pub risk: RiskConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub alerts: AlertsConfig,
    pub data_updates: DataUpdatesConfig,
    pub base_symbols: BaseSymbols,
}

// ==================== Sections ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub environment: String,
    /// REST API bind host
    pub host: String,
    pub port: u16,
    /// Simulate fills instead of sending orders
    pub dry_run: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "autotrader".to_string(),
            environment: "development".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:trading.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// `brokers:` section. Any key other than `active` / `directory` is a
/// per-broker override block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokersConfig {
    pub active: Option<String>,
    pub directory: String,
    #[serde(flatten)]
    pub entries: BTreeMap<String, Value>,
}

impl Default for BrokersConfig {
    fn default() -> Self {
        Self {
            active: None,
            directory: "brokers".to_string(),
            entries: BTreeMap::new(),
        }
    }
}

impl BrokersConfig {
    /// Per-broker override blocks that are mappings.
    pub fn overrides(&self) -> BTreeMap<String, Settings> {
        self.entries
            .iter()
            .filter_map(|(name, value)| value.as_object().map(|m| (name.clone(), m.clone())))
            .collect()
    }

    pub fn override_for(&self, broker: &str) -> Option<Settings> {
        self.entries.get(broker).and_then(Value::as_object).cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingSection {
    pub max_positions: usize,
    /// Fraction of portfolio per position (0, 1]
    pub position_size_percent: Decimal,
    /// Absolute daily loss cap in account currency
    pub max_daily_loss: Decimal,
    pub enable_automated_screening: bool,
    pub max_screened_symbols: usize,
    pub loop_interval_secs: u64,
    pub closed_market_sleep_secs: u64,
    pub error_sleep_secs: u64,
    pub bar_timeframe: String,
    pub bar_limit: usize,
    pub execution: ExecutionConfig,
}

impl Default for TradingSection {
    fn default() -> Self {
        Self {
            max_positions: 10,
            position_size_percent: dec!(0.02),
            max_daily_loss: dec!(1000),
            enable_automated_screening: true,
            max_screened_symbols: 50,
            loop_interval_secs: 30,
            closed_market_sleep_secs: 60,
            error_sleep_secs: 60,
            bar_timeframe: "1Day".to_string(),
            bar_limit: 100,
            execution: ExecutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub aggregation: AggregationConfig,
    pub definitions: Vec<StrategyDefinition>,
}

impl Default for StrategiesConfig {
    fn default() -> Self {
        Self {
            aggregation: AggregationConfig::default(),
            definitions: StrategyDefinition::defaults(),
        }
    }
}

impl StrategiesConfig {
    /// Strategy name to aggregation weight.
    pub fn weights(&self) -> BTreeMap<String, f64> {
        self.definitions
            .iter()
            .map(|d| (d.name.clone(), d.weight))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    pub enabled: bool,
    /// Extra symbols screened on top of `base_symbols`
    pub universe: Vec<String>,
    #[serde(flatten)]
    pub criteria: ScreeningCriteria,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            universe: Vec::new(),
            criteria: ScreeningCriteria::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: FactorWeights,
    pub top_n: usize,
    pub min_score_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: FactorWeights::default(),
            top_n: 30,
            min_score_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    #[serde(flatten)]
    pub limits: RiskLimits,
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    /// Symbol to sector, for the sector exposure check
    pub sectors: BTreeMap<String, String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            limits: RiskLimits::default(),
            stop_loss_percent: dec!(0.03),
            take_profit_percent: dec!(0.08),
            sectors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub exit: ExitConditions,
    pub alerts: AlertThresholds,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exit: ExitConditions::default(),
            alerts: AlertThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `compact`
    pub format: String,
    pub with_target: bool,
    /// Mirror notable events into system_logs
    pub persist: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            with_target: false,
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    /// `info`, `warning` or `critical`
    pub min_level: String,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            webhook_url: None,
            min_level: "warning".to_string(),
        }
    }
}

/// Task cadences in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataUpdatesConfig {
    pub screening_interval_secs: u64,
    pub market_data_interval_secs: u64,
    pub strategy_interval_secs: u64,
    pub monitoring_interval_secs: u64,
    pub snapshot_interval_secs: u64,
    pub news_interval_secs: u64,
}

impl Default for DataUpdatesConfig {
    fn default() -> Self {
        Self {
            screening_interval_secs: 3600,
            market_data_interval_secs: 300,
            strategy_interval_secs: 600,
            monitoring_interval_secs: 300,
            snapshot_interval_secs: 300,
            news_interval_secs: 1800,
        }
    }
}

/// Always-tracked symbols.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BaseSymbols(pub Vec<String>);

impl Default for BaseSymbols {
    fn default() -> Self {
        Self(
            ["AAPL", "GOOGL", "MSFT", "AMZN", "TSLA", "META", "NVDA", "NFLX", "SPY", "QQQ"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

// ==================== Loading ====================

impl AppConfig {
    /// Load from `path`, expanding placeholders and applying env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_with(&content, |var| std::env::var(var).ok())?;
        config.apply_env_overrides(|var| std::env::var(var).ok());
        Ok(config)
    }

    /// Load from `path`, or fall back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }
        warn!(path = %path.display(), "Config file not found, using defaults");
        let mut config = Self::default();
        config.apply_env_overrides(|var| std::env::var(var).ok());
        Ok(config)
    }

    /// Parse YAML text, expanding `${VAR}` placeholders through `lookup`.
    pub fn from_yaml_with<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut doc: serde_yaml::Value = serde_yaml::from_str(content)?;
        if doc.is_null() {
            return Ok(Self::default());
        }
        expand_placeholders(&mut doc, &lookup);
        Ok(serde_yaml::from_value(doc)?)
    }

    /// Apply `DATABASE_URL`, `LOG_LEVEL` and `ACTIVE_BROKER`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        if let Some(url) = get("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(broker) = get("ACTIVE_BROKER") {
            self.brokers.active = Some(broker);
        }
    }

    /// Reject contradictory or out-of-range settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::MissingField("database.url".to_string()));
        }
        if self.brokers.directory.trim().is_empty() {
            return Err(ConfigError::MissingField("brokers.directory".to_string()));
        }

        self.scoring
            .weights
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        for definition in &self.strategies.definitions {
            definition
                .build()
                .and_then(|s| s.validate())
                .map_err(|e| ConfigError::Invalid(format!("strategy '{}': {}", definition.name, e)))?;
        }

        self.strategies
            .aggregation
            .method
            .parse::<AggregationMethod>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.trading.max_positions == 0 {
            return Err(ConfigError::Invalid("trading.max_positions must be at least 1".to_string()));
        }
        if !in_unit_range(self.trading.position_size_percent) {
            return Err(ConfigError::Invalid(format!(
                "trading.position_size_percent must be in (0, 1], got {}",
                self.trading.position_size_percent
            )));
        }

        for (name, value) in self.risk.limits.fractions() {
            if !in_unit_range(value) {
                return Err(ConfigError::Invalid(format!(
                    "risk.{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.risk.limits.max_positions == 0 {
            return Err(ConfigError::Invalid("risk.max_positions must be at least 1".to_string()));
        }

        let criteria = &self.screening.criteria;
        if criteria.min_price > criteria.max_price {
            return Err(ConfigError::Invalid(format!(
                "screening.min_price ({}) exceeds max_price ({})",
                criteria.min_price, criteria.max_price
            )));
        }
        if criteria.min_daily_change > criteria.max_daily_change {
            return Err(ConfigError::Invalid(format!(
                "screening.min_daily_change ({}) exceeds max_daily_change ({})",
                criteria.min_daily_change, criteria.max_daily_change
            )));
        }

        let news = &self.news;
        if news.lookback_hours <= 0 || news.article_limit == 0 {
            return Err(ConfigError::Invalid(
                "news.lookback_hours and news.article_limit must be positive".to_string(),
            ));
        }
        if news.weight < 0.0 || !(0.0..=1.0).contains(&news.min_confidence) {
            return Err(ConfigError::Invalid(format!(
                "news.weight must be non-negative and news.min_confidence in [0, 1], got {} and {}",
                news.weight, news.min_confidence
            )));
        }
        if self.strategies.definitions.iter().any(|d| d.name == NEWS_STRATEGY) {
            return Err(ConfigError::Invalid(format!(
                "strategy name '{}' is reserved for news signals",
                NEWS_STRATEGY
            )));
        }

        if !matches!(self.alerts.min_level.as_str(), "info" | "warning" | "critical") {
            return Err(ConfigError::Invalid(format!(
                "alerts.min_level must be info, warning or critical, got '{}'",
                self.alerts.min_level
            )));
        }

        Ok(())
    }

    /// Aggregation weight per strategy name, news included when enabled.
    pub fn aggregation_weights(&self) -> BTreeMap<String, f64> {
        let mut weights = self.strategies.weights();
        if self.news.enabled {
            weights.insert(NEWS_STRATEGY.to_string(), self.news.weight);
        }
        weights
    }

    /// Symbols screened each pass: base symbols followed by the extra universe.
    pub fn screening_universe(&self) -> Vec<String> {
        let mut symbols = self.base_symbols.0.clone();
        for symbol in &self.screening.universe {
            let symbol = symbol.to_uppercase();
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        symbols
    }
}

// ==================== Env File ====================

/// Set `key=value` in a dotenv file, replacing an existing assignment or
/// appending one. The file is created when missing.
pub fn set_env_file_var(path: &Path, key: &str, value: &str) -> std::io::Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let assignment = format!("{}={}", key, value);
    let mut replaced = false;
    let mut lines: Vec<String> = content
        .lines()
        .filter_map(|line| {
            let assigns_key = line
                .trim_start()
                .trim_start_matches("export ")
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
            match (assigns_key, replaced) {
                (false, _) => Some(line.to_string()),
                (true, false) => {
                    replaced = true;
                    Some(assignment.clone())
                }
                // Later duplicates are dropped
                (true, true) => None,
            }
        })
        .collect();

    if !replaced {
        lines.push(assignment);
    }

    let mut out = lines.join("\n");
    out.push('\n');
    fs::write(path, out)
}

fn in_unit_range(value: Decimal) -> bool {
    value > Decimal::ZERO && value <= Decimal::ONE
}

fn expand_placeholders<F>(value: &mut serde_yaml::Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        serde_yaml::Value::String(s) if s.contains("${") => {
            let expanded = substitute_placeholders(s, lookup);
            // A value that was only a placeholder takes the type of its expansion
            let whole = s.trim().starts_with("${") && s.trim().ends_with('}');
            *value = match serde_yaml::from_str::<serde_yaml::Value>(&expanded) {
                Ok(typed) if whole && !typed.is_mapping() && !typed.is_sequence() => typed,
                _ => serde_yaml::Value::String(expanded),
            };
        }
        serde_yaml::Value::Sequence(items) => items.iter_mut().for_each(|v| expand_placeholders(v, lookup)),
        serde_yaml::Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| expand_placeholders(v, lookup)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.base_symbols.0.len(), 10);
        assert_eq!(config.trading.max_positions, 10);
        assert_eq!(config.scoring.top_n, 30);
        assert_eq!(config.strategies.definitions.len(), 6);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
app:
  port: 9000
trading:
  max_positions: 5
base_symbols: [AAPL, MSFT]
"#;
        let config = AppConfig::from_yaml_with(yaml, no_env).unwrap();
        assert_eq!(config.app.port, 9000);
        assert_eq!(config.app.host, "0.0.0.0");
        assert_eq!(config.trading.max_positions, 5);
        assert_eq!(config.trading.position_size_percent, dec!(0.02));
        assert_eq!(config.base_symbols.0, vec!["AAPL", "MSFT"]);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = AppConfig::from_yaml_with("", no_env).unwrap();
        assert_eq!(config.database.url, DatabaseConfig::default().url);
    }

    #[test]
    fn test_placeholders_and_broker_blocks() {
        let env: HashMap<&str, &str> = [("API_PORT", "8081"), ("HOOK", "https://hooks.example.com/x")]
            .into_iter()
            .collect();
        let yaml = r#"
app:
  port: ${API_PORT}
alerts:
  webhook_url: ${HOOK}
brokers:
  active: alpaca
  directory: brokers
  alpaca:
    enabled: true
    paper_trading: true
    env_vars:
      alpaca_api_key: ALPACA_API_KEY
database:
  url: ${DB_URL:-sqlite::memory:}
"#;
        let config = AppConfig::from_yaml_with(yaml, |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.app.port, 8081);
        assert_eq!(config.alerts.webhook_url.as_deref(), Some("https://hooks.example.com/x"));
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.brokers.active.as_deref(), Some("alpaca"));

        let overrides = config.brokers.overrides();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["alpaca"]["enabled"], Value::Bool(true));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|k| match k {
            "DATABASE_URL" => Some("sqlite::memory:".to_string()),
            "LOG_LEVEL" => Some("DEBUG".to_string()),
            "ACTIVE_BROKER" => Some("demo_broker".to_string()),
            _ => None,
        });
        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.brokers.active.as_deref(), Some("demo_broker"));
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        let mut config = AppConfig::default();
        config.scoring.weights.momentum = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let mut config = AppConfig::default();
        config.trading.position_size_percent = dec!(1.5);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.screening.criteria.min_price = 2000.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.trading.max_positions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.risk.limits.max_daily_loss = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.strategies.aggregation.method = "median".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown aggregation method: median"));
    }

    #[test]
    fn test_validate_rejects_bad_strategy_params() {
        let yaml = r#"
strategies:
  definitions:
    - name: ma
      type: moving_average_crossover
      params:
        short_window: 30
        long_window: 10
"#;
        let config = AppConfig::from_yaml_with(yaml, no_env).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("strategy 'ma'"));
    }

    #[test]
    fn test_news_weight_joins_aggregation() {
        let mut config = AppConfig::default();
        assert_eq!(config.data_updates.news_interval_secs, 1800);
        assert_eq!(config.aggregation_weights()[NEWS_STRATEGY], 0.1);
        assert_eq!(config.aggregation_weights()["multi_factor"], 1.2);

        config.news.enabled = false;
        assert!(!config.aggregation_weights().contains_key(NEWS_STRATEGY));

        config.news.min_confidence = 1.5;
        assert!(config.validate().unwrap_err().to_string().contains("news.min_confidence"));
    }

    #[test]
    fn test_news_strategy_name_is_reserved() {
        let yaml = r#"
strategies:
  definitions:
    - name: news_sentiment
      type: rsi
"#;
        let config = AppConfig::from_yaml_with(yaml, no_env).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("reserved"));
    }

    #[test]
    fn test_missing_database_url() {
        let mut config = AppConfig::default();
        config.database.url = String::new();
        assert!(matches!(config.validate(), Err(ConfigError::MissingField(_))));
    }

    #[test]
    fn test_screening_universe_dedupes() {
        let mut config = AppConfig::default();
        config.base_symbols = BaseSymbols(vec!["AAPL".to_string()]);
        config.screening.universe = vec!["aapl".to_string(), "amd".to_string()];
        assert_eq!(config.screening_universe(), vec!["AAPL", "AMD"]);
    }

    #[test]
    fn test_set_env_file_var_replaces_and_appends() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(".env");

        set_env_file_var(&path, "ACTIVE_BROKER", "demo_broker").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "ACTIVE_BROKER=demo_broker\n");

        fs::write(&path, "# brokers\nALPACA_API_KEY=abc\nACTIVE_BROKER=demo_broker\n").unwrap();
        set_env_file_var(&path, "ACTIVE_BROKER", "alpaca").unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# brokers\nALPACA_API_KEY=abc\nACTIVE_BROKER=alpaca\n"
        );
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = AppConfig::from_yaml_with(include_str!("../config.yaml"), no_env).unwrap();
        config.validate().unwrap();
        assert_eq!(config.brokers.active.as_deref(), Some("demo_broker"));
        assert_eq!(config.strategies.definitions.len(), 6);
        assert!(config.alerts.webhook_url.is_none());
        assert!(config.brokers.override_for("alpaca").is_some());
        assert!(config.news.enabled);
        assert_eq!(config.news.min_articles, 3);
    }
}
