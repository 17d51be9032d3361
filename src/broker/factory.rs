//! Broker factory: maps broker names to compiled-in adapter constructors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use super::config::{adapter_name_for, discover_brokers, load_broker_config, BrokerSettings, DiscoveredBroker, Settings};
use super::error::{BrokerError, BrokerResult};
use super::{AlpacaBrokerAdapter, BrokerAdapter, DemoBrokerAdapter};

/// Builds an adapter from resolved settings.
pub type AdapterConstructor = fn(&BrokerSettings) -> BrokerResult<Arc<dyn BrokerAdapter>>;

fn build_alpaca(settings: &BrokerSettings) -> BrokerResult<Arc<dyn BrokerAdapter>> {
    Ok(Arc::new(AlpacaBrokerAdapter::new(settings)?))
}

fn build_demo(settings: &BrokerSettings) -> BrokerResult<Arc<dyn BrokerAdapter>> {
    Ok(Arc::new(DemoBrokerAdapter::new(settings)?))
}

/// Where the active broker choice came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveBrokerSource {
    Environment,
    Config,
    FirstEnabled,
    FirstAvailable,
}

impl fmt::Display for ActiveBrokerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActiveBrokerSource::Environment => "ACTIVE_BROKER environment variable",
            ActiveBrokerSource::Config => "brokers.active in config",
            ActiveBrokerSource::FirstEnabled => "first enabled broker",
            ActiveBrokerSource::FirstAvailable => "first available broker",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveBroker {
    pub name: String,
    pub source: ActiveBrokerSource,
}

/// Registry of adapters keyed by adapter name, plus the broker directory root.
pub struct BrokerFactory {
    root: PathBuf,
    /// adapter name -> (broker name, constructor)
    registry: BTreeMap<String, (String, AdapterConstructor)>,
}

impl BrokerFactory {
    /// Factory with every adapter this binary ships.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut factory = Self::empty(root);
        factory.register("alpaca", build_alpaca);
        factory.register("demo_broker", build_demo);
        factory
    }

    /// Factory with no adapters registered.
    pub fn empty(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a constructor for the broker directory `broker`.
    pub fn register(&mut self, broker: &str, constructor: AdapterConstructor) {
        self.registry
            .insert(adapter_name_for(broker), (broker.to_string(), constructor));
    }

    /// Broker names with a compiled-in adapter.
    pub fn supported_brokers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.values().map(|(name, _)| name.clone()).collect();
        names.sort();
        names
    }

    pub fn is_compiled_in(&self, broker: &str) -> bool {
        self.registry.contains_key(&adapter_name_for(broker))
    }

    /// Broker directories found under the root.
    pub fn discover(&self) -> Vec<DiscoveredBroker> {
        discover_brokers(&self.root)
    }

    /// Discovered broker names, sorted.
    pub fn available_brokers(&self) -> Vec<String> {
        self.discover().into_iter().map(|b| b.name).collect()
    }

    fn unsupported(&self, name: &str) -> BrokerError {
        let mut names: BTreeSet<String> = self.available_brokers().into_iter().collect();
        if names.is_empty() {
            names.extend(self.supported_brokers());
        }
        BrokerError::UnsupportedBroker {
            name: name.to_string(),
            available: names.into_iter().collect(),
        }
    }

    /// Fail with the list of available brokers unless `name` was discovered.
    pub fn ensure_available(&self, name: &str) -> BrokerResult<()> {
        if self.discover().iter().any(|b| b.name == name) {
            Ok(())
        } else {
            Err(self.unsupported(name))
        }
    }

    /// Resolve settings for `name` from disk, global overrides and the environment.
    pub fn settings_for(&self, name: &str, global: Option<&Settings>) -> BrokerResult<BrokerSettings> {
        self.ensure_available(name)?;
        BrokerSettings::resolve(&self.root, name, global)
    }

    /// Create the adapter for broker directory `name`.
    pub fn create(&self, name: &str, global: Option<&Settings>) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        let discovered = self.discover();
        let broker = discovered
            .iter()
            .find(|b| b.name == name)
            .ok_or_else(|| self.unsupported(name))?;

        let (_, constructor) = self
            .registry
            .get(&broker.adapter)
            .ok_or_else(|| BrokerError::AdapterUnavailable {
                broker: broker.name.clone(),
                adapter: broker.adapter.clone(),
            })?;

        let settings = BrokerSettings::resolve(&self.root, name, global)?;
        settings.validate()?;
        let adapter = constructor(&settings)?;
        info!(broker = %name, adapter = %broker.adapter, "Created broker adapter");
        Ok(adapter)
    }

    /// Create an adapter from already-resolved settings, skipping discovery.
    pub fn create_from_settings(&self, settings: &BrokerSettings) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        let (_, constructor) = self
            .registry
            .get(&adapter_name_for(&settings.name))
            .ok_or_else(|| self.unsupported(&settings.name))?;
        settings.validate()?;
        constructor(settings)
    }

    /// Whether a broker is enabled, by global override first, then its own config.
    pub fn is_enabled(&self, name: &str, overrides: &BTreeMap<String, Settings>) -> bool {
        if let Some(enabled) = overrides.get(name).and_then(|s| s.get("enabled")).and_then(Value::as_bool) {
            return enabled;
        }
        load_broker_config(&self.root, name)
            .ok()
            .and_then(|s| s.get("enabled").and_then(Value::as_bool))
            .unwrap_or(false)
    }

    /// Pick the broker to trade with.
    ///
    /// Order: the env value, the configured name, the first enabled broker,
    /// then the first available one.
    pub fn resolve_active(
        &self,
        env_value: Option<&str>,
        configured: Option<&str>,
        overrides: &BTreeMap<String, Settings>,
    ) -> BrokerResult<ActiveBroker> {
        let available = self.available_brokers();
        let pick = |name: &str, source| ActiveBroker {
            name: name.to_string(),
            source,
        };

        if let Some(name) = env_value.map(str::trim).filter(|n| !n.is_empty()) {
            if available.iter().any(|b| b == name) {
                return Ok(pick(name, ActiveBrokerSource::Environment));
            }
            warn!(broker = %name, "ACTIVE_BROKER names an unavailable broker, ignoring");
        }

        if let Some(name) = configured.map(str::trim).filter(|n| !n.is_empty()) {
            if available.iter().any(|b| b == name) {
                return Ok(pick(name, ActiveBrokerSource::Config));
            }
            warn!(broker = %name, "Configured active broker is not available, ignoring");
        }

        if let Some(name) = available.iter().find(|b| self.is_enabled(b.as_str(), overrides)) {
            return Ok(pick(name.as_str(), ActiveBrokerSource::FirstEnabled));
        }

        if let Some(name) = available.first() {
            return Ok(pick(name.as_str(), ActiveBrokerSource::FirstAvailable));
        }

        Err(BrokerError::InvalidConfig(format!(
            "No brokers available under {}",
            self.root.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn write_broker(root: &Path, name: &str, config: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.yaml"), config).unwrap();
        fs::write(dir.join("adapter.yaml"), "").unwrap();
    }

    const DEMO_CONFIG: &str = "enabled: true\nbase_url: https://demo-api.example.com\ndemo_api_key: k\ndemo_secret_key: s\n";

    #[test]
    fn test_unsupported_broker_lists_available() {
        let tmp = tempfile::tempdir().unwrap();
        write_broker(tmp.path(), "alpaca", "base_url: x\n");
        write_broker(tmp.path(), "demo_broker", DEMO_CONFIG);

        let factory = BrokerFactory::new(tmp.path());
        let err = match factory.create("robinhood", None) {
            Err(e) => e,
            Ok(_) => panic!("expected unsupported broker"),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported broker: robinhood. Available brokers: alpaca, demo_broker"
        );
    }

    #[test]
    fn test_discovered_but_not_compiled_in() {
        let tmp = tempfile::tempdir().unwrap();
        write_broker(tmp.path(), "tradier", "base_url: x\n");

        let factory = BrokerFactory::new(tmp.path());
        match factory.create("tradier", None) {
            Err(BrokerError::AdapterUnavailable { broker, adapter }) => {
                assert_eq!(broker, "tradier");
                assert_eq!(adapter, "TradierBrokerAdapter");
            }
            _ => panic!("expected adapter unavailable"),
        }
    }

    #[test]
    fn test_create_demo_and_missing_field() {
        let tmp = tempfile::tempdir().unwrap();
        write_broker(tmp.path(), "demo_broker", DEMO_CONFIG);
        write_broker(tmp.path(), "alpaca", "base_url: https://paper-api.alpaca.markets\nalpaca_api_key: k\n");

        let factory = BrokerFactory::new(tmp.path());
        let adapter = factory.create("demo_broker", None).unwrap();
        assert_eq!(adapter.broker_name(), "demo_broker");

        match factory.create("alpaca", None) {
            Err(BrokerError::MissingConfigField { field, .. }) => assert_eq!(field, "alpaca_secret_key"),
            _ => panic!("expected missing field"),
        }

        // A global override supplies the secret
        let global = json!({"secret_key": "s"}).as_object().cloned().unwrap();
        assert!(factory.create("alpaca", Some(&global)).is_ok());
    }

    #[test]
    fn test_supported_brokers() {
        let factory = BrokerFactory::new("unused");
        assert_eq!(
            factory.supported_brokers(),
            vec!["alpaca".to_string(), "demo_broker".to_string()]
        );
        assert!(factory.is_compiled_in("alpaca"));
        assert!(!factory.is_compiled_in("tradier"));
    }

    #[test]
    fn test_resolve_active_priority() {
        let tmp = tempfile::tempdir().unwrap();
        write_broker(tmp.path(), "alpaca", "enabled: false\nbase_url: x\n");
        write_broker(tmp.path(), "demo_broker", DEMO_CONFIG);
        let factory = BrokerFactory::new(tmp.path());
        let none = BTreeMap::new();

        let active = factory.resolve_active(Some("alpaca"), Some("demo_broker"), &none).unwrap();
        assert_eq!(active.source, ActiveBrokerSource::Environment);
        assert_eq!(active.name, "alpaca");

        let active = factory.resolve_active(Some("nope"), Some("alpaca"), &none).unwrap();
        assert_eq!(active.source, ActiveBrokerSource::Config);

        let active = factory.resolve_active(None, None, &none).unwrap();
        assert_eq!(active.source, ActiveBrokerSource::FirstEnabled);
        assert_eq!(active.name, "demo_broker");

        let mut overrides = BTreeMap::new();
        overrides.insert(
            "demo_broker".to_string(),
            json!({"enabled": false}).as_object().cloned().unwrap(),
        );
        let active = factory.resolve_active(None, None, &overrides).unwrap();
        assert_eq!(active.source, ActiveBrokerSource::FirstAvailable);
        assert_eq!(active.name, "alpaca");
    }

    #[test]
    fn test_resolve_active_without_brokers() {
        let tmp = tempfile::tempdir().unwrap();
        let factory = BrokerFactory::new(tmp.path());
        assert!(factory.resolve_active(None, None, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_shipped_broker_directory() {
        let factory = BrokerFactory::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("brokers"));
        assert_eq!(factory.available_brokers(), vec!["alpaca", "demo_broker"]);
        assert!(factory.is_compiled_in("alpaca"));
        assert!(factory.ensure_available("ibkr").is_err());

        let adapter = factory.create("demo_broker", None).unwrap();
        assert_eq!(adapter.broker_name(), "demo_broker");
    }
}
