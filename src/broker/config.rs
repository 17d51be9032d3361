//! Broker directory discovery and layered broker configuration.
//!
//! A broker lives in `<root>/<name>/` and is picked up when the directory
//! holds both `config.yaml` (broker-local defaults) and `adapter.yaml`
//! (the adapter declaration). Effective settings are built in three layers:
//! local defaults, then the global `brokers.<name>` block from the main
//! config, then environment variables.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::{BrokerError, BrokerResult};

/// Raw broker settings bag.
pub type Settings = Map<String, Value>;

const CONFIG_FILE: &str = "config.yaml";
const ADAPTER_FILE: &str = "adapter.yaml";
const SKIPPED_DIRS: [&str; 2] = ["base", "common"];

/// A broker directory found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBroker {
    pub name: String,
    pub path: PathBuf,
    pub adapter: String,
}

/// Adapter name derived from a broker directory name.
///
/// `alpaca` -> `AlpacaBrokerAdapter`, `demo_broker` -> `DemoBrokerAdapter`.
pub fn adapter_name_for(broker: &str) -> String {
    let pascal: String = broker
        .split(|c: char| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(|c| c.to_lowercase())).collect(),
                None => String::new(),
            }
        })
        .collect();

    if pascal.ends_with("Broker") {
        format!("{}Adapter", pascal)
    } else {
        format!("{}BrokerAdapter", pascal)
    }
}

/// Credential field prefix for a broker (`demo_broker` -> `demo`).
pub fn credential_prefix(broker: &str) -> &str {
    broker.strip_suffix("_broker").unwrap_or(broker)
}

/// Read and check the adapter declaration of a broker directory.
pub fn read_adapter_declaration(dir: &Path, broker: &str) -> BrokerResult<String> {
    let expected = adapter_name_for(broker);
    let path = dir.join(ADAPTER_FILE);
    let content = fs::read_to_string(&path).map_err(|e| {
        BrokerError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
    })?;

    if content.trim().is_empty() {
        return Ok(expected);
    }

    let doc: Value = serde_yaml::from_str(&content).map_err(|e| {
        BrokerError::InvalidConfig(format!("Invalid YAML in {}: {}", path.display(), e))
    })?;

    match doc.get("adapter").and_then(Value::as_str) {
        None => Ok(expected),
        Some(declared) if declared == expected => Ok(expected),
        Some(declared) => Err(BrokerError::InvalidConfig(format!(
            "Broker '{}' declares adapter '{}' but the naming convention requires '{}'",
            broker, declared, expected
        ))),
    }
}

/// Scan `root` for broker directories, sorted by name.
pub fn discover_brokers(root: &Path) -> Vec<DiscoveredBroker> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Broker directory not readable");
            return Vec::new();
        }
    };

    let mut found: Vec<DiscoveredBroker> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            if SKIPPED_DIRS.contains(&name.as_str()) || name.starts_with('_') || name.starts_with('.') {
                return None;
            }

            let path = entry.path();
            if !path.join(CONFIG_FILE).is_file() || !path.join(ADAPTER_FILE).is_file() {
                debug!(broker = %name, "Skipping directory without config and adapter files");
                return None;
            }

            match read_adapter_declaration(&path, &name) {
                Ok(adapter) => Some(DiscoveredBroker { name, path, adapter }),
                Err(e) => {
                    warn!(broker = %name, error = %e, "Ignoring broker directory");
                    None
                }
            }
        })
        .collect();

    found.sort_by(|a, b| a.name.cmp(&b.name));
    found
}

/// Load `<root>/<broker>/config.yaml` as a settings map.
pub fn load_broker_config(root: &Path, broker: &str) -> BrokerResult<Settings> {
    let dir = root.join(broker);
    if !dir.is_dir() {
        return Err(BrokerError::InvalidConfig(format!(
            "Broker directory not found: {}",
            dir.display()
        )));
    }

    let path = dir.join(CONFIG_FILE);
    let content = fs::read_to_string(&path).map_err(|e| {
        BrokerError::InvalidConfig(format!("Cannot read {}: {}", path.display(), e))
    })?;

    parse_settings(&content).map_err(|e| {
        BrokerError::InvalidConfig(format!("{} in {}", e, path.display()))
    })
}

/// Parse a YAML document that must be a mapping.
pub fn parse_settings(content: &str) -> Result<Settings, String> {
    let doc: Value = serde_yaml::from_str(content).map_err(|e| format!("Invalid YAML: {}", e))?;
    match doc {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Settings::new()),
        _ => Err("Broker configuration must be a mapping".to_string()),
    }
}

/// Overlay global settings on broker-local defaults.
pub fn merge_with_global(mut local: Settings, global: &Settings, broker: &str) -> Settings {
    let prefix = credential_prefix(broker).to_string();

    for (key, value) in global {
        match key.as_str() {
            "name" => continue,
            "env_vars" => {
                let merged = match (local.remove("env_vars"), value) {
                    (Some(Value::Object(mut base)), Value::Object(overlay)) => {
                        for (k, v) in overlay {
                            base.insert(k.clone(), v.clone());
                        }
                        Value::Object(base)
                    }
                    (_, overlay) => overlay.clone(),
                };
                local.insert("env_vars".to_string(), merged);
            }
            "api_key" | "secret_key" => {
                local.insert(format!("{}_{}", prefix, key), value.clone());
                local.insert(key.clone(), value.clone());
            }
            _ => {
                local.insert(key.clone(), value.clone());
            }
        }
    }

    local
}

/// Substitute environment values. `env_vars` entries first, then `${VAR}`
/// placeholders in every string.
pub fn apply_env<F>(settings: &mut Settings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mappings: Vec<(String, String)> = settings
        .get("env_vars")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(field, var)| var.as_str().map(|v| (field.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    for (field, var) in mappings {
        if let Some(value) = lookup(&var).filter(|v| !v.is_empty()) {
            settings.insert(field, Value::String(value));
        }
    }

    for (key, value) in settings.iter_mut() {
        if key != "env_vars" {
            substitute_value(value, &lookup);
        }
    }
}

fn substitute_value<F>(value: &mut Value, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) if s.contains("${") => *s = substitute_placeholders(s, lookup),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_value(v, lookup)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_value(v, lookup)),
        _ => {}
    }
}

/// Expand `${VAR}` and `${VAR:-default}`. Unset variables without a default
/// expand to the empty string.
pub fn substitute_placeholders<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let expr = &after[..end];
        let (var, default) = match expr.split_once(":-") {
            Some((var, default)) => (var, Some(default)),
            None => (expr, None),
        };

        match lookup(var.trim()).filter(|v| !v.is_empty()) {
            Some(value) => out.push_str(&value),
            None => out.push_str(default.unwrap_or("")),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

/// Values that count as not configured.
pub fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || (v.starts_with("your_") && v.ends_with("_here"))
}

/// Required fields with their accepted aliases.
pub fn required_fields(broker: &str) -> Vec<(String, Vec<String>)> {
    let prefix = credential_prefix(broker);
    vec![
        (
            format!("{}_api_key", prefix),
            vec!["api_key".to_string()],
        ),
        (
            format!("{}_secret_key", prefix),
            vec!["secret_key".to_string(), "api_secret".to_string()],
        ),
        ("base_url".to_string(), vec![]),
    ]
}

/// List the required fields that are missing or unset.
pub fn missing_fields(broker: &str, settings: &Settings) -> Vec<String> {
    required_fields(broker)
        .into_iter()
        .filter(|(field, aliases)| {
            !std::iter::once(field)
                .chain(aliases.iter())
                .any(|key| has_value(settings, key))
        })
        .map(|(field, _)| field)
        .collect()
}

/// Fail on the first missing required field.
pub fn validate_broker_config(broker: &str, settings: &Settings) -> BrokerResult<()> {
    match missing_fields(broker, settings).into_iter().next() {
        Some(field) => Err(BrokerError::MissingConfigField {
            broker: broker.to_string(),
            field,
        }),
        None => Ok(()),
    }
}

fn has_value(settings: &Settings, key: &str) -> bool {
    match settings.get(key) {
        Some(Value::String(s)) => !is_placeholder(s),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Effective, fully resolved settings for one broker.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub name: String,
    pub values: Settings,
}

impl BrokerSettings {
    pub fn new(name: impl Into<String>, values: Settings) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    /// Build from disk, global overrides and the process environment.
    pub fn resolve(root: &Path, broker: &str, global: Option<&Settings>) -> BrokerResult<Self> {
        Self::resolve_with(root, broker, global, |var| std::env::var(var).ok())
    }

    /// Same as [`resolve`](Self::resolve) with an injectable environment.
    pub fn resolve_with<F>(
        root: &Path,
        broker: &str,
        global: Option<&Settings>,
        lookup: F,
    ) -> BrokerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let local = load_broker_config(root, broker)?;
        let mut values = match global {
            Some(global) => merge_with_global(local, global, broker),
            None => local,
        };
        apply_env(&mut values, lookup);
        Ok(Self::new(broker, values))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(Value::as_str)
            .filter(|v| !is_placeholder(v))
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// First configured value among `keys`.
    pub fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|k| self.get_str(k)).map(str::to_string)
    }

    /// API key, accepting the broker-prefixed or generic field.
    pub fn api_key(&self) -> Option<String> {
        let prefixed = format!("{}_api_key", credential_prefix(&self.name));
        self.first_of(&[prefixed.as_str(), "api_key"])
    }

    /// API secret, accepting the broker-prefixed or generic fields.
    pub fn secret_key(&self) -> Option<String> {
        let prefixed = format!("{}_secret_key", credential_prefix(&self.name));
        self.first_of(&[prefixed.as_str(), "secret_key", "api_secret"])
    }

    /// Environment variables this broker reads, from `env_vars`.
    pub fn env_var_names(&self) -> BTreeSet<String> {
        self.values
            .get("env_vars")
            .and_then(Value::as_object)
            .map(|m| m.values().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> BrokerResult<()> {
        validate_broker_config(&self.name, &self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn settings(value: Value) -> Settings {
        value.as_object().cloned().unwrap()
    }

    fn write_broker(root: &Path, name: &str, config: &str, adapter: Option<&str>) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(CONFIG_FILE), config).unwrap();
        if let Some(adapter) = adapter {
            fs::write(dir.join(ADAPTER_FILE), adapter).unwrap();
        }
    }

    #[test]
    fn test_adapter_naming_convention() {
        assert_eq!(adapter_name_for("alpaca"), "AlpacaBrokerAdapter");
        assert_eq!(adapter_name_for("demo_broker"), "DemoBrokerAdapter");
        assert_eq!(adapter_name_for("interactive_brokers"), "InteractiveBrokersBrokerAdapter");
        assert_eq!(credential_prefix("demo_broker"), "demo");
        assert_eq!(credential_prefix("alpaca"), "alpaca");
    }

    #[test]
    fn test_discovery_requires_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        write_broker(root, "alpaca", "base_url: x\n", Some(""));
        write_broker(root, "demo_broker", "base_url: y\n", Some("adapter: DemoBrokerAdapter\n"));
        write_broker(root, "half", "base_url: z\n", None);
        write_broker(root, "base", "x: 1\n", Some(""));
        write_broker(root, "__pycache__", "x: 1\n", Some(""));
        write_broker(root, "wrong", "x: 1\n", Some("adapter: SomethingElse\n"));

        let found = discover_brokers(root);
        let names: Vec<_> = found.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["alpaca", "demo_broker"]);
        assert_eq!(found[0].adapter, "AlpacaBrokerAdapter");
    }

    #[test]
    fn test_discovery_missing_root_is_empty() {
        let found = discover_brokers(Path::new("/definitely/not/here"));
        assert!(found.is_empty());
    }

    #[test]
    fn test_load_broker_config_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let err = load_broker_config(tmp.path(), "ghost").unwrap_err();
        assert!(matches!(err, BrokerError::InvalidConfig(_)));

        write_broker(tmp.path(), "listy", "- a\n- b\n", Some(""));
        let err = load_broker_config(tmp.path(), "listy").unwrap_err();
        assert!(err.to_string().contains("mapping"));
    }

    #[test]
    fn test_merge_global_overrides_except_name() {
        let local = settings(json!({
            "name": "alpaca",
            "paper_trading": true,
            "base_url": "https://paper-api.alpaca.markets",
            "env_vars": {"alpaca_api_key": "ALPACA_API_KEY"}
        }));
        let global = settings(json!({
            "name": "renamed",
            "paper_trading": false,
            "api_key": "global-key",
            "env_vars": {"alpaca_secret_key": "ALPACA_SECRET_KEY"}
        }));

        let merged = merge_with_global(local, &global, "alpaca");
        assert_eq!(merged["name"], json!("alpaca"));
        assert_eq!(merged["paper_trading"], json!(false));
        assert_eq!(merged["alpaca_api_key"], json!("global-key"));
        assert_eq!(merged["api_key"], json!("global-key"));
        let env_vars = merged["env_vars"].as_object().unwrap();
        assert_eq!(env_vars.len(), 2);
    }

    #[test]
    fn test_env_substitution_runs_last() {
        let env: HashMap<&str, &str> = [("ALPACA_API_KEY", "from-env"), ("REGION", "us")]
            .into_iter()
            .collect();
        let lookup = |k: &str| env.get(k).map(|v| v.to_string());

        let mut values = settings(json!({
            "alpaca_api_key": "your_alpaca_api_key_here",
            "endpoint": "https://${REGION}.example.com/${MISSING:-v2}",
            "env_vars": {"alpaca_api_key": "ALPACA_API_KEY", "alpaca_secret_key": "ALPACA_SECRET_KEY"}
        }));
        apply_env(&mut values, lookup);

        assert_eq!(values["alpaca_api_key"], json!("from-env"));
        assert_eq!(values["endpoint"], json!("https://us.example.com/v2"));
        assert!(values.get("alpaca_secret_key").is_none());
    }

    #[test]
    fn test_substitute_placeholders_edge_cases() {
        let lookup = |_: &str| None;
        assert_eq!(substitute_placeholders("plain", &lookup), "plain");
        assert_eq!(substitute_placeholders("${UNSET}", &lookup), "");
        assert_eq!(substitute_placeholders("broken ${OPEN", &lookup), "broken ${OPEN");
    }

    #[test]
    fn test_validation_reports_missing_fields() {
        let values = settings(json!({
            "alpaca_api_key": "key",
            "secret_key": "your_alpaca_secret_key_here",
            "base_url": "https://paper-api.alpaca.markets"
        }));
        let err = validate_broker_config("alpaca", &values).unwrap_err();
        match err {
            BrokerError::MissingConfigField { broker, field } => {
                assert_eq!(broker, "alpaca");
                assert_eq!(field, "alpaca_secret_key");
            }
            other => panic!("unexpected error: {other}"),
        }

        let ok = settings(json!({
            "api_key": "k",
            "api_secret": "s",
            "base_url": "https://demo-api.example.com"
        }));
        assert!(validate_broker_config("demo_broker", &ok).is_ok());
    }

    #[test]
    fn test_resolve_with_layers() {
        let tmp = tempfile::tempdir().unwrap();
        write_broker(
            tmp.path(),
            "demo_broker",
            "base_url: https://demo-api.example.com\ndemo_api_key: local\nenv_vars:\n  demo_secret_key: DEMO_SECRET\n",
            Some(""),
        );
        let global = settings(json!({"demo_api_key": "global"}));

        let resolved = BrokerSettings::resolve_with(tmp.path(), "demo_broker", Some(&global), |k| {
            (k == "DEMO_SECRET").then(|| "s3cret".to_string())
        })
        .unwrap();

        assert_eq!(resolved.api_key().as_deref(), Some("global"));
        assert_eq!(resolved.secret_key().as_deref(), Some("s3cret"));
        assert!(resolved.validate().is_ok());
        assert!(resolved.env_var_names().contains("DEMO_SECRET"));
    }
}
