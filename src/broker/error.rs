//! Broker error taxonomy.

use thiserror::Error;

/// Errors raised by broker discovery, configuration and adapters.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// The requested broker has no directory or registered adapter.
    #[error("Unsupported broker: {name}. Available brokers: {}", format_names(.available))]
    UnsupportedBroker { name: String, available: Vec<String> },

    /// A field the adapter needs is absent, empty or still a placeholder.
    #[error("Missing required configuration field '{field}' for broker '{broker}'")]
    MissingConfigField { broker: String, field: String },

    /// The broker directory declares an adapter this binary does not provide.
    #[error("Failed to load adapter '{adapter}' for broker '{broker}': adapter is not available in this build")]
    AdapterUnavailable { broker: String, adapter: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Order error: {0}")]
    Order(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BrokerError {
    /// Whether retrying the same call can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BrokerError::Connection(_) | BrokerError::Data(_) | BrokerError::Http(_)
        )
    }
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}

/// Result alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_broker_lists_names() {
        let err = BrokerError::UnsupportedBroker {
            name: "ibkr".to_string(),
            available: vec!["alpaca".to_string(), "demo_broker".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Unsupported broker: ibkr"));
        assert!(msg.contains("alpaca, demo_broker"));
    }

    #[test]
    fn test_unsupported_broker_without_names() {
        let err = BrokerError::UnsupportedBroker {
            name: "x".to_string(),
            available: vec![],
        };
        assert!(err.to_string().ends_with("Available brokers: none"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::Connection("down".into()).is_transient());
        assert!(BrokerError::Data("503".into()).is_transient());
        assert!(!BrokerError::Order("rejected".into()).is_transient());
        assert!(!BrokerError::Authentication("bad key".into()).is_transient());
    }
}
