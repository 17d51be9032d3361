//! Operator alerts: logged, persisted to `system_logs`, and optionally
//! forwarded to a webhook.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::AlertsConfig;
use crate::db::Database;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "info" => Ok(AlertLevel::Info),
            "warning" | "warn" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => bail!("Unknown alert level: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    pub details: Option<Value>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            component: component.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Delivers alerts. Delivery failures are logged and swallowed.
pub struct AlertSink {
    config: AlertsConfig,
    min_level: AlertLevel,
    client: Client,
    db: Option<Database>,
}

impl AlertSink {
    pub fn new(config: AlertsConfig, db: Option<Database>) -> Result<Self> {
        let min_level = config.min_level.parse()?;
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            config,
            min_level,
            client,
            db,
        })
    }

    fn webhook_url(&self) -> Option<&str> {
        if !self.config.enabled {
            return None;
        }
        self.config
            .webhook_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub async fn send(&self, alert: Alert) {
        match alert.level {
            AlertLevel::Info => info!(component = %alert.component, "{}", alert.message),
            AlertLevel::Warning => warn!(component = %alert.component, "{}", alert.message),
            AlertLevel::Critical => error!(component = %alert.component, "{}", alert.message),
        }

        if let Some(db) = &self.db {
            if let Err(e) = db
                .log_event(alert.level.as_str(), &alert.component, &alert.message, alert.details.as_ref())
                .await
            {
                warn!(error = %e, "Failed to persist alert");
            }
        }

        if alert.level < self.min_level {
            return;
        }
        let Some(url) = self.webhook_url() else {
            return;
        };

        let payload = json!({
            "level": alert.level,
            "component": alert.component,
            "message": alert.message,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(status = %resp.status(), "Alert webhook rejected alert"),
            Err(e) => warn!(error = %e, "Alert webhook delivery failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Option<String>, min_level: &str) -> AlertsConfig {
        AlertsConfig {
            enabled: true,
            webhook_url: url,
            min_level: min_level.to_string(),
        }
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Info);
        assert_eq!("WARN".parse::<AlertLevel>().unwrap(), AlertLevel::Warning);
        assert!("loud".parse::<AlertLevel>().is_err());
    }

    #[tokio::test]
    async fn test_webhook_respects_min_level() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(json!({
                "level": "critical",
                "component": "risk",
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/hook", server.url());
        let sink = AlertSink::new(config(Some(url), "warning"), None).unwrap();
        sink.send(Alert::new(AlertLevel::Info, "risk", "below threshold")).await;
        sink.send(Alert::new(AlertLevel::Critical, "risk", "daily loss limit hit")).await;

        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_webhook_failure_is_not_fatal() {
        let mut server = mockito::Server::new_async().await;
        let hook = server.mock("POST", "/hook").with_status(500).create_async().await;

        let db = Database::in_memory().await.unwrap();
        let url = format!("{}/hook", server.url());
        let sink = AlertSink::new(config(Some(url), "info"), Some(db.clone())).unwrap();
        sink.send(
            Alert::new(AlertLevel::Warning, "monitor", "AAPL near stop loss")
                .with_details(json!({"symbol": "AAPL"})),
        )
        .await;

        hook.assert_async().await;
        let logs = db.recent_logs(5).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, "warning");
        assert_eq!(logs[0].message, "AAPL near stop loss");
    }

    #[tokio::test]
    async fn test_disabled_skips_webhook() {
        let mut server = mockito::Server::new_async().await;
        let hook = server.mock("POST", "/hook").expect(0).create_async().await;

        let mut cfg = config(Some(format!("{}/hook", server.url())), "info");
        cfg.enabled = false;
        let sink = AlertSink::new(cfg, None).unwrap();
        sink.send(Alert::new(AlertLevel::Critical, "orchestrator", "stopped")).await;

        hook.assert_async().await;
    }

    #[test]
    fn test_invalid_min_level_rejected() {
        assert!(AlertSink::new(config(None, "loud"), None).is_err());
    }
}
