//! Stock screener: filters snapshots by price, volume and daily change, then
//! ranks the survivors.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::MarketSnapshot;

/// Filter thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningCriteria {
    pub min_price: f64,
    pub max_price: f64,
    pub min_volume: i64,
    /// Percent, e.g. -20.0
    pub min_daily_change: f64,
    pub max_daily_change: f64,
    pub max_results: usize,
    pub exclude_penny_stocks: bool,
}

impl Default for ScreeningCriteria {
    fn default() -> Self {
        Self {
            min_price: 5.0,
            max_price: 1000.0,
            min_volume: 100_000,
            min_daily_change: -20.0,
            max_daily_change: 20.0,
            max_results: 50,
            exclude_penny_stocks: true,
        }
    }
}

impl ScreeningCriteria {
    pub fn accepts(&self, s: &MarketSnapshot) -> bool {
        s.price >= self.min_price
            && s.price <= self.max_price
            && s.volume >= self.min_volume
            && s.daily_change_percent >= self.min_daily_change
            && s.daily_change_percent <= self.max_daily_change
            && (!self.exclude_penny_stocks || s.price >= 1.0)
    }

    /// Ranking score for a snapshot that passed the filters.
    pub fn score(&self, s: &MarketSnapshot) -> f64 {
        let min_volume = if self.min_volume > 0 { self.min_volume as f64 } else { 1.0 };
        let min_price = if self.min_price > 0.0 { self.min_price } else { 1.0 };

        let volume_score = (s.volume as f64 / min_volume).min(5.0);
        let change_score = s.daily_change_percent.abs() / 10.0;
        let price_score = (s.price / min_price).min(3.0);

        volume_score * 0.3 + change_score * 0.4 + price_score * 0.3
    }

    pub fn reasons(&self, s: &MarketSnapshot) -> Vec<String> {
        let mut reasons = Vec::new();
        if s.volume as f64 > self.min_volume as f64 * 2.0 {
            reasons.push("High volume".to_string());
        }
        if s.daily_change_percent.abs() > 5.0 {
            reasons.push("Significant price movement".to_string());
        }
        if s.daily_change_percent > 0.0 {
            reasons.push("Positive momentum".to_string());
        } else {
            reasons.push("Potential reversal candidate".to_string());
        }
        if s.price > self.min_price * 2.0 {
            reasons.push("Above minimum price threshold".to_string());
        }
        reasons
    }
}

/// A symbol that passed screening.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenResult {
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    pub daily_change_percent: f64,
    pub score: f64,
    pub reasons: Vec<String>,
    pub screened_at: DateTime<Utc>,
}

/// Filter, score and rank snapshots.
pub fn screen_snapshots(
    criteria: &ScreeningCriteria,
    snapshots: &[MarketSnapshot],
    now: DateTime<Utc>,
) -> Vec<ScreenResult> {
    let mut results: Vec<ScreenResult> = snapshots
        .iter()
        .filter(|s| criteria.accepts(s))
        .map(|s| ScreenResult {
            symbol: s.symbol.clone(),
            price: s.price,
            volume: s.volume,
            daily_change_percent: s.daily_change_percent,
            score: criteria.score(s),
            reasons: criteria.reasons(s),
            screened_at: now,
        })
        .collect();

    results.sort_by(|a, b| b.score.total_cmp(&a.score));
    results.truncate(criteria.max_results);
    results
}

#[derive(Debug, Clone, Serialize)]
pub struct ScreeningStatistics {
    pub total_screened: usize,
    pub tracked_symbols: usize,
    pub last_screen: Option<DateTime<Utc>>,
    pub top_scored: Vec<(String, f64)>,
}

/// Screener that remembers what it has found.
pub struct StockScreener {
    criteria: ScreeningCriteria,
    tracked: Vec<String>,
    results: HashMap<String, ScreenResult>,
    last_screen: Option<DateTime<Utc>>,
}

impl StockScreener {
    pub fn new(criteria: ScreeningCriteria) -> Self {
        Self {
            criteria,
            tracked: Vec::new(),
            results: HashMap::new(),
            last_screen: None,
        }
    }

    pub fn criteria(&self) -> &ScreeningCriteria {
        &self.criteria
    }

    /// Run one screening pass and record the results.
    pub fn screen(&mut self, snapshots: &[MarketSnapshot], now: DateTime<Utc>) -> Vec<ScreenResult> {
        let results = screen_snapshots(&self.criteria, snapshots, now);

        for result in &results {
            if !self.tracked.contains(&result.symbol) {
                debug!(symbol = %result.symbol, score = result.score, "Tracking screened symbol");
                self.tracked.push(result.symbol.clone());
            }
            self.results.insert(result.symbol.clone(), result.clone());
        }
        self.last_screen = Some(now);

        info!(
            candidates = snapshots.len(),
            passed = results.len(),
            "Screening completed"
        );
        results
    }

    /// Symbols seen in any screening pass, first-seen order.
    pub fn tracked_symbols(&self) -> &[String] {
        &self.tracked
    }

    pub fn result(&self, symbol: &str) -> Option<&ScreenResult> {
        self.results.get(symbol)
    }

    /// Latest results sorted by score, best first.
    pub fn ranked_results(&self) -> Vec<&ScreenResult> {
        let mut ranked: Vec<&ScreenResult> = self.results.values().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        ranked
    }

    pub fn last_screen(&self) -> Option<DateTime<Utc>> {
        self.last_screen
    }

    pub fn statistics(&self) -> ScreeningStatistics {
        ScreeningStatistics {
            total_screened: self.results.len(),
            tracked_symbols: self.tracked.len(),
            last_screen: self.last_screen,
            top_scored: self
                .ranked_results()
                .into_iter()
                .take(10)
                .map(|r| (r.symbol.clone(), r.score))
                .collect(),
        }
    }
}
