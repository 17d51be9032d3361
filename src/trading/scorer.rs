//! Multi-factor stock scoring.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MarketSnapshot;

/// Weight of each factor in the total score. Must sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorWeights {
    pub momentum: f64,
    pub volume: f64,
    pub volatility: f64,
    pub technical: f64,
    pub sentiment: f64,
    pub fundamentals: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            momentum: 0.25,
            volume: 0.20,
            volatility: 0.15,
            technical: 0.20,
            sentiment: 0.10,
            fundamentals: 0.10,
        }
    }
}

impl FactorWeights {
    pub fn total(&self) -> f64 {
        self.momentum + self.volume + self.volatility + self.technical + self.sentiment + self.fundamentals
    }

    pub fn validate(&self) -> Result<()> {
        let total = self.total();
        if (total - 1.0).abs() > 0.01 {
            bail!("Scoring factor weights must sum to 1.0, got {:.3}", total);
        }
        Ok(())
    }
}

/// Score breakdown for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockScore {
    pub symbol: String,
    pub total_score: f64,
    /// 1-based, after sorting
    pub rank: usize,
    pub momentum_score: f64,
    pub volume_score: f64,
    pub volatility_score: f64,
    pub technical_score: f64,
    pub sentiment_score: f64,
    pub fundamental_score: f64,
    pub confidence: f64,
    pub scored_at: DateTime<Utc>,
}

// ==================== Factors ====================

fn momentum_factor(change: f64) -> f64 {
    if change > 0.0 {
        (change / 10.0).min(1.0)
    } else {
        (1.0 + change / 10.0).max(0.0)
    }
}

/// Share of the batch with volume at or below this one.
fn volume_factor(volume: i64, batch: &[i64]) -> f64 {
    if batch.len() <= 1 {
        return 1.0;
    }
    let below = batch.iter().filter(|v| **v <= volume).count();
    below as f64 / batch.len() as f64
}

/// Moderate moves (2-5%) score best.
fn volatility_factor(change: f64) -> f64 {
    let magnitude = change.abs();
    if (2.0..=5.0).contains(&magnitude) {
        1.0
    } else if magnitude < 2.0 {
        magnitude / 2.0
    } else {
        (1.0 - (magnitude - 5.0) / 10.0).max(0.0)
    }
}

fn technical_factor(price: f64, change: f64) -> f64 {
    if price <= 0.0 {
        return 0.5;
    }
    let mut score: f64 = 0.5;
    if change > 0.0 {
        score += 0.3;
    } else if change < 0.0 {
        score -= 0.3;
    }
    score.clamp(0.0, 1.0)
}

/// News sentiment in [-1, 1] mapped onto [0, 1]. Neutral without news.
fn sentiment_factor(sentiment: Option<f64>) -> f64 {
    match sentiment {
        Some(score) => (score.clamp(-1.0, 1.0) + 1.0) / 2.0,
        None => 0.5,
    }
}

fn fundamental_factor(market_cap: Option<f64>, pe_ratio: Option<f64>) -> f64 {
    let mut score: f64 = 0.5;
    match market_cap {
        Some(cap) if cap > 1e9 => score += 0.2,
        Some(cap) if cap > 1e8 => score += 0.1,
        _ => {}
    }
    match pe_ratio {
        Some(pe) if pe > 0.0 && pe < 25.0 => score += 0.2,
        Some(pe) if pe > 50.0 => score -= 0.1,
        _ => {}
    }
    score.clamp(0.0, 1.0)
}

// ==================== Scorer ====================

pub struct StockScorer {
    weights: FactorWeights,
    top_n: usize,
    min_score_threshold: f64,
    /// Latest news sentiment per symbol
    sentiment: HashMap<String, f64>,
}

impl StockScorer {
    pub fn new(weights: FactorWeights, top_n: usize, min_score_threshold: f64) -> Result<Self> {
        weights.validate()?;
        Ok(Self {
            weights,
            top_n,
            min_score_threshold,
            sentiment: HashMap::new(),
        })
    }

    pub fn weights(&self) -> &FactorWeights {
        &self.weights
    }

    pub fn set_sentiment(&mut self, symbol: &str, score: f64) {
        self.sentiment.insert(symbol.to_string(), score);
    }

    /// Score a single snapshot against its batch volumes.
    pub fn score_one(&self, s: &MarketSnapshot, batch_volumes: &[i64], now: DateTime<Utc>) -> StockScore {
        let w = &self.weights;
        let momentum = momentum_factor(s.daily_change_percent);
        let volume = volume_factor(s.volume, batch_volumes);
        let volatility = volatility_factor(s.daily_change_percent);
        let technical = technical_factor(s.price, s.daily_change_percent);
        let sentiment = sentiment_factor(self.sentiment.get(&s.symbol).copied());
        let fundamental = fundamental_factor(s.market_cap, s.pe_ratio);

        let total = w.momentum * momentum
            + w.volume * volume
            + w.volatility * volatility
            + w.technical * technical
            + w.sentiment * sentiment
            + w.fundamentals * fundamental;

        let factors = [momentum, volume, volatility, technical, sentiment, fundamental];
        let informative = factors.iter().filter(|f| (**f - 0.5).abs() > f64::EPSILON).count();
        let mut confidence = informative as f64 / factors.len() as f64;
        if s.volume > 100_000 {
            confidence += 0.1;
        }
        if s.market_cap.map(|c| c > 1e8).unwrap_or(false) {
            confidence += 0.1;
        }

        StockScore {
            symbol: s.symbol.clone(),
            total_score: total,
            rank: 0,
            momentum_score: momentum,
            volume_score: volume,
            volatility_score: volatility,
            technical_score: technical,
            sentiment_score: sentiment,
            fundamental_score: fundamental,
            confidence: confidence.min(1.0),
            scored_at: now,
        }
    }

    /// Score, rank, keep the top N, then drop anything under the threshold.
    pub fn score(&self, snapshots: &[MarketSnapshot], now: DateTime<Utc>) -> Vec<StockScore> {
        let volumes: Vec<i64> = snapshots.iter().map(|s| s.volume).collect();
        let mut scores: Vec<StockScore> = snapshots
            .iter()
            .map(|s| self.score_one(s, &volumes, now))
            .collect();

        scores.sort_by(|a, b| b.total_score.total_cmp(&a.total_score));
        for (i, score) in scores.iter_mut().enumerate() {
            score.rank = i + 1;
        }

        scores
            .into_iter()
            .take(self.top_n)
            .filter(|s| s.total_score >= self.min_score_threshold)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weights_validation() {
        assert!(FactorWeights::default().validate().is_ok());
        let heavy = FactorWeights {
            momentum: 0.5,
            ..Default::default()
        };
        assert!(heavy.validate().is_err());
        assert!(StockScorer::new(heavy, 30, 0.5).is_err());
    }

    #[test]
    fn test_factor_shapes() {
        assert_eq!(momentum_factor(5.0), 0.5);
        assert_eq!(momentum_factor(15.0), 1.0);
        assert_eq!(momentum_factor(-5.0), 0.5);
        assert_eq!(momentum_factor(-15.0), 0.0);

        assert_eq!(volatility_factor(3.0), 1.0);
        assert_eq!(volatility_factor(1.0), 0.5);
        assert!((volatility_factor(10.0) - 0.5).abs() < 1e-9);
        assert_eq!(volatility_factor(20.0), 0.0);

        assert!((technical_factor(10.0, 1.0) - 0.8).abs() < 1e-9);
        assert!((technical_factor(10.0, -1.0) - 0.2).abs() < 1e-9);
        assert_eq!(technical_factor(0.0, 1.0), 0.5);

        assert!((fundamental_factor(Some(2e9), Some(15.0)) - 0.9).abs() < 1e-9);
        assert!((fundamental_factor(Some(5e8), Some(60.0)) - 0.5).abs() < 1e-9);
        assert_eq!(fundamental_factor(None, None), 0.5);

        assert_eq!(sentiment_factor(None), 0.5);
        assert_eq!(sentiment_factor(Some(1.0)), 1.0);
        assert_eq!(sentiment_factor(Some(-0.5)), 0.25);
        assert_eq!(sentiment_factor(Some(-3.0)), 0.0);
    }

    #[test]
    fn test_volume_percentile() {
        let batch = [100, 200, 300, 400];
        assert_eq!(volume_factor(400, &batch), 1.0);
        assert_eq!(volume_factor(100, &batch), 0.25);
        assert_eq!(volume_factor(5, &[5]), 1.0);
    }

    #[test]
    fn test_rank_and_threshold() {
        let scorer = StockScorer::new(FactorWeights::default(), 30, 0.5).unwrap();
        let mut strong = MarketSnapshot::new("STRONG", 100.0, 5_000_000, 4.0);
        strong.market_cap = Some(5e9);
        strong.pe_ratio = Some(20.0);
        let weak = MarketSnapshot::new("WEAK", 100.0, 50_000, -15.0);
        let mid = MarketSnapshot::new("MID", 100.0, 1_000_000, 1.0);

        let scores = scorer.score(&[weak, mid, strong], Utc::now());
        assert_eq!(scores[0].symbol, "STRONG");
        assert_eq!(scores[0].rank, 1);
        assert!(scores.iter().all(|s| s.total_score >= 0.5));
        assert!(scores.iter().all(|s| s.symbol != "WEAK"));
        assert!(scores[0].confidence <= 1.0);
    }

    #[test]
    fn test_top_n_applies_before_threshold() {
        let scorer = StockScorer::new(FactorWeights::default(), 1, 0.0).unwrap();
        let snapshots = vec![
            MarketSnapshot::new("A", 50.0, 200_000, 3.0),
            MarketSnapshot::new("B", 50.0, 100_000, 1.0),
        ];
        let scores = scorer.score(&snapshots, Utc::now());
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].symbol, "A");
    }

    #[test]
    fn test_news_sentiment_moves_score() {
        let mut scorer = StockScorer::new(FactorWeights::default(), 30, 0.0).unwrap();
        let snapshot = MarketSnapshot::new("AAPL", 150.0, 1_000_000, 2.5);
        let neutral = scorer.score_one(&snapshot, &[1_000_000], Utc::now());

        scorer.set_sentiment("AAPL", 0.8);
        let positive = scorer.score_one(&snapshot, &[1_000_000], Utc::now());
        assert!((positive.sentiment_score - 0.9).abs() < 1e-9);
        assert!((positive.total_score - neutral.total_score - 0.1 * 0.4).abs() < 1e-9);
        assert!(positive.confidence > neutral.confidence);
    }
}
