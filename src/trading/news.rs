//! Keyword sentiment over broker news and the signals it drives.
//!
//! Each article scores `(positive - negative) / matched` over the distinct
//! keywords it contains, so a single article lies in [-1, 1]. A symbol's
//! sentiment is the mean over its recent articles, and its confidence is the
//! share of articles that agree with the most common label.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::NewsArticle;
use crate::models::{SignalDirection, StrategySignal};

/// Strategy name news signals are recorded and weighted under.
pub const NEWS_STRATEGY: &str = "news_sentiment";

/// Score beyond which an article or symbol counts as positive or negative.
const LABEL_THRESHOLD: f64 = 0.1;

const POSITIVE_KEYWORDS: &[&str] = &[
    "bullish", "surge", "rally", "growth", "profit", "beat", "exceed", "strong", "gain", "rise", "up",
    "positive", "upgrade", "outperform", "breakthrough", "success", "expansion", "acquisition", "merger",
];

const NEGATIVE_KEYWORDS: &[&str] = &[
    "bearish", "decline", "fall", "loss", "miss", "below", "weak", "drop", "down", "negative",
    "downgrade", "underperform", "concern", "risk", "lawsuit", "investigation", "bankruptcy", "recession",
];

/// Inflections accepted after a keyword ("beats", "surged").
const SUFFIXES: &[&str] = &["", "s", "es", "d", "ed", "ing"];

/// `news` config block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewsConfig {
    pub enabled: bool,
    /// Articles requested per refresh, across all tracked symbols
    pub article_limit: usize,
    pub lookback_hours: i64,
    pub min_articles: usize,
    /// Mean sentiment needed before a signal is emitted
    pub signal_threshold: f64,
    pub min_confidence: f64,
    /// Aggregation weight of news signals
    pub weight: f64,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            article_limit: 50,
            lookback_hours: 24,
            min_articles: 3,
            signal_threshold: 0.3,
            min_confidence: 0.7,
            weight: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn from_score(score: f64) -> Self {
        if score > LABEL_THRESHOLD {
            SentimentLabel::Positive
        } else if score < -LABEL_THRESHOLD {
            SentimentLabel::Negative
        } else {
            SentimentLabel::Neutral
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentiment of one symbol's recent articles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentSummary {
    pub symbol: String,
    /// Mean article score, -1.0 to 1.0
    pub score: f64,
    pub label: SentimentLabel,
    pub confidence: f64,
    pub article_count: usize,
    pub positive_count: usize,
    pub negative_count: usize,
    pub neutral_count: usize,
}

impl SentimentSummary {
    fn empty(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            score: 0.0,
            label: SentimentLabel::Neutral,
            confidence: 0.0,
            article_count: 0,
            positive_count: 0,
            negative_count: 0,
            neutral_count: 0,
        }
    }
}

fn matches_keyword(word: &str, keyword: &str) -> bool {
    word.strip_prefix(keyword)
        .map(|rest| SUFFIXES.contains(&rest))
        .unwrap_or(false)
}

/// Keyword score of a piece of text. 0.0 when no keyword matches.
pub fn keyword_sentiment(text: &str) -> f64 {
    let lower = text.to_lowercase();
    let words: HashSet<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let count = |keywords: &[&str]| {
        keywords
            .iter()
            .filter(|k| words.iter().any(|w| matches_keyword(w, k)))
            .count()
    };
    let positive = count(POSITIVE_KEYWORDS);
    let negative = count(NEGATIVE_KEYWORDS);

    let matched = positive + negative;
    if matched == 0 {
        return 0.0;
    }
    (positive as f64 - negative as f64) / matched as f64
}

// ==================== Analyzer ====================

pub struct NewsAnalyzer {
    config: NewsConfig,
}

impl NewsAnalyzer {
    pub fn new(config: NewsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NewsConfig {
        &self.config
    }

    /// Summarize `symbol`'s articles inside the lookback window.
    pub fn analyze(&self, symbol: &str, articles: &[NewsArticle], now: DateTime<Utc>) -> SentimentSummary {
        let cutoff = now - Duration::hours(self.config.lookback_hours);
        let scores: Vec<f64> = articles
            .iter()
            .filter(|a| a.mentions(symbol) && a.created_at >= cutoff)
            .map(|a| keyword_sentiment(&a.text()))
            .collect();
        if scores.is_empty() {
            return SentimentSummary::empty(symbol);
        }

        let mut summary = SentimentSummary::empty(symbol);
        for score in &scores {
            match SentimentLabel::from_score(*score) {
                SentimentLabel::Positive => summary.positive_count += 1,
                SentimentLabel::Negative => summary.negative_count += 1,
                SentimentLabel::Neutral => summary.neutral_count += 1,
            }
        }
        let agreeing = summary
            .positive_count
            .max(summary.negative_count)
            .max(summary.neutral_count);

        summary.article_count = scores.len();
        summary.score = scores.iter().sum::<f64>() / scores.len() as f64;
        summary.label = SentimentLabel::from_score(summary.score);
        summary.confidence = agreeing as f64 / scores.len() as f64;
        summary
    }

    /// Summaries for every symbol, articles matched by their symbol tags.
    pub fn analyze_all(
        &self,
        symbols: &[String],
        articles: &[NewsArticle],
        now: DateTime<Utc>,
    ) -> BTreeMap<String, SentimentSummary> {
        symbols
            .iter()
            .map(|symbol| (symbol.clone(), self.analyze(symbol, articles, now)))
            .collect()
    }

    /// Buy on strong agreeing positive news, sell on negative. `None` when
    /// there is too little news or it does not agree.
    pub fn to_signal(&self, summary: &SentimentSummary, price: Decimal, now: DateTime<Utc>) -> Option<StrategySignal> {
        if summary.article_count < self.config.min_articles || summary.confidence < self.config.min_confidence {
            return None;
        }
        let direction = if summary.score > self.config.signal_threshold {
            SignalDirection::Buy
        } else if summary.score < -self.config.signal_threshold {
            SignalDirection::Sell
        } else {
            return None;
        };

        debug!(
            symbol = %summary.symbol,
            score = summary.score,
            articles = summary.article_count,
            "News sentiment signal"
        );
        let mut signal = StrategySignal::new(
            &summary.symbol,
            NEWS_STRATEGY,
            direction,
            (summary.score.abs() * 2.0).min(1.0),
            price,
            now,
        )
        .with_metadata("sentiment_score", summary.score)
        .with_metadata("article_count", summary.article_count)
        .with_metadata("label", summary.label.as_str());
        signal.confidence = summary.confidence;
        Some(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn article(symbol: &str, headline: &str, hours_ago: i64) -> NewsArticle {
        NewsArticle {
            id: format!("{}-{}", symbol, headline.len()),
            headline: headline.to_string(),
            summary: String::new(),
            source: "test".to_string(),
            url: None,
            symbols: vec![symbol.to_string()],
            created_at: Utc::now() - Duration::hours(hours_ago),
        }
    }

    #[test]
    fn test_keyword_sentiment() {
        assert_eq!(keyword_sentiment("Apple beats estimates on strong growth"), 1.0);
        assert_eq!(keyword_sentiment("Shares drop after downgrade"), -1.0);
        assert_eq!(keyword_sentiment("Profit surged but lawsuit looms"), 1.0 / 3.0);
        assert_eq!(keyword_sentiment("Company schedules annual meeting"), 0.0);
        // Whole words only
        assert_eq!(keyword_sentiment("Software update released"), 0.0);
    }

    #[test]
    fn test_labels() {
        assert_eq!(SentimentLabel::from_score(0.5), SentimentLabel::Positive);
        assert_eq!(SentimentLabel::from_score(-0.2), SentimentLabel::Negative);
        assert_eq!(SentimentLabel::from_score(0.1), SentimentLabel::Neutral);
    }

    #[test]
    fn test_analyze_filters_window_and_symbol() {
        let analyzer = NewsAnalyzer::new(NewsConfig::default());
        let articles = vec![
            article("AAPL", "Apple beats estimates", 1),
            article("AAPL", "Apple rally continues", 2),
            article("AAPL", "Apple shares fall", 3),
            article("AAPL", "Apple lawsuit filed", 48),
            article("MSFT", "Microsoft downgrade", 1),
        ];

        let summary = analyzer.analyze("AAPL", &articles, Utc::now());
        assert_eq!(summary.article_count, 3);
        assert_eq!(summary.positive_count, 2);
        assert_eq!(summary.negative_count, 1);
        assert!((summary.score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.label, SentimentLabel::Positive);
        assert!((summary.confidence - 2.0 / 3.0).abs() < 1e-9);

        let all = analyzer.analyze_all(&["MSFT".to_string(), "TSLA".to_string()], &articles, Utc::now());
        assert_eq!(all["MSFT"].label, SentimentLabel::Negative);
        assert_eq!(all["TSLA"].article_count, 0);
        assert_eq!(all["TSLA"].score, 0.0);
    }

    #[test]
    fn test_signal_needs_volume_and_agreement() {
        let analyzer = NewsAnalyzer::new(NewsConfig::default());
        let now = Utc::now();
        let positive: Vec<NewsArticle> = ["Upgrade on strong demand", "Record profit", "Shares surge"]
            .iter()
            .map(|h| article("NVDA", h, 1))
            .collect();

        let summary = analyzer.analyze("NVDA", &positive, now);
        let signal = analyzer.to_signal(&summary, dec!(450), now).unwrap();
        assert_eq!(signal.direction, SignalDirection::Buy);
        assert_eq!(signal.strategy, NEWS_STRATEGY);
        assert_eq!(signal.strength, 1.0);
        assert_eq!(signal.confidence, 1.0);
        assert_eq!(signal.price, dec!(450));

        // Two articles are not enough
        let thin = analyzer.analyze("NVDA", &positive[..2], now);
        assert!(analyzer.to_signal(&thin, dec!(450), now).is_none());

        // Split news has low confidence
        let mut mixed = positive.clone();
        mixed.push(article("NVDA", "Investigation widens", 1));
        mixed.push(article("NVDA", "Weak guidance", 1));
        let split = analyzer.analyze("NVDA", &mixed, now);
        assert!(analyzer.to_signal(&split, dec!(450), now).is_none());
    }

    #[test]
    fn test_negative_news_sells() {
        let analyzer = NewsAnalyzer::new(NewsConfig::default());
        let now = Utc::now();
        let negative: Vec<NewsArticle> = ["Bankruptcy fears", "Analyst downgrade", "Revenue miss"]
            .iter()
            .map(|h| article("XYZ", h, 2))
            .collect();
        let summary = analyzer.analyze("XYZ", &negative, now);
        let signal = analyzer.to_signal(&summary, dec!(12), now).unwrap();
        assert_eq!(signal.direction, SignalDirection::Sell);
        assert_eq!(signal.metadata["label"], "negative");
    }
}
