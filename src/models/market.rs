//! Point-in-time market view of a symbol, used by the screener and scorer.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

use crate::broker::Bar;

/// Latest price, volume and daily change for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    /// Percent change versus the previous close (5.0 means +5%)
    pub daily_change_percent: f64,
    #[serde(default)]
    pub market_cap: Option<f64>,
    #[serde(default)]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub sector: Option<String>,
}

impl MarketSnapshot {
    pub fn new(symbol: impl Into<String>, price: f64, volume: i64, daily_change_percent: f64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume,
            daily_change_percent,
            market_cap: None,
            pe_ratio: None,
            sector: None,
        }
    }

    /// Build from daily bars (oldest first). Needs at least one bar; the
    /// change is zero when there is no previous close.
    pub fn from_bars(symbol: &str, bars: &[Bar]) -> Option<Self> {
        let last = bars.last()?;
        let price = last.close.to_f64()?;
        let change = match bars.len().checked_sub(2).and_then(|i| bars.get(i)) {
            Some(prev) => {
                let prev_close = prev.close.to_f64().unwrap_or(0.0);
                if prev_close > 0.0 {
                    (price - prev_close) / prev_close * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        Some(Self::new(symbol, price, last.volume, change))
    }

    pub fn with_sector(mut self, sector: Option<String>) -> Self {
        self.sector = sector;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn bar(close: Decimal, volume: i64) -> Bar {
        Bar {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
            vwap: None,
            trade_count: None,
        }
    }

    #[test]
    fn test_from_bars() {
        let bars = vec![bar(dec!(100), 1000), bar(dec!(105), 2000)];
        let snapshot = MarketSnapshot::from_bars("AAPL", &bars).unwrap();
        assert_eq!(snapshot.price, 105.0);
        assert_eq!(snapshot.volume, 2000);
        assert!((snapshot.daily_change_percent - 5.0).abs() < 1e-9);

        let single = MarketSnapshot::from_bars("AAPL", &bars[..1]).unwrap();
        assert_eq!(single.daily_change_percent, 0.0);
        assert!(MarketSnapshot::from_bars("AAPL", &[]).is_none());
    }
}
