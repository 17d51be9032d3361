//! Technical indicators over closing-price series.
//!
//! All functions look at the tail of the series and return `None` when there
//! is not enough history.

use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;

use crate::broker::Bar;

/// Bollinger band values at the latest point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bands {
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
    pub std_dev: f64,
}

/// Closing prices as f64, oldest first.
pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().filter_map(|b| b.close.to_f64()).collect()
}

/// Simple moving average of the last `window` values.
pub fn sma(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    Some(values[values.len() - window..].iter().mean())
}

/// Relative strength index using simple averages of the last `period` moves.
pub fn rsi(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period + 1 {
        return None;
    }

    let tail = &values[values.len() - period - 1..];
    let (gains, losses) = tail.windows(2).fold((0.0, 0.0), |(g, l), w| {
        let change = w[1] - w[0];
        if change > 0.0 {
            (g + change, l)
        } else {
            (g, l - change)
        }
    });

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        // Flat series is neutral, all-gain is maximal
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// Bollinger bands over the last `window` values with `k` standard deviations.
pub fn bollinger(values: &[f64], window: usize, k: f64) -> Option<Bands> {
    if window < 2 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    let middle = tail.iter().mean();
    let std_dev = tail.iter().std_dev();
    Some(Bands {
        middle,
        upper: middle + k * std_dev,
        lower: middle - k * std_dev,
        std_dev,
    })
}

/// Average true range over the last `period` bars.
pub fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let tail = &bars[bars.len() - period - 1..];
    let ranges: Vec<f64> = tail
        .windows(2)
        .filter_map(|w| {
            let prev_close = w[0].close.to_f64()?;
            let high = w[1].high.to_f64()?;
            let low = w[1].low.to_f64()?;
            Some((high - low).max((high - prev_close).abs()).max((low - prev_close).abs()))
        })
        .collect();

    if ranges.len() < period {
        return None;
    }
    Some(ranges.mean())
}

/// Fractional change between the latest value and the one `lookback` steps back.
pub fn pct_change(values: &[f64], lookback: usize) -> Option<f64> {
    if lookback == 0 || values.len() < lookback + 1 {
        return None;
    }
    let last = *values.last()?;
    let base = values[values.len() - 1 - lookback];
    if base == 0.0 {
        return None;
    }
    Some((last - base) / base)
}

/// Standard deviation of the last `window` one-step returns.
pub fn returns_std(values: &[f64], window: usize) -> Option<f64> {
    if window < 2 || values.len() < window + 1 {
        return None;
    }
    let tail = &values[values.len() - window - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }
    Some(returns.std_dev())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal::prelude::FromPrimitive;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        let d = |v: f64| Decimal::from_f64(v).unwrap();
        Bar {
            timestamp: Utc::now(),
            open: d(close),
            high: d(high),
            low: d(low),
            close: d(close),
            volume: 1000,
            vwap: None,
            trade_count: None,
        }
    }

    #[test]
    fn test_sma() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&values, 5), Some(3.0));
        assert_eq!(sma(&values, 2), Some(4.5));
        assert_eq!(sma(&values, 6), None);
        assert_eq!(sma(&values, 0), None);
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (1..=20).map(|v| v as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let flat = vec![10.0; 20];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        let falling: Vec<f64> = (1..=20).rev().map(|v| v as f64).collect();
        assert_eq!(rsi(&falling, 14), Some(0.0));

        assert_eq!(rsi(&rising[..10], 14), None);
    }

    #[test]
    fn test_rsi_mixed() {
        // Two gains of 1, two losses of 1: RS = 1 so RSI = 50
        let values = [10.0, 11.0, 10.0, 11.0, 10.0];
        let value = rsi(&values, 4).unwrap();
        assert!((value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_bollinger_symmetry() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let bands = bollinger(&values, 8, 2.0).unwrap();
        assert!((bands.middle - 5.0).abs() < 1e-9);
        assert!((bands.upper - bands.middle - (bands.middle - bands.lower)).abs() < 1e-9);
        assert!(bands.std_dev > 0.0);
    }

    #[test]
    fn test_atr_constant_range() {
        let bars: Vec<Bar> = (0..6).map(|_| bar(102.0, 98.0, 100.0)).collect();
        let value = atr(&bars, 5).unwrap();
        assert!((value - 4.0).abs() < 1e-9);
        assert!(atr(&bars, 6).is_none());
    }

    #[test]
    fn test_pct_change_and_returns_std() {
        let values = [100.0, 105.0, 110.0];
        assert!((pct_change(&values, 2).unwrap() - 0.10).abs() < 1e-9);
        assert!(pct_change(&values, 3).is_none());

        let steady = [100.0, 101.0, 102.01, 103.0301];
        let std = returns_std(&steady, 3).unwrap();
        assert!(std < 1e-9);
    }
}
