use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RegimeError, RegimeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    /// High-low range as a fraction of the close.
    pub fn range_fraction(&self) -> f64 {
        if self.close.is_zero() {
            return 0.0;
        }
        (self.range() / self.close).to_f64().unwrap_or(0.0)
    }

    pub fn close_f64(&self) -> f64 {
        self.close.to_f64().unwrap_or(0.0)
    }
}

/// Reject series the detector cannot trust: non-positive prices, inverted
/// ranges, or timestamps that are not strictly increasing.
pub fn validate_candles(candles: &[Candle]) -> RegimeResult<()> {
    for (i, candle) in candles.iter().enumerate() {
        if candle.open <= Decimal::ZERO
            || candle.high <= Decimal::ZERO
            || candle.low <= Decimal::ZERO
            || candle.close <= Decimal::ZERO
        {
            return Err(RegimeError::DataValidation(format!(
                "non-positive price in candle {} at {}",
                i, candle.timestamp
            )));
        }
        if candle.high < candle.low {
            return Err(RegimeError::DataValidation(format!(
                "high {} below low {} in candle {} at {}",
                candle.high, candle.low, i, candle.timestamp
            )));
        }
        if candle.volume < Decimal::ZERO {
            return Err(RegimeError::DataValidation(format!(
                "negative volume in candle {} at {}",
                i, candle.timestamp
            )));
        }
        if i > 0 && candle.timestamp <= candles[i - 1].timestamp {
            return Err(RegimeError::DataValidation(format!(
                "timestamps not strictly increasing at candle {} ({} after {})",
                i,
                candle.timestamp,
                candles[i - 1].timestamp
            )));
        }
    }
    Ok(())
}

/// Candles whose timestamp falls within `span` of the most recent one.
/// Used to pick the walk-forward retraining window.
pub fn trailing_window(candles: &[Candle], span: Duration) -> &[Candle] {
    let Some(last) = candles.last() else {
        return candles;
    };
    let cutoff = last.timestamp - span;
    let start = candles.partition_point(|c| c.timestamp < cutoff);
    &candles[start..]
}

#[derive(Debug, Clone, Default)]
pub struct CandleBuffer {
    pub candles: Vec<Candle>,
    pub max_size: usize,
}

impl CandleBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            candles: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Append a closed candle. Out-of-order candles are rejected so the
    /// buffer always holds a series `validate_candles` accepts ordering-wise.
    pub fn push(&mut self, candle: Candle) -> RegimeResult<()> {
        if let Some(last) = self.candles.last() {
            if candle.timestamp <= last.timestamp {
                return Err(RegimeError::DataValidation(format!(
                    "candle at {} does not follow {}",
                    candle.timestamp, last.timestamp
                )));
            }
        }
        if self.candles.len() >= self.max_size {
            self.candles.remove(0);
        }
        self.candles.push(candle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn candle(day: i64, close: Decimal) -> Candle {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day);
        Candle::new(ts, close, close + dec!(1), close - dec!(1), close, dec!(10))
    }

    #[test]
    fn test_validate_accepts_ordered_series() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(i, dec!(100))).collect();
        assert!(validate_candles(&candles).is_ok());
    }

    #[test]
    fn test_validate_rejects_non_positive_price() {
        let mut candles: Vec<Candle> = (0..5).map(|i| candle(i, dec!(100))).collect();
        candles[3].low = Decimal::ZERO;
        assert!(matches!(
            validate_candles(&candles),
            Err(RegimeError::DataValidation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_timestamp() {
        let mut candles: Vec<Candle> = (0..5).map(|i| candle(i, dec!(100))).collect();
        candles[4].timestamp = candles[3].timestamp;
        assert!(matches!(
            validate_candles(&candles),
            Err(RegimeError::DataValidation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut candles: Vec<Candle> = (0..3).map(|i| candle(i, dec!(100))).collect();
        candles[1].high = dec!(90);
        assert!(validate_candles(&candles).is_err());
    }

    #[test]
    fn test_trailing_window() {
        let candles: Vec<Candle> = (0..100).map(|i| candle(i, dec!(100))).collect();
        let window = trailing_window(&candles, Duration::days(9));
        assert_eq!(window.len(), 10);
        assert_eq!(window.last(), candles.last());
        assert!(trailing_window(&[], Duration::days(5)).is_empty());
    }

    #[test]
    fn test_buffer_rolls_and_rejects_out_of_order() {
        let mut buffer = CandleBuffer::new(3);
        for i in 0..5 {
            buffer.push(candle(i, dec!(100))).unwrap();
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.candles[0].timestamp, candle(2, dec!(100)).timestamp);
        assert!(buffer.push(candle(1, dec!(100))).is_err());
        assert_eq!(buffer.len(), 3);
        assert!(CandleBuffer::new(3).is_empty());
    }

    #[test]
    fn test_range_fraction() {
        let c = candle(0, dec!(100));
        assert!((c.range_fraction() - 0.02).abs() < 1e-12);
    }
}
