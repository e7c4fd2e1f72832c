use rust_decimal::Decimal;

use crate::types::Candle;

/// Average True Range with Wilder smoothing.
#[derive(Debug, Clone)]
pub struct ATR {
    period: usize,
    prev_close: Option<Decimal>,
    true_ranges: Vec<Decimal>,
    value: Option<Decimal>,
}

impl ATR {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            prev_close: None,
            true_ranges: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, high: Decimal, low: Decimal, close: Decimal) -> Option<Decimal> {
        let tr = self.calculate_true_range(high, low, close);
        self.prev_close = Some(close);

        self.true_ranges.push(tr);

        if self.true_ranges.len() < self.period {
            return None;
        }

        if self.true_ranges.len() == self.period && self.value.is_none() {
            let sum: Decimal = self.true_ranges.iter().sum();
            self.value = Some(sum / Decimal::from(self.period as u32));
        } else if let Some(prev_atr) = self.value {
            let period_dec = Decimal::from(self.period as u32);
            let new_atr = (prev_atr * (period_dec - Decimal::ONE) + tr) / period_dec;
            self.value = Some(new_atr);
        }

        if self.true_ranges.len() > self.period {
            self.true_ranges.remove(0);
        }

        self.value
    }

    pub fn update_candle(&mut self, candle: &Candle) -> Option<Decimal> {
        self.update(candle.high, candle.low, candle.close)
    }

    fn calculate_true_range(&self, high: Decimal, low: Decimal, close: Decimal) -> Decimal {
        let hl = high - low;

        match self.prev_close {
            Some(prev_close) => {
                let hc = (high - prev_close).abs();
                let lc = (low - prev_close).abs();
                hl.max(hc).max(lc)
            }
            None => hl,
        }
    }
}

/// ATR value after every candle once the indicator is warm.
pub fn atr_series(candles: &[Candle], period: usize) -> Vec<Decimal> {
    let mut atr = ATR::new(period);
    candles.iter().filter_map(|c| atr.update_candle(c)).collect()
}
