pub mod atr;

pub use atr::*;

use rust_decimal::Decimal;

/// `ln(p_t / p_{t-1})` for each consecutive pair. Non-positive prices yield 0.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .map(|w| {
            if w[0] > 0.0 && w[1] > 0.0 {
                (w[1] / w[0]).ln()
            } else {
                0.0
            }
        })
        .collect()
}

/// Sample standard deviation (n - 1 denominator).
pub fn sample_stddev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Fraction of `history` at or below `current`, in [0, 1].
pub fn atr_percentile<'a, I>(history: I, current: Decimal) -> Option<Decimal>
where
    I: IntoIterator<Item = &'a Decimal>,
{
    let mut total = 0u32;
    let mut below = 0u32;
    for value in history {
        total += 1;
        if *value <= current {
            below += 1;
        }
    }
    if total == 0 {
        return None;
    }
    Some(Decimal::from(below) / Decimal::from(total))
}
