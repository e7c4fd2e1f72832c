use ndarray::Array2;

use crate::error::{RegimeError, RegimeResult};
use crate::indicators::{log_returns, sample_stddev};
use crate::types::Candle;

/// Features are expressed in percent so the fitted covariances stay well
/// above the regularisation floor.
const FEATURE_SCALE: f64 = 100.0;

pub const N_FEATURES: usize = 3;
pub const LOG_RETURN: usize = 0;
pub const DAILY_RANGE: usize = 1;
pub const ROLLING_VOLATILITY: usize = 2;

/// Per-candle regime features, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    pub log_return: f64,
    pub daily_range: f64,
    pub rolling_volatility: f64,
}

impl FeatureVector {
    pub fn as_array(&self) -> [f64; N_FEATURES] {
        [self.log_return, self.daily_range, self.rolling_volatility]
    }
}

/// Minimum candles needed to produce a single feature row.
pub fn min_candles(lookback: usize) -> usize {
    lookback + 1
}

/// Compute one feature vector per candle from index `lookback` onward.
/// The caller is expected to have validated the series.
pub fn extract_features(candles: &[Candle], lookback: usize) -> RegimeResult<Vec<FeatureVector>> {
    if lookback < 2 {
        return Err(RegimeError::DataValidation(format!(
            "volatility lookback must be at least 2, got {}",
            lookback
        )));
    }
    if candles.len() < min_candles(lookback) {
        return Err(RegimeError::InsufficientData {
            required: min_candles(lookback),
            actual: candles.len(),
        });
    }

    let closes: Vec<f64> = candles.iter().map(Candle::close_f64).collect();
    // returns[i] is the return into candle i + 1
    let returns = log_returns(&closes);

    let mut features = Vec::with_capacity(candles.len() - lookback);
    for t in lookback..candles.len() {
        let window = &returns[t - lookback..t];
        let volatility = sample_stddev(window).unwrap_or(0.0);

        let feature = FeatureVector {
            log_return: returns[t - 1] * FEATURE_SCALE,
            daily_range: candles[t].range_fraction() * FEATURE_SCALE,
            rolling_volatility: volatility * FEATURE_SCALE,
        };

        if !feature.as_array().iter().all(|v| v.is_finite()) {
            return Err(RegimeError::DataValidation(format!(
                "non-finite feature at {}",
                candles[t].timestamp
            )));
        }
        features.push(feature);
    }

    Ok(features)
}

/// Stack feature vectors into an (n_obs x 3) observation matrix.
pub fn to_observation_matrix(features: &[FeatureVector]) -> Array2<f64> {
    let mut data = Array2::zeros((features.len(), N_FEATURES));
    for (i, feature) in features.iter().enumerate() {
        for (j, &value) in feature.as_array().iter().enumerate() {
            data[[i, j]] = value;
        }
    }
    data
}

pub fn extract_observations(candles: &[Candle], lookback: usize) -> RegimeResult<Array2<f64>> {
    let features = extract_features(candles, lookback)?;
    Ok(to_observation_matrix(&features))
}
