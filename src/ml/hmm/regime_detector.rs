use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use super::features::{extract_observations, min_candles, N_FEATURES, ROLLING_VOLATILITY};
use super::gaussian_hmm::GaussianHMM;
use crate::config::DetectorConfig;
use crate::error::{RegimeError, RegimeResult};
use crate::types::{validate_candles, Candle, Side};

/// Market regime states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    LowVol,
    HighVol,
    Transition,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::LowVol => "LOW_VOL",
            MarketRegime::HighVol => "HIGH_VOL",
            MarketRegime::Transition => "TRANSITION",
        }
    }

    /// Fixed trading policy for each regime.
    pub fn permissions(&self) -> TradingPermissions {
        match self {
            MarketRegime::LowVol => TradingPermissions {
                position_multiplier: dec!(1.0),
                allow_long: true,
                allow_short: true,
                pause_trading: false,
            },
            MarketRegime::HighVol => TradingPermissions {
                position_multiplier: dec!(0.5),
                allow_long: true,
                allow_short: true,
                pause_trading: false,
            },
            MarketRegime::Transition => TradingPermissions {
                position_multiplier: Decimal::ZERO,
                allow_long: false,
                allow_short: false,
                pause_trading: true,
            },
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MarketRegime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().replace('-', "_").as_str() {
            "LOW_VOL" => Ok(MarketRegime::LowVol),
            "HIGH_VOL" => Ok(MarketRegime::HighVol),
            "TRANSITION" => Ok(MarketRegime::Transition),
            _ => Err(format!("unknown regime: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingPermissions {
    pub position_multiplier: Decimal,
    pub allow_long: bool,
    pub allow_short: bool,
    pub pause_trading: bool,
}

impl TradingPermissions {
    pub fn allows(&self, side: Side) -> bool {
        match side {
            Side::Long => self.allow_long,
            Side::Short => self.allow_short,
        }
    }
}

/// Classification of the most recent bar of a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimePrediction {
    /// Argmax state index of the fitted model
    pub state: usize,
    pub regime: MarketRegime,
    /// Label of the argmax state before any low-confidence override
    pub raw_regime: MarketRegime,
    /// Filtered probability of each model state, indexed like `state`
    pub state_probabilities: Vec<f64>,
    pub confidence: f64,
    pub permissions: TradingPermissions,
    /// Timestamp of the bar that was classified
    pub as_of: DateTime<Utc>,
}

impl RegimePrediction {
    /// Prediction pinned to a regime, for callers that already know it.
    pub fn fixed(regime: MarketRegime, as_of: DateTime<Utc>) -> Self {
        Self {
            state: 0,
            regime,
            raw_regime: regime,
            state_probabilities: vec![1.0],
            confidence: 1.0,
            permissions: regime.permissions(),
            as_of,
        }
    }

    pub fn is_overridden(&self) -> bool {
        self.regime != self.raw_regime
    }
}

/// Fitted HMM plus the regime meaning of each of its states.
#[derive(Debug, Clone)]
pub struct RegimeModel {
    pub hmm: GaussianHMM,
    /// Regime label per state index
    pub state_labels: Vec<MarketRegime>,
    pub lookback_window: usize,
    pub trained_at: DateTime<Utc>,
}

impl RegimeModel {
    /// Lowest volatility mean is LOW_VOL, highest is HIGH_VOL, the rest TRANSITION.
    pub fn label_states(hmm: &GaussianHMM) -> Vec<MarketRegime> {
        let order = hmm.states_sorted_by_feature(ROLLING_VOLATILITY);
        let mut labels = vec![MarketRegime::Transition; hmm.n_states];
        if let (Some(&lowest), Some(&highest)) = (order.first(), order.last()) {
            labels[lowest] = MarketRegime::LowVol;
            labels[highest] = MarketRegime::HighVol;
        }
        labels
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.trained_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitReport {
    pub n_observations: usize,
    pub iterations: usize,
    pub converged: bool,
    pub log_likelihood: f64,
    /// Share of the fitted window Viterbi assigns to each regime
    pub occupancy: Vec<(MarketRegime, f64)>,
    pub trained_at: DateTime<Utc>,
}

pub struct RegimeDetector {
    config: DetectorConfig,
    model: Option<RegimeModel>,
}

impl RegimeDetector {
    pub fn new(config: DetectorConfig) -> RegimeResult<Self> {
        config
            .validate()
            .map_err(|errors| RegimeError::InvalidConfig(errors.join(", ")))?;
        Ok(Self { config, model: None })
    }

    /// Restore a detector from a model file written by `save_model`.
    pub fn from_model_file(config: DetectorConfig, path: impl AsRef<Path>) -> RegimeResult<Self> {
        let mut detector = Self::new(config)?;
        detector.model = Some(RegimeModel::load(path)?);
        Ok(detector)
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&RegimeModel> {
        self.model.as_ref()
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn fit(&mut self, candles: &[Candle]) -> RegimeResult<FitReport> {
        self.fit_at(candles, Utc::now())
    }

    /// Fit a fresh model on `candles`, stamping it `trained_at`. The held
    /// model is only replaced when fitting succeeds.
    pub fn fit_at(&mut self, candles: &[Candle], trained_at: DateTime<Utc>) -> RegimeResult<FitReport> {
        if candles.len() < self.config.min_fit_candles {
            return Err(RegimeError::InsufficientData {
                required: self.config.min_fit_candles,
                actual: candles.len(),
            });
        }
        validate_candles(candles)?;

        let observations = extract_observations(candles, self.config.lookback_window)?;
        info!(
            "Fitting {}-state HMM on {} observations ({} candles)",
            self.config.n_states,
            observations.nrows(),
            candles.len()
        );

        let mut hmm = GaussianHMM::new(self.config.n_states, N_FEATURES).with_training(
            self.config.max_iterations,
            self.config.tolerance,
            self.config.min_covar,
        );
        hmm.init_from_observations(&observations, ROLLING_VOLATILITY)?;
        let stats = hmm.fit(&observations)?;

        if stats.converged {
            info!(
                "HMM converged after {} iterations, log-likelihood {:.2}",
                stats.iterations, stats.log_likelihood
            );
        } else {
            warn!(
                "HMM did not converge within {} iterations, log-likelihood {:.2}",
                stats.iterations, stats.log_likelihood
            );
        }

        let state_labels = RegimeModel::label_states(&hmm);
        let path = hmm.predict(&observations)?;
        let total = path.len() as f64;
        let mut counts = vec![0usize; hmm.n_states];
        for &state in &path {
            counts[state] += 1;
        }
        let occupancy: Vec<(MarketRegime, f64)> = counts
            .iter()
            .enumerate()
            .map(|(state, &count)| (state_labels[state], count as f64 / total))
            .collect();
        for (regime, share) in &occupancy {
            debug!("  {}: {:.1}% of window", regime, share * 100.0);
        }
        if occupancy.iter().any(|(_, share)| *share > 0.95) {
            warn!("Regime model may be degenerate: one state covers more than 95% of the window");
        }

        self.model = Some(RegimeModel {
            hmm,
            state_labels,
            lookback_window: self.config.lookback_window,
            trained_at,
        });

        Ok(FitReport {
            n_observations: observations.nrows(),
            iterations: stats.iterations,
            converged: stats.converged,
            log_likelihood: stats.log_likelihood,
            occupancy,
            trained_at,
        })
    }

    /// Classify the last bar of `candles`.
    pub fn predict_regime(&self, candles: &[Candle]) -> RegimeResult<RegimePrediction> {
        let model = self.model.as_ref().ok_or(RegimeError::ModelNotFitted)?;

        let required = min_candles(model.lookback_window);
        if candles.len() < required {
            return Err(RegimeError::InsufficientData {
                required,
                actual: candles.len(),
            });
        }
        validate_candles(candles)?;

        let observations = extract_observations(candles, model.lookback_window)?;
        let posterior = model.hmm.filtered_posterior(&observations)?;

        let mut state = 0;
        for (i, &p) in posterior.iter().enumerate() {
            if p > posterior[state] {
                state = i;
            }
        }
        let confidence = posterior[state];
        let raw_regime = model.state_labels[state];

        let regime = if confidence < self.config.transition_confidence_threshold {
            debug!(
                "Confidence {:.3} below {:.3}, forcing TRANSITION (raw {})",
                confidence, self.config.transition_confidence_threshold, raw_regime
            );
            MarketRegime::Transition
        } else {
            raw_regime
        };

        // validate_candles guarantees a last candle
        let as_of = candles[candles.len() - 1].timestamp;

        Ok(RegimePrediction {
            state,
            regime,
            raw_regime,
            state_probabilities: posterior.to_vec(),
            confidence,
            permissions: regime.permissions(),
            as_of,
        })
    }

    pub fn should_retrain(&self) -> bool {
        self.should_retrain_at(Utc::now())
    }

    /// True when no model exists or the model is older than the retrain
    /// interval. Never retrains by itself.
    pub fn should_retrain_at(&self, now: DateTime<Utc>) -> bool {
        match &self.model {
            None => true,
            Some(model) => model.age(now) > Duration::days(self.config.retrain_interval_days),
        }
    }

    pub fn save_model(&self, path: impl AsRef<Path>) -> RegimeResult<()> {
        let model = self.model.as_ref().ok_or(RegimeError::ModelNotFitted)?;
        model.save(path)
    }

    pub fn load_model(&mut self, path: impl AsRef<Path>) -> RegimeResult<()> {
        self.model = Some(RegimeModel::load(path)?);
        Ok(())
    }
}
