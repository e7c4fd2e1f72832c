use config::{Config, ConfigError, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub detector: DetectorConfig,
    pub risk: RiskConfig,
}

impl AppConfig {
    /// Load from a TOML file. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(path).required(false))
            .build()?
            .try_deserialize()
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(e) = self.detector.validate() {
            errors.extend(e);
        }
        if let Err(e) = self.risk.validate() {
            errors.extend(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub n_states: usize,
    /// Periods in the rolling-volatility window
    pub lookback_window: usize,
    pub min_fit_candles: usize,
    pub retrain_interval_days: i64,
    /// Below this max-state probability the prediction is forced to TRANSITION
    pub transition_confidence_threshold: f64,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub min_covar: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            n_states: 3,
            lookback_window: 20,
            min_fit_candles: 500,
            retrain_interval_days: 30,
            transition_confidence_threshold: 0.3,
            max_iterations: 100,
            tolerance: 1e-4,
            min_covar: 1e-3,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.n_states != 3 {
            errors.push("n_states must be 3".to_string());
        }
        if self.lookback_window < 2 {
            errors.push("lookback_window must be >= 2".to_string());
        }
        if self.min_fit_candles <= self.lookback_window + self.n_states {
            errors.push("min_fit_candles must exceed lookback_window + n_states".to_string());
        }
        if self.retrain_interval_days <= 0 {
            errors.push("retrain_interval_days must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.transition_confidence_threshold) {
            errors.push("transition_confidence_threshold must be between 0 and 1".to_string());
        }
        if self.max_iterations == 0 {
            errors.push("max_iterations must be > 0".to_string());
        }
        if self.tolerance <= 0.0 {
            errors.push("tolerance must be > 0".to_string());
        }
        if self.min_covar <= 0.0 {
            errors.push("min_covar must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fraction of equity risked per trade before Kelly and breaker adjustments
    pub risk_per_trade: Decimal,
    pub atr_multiplier: Decimal,
    /// Ceiling on aggregate open risk as a fraction of equity
    pub max_portfolio_heat_pct: Decimal,
    /// (halve risk at, pause trading at) consecutive losses
    pub circuit_breaker_loss_thresholds: (u32, u32),
    pub circuit_breaker_reduced_multiplier: Decimal,
    pub circuit_breaker_pause_hours: i64,
    pub min_kelly_trades: usize,
    pub fallback_kelly_fraction: Decimal,
    pub kelly_ceiling: Decimal,
    pub kelly_lookback_trades: usize,
    pub min_atr_samples: usize,
    pub atr_history_len: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: dec!(0.02),
            atr_multiplier: dec!(2.0),
            max_portfolio_heat_pct: dec!(0.06),
            circuit_breaker_loss_thresholds: (3, 5),
            circuit_breaker_reduced_multiplier: dec!(0.5),
            circuit_breaker_pause_hours: 24,
            min_kelly_trades: 20,
            fallback_kelly_fraction: dec!(0.1),
            kelly_ceiling: dec!(0.75),
            kelly_lookback_trades: 100,
            min_atr_samples: 20,
            atr_history_len: 250,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.risk_per_trade <= Decimal::ZERO || self.risk_per_trade > Decimal::ONE {
            errors.push("risk_per_trade must be in (0, 1]".to_string());
        }
        if self.atr_multiplier <= Decimal::ZERO {
            errors.push("atr_multiplier must be > 0".to_string());
        }
        if self.max_portfolio_heat_pct <= Decimal::ZERO || self.max_portfolio_heat_pct > Decimal::ONE {
            errors.push("max_portfolio_heat_pct must be in (0, 1]".to_string());
        }
        let (reduce_at, pause_at) = self.circuit_breaker_loss_thresholds;
        if reduce_at == 0 || pause_at <= reduce_at {
            errors.push("circuit_breaker_loss_thresholds must satisfy 0 < reduce < pause".to_string());
        }
        if self.circuit_breaker_reduced_multiplier < Decimal::ZERO
            || self.circuit_breaker_reduced_multiplier > Decimal::ONE
        {
            errors.push("circuit_breaker_reduced_multiplier must be in [0, 1]".to_string());
        }
        if self.circuit_breaker_pause_hours <= 0 {
            errors.push("circuit_breaker_pause_hours must be > 0".to_string());
        }
        if self.fallback_kelly_fraction < Decimal::ZERO || self.fallback_kelly_fraction > self.kelly_ceiling {
            errors.push("fallback_kelly_fraction must be in [0, kelly_ceiling]".to_string());
        }
        if self.kelly_ceiling <= Decimal::ZERO || self.kelly_ceiling > Decimal::ONE {
            errors.push("kelly_ceiling must be in (0, 1]".to_string());
        }
        if self.kelly_lookback_trades < self.min_kelly_trades {
            errors.push("kelly_lookback_trades must be >= min_kelly_trades".to_string());
        }
        if self.atr_history_len < self.min_atr_samples || self.atr_history_len == 0 {
            errors.push("atr_history_len must be >= min_atr_samples and > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
        let detector = DetectorConfig::default();
        assert_eq!(detector.retrain_interval_days, 30);
        assert_eq!(detector.transition_confidence_threshold, 0.3);
        let risk = RiskConfig::default();
        assert_eq!(risk.max_portfolio_heat_pct, dec!(0.06));
        assert_eq!(risk.circuit_breaker_loss_thresholds, (3, 5));
    }

    #[test]
    fn test_invalid_settings_are_reported() {
        let detector = DetectorConfig {
            n_states: 4,
            transition_confidence_threshold: 1.5,
            ..DetectorConfig::default()
        };
        let errors = detector.validate().unwrap_err();
        assert_eq!(errors.len(), 2);

        let risk = RiskConfig {
            circuit_breaker_loss_thresholds: (5, 3),
            risk_per_trade: Decimal::ZERO,
            ..RiskConfig::default()
        };
        assert_eq!(risk.validate().unwrap_err().len(), 2);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AppConfig::load("/nonexistent/regime-risk-config.toml").unwrap();
        assert_eq!(config.detector, DetectorConfig::default());
        assert_eq!(config.risk, RiskConfig::default());
    }
}
