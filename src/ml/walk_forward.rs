use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::hmm::{min_candles, MarketRegime, RegimeDetector};
use crate::config::DetectorConfig;
use crate::error::{RegimeError, RegimeResult};
use crate::types::{trailing_window, validate_candles, Candle};

#[derive(Debug, Clone)]
pub struct WalkForwardConfig {
    /// Trailing span each model is fitted on
    pub train_window: Duration,
    /// Out-of-sample span classified before the next refit
    pub step: Duration,
    /// Candles handed to each out-of-sample prediction
    pub prediction_context: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_window: Duration::days(4 * 365),
            step: Duration::days(30),
            prediction_context: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowResult {
    pub window_num: usize,
    pub train_start: DateTime<Utc>,
    pub trained_at: DateTime<Utc>,
    pub n_train_candles: usize,
    pub log_likelihood: f64,
    pub converged: bool,
    pub oos_start: DateTime<Utc>,
    pub oos_end: DateTime<Utc>,
    pub regime_counts: BTreeMap<MarketRegime, usize>,
    /// Out-of-sample bars forced to TRANSITION by low confidence
    pub overrides: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalkForwardResult {
    pub windows: Vec<WindowResult>,
    pub regime_counts: BTreeMap<MarketRegime, usize>,
    pub skipped_windows: usize,
}

impl WalkForwardResult {
    pub fn total_predictions(&self) -> usize {
        self.regime_counts.values().sum()
    }

    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("                 WALK-FORWARD REGIMES");
        println!("{}", "=".repeat(60));
        for w in &self.windows {
            println!(
                "Window {:>3}: trained {} ({} candles, LL {:.1}{})",
                w.window_num,
                w.trained_at.format("%Y-%m-%d"),
                w.n_train_candles,
                w.log_likelihood,
                if w.converged { "" } else { ", not converged" }
            );
            let counts: Vec<String> = w
                .regime_counts
                .iter()
                .map(|(regime, count)| format!("{} {}", regime, count))
                .collect();
            println!(
                "            OOS {} to {}: {} ({} overridden)",
                w.oos_start.format("%Y-%m-%d"),
                w.oos_end.format("%Y-%m-%d"),
                counts.join(", "),
                w.overrides
            );
        }
        println!("{}", "-".repeat(60));
        let total = self.total_predictions().max(1) as f64;
        for (regime, count) in &self.regime_counts {
            println!("  {:<12} {:6} bars ({:5.1}%)", regime.as_str(), count, *count as f64 / total * 100.0);
        }
        if self.skipped_windows > 0 {
            println!("  Skipped windows: {}", self.skipped_windows);
        }
        println!("{}", "=".repeat(60));
    }
}

/// Refit on a trailing window every `step`, then classify each following
/// bar with only that model. A bar is never classified by a model that saw
/// it during training.
pub fn run_walk_forward(
    candles: &[Candle],
    detector_config: &DetectorConfig,
    config: &WalkForwardConfig,
) -> RegimeResult<WalkForwardResult> {
    if config.step <= Duration::zero() || config.train_window <= Duration::zero() {
        return Err(RegimeError::DataValidation(
            "walk-forward train window and step must be positive".to_string(),
        ));
    }
    detector_config
        .validate()
        .map_err(|errors| RegimeError::InvalidConfig(errors.join(", ")))?;
    let required_context = min_candles(detector_config.lookback_window);
    if config.prediction_context < required_context {
        return Err(RegimeError::DataValidation(format!(
            "prediction context {} is shorter than the {} candles a prediction needs",
            config.prediction_context, required_context
        )));
    }
    let first = candles.first().ok_or(RegimeError::InsufficientData {
        required: detector_config.min_fit_candles,
        actual: 0,
    })?;
    validate_candles(candles)?;

    let mut windows = Vec::new();
    let mut totals = BTreeMap::new();
    let mut skipped = 0;

    let mut cursor = first.timestamp + config.train_window;
    let mut split = candles.partition_point(|c| c.timestamp < cursor);

    while split < candles.len() {
        let next_cursor = cursor + config.step;
        let end = candles.partition_point(|c| c.timestamp < next_cursor);
        if end == split {
            // Gap in the data: no bars fall in this step
            cursor = next_cursor;
            continue;
        }

        let history = &candles[..split];
        let train = trailing_window(history, config.train_window);
        let trained_at = history[history.len() - 1].timestamp;

        let mut detector = RegimeDetector::new(detector_config.clone())?;
        let report = match detector.fit_at(train, trained_at) {
            Ok(report) => report,
            Err(e @ RegimeError::InsufficientData { .. }) | Err(e @ RegimeError::Numerical(_)) => {
                warn!("Skipping window ending {}: {}", cursor, e);
                skipped += 1;
                cursor = next_cursor;
                split = end;
                continue;
            }
            Err(e) => return Err(e),
        };

        let mut regime_counts = BTreeMap::new();
        let mut overrides = 0;
        for i in split..end {
            let from = (i + 1).saturating_sub(config.prediction_context);
            let prediction = detector.predict_regime(&candles[from..=i])?;
            if prediction.is_overridden() {
                overrides += 1;
            }
            *regime_counts.entry(prediction.regime).or_insert(0) += 1;
            *totals.entry(prediction.regime).or_insert(0) += 1;
        }

        info!(
            "Window {}: trained on {} candles to {}, classified {} bars",
            windows.len() + 1,
            train.len(),
            trained_at,
            end - split
        );

        windows.push(WindowResult {
            window_num: windows.len() + 1,
            train_start: train[0].timestamp,
            trained_at,
            n_train_candles: train.len(),
            log_likelihood: report.log_likelihood,
            converged: report.converged,
            oos_start: candles[split].timestamp,
            oos_end: candles[end - 1].timestamp,
            regime_counts,
            overrides,
        });

        cursor = next_cursor;
        split = end;
    }

    Ok(WalkForwardResult {
        windows,
        regime_counts: totals,
        skipped_windows: skipped,
    })
}
