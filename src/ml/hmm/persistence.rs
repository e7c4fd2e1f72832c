use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::info;

use super::features::N_FEATURES;
use super::gaussian_hmm::GaussianHMM;
use super::regime_detector::{MarketRegime, RegimeModel};
use crate::error::{RegimeError, RegimeResult};

const SCHEMA_VERSION: u32 = 1;

/// On-disk form of a fitted regime model.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegimeModelFile {
    schema_version: u32,
    n_states: usize,
    n_features: usize,
    lookback_window: usize,
    start_prob: Vec<f64>,
    transition: Vec<Vec<f64>>,
    means: Vec<Vec<f64>>,
    covars: Vec<Vec<Vec<f64>>>,
    state_labels: Vec<MarketRegime>,
    trained_at: DateTime<Utc>,
}

fn matrix_to_rows(matrix: &Array2<f64>) -> Vec<Vec<f64>> {
    matrix.rows().into_iter().map(|row| row.to_vec()).collect()
}

fn rows_to_matrix(rows: &[Vec<f64>], what: &str) -> RegimeResult<Array2<f64>> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != n_cols) {
        return Err(RegimeError::InvalidModel(format!("{} has ragged rows", what)));
    }
    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| RegimeError::InvalidModel(format!("{}: {}", what, e)))
}

impl RegimeModel {
    /// Write the model as pretty JSON. The file handle is closed on every
    /// path, including serialisation failures.
    pub fn save(&self, path: impl AsRef<Path>) -> RegimeResult<()> {
        let path = path.as_ref();
        let file = RegimeModelFile {
            schema_version: SCHEMA_VERSION,
            n_states: self.hmm.n_states,
            n_features: self.hmm.n_features,
            lookback_window: self.lookback_window,
            start_prob: self.hmm.start_prob.to_vec(),
            transition: matrix_to_rows(&self.hmm.transition),
            means: matrix_to_rows(&self.hmm.means),
            covars: self.hmm.covars.iter().map(matrix_to_rows).collect(),
            state_labels: self.state_labels.clone(),
            trained_at: self.trained_at,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &file)?;
        writer.flush()?;

        info!(
            "Saved regime model (trained {}) to {}",
            self.trained_at,
            path.display()
        );
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> RegimeResult<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let file: RegimeModelFile = serde_json::from_reader(reader)?;

        if file.schema_version != SCHEMA_VERSION {
            return Err(RegimeError::InvalidModel(format!(
                "unsupported schema version {}",
                file.schema_version
            )));
        }
        if file.n_states != 3 {
            return Err(RegimeError::InvalidModel(format!(
                "expected 3 states, found {}",
                file.n_states
            )));
        }
        if file.n_features != N_FEATURES {
            return Err(RegimeError::InvalidModel(format!(
                "expected {} features, found {}",
                N_FEATURES, file.n_features
            )));
        }
        if file.state_labels.len() != file.n_states
            || !file.state_labels.contains(&MarketRegime::LowVol)
            || !file.state_labels.contains(&MarketRegime::HighVol)
        {
            return Err(RegimeError::InvalidModel(
                "state labels must map one state each to LOW_VOL and HIGH_VOL".to_string(),
            ));
        }

        let means = rows_to_matrix(&file.means, "means")?;
        if means.ncols() != file.n_features {
            return Err(RegimeError::InvalidModel(format!(
                "means have {} features, header says {}",
                means.ncols(),
                file.n_features
            )));
        }
        let covars = file
            .covars
            .iter()
            .map(|c| rows_to_matrix(c, "covariance"))
            .collect::<RegimeResult<Vec<_>>>()?;

        let hmm = GaussianHMM::from_parameters(
            Array1::from_vec(file.start_prob),
            rows_to_matrix(&file.transition, "transition")?,
            means,
            covars,
        )?;
        if hmm.n_states != file.n_states {
            return Err(RegimeError::InvalidModel(format!(
                "parameters describe {} states, header says {}",
                hmm.n_states, file.n_states
            )));
        }

        info!(
            "Loaded regime model (trained {}) from {}",
            file.trained_at,
            path.display()
        );

        Ok(Self {
            hmm,
            state_labels: file.state_labels,
            lookback_window: file.lookback_window,
            trained_at: file.trained_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::regime_detector::tests::synthetic_candles;
    use super::super::regime_detector::RegimeDetector;
    use super::*;
    use crate::config::DetectorConfig;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("regime_risk_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_save_and_reload_predicts_identically() {
        let candles = synthetic_candles(600);
        let mut detector = RegimeDetector::new(DetectorConfig::default()).unwrap();
        detector.fit(&candles).unwrap();

        let path = temp_path("roundtrip");
        detector.save_model(&path).unwrap();

        let restored = RegimeDetector::from_model_file(DetectorConfig::default(), &path).unwrap();
        let original = detector.model().unwrap();
        let reloaded = restored.model().unwrap();
        assert_eq!(reloaded.trained_at, original.trained_at);
        assert_eq!(reloaded.state_labels, original.state_labels);

        let window = &candles[candles.len() - 60..];
        let before = detector.predict_regime(window).unwrap();
        let after = restored.predict_regime(window).unwrap();
        assert_eq!(before.regime, after.regime);
        assert_eq!(before.state, after.state);
        for (a, b) in before.state_probabilities.iter().zip(&after.state_probabilities) {
            assert!((a - b).abs() < 1e-9);
        }

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_save_without_model_fails() {
        let detector = RegimeDetector::new(DetectorConfig::default()).unwrap();
        assert!(matches!(
            detector.save_model(temp_path("unfitted")),
            Err(RegimeError::ModelNotFitted)
        ));
    }

    #[test]
    fn test_load_rejects_wrong_state_count() {
        let path = temp_path("two_states");
        let json = serde_json::json!({
            "schema_version": 1,
            "n_states": 2,
            "n_features": 1,
            "lookback_window": 20,
            "start_prob": [0.5, 0.5],
            "transition": [[0.9, 0.1], [0.1, 0.9]],
            "means": [[0.0], [1.0]],
            "covars": [[[1.0]], [[1.0]]],
            "state_labels": ["LOW_VOL", "HIGH_VOL"],
            "trained_at": "2024-01-01T00:00:00Z"
        });
        std::fs::write(&path, json.to_string()).unwrap();
        assert!(matches!(
            RegimeModel::load(&path),
            Err(RegimeError::InvalidModel(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            RegimeModel::load(temp_path("does_not_exist")),
            Err(RegimeError::Io(_))
        ));
    }
}
