pub mod features;
pub mod gaussian_hmm;
pub mod persistence;
pub mod regime_detector;

pub use features::{extract_features, extract_observations, min_candles, FeatureVector, N_FEATURES};
pub use gaussian_hmm::{FitStats, GaussianHMM};
pub use regime_detector::{
    FitReport, MarketRegime, RegimeDetector, RegimeModel, RegimePrediction, TradingPermissions,
};
