//! Market-regime detection with a three-state Gaussian HMM, and
//! volatility-aware position sizing gated by the detected regime.

pub mod config;
pub mod error;
pub mod indicators;
pub mod ml;
pub mod risk;
pub mod types;

pub use config::{AppConfig, DetectorConfig, RiskConfig};
pub use error::{RegimeError, RegimeResult, RiskError, RiskResult};
pub use ml::{MarketRegime, RegimeDetector, RegimePrediction};
pub use risk::{PositionSizingDecision, RiskSizer, SharedRiskSizer};
pub use types::{Candle, Side};
