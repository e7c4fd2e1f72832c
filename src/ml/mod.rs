pub mod hmm;
pub mod walk_forward;

pub use hmm::{MarketRegime, RegimeDetector, RegimePrediction};
pub use walk_forward::{run_walk_forward, WalkForwardConfig, WalkForwardResult};
