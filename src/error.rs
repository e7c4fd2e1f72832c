use thiserror::Error;

/// Failures surfaced by regime detection. Bad market data is never
/// interpolated or dropped; the caller skips the cycle instead.
#[derive(Debug, Error)]
pub enum RegimeError {
    #[error("invalid detector configuration: {0}")]
    InvalidConfig(String),

    #[error("insufficient candle data: need at least {required}, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    #[error("invalid candle data: {0}")]
    DataValidation(String),

    #[error("regime model has not been fitted")]
    ModelNotFitted,

    #[error("invalid regime model: {0}")]
    InvalidModel(String),

    #[error("numerical failure: {0}")]
    Numerical(String),

    #[error("model file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("model file is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures raised by the position sizer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RiskError {
    #[error("invalid risk configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid sizing input: {0}")]
    InvalidInput(String),

    /// Too few closed trades to estimate an edge. Recovered internally by
    /// falling back to the default Kelly fraction.
    #[error("insufficient trade history: need {required} trades, have {actual}")]
    InsufficientHistory { required: usize, actual: usize },
}

pub type RegimeResult<T> = std::result::Result<T, RegimeError>;
pub type RiskResult<T> = std::result::Result<T, RiskError>;
