pub mod shared;
pub mod sizer;

pub use shared::{RiskEvent, SharedRiskSizer};
pub use sizer::{
    AtrPositionSize, BindingConstraint, CircuitBreakerStatus, HeatCheck, OpenPosition,
    PortfolioRiskState, PositionSizingDecision, RiskSizer, SizingBreakdown,
};
