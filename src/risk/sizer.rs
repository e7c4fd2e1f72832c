use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::error::{RiskError, RiskResult};
use crate::indicators::atr_percentile;
use crate::ml::hmm::RegimePrediction;
use crate::types::Side;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPosition {
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,
    pub risk_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TradeOutcome {
    pub pnl: Decimal,
    pub closed_at: DateTime<Utc>,
}

/// Account-wide risk state. Only `record_trade_result` touches the loss
/// streak and pause; sizing calls read it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortfolioRiskState {
    pub equity: Decimal,
    pub open_positions: HashMap<String, OpenPosition>,
    /// Most recent closed trades, oldest first
    pub trade_history: VecDeque<TradeOutcome>,
    pub consecutive_losses: u32,
    /// Set when the pause threshold is hit; trading resumes after it
    pub resume_at: Option<DateTime<Utc>>,
    pub atr_history: HashMap<String, VecDeque<Decimal>>,
}

impl PortfolioRiskState {
    pub fn open_risk(&self) -> Decimal {
        self.open_positions.values().map(|p| p.risk_amount).sum()
    }

    pub fn is_paused_at(&self, now: DateTime<Utc>) -> bool {
        self.resume_at.map_or(false, |resume| now < resume)
    }
}

/// Volatility-normalised size before any portfolio adjustments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AtrPositionSize {
    pub position_size: Decimal,
    pub position_value: Decimal,
    pub stop_loss: Decimal,
    pub stop_distance: Decimal,
    pub risk_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeatCheck {
    /// Dollar risk across open positions
    pub open_risk: Decimal,
    pub heat_pct: Decimal,
    pub can_open_new: bool,
    pub max_new_risk: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CircuitBreakerStatus {
    pub consecutive_losses: u32,
    pub risk_multiplier: Decimal,
    pub trading_paused: bool,
    pub resume_at: Option<DateTime<Utc>>,
}

/// The last rule that reduced the position, in evaluation order:
/// regime, circuit breaker pause, heat, ATR budget, Kelly, breaker
/// multiplier, regime multiplier, heat cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingConstraint {
    AtrBudget,
    Kelly,
    CircuitBreaker,
    Regime,
    HeatCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizingBreakdown {
    pub atr_budget_size: Decimal,
    pub atr_percentile: Decimal,
    pub kelly_fraction: Decimal,
    pub effective_risk_fraction: Decimal,
    pub circuit_breaker_multiplier: Decimal,
    pub regime_multiplier: Decimal,
    pub max_new_risk: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionSizingDecision {
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub position_size: Decimal,
    pub position_value: Decimal,
    pub stop_loss: Decimal,
    pub risk_amount: Decimal,
    pub binding: BindingConstraint,
    pub breakdown: SizingBreakdown,
}

impl PositionSizingDecision {
    pub fn is_tradeable(&self) -> bool {
        self.position_size > Decimal::ZERO
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct TradeStats {
    win_rate: Decimal,
    avg_win: Decimal,
    avg_loss: Decimal,
}

pub struct RiskSizer {
    config: RiskConfig,
    state: PortfolioRiskState,
}

impl RiskSizer {
    pub fn new(config: RiskConfig, equity: Decimal) -> RiskResult<Self> {
        config
            .validate()
            .map_err(|errors| RiskError::InvalidConfig(errors.join(", ")))?;
        if equity < Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!("equity {} is negative", equity)));
        }
        Ok(Self {
            config,
            state: PortfolioRiskState {
                equity,
                ..PortfolioRiskState::default()
            },
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn state(&self) -> &PortfolioRiskState {
        &self.state
    }

    pub fn equity(&self) -> Decimal {
        self.state.equity
    }

    pub fn update_equity(&mut self, equity: Decimal) -> RiskResult<()> {
        if equity < Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!("equity {} is negative", equity)));
        }
        self.state.equity = equity;
        Ok(())
    }

    pub fn calculate_atr_position_size(
        &self,
        entry_price: Decimal,
        atr: Decimal,
        risk_fraction: Decimal,
        atr_multiplier: Decimal,
        side: Side,
    ) -> RiskResult<AtrPositionSize> {
        if entry_price <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!(
                "entry price {} must be positive",
                entry_price
            )));
        }
        if atr <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!("ATR {} must be positive", atr)));
        }
        if risk_fraction <= Decimal::ZERO || risk_fraction > Decimal::ONE {
            return Err(RiskError::InvalidInput(format!(
                "risk fraction {} must be in (0, 1]",
                risk_fraction
            )));
        }
        if atr_multiplier <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!(
                "ATR multiplier {} must be positive",
                atr_multiplier
            )));
        }

        let stop_distance = checked(atr.checked_mul(atr_multiplier), "stop distance")?;
        let risk_amount = checked(self.state.equity.checked_mul(risk_fraction), "risk amount")?;
        let position_size = checked(risk_amount.checked_div(stop_distance), "position size")?;
        let stop_loss = match side {
            Side::Long => entry_price.checked_sub(stop_distance),
            Side::Short => entry_price.checked_add(stop_distance),
        };
        let stop_loss = checked(stop_loss, "stop loss")?;

        Ok(AtrPositionSize {
            position_size,
            position_value: checked(position_size.checked_mul(entry_price), "position value")?,
            stop_loss,
            stop_distance,
            risk_amount,
        })
    }

    /// Fractional Kelly dampened by the ATR percentile and clamped to the
    /// configured ceiling.
    pub fn get_kelly_fraction(
        &self,
        win_rate: Decimal,
        avg_win: Decimal,
        avg_loss: Decimal,
        atr_percentile: Decimal,
    ) -> RiskResult<Decimal> {
        if win_rate < Decimal::ZERO || win_rate > Decimal::ONE {
            return Err(RiskError::InvalidInput(format!(
                "win rate {} must be in [0, 1]",
                win_rate
            )));
        }
        if avg_win <= Decimal::ZERO || avg_loss <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!(
                "average win {} and loss {} must be positive",
                avg_win, avg_loss
            )));
        }
        if atr_percentile < Decimal::ZERO || atr_percentile > Decimal::ONE {
            return Err(RiskError::InvalidInput(format!(
                "ATR percentile {} must be in [0, 1]",
                atr_percentile
            )));
        }

        let base = base_kelly(win_rate, avg_win, avg_loss);
        Ok(self.dampen_kelly(base, atr_percentile))
    }

    fn dampen_kelly(&self, base: Decimal, atr_percentile: Decimal) -> Decimal {
        let dampening = if atr_percentile > dec!(0.75) {
            dec!(0.25)
        } else if atr_percentile > dec!(0.50) {
            dec!(0.50)
        } else {
            dec!(0.75)
        };
        (base * dampening).max(Decimal::ZERO).min(self.config.kelly_ceiling)
    }

    fn trade_stats(&self) -> RiskResult<TradeStats> {
        let trades = &self.state.trade_history;
        if trades.len() < self.config.min_kelly_trades {
            return Err(RiskError::InsufficientHistory {
                required: self.config.min_kelly_trades,
                actual: trades.len(),
            });
        }

        let total = Decimal::from(trades.len() as u64);
        let wins: Vec<Decimal> = trades.iter().map(|t| t.pnl).filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = trades.iter().map(|t| t.pnl).filter(|p| *p < Decimal::ZERO).collect();

        let mean = |values: &[Decimal]| {
            if values.is_empty() {
                Decimal::ZERO
            } else {
                values.iter().map(|v| v.abs()).sum::<Decimal>() / Decimal::from(values.len() as u64)
            }
        };

        Ok(TradeStats {
            win_rate: Decimal::from(wins.len() as u64) / total,
            avg_win: mean(&wins[..]),
            avg_loss: mean(&losses[..]),
        })
    }

    /// Kelly fraction estimated from recent closed trades. Too little
    /// history falls back to the configured default fraction.
    pub fn kelly_from_history(&self, atr_percentile: Decimal) -> Decimal {
        let base = match self.trade_stats() {
            Ok(stats) => base_kelly(stats.win_rate, stats.avg_win, stats.avg_loss),
            Err(e) => {
                debug!("{}; using fallback Kelly {}", e, self.config.fallback_kelly_fraction);
                self.config.fallback_kelly_fraction
            }
        };
        self.dampen_kelly(base, atr_percentile.max(Decimal::ZERO).min(Decimal::ONE))
    }

    pub fn observe_atr(&mut self, symbol: &str, atr: Decimal) -> RiskResult<()> {
        if atr <= Decimal::ZERO {
            return Err(RiskError::InvalidInput(format!("ATR {} must be positive", atr)));
        }
        let history = self.state.atr_history.entry(symbol.to_string()).or_default();
        history.push_back(atr);
        while history.len() > self.config.atr_history_len {
            history.pop_front();
        }
        Ok(())
    }

    /// Percentile of `atr` within the symbol's observed ATR history. Thin
    /// history is treated as the highest band.
    pub fn atr_percentile(&self, symbol: &str, atr: Decimal) -> Decimal {
        match self.state.atr_history.get(symbol) {
            Some(history) if history.len() >= self.config.min_atr_samples => {
                atr_percentile(history.iter(), atr).unwrap_or(Decimal::ONE)
            }
            _ => Decimal::ONE,
        }
    }

    pub fn check_portfolio_heat(&self) -> HeatCheck {
        let open_risk = self.state.open_risk();
        let equity = self.state.equity;
        let ceiling = self.config.max_portfolio_heat_pct;

        if equity <= Decimal::ZERO {
            return HeatCheck {
                open_risk,
                heat_pct: Decimal::ONE,
                can_open_new: false,
                max_new_risk: Decimal::ZERO,
            };
        }

        let heat_pct = open_risk.checked_div(equity).unwrap_or(Decimal::MAX);
        HeatCheck {
            open_risk,
            heat_pct,
            can_open_new: heat_pct < ceiling,
            max_new_risk: ceiling.saturating_sub(heat_pct).saturating_mul(equity).max(Decimal::ZERO),
        }
    }

    pub fn check_circuit_breaker(&self) -> CircuitBreakerStatus {
        self.check_circuit_breaker_at(Utc::now())
    }

    pub fn check_circuit_breaker_at(&self, now: DateTime<Utc>) -> CircuitBreakerStatus {
        let (reduce_at, _) = self.config.circuit_breaker_loss_thresholds;
        let trading_paused = self.state.is_paused_at(now);
        let risk_multiplier = if trading_paused {
            Decimal::ZERO
        } else if self.state.consecutive_losses >= reduce_at {
            self.config.circuit_breaker_reduced_multiplier
        } else {
            Decimal::ONE
        };

        CircuitBreakerStatus {
            consecutive_losses: self.state.consecutive_losses,
            risk_multiplier,
            trading_paused,
            resume_at: self.state.resume_at.filter(|_| trading_paused),
        }
    }

    pub fn record_trade_result(&mut self, pnl: Decimal) {
        self.record_trade_result_at(pnl, Utc::now())
    }

    /// Apply one closed trade. Must be called exactly once per trade; there
    /// is no deduplication.
    pub fn record_trade_result_at(&mut self, pnl: Decimal, now: DateTime<Utc>) {
        let (reduce_at, pause_at) = self.config.circuit_breaker_loss_thresholds;

        let equity = self.state.equity.saturating_add(pnl);
        if equity < Decimal::ZERO {
            warn!("Loss of {} exceeds equity {}; flooring equity at zero", pnl, self.state.equity);
        }
        self.state.equity = equity.max(Decimal::ZERO);
        self.state.trade_history.push_back(TradeOutcome { pnl, closed_at: now });
        while self.state.trade_history.len() > self.config.kelly_lookback_trades {
            self.state.trade_history.pop_front();
        }

        if pnl < Decimal::ZERO {
            self.state.consecutive_losses += 1;
            let losses = self.state.consecutive_losses;
            if losses >= pause_at {
                let resume_at = now + Duration::hours(self.config.circuit_breaker_pause_hours);
                self.state.resume_at = Some(resume_at);
                warn!(
                    "Circuit breaker tripped after {} consecutive losses; trading paused until {}",
                    losses, resume_at
                );
            } else if losses >= reduce_at {
                warn!(
                    "{} consecutive losses; risk multiplier reduced to {}",
                    losses, self.config.circuit_breaker_reduced_multiplier
                );
            }
        } else if pnl > Decimal::ZERO {
            if self.state.consecutive_losses > 0 || self.state.resume_at.is_some() {
                info!(
                    "Profitable trade resets loss streak of {}",
                    self.state.consecutive_losses
                );
            }
            self.state.consecutive_losses = 0;
            self.state.resume_at = None;
        }
    }

    pub fn get_optimal_position(
        &self,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        atr: Decimal,
        regime: &RegimePrediction,
    ) -> RiskResult<PositionSizingDecision> {
        self.get_optimal_position_at(symbol, side, entry_price, atr, regime, Utc::now())
    }

    /// Size a proposed trade against every rule. A rule that forbids the
    /// trade yields a zero-size decision rather than an error.
    pub fn get_optimal_position_at(
        &self,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        atr: Decimal,
        regime: &RegimePrediction,
        now: DateTime<Utc>,
    ) -> RiskResult<PositionSizingDecision> {
        // Validates inputs even when the result will be zero
        let budget = self.calculate_atr_position_size(
            entry_price,
            atr,
            self.config.risk_per_trade,
            self.config.atr_multiplier,
            side,
        )?;

        let breaker = self.check_circuit_breaker_at(now);
        let heat = self.check_portfolio_heat();
        let percentile = self.atr_percentile(symbol, atr);
        let kelly = self.kelly_from_history(percentile);
        let regime_multiplier = regime.permissions.position_multiplier;

        let mut breakdown = SizingBreakdown {
            atr_budget_size: budget.position_size,
            atr_percentile: percentile,
            kelly_fraction: kelly,
            effective_risk_fraction: Decimal::ZERO,
            circuit_breaker_multiplier: breaker.risk_multiplier,
            regime_multiplier,
            max_new_risk: heat.max_new_risk,
        };

        let zero = |binding: BindingConstraint, breakdown: SizingBreakdown| PositionSizingDecision {
            symbol: symbol.to_string(),
            side,
            entry_price,
            position_size: Decimal::ZERO,
            position_value: Decimal::ZERO,
            stop_loss: budget.stop_loss,
            risk_amount: Decimal::ZERO,
            binding,
            breakdown,
        };

        if !regime.permissions.allows(side) || regime_multiplier <= Decimal::ZERO {
            debug!("{} {} blocked by {} regime", symbol, side, regime.regime);
            return Ok(zero(BindingConstraint::Regime, breakdown));
        }
        if breaker.trading_paused {
            debug!("{} {} blocked: trading paused until {:?}", symbol, side, breaker.resume_at);
            return Ok(zero(BindingConstraint::CircuitBreaker, breakdown));
        }
        if !heat.can_open_new {
            debug!(
                "{} {} blocked: portfolio heat {:.4} at ceiling",
                symbol, side, heat.heat_pct
            );
            return Ok(zero(BindingConstraint::HeatCap, breakdown));
        }

        let mut binding = BindingConstraint::AtrBudget;
        let mut risk_fraction = self.config.risk_per_trade;
        if kelly < risk_fraction {
            risk_fraction = kelly;
            binding = BindingConstraint::Kelly;
        }
        if risk_fraction <= Decimal::ZERO {
            debug!("{} {} blocked: no Kelly edge", symbol, side);
            return Ok(zero(BindingConstraint::Kelly, breakdown));
        }
        if breaker.risk_multiplier < Decimal::ONE {
            risk_fraction *= breaker.risk_multiplier;
            binding = BindingConstraint::CircuitBreaker;
        }
        breakdown.effective_risk_fraction = risk_fraction;

        let sized = self.calculate_atr_position_size(
            entry_price,
            atr,
            risk_fraction,
            self.config.atr_multiplier,
            side,
        )?;

        let mut position_size = checked(sized.position_size.checked_mul(regime_multiplier), "position size")?;
        if regime_multiplier < Decimal::ONE {
            binding = BindingConstraint::Regime;
        }

        let mut risk_amount = checked(position_size.checked_mul(sized.stop_distance), "risk amount")?;
        if risk_amount > heat.max_new_risk {
            position_size = checked(heat.max_new_risk.checked_div(sized.stop_distance), "position size")?;
            risk_amount = checked(position_size.checked_mul(sized.stop_distance), "risk amount")?;
            binding = BindingConstraint::HeatCap;
        }

        debug!(
            "{} {}: size {:.6} @ {} stop {} risk ${:.2} (bound by {:?})",
            symbol, side, position_size, entry_price, sized.stop_loss, risk_amount, binding
        );

        Ok(PositionSizingDecision {
            symbol: symbol.to_string(),
            side,
            entry_price,
            position_size,
            position_value: checked(position_size.checked_mul(entry_price), "position value")?,
            stop_loss: sized.stop_loss,
            risk_amount,
            binding,
            breakdown,
        })
    }

    /// Record an executed decision as an open position. Repeated entries on
    /// the same symbol accumulate.
    pub fn register_position(&mut self, decision: &PositionSizingDecision) -> RiskResult<()> {
        if !decision.is_tradeable() {
            return Err(RiskError::InvalidInput(format!(
                "cannot register zero-size position for {}",
                decision.symbol
            )));
        }

        match self.state.open_positions.get_mut(&decision.symbol) {
            Some(existing) if existing.side == decision.side => {
                let total = checked(existing.size.checked_add(decision.position_size), "position size")?;
                let notional = existing
                    .entry_price
                    .checked_mul(existing.size)
                    .and_then(|v| v.checked_add(decision.entry_price.checked_mul(decision.position_size)?));
                let entry_price = checked(notional.and_then(|v| v.checked_div(total)), "entry price")?;
                let risk_amount = checked(existing.risk_amount.checked_add(decision.risk_amount), "risk amount")?;
                existing.entry_price = entry_price;
                existing.size = total;
                existing.risk_amount = risk_amount;
            }
            Some(existing) => {
                return Err(RiskError::InvalidInput(format!(
                    "{} already open {}",
                    decision.symbol, existing.side
                )));
            }
            None => {
                self.state.open_positions.insert(
                    decision.symbol.clone(),
                    OpenPosition {
                        side: decision.side,
                        size: decision.position_size,
                        entry_price: decision.entry_price,
                        stop_loss: decision.stop_loss,
                        risk_amount: decision.risk_amount,
                    },
                );
            }
        }

        debug!(
            "Registered {} {} risk ${:.2}; open risk now ${:.2}",
            decision.symbol,
            decision.side,
            decision.risk_amount,
            self.state.open_risk()
        );
        Ok(())
    }

    pub fn close_position(&mut self, symbol: &str, pnl: Decimal) -> RiskResult<OpenPosition> {
        self.close_position_at(symbol, pnl, Utc::now())
    }

    pub fn close_position_at(
        &mut self,
        symbol: &str,
        pnl: Decimal,
        now: DateTime<Utc>,
    ) -> RiskResult<OpenPosition> {
        let position = self
            .state
            .open_positions
            .remove(symbol)
            .ok_or_else(|| RiskError::InvalidInput(format!("no open position for {}", symbol)))?;
        self.record_trade_result_at(pnl, now);
        Ok(position)
    }
}

fn checked(value: Option<Decimal>, what: &str) -> RiskResult<Decimal> {
    value.ok_or_else(|| RiskError::InvalidInput(format!("{} overflows", what)))
}

/// Kelly edge `p - q / (W / L)`, clamped to [0, 1]. No wins means no edge;
/// no losses means the whole win rate.
fn base_kelly(win_rate: Decimal, avg_win: Decimal, avg_loss: Decimal) -> Decimal {
    if avg_win <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if avg_loss <= Decimal::ZERO {
        return win_rate.max(Decimal::ZERO).min(Decimal::ONE);
    }
    let payoff = avg_win / avg_loss;
    let kelly = win_rate - (Decimal::ONE - win_rate) / payoff;
    kelly.max(Decimal::ZERO).min(Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::hmm::MarketRegime;
    use chrono::TimeZone;

    fn sizer(equity: Decimal) -> RiskSizer {
        RiskSizer::new(RiskConfig::default(), equity).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn regime(r: MarketRegime) -> RegimePrediction {
        RegimePrediction::fixed(r, t0())
    }

    /// Enough winning history that Kelly does not bind the 2% budget.
    fn with_strong_history(sizer: &mut RiskSizer) {
        for i in 0..30 {
            let pnl = if i % 3 == 2 { dec!(-100) } else { dec!(150) };
            sizer.record_trade_result_at(pnl, t0());
        }
        sizer.record_trade_result_at(dec!(150), t0());
        sizer.update_equity(dec!(10000)).unwrap();
    }

    #[test]
    fn test_atr_position_size_scenario() {
        let sizer = sizer(dec!(10000));
        let size = sizer
            .calculate_atr_position_size(dec!(100), dec!(2), dec!(0.02), dec!(2.0), Side::Long)
            .unwrap();
        assert_eq!(size.stop_distance, dec!(4));
        assert_eq!(size.risk_amount, dec!(200));
        assert_eq!(size.position_size, dec!(50));
        assert_eq!(size.position_value, dec!(5000));
        assert_eq!(size.stop_loss, dec!(96));

        let short = sizer
            .calculate_atr_position_size(dec!(100), dec!(2), dec!(0.02), dec!(2.0), Side::Short)
            .unwrap();
        assert_eq!(short.stop_loss, dec!(104));
    }

    #[test]
    fn test_atr_risk_matches_budget() {
        let sizer = sizer(dec!(12345.67));
        for fraction in [dec!(0.001), dec!(0.013), dec!(0.5), dec!(1)] {
            let size = sizer
                .calculate_atr_position_size(dec!(37.5), dec!(1.3), fraction, dec!(2.5), Side::Long)
                .unwrap();
            let recomputed = size.position_size * size.stop_distance;
            assert!((recomputed - dec!(12345.67) * fraction).abs() < dec!(0.000001));
        }
    }

    #[test]
    fn test_atr_position_size_rejects_bad_input() {
        let sizer = sizer(dec!(10000));
        let cases = [
            (dec!(100), dec!(0), dec!(0.02)),
            (dec!(0), dec!(2), dec!(0.02)),
            (dec!(100), dec!(2), dec!(0)),
            (dec!(100), dec!(2), dec!(1.01)),
            (dec!(100), dec!(-1), dec!(0.02)),
        ];
        for (entry, atr, fraction) in cases {
            assert!(matches!(
                sizer.calculate_atr_position_size(entry, atr, fraction, dec!(2), Side::Long),
                Err(RiskError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn test_tiny_atr_overflow_is_an_error() {
        let sizer = sizer(dec!(10000));
        let atr = dec!(0.000000000000000000000000001);
        assert!(matches!(
            sizer.calculate_atr_position_size(dec!(100), atr, dec!(0.02), dec!(2), Side::Long),
            Err(RiskError::InvalidInput(_))
        ));
        assert!(matches!(
            sizer.get_optimal_position_at("BTC", Side::Long, dec!(100), atr, &regime(MarketRegime::LowVol), t0()),
            Err(RiskError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_losses_floor_equity_at_zero() {
        let mut sizer = sizer(dec!(100));
        sizer.record_trade_result(dec!(-500));
        assert_eq!(sizer.equity(), Decimal::ZERO);
        assert_eq!(sizer.state().consecutive_losses, 1);

        let size = sizer
            .calculate_atr_position_size(dec!(100), dec!(2), dec!(0.02), dec!(2), Side::Long)
            .unwrap();
        assert_eq!(size.position_size, Decimal::ZERO);
        assert_eq!(size.position_value, Decimal::ZERO);
        assert_eq!(size.risk_amount, Decimal::ZERO);

        let decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        assert!(!decision.is_tradeable());
        assert_eq!(decision.binding, BindingConstraint::HeatCap);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let inverted = RiskConfig {
            circuit_breaker_loss_thresholds: (5, 3),
            ..RiskConfig::default()
        };
        assert!(matches!(
            RiskSizer::new(inverted, dec!(10000)),
            Err(RiskError::InvalidConfig(_))
        ));
        assert!(matches!(
            RiskSizer::new(RiskConfig::default(), dec!(-1)),
            Err(RiskError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_kelly_scenario() {
        let sizer = sizer(dec!(10000));
        let kelly = sizer
            .get_kelly_fraction(dec!(0.55), dec!(150), dec!(100), dec!(0.80))
            .unwrap();
        assert_eq!(kelly, dec!(0.0625));
    }

    #[test]
    fn test_kelly_dampening_bands() {
        let sizer = sizer(dec!(10000));
        let k = |p| sizer.get_kelly_fraction(dec!(0.6), dec!(200), dec!(100), p).unwrap();
        // base = 0.6 - 0.4 / 2 = 0.4
        assert_eq!(k(dec!(0.9)), dec!(0.1));
        assert_eq!(k(dec!(0.75)), dec!(0.2));
        assert_eq!(k(dec!(0.6)), dec!(0.2));
        assert_eq!(k(dec!(0.5)), dec!(0.3));
        assert_eq!(k(dec!(0.1)), dec!(0.3));
    }

    #[test]
    fn test_kelly_negative_edge_is_zero() {
        let sizer = sizer(dec!(10000));
        let kelly = sizer
            .get_kelly_fraction(dec!(0.3), dec!(100), dec!(100), dec!(0.2))
            .unwrap();
        assert_eq!(kelly, Decimal::ZERO);
    }

    #[test]
    fn test_kelly_always_within_bounds() {
        let sizer = sizer(dec!(10000));
        for win in 0..=10 {
            for payoff in [dec!(0.1), dec!(1), dec!(3), dec!(1000)] {
                for pct in 0..=4 {
                    let kelly = sizer
                        .get_kelly_fraction(
                            Decimal::from(win) / dec!(10),
                            payoff,
                            dec!(1),
                            Decimal::from(pct) / dec!(4),
                        )
                        .unwrap();
                    assert!(kelly >= Decimal::ZERO && kelly <= dec!(0.75));
                }
            }
        }
        assert!(sizer.get_kelly_fraction(dec!(1.2), dec!(1), dec!(1), dec!(0.5)).is_err());
        assert!(sizer.get_kelly_fraction(dec!(0.5), dec!(0), dec!(1), dec!(0.5)).is_err());
    }

    #[test]
    fn test_kelly_fallback_with_thin_history() {
        let mut sizer = sizer(dec!(10000));
        for _ in 0..5 {
            sizer.record_trade_result_at(dec!(-50), t0());
        }
        assert!(matches!(
            sizer.trade_stats(),
            Err(RiskError::InsufficientHistory { required: 20, actual: 5 })
        ));
        // fallback 0.1 dampened by 0.75
        assert_eq!(sizer.kelly_from_history(dec!(0.2)), dec!(0.075));
    }

    #[test]
    fn test_kelly_from_history_uses_trades() {
        let mut sizer = sizer(dec!(10000));
        // 11 wins of 150, 9 losses of 100: base = 0.55 - 0.45 / 1.5 = 0.25
        for i in 0..20 {
            let pnl = if i < 11 { dec!(150) } else { dec!(-100) };
            sizer.record_trade_result_at(pnl, t0());
        }
        assert_eq!(sizer.kelly_from_history(dec!(0.8)), dec!(0.0625));
    }

    #[test]
    fn test_heat_boundary_is_strict() {
        let mut sizer = sizer(dec!(10000));
        let mut decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        decision.risk_amount = dec!(599.99);
        decision.position_size = dec!(1);
        sizer.register_position(&decision).unwrap();
        let heat = sizer.check_portfolio_heat();
        assert!(heat.can_open_new);
        assert_eq!(heat.max_new_risk, dec!(0.01));

        sizer.close_position_at("BTC", Decimal::ZERO, t0()).unwrap();
        decision.risk_amount = dec!(600);
        sizer.register_position(&decision).unwrap();
        let heat = sizer.check_portfolio_heat();
        assert!(!heat.can_open_new);
        assert_eq!(heat.heat_pct, dec!(0.06));
        assert_eq!(heat.max_new_risk, Decimal::ZERO);
    }

    #[test]
    fn test_heat_with_no_equity() {
        let sizer = sizer(Decimal::ZERO);
        let heat = sizer.check_portfolio_heat();
        assert!(!heat.can_open_new);
        assert_eq!(heat.max_new_risk, Decimal::ZERO);
    }

    #[test]
    fn test_circuit_breaker_progression() {
        let mut sizer = sizer(dec!(10000));
        for _ in 0..2 {
            sizer.record_trade_result_at(dec!(-10), t0());
        }
        assert_eq!(sizer.check_circuit_breaker_at(t0()).risk_multiplier, Decimal::ONE);

        sizer.record_trade_result_at(dec!(-10), t0());
        let status = sizer.check_circuit_breaker_at(t0());
        assert_eq!(status.consecutive_losses, 3);
        assert_eq!(status.risk_multiplier, dec!(0.5));
        assert!(!status.trading_paused);

        sizer.record_trade_result_at(dec!(-10), t0());
        sizer.record_trade_result_at(dec!(-10), t0());
        let status = sizer.check_circuit_breaker_at(t0());
        assert!(status.trading_paused);
        assert_eq!(status.risk_multiplier, Decimal::ZERO);
        assert_eq!(status.resume_at, Some(t0() + Duration::hours(24)));

        let later = t0() + Duration::hours(24);
        let status = sizer.check_circuit_breaker_at(later);
        assert!(!status.trading_paused);
        assert_eq!(status.risk_multiplier, dec!(0.5));
    }

    #[test]
    fn test_profit_resets_breaker() {
        let mut sizer = sizer(dec!(10000));
        for _ in 0..5 {
            sizer.record_trade_result_at(dec!(-10), t0());
        }
        assert!(sizer.check_circuit_breaker_at(t0()).trading_paused);

        sizer.record_trade_result_at(dec!(5), t0());
        let status = sizer.check_circuit_breaker_at(t0());
        assert_eq!(status.consecutive_losses, 0);
        assert!(!status.trading_paused);
        assert_eq!(status.risk_multiplier, Decimal::ONE);
        assert_eq!(sizer.equity(), dec!(9955));
    }

    #[test]
    fn test_breakeven_keeps_streak() {
        let mut sizer = sizer(dec!(10000));
        for _ in 0..3 {
            sizer.record_trade_result_at(dec!(-10), t0());
        }
        sizer.record_trade_result_at(Decimal::ZERO, t0());
        assert_eq!(sizer.check_circuit_breaker_at(t0()).consecutive_losses, 3);
    }

    #[test]
    fn test_transition_regime_yields_zero() {
        let mut sizer = sizer(dec!(10000));
        with_strong_history(&mut sizer);
        for (side, atr) in [(Side::Long, dec!(2)), (Side::Short, dec!(50))] {
            let decision = sizer
                .get_optimal_position_at("ETH", side, dec!(100), atr, &regime(MarketRegime::Transition), t0())
                .unwrap();
            assert_eq!(decision.position_size, Decimal::ZERO);
            assert_eq!(decision.binding, BindingConstraint::Regime);
            assert!(!decision.is_tradeable());
        }
    }

    #[test]
    fn test_low_vol_uses_full_atr_budget() {
        let mut sizer = sizer(dec!(10000));
        with_strong_history(&mut sizer);
        let decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        assert_eq!(decision.position_size, dec!(50));
        assert_eq!(decision.risk_amount, dec!(200));
        assert_eq!(decision.stop_loss, dec!(96));
        assert_eq!(decision.binding, BindingConstraint::AtrBudget);
    }

    #[test]
    fn test_high_vol_halves_size() {
        let mut sizer = sizer(dec!(10000));
        with_strong_history(&mut sizer);
        let decision = sizer
            .get_optimal_position_at("BTC", Side::Short, dec!(100), dec!(2), &regime(MarketRegime::HighVol), t0())
            .unwrap();
        assert_eq!(decision.position_size, dec!(25));
        assert_eq!(decision.stop_loss, dec!(104));
        assert_eq!(decision.binding, BindingConstraint::Regime);
    }

    #[test]
    fn test_circuit_breaker_halves_then_blocks() {
        let mut sizer = sizer(dec!(10000));
        with_strong_history(&mut sizer);
        for _ in 0..3 {
            sizer.record_trade_result_at(dec!(-1), t0());
        }
        sizer.update_equity(dec!(10000)).unwrap();
        let decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        assert_eq!(decision.position_size, dec!(25));
        assert_eq!(decision.binding, BindingConstraint::CircuitBreaker);

        sizer.record_trade_result_at(dec!(-1), t0());
        sizer.record_trade_result_at(dec!(-1), t0());
        let decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        assert_eq!(decision.position_size, Decimal::ZERO);
        assert_eq!(decision.binding, BindingConstraint::CircuitBreaker);
    }

    #[test]
    fn test_heat_cap_limits_new_risk() {
        let mut sizer = sizer(dec!(10000));
        with_strong_history(&mut sizer);
        let regime = regime(MarketRegime::LowVol);

        for symbol in ["BTC", "ETH"] {
            let decision = sizer
                .get_optimal_position_at(symbol, Side::Long, dec!(100), dec!(2), &regime, t0())
                .unwrap();
            sizer.register_position(&decision).unwrap();
        }
        // 400 of 600 used: next trade is capped at 200, exactly its budget
        let third = sizer
            .get_optimal_position_at("SOL", Side::Long, dec!(100), dec!(2), &regime, t0())
            .unwrap();
        assert_eq!(third.risk_amount, dec!(200));
        sizer.register_position(&third).unwrap();

        let fourth = sizer
            .get_optimal_position_at("ADA", Side::Long, dec!(100), dec!(2), &regime, t0())
            .unwrap();
        assert_eq!(fourth.position_size, Decimal::ZERO);
        assert_eq!(fourth.binding, BindingConstraint::HeatCap);

        sizer.close_position_at("BTC", dec!(50), t0()).unwrap();
        sizer.update_equity(dec!(10000)).unwrap();
        sizer.state.open_positions.get_mut("ETH").unwrap().risk_amount = dec!(300);
        let capped = sizer
            .get_optimal_position_at("ADA", Side::Long, dec!(100), dec!(2), &regime, t0())
            .unwrap();
        assert_eq!(capped.risk_amount, dec!(100));
        assert_eq!(capped.position_size, dec!(25));
        assert_eq!(capped.binding, BindingConstraint::HeatCap);
    }

    #[test]
    fn test_negative_edge_blocks_trading() {
        let mut sizer = sizer(dec!(10000));
        for i in 0..20 {
            let pnl = if i % 4 == 0 { dec!(50) } else { dec!(-100) };
            sizer.record_trade_result_at(pnl, t0());
        }
        sizer.record_trade_result_at(dec!(50), t0());
        let decision = sizer
            .get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(2), &regime(MarketRegime::LowVol), t0())
            .unwrap();
        assert_eq!(decision.position_size, Decimal::ZERO);
        assert_eq!(decision.binding, BindingConstraint::Kelly);
    }

    #[test]
    fn test_atr_percentile_tracking() {
        let mut sizer = sizer(dec!(10000));
        assert_eq!(sizer.atr_percentile("BTC", dec!(1)), Decimal::ONE);
        for i in 1..=20 {
            sizer.observe_atr("BTC", Decimal::from(i)).unwrap();
        }
        assert_eq!(sizer.atr_percentile("BTC", dec!(5)), dec!(0.25));
        assert_eq!(sizer.atr_percentile("ETH", dec!(5)), Decimal::ONE);
        assert!(sizer.observe_atr("BTC", Decimal::ZERO).is_err());
    }

    #[test]
    fn test_invalid_sizing_inputs_error() {
        let sizer = sizer(dec!(10000));
        assert!(matches!(
            sizer.get_optimal_position_at("BTC", Side::Long, dec!(100), dec!(0), &regime(MarketRegime::LowVol), t0()),
            Err(RiskError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_close_unknown_position() {
        let mut sizer = sizer(dec!(10000));
        assert!(sizer.close_position("BTC", dec!(10)).is_err());
        assert_eq!(sizer.state().trade_history.len(), 0);
    }
}
