use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use super::sizer::{
    CircuitBreakerStatus, HeatCheck, OpenPosition, PortfolioRiskState, PositionSizingDecision,
    RiskSizer,
};
use crate::error::RiskResult;
use crate::ml::hmm::RegimePrediction;
use crate::types::Side;

#[derive(Debug, Clone, Serialize)]
pub enum RiskEvent {
    PositionOpened(PositionSizingDecision),
    PositionClosed { symbol: String, pnl: Decimal },
    TradingPaused { resume_at: DateTime<Utc> },
}

/// Risk sizer shared between concurrent strategy tasks. Every
/// read-modify-write runs under one lock, so two tasks cannot both size
/// against the same heat headroom.
#[derive(Clone)]
pub struct SharedRiskSizer {
    inner: Arc<Mutex<RiskSizer>>,
    event_tx: broadcast::Sender<RiskEvent>,
}

impl SharedRiskSizer {
    pub fn new(sizer: RiskSizer) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(sizer)),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RiskEvent> {
        self.event_tx.subscribe()
    }

    pub async fn snapshot(&self) -> PortfolioRiskState {
        self.inner.lock().await.state().clone()
    }

    /// Size a trade and, if it is tradeable, register it before the lock is
    /// released.
    pub async fn size_and_register(
        &self,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        atr: Decimal,
        regime: &RegimePrediction,
    ) -> RiskResult<PositionSizingDecision> {
        let mut sizer = self.inner.lock().await;
        let decision = sizer.get_optimal_position(symbol, side, entry_price, atr, regime)?;
        if decision.is_tradeable() {
            sizer.register_position(&decision)?;
            let _ = self.event_tx.send(RiskEvent::PositionOpened(decision.clone()));
        }
        Ok(decision)
    }

    pub async fn get_optimal_position(
        &self,
        symbol: &str,
        side: Side,
        entry_price: Decimal,
        atr: Decimal,
        regime: &RegimePrediction,
    ) -> RiskResult<PositionSizingDecision> {
        self.inner
            .lock()
            .await
            .get_optimal_position(symbol, side, entry_price, atr, regime)
    }

    pub async fn close_position(&self, symbol: &str, pnl: Decimal) -> RiskResult<OpenPosition> {
        let now = Utc::now();
        let mut sizer = self.inner.lock().await;
        let was_paused = sizer.state().is_paused_at(now);
        let position = sizer.close_position_at(symbol, pnl, now)?;
        info!("Closed {} {} with PnL ${:.2}", symbol, position.side, pnl);
        let _ = self.event_tx.send(RiskEvent::PositionClosed {
            symbol: symbol.to_string(),
            pnl,
        });
        self.notify_pause(&sizer, was_paused, now);
        Ok(position)
    }

    pub async fn record_trade_result(&self, pnl: Decimal) {
        let now = Utc::now();
        let mut sizer = self.inner.lock().await;
        let was_paused = sizer.state().is_paused_at(now);
        sizer.record_trade_result_at(pnl, now);
        self.notify_pause(&sizer, was_paused, now);
    }

    /// Announce a pause only when this trade is the one that tripped it.
    fn notify_pause(&self, sizer: &RiskSizer, was_paused: bool, now: DateTime<Utc>) {
        if was_paused {
            return;
        }
        let status = sizer.check_circuit_breaker_at(now);
        if let (true, Some(resume_at)) = (status.trading_paused, status.resume_at) {
            let _ = self.event_tx.send(RiskEvent::TradingPaused { resume_at });
        }
    }

    pub async fn observe_atr(&self, symbol: &str, atr: Decimal) -> RiskResult<()> {
        self.inner.lock().await.observe_atr(symbol, atr)
    }

    pub async fn update_equity(&self, equity: Decimal) -> RiskResult<()> {
        self.inner.lock().await.update_equity(equity)
    }

    pub async fn check_portfolio_heat(&self) -> HeatCheck {
        self.inner.lock().await.check_portfolio_heat()
    }

    pub async fn check_circuit_breaker(&self) -> CircuitBreakerStatus {
        self.inner.lock().await.check_circuit_breaker()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RiskConfig;
    use crate::ml::hmm::MarketRegime;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast::error::TryRecvError;

    fn shared(equity: Decimal) -> SharedRiskSizer {
        SharedRiskSizer::new(RiskSizer::new(RiskConfig::default(), equity).unwrap())
    }

    fn low_vol() -> RegimePrediction {
        RegimePrediction::fixed(MarketRegime::LowVol, Utc::now())
    }

    #[tokio::test]
    async fn test_concurrent_sizing_respects_heat() {
        let sizer = shared(dec!(10000));
        let regime = low_vol();

        let mut handles = Vec::new();
        for i in 0..8 {
            let sizer = sizer.clone();
            let regime = regime.clone();
            handles.push(tokio::spawn(async move {
                sizer
                    .size_and_register(&format!("SYM{}", i), Side::Long, dec!(100), dec!(2), &regime)
                    .await
                    .unwrap()
            }));
        }

        let mut opened = 0;
        for handle in handles {
            if handle.await.unwrap().is_tradeable() {
                opened += 1;
            }
        }

        // 200 per trade against a 600 ceiling
        assert_eq!(opened, 3);
        let heat = sizer.check_portfolio_heat().await;
        assert_eq!(heat.open_risk, dec!(600));
        assert!(!heat.can_open_new);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let sizer = shared(dec!(10000));
        let mut events = sizer.subscribe();

        sizer
            .size_and_register("BTC", Side::Long, dec!(100), dec!(2), &low_vol())
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), RiskEvent::PositionOpened(_)));

        sizer.close_position("BTC", dec!(-25)).await.unwrap();
        match events.recv().await.unwrap() {
            RiskEvent::PositionClosed { symbol, pnl } => {
                assert_eq!(symbol, "BTC");
                assert_eq!(pnl, dec!(-25));
            }
            other => panic!("unexpected event {:?}", other),
        }

        for _ in 0..4 {
            sizer.record_trade_result(dec!(-25)).await;
        }
        assert!(matches!(events.recv().await.unwrap(), RiskEvent::TradingPaused { .. }));
        assert!(sizer.check_circuit_breaker().await.trading_paused);
    }

    #[tokio::test]
    async fn test_pause_is_announced_once() {
        let sizer = shared(dec!(10000));
        let mut events = sizer.subscribe();

        for _ in 0..7 {
            sizer.record_trade_result(dec!(-25)).await;
        }
        assert!(sizer.check_circuit_breaker().await.trading_paused);
        assert!(matches!(events.try_recv(), Ok(RiskEvent::TradingPaused { .. })));
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_snapshot_outside_runtime() {
        let sizer = shared(dec!(5000));
        tokio_test::block_on(async {
            sizer.update_equity(dec!(7500)).await.unwrap();
            sizer.observe_atr("ETH", dec!(12)).await.unwrap();
            let state = sizer.snapshot().await;
            assert_eq!(state.equity, dec!(7500));
            assert_eq!(state.atr_history["ETH"].len(), 1);
            assert!(state.open_positions.is_empty());
        });
    }
}
