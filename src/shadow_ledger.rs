//! Target-vs-actual position reconciler.
//!
//! Grounded in `original_source/src/core/shadow_ledger.py`: a strategy
//! declares its intended position via `update_target`, and a periodic check
//! compares that intent against the exchange's reported position, emitting a
//! correction plan when drift exceeds a threshold and a cooldown hasn't
//! already gated the symbol. The per-symbol cooldown map follows the same
//! shape as `risk.rs`'s halt-until bookkeeping.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::config::ShadowLedgerConfig;
use crate::oms::Position;
use crate::rest_gateway::Side;

#[derive(Debug, Clone)]
struct Target {
    side: Side,
    size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub side: Side,
    pub amount: f64,
    pub reason: String,
}

struct SymbolState {
    target: Option<Target>,
    synced_at: Option<DateTime<Utc>>,
}

/// Single-writer by construction: intended to be driven only by the
/// component that owns the periodic reconciliation loop (the engine).
pub struct ShadowLedger {
    cfg: ShadowLedgerConfig,
    symbols: Mutex<HashMap<String, SymbolState>>,
}

impl ShadowLedger {
    pub fn new(cfg: ShadowLedgerConfig) -> Self {
        Self {
            cfg,
            symbols: Mutex::new(HashMap::new()),
        }
    }

    pub async fn update_target(&self, symbol: &str, side: Side, size: f64) {
        let mut symbols = self.symbols.lock().await;
        let entry = symbols.entry(symbol.to_string()).or_insert_with(|| SymbolState {
            target: None,
            synced_at: None,
        });
        entry.target = Some(Target { side, size });
    }

    /// Returns `(needs_sync, plan)`. `plan` carries a correction when one is
    /// required, or a `reason`-only plan (zero amount) when suppressed by the
    /// cooldown window; it is `None` only when there is nothing to report at
    /// all (no target, or target fully closed).
    pub async fn check_and_compute_delta(&self, symbol: &str, actual: Option<&Position>) -> (bool, Option<SyncPlan>) {
        let symbols = self.symbols.lock().await;
        let Some(state) = symbols.get(symbol) else {
            return (false, None);
        };
        let Some(target) = &state.target else {
            return (false, None);
        };
        if target.size <= 0.0 {
            return (false, None);
        }

        if let Some(synced_at) = state.synced_at {
            let elapsed = (Utc::now() - synced_at).num_seconds();
            if elapsed < self.cfg.cooldown_secs as i64 {
                let plan = SyncPlan {
                    side: target.side,
                    amount: 0.0,
                    reason: "in cooldown".to_string(),
                };
                return (false, Some(plan));
            }
        }

        let actual_signed = actual.map(|p| p.signed_size).unwrap_or(0.0);
        let target_signed = match target.side {
            Side::Buy => target.size,
            Side::Sell => -target.size,
        };

        let delta = target_signed - actual_signed;
        let drift_pct = delta.abs() / target_signed.abs();

        if drift_pct > self.cfg.sync_threshold_pct {
            let plan = SyncPlan {
                side: if delta > 0.0 { Side::Buy } else { Side::Sell },
                amount: delta.abs(),
                reason: format!("drift {:.1}% exceeds threshold {:.1}%", drift_pct * 100.0, self.cfg.sync_threshold_pct * 100.0),
            };
            (true, Some(plan))
        } else {
            (false, None)
        }
    }

    /// Starts the cooldown for `symbol`; no further sync will fire until it
    /// elapses, even if drift persists — guards against self-amplifying
    /// correction loops chasing a position that's still settling.
    pub async fn mark_synced(&self, symbol: &str) {
        let mut symbols = self.symbols.lock().await;
        if let Some(state) = symbols.get_mut(symbol) {
            state.synced_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, signed_size: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            signed_size,
            avg_entry_price: 100.0,
            unrealized_pnl: 0.0,
            leverage: 1.0,
        }
    }

    #[tokio::test]
    async fn no_target_means_no_sync() {
        let ledger = ShadowLedger::new(ShadowLedgerConfig::default());
        let (needs_sync, plan) = ledger.check_and_compute_delta("SOL-USDT-SWAP", None).await;
        assert!(!needs_sync);
        assert!(plan.is_none());
    }

    #[tokio::test]
    async fn large_drift_triggers_sync_plan_matches_scenario_5() {
        let ledger = ShadowLedger::new(ShadowLedgerConfig::default());
        ledger.update_target("SOL-USDT-SWAP", Side::Buy, 2.5).await;

        let actual = position("SOL-USDT-SWAP", 0.5);
        let (needs_sync, plan) = ledger.check_and_compute_delta("SOL-USDT-SWAP", Some(&actual)).await;

        assert!(needs_sync);
        let plan = plan.unwrap();
        assert_eq!(plan.side, Side::Buy);
        assert!((plan.amount - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cooldown_suppresses_repeat_sync_even_with_persistent_drift() {
        let ledger = ShadowLedger::new(ShadowLedgerConfig::default());
        ledger.update_target("SOL-USDT-SWAP", Side::Buy, 2.5).await;
        let actual = position("SOL-USDT-SWAP", 0.5);

        let (needs_sync, _) = ledger.check_and_compute_delta("SOL-USDT-SWAP", Some(&actual)).await;
        assert!(needs_sync);

        ledger.mark_synced("SOL-USDT-SWAP").await;
        let (needs_sync_again, plan) = ledger.check_and_compute_delta("SOL-USDT-SWAP", Some(&actual)).await;
        assert!(!needs_sync_again);
        assert_eq!(plan.unwrap().reason, "in cooldown");
    }

    #[tokio::test]
    async fn drift_within_threshold_needs_no_sync() {
        let ledger = ShadowLedger::new(ShadowLedgerConfig::default());
        ledger.update_target("BTC-USDT-SWAP", Side::Buy, 1.0).await;
        let actual = position("BTC-USDT-SWAP", 0.95);
        let (needs_sync, _) = ledger.check_and_compute_delta("BTC-USDT-SWAP", Some(&actual)).await;
        assert!(!needs_sync);
    }
}
