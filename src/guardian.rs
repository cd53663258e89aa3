//! Out-of-band meltdown detector and one-shot breaker.
//!
//! Grounded in `original_source/src/safety/guardian.py` (`Guardian`): the
//! four detectors (runaway event loop, repeated error logs, equity
//! avalanche, WS reconnect death spiral), the rolling 10-minute equity
//! window, the idempotent one-shot trip sequence, and the meltdown-snapshot
//! file naming convention are all carried over from there.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::GuardianConfig;
use crate::event_bus::{EventBus, EventKind};
use crate::oms::Oms;
use crate::rest_gateway::RestGateway;
use crate::ws_gateway::WsGateway;

const EQUITY_WINDOW_SAMPLES: usize = 120;
const LOG_TAIL_LINES: usize = 1_000;
const SNAPSHOT_LOG_LINES: usize = 100;

struct Sample {
    equity: f64,
    reconnect_sum: u64,
}

struct State {
    window: VecDeque<Sample>,
    last_event_counts: HashMap<EventKind, u64>,
    triggered: bool,
    trigger_reason: Option<String>,
    snapshot_path: Option<PathBuf>,
}

/// Runs its own periodic loop independent of the event bus dispatch loop,
/// by design — a meltdown in the dispatch loop itself must still be
/// detectable.
pub struct Guardian {
    cfg: GuardianConfig,
    event_bus: EventBus,
    rest: Arc<dyn RestGateway>,
    oms: Arc<Oms>,
    ws_public: WsGateway,
    ws_private: WsGateway,
    strategies_enabled: Arc<AtomicBool>,
    state: Mutex<State>,
}

impl Guardian {
    pub fn new(
        cfg: GuardianConfig,
        event_bus: EventBus,
        rest: Arc<dyn RestGateway>,
        oms: Arc<Oms>,
        ws_public: WsGateway,
        ws_private: WsGateway,
        strategies_enabled: Arc<AtomicBool>,
    ) -> Self {
        if let Err(e) = std::fs::create_dir_all(&cfg.snapshot_path) {
            log::warn!("guardian: could not create snapshot directory {}: {e}", cfg.snapshot_path);
        }
        Self {
            cfg,
            event_bus,
            rest,
            oms,
            ws_public,
            ws_private,
            strategies_enabled,
            state: Mutex::new(State {
                window: VecDeque::with_capacity(EQUITY_WINDOW_SAMPLES),
                last_event_counts: HashMap::new(),
                triggered: false,
                trigger_reason: None,
                snapshot_path: None,
            }),
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let guardian = self.clone();
        tokio::spawn(async move { guardian.run_loop().await })
    }

    async fn run_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.cfg.check_interval_secs));
        loop {
            interval.tick().await;
            if self.is_meltdown_triggered().await {
                continue;
            }
            self.tick().await;
        }
    }

    async fn tick(&self) {
        let equity = self.rest.get_balance("USDT").await.unwrap_or(0.0);
        let reconnect_sum = self.ws_public.reconnect_count() + self.ws_private.reconnect_count();

        {
            let mut state = self.state.lock().await;
            if state.window.len() == EQUITY_WINDOW_SAMPLES {
                state.window.pop_front();
            }
            state.window.push_back(Sample { equity, reconnect_sum });
        }

        if let Some(reason) = self.check_runaway_event_loop().await {
            self.trip(reason).await;
            return;
        }
        if let Some(reason) = self.check_repeated_errors().await {
            self.trip(reason).await;
            return;
        }
        if let Some(reason) = self.check_equity_avalanche().await {
            self.trip(reason).await;
            return;
        }
        if let Some(reason) = self.check_ws_reconnect_spiral().await {
            self.trip(reason).await;
            return;
        }
    }

    async fn check_runaway_event_loop(&self) -> Option<String> {
        let counts = self.event_bus.get_event_stats().await;
        let mut state = self.state.lock().await;
        let mut tripped = None;
        for (kind, count) in &counts {
            let previous = state.last_event_counts.get(kind).copied().unwrap_or(0);
            let delta = count.saturating_sub(previous);
            if delta > self.cfg.event_loop_threshold {
                tripped = Some(format!(
                    "runaway event loop: {:?} published {delta} events in the last interval (threshold {})",
                    kind, self.cfg.event_loop_threshold
                ));
                break;
            }
        }
        state.last_event_counts = counts;
        tripped
    }

    /// Scans the last 1,000 lines of the configured log file for `ERROR`
    /// and `CRITICAL` markers, matching the original's `_read_recent_logs`.
    async fn check_repeated_errors(&self) -> Option<String> {
        let content = match std::fs::read_to_string(&self.cfg.log_file) {
            Ok(c) => c,
            Err(_) => return None,
        };
        let lines: Vec<&str> = content.lines().collect();
        let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];

        let mut critical_count = 0u32;
        let mut error_occurrences: HashMap<&str, u32> = HashMap::new();
        for line in tail {
            if line.contains("CRITICAL") {
                critical_count += 1;
            } else if line.contains("ERROR") {
                *error_occurrences.entry(*line).or_insert(0) += 1;
            }
        }

        if critical_count >= self.cfg.critical_log_threshold {
            return Some(format!(
                "repeated errors: {critical_count} CRITICAL log lines >= threshold {}",
                self.cfg.critical_log_threshold
            ));
        }
        if let Some((message, count)) = error_occurrences.iter().max_by_key(|(_, c)| **c) {
            if *count >= self.cfg.error_log_threshold {
                return Some(format!(
                    "repeated errors: identical error repeated {count} times (threshold {}): {message}",
                    self.cfg.error_log_threshold
                ));
            }
        }
        None
    }

    async fn check_equity_avalanche(&self) -> Option<String> {
        let state = self.state.lock().await;
        let current = state.window.back()?.equity;
        let max = state.window.iter().map(|s| s.equity).fold(f64::MIN, f64::max);
        if max <= 0.0 {
            return None;
        }
        let drawdown = (current - max) / max;
        if drawdown < -self.cfg.equity_drop_threshold_pct {
            Some(format!(
                "equity avalanche: {:.2}% drop from window max {max:.2} to {current:.2}",
                drawdown * 100.0
            ))
        } else {
            None
        }
    }

    async fn check_ws_reconnect_spiral(&self) -> Option<String> {
        let state = self.state.lock().await;
        let current = state.window.back()?.reconnect_sum;
        let oldest = state.window.front()?.reconnect_sum;
        let delta = current.saturating_sub(oldest);
        if delta >= self.cfg.ws_reconnect_threshold as u64 {
            Some(format!(
                "ws reconnect death spiral: {delta} reconnects within the window (threshold {})",
                self.cfg.ws_reconnect_threshold
            ))
        } else {
            None
        }
    }

    async fn trip(&self, reason: String) {
        {
            let mut state = self.state.lock().await;
            if state.triggered {
                return;
            }
            state.triggered = true;
            state.trigger_reason = Some(reason.clone());
        }

        log::error!("CRITICAL: guardian tripped: {reason}");
        self.strategies_enabled.store(false, Ordering::SeqCst);

        if let Err(e) = self.rest.cancel_all_orders(None).await {
            log::error!("guardian: cancel_all_orders failed during trip: {e}");
        }

        if self.cfg.auto_close_on_meltdown {
            let positions = self.oms.positions().get_all_positions().await;
            for position in positions.into_iter().filter(|p| p.signed_size != 0.0) {
                log::error!("guardian: auto-close not wired to a close-position action for {} (out of scope)", position.symbol);
            }
        }

        let path = self.write_snapshot(&reason).await;
        let mut state = self.state.lock().await;
        state.snapshot_path = path;
    }

    async fn write_snapshot(&self, reason: &str) -> Option<PathBuf> {
        let now = Utc::now();
        let filename = format!("snapshot_{}.json", now.format("%Y%m%d_%H%M%S"));
        let path = PathBuf::from(&self.cfg.snapshot_path).join(filename);

        let equity = self.rest.get_balance("USDT").await.unwrap_or(0.0);
        let positions = self.oms.positions().get_all_positions().await;
        let orders = self.oms.get_all_orders().await;
        let logs = self.tail_log_lines(SNAPSHOT_LOG_LINES);

        let positions_json: Vec<_> = positions
            .iter()
            .map(|p| json!({"symbol": p.symbol, "signed_size": p.signed_size, "avg_entry_price": p.avg_entry_price}))
            .collect();
        let orders_json: Vec<_> = orders
            .iter()
            .map(|o| json!({"order_id": o.order_id, "symbol": o.symbol, "status": format!("{:?}", o.status)}))
            .collect();

        let snapshot = json!({
            "trigger_reason": reason,
            "time": now.to_rfc3339(),
            "capital": equity,
            "positions": positions_json,
            "orders": orders_json,
            "last_100_logs": logs,
        });

        match serde_json::to_string_pretty(&snapshot) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&path, content) {
                    log::error!("guardian: failed to write meltdown snapshot to {path:?}: {e}");
                    return None;
                }
                log::info!("guardian: meltdown snapshot written to {path:?}");
                Some(path)
            }
            Err(e) => {
                log::error!("guardian: failed to serialize meltdown snapshot: {e}");
                None
            }
        }
    }

    fn tail_log_lines(&self, n: usize) -> Vec<String> {
        match std::fs::read_to_string(&self.cfg.log_file) {
            Ok(content) => {
                let lines: Vec<&str> = content.lines().collect();
                lines[lines.len().saturating_sub(n)..]
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            }
            Err(_) => Vec::new(),
        }
    }

    pub async fn is_meltdown_triggered(&self) -> bool {
        self.state.lock().await.triggered
    }

    pub async fn get_meltdown_info(&self) -> Option<(String, Option<PathBuf>)> {
        let state = self.state.lock().await;
        state.trigger_reason.clone().map(|reason| (reason, state.snapshot_path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::oms::PositionManager;
    use crate::rest_gateway::NullRestGateway;
    use crate::ws_public::build_public_gateway;
    use crate::ws_private::build_private_gateway;
    use crate::config::{ExchangeCreds, RiskLimits};

    fn guardian_with_cfg(cfg: GuardianConfig) -> Arc<Guardian> {
        let event_bus = EventBus::new(1_000);
        let rest = Arc::new(NullRestGateway::default());
        let oms = Arc::new(Oms::new(rest.clone(), event_bus.clone(), RiskLimits::default(), Arc::new(PositionManager::new())));
        let ws_public = build_public_gateway("wss://example.invalid/public", vec!["BTC-USDT-SWAP".into()], event_bus.clone());
        let creds = ExchangeCreds {
            api_key: "k".into(),
            secret_key: "s".into(),
            passphrase: "p".into(),
            demo: true,
        };
        let ws_private = build_private_gateway("wss://example.invalid/private", creds, event_bus.clone());
        Arc::new(Guardian::new(
            cfg,
            event_bus,
            rest,
            oms,
            ws_public,
            ws_private,
            Arc::new(AtomicBool::new(true)),
        ))
    }

    #[tokio::test]
    async fn equity_avalanche_trips_and_is_idempotent() {
        let guardian = guardian_with_cfg(GuardianConfig {
            equity_drop_threshold_pct: 0.10,
            ..GuardianConfig::default()
        });

        {
            let mut state = guardian.state.lock().await;
            state.window.push_back(Sample { equity: 10_000.0, reconnect_sum: 0 });
            state.window.push_back(Sample { equity: 8_900.0, reconnect_sum: 0 });
        }

        assert!(!guardian.is_meltdown_triggered().await);
        let reason = guardian.check_equity_avalanche().await;
        assert!(reason.is_some());
        guardian.trip(reason.unwrap()).await;
        assert!(guardian.is_meltdown_triggered().await);

        let info_before = guardian.get_meltdown_info().await.unwrap();
        guardian.trip("a different reason entirely".to_string()).await;
        let info_after = guardian.get_meltdown_info().await.unwrap();
        assert_eq!(info_before.0, info_after.0, "second trip must be a no-op");
    }

    #[tokio::test]
    async fn no_drop_does_not_trip() {
        let guardian = guardian_with_cfg(GuardianConfig::default());
        {
            let mut state = guardian.state.lock().await;
            state.window.push_back(Sample { equity: 10_000.0, reconnect_sum: 0 });
            state.window.push_back(Sample { equity: 9_950.0, reconnect_sum: 0 });
        }
        assert!(guardian.check_equity_avalanche().await.is_none());
    }

    #[tokio::test]
    async fn ws_reconnect_spiral_trips_on_window_delta() {
        let guardian = guardian_with_cfg(GuardianConfig {
            ws_reconnect_threshold: 5,
            ..GuardianConfig::default()
        });
        {
            let mut state = guardian.state.lock().await;
            state.window.push_back(Sample { equity: 10_000.0, reconnect_sum: 0 });
            state.window.push_back(Sample { equity: 10_000.0, reconnect_sum: 7 });
        }
        assert!(guardian.check_ws_reconnect_spiral().await.is_some());
    }
}
