//! Owns every long-lived component and wires events between them.
//!
//! Grounded in §9's re-architecture guidance ("model as an explicit Engine
//! value that owns all long-lived components") — this replaces the
//! teacher's ad hoc `main.rs` wiring (global-ish `SimExchange`/
//! `MmExecutionEngine` construction inline in `main`) with a single owning
//! struct and an explicit `start`/`stop` lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::guardian::Guardian;
use crate::market_data::MarketDataManager;
use crate::monitor::{FeedbackAction, PerformanceMonitor};
use crate::oms::{Oms, PositionManager, SubmitOrderRequest};
use crate::persistence::{self, EngineState};
use crate::position_sizer::PositionSizer;
use crate::rest_gateway::{OkxRestGateway, OrderType, RestGateway};
use crate::shadow_ledger::ShadowLedger;
use crate::ws_gateway::WsGateway;
use crate::ws_private::build_private_gateway;
use crate::ws_public::build_public_gateway;

const QUOTE_CCY: &str = "USDT";

/// Top-level owner of the Event Bus, both gateways, market data, OMS,
/// position sizer, shadow ledger, and Guardian. Strategy/alpha logic lives
/// outside this crate; `Engine` exposes the primitives a strategy polls and
/// drives (`market_data()`, `oms()`, `position_sizer()`) plus the lifecycle
/// and the Guardian-facing `disable_all_strategies` hook.
pub struct Engine {
    config: EngineConfig,
    event_bus: EventBus,
    rest: Arc<dyn RestGateway>,
    ws_public: WsGateway,
    ws_private: WsGateway,
    market_data: MarketDataManager,
    oms: Arc<Oms>,
    position_sizer: Mutex<PositionSizer>,
    performance_monitor: Mutex<PerformanceMonitor>,
    shadow_ledger: Arc<ShadowLedger>,
    guardian: Arc<Guardian>,
    strategies_enabled: Arc<AtomicBool>,
    symbols: Vec<String>,
    dispatch_handle: Mutex<Option<JoinHandle<()>>>,
    guardian_handle: Mutex<Option<JoinHandle<()>>>,
    shadow_ledger_handle: Mutex<Option<JoinHandle<()>>>,
    risk_poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, symbols: Vec<String>) -> Self {
        let event_bus = EventBus::new(config.event_bus_capacity);

        let rest: Arc<dyn RestGateway> = match &config.creds {
            Some(creds) => Arc::new(OkxRestGateway::new(config.rest_base_url.clone(), creds.clone())),
            None => Arc::new(crate::rest_gateway::NullRestGateway::default()),
        };

        let market_data = MarketDataManager::new();
        let positions = Arc::new(PositionManager::new());
        let oms = Arc::new(Oms::new(rest.clone(), event_bus.clone(), config.risk.clone(), positions));
        let position_sizer = Mutex::new(PositionSizer::new(config.sizing.clone()));
        let performance_monitor = Mutex::new(PerformanceMonitor::new(config.monitor.clone()));
        let shadow_ledger = Arc::new(ShadowLedger::new(config.shadow_ledger.clone()));
        let strategies_enabled = Arc::new(AtomicBool::new(true));

        let ws_public = build_public_gateway(&config.ws_public_url, symbols.clone(), event_bus.clone());
        let ws_private = match &config.creds {
            Some(creds) => build_private_gateway(&config.ws_private_url, creds.clone(), event_bus.clone()),
            None => build_private_gateway(&config.ws_private_url, crate::config::ExchangeCreds {
                api_key: String::new(),
                secret_key: String::new(),
                passphrase: String::new(),
                demo: true,
            }, event_bus.clone()),
        };

        let guardian = Arc::new(Guardian::new(
            config.guardian.clone(),
            event_bus.clone(),
            rest.clone(),
            oms.clone(),
            ws_public.clone(),
            ws_private.clone(),
            strategies_enabled.clone(),
        ));

        Self {
            config,
            event_bus,
            rest,
            ws_public,
            ws_private,
            market_data,
            oms,
            position_sizer,
            performance_monitor,
            shadow_ledger,
            guardian,
            strategies_enabled,
            symbols,
            dispatch_handle: Mutex::new(None),
            guardian_handle: Mutex::new(None),
            shadow_ledger_handle: Mutex::new(None),
            risk_poll_handle: Mutex::new(None),
        }
    }

    async fn register_handlers(&self) {
        let mdm_book = self.market_data.clone();
        self.event_bus
            .register(
                EventKind::BookUpdate,
                Arc::new(move |event: Event| {
                    let mdm = mdm_book.clone();
                    Box::pin(async move {
                        if let Some((symbol, bids, asks)) = parse_book_event(&event.data) {
                            mdm.on_book_update(symbol, bids, asks).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let mdm_tick = self.market_data.clone();
        self.event_bus
            .register(
                EventKind::Tick,
                Arc::new(move |event: Event| {
                    let mdm = mdm_tick.clone();
                    Box::pin(async move {
                        if let Some((symbol, price)) = parse_tick_event(&event.data) {
                            mdm.on_tick(symbol, price, 0.0).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let oms_position = self.oms.clone();
        self.event_bus
            .register(
                EventKind::PositionUpdate,
                Arc::new(move |event: Event| {
                    let oms = oms_position.clone();
                    Box::pin(async move {
                        if let Some((symbol, signed_size, avg_entry_price, unrealized_pnl, leverage)) =
                            parse_position_event(&event.data)
                        {
                            oms.on_position_update(symbol, signed_size, avg_entry_price, unrealized_pnl, leverage)
                                .await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;

        let oms_fill = self.oms.clone();
        self.event_bus
            .register(
                EventKind::OrderFilled,
                Arc::new(move |event: Event| {
                    let oms = oms_fill.clone();
                    Box::pin(async move {
                        // Only the raw exchange feed (ws_private) is
                        // re-processed here; the OMS's own echo of this
                        // event (source == "oms") is a notification, not a
                        // fresh fill to apply.
                        if event.source != "ws_private" {
                            return Ok(());
                        }
                        if let Some((order_id, cl_ord_id, filled_size, price)) = parse_fill_event(&event.data) {
                            oms.on_order_filled(order_id, cl_ord_id, filled_size, price).await;
                        }
                        Ok(())
                    })
                }),
            )
            .await;
    }

    pub async fn start(self: &Arc<Self>) {
        self.register_handlers().await;

        let equity_now = self.rest.get_balance(QUOTE_CCY).await.unwrap_or(0.0);
        let saved = persistence::load_state(&self.config.state_file, equity_now);
        if let Some(risk_state) = saved.risk_state {
            self.oms.restore_risk_state(risk_state).await;
        }

        *self.dispatch_handle.lock().await = Some(self.event_bus.start());

        self.ws_public.connect().await;
        self.ws_private.connect().await;

        *self.guardian_handle.lock().await = Some(self.guardian.start());
        *self.shadow_ledger_handle.lock().await = Some(self.spawn_shadow_ledger_loop());
        *self.risk_poll_handle.lock().await = Some(self.spawn_risk_poll_loop());

        log::info!("engine started for symbols: {:?}", self.symbols);
    }

    /// Feeds polled equity into the OMS's daily-drawdown circuit breaker.
    /// Per-trade consecutive-loss tracking needs a realized PnL the strategy
    /// alone can attribute to a closed position, so that half of the breaker
    /// is driven by `Oms::record_trade_result` instead, called by the
    /// strategy process.
    fn spawn_risk_poll_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                let equity = engine.rest.get_balance(QUOTE_CCY).await.unwrap_or(0.0);
                engine.oms.update_risk_equity(equity).await;
            }
        })
    }

    fn spawn_shadow_ledger_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(20));
            loop {
                interval.tick().await;
                if engine.guardian.is_meltdown_triggered().await {
                    continue;
                }
                engine.run_shadow_ledger_pass().await;
            }
        })
    }

    async fn run_shadow_ledger_pass(&self) {
        for symbol in &self.symbols {
            let actual = self.oms.positions().get_position(symbol).await;
            let (needs_sync, plan) = self.shadow_ledger.check_and_compute_delta(symbol, actual.as_ref()).await;
            if !needs_sync {
                continue;
            }
            let Some(plan) = plan else { continue };

            let equity = self.rest.get_balance(QUOTE_CCY).await.unwrap_or(0.0);
            let current_price = self.market_data.get_ticker_snapshot(symbol).await.map(|t| t.last_price);

            let submitted = self
                .oms
                .submit_order(
                    SubmitOrderRequest {
                        symbol: symbol.clone(),
                        side: plan.side,
                        order_type: OrderType::Market,
                        size: plan.amount,
                        price: None,
                        stop_loss_price: None,
                        take_profit_price: None,
                        cl_ord_id: None,
                        reduce_only: false,
                        strategy_id: "shadow_ledger".to_string(),
                    },
                    equity,
                    current_price,
                )
                .await;

            if submitted.is_some() {
                log::info!("shadow ledger: correction order submitted for {symbol}: {plan:?}");
                self.shadow_ledger.mark_synced(symbol).await;
            } else {
                log::warn!("shadow ledger: correction order for {symbol} was rejected, will retry next pass");
            }
        }
    }

    pub async fn stop(&self) {
        log::info!("engine stopping");
        if let Some(handle) = self.guardian_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.shadow_ledger_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.risk_poll_handle.lock().await.take() {
            handle.abort();
        }
        self.ws_public.disconnect().await;
        self.ws_private.disconnect().await;
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            self.event_bus.stop(handle).await;
        }

        let balance = self.rest.get_balance(QUOTE_CCY).await.unwrap_or(0.0);
        let state = EngineState {
            balance,
            positions: self.oms.positions().get_all_positions().await,
            risk_state: Some(self.oms.risk_state().await),
            vault_balance: None,
        };
        persistence::save_state(&self.config.state_file, &state);
        log::info!("engine stopped");
    }

    /// Guardian's trip hook, also callable directly by an external
    /// operator. Flips the shared flag an external strategy is expected to
    /// poll, and falls back to cancelling every open order directly.
    pub async fn disable_all_strategies(&self) {
        self.strategies_enabled.store(false, Ordering::SeqCst);
        self.oms.cancel_all_orders().await;
    }

    pub fn strategies_enabled(&self) -> Arc<AtomicBool> {
        self.strategies_enabled.clone()
    }

    pub fn market_data(&self) -> &MarketDataManager {
        &self.market_data
    }

    pub fn oms(&self) -> Arc<Oms> {
        self.oms.clone()
    }

    pub fn shadow_ledger(&self) -> Arc<ShadowLedger> {
        self.shadow_ledger.clone()
    }

    pub fn position_sizer(&self) -> &Mutex<PositionSizer> {
        &self.position_sizer
    }

    /// Feeds a closed trade's realized PnL into both the profit-factor
    /// monitor and the OMS's consecutive-loss/drawdown breaker, and returns
    /// the monitor's current suggestion for the (external) strategy to act
    /// on. Equity is the post-trade account balance.
    pub async fn record_trade_result(&self, pnl: f64, current_equity: f64) -> FeedbackAction {
        self.performance_monitor.lock().await.record_trade(pnl);
        self.oms.record_trade_result(pnl, current_equity).await;
        self.performance_monitor.lock().await.get_metrics().suggested_action
    }

    pub fn guardian(&self) -> Arc<Guardian> {
        self.guardian.clone()
    }

    pub fn rest_gateway(&self) -> Arc<dyn RestGateway> {
        self.rest.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn parse_book_event(data: &Value) -> Option<(String, Vec<(f64, f64)>, Vec<(f64, f64)>)> {
    let symbol = data.get("symbol")?.as_str()?.to_string();
    let bids = parse_levels(data.get("bids")?)?;
    let asks = parse_levels(data.get("asks")?)?;
    Some((symbol, bids, asks))
}

fn parse_levels(value: &Value) -> Option<Vec<(f64, f64)>> {
    value.as_array().map(|levels| {
        levels
            .iter()
            .filter_map(|level| {
                let pair = level.as_array()?;
                let price = pair.first()?.as_f64()?;
                let size = pair.get(1)?.as_f64()?;
                Some((price, size))
            })
            .collect()
    })
}

fn parse_tick_event(data: &Value) -> Option<(String, f64)> {
    let symbol = data.get("symbol")?.as_str()?.to_string();
    let price = data.get("price")?.as_f64()?;
    Some((symbol, price))
}

fn parse_position_event(data: &Value) -> Option<(String, f64, f64, f64, f64)> {
    let symbol = data.get("instId")?.as_str()?.to_string();
    let signed_size: f64 = data.get("pos")?.as_str()?.parse().ok()?;
    let avg_entry_price: f64 = data.get("avgPx").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let unrealized_pnl: f64 = data.get("upl").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let leverage: f64 = data.get("lever").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(1.0);
    Some((symbol, signed_size, avg_entry_price, unrealized_pnl, leverage))
}

fn parse_fill_event(data: &Value) -> Option<(Option<String>, Option<String>, f64, f64)> {
    let order_id = data.get("ordId").and_then(|v| v.as_str()).map(|s| s.to_string());
    let cl_ord_id = data.get("clOrdId").and_then(|v| v.as_str()).map(|s| s.to_string());
    let filled_size: f64 = data
        .get("accFillSz")
        .or_else(|| data.get("fillSz"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())?;
    let price: f64 = data
        .get("avgPx")
        .or_else(|| data.get("fillPx"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    Some((order_id, cl_ord_id, filled_size, price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_book_event_levels() {
        let data = json!({
            "symbol": "BTC-USDT-SWAP",
            "bids": [["50000.0", "1.0"]],
            "asks": [["50001.0", "2.0"]],
        });
        let (symbol, bids, asks) = parse_book_event(&data).unwrap();
        assert_eq!(symbol, "BTC-USDT-SWAP");
        assert_eq!(bids, vec![(50000.0, 1.0)]);
        assert_eq!(asks, vec![(50001.0, 2.0)]);
    }

    #[test]
    fn parses_position_event_with_string_fields() {
        let data = json!({"instId": "SOL-USDT-SWAP", "pos": "2.5", "avgPx": "100.0", "upl": "5.0", "lever": "3"});
        let (symbol, signed_size, avg_entry_price, unrealized_pnl, leverage) = parse_position_event(&data).unwrap();
        assert_eq!(symbol, "SOL-USDT-SWAP");
        assert_eq!(signed_size, 2.5);
        assert_eq!(avg_entry_price, 100.0);
        assert_eq!(unrealized_pnl, 5.0);
        assert_eq!(leverage, 3.0);
    }

    #[test]
    fn parses_fill_event_preferring_cumulative_field() {
        let data = json!({"ordId": "1", "clOrdId": "cl1", "accFillSz": "1.0", "avgPx": "50000.0"});
        let (order_id, cl_ord_id, filled_size, price) = parse_fill_event(&data).unwrap();
        assert_eq!(order_id.as_deref(), Some("1"));
        assert_eq!(cl_ord_id.as_deref(), Some("cl1"));
        assert_eq!(filled_size, 1.0);
        assert_eq!(price, 50000.0);
    }
}
