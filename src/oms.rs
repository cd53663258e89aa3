//! Order Management System: order lifecycle, client-ID correlation,
//! pre-trade checks, post-fill stop-loss guarantees, and ghost-order cleanup.
//!
//! Grounded in `original_source/src/core/order_manager.py` (`OrderManager`,
//! `PreTradeCheck`, `PositionManager`): the order working-set keyed by
//! `order_id`/`cl_ord_id`, the fill-correlation priority (`order_id` first,
//! `cl_ord_id` traversal second, establishing the mapping on hit), the
//! stop-loss retry-with-backoff sequence, and the ghost-order scan on a
//! zeroed position are all carried over from there.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::RiskLimits;
use crate::error::CoreResult;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::rest_gateway::{OrderType, PlaceOrderParams, RestGateway, Side};
use crate::risk::{RiskConfig, RiskManager};

/// The spec names `RiskAlert` as a distinct priority tier (2) even though it
/// isn't its own `EventKind`; a risk alert is published as an `Error` event
/// at this priority rather than `Error`'s own default (which is also 2, but
/// named separately here so the two concerns don't silently drift apart).
pub const RISK_ALERT_PRIORITY: u8 = 2;
const STOP_LOSS_MAX_RETRIES: u32 = 3;
const STOP_LOSS_BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Live,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: f64,
    pub size: f64,
    pub filled_size: f64,
    pub status: OrderStatus,
    pub stop_loss_price: Option<f64>,
    pub strategy_id: String,
    pub reduce_only: bool,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// `filled_size = max(current, event.filled_size)`. Correct only for
    /// cumulative-fill feeds (an incremental feed would need summation);
    /// which kind the exchange sends is an open question in the spec, and
    /// this implementation follows the documented default.
    pub fn apply_fill(&mut self, filled_size: f64) {
        if self.status.is_terminal() {
            return;
        }
        self.filled_size = self.filled_size.max(filled_size);
        if self.filled_size >= self.size {
            self.status = OrderStatus::Filled;
        } else if self.filled_size > 0.0 {
            self.status = OrderStatus::PartiallyFilled;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub signed_size: f64,
    pub avg_entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.signed_size > 0.0 {
            PositionSide::Long
        } else if self.signed_size < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        }
    }
}

/// Owns `{symbol -> Position}`. Mutated only by `PositionUpdate` events; a
/// fill alone never changes a position, since the exchange is authoritative.
#[derive(Default)]
pub struct PositionManager {
    positions: Mutex<HashMap<String, Position>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_position_update(
        &self,
        symbol: String,
        signed_size: f64,
        avg_entry_price: f64,
        unrealized_pnl: f64,
        leverage: f64,
    ) {
        let position = Position {
            symbol: symbol.clone(),
            signed_size,
            avg_entry_price,
            unrealized_pnl,
            leverage,
        };
        self.positions.lock().await.insert(symbol, position);
    }

    pub async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.positions.lock().await.get(symbol).cloned()
    }

    pub async fn get_all_positions(&self) -> Vec<Position> {
        self.positions.lock().await.values().cloned().collect()
    }
}

/// Standalone size-ratio helper, grounded in the original's free function of
/// the same name, usable outside the full rationality check.
pub fn get_position_ratio(size_notional: f64, equity: f64) -> f64 {
    if equity <= 0.0 {
        f64::INFINITY
    } else {
        size_notional / equity
    }
}

/// Standalone size-limit helper, grounded in the original's free function of
/// the same name.
pub fn validate_order_size(size_notional: f64, equity: f64, max_percent: f64) -> bool {
    equity > 0.0 && size_notional <= equity * max_percent
}

#[derive(Debug, Clone)]
pub struct OrderDetails {
    pub side: Side,
    pub size: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

/// Stateless (aside from config) per-order sanity check.
pub struct PreTradeCheck {
    limits: RiskLimits,
}

impl PreTradeCheck {
    pub fn new(limits: RiskLimits) -> Self {
        Self { limits }
    }

    pub fn is_order_rational(
        &self,
        order: &OrderDetails,
        current_equity: f64,
        current_price: Option<f64>,
    ) -> bool {
        // A Market order's `price` is a local-only substitute (possibly
        // `0.0` when no ticker price is available) and is never itself a
        // rationality criterion — the original only validates `position_size`
        // (size/notional) and the stop/take-profit prices below.
        if order.size <= 0.0 {
            log::warn!("pre-trade reject: non-positive size ({})", order.size);
            return false;
        }

        let notional = order.price * order.size;
        if !validate_order_size(notional, current_equity, self.limits.max_single_order_size_percent) {
            log::warn!(
                "pre-trade reject: order notional {notional:.2} exceeds {:.0}% of equity {current_equity:.2}",
                self.limits.max_single_order_size_percent * 100.0
            );
            return false;
        }

        if let (Some(price), Some(sl), Some(tp)) = (current_price, order.stop_loss, order.take_profit) {
            if sl <= 0.0 || tp <= 0.0 {
                log::warn!("pre-trade reject: non-positive stop_loss/take_profit");
                return false;
            }
            let tolerance = price * 0.001;
            let sane = match order.side {
                Side::Buy => sl < price + tolerance && price - tolerance < tp,
                Side::Sell => tp < price + tolerance && price - tolerance < sl,
            };
            if !sane {
                log::warn!(
                    "pre-trade reject: stop/take-profit sanity failed for {:?} at price {price} (sl={sl}, tp={tp})",
                    order.side
                );
                return false;
            }
        }

        true
    }
}

#[derive(Debug, Clone)]
pub struct SubmitOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub cl_ord_id: Option<String>,
    pub reduce_only: bool,
    pub strategy_id: String,
}

/// Order lifecycle, pre-trade gating, stop-loss guarantees, and ghost-order
/// cleanup. The single writer of `orders`/`cl_index` is whichever task calls
/// into the OMS — in the wired engine, that's always the event bus's single
/// dispatch loop, giving the linearizability the spec requires without any
/// additional locking discipline.
pub struct Oms {
    rest: Arc<dyn RestGateway>,
    event_bus: EventBus,
    pretrade: PreTradeCheck,
    circuit_breaker: Mutex<RiskManager>,
    positions: Arc<PositionManager>,
    orders: Mutex<HashMap<String, Order>>,
    cl_index: Mutex<HashMap<String, String>>,
}

impl Oms {
    pub fn new(
        rest: Arc<dyn RestGateway>,
        event_bus: EventBus,
        limits: RiskLimits,
        positions: Arc<PositionManager>,
    ) -> Self {
        let breaker_cfg = RiskConfig {
            max_daily_drawdown_percent: limits.max_daily_drawdown_percent,
            max_consecutive_losses: limits.max_consecutive_losses as usize,
            trading_halt_duration_secs: limits.trading_halt_duration_secs,
        };
        Self {
            rest,
            event_bus,
            pretrade: PreTradeCheck::new(limits),
            circuit_breaker: Mutex::new(RiskManager::new(breaker_cfg, 0.0)),
            positions,
            orders: Mutex::new(HashMap::new()),
            cl_index: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds the latest polled equity into the daily-drawdown circuit
    /// breaker. Called periodically by the engine; a closed trade's realized
    /// PnL (for consecutive-loss tracking) is the strategy's to report via
    /// `record_trade_result`, since the strategy alone knows which fills
    /// closed a position versus opened one.
    pub async fn update_risk_equity(&self, current_equity: f64) {
        self.circuit_breaker.lock().await.update_equity(current_equity);
    }

    pub async fn record_trade_result(&self, pnl: f64, current_equity: f64) {
        self.circuit_breaker.lock().await.update_trade_result(pnl, current_equity);
    }

    pub async fn is_trading_halted(&self) -> bool {
        self.circuit_breaker.lock().await.can_trade().is_err()
    }

    pub async fn risk_state(&self) -> crate::risk::RiskState {
        self.circuit_breaker.lock().await.get_state()
    }

    pub async fn restore_risk_state(&self, state: crate::risk::RiskState) {
        self.circuit_breaker.lock().await.restore_state(state);
    }

    /// Conservative buying-power gate standing in for the original's
    /// external `CapitalCommander.check_buying_power`, whose internals are
    /// not specified: notional must not exceed available equity. Decision
    /// recorded in DESIGN.md.
    fn check_buying_power(&self, notional: f64, equity: f64) -> bool {
        equity > 0.0 && notional <= equity
    }

    pub async fn submit_order(
        &self,
        req: SubmitOrderRequest,
        current_equity: f64,
        current_price: Option<f64>,
    ) -> Option<Order> {
        {
            let mut breaker = self.circuit_breaker.lock().await;
            breaker.update_equity(current_equity);
            if let Err(reason) = breaker.can_trade() {
                log::warn!("submit_order rejected: {reason}");
                return None;
            }
        }

        // Market orders carry no price to the exchange; `price=None` is
        // substituted with a ticker-derived fallback (or 0.0) purely for
        // local logging/risk math so the comparison above never panics.
        let effective_price = match req.order_type {
            OrderType::Market => req.price.or(current_price).unwrap_or(0.0),
            _ => req.price.unwrap_or(0.0),
        };

        let details = OrderDetails {
            side: req.side,
            size: req.size,
            price: effective_price,
            stop_loss: req.stop_loss_price,
            take_profit: req.take_profit_price,
        };
        if !self.pretrade.is_order_rational(&details, current_equity, current_price) {
            return None;
        }

        let notional = effective_price * req.size;
        if !self.check_buying_power(notional, current_equity) {
            log::warn!("submit_order rejected: insufficient buying power for {notional:.2} notional");
            return None;
        }

        let params = PlaceOrderParams {
            symbol: req.symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            size: req.size,
            price: match req.order_type {
                OrderType::Market => None,
                _ => req.price,
            },
            stop_loss_price: req.stop_loss_price,
            cl_ord_id: req.cl_ord_id.clone(),
            reduce_only: req.reduce_only,
            strategy_id: req.strategy_id.clone(),
        };

        let ack = match self.rest.place_order(params).await {
            Ok(ack) => ack,
            Err(e) => {
                log::error!("place_order failed for {}: {e}", req.symbol);
                return None;
            }
        };

        let order = Order {
            order_id: ack.order_id,
            cl_ord_id: ack.cl_ord_id,
            symbol: req.symbol,
            side: req.side,
            order_type: req.order_type,
            price: effective_price,
            size: req.size,
            filled_size: 0.0,
            status: OrderStatus::Live,
            // Always preserved locally even though the exchange ack never
            // echoes it back — this is the single source of truth later.
            stop_loss_price: req.stop_loss_price,
            strategy_id: req.strategy_id,
            reduce_only: req.reduce_only,
            created_at: Utc::now(),
        };

        self.orders.lock().await.insert(order.order_id.clone(), order.clone());
        self.cl_index
            .lock()
            .await
            .insert(order.cl_ord_id.clone(), order.order_id.clone());

        let payload = json!({
            "order_id": order.order_id,
            "cl_ord_id": order.cl_ord_id,
            "symbol": order.symbol,
            "side": order.side.as_str(),
            "size": order.size,
            "price": order.price,
        });
        self.event_bus
            .publish_nowait(
                Event::new(EventKind::OrderSubmitted, payload, "oms"),
                EventKind::OrderSubmitted.default_priority(),
            )
            .await
            .ok();

        Some(order)
    }

    /// Priority-1 `order_id`, priority-2 `cl_ord_id` (establishing the
    /// mapping on hit so subsequent lookups are O(1)), priority-3 unknown.
    async fn resolve_order_id(&self, order_id: Option<&str>, cl_ord_id: Option<&str>) -> Option<String> {
        if let Some(oid) = order_id {
            if self.orders.lock().await.contains_key(oid) {
                return Some(oid.to_string());
            }
        }
        if let Some(cl) = cl_ord_id {
            if let Some(oid) = self.cl_index.lock().await.get(cl).cloned() {
                return Some(oid);
            }
            let found = self
                .orders
                .lock()
                .await
                .values()
                .find(|o| o.cl_ord_id == cl)
                .map(|o| o.order_id.clone());
            if let Some(oid) = found {
                self.cl_index.lock().await.insert(cl.to_string(), oid.clone());
                return Some(oid);
            }
        }
        None
    }

    pub async fn on_order_filled(
        &self,
        order_id: Option<String>,
        cl_ord_id: Option<String>,
        filled_size: f64,
        fill_price: f64,
    ) {
        let Some(oid) = self.resolve_order_id(order_id.as_deref(), cl_ord_id.as_deref()).await else {
            log::warn!("on_order_filled: unknown order (order_id={order_id:?}, cl_ord_id={cl_ord_id:?})");
            return;
        };

        let snapshot = {
            let mut orders = self.orders.lock().await;
            let order = orders.get_mut(&oid).expect("resolved key always exists in the working set");
            if order.status.is_terminal() {
                return;
            }
            order.apply_fill(filled_size);
            (
                order.stop_loss_price,
                order.symbol.clone(),
                order.strategy_id.clone(),
                order.reduce_only,
            )
        };
        let (stop_loss_price, symbol, strategy_id, reduce_only) = snapshot;

        self.event_bus
            .publish_nowait(
                Event::new(
                    EventKind::OrderFilled,
                    json!({"order_id": oid, "filled_size": filled_size, "price": fill_price}),
                    "oms",
                ),
                EventKind::OrderFilled.default_priority(),
            )
            .await
            .ok();

        if !reduce_only {
            if let Some(stop_price) = stop_loss_price {
                self.place_protective_stop(&oid, &symbol, &strategy_id, stop_price).await;
            }
        }
    }

    /// Naked-risk prevention: synchronously submit a reduce-only stop order
    /// after a parent fill, retrying with exponential backoff. If every
    /// attempt fails, publish a risk alert instead of leaving the position
    /// unprotected beyond this bounded grace period.
    async fn place_protective_stop(&self, parent_order_id: &str, symbol: &str, strategy_id: &str, stop_price: f64) {
        let (size, parent_side) = {
            let orders = self.orders.lock().await;
            match orders.get(parent_order_id) {
                Some(o) => (o.size, o.side),
                None => return,
            }
        };
        let opposite = match parent_side {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        };

        for attempt in 1..=STOP_LOSS_MAX_RETRIES {
            let params = PlaceOrderParams {
                symbol: symbol.to_string(),
                side: opposite,
                order_type: OrderType::StopMarket,
                size,
                price: None,
                stop_loss_price: Some(stop_price),
                cl_ord_id: None,
                reduce_only: true,
                strategy_id: strategy_id.to_string(),
            };
            match self.rest.place_order(params).await {
                Ok(ack) => {
                    let stop_order = Order {
                        order_id: ack.order_id.clone(),
                        cl_ord_id: ack.cl_ord_id.clone(),
                        symbol: symbol.to_string(),
                        side: opposite,
                        order_type: OrderType::StopMarket,
                        price: stop_price,
                        size,
                        filled_size: 0.0,
                        status: OrderStatus::Live,
                        stop_loss_price: Some(stop_price),
                        strategy_id: strategy_id.to_string(),
                        reduce_only: true,
                        created_at: Utc::now(),
                    };
                    self.orders.lock().await.insert(stop_order.order_id.clone(), stop_order.clone());
                    self.cl_index
                        .lock()
                        .await
                        .insert(stop_order.cl_ord_id.clone(), stop_order.order_id.clone());
                    log::info!("protective stop placed for parent {parent_order_id} at {stop_price}");
                    return;
                }
                Err(e) => {
                    log::warn!("stop-loss placement attempt {attempt}/{STOP_LOSS_MAX_RETRIES} failed for {parent_order_id}: {e}");
                    if attempt == STOP_LOSS_MAX_RETRIES {
                        log::error!("stop-loss placement exhausted retries for {parent_order_id}; naked position risk");
                        let payload = json!({
                            "reason": "stop_loss_placement_failed",
                            "parent_order_id": parent_order_id,
                            "symbol": symbol,
                            "stop_price": stop_price,
                        });
                        self.event_bus
                            .publish_nowait(Event::new(EventKind::Error, payload, "oms"), RISK_ALERT_PRIORITY)
                            .await
                            .ok();
                        return;
                    }
                    tokio::time::sleep(STOP_LOSS_BASE_BACKOFF * 2u32.pow(attempt - 1)).await;
                }
            }
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> CoreResult<()> {
        let symbol = { self.orders.lock().await.get(order_id).map(|o| o.symbol.clone()) };
        let Some(symbol) = symbol else {
            return Err(crate::error::CoreError::Protocol(format!("unknown order {order_id}")));
        };

        self.rest.cancel_order(order_id, &symbol).await?;

        let was_stop = {
            let mut orders = self.orders.lock().await;
            match orders.get_mut(order_id) {
                Some(order) => {
                    order.status = OrderStatus::Cancelled;
                    matches!(order.order_type, OrderType::StopMarket | OrderType::StopLimit)
                }
                None => false,
            }
        };

        self.event_bus
            .publish_nowait(
                Event::new(EventKind::OrderCancelled, json!({"order_id": order_id}), "oms"),
                EventKind::OrderCancelled.default_priority(),
            )
            .await
            .ok();

        if was_stop {
            log::info!("protective stop {order_id} cancelled; parent order has no active protective stop");
        }
        Ok(())
    }

    pub async fn cancel_all_orders(&self) {
        let ids: Vec<String> = self.orders.lock().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.cancel_order(&id).await {
                log::warn!("cancel_all_orders: failed to cancel {id}: {e}");
            }
        }
    }

    /// Cancels reduce-only `StopMarket`/`StopLimit` orders left resting on a
    /// symbol whose position has gone to zero — a "ghost order" that would
    /// otherwise accidentally re-enter a position on trigger.
    pub async fn cleanup_ghost_orders(&self, symbol: &str) {
        let ghosts: Vec<String> = {
            self.orders
                .lock()
                .await
                .values()
                .filter(|o| {
                    o.symbol == symbol
                        && o.reduce_only
                        && matches!(o.order_type, OrderType::StopMarket | OrderType::StopLimit)
                        && !o.status.is_terminal()
                })
                .map(|o| o.order_id.clone())
                .collect()
        };
        for order_id in ghosts {
            log::info!("cancelling ghost stop order {order_id} for {symbol} (position flat)");
            if let Err(e) = self.cancel_order(&order_id).await {
                log::warn!("ghost-order cancel failed for {order_id}: {e}");
            }
        }
    }

    /// `PositionUpdate` events are routed here: updates `PositionManager`
    /// and triggers ghost-order cleanup when a position reaches zero.
    pub async fn on_position_update(
        &self,
        symbol: String,
        signed_size: f64,
        avg_entry_price: f64,
        unrealized_pnl: f64,
        leverage: f64,
    ) {
        self.positions
            .on_position_update(symbol.clone(), signed_size, avg_entry_price, unrealized_pnl, leverage)
            .await;
        if signed_size == 0.0 {
            self.cleanup_ghost_orders(&symbol).await;
        }
    }

    pub async fn get_order(&self, order_id: &str) -> Option<Order> {
        self.orders.lock().await.get(order_id).cloned()
    }

    pub async fn working_set_len(&self) -> usize {
        self.orders.lock().await.len()
    }

    pub async fn get_all_orders(&self) -> Vec<Order> {
        self.orders.lock().await.values().cloned().collect()
    }

    pub fn positions(&self) -> Arc<PositionManager> {
        self.positions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest_gateway::NullRestGateway;

    fn oms() -> Oms {
        Oms::new(
            Arc::new(NullRestGateway::default()),
            EventBus::new(1_000),
            RiskLimits::default(),
            Arc::new(PositionManager::new()),
        )
    }

    #[tokio::test]
    async fn market_order_with_null_price_ample_equity_matches_scenario_1() {
        let oms = oms();
        let order = oms
            .submit_order(
                SubmitOrderRequest {
                    symbol: "BTC-USDT-SWAP".into(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    size: 1.0,
                    price: None,
                    stop_loss_price: Some(49_900.0),
                    take_profit_price: None,
                    cl_ord_id: None,
                    reduce_only: false,
                    strategy_id: "t1".into(),
                },
                10_000.0,
                None,
            )
            .await
            .expect("market order with ample equity should submit");

        assert_eq!(order.price, 0.0);
        assert_eq!(order.stop_loss_price, Some(49_900.0));
        assert_eq!(order.status, OrderStatus::Live);
        assert!(oms.get_order(&order.order_id).await.is_some());
        assert!(oms.resolve_order_id(None, Some(&order.cl_ord_id)).await.is_some());
    }

    #[tokio::test]
    async fn fill_correlation_via_cl_ord_id_only_matches_scenario_2() {
        let oms = oms();
        let order = oms
            .submit_order(
                SubmitOrderRequest {
                    symbol: "BTC-USDT-SWAP".into(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    size: 1.0,
                    price: None,
                    stop_loss_price: Some(49_900.0),
                    take_profit_price: None,
                    cl_ord_id: Some("fixedcl1".into()),
                    reduce_only: false,
                    strategy_id: "t1".into(),
                },
                10_000.0,
                None,
            )
            .await
            .unwrap();

        oms.on_order_filled(Some("exch_999".into()), Some(order.cl_ord_id.clone()), 1.0, 50_000.0)
            .await;

        let updated = oms.get_order(&order.order_id).await.unwrap();
        assert_eq!(updated.status, OrderStatus::Filled);
        assert_eq!(updated.filled_size, 1.0);

        // Second fill event with just the cl_ord_id resolves via the
        // now-established mapping, not traversal.
        oms.on_order_filled(None, Some(order.cl_ord_id.clone()), 1.0, 50_000.0).await;
        let still = oms.get_order(&order.order_id).await.unwrap();
        assert_eq!(still.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn terminal_orders_never_change_status_again() {
        let oms = oms();
        let order = oms
            .submit_order(
                SubmitOrderRequest {
                    symbol: "BTC-USDT-SWAP".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    size: 1.0,
                    price: Some(50_000.0),
                    stop_loss_price: None,
                    take_profit_price: None,
                    cl_ord_id: None,
                    reduce_only: false,
                    strategy_id: "t1".into(),
                },
                10_000.0,
                Some(50_000.0),
            )
            .await
            .unwrap();
        oms.cancel_order(&order.order_id).await.unwrap();
        oms.on_order_filled(Some(order.order_id.clone()), None, 1.0, 50_000.0).await;

        let observed = oms.get_order(&order.order_id).await.unwrap();
        assert_eq!(observed.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn oversized_order_is_rejected_before_touching_the_exchange() {
        let oms = oms();
        let result = oms
            .submit_order(
                SubmitOrderRequest {
                    symbol: "BTC-USDT-SWAP".into(),
                    side: Side::Buy,
                    order_type: OrderType::Limit,
                    size: 100.0,
                    price: Some(50_000.0),
                    stop_loss_price: None,
                    take_profit_price: None,
                    cl_ord_id: None,
                    reduce_only: false,
                    strategy_id: "t1".into(),
                },
                10_000.0,
                Some(50_000.0),
            )
            .await;
        assert!(result.is_none());
        assert_eq!(oms.working_set_len().await, 0);
    }

    #[tokio::test]
    async fn ghost_stop_is_cancelled_when_position_goes_flat() {
        let oms = oms();
        let entry = oms
            .submit_order(
                SubmitOrderRequest {
                    symbol: "ETH-USDT-SWAP".into(),
                    side: Side::Buy,
                    order_type: OrderType::Market,
                    size: 1.0,
                    price: None,
                    stop_loss_price: Some(2_900.0),
                    take_profit_price: None,
                    cl_ord_id: None,
                    reduce_only: false,
                    strategy_id: "t1".into(),
                },
                10_000.0,
                Some(3_000.0),
            )
            .await
            .unwrap();
        oms.on_order_filled(Some(entry.order_id.clone()), None, 1.0, 3_000.0).await;

        let stop_order_id = {
            // the protective stop is the only other order in the set
            let ids = oms.orders.lock().await;
            ids.keys().find(|k| **k != entry.order_id).cloned()
        }
        .expect("protective stop should have been placed");

        oms.on_position_update("ETH-USDT-SWAP".into(), 0.0, 0.0, 0.0, 1.0).await;

        let stop = oms.get_order(&stop_order_id).await.unwrap();
        assert_eq!(stop.status, OrderStatus::Cancelled);
    }
}
