//! Public market-data WebSocket: subscribes to `trades`, `books`, `candles`
//! and republishes parsed frames as Tick/BookUpdate/Candle events.
//!
//! Grounded in spec §4.2.3; the subscribe/re-subscribe-on-reconnect pattern
//! mirrors `original_source/src/gateways/okx/ws_base.py`'s `_on_connected`
//! hook usage in its public subclass.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{CoreError, CoreResult};
use crate::event_bus::{Event, EventBus, EventKind};
use crate::parsers::{parse_book_frame, parse_candle_frame, parse_trade_frame};
use crate::ws_gateway::{WsGateway, WsHooks, WsSender};

pub struct PublicWsHooks {
    symbols: Vec<String>,
    event_bus: EventBus,
}

impl PublicWsHooks {
    pub fn new(symbols: Vec<String>, event_bus: EventBus) -> Arc<Self> {
        Arc::new(Self { symbols, event_bus })
    }
}

#[async_trait]
impl WsHooks for PublicWsHooks {
    async fn on_connected(&self, send: WsSender) -> CoreResult<()> {
        let args: Vec<serde_json::Value> = self
            .symbols
            .iter()
            .flat_map(|symbol| {
                ["trades", "books", "candle1m"].into_iter().map(move |channel| {
                    json!({"channel": channel, "instId": symbol})
                })
            })
            .collect();
        let frame = json!({"op": "subscribe", "args": args});
        send.send_text(frame.to_string()).await
    }

    async fn on_message(&self, text: String) -> CoreResult<()> {
        let frame: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Protocol(format!("invalid json frame: {e}")))?;
        let channel = frame
            .get("arg")
            .and_then(|a| a.get("channel"))
            .and_then(|c| c.as_str())
            .unwrap_or("");

        match channel {
            "trades" => {
                for tick in parse_trade_frame(&frame)? {
                    let payload = json!({
                        "symbol": tick.symbol,
                        "price": tick.price,
                        "size": tick.size,
                        "side": tick.side,
                        "usdt_value": tick.usdt_value,
                    });
                    self.event_bus
                        .publish_nowait(Event::new(EventKind::Tick, payload, "ws_public"), EventKind::Tick.default_priority())
                        .await
                        .ok();
                }
            }
            "books" => {
                let book = parse_book_frame(&frame)?;
                let payload = json!({
                    "symbol": book.symbol,
                    "bids": book.bids,
                    "asks": book.asks,
                    "best_bid": book.best_bid,
                    "best_ask": book.best_ask,
                });
                self.event_bus
                    .publish_nowait(Event::new(EventKind::BookUpdate, payload, "ws_public"), EventKind::BookUpdate.default_priority())
                    .await
                    .ok();
            }
            c if c.starts_with("candle") => {
                for candle in parse_candle_frame(&frame)? {
                    let payload = json!({
                        "symbol": candle.symbol,
                        "open": candle.open,
                        "high": candle.high,
                        "low": candle.low,
                        "close": candle.close,
                        "volume": candle.volume,
                        "ts": candle.ts,
                    });
                    self.event_bus
                        .publish_nowait(Event::new(EventKind::Candle, payload, "ws_public"), EventKind::Candle.default_priority())
                        .await
                        .ok();
                }
            }
            "" => {
                // login/subscribe acks and other control frames without a
                // channel arg; nothing to dispatch.
            }
            other => {
                log::debug!("ignoring unknown public channel: {other}");
            }
        }
        Ok(())
    }
}

pub fn build_public_gateway(url: &str, symbols: Vec<String>, event_bus: EventBus) -> WsGateway {
    let hooks = PublicWsHooks::new(symbols, event_bus);
    WsGateway::new(url, hooks)
}
