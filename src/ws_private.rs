//! Private account-stream WebSocket: logs in, subscribes to `positions` and
//! `orders`, republishes as PositionUpdate/OrderUpdate/OrderFilled/
//! OrderCancelled events.
//!
//! Grounded in spec §4.2.4: login frame with a Unix-seconds timestamp, signed
//! over `timestamp + "GET" + "/users/self/verify" + ""`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::config::ExchangeCreds;
use crate::error::{CoreError, CoreResult};
use crate::event_bus::{Event, EventBus, EventKind};
use crate::signing::OkxSigner;
use crate::ws_gateway::{WsGateway, WsHooks, WsSender};

pub struct PrivateWsHooks {
    creds: ExchangeCreds,
    event_bus: EventBus,
}

impl PrivateWsHooks {
    pub fn new(creds: ExchangeCreds, event_bus: EventBus) -> Arc<Self> {
        Arc::new(Self { creds, event_bus })
    }
}

#[async_trait]
impl WsHooks for PrivateWsHooks {
    async fn on_connected(&self, send: WsSender) -> CoreResult<()> {
        let timestamp = OkxSigner::timestamp_unix_secs();
        let sign = OkxSigner::sign_ws_login(&timestamp, &self.creds.secret_key);
        let login_frame = json!({
            "op": "login",
            "args": [{
                "apiKey": self.creds.api_key,
                "passphrase": self.creds.passphrase,
                "timestamp": timestamp,
                "sign": sign,
            }]
        });
        send.send_text(login_frame.to_string()).await?;

        let subscribe_frame = json!({
            "op": "subscribe",
            "args": [
                {"channel": "positions", "instType": "SWAP"},
                {"channel": "orders", "instType": "SWAP"},
            ]
        });
        send.send_text(subscribe_frame.to_string()).await
    }

    async fn on_message(&self, text: String) -> CoreResult<()> {
        let frame: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| CoreError::Protocol(format!("invalid json frame: {e}")))?;

        if frame.get("event").and_then(|e| e.as_str()) == Some("login") {
            let success = frame.get("code").and_then(|c| c.as_str()) == Some("0");
            log::info!("private ws login {}", if success { "succeeded" } else { "failed" });
            return Ok(());
        }

        let channel = frame
            .get("arg")
            .and_then(|a| a.get("channel"))
            .and_then(|c| c.as_str())
            .unwrap_or("");
        let data = match frame.get("data").and_then(|d| d.as_array()) {
            Some(d) => d,
            None => return Ok(()),
        };

        match channel {
            "positions" => {
                for row in data {
                    self.event_bus
                        .publish_nowait(
                            Event::new(EventKind::PositionUpdate, row.clone(), "ws_private"),
                            EventKind::PositionUpdate.default_priority(),
                        )
                        .await
                        .ok();
                }
            }
            "orders" => {
                for row in data {
                    let state = row.get("state").and_then(|s| s.as_str()).unwrap_or("");
                    self.event_bus
                        .publish_nowait(
                            Event::new(EventKind::OrderUpdate, row.clone(), "ws_private"),
                            EventKind::OrderUpdate.default_priority(),
                        )
                        .await
                        .ok();

                    match state {
                        "filled" => {
                            self.event_bus
                                .publish_nowait(
                                    Event::new(EventKind::OrderFilled, row.clone(), "ws_private"),
                                    EventKind::OrderFilled.default_priority(),
                                )
                                .await
                                .ok();
                        }
                        "canceled" | "cancelled" => {
                            self.event_bus
                                .publish_nowait(
                                    Event::new(EventKind::OrderCancelled, row.clone(), "ws_private"),
                                    EventKind::OrderCancelled.default_priority(),
                                )
                                .await
                                .ok();
                        }
                        _ => {}
                    }
                }
            }
            "" => {}
            other => log::debug!("ignoring unknown private channel: {other}"),
        }
        Ok(())
    }
}

pub fn build_private_gateway(url: &str, creds: ExchangeCreds, event_bus: EventBus) -> WsGateway {
    let hooks = PrivateWsHooks::new(creds, event_bus);
    WsGateway::new(url, hooks)
}
