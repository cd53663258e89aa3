//! Signed REST client against the exchange's v5 API.
//!
//! Grounded in `original_source/src/gateways/okx/rest_api.py`
//! (`OkxRestGateway`): header construction, compact-JSON body signing,
//! `cl_ord_id` generation, the stop-order field mapping, and the
//! chronological re-ordering of kline responses are all carried over from
//! there. The connection-pooling/session-reuse shape (one `reqwest::Client`
//! built once, not per call) is grounded in the teacher's `LiveExchange`
//! (`exchange.rs`), which keeps a single `reqwest::Client` alongside
//! short-TTL caches.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ExchangeCreds;
use crate::error::{CoreError, CoreResult};
use crate::signing::OkxSigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_str_normalized(s: &str) -> CoreResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(CoreError::Protocol(format!("invalid side: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    Ioc,
    StopMarket,
    StopLimit,
}

impl OrderType {
    fn okx_ord_type(&self) -> &'static str {
        match self {
            OrderType::Market => "market",
            OrderType::Limit => "limit",
            OrderType::Ioc => "ioc",
            OrderType::StopMarket | OrderType::StopLimit => "conditional",
        }
    }

    fn is_stop(&self) -> bool {
        matches!(self, OrderType::StopMarket | OrderType::StopLimit)
    }
}

#[derive(Debug, Clone)]
pub struct PlaceOrderParams {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub size: f64,
    pub price: Option<f64>,
    pub stop_loss_price: Option<f64>,
    pub cl_ord_id: Option<String>,
    pub reduce_only: bool,
    pub strategy_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceOrderAck {
    pub order_id: String,
    pub cl_ord_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: f64,
    pub side: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentInfo {
    pub inst_id: String,
    pub lot_sz: f64,
    pub min_sz: f64,
    pub tick_sz: f64,
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[async_trait]
pub trait RestGateway: Send + Sync {
    async fn get_balance(&self, ccy: &str) -> CoreResult<f64>;
    async fn get_positions(&self, symbol: Option<&str>) -> CoreResult<Vec<ExchangePosition>>;
    async fn place_order(&self, params: PlaceOrderParams) -> CoreResult<PlaceOrderAck>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> CoreResult<()>;
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> CoreResult<u32>;
    async fn get_order_status(&self, order_id: &str, symbol: &str) -> CoreResult<String>;
    async fn get_kline(&self, symbol: &str, interval: &str, limit: u32) -> CoreResult<Vec<Candle>>;
    async fn get_instruments(&self, inst_type: &str) -> CoreResult<Vec<InstrumentInfo>>;
    async fn set_leverage(&self, symbol: &str, leverage: u32, mode: &str) -> CoreResult<()>;
}

#[derive(Deserialize)]
struct OkxEnvelope {
    code: String,
    msg: String,
    #[serde(default)]
    data: Vec<Value>,
}

pub struct OkxRestGateway {
    client: reqwest::Client,
    base_url: String,
    creds: ExchangeCreds,
}

impl OkxRestGateway {
    pub fn new(base_url: impl Into<String>, creds: ExchangeCreds) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client build is infallible with these options");
        Self {
            client,
            base_url: base_url.into(),
            creds,
        }
    }

    fn headers(&self, timestamp: &str, sign: &str) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("OK-ACCESS-KEY", self.creds.api_key.parse().unwrap());
        headers.insert("OK-ACCESS-SIGN", sign.parse().unwrap());
        headers.insert("OK-ACCESS-TIMESTAMP", timestamp.parse().unwrap());
        headers.insert("OK-ACCESS-PASSPHRASE", self.creds.passphrase.parse().unwrap());
        headers.insert("Content-Type", "application/json".parse().unwrap());
        if self.creds.demo {
            headers.insert("x-simulated-trading", "1".parse().unwrap());
        }
        headers
    }

    async fn request(&self, method: reqwest::Method, path: &str, body: Value) -> CoreResult<Vec<Value>> {
        let timestamp = OkxSigner::timestamp_iso_millis();
        let body_str = if body.is_null() || method == reqwest::Method::GET {
            String::new()
        } else {
            serde_json::to_string(&body)?
        };
        let sign = OkxSigner::sign(&timestamp, method.as_str(), path, &body_str, &self.creds.secret_key);
        let url = format!("{}{}", self.base_url, path);

        let mut req = self
            .client
            .request(method.clone(), &url)
            .headers(self.headers(&timestamp, &sign));
        if !body_str.is_empty() {
            req = req.body(body_str);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(CoreError::Network(format!(
                "http {} from {}",
                response.status(),
                path
            )));
        }
        let envelope: OkxEnvelope = response.json().await?;
        if envelope.code != "0" {
            return Err(CoreError::Api {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope.data)
    }

    fn generate_cl_ord_id(strategy_id: &str) -> String {
        let prefix: String = strategy_id.chars().take(4).collect::<String>().to_lowercase();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let suffix = format!("{now_ms}");
        let suffix = &suffix[suffix.len().saturating_sub(8)..];
        format!("{prefix}{suffix}")
    }
}

#[async_trait]
impl RestGateway for OkxRestGateway {
    async fn get_balance(&self, ccy: &str) -> CoreResult<f64> {
        let path = format!("/api/v5/account/balance?ccy={ccy}");
        let data = self.request(reqwest::Method::GET, &path, Value::Null).await?;
        let avail = data
            .first()
            .and_then(|d| d.get("details"))
            .and_then(|d| d.as_array())
            .and_then(|arr| arr.first())
            .and_then(|d| d.get("availBal"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(avail)
    }

    async fn get_positions(&self, symbol: Option<&str>) -> CoreResult<Vec<ExchangePosition>> {
        let path = match symbol {
            Some(s) => format!("/api/v5/account/positions?instId={s}"),
            None => "/api/v5/account/positions".to_string(),
        };
        let data = self.request(reqwest::Method::GET, &path, Value::Null).await?;
        let mut out = Vec::with_capacity(data.len());
        for d in data {
            let size: f64 = d
                .get("pos")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0);
            out.push(ExchangePosition {
                symbol: d.get("instId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                size,
                entry_price: d
                    .get("avgPx")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                unrealized_pnl: d
                    .get("upl")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0),
                leverage: d
                    .get("lever")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1.0),
                side: d.get("posSide").and_then(|v| v.as_str()).unwrap_or("net").to_string(),
            });
        }
        Ok(out)
    }

    async fn place_order(&self, params: PlaceOrderParams) -> CoreResult<PlaceOrderAck> {
        let cl_ord_id = params
            .cl_ord_id
            .clone()
            .unwrap_or_else(|| Self::generate_cl_ord_id(&params.strategy_id));

        let sz = params.size.max(1.0).round() as i64;

        let mut body = json!({
            "instId": params.symbol,
            "tdMode": "cross",
            "side": params.side.as_str(),
            "ordType": params.order_type.okx_ord_type(),
            "sz": sz.to_string(),
            "clOrdId": cl_ord_id,
        });

        if let Some(price) = params.price {
            if !matches!(params.order_type, OrderType::Market) {
                body["px"] = json!(price.to_string());
            }
        }
        if params.order_type.is_stop() {
            if let Some(stop_price) = params.stop_loss_price {
                body["slTriggerType"] = json!("last");
                body["slOrdPx"] = json!(stop_price.to_string());
            }
        }
        if params.reduce_only {
            body["reduceOnly"] = json!(true);
        }

        let allowed_fields = [
            "instId", "tdMode", "side", "ordType", "sz", "px", "reduceOnly", "clOrdId", "ccy",
            "slTriggerType", "slOrdPx",
        ];
        if let Value::Object(map) = &mut body {
            map.retain(|k, _| allowed_fields.contains(&k.as_str()));
            map.remove("posSide");
        }

        let data = self.request(reqwest::Method::POST, "/api/v5/trade/order", body).await?;
        let ack = data.first().ok_or_else(|| CoreError::Protocol("empty order ack".into()))?;
        Ok(PlaceOrderAck {
            order_id: ack.get("ordId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            cl_ord_id: ack
                .get("clOrdId")
                .and_then(|v| v.as_str())
                .unwrap_or(&cl_ord_id)
                .to_string(),
        })
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> CoreResult<()> {
        let body = json!({"instId": symbol, "ordId": order_id});
        self.request(reqwest::Method::POST, "/api/v5/trade/cancel-order", body)
            .await?;
        Ok(())
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> CoreResult<u32> {
        let path = match symbol {
            Some(s) => format!("/api/v5/trade/orders-pending?instId={s}"),
            None => "/api/v5/trade/orders-pending".to_string(),
        };
        let pending = self.request(reqwest::Method::GET, &path, Value::Null).await?;
        let mut cancelled = 0u32;
        for order in &pending {
            let order_id = order.get("ordId").and_then(|v| v.as_str()).unwrap_or_default();
            let inst_id = order.get("instId").and_then(|v| v.as_str()).unwrap_or_default();
            if self.cancel_order(order_id, inst_id).await.is_ok() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn get_order_status(&self, order_id: &str, symbol: &str) -> CoreResult<String> {
        let path = format!("/api/v5/trade/order?instId={symbol}&ordId={order_id}");
        let data = self.request(reqwest::Method::GET, &path, Value::Null).await?;
        Ok(data
            .first()
            .and_then(|d| d.get("state"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    async fn get_kline(&self, symbol: &str, interval: &str, limit: u32) -> CoreResult<Vec<Candle>> {
        let interval_map: HashMap<&str, &str> = [("1h", "1H"), ("1d", "1D")].into_iter().collect();
        let bar = interval_map.get(interval).copied().unwrap_or(interval);
        let path = format!("/api/v5/market/candles?instId={symbol}&bar={bar}&limit={limit}");
        let data = self.request(reqwest::Method::GET, &path, Value::Null).await?;

        let mut candles: Vec<Candle> = data
            .iter()
            .filter_map(|row| {
                let arr = row.as_array()?;
                Some(Candle {
                    ts: arr.first()?.as_str()?.parse().ok()?,
                    open: arr.get(1)?.as_str()?.parse().ok()?,
                    high: arr.get(2)?.as_str()?.parse().ok()?,
                    low: arr.get(3)?.as_str()?.parse().ok()?,
                    close: arr.get(4)?.as_str()?.parse().ok()?,
                    volume: arr.get(5)?.as_str()?.parse().ok()?,
                })
            })
            .collect();
        // the exchange returns newest-first; callers expect chronological order.
        candles.reverse();
        Ok(candles)
    }

    async fn get_instruments(&self, inst_type: &str) -> CoreResult<Vec<InstrumentInfo>> {
        let path = format!("/api/v5/public/instruments?instType={inst_type}");
        let data = self.request(reqwest::Method::GET, &path, Value::Null).await?;
        Ok(data
            .into_iter()
            .filter_map(|d| {
                let state = d.get("state")?.as_str()?.to_string();
                if state != "live" {
                    return None;
                }
                Some(InstrumentInfo {
                    inst_id: d.get("instId")?.as_str()?.to_string(),
                    lot_sz: d.get("lotSz")?.as_str()?.parse().ok()?,
                    min_sz: d.get("minSz")?.as_str()?.parse().ok()?,
                    tick_sz: d.get("tickSz")?.as_str()?.parse().ok()?,
                    state,
                })
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32, mode: &str) -> CoreResult<()> {
        let body = json!({"instId": symbol, "lever": leverage.to_string(), "mgnMode": mode});
        self.request(reqwest::Method::POST, "/api/v5/account/set-leverage", body)
            .await?;
        Ok(())
    }
}

/// Offline test double used by OMS/Guardian unit tests — never touches the
/// network. Grounded in the teacher's `SimExchange`.
#[derive(Default)]
pub struct NullRestGateway {
    pub cancel_all_calls: std::sync::atomic::AtomicU32,
}

#[async_trait]
impl RestGateway for NullRestGateway {
    async fn get_balance(&self, _ccy: &str) -> CoreResult<f64> {
        Ok(10_000.0)
    }

    async fn get_positions(&self, _symbol: Option<&str>) -> CoreResult<Vec<ExchangePosition>> {
        Ok(Vec::new())
    }

    async fn place_order(&self, params: PlaceOrderParams) -> CoreResult<PlaceOrderAck> {
        let cl_ord_id = params
            .cl_ord_id
            .unwrap_or_else(|| OkxRestGateway::generate_cl_ord_id(&params.strategy_id));
        Ok(PlaceOrderAck {
            order_id: format!("sim-{}", uuid::Uuid::new_v4()),
            cl_ord_id,
        })
    }

    async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: Option<&str>) -> CoreResult<u32> {
        self.cancel_all_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(0)
    }

    async fn get_order_status(&self, _order_id: &str, _symbol: &str) -> CoreResult<String> {
        Ok("live".to_string())
    }

    async fn get_kline(&self, _symbol: &str, _interval: &str, _limit: u32) -> CoreResult<Vec<Candle>> {
        Ok(Vec::new())
    }

    async fn get_instruments(&self, _inst_type: &str) -> CoreResult<Vec<InstrumentInfo>> {
        Ok(Vec::new())
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32, _mode: &str) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cl_ord_id_is_alphanumeric_and_bounded() {
        let id = OkxRestGateway::generate_cl_ord_id("Tango");
        assert!(id.len() <= 32);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(id.starts_with("tang"));
    }

    #[tokio::test]
    async fn null_gateway_place_order_preserves_cl_ord_id_when_supplied() {
        let gw = NullRestGateway::default();
        let ack = gw
            .place_order(PlaceOrderParams {
                symbol: "BTC-USDT-SWAP".into(),
                side: Side::Buy,
                order_type: OrderType::Market,
                size: 1.0,
                price: None,
                stop_loss_price: Some(49_900.0),
                cl_ord_id: Some("fixed123".into()),
                reduce_only: false,
                strategy_id: "t1".into(),
            })
            .await
            .unwrap();
        assert_eq!(ack.cl_ord_id, "fixed123");
    }
}
