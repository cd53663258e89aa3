//! Raw WS frame → typed event payload parsing for the public channels.
//!
//! Grounded in spec §4.2.3 and the shape of `original_source`'s
//! `gateways/okx/parsers/*.py` (one parser per channel), adapted to OKX v5's
//! `{arg: {channel, instId}, data: [...]}` envelope.

use serde_json::Value;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct TickPayload {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub side: String,
    pub usdt_value: f64,
}

#[derive(Debug, Clone)]
pub struct BookUpdatePayload {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CandlePayload {
    pub symbol: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub ts: i64,
}

fn channel_and_inst(frame: &Value) -> Option<(&str, &str)> {
    let arg = frame.get("arg")?;
    Some((arg.get("channel")?.as_str()?, arg.get("instId")?.as_str()?))
}

fn parse_price_size_pair(entry: &Value) -> Option<(f64, f64)> {
    let arr = entry.as_array()?;
    let price: f64 = arr.first()?.as_str()?.parse().ok()?;
    let size: f64 = arr.get(1)?.as_str()?.parse().ok()?;
    Some((price, size))
}

pub fn parse_trade_frame(frame: &Value) -> CoreResult<Vec<TickPayload>> {
    let (_, inst_id) = channel_and_inst(frame).ok_or_else(|| CoreError::Protocol("missing arg".into()))?;
    let data = frame
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CoreError::Protocol("missing trade data".into()))?;

    let mut out = Vec::with_capacity(data.len());
    for row in data {
        let price: f64 = row
            .get("px")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::Protocol("missing px".into()))?;
        let size: f64 = row
            .get("sz")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::Protocol("missing sz".into()))?;
        let side = row
            .get("side")
            .and_then(|v| v.as_str())
            .unwrap_or("buy")
            .to_string();
        out.push(TickPayload {
            symbol: inst_id.to_string(),
            price,
            size,
            side,
            usdt_value: price * size,
        });
    }
    Ok(out)
}

pub fn parse_book_frame(frame: &Value) -> CoreResult<BookUpdatePayload> {
    let (_, inst_id) = channel_and_inst(frame).ok_or_else(|| CoreError::Protocol("missing arg".into()))?;
    let row = frame
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| CoreError::Protocol("missing book data".into()))?;

    let bids: Vec<(f64, f64)> = row
        .get("bids")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().take(5).filter_map(parse_price_size_pair).collect())
        .unwrap_or_default();
    let asks: Vec<(f64, f64)> = row
        .get("asks")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().take(5).filter_map(parse_price_size_pair).collect())
        .unwrap_or_default();

    let best_bid = bids.first().map(|(p, _)| *p);
    let best_ask = asks.first().map(|(p, _)| *p);
    if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
        if bid >= ask {
            log::warn!("{inst_id}: crossed book best_bid={bid} best_ask={ask}");
        }
    }

    Ok(BookUpdatePayload {
        symbol: inst_id.to_string(),
        bids,
        asks,
        best_bid,
        best_ask,
    })
}

pub fn parse_candle_frame(frame: &Value) -> CoreResult<Vec<CandlePayload>> {
    let (_, inst_id) = channel_and_inst(frame).ok_or_else(|| CoreError::Protocol("missing arg".into()))?;
    let data = frame
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CoreError::Protocol("missing candle data".into()))?;

    let mut out = Vec::with_capacity(data.len());
    for row in data {
        // Candles arrive as arrays; some deployments wrap them as maps, so
        // accept both shapes.
        let candle = if let Some(arr) = row.as_array() {
            CandlePayload {
                symbol: inst_id.to_string(),
                ts: arr.first().and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0),
                open: arr.get(1).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                high: arr.get(2).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                low: arr.get(3).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                close: arr.get(4).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                volume: arr.get(5).and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
            }
        } else {
            CandlePayload {
                symbol: inst_id.to_string(),
                ts: row.get("ts").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0),
                open: row.get("o").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                high: row.get("h").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                low: row.get("l").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                close: row.get("c").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                volume: row.get("vol").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
            }
        };
        out.push(candle);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_book_frame_array_levels() {
        let frame = json!({
            "arg": {"channel": "books", "instId": "BTC-USDT-SWAP"},
            "data": [{
                "bids": [["50000.0", "1.0"], ["49999.0", "2.0"]],
                "asks": [["50001.0", "1.5"]],
            }]
        });
        let parsed = parse_book_frame(&frame).unwrap();
        assert_eq!(parsed.symbol, "BTC-USDT-SWAP");
        assert_eq!(parsed.best_bid, Some(50000.0));
        assert_eq!(parsed.best_ask, Some(50001.0));
        assert_eq!(parsed.bids.len(), 2);
    }

    #[test]
    fn parses_trade_frame() {
        let frame = json!({
            "arg": {"channel": "trades", "instId": "ETH-USDT-SWAP"},
            "data": [{"px": "3000.0", "sz": "0.5", "side": "sell"}]
        });
        let ticks = parse_trade_frame(&frame).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].usdt_value, 1500.0);
        assert_eq!(ticks[0].side, "sell");
    }

    #[test]
    fn candle_frame_supports_array_form() {
        let frame = json!({
            "arg": {"channel": "candle1m", "instId": "BTC-USDT-SWAP"},
            "data": [["1700000000000", "50000", "50100", "49900", "50050", "12.3"]]
        });
        let candles = parse_candle_frame(&frame).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 50050.0);
    }
}
