//! Single source of truth for order book and ticker snapshots.
//!
//! Grounded in `original_source/src/market/market_data_manager.py`
//! (`MarketDataManager`): subscribes to `BookUpdate`/`Tick` events, records
//! per-update latency in microseconds, and documents reads as lock-free
//! ("dict reads are atomic" in the original — here, a `DashMap`-free
//! `RwLock<HashMap<..>>` read guard that is held only for the clone).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TickerSnapshot {
    pub symbol: String,
    pub last_price: f64,
    pub bid_price: f64,
    pub ask_price: f64,
    pub volume_24h: f64,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct LatencyStats {
    pub count: u64,
    pub total_us: u64,
    pub max_us: u64,
    pub min_us: u64,
}

impl LatencyStats {
    pub fn avg_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_us as f64 / self.count as f64
        }
    }
}

struct Inner {
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
    tickers: RwLock<HashMap<String, TickerSnapshot>>,
    latency: RwLock<LatencyStats>,
}

#[derive(Clone)]
pub struct MarketDataManager {
    inner: Arc<Inner>,
}

impl MarketDataManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                books: RwLock::new(HashMap::new()),
                tickers: RwLock::new(HashMap::new()),
                latency: RwLock::new(LatencyStats::default()),
            }),
        }
    }

    pub async fn on_book_update(
        &self,
        symbol: String,
        bids: Vec<(f64, f64)>,
        asks: Vec<(f64, f64)>,
    ) {
        let started = Instant::now();
        let best_bid = bids.first().map(|(p, _)| *p);
        let best_ask = asks.first().map(|(p, _)| *p);
        if let (Some(bid), Some(ask)) = (best_bid, best_ask) {
            if bid >= ask {
                log::warn!("{symbol}: storing crossed book best_bid={bid} best_ask={ask}");
            }
        }
        let snapshot = OrderBookSnapshot {
            symbol: symbol.clone(),
            bids,
            asks,
            best_bid,
            best_ask,
            ts: Utc::now(),
        };
        self.inner.books.write().await.insert(symbol, snapshot);
        self.record_latency(started).await;
    }

    pub async fn on_tick(&self, symbol: String, price: f64, volume_24h: f64) {
        let started = Instant::now();
        let ticker = TickerSnapshot {
            symbol: symbol.clone(),
            last_price: price,
            bid_price: price,
            ask_price: price,
            volume_24h,
            ts: Utc::now(),
        };
        self.inner.tickers.write().await.insert(symbol, ticker);
        self.record_latency(started).await;
    }

    async fn record_latency(&self, started: Instant) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        let mut stats = self.inner.latency.write().await;
        stats.count += 1;
        stats.total_us += elapsed_us;
        stats.max_us = stats.max_us.max(elapsed_us);
        stats.min_us = if stats.count == 1 {
            elapsed_us
        } else {
            stats.min_us.min(elapsed_us)
        };
    }

    pub async fn get_order_book_snapshot(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.inner.books.read().await.get(symbol).cloned()
    }

    pub async fn get_ticker_snapshot(&self, symbol: &str) -> Option<TickerSnapshot> {
        self.inner.tickers.read().await.get(symbol).cloned()
    }

    pub async fn best_bid_ask(&self, symbol: &str) -> Option<(f64, f64)> {
        let book = self.get_order_book_snapshot(symbol).await?;
        Some((book.best_bid?, book.best_ask?))
    }

    pub async fn depth(&self, symbol: &str, levels: usize) -> Option<(Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        let book = self.get_order_book_snapshot(symbol).await?;
        Some((
            book.bids.into_iter().take(levels).collect(),
            book.asks.into_iter().take(levels).collect(),
        ))
    }

    pub async fn get_latency_stats(&self) -> LatencyStats {
        self.inner.latency.read().await.clone()
    }

    pub async fn reset_latency_stats(&self) {
        *self.inner.latency.write().await = LatencyStats::default();
    }
}

impl Default for MarketDataManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_round_trips_best_bid_ask() {
        let mdm = MarketDataManager::new();
        mdm.on_book_update(
            "BTC-USDT-SWAP".to_string(),
            vec![(50000.0, 1.0), (49999.0, 2.0)],
            vec![(50001.0, 1.5)],
        )
        .await;

        let (bid, ask) = mdm.best_bid_ask("BTC-USDT-SWAP").await.unwrap();
        assert_eq!(bid, 50000.0);
        assert_eq!(ask, 50001.0);
    }

    #[tokio::test]
    async fn depth_returns_first_n_levels() {
        let mdm = MarketDataManager::new();
        mdm.on_book_update(
            "ETH-USDT-SWAP".to_string(),
            vec![(3000.0, 1.0), (2999.0, 1.0), (2998.0, 1.0)],
            vec![(3001.0, 1.0)],
        )
        .await;

        let (bids, _asks) = mdm.depth("ETH-USDT-SWAP", 2).await.unwrap();
        assert_eq!(bids.len(), 2);
    }

    #[tokio::test]
    async fn unknown_symbol_returns_none() {
        let mdm = MarketDataManager::new();
        assert!(mdm.get_order_book_snapshot("NOPE").await.is_none());
    }
}
