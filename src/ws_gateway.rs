//! Self-healing WebSocket gateway base.
//!
//! Grounded in `original_source/src/gateways/okx/ws_base.py` (`WsBaseGateway`):
//! the connect-lock, `_disconnect_cleanup`, receive/heartbeat loop pair, and
//! exponential-backoff reconnect policy are carried over with the same
//! constants (30s read timeout, 20s ping interval, 60s watchdog, backoff
//! `min(60, 1 * 2^min(attempt,5))`, 10 max attempts).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::CoreResult;

const READ_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Authed,
}

/// Hooks a concrete gateway (public/private) implements. `on_connected` is
/// called after the socket and background tasks are up (re-subscribe /
/// re-login); `on_message` receives every non-heartbeat text frame.
#[async_trait]
pub trait WsHooks: Send + Sync {
    async fn on_connected(&self, send: WsSender) -> CoreResult<()>;
    async fn on_message(&self, text: String) -> CoreResult<()>;
}

/// Cheap handle to the write half, passed to hooks so they can subscribe /
/// log in without reaching into gateway internals.
#[derive(Clone)]
pub struct WsSender {
    inner: Arc<Mutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>>,
}

impl WsSender {
    pub async fn send_text(&self, text: String) -> CoreResult<()> {
        let mut guard = self.inner.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer
                .send(Message::Text(text))
                .await
                .map_err(|e| crate::error::CoreError::Network(e.to_string()))?;
        }
        Ok(())
    }
}

struct Shared {
    url: String,
    state: Mutex<ConnectionState>,
    connect_lock: Mutex<()>,
    reconnect_attempt: AtomicU32,
    reconnect_count: AtomicU64,
    running: AtomicBool,
    last_msg_time: Mutex<Instant>,
    writer: Arc<Mutex<Option<futures_util::stream::SplitSink<WsStream, Message>>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

/// A persistent, self-reconnecting WebSocket connection. Cloneable handle;
/// all state lives behind a shared `Arc`.
#[derive(Clone)]
pub struct WsGateway {
    shared: Arc<Shared>,
    hooks: Arc<dyn WsHooks>,
}

impl WsGateway {
    pub fn new(url: impl Into<String>, hooks: Arc<dyn WsHooks>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                state: Mutex::new(ConnectionState::Disconnected),
                connect_lock: Mutex::new(()),
                reconnect_attempt: AtomicU32::new(0),
                reconnect_count: AtomicU64::new(0),
                running: AtomicBool::new(false),
                last_msg_time: Mutex::new(Instant::now()),
                writer: Arc::new(Mutex::new(None)),
                recv_task: Mutex::new(None),
                heartbeat_task: Mutex::new(None),
            }),
            hooks,
        }
    }

    /// Exposed specifically for Guardian's death-spiral detector.
    pub fn reconnect_count(&self) -> u64 {
        self.shared.reconnect_count.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        matches!(
            *self.shared.state.lock().await,
            ConnectionState::Connected | ConnectionState::Subscribed | ConnectionState::Authed
        )
    }

    pub async fn connect(&self) {
        if self.is_connected().await {
            return;
        }
        let _guard = self.shared.connect_lock.lock().await;
        if self.is_connected().await {
            return;
        }

        self.disconnect_cleanup().await;
        *self.shared.state.lock().await = ConnectionState::Connecting;
        self.shared.running.store(true, Ordering::SeqCst);

        match tokio_tungstenite::connect_async(&self.shared.url).await {
            Ok((stream, _)) => {
                let (write, read) = stream.split();
                *self.shared.writer.lock().await = Some(write);
                *self.shared.last_msg_time.lock().await = Instant::now();
                *self.shared.state.lock().await = ConnectionState::Connected;
                self.shared.reconnect_attempt.store(0, Ordering::SeqCst);

                let recv_handle = {
                    let gw = self.clone();
                    tokio::spawn(async move { gw.message_loop(read).await })
                };
                *self.shared.recv_task.lock().await = Some(recv_handle);

                let heartbeat_handle = {
                    let gw = self.clone();
                    tokio::spawn(async move { gw.heartbeat_loop().await })
                };
                *self.shared.heartbeat_task.lock().await = Some(heartbeat_handle);

                let sender = WsSender {
                    inner: self.shared.writer.clone(),
                };
                if let Err(e) = self.hooks.on_connected(sender).await {
                    log::error!("on_connected hook failed: {e}");
                }
            }
            Err(e) => {
                log::error!("ws connect failed for {}: {e}", self.shared.url);
                drop(_guard);
                self.reconnect().await;
            }
        }
    }

    async fn disconnect_cleanup(&self) {
        if let Some(handle) = self.shared.recv_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.shared.heartbeat_task.lock().await.take() {
            handle.abort();
        }
        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        *self.shared.state.lock().await = ConnectionState::Disconnected;
    }

    pub async fn disconnect(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.disconnect_cleanup().await;
    }

    async fn message_loop(&self, mut read: futures_util::stream::SplitStream<WsStream>) {
        loop {
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            let next = tokio::time::timeout(READ_TIMEOUT, read.next()).await;
            match next {
                Ok(Some(Ok(Message::Text(text)))) => {
                    *self.shared.last_msg_time.lock().await = Instant::now();
                    if text == "pong" {
                        continue;
                    }
                    if let Err(e) = self.hooks.on_message(text).await {
                        log::error!("on_message hook failed: {e}");
                    }
                }
                Ok(Some(Ok(_other))) => {
                    *self.shared.last_msg_time.lock().await = Instant::now();
                }
                Ok(Some(Err(e))) => {
                    log::error!("ws read error: {e}");
                    self.disconnect_and_retry().await;
                    break;
                }
                Ok(None) => {
                    log::warn!("ws stream ended");
                    self.disconnect_and_retry().await;
                    break;
                }
                Err(_timeout) => {
                    log::warn!("ws read timed out after {:?}", READ_TIMEOUT);
                    self.disconnect_and_retry().await;
                    break;
                }
            }
        }
    }

    async fn heartbeat_loop(&self) {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;
            if !self.shared.running.load(Ordering::SeqCst) {
                break;
            }
            let silence = self.shared.last_msg_time.lock().await.elapsed();
            if silence > WATCHDOG_TIMEOUT {
                log::warn!("ws watchdog: no message in {:?}, forcing reconnect", silence);
                self.disconnect_and_retry().await;
                break;
            }
            let sender = WsSender {
                inner: self.shared.writer.clone(),
            };
            if let Err(e) = sender.send_text("ping".to_string()).await {
                log::warn!("heartbeat send failed: {e}");
                self.disconnect_and_retry().await;
                break;
            }
        }
    }

    async fn disconnect_and_retry(&self) {
        self.disconnect_cleanup().await;
        if self.shared.running.load(Ordering::SeqCst) {
            self.reconnect().await;
        }
    }

    async fn reconnect(&self) {
        if self.shared.connect_lock.try_lock().is_err() {
            log::info!("reconnect skipped, connect already in progress");
            return;
        }

        let attempt = self.shared.reconnect_attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.reconnect_count.fetch_add(1, Ordering::SeqCst);

        if attempt > MAX_RECONNECT_ATTEMPTS {
            log::error!("max reconnect attempts ({MAX_RECONNECT_ATTEMPTS}) exceeded for {}", self.shared.url);
            self.shared.running.store(false, Ordering::SeqCst);
            return;
        }

        let exp = attempt.min(5);
        let delay = (BASE_BACKOFF * 2u32.pow(exp)).min(MAX_BACKOFF);
        log::info!("reconnecting to {} in {:?} (attempt {attempt})", self.shared.url, delay);
        tokio::time::sleep(delay).await;

        let gw = self.clone();
        tokio::spawn(async move { gw.connect().await });
    }

    pub fn get_status(&self) -> (u32, u64) {
        (
            self.shared.reconnect_attempt.load(Ordering::SeqCst),
            self.shared.reconnect_count.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as TestCounter;

    struct NoopHooks {
        calls: Arc<TestCounter>,
    }

    #[async_trait]
    impl WsHooks for NoopHooks {
        async fn on_connected(&self, _send: WsSender) -> CoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_message(&self, _text: String) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn disconnect_clears_connected_state() {
        let hooks = Arc::new(NoopHooks {
            calls: Arc::new(TestCounter::new(0)),
        });
        let gw = WsGateway::new("wss://example.invalid/ws", hooks);
        gw.disconnect().await;
        assert!(!gw.is_connected().await);
    }

    #[test]
    fn backoff_caps_at_max() {
        for attempt in 1..=10u32 {
            let exp = attempt.min(5);
            let delay = (BASE_BACKOFF * 2u32.pow(exp)).min(MAX_BACKOFF);
            assert!(delay <= MAX_BACKOFF);
        }
    }
}
