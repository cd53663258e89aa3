mod config;
mod engine;
mod error;
mod event_bus;
mod guardian;
mod market_data;
mod monitor;
mod oms;
mod parsers;
mod persistence;
mod position_sizer;
mod rest_gateway;
mod risk;
mod shadow_ledger;
mod signing;
mod ws_gateway;
mod ws_private;
mod ws_public;

use std::sync::Arc;

use engine::Engine;

fn trading_symbols() -> Vec<String> {
    std::env::var("TRADE_SYMBOLS")
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_else(|| vec!["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()])
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match config::EngineConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let symbols = trading_symbols();
    log::info!("trade-core starting for symbols: {:?}", symbols);

    let engine = Arc::new(Engine::new(config, symbols));
    engine.start().await;

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(e) => log::error!("failed to listen for shutdown signal: {e}"),
    }

    engine.stop().await;
}
