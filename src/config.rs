//! Typed startup configuration, loaded once from environment variables.
//!
//! Mirrors the teacher's flat `std::env::var` + `.env` loading style (see the
//! old `main.rs`), but collapses it into a single struct instead of scattered
//! lookups so every component receives an already-validated value.

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ExchangeCreds {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
    pub demo: bool,
}

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub check_interval_secs: u64,
    pub event_loop_threshold: u64,
    pub error_log_threshold: u32,
    pub critical_log_threshold: u32,
    pub equity_drop_threshold_pct: f64,
    pub ws_reconnect_threshold: u32,
    pub auto_close_on_meltdown: bool,
    pub snapshot_path: String,
    pub log_file: String,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            event_loop_threshold: 10_000,
            error_log_threshold: 20,
            critical_log_threshold: 5,
            equity_drop_threshold_pct: 0.10,
            ws_reconnect_threshold: 30,
            auto_close_on_meltdown: false,
            snapshot_path: "data/meltdown_snapshots/".to_string(),
            log_file: "logs/bot.log".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionSizingConfig {
    pub base_equity_ratio: f64,
    pub min_order_value: f64,
    pub signal_threshold_normal: f64,
    pub signal_threshold_aggressive: f64,
    pub signal_aggressive_multiplier: f64,
    pub liquidity_depth_ratio: f64,
    pub liquidity_depth_levels: usize,
    pub volatility_window: usize,
    pub volatility_threshold: f64,
}

impl Default for PositionSizingConfig {
    fn default() -> Self {
        Self {
            base_equity_ratio: 0.02,
            min_order_value: 10.0,
            signal_threshold_normal: 5.0,
            signal_threshold_aggressive: 10.0,
            signal_aggressive_multiplier: 1.5,
            liquidity_depth_ratio: 0.20,
            liquidity_depth_levels: 3,
            volatility_window: 20,
            volatility_threshold: 0.001,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_single_order_size_percent: f64,
    pub max_daily_drawdown_percent: f64,
    pub max_consecutive_losses: u32,
    pub trading_halt_duration_secs: i64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_single_order_size_percent: 0.20,
            max_daily_drawdown_percent: 0.10,
            max_consecutive_losses: 5,
            trading_halt_duration_secs: 3600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShadowLedgerConfig {
    pub sync_threshold_pct: f64,
    pub cooldown_secs: u64,
}

impl Default for ShadowLedgerConfig {
    fn default() -> Self {
        Self {
            sync_threshold_pct: 0.10,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub creds: Option<ExchangeCreds>,
    pub rest_base_url: String,
    pub ws_public_url: String,
    pub ws_private_url: String,
    pub event_bus_capacity: usize,
    pub guardian: GuardianConfig,
    pub sizing: PositionSizingConfig,
    pub risk: RiskLimits,
    pub shadow_ledger: ShadowLedgerConfig,
    pub monitor: crate::monitor::MonitorConfig,
    pub state_file: String,
}

impl EngineConfig {
    /// Loads configuration from the process environment. `.env` is expected
    /// to have already been applied by the caller via `dotenvy::dotenv()`.
    ///
    /// Credentials are optional: a missing trio of `OKX_*` vars is fine when
    /// the engine is wired to a `NullRestGateway`/sim gateway for testing, but
    /// is a `ConfigError` the moment a live gateway tries to use them.
    pub fn from_env() -> Result<Self, CoreError> {
        let demo = env_bool("USE_DEMO", true);
        let creds = match (
            std::env::var("OKX_API_KEY"),
            std::env::var("OKX_SECRET_KEY"),
            std::env::var("OKX_PASSPHRASE"),
        ) {
            (Ok(api_key), Ok(secret_key), Ok(passphrase)) => Some(ExchangeCreds {
                api_key,
                secret_key,
                passphrase,
                demo,
            }),
            (Err(_), Err(_), Err(_)) => None,
            _ => {
                return Err(CoreError::Config(
                    "OKX_API_KEY, OKX_SECRET_KEY and OKX_PASSPHRASE must all be set together"
                        .to_string(),
                ))
            }
        };

        let (rest_base_url, ws_public_url, ws_private_url) = if demo {
            (
                "https://www.okx.com".to_string(),
                "wss://wspap.okx.com:8443/ws/v5/public".to_string(),
                "wss://wspap.okx.com:8443/ws/v5/private".to_string(),
            )
        } else {
            (
                "https://www.okx.com".to_string(),
                "wss://ws.okx.com:8443/ws/v5/public".to_string(),
                "wss://ws.okx.com:8443/ws/v5/private".to_string(),
            )
        };

        Ok(Self {
            creds,
            rest_base_url,
            ws_public_url,
            ws_private_url,
            event_bus_capacity: env_usize("EVENT_BUS_CAPACITY", 10_000),
            guardian: GuardianConfig::default(),
            sizing: PositionSizingConfig::default(),
            risk: RiskLimits::default(),
            shadow_ledger: ShadowLedgerConfig::default(),
            monitor: crate::monitor::MonitorConfig::default(),
            state_file: std::env::var("ENGINE_STATE_FILE")
                .unwrap_or_else(|_| "data/engine_state.json".to_string()),
        })
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_creds_is_fine_for_sim_mode() {
        std::env::remove_var("OKX_API_KEY");
        std::env::remove_var("OKX_SECRET_KEY");
        std::env::remove_var("OKX_PASSPHRASE");
        let cfg = EngineConfig::from_env().unwrap();
        assert!(cfg.creds.is_none());
    }

    #[test]
    fn partial_creds_is_a_config_error() {
        std::env::set_var("OKX_API_KEY", "k");
        std::env::remove_var("OKX_SECRET_KEY");
        std::env::remove_var("OKX_PASSPHRASE");
        let result = EngineConfig::from_env();
        std::env::remove_var("OKX_API_KEY");
        assert!(result.is_err());
    }
}
