use chrono::{DateTime, Utc, Duration};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_daily_drawdown_percent: f64, // e.g. 0.15 (15%)
    pub max_consecutive_losses: usize,   // e.g. 5
    pub trading_halt_duration_secs: i64, // e.g. 3600 (1 hour)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_daily_drawdown_percent: 0.10,
            max_consecutive_losses: 5,
            trading_halt_duration_secs: 3600,
        }
    }
}

pub struct RiskManager {
    config: RiskConfig,
    start_of_day_balance: f64,
    last_day_reset: DateTime<Utc>,
    consecutive_loss_count: usize,
    halt_until: Option<DateTime<Utc>>,
    is_kill_switch_active: bool,
}

impl RiskManager {
    pub fn new(config: RiskConfig, current_balance: f64) -> Self {
        Self {
            config,
            start_of_day_balance: current_balance,
            last_day_reset: Utc::now(),
            consecutive_loss_count: 0,
            halt_until: None,
            is_kill_switch_active: false,
        }
    }

    /// Check if trading is allowed based on current state
    pub fn can_trade(&self) -> Result<(), String> {
        if self.is_kill_switch_active {
            return Err("Kill switch is ACTIVE".to_string());
        }

        if let Some(halt_end) = self.halt_until {
            if Utc::now() < halt_end {
                return Err(format!("Trading halted until {}", halt_end));
            }
        }

        Ok(())
    }

    /// Rolls the day-boundary and re-checks the daily-drawdown breaker against
    /// the latest polled equity, without touching the consecutive-loss
    /// counter. Used where only equity (not a per-trade realized PnL) is
    /// available — see `Oms`'s circuit-breaker gate.
    pub fn update_equity(&mut self, current_balance: f64) {
        // `Oms` constructs its breaker before it knows the account's real
        // equity (the first balance poll happens after startup), so the
        // baseline is seeded lazily on the first call instead of at
        // construction.
        if self.start_of_day_balance <= 0.0 {
            self.start_of_day_balance = current_balance;
            self.last_day_reset = Utc::now();
            return;
        }

        let now = Utc::now();
        if now.date_naive() > self.last_day_reset.date_naive() {
            self.start_of_day_balance = current_balance;
            self.last_day_reset = now;
        }
        self.check_circuit_breakers(current_balance);
    }

    /// Update state with a closed trade result. The strategy process (out of
    /// scope for this crate) is expected to call this with realized PnL per
    /// closed position; the core only drives `update_equity` internally.
    pub fn update_trade_result(&mut self, pnl: f64, current_balance: f64) {
        // 1. Reset daily stats if it's a new day (UTC)
        let now = Utc::now();
        if now.date_naive() > self.last_day_reset.date_naive() {
            self.start_of_day_balance = current_balance;
            self.last_day_reset = now;
        }

        // 2. Update consecutive losses
        if pnl < 0.0 {
            self.consecutive_loss_count += 1;
        } else {
            self.consecutive_loss_count = 0;
        }

        // 3. Check circuit breakers
        self.check_circuit_breakers(current_balance);
    }

    fn check_circuit_breakers(&mut self, current_balance: f64) {
        // A. Consecutive Loss Halt
        if self.consecutive_loss_count >= self.config.max_consecutive_losses {
            let halt_duration = Duration::seconds(self.config.trading_halt_duration_secs);
            self.halt_until = Some(Utc::now() + halt_duration);
            self.consecutive_loss_count = 0; // Reset counter after halting
            log::warn!("RISK: Halt triggered! {} consecutive losses. Pausing for {}s", 
                self.config.max_consecutive_losses, self.config.trading_halt_duration_secs);
        }

        // B. Daily Drawdown Halt
        let drawdown = (self.start_of_day_balance - current_balance) / self.start_of_day_balance;
        if drawdown > self.config.max_daily_drawdown_percent {
            // Halt until tomorrow
            let tomorrow = Utc::now().date_naive().succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap().and_utc();
            self.halt_until = Some(tomorrow);
            log::error!("RISK: CRITICAL! Daily drawdown {:.1}% exceeds limit {:.1}%. Halting until tomorrow.", 
                drawdown * 100.0, self.config.max_daily_drawdown_percent * 100.0);
        }
    }

    /// Manual Kill Switch
    pub fn set_kill_switch(&mut self, active: bool) {
        self.is_kill_switch_active = active;
        log::warn!("RISK: Kill switch set to {}", active);
    }

    pub fn clear_halt(&mut self) {
        self.halt_until = None;
        self.consecutive_loss_count = 0;
        log::info!("RISK: Trading halt manually cleared.");
    }

    pub fn get_state(&self) -> RiskState {
        RiskState {
            start_of_day_balance: self.start_of_day_balance,
            last_day_reset: self.last_day_reset,
            consecutive_loss_count: self.consecutive_loss_count,
            halt_until: self.halt_until,
            is_kill_switch_active: self.is_kill_switch_active,
        }
    }

    pub fn restore_state(&mut self, state: RiskState) {
        self.start_of_day_balance = state.start_of_day_balance;
        self.last_day_reset = state.last_day_reset;
        self.consecutive_loss_count = state.consecutive_loss_count;
        self.halt_until = state.halt_until;
        self.is_kill_switch_active = state.is_kill_switch_active;
        log::info!("RISK: Restored state: StartBal=${:.2}, LossStreak={}", 
            self.start_of_day_balance, self.consecutive_loss_count);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub start_of_day_balance: f64,
    pub last_day_reset: DateTime<Utc>,
    pub consecutive_loss_count: usize,
    pub halt_until: Option<DateTime<Utc>>,
    pub is_kill_switch_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RiskConfig {
        RiskConfig {
            max_daily_drawdown_percent: 0.10,
            max_consecutive_losses: 3,
            trading_halt_duration_secs: 3600,
        }
    }

    #[test]
    fn consecutive_losses_trip_a_halt_and_reset_the_counter() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_trade_result(-10.0, 9_990.0);
        risk.update_trade_result(-10.0, 9_980.0);
        assert!(risk.can_trade().is_ok());
        risk.update_trade_result(-10.0, 9_970.0);
        assert!(risk.can_trade().is_err());
        assert_eq!(risk.get_state().consecutive_loss_count, 0);
    }

    #[test]
    fn a_winning_trade_resets_the_consecutive_loss_streak() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_trade_result(-10.0, 9_990.0);
        risk.update_trade_result(-10.0, 9_980.0);
        risk.update_trade_result(5.0, 9_985.0);
        risk.update_trade_result(-10.0, 9_975.0);
        assert!(risk.can_trade().is_ok());
    }

    #[test]
    fn daily_drawdown_beyond_limit_halts_trading() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_equity(8_900.0);
        assert!(risk.can_trade().is_err());
    }

    #[test]
    fn drawdown_within_limit_does_not_halt() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_equity(9_200.0);
        assert!(risk.can_trade().is_ok());
    }

    #[test]
    fn kill_switch_overrides_everything_until_cleared() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.set_kill_switch(true);
        assert!(risk.can_trade().is_err());
        risk.set_kill_switch(false);
        assert!(risk.can_trade().is_ok());
    }

    #[test]
    fn manual_clear_halt_restores_trading_and_resets_loss_streak() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_trade_result(-10.0, 9_990.0);
        risk.update_trade_result(-10.0, 9_980.0);
        risk.update_trade_result(-10.0, 9_970.0);
        assert!(risk.can_trade().is_err());
        risk.clear_halt();
        assert!(risk.can_trade().is_ok());
    }

    #[test]
    fn state_round_trips_through_get_state_and_restore_state() {
        let mut risk = RiskManager::new(cfg(), 10_000.0);
        risk.update_trade_result(-10.0, 9_990.0);
        let snapshot = risk.get_state();

        let mut restored = RiskManager::new(cfg(), 0.0);
        restored.restore_state(snapshot.clone());
        assert_eq!(restored.get_state().consecutive_loss_count, snapshot.consecutive_loss_count);
        assert_eq!(restored.get_state().start_of_day_balance, snapshot.start_of_day_balance);
    }
}
