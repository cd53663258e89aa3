//! Profit-factor performance feedback, kept as a standalone component
//! distinct from Guardian (anomaly detection) and `RiskManager`
//! (hard drawdown/consecutive-loss breaker). This one produces a soft
//! suggestion — reduce size or halt — for the external strategy to act on;
//! it never touches orders or positions itself.
//!
//! Grounded in the teacher's `monitor.rs`, kept close to verbatim since the
//! profit-factor math has no Hyperliquid-specific assumptions.

use std::collections::VecDeque;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub window_size: usize,
    pub min_trades_for_action: usize,
    pub pf_threshold_warning: f64,
    pub pf_threshold_critical: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            min_trades_for_action: 20,
            pf_threshold_warning: 1.0,
            pf_threshold_critical: 0.8,
        }
    }
}

pub struct PerformanceMonitor {
    config: MonitorConfig,
    history: VecDeque<TradeResult>,
}

#[derive(Debug, Clone)]
struct TradeResult {
    pub pnl: f64,
    pub is_win: bool,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            history: VecDeque::new(),
        }
    }

    pub fn record_trade(&mut self, pnl: f64) {
        if self.history.len() >= self.config.window_size {
            self.history.pop_front();
        }
        self.history.push_back(TradeResult {
            pnl,
            is_win: pnl > 0.0,
        });
    }

    pub fn get_metrics(&self) -> PerformanceMetrics {
        if self.history.is_empty() {
            return PerformanceMetrics::default();
        }

        let total_trades = self.history.len();
        let wins = self.history.iter().filter(|t| t.is_win).count();
        let win_rate = wins as f64 / total_trades as f64 * 100.0;

        let gross_profit: f64 = self.history.iter().filter(|t| t.pnl > 0.0).map(|t| t.pnl).sum();
        let gross_loss: f64 = self.history.iter().filter(|t| t.pnl < 0.0).map(|t| t.pnl.abs()).sum();

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            100.0
        } else {
            0.0
        };

        PerformanceMetrics {
            win_rate,
            profit_factor,
            trade_count: total_trades,
            suggested_action: self.evaluate_action(profit_factor, total_trades),
        }
    }

    fn evaluate_action(&self, pf: f64, count: usize) -> FeedbackAction {
        if count < self.config.min_trades_for_action {
            return FeedbackAction::None;
        }

        if pf < self.config.pf_threshold_critical {
            FeedbackAction::HaltTrading
        } else if pf < self.config.pf_threshold_warning {
            FeedbackAction::ReduceSize(0.5)
        } else {
            FeedbackAction::None
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.history.is_empty() {
            0.0
        } else {
            let total_trades = self.history.len();
            let wins = self.history.iter().filter(|t| t.is_win).count();
            wins as f64 / total_trades as f64 * 100.0
        }
    }
}

#[derive(Debug, Default)]
pub struct PerformanceMetrics {
    pub win_rate: f64,
    pub profit_factor: f64,
    pub trade_count: usize,
    pub suggested_action: FeedbackAction,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackAction {
    None,
    ReduceSize(f64),
    HaltTrading,
}

impl Default for FeedbackAction {
    fn default() -> Self {
        Self::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_has_no_suggested_action() {
        let config = MonitorConfig::default();
        let monitor = PerformanceMonitor::new(config);
        let metrics = monitor.get_metrics();

        assert_eq!(metrics.trade_count, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.suggested_action, FeedbackAction::None);
    }

    #[test]
    fn all_wins_suggest_no_action() {
        let config = MonitorConfig {
            window_size: 10,
            min_trades_for_action: 5,
            pf_threshold_warning: 1.5,
            pf_threshold_critical: 1.0,
        };
        let mut monitor = PerformanceMonitor::new(config);

        for _ in 0..5 {
            monitor.record_trade(10.0);
        }

        let metrics = monitor.get_metrics();
        assert_eq!(metrics.trade_count, 5);
        assert_eq!(metrics.win_rate, 100.0);
        assert_eq!(metrics.profit_factor, 100.0);
        assert_eq!(metrics.suggested_action, FeedbackAction::None);
    }

    #[test]
    fn middling_profit_factor_suggests_reduce_size() {
        let config = MonitorConfig {
            window_size: 10,
            min_trades_for_action: 5,
            pf_threshold_warning: 1.5,
            pf_threshold_critical: 0.5,
        };
        let mut monitor = PerformanceMonitor::new(config);

        for _ in 0..3 { monitor.record_trade(10.0); }
        for _ in 0..3 { monitor.record_trade(-8.33); }

        let metrics = monitor.get_metrics();
        match metrics.suggested_action {
            FeedbackAction::ReduceSize(x) => assert_eq!(x, 0.5),
            other => panic!("expected ReduceSize, got {:?}", other),
        }
    }

    #[test]
    fn poor_profit_factor_suggests_halt() {
        let config = MonitorConfig {
            window_size: 10,
            min_trades_for_action: 5,
            pf_threshold_warning: 1.5,
            pf_threshold_critical: 0.8,
        };
        let mut monitor = PerformanceMonitor::new(config);

        monitor.record_trade(10.0);
        for _ in 0..5 { monitor.record_trade(-10.0); }

        let metrics = monitor.get_metrics();
        assert_eq!(metrics.suggested_action, FeedbackAction::HaltTrading);
    }

    #[test]
    fn window_rolls_oldest_trade_out() {
        let config = MonitorConfig {
            window_size: 3,
            min_trades_for_action: 1,
            pf_threshold_warning: 0.0,
            pf_threshold_critical: 0.0,
        };
        let mut monitor = PerformanceMonitor::new(config);

        monitor.record_trade(1.0);
        monitor.record_trade(2.0);
        monitor.record_trade(3.0);

        assert_eq!(monitor.history.len(), 3);
        assert_eq!(monitor.history.front().unwrap().pnl, 1.0);

        monitor.record_trade(4.0);
        assert_eq!(monitor.history.len(), 3);
        assert_eq!(monitor.history.front().unwrap().pnl, 2.0);
        assert_eq!(monitor.history.back().unwrap().pnl, 4.0);
    }
}
