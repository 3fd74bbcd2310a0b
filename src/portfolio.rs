//! Portfolio state machine: cash, open positions, closed-trade ledger,
//! equity curve, peak tracking, and risk gating

use crate::config::PortfolioRiskConfig;
use crate::types::{ExitReason, Ticker, Trade};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Why `can_open_position` refused an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OpenRejection {
    #[error("Trading halted due to risk limits")]
    TradingHalted,

    #[error("Position would exceed maximum single asset allocation")]
    SingleAssetLimit,

    #[error("Insufficient cash and leverage not allowed")]
    InsufficientCash,

    #[error("Position would exceed maximum leverage")]
    LeverageLimit,

    #[error("Position would exceed maximum net exposure")]
    NetExposureLimit,

    #[error("Position would exceed maximum sector allocation")]
    SectorLimit,
}

/// One open holding; at most one per ticker
#[derive(Debug, Clone)]
pub struct Position {
    pub ticker: Ticker,
    /// Signed: positive = long, negative = short
    pub shares: f64,
    /// Volume-weighted average entry price
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    /// Cash outlay including fees, accumulated across averaging-in
    pub entry_cost: f64,
    /// Ratchets upward with marks; drives trailing stops
    pub highest_price_since_entry: f64,
    pub current_price: f64,
}

impl Position {
    pub fn current_value(&self) -> f64 {
        self.shares * self.current_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        (self.current_price - self.entry_price) * self.shares
    }

    pub fn days_held(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_timestamp).num_days()
    }
}

/// Static risk limits, fixed for the run
#[derive(Debug, Clone, Default)]
pub struct RiskLimits {
    pub leverage_allowed: bool,
    pub max_leverage: f64,
    pub max_single_asset_percent: Option<f64>,
    pub max_sector_percent: Option<f64>,
    pub max_net_exposure: Option<f64>,
    pub max_daily_drawdown: Option<f64>,
    pub max_weekly_drawdown: Option<f64>,
}

impl From<&PortfolioRiskConfig> for RiskLimits {
    fn from(config: &PortfolioRiskConfig) -> Self {
        Self {
            leverage_allowed: config.leverage_allowed,
            max_leverage: config.max_leverage,
            max_single_asset_percent: config.max_single_asset_percent,
            max_sector_percent: config.max_sector_percent,
            max_net_exposure: config.max_net_exposure,
            max_daily_drawdown: config.max_daily_drawdown,
            max_weekly_drawdown: config.max_weekly_drawdown,
        }
    }
}

/// Owned exclusively by the backtest loop for the duration of one run
#[derive(Debug, Clone)]
pub struct Portfolio {
    pub cash: f64,
    pub initial_capital: f64,
    /// BTreeMap keeps iteration order deterministic across runs
    pub positions: BTreeMap<Ticker, Position>,
    pub closed_trades: Vec<Trade>,
    pub portfolio_value: f64,
    pub peak_value: f64,
    pub peak_value_today: f64,
    pub peak_value_this_week: f64,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    /// Sticky once set; never cleared for the remainder of the run
    pub trading_halted: bool,
    pub limits: RiskLimits,
}

impl Portfolio {
    pub fn new(initial_capital: f64, limits: RiskLimits) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: BTreeMap::new(),
            closed_trades: Vec::new(),
            portfolio_value: initial_capital,
            peak_value: initial_capital,
            peak_value_today: initial_capital,
            peak_value_this_week: initial_capital,
            equity_curve: Vec::new(),
            trading_halted: false,
            limits,
        }
    }

    /// Gross position exposure: Σ |shares × current_price|
    pub fn total_position_value(&self) -> f64 {
        self.positions.values().map(|p| p.current_value().abs()).sum()
    }

    /// Signed net exposure: Σ shares × current_price
    pub fn net_exposure(&self) -> f64 {
        self.positions.values().map(|p| p.current_value()).sum()
    }

    /// Capital available for new entries
    pub fn buying_power(&self) -> f64 {
        if self.limits.leverage_allowed {
            self.portfolio_value * self.limits.max_leverage - self.total_position_value()
        } else {
            self.cash
        }
    }

    /// Sector exposure is a declared capability; no sector data exists, so
    /// current exposure always evaluates to zero
    pub fn sector_exposure(&self, _sector: &str) -> f64 {
        0.0
    }

    /// Risk gate for a prospective entry of `cost` dollars; fails closed
    pub fn can_open_position(
        &self,
        _ticker: &Ticker,
        cost: f64,
        sector: Option<&str>,
    ) -> Result<(), OpenRejection> {
        if self.trading_halted {
            return Err(OpenRejection::TradingHalted);
        }

        if let Some(max_pct) = self.limits.max_single_asset_percent {
            if cost > self.portfolio_value * max_pct / 100.0 {
                return Err(OpenRejection::SingleAssetLimit);
            }
        }

        if !self.limits.leverage_allowed && cost > self.cash {
            return Err(OpenRejection::InsufficientCash);
        }

        if self.limits.leverage_allowed && self.portfolio_value > 0.0 {
            let projected = (self.total_position_value() + cost) / self.portfolio_value;
            if projected > self.limits.max_leverage {
                return Err(OpenRejection::LeverageLimit);
            }
        }

        if let Some(max_net) = self.limits.max_net_exposure {
            if self.portfolio_value > 0.0 {
                let projected = (self.net_exposure() + cost) / self.portfolio_value * 100.0;
                if projected > max_net {
                    return Err(OpenRejection::NetExposureLimit);
                }
            }
        }

        if let (Some(sector), Some(max_sector)) = (sector, self.limits.max_sector_percent) {
            if self.sector_exposure(sector) + cost > self.portfolio_value * max_sector / 100.0 {
                return Err(OpenRejection::SectorLimit);
            }
        }

        Ok(())
    }

    /// Open or average into a position; callers must pre-check with
    /// `can_open_position`
    pub fn open_position(
        &mut self,
        ticker: Ticker,
        shares: f64,
        price: f64,
        timestamp: DateTime<Utc>,
        total_cost: f64,
    ) {
        match self.positions.get_mut(&ticker) {
            Some(position) => {
                let combined = position.shares + shares;
                if combined.abs() > f64::EPSILON {
                    position.entry_price = (position.entry_price * position.shares
                        + price * shares)
                        / combined;
                }
                position.shares = combined;
                position.entry_cost += total_cost;
                position.current_price = price;
                if price > position.highest_price_since_entry {
                    position.highest_price_since_entry = price;
                }
                debug!(%ticker, shares = combined, avg_price = position.entry_price, "averaged into position");
            }
            None => {
                self.positions.insert(
                    ticker.clone(),
                    Position {
                        ticker: ticker.clone(),
                        shares,
                        entry_price: price,
                        entry_timestamp: timestamp,
                        entry_cost: total_cost,
                        highest_price_since_entry: price,
                        current_price: price,
                    },
                );
                debug!(%ticker, shares, price, "opened position");
            }
        }
        self.cash -= total_cost;
    }

    /// Convert a position into a trade; credits cash by `net_proceeds`
    pub fn close_position(
        &mut self,
        ticker: &Ticker,
        exit_price: f64,
        timestamp: DateTime<Utc>,
        net_proceeds: f64,
        exit_fees: f64,
        reason: ExitReason,
    ) -> Option<Trade> {
        let position = match self.positions.remove(ticker) {
            Some(position) => position,
            None => {
                error!(%ticker, "attempted to close ticker with no open position");
                return None;
            }
        };

        let pnl = net_proceeds - position.entry_cost;
        let pnl_percent = if position.entry_price.abs() > f64::EPSILON {
            (exit_price - position.entry_price) / position.entry_price * 100.0
        } else {
            0.0
        };
        let trade = Trade {
            ticker: ticker.clone(),
            entry_date: position.entry_timestamp,
            entry_price: position.entry_price,
            exit_date: timestamp,
            exit_price,
            shares: position.shares,
            pnl,
            pnl_percent,
            entry_cost: position.entry_cost,
            exit_cost: exit_fees,
            holding_period_days: (timestamp - position.entry_timestamp).num_days(),
            exit_reason: reason,
        };
        self.cash += net_proceeds;
        debug!(%ticker, pnl, reason = %reason, "closed position");
        self.closed_trades.push(trade.clone());
        Some(trade)
    }

    /// Push current prices into held positions; absent tickers stay stale
    pub fn update_position_prices(&mut self, prices: &HashMap<Ticker, f64>) {
        for (ticker, position) in self.positions.iter_mut() {
            if let Some(&price) = prices.get(ticker) {
                position.current_price = price;
                if price > position.highest_price_since_entry {
                    position.highest_price_since_entry = price;
                }
            }
        }
    }

    /// Recompute portfolio value, ratchet all peaks, and append one equity
    /// curve sample; call exactly once per mark-to-market event
    pub fn update_portfolio_value(&mut self, timestamp: DateTime<Utc>) -> f64 {
        let value = self.cash + self.positions.values().map(|p| p.current_value()).sum::<f64>();
        self.portfolio_value = value;
        if value > self.peak_value {
            self.peak_value = value;
        }
        if value > self.peak_value_today {
            self.peak_value_today = value;
        }
        if value > self.peak_value_this_week {
            self.peak_value_this_week = value;
        }
        self.equity_curve.push((timestamp, value));
        value
    }

    /// Compare current value against the daily and weekly peaks; a breach
    /// halts trading permanently for the run
    pub fn check_drawdown_limits(&mut self) -> Option<String> {
        if let Some(max_daily) = self.limits.max_daily_drawdown {
            if self.peak_value_today > 0.0 {
                let drawdown =
                    (self.peak_value_today - self.portfolio_value) / self.peak_value_today * 100.0;
                if drawdown > max_daily {
                    self.trading_halted = true;
                    let reason = format!(
                        "daily drawdown {drawdown:.2}% breached limit {max_daily:.2}%"
                    );
                    warn!(%reason, "trading halted");
                    return Some(reason);
                }
            }
        }
        if let Some(max_weekly) = self.limits.max_weekly_drawdown {
            if self.peak_value_this_week > 0.0 {
                let drawdown = (self.peak_value_this_week - self.portfolio_value)
                    / self.peak_value_this_week
                    * 100.0;
                if drawdown > max_weekly {
                    self.trading_halted = true;
                    let reason = format!(
                        "weekly drawdown {drawdown:.2}% breached limit {max_weekly:.2}%"
                    );
                    warn!(%reason, "trading halted");
                    return Some(reason);
                }
            }
        }
        None
    }

    pub fn reset_daily_peak(&mut self) {
        self.peak_value_today = self.portfolio_value;
    }

    pub fn reset_weekly_peak(&mut self) {
        self.peak_value_this_week = self.portfolio_value;
    }
}
