//! Cost model: execution prices, commissions, fees, and borrow cost
//!
//! Pure functions; the loop applies these before any portfolio mutation.

use crate::config::{CommissionType, EntryTiming, ExecutionConfig, MtmPrice};
use crate::types::Bar;

/// Result of pricing one order through the cost model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Execution {
    /// Fill price after slippage
    pub price: f64,
    /// Cash impact: total cost for a buy, net proceeds for a sell
    pub total: f64,
    /// Commission plus exchange fees
    pub fees: f64,
}

/// Per-run trading friction parameters
#[derive(Debug, Clone)]
pub struct CostModel {
    pub slippage_percent: f64,
    pub commission_type: CommissionType,
    pub commission_amount: f64,
    pub exchange_fee_percent: f64,
}

impl CostModel {
    pub fn from_config(exec: &ExecutionConfig) -> Self {
        Self {
            slippage_percent: exec.slippage,
            commission_type: exec.commission_type,
            commission_amount: exec.commission_amount,
            exchange_fee_percent: exec.exchange_fees,
        }
    }

    /// Frictionless model, used by tests and as a fallback
    pub fn zero() -> Self {
        Self {
            slippage_percent: 0.0,
            commission_type: CommissionType::PerTrade,
            commission_amount: 0.0,
            exchange_fee_percent: 0.0,
        }
    }

    /// Commission for an order of `shares` (sign ignored)
    pub fn commission(&self, shares: f64) -> f64 {
        match self.commission_type {
            CommissionType::PerTrade => self.commission_amount,
            CommissionType::PerShare => self.commission_amount * shares.abs(),
            // One contract covers 100 shares
            CommissionType::PerContract => self.commission_amount * shares.abs() / 100.0,
        }
    }

    /// Price a buy: slippage against the buyer, fees added on top
    pub fn buy(&self, shares: f64, price: f64) -> Execution {
        let fill = price * (1.0 + self.slippage_percent / 100.0);
        let gross = shares.abs() * fill;
        let fees = self.commission(shares) + gross * self.exchange_fee_percent / 100.0;
        Execution {
            price: fill,
            total: gross + fees,
            fees,
        }
    }

    /// Price a sell: slippage against the seller, fees taken out of proceeds
    pub fn sell(&self, shares: f64, price: f64) -> Execution {
        let fill = price * (1.0 - self.slippage_percent / 100.0);
        let gross = shares.abs() * fill;
        let fees = self.commission(shares) + gross * self.exchange_fee_percent / 100.0;
        Execution {
            price: fill,
            total: gross - fees,
            fees,
        }
    }

    /// Largest whole share count whose buy cost fits inside `budget`
    ///
    /// Per-trade commission is flat, so it comes off the budget first; the
    /// per-share unit cost folds in slippage, exchange fees, and any
    /// per-share or per-contract commission.
    pub fn affordable_shares(&self, budget: f64, price: f64) -> f64 {
        let fill = price * (1.0 + self.slippage_percent / 100.0);
        if fill <= 0.0 {
            return 0.0;
        }
        let per_share_commission = match self.commission_type {
            CommissionType::PerTrade => 0.0,
            CommissionType::PerShare => self.commission_amount,
            CommissionType::PerContract => self.commission_amount / 100.0,
        };
        let flat = match self.commission_type {
            CommissionType::PerTrade => self.commission_amount,
            _ => 0.0,
        };
        let unit = fill * (1.0 + self.exchange_fee_percent / 100.0) + per_share_commission;
        let shares = ((budget - flat) / unit).floor();
        shares.max(0.0)
    }
}

/// Execution price for the configured timing rule
///
/// `NextBarOpen` uses the bar's open because settlement has already advanced
/// one timestamp by the time the pending order drains. Vwap is approximated
/// by the close since per-bar trade data is unavailable.
pub fn execution_price(bar: &Bar, timing: EntryTiming) -> f64 {
    match timing {
        EntryTiming::SameBarClose => bar.close,
        EntryTiming::NextBarOpen => bar.open,
        EntryTiming::Midpoint => (bar.high + bar.low) / 2.0,
        EntryTiming::Vwap => bar.close,
    }
}

/// Valuation price for the configured mark-to-market rule
pub fn mtm_price(bar: &Bar, price: MtmPrice) -> f64 {
    match price {
        MtmPrice::Close | MtmPrice::Vwap | MtmPrice::Last => bar.close,
        MtmPrice::Mid => (bar.high + bar.low) / 2.0,
    }
}

/// One bar of borrow cost on a short position, from an annualized percent rate
pub fn borrow_cost(position_value: f64, annual_rate_percent: f64) -> f64 {
    position_value.abs() * (annual_rate_percent / 100.0) / 365.0
}
