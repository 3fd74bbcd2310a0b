//! Performance analytics over the finished equity curve and trade ledger
//!
//! Pure, stateless functions: calling them twice on the same inputs yields
//! identical output.

use crate::types::Trade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::HashMap;

/// Annualization factor for daily samples
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Length of a year for CAGR purposes
const DAYS_PER_YEAR: f64 = 365.25;

pub const DEFAULT_RISK_FREE_RATE: f64 = 0.02;

/// Merged basic, ratio, and trade statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceReport {
    /// Percent change from first to last equity sample
    pub total_return: f64,
    /// Annualized growth rate, percent
    pub cagr: f64,
    /// Largest peak-to-trough decline, percent
    pub max_drawdown: f64,
    /// Consecutive below-peak samples in the longest drawdown
    pub max_drawdown_duration: usize,
    /// Annualized standard deviation of per-sample returns, percent
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percent of trades with positive P&L
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub win_loss_ratio: f64,
    pub profit_factor: f64,
    pub avg_holding_period: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchmarkComparison {
    pub alpha: f64,
    pub beta: f64,
    pub tracking_error: f64,
    pub information_ratio: f64,
}

/// Simple per-sample returns of an equity curve
pub fn per_sample_returns(curve: &[(DateTime<Utc>, f64)]) -> Vec<f64> {
    curve
        .windows(2)
        .filter(|w| w[0].1.abs() > f64::EPSILON)
        .map(|w| (w[1].1 - w[0].1) / w[0].1)
        .collect()
}

/// Compute the full report from a finished run
pub fn analyze(
    equity_curve: &[(DateTime<Utc>, f64)],
    trades: &[Trade],
    risk_free_rate: f64,
) -> PerformanceReport {
    let mut report = PerformanceReport::default();
    fill_basic_metrics(&mut report, equity_curve);
    fill_ratio_metrics(&mut report, equity_curve, risk_free_rate);
    fill_trade_statistics(&mut report, trades);
    report
}

fn fill_basic_metrics(report: &mut PerformanceReport, curve: &[(DateTime<Utc>, f64)]) {
    let (first, last) = match (curve.first(), curve.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return,
    };
    if first.1.abs() > f64::EPSILON {
        report.total_return = (last.1 - first.1) / first.1 * 100.0;
    }

    let years = (last.0 - first.0).num_days() as f64 / DAYS_PER_YEAR;
    if years > 0.0 && first.1 > 0.0 && last.1 > 0.0 {
        report.cagr = ((last.1 / first.1).powf(1.0 / years) - 1.0) * 100.0;
    }

    let (max_drawdown, duration) = max_drawdown_and_duration(curve);
    report.max_drawdown = max_drawdown;
    report.max_drawdown_duration = duration;

    let returns = per_sample_returns(curve);
    if returns.len() >= 2 {
        report.volatility = returns.iter().std_dev() * TRADING_DAYS_PER_YEAR.sqrt() * 100.0;
    }
}

fn max_drawdown_and_duration(curve: &[(DateTime<Utc>, f64)]) -> (f64, usize) {
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0f64;
    let mut current_run = 0usize;
    let mut max_run = 0usize;
    for &(_, value) in curve {
        if value >= peak {
            peak = value;
            current_run = 0;
        } else {
            current_run += 1;
            max_run = max_run.max(current_run);
            if peak > 0.0 {
                let drawdown = (peak - value) / peak * 100.0;
                max_drawdown = max_drawdown.max(drawdown);
            }
        }
    }
    (max_drawdown, max_run)
}

fn fill_ratio_metrics(
    report: &mut PerformanceReport,
    curve: &[(DateTime<Utc>, f64)],
    risk_free_rate: f64,
) {
    let returns = per_sample_returns(curve);
    if returns.len() < 2 {
        return;
    }
    let daily_risk_free = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let mean_excess = returns.iter().map(|r| r - daily_risk_free).sum::<f64>() / returns.len() as f64;

    let std_all = returns.iter().std_dev();
    if std_all > 0.0 {
        report.sharpe_ratio = mean_excess / std_all * TRADING_DAYS_PER_YEAR.sqrt();
    }

    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.len() >= 2 {
        let downside_std = downside.iter().std_dev();
        if downside_std > 0.0 {
            report.sortino_ratio = mean_excess / downside_std * TRADING_DAYS_PER_YEAR.sqrt();
        }
    }

    if report.max_drawdown > 0.0 {
        report.calmar_ratio = report.cagr / report.max_drawdown;
    }
}

fn fill_trade_statistics(report: &mut PerformanceReport, trades: &[Trade]) {
    report.total_trades = trades.len();
    if trades.is_empty() {
        return;
    }

    let wins: Vec<&Trade> = trades.iter().filter(|t| t.pnl > 0.0).collect();
    let losses: Vec<&Trade> = trades.iter().filter(|t| t.pnl < 0.0).collect();
    report.winning_trades = wins.len();
    report.losing_trades = losses.len();
    report.win_rate = wins.len() as f64 / trades.len() as f64 * 100.0;

    let gross_profit: f64 = wins.iter().map(|t| t.pnl).sum();
    let gross_loss: f64 = losses.iter().map(|t| t.pnl).sum();
    if !wins.is_empty() {
        report.avg_win = gross_profit / wins.len() as f64;
        report.largest_win = wins.iter().map(|t| t.pnl).fold(f64::MIN, f64::max);
    }
    if !losses.is_empty() {
        report.avg_loss = gross_loss / losses.len() as f64;
        report.largest_loss = losses.iter().map(|t| t.pnl).fold(f64::MAX, f64::min);
    }
    if report.avg_loss.abs() > f64::EPSILON {
        report.win_loss_ratio = report.avg_win / report.avg_loss.abs();
    }
    if gross_loss.abs() > f64::EPSILON {
        report.profit_factor = gross_profit / gross_loss.abs();
    }
    report.avg_holding_period = trades
        .iter()
        .map(|t| t.holding_period_days as f64)
        .sum::<f64>()
        / trades.len() as f64;
}

/// Benchmark-relative metrics from two equity curves
///
/// Return series are paired by timestamp; samples present on only one side
/// are dropped before any statistic is computed.
pub fn benchmark_comparison(
    portfolio_curve: &[(DateTime<Utc>, f64)],
    benchmark_curve: &[(DateTime<Utc>, f64)],
    risk_free_rate: f64,
) -> BenchmarkComparison {
    let mut comparison = BenchmarkComparison::default();

    let benchmark_returns: HashMap<DateTime<Utc>, f64> = benchmark_curve
        .windows(2)
        .filter(|w| w[0].1.abs() > f64::EPSILON)
        .map(|w| (w[1].0, (w[1].1 - w[0].1) / w[0].1))
        .collect();

    let mut portfolio = Vec::new();
    let mut benchmark = Vec::new();
    for w in portfolio_curve.windows(2) {
        if w[0].1.abs() <= f64::EPSILON {
            continue;
        }
        if let Some(&bench) = benchmark_returns.get(&w[1].0) {
            portfolio.push((w[1].1 - w[0].1) / w[0].1);
            benchmark.push(bench);
        }
    }
    if portfolio.len() < 2 {
        return comparison;
    }

    let benchmark_variance = benchmark.iter().variance();
    if benchmark_variance > 0.0 {
        comparison.beta = portfolio.iter().covariance(benchmark.iter()) / benchmark_variance;
    }

    let annual_portfolio = portfolio.iter().mean() * TRADING_DAYS_PER_YEAR;
    let annual_benchmark = benchmark.iter().mean() * TRADING_DAYS_PER_YEAR;
    comparison.alpha = (annual_portfolio
        - (risk_free_rate + comparison.beta * (annual_benchmark - risk_free_rate)))
        * 100.0;

    let excess: Vec<f64> = portfolio
        .iter()
        .zip(benchmark.iter())
        .map(|(p, b)| p - b)
        .collect();
    let excess_std = excess.iter().std_dev();
    if excess_std > 0.0 {
        comparison.tracking_error = excess_std * TRADING_DAYS_PER_YEAR.sqrt() * 100.0;
        comparison.information_ratio = excess.iter().mean() * TRADING_DAYS_PER_YEAR
            / (excess_std * TRADING_DAYS_PER_YEAR.sqrt());
    }

    comparison
}
