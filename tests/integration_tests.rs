//! Integration tests for the backtesting engine
//!
//! These tests run full backtests over small hand-built datasets and check
//! the resulting trades, equity curves, and summary metrics end to end.

use chrono::{DateTime, TimeZone, Utc};

use approx::assert_relative_eq;
use equity_backtester::backtest::Backtester;
use equity_backtester::config::{CommissionType, PositionSizingMethod};
use equity_backtester::data::{CorporateActions, MarketDataset};
use equity_backtester::strategy::StrategyEngine;
use equity_backtester::types::{Bar, Ticker};
use equity_backtester::Config;

// =============================================================================
// Test Utilities
// =============================================================================

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

/// Build bars for one ticker from (day-of-month, close) pairs
fn make_bars(ticker: &str, closes: &[(u32, f64)]) -> Vec<Bar> {
    closes
        .iter()
        .map(|&(d, close)| Bar {
            timestamp: day(d),
            ticker: Ticker::new(ticker),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1000.0,
            adjusted_close: None,
        })
        .collect()
}

fn base_config(tickers: &[&str]) -> Config {
    let mut config = Config::default();
    config.market_data.tickers = tickers.iter().map(|t| t.to_string()).collect();
    config.strategy.entry_logic = Some("buy on the first day".to_string());
    config.strategy.exit_logic = Some("hold until the end".to_string());
    config.strategy.position_sizing_method = PositionSizingMethod::FixedDollar;
    config.strategy.fixed_dollar_amount = Some(10_000.0);
    config
}

async fn run_backtest(
    config: Config,
    dataset: MarketDataset,
    benchmark: Option<Vec<(DateTime<Utc>, f64)>>,
) -> equity_backtester::backtest::BacktestResult {
    let strategy = StrategyEngine::from_config(&config.strategy, &config.portfolio_risk, None);
    Backtester::new(config, dataset, CorporateActions::default(), benchmark, strategy)
        .run()
        .await
}

// =============================================================================
// Position Sizing and Costs
// =============================================================================

/// Full-portfolio sizing at $50 wants 2000 shares, but a $1 flat commission
/// makes that unaffordable; the order shrinks to 1999 shares and fills.
#[tokio::test]
async fn test_full_percent_sizing_shrinks_to_affordable_shares() {
    let dataset = MarketDataset::from_bars(make_bars(
        "AAPL",
        &[(2, 50.0), (3, 51.0), (4, 51.5), (5, 52.0), (8, 53.0)],
    ));
    let mut config = base_config(&["AAPL"]);
    config.strategy.position_sizing_method = PositionSizingMethod::PortfolioPercent;
    config.strategy.portfolio_percent = Some(100.0);
    config.strategy.fixed_dollar_amount = None;
    config.strategy.time_based_exit = Some(3);
    config.trading_execution.commission_type = CommissionType::PerTrade;
    config.trading_execution.commission_amount = 1.0;

    let result = run_backtest(config, dataset, None).await;

    assert_eq!(result.status, "success");
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_relative_eq!(trade.shares, 1999.0);
    assert_relative_eq!(trade.entry_price, 50.0);
    // Time exit fires on Jan 5 (3 days held) at the 52.00 close
    assert_eq!(trade.exit_date, "2024-01-05");
    assert_relative_eq!(trade.exit_price, 52.0);
    assert_eq!(trade.exit_reason, "time_exit");
    // P&L nets both $1 commissions: 1999 * (52 - 50) - 2
    assert_relative_eq!(trade.pnl, 3996.0, epsilon = 1e-6);

    // Final equity reconciles with the realized P&L
    let last = result.equity_curve.last().unwrap();
    assert_relative_eq!(last.value, 103_996.0, epsilon = 0.01);
    assert_relative_eq!(result.summary.total_return, 3.996, epsilon = 1e-3);
}

/// Fees reduce P&L but never leak value: equity always equals initial
/// capital plus the sum of realized and unrealized P&L.
#[tokio::test]
async fn test_equity_reconciles_with_trade_pnl() {
    let dataset = MarketDataset::from_bars(make_bars(
        "AAPL",
        &[(2, 100.0), (3, 104.0), (4, 98.0), (5, 103.0)],
    ));
    let mut config = base_config(&["AAPL"]);
    config.strategy.time_based_exit = Some(2);
    config.trading_execution.commission_type = CommissionType::PerShare;
    config.trading_execution.commission_amount = 0.05;

    let result = run_backtest(config, dataset, None).await;

    assert_eq!(result.trades.len(), 1);
    assert!(result.positions.is_empty());
    let realized: f64 = result.trades.iter().map(|t| t.pnl).sum();
    let last = result.equity_curve.last().unwrap();
    assert_relative_eq!(last.value, 100_000.0 + realized, epsilon = 0.01);
}

// =============================================================================
// End-of-Run Exits
// =============================================================================

/// Hold-until-end is not an open-ended hold: the position closes at the
/// ticker's final bar, so the run always ends with a populated trade ledger.
#[tokio::test]
async fn test_hold_until_end_produces_closed_trade() {
    let dataset = MarketDataset::from_bars(make_bars(
        "AAPL",
        &[(2, 100.0), (3, 104.0), (4, 108.0)],
    ));
    let config = base_config(&["AAPL"]);

    let result = run_backtest(config, dataset, None).await;

    assert!(result.positions.is_empty());
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.exit_date, "2024-01-04");
    assert_relative_eq!(trade.exit_price, 108.0);
    assert_eq!(trade.exit_reason, "strategy_signal");
    // One winning trade drives the summary statistics
    assert_eq!(result.summary.total_trades, 1);
    assert_relative_eq!(result.summary.win_rate, 100.0);
    assert_relative_eq!(result.summary.avg_win, 800.0, epsilon = 0.01);
}

// =============================================================================
// Risk Limits
// =============================================================================

/// A 20% order against a 10% single-asset cap is rejected outright; the
/// engine does not shrink orders to fit concentration limits.
#[tokio::test]
async fn test_single_asset_limit_rejects_oversized_entry() {
    let dataset = MarketDataset::from_bars(make_bars(
        "AAPL",
        &[(2, 100.0), (3, 101.0), (4, 102.0)],
    ));
    let mut config = base_config(&["AAPL"]);
    config.strategy.fixed_dollar_amount = Some(20_000.0);
    config.portfolio_risk.max_single_asset_percent = Some(10.0);

    let result = run_backtest(config, dataset, None).await;

    assert_eq!(result.status, "success");
    assert!(result.trades.is_empty());
    assert!(result.positions.is_empty());
    for point in &result.equity_curve {
        assert_relative_eq!(point.value, 100_000.0, epsilon = 0.01);
    }
}

// =============================================================================
// Multi-Asset Ranking
// =============================================================================

/// With three simultaneous candidates and two slots, candidates are taken
/// in sorted ticker order and the rest are dropped.
#[tokio::test]
async fn test_entry_ranking_truncates_to_open_slots() {
    let mut bars = make_bars("AAA", &[(2, 10.0), (3, 10.0), (4, 10.0)]);
    bars.extend(make_bars("BBB", &[(2, 10.0), (3, 10.0), (4, 10.0)]));
    bars.extend(make_bars("CCC", &[(2, 10.0), (3, 10.0), (4, 10.0)]));
    let dataset = MarketDataset::from_bars(bars);

    let mut config = base_config(&["AAA", "BBB", "CCC"]);
    config.strategy.entry_logic = Some("buy immediately".to_string());
    config.strategy.exit_logic = Some("never exit".to_string());
    config.strategy.fixed_dollar_amount = Some(1_000.0);
    config.strategy.max_positions = 2;

    let result = run_backtest(config, dataset, None).await;

    let held: Vec<&str> = result.positions.iter().map(|p| p.ticker.as_str()).collect();
    assert_eq!(held, vec!["AAA", "BBB"]);
}

// =============================================================================
// Missing Data Handling
// =============================================================================

/// Forward fill carries the last seen close through a gap, so the gap bar
/// marks the position at the stale price exactly.
#[tokio::test]
async fn test_forward_fill_marks_at_stale_close() {
    let mut bars = make_bars("AAA", &[(2, 100.0), (3, 102.0), (4, 104.0)]);
    // BBB has no bar on Jan 3
    bars.extend(make_bars("BBB", &[(2, 50.0), (4, 52.0)]));
    let mut dataset = MarketDataset::from_bars(bars);
    dataset.handle_missing_data(equity_backtester::config::MissingDataPolicy::ForwardFill);

    let mut config = base_config(&["AAA", "BBB"]);
    config.strategy.exit_logic = Some("never exit".to_string());
    let result = run_backtest(config, dataset, None).await;

    // $10k each: 100 shares of AAA at 100, 200 shares of BBB at 50
    assert_eq!(result.positions.len(), 2);
    // Jan 3: cash 80k + 100 * 102 + 200 * 50 (filled)
    assert_relative_eq!(result.equity_curve[1].value, 100_200.0, epsilon = 0.01);
    // Jan 4: cash 80k + 100 * 104 + 200 * 52
    assert_relative_eq!(result.equity_curve[2].value, 100_800.0, epsilon = 0.01);
}

// =============================================================================
// Benchmark Comparison
// =============================================================================

/// A portfolio that never trades has zero returns, so beta against any
/// moving benchmark is zero and alpha collapses to minus the risk-free rate.
#[tokio::test]
async fn test_flat_portfolio_has_zero_beta() {
    let dataset = MarketDataset::from_bars(make_bars(
        "AAPL",
        &[(2, 100.0), (3, 101.0), (4, 99.0), (5, 102.0)],
    ));
    let benchmark = vec![
        (day(2), 400.0),
        (day(3), 404.0),
        (day(4), 398.0),
        (day(5), 406.0),
    ];
    let mut config = base_config(&["AAPL"]);
    config.strategy.entry_logic = None;

    let result = run_backtest(config, dataset, Some(benchmark)).await;

    let comparison = result.benchmark_comparison.expect("comparison present");
    assert_relative_eq!(comparison.beta, 0.0, epsilon = 1e-9);
    assert_relative_eq!(comparison.alpha, -2.0, epsilon = 1e-6);
    assert!(comparison.tracking_error > 0.0);
}

// =============================================================================
// Failure Handling
// =============================================================================

/// No data at all is the one fatal condition, and it still produces a
/// structured result rather than an error or panic.
#[tokio::test]
async fn test_no_data_yields_failed_result() {
    let config = base_config(&["AAPL"]);
    let result = run_backtest(config, MarketDataset::from_bars(Vec::new()), None).await;

    assert_eq!(result.status, "failed");
    assert!(result
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("No market data"));
    assert!(result.trades.is_empty());
    assert!(result.equity_curve.is_empty());
}

// =============================================================================
// Result Serialization
// =============================================================================

/// Running the same configuration over the same data twice produces the
/// same serialized result record.
#[tokio::test]
async fn test_repeated_runs_are_deterministic() {
    let make_dataset = || {
        MarketDataset::from_bars(make_bars(
            "AAPL",
            &[(2, 100.0), (3, 103.0), (4, 99.0), (5, 105.0), (8, 107.0)],
        ))
    };
    let mut config = base_config(&["AAPL"]);
    config.strategy.time_based_exit = Some(2);
    config.trading_execution.commission_amount = 1.0;

    let first = run_backtest(config.clone(), make_dataset(), None).await;
    let second = run_backtest(config, make_dataset(), None).await;

    let first_json = serde_json::to_string(&first).unwrap();
    let second_json = serde_json::to_string(&second).unwrap();
    assert_eq!(first_json, second_json);
}
