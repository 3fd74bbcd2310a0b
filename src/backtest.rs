//! Backtest loop: drives the portfolio and strategy engine bar by bar and
//! assembles the result record
//!
//! Per-bar phase order is fixed and auditable: trading-day filter, peak
//! resets, pending-order settlement, mark-to-market, dividend pass, borrow
//! cost, drawdown gating, exits, entries. Changing this order changes
//! results, so it lives in exactly one place (`run`).

use crate::config::{Config, EntryTiming, MtmFrequency};
use crate::costs::{borrow_cost, execution_price, mtm_price, CostModel};
use crate::data::{CorporateActions, Dividend, FetchRequest, MarketDataProvider, MarketDataset};
use crate::performance::{self, BenchmarkComparison, PerformanceReport, DEFAULT_RISK_FREE_RATE};
use crate::portfolio::{Portfolio, RiskLimits};
use crate::strategy::StrategyEngine;
use crate::types::{ExitReason, OracleSignalRecord, PendingOrder, Ticker};
use anyhow::Result;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

// ============================================================================
// Result record
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EquityPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    #[serde(rename = "Ticker")]
    pub ticker: Ticker,
    #[serde(rename = "Entry Date")]
    pub entry_date: String,
    #[serde(rename = "Entry Price")]
    pub entry_price: f64,
    #[serde(rename = "Exit Date")]
    pub exit_date: String,
    #[serde(rename = "Exit Price")]
    pub exit_price: f64,
    #[serde(rename = "Shares")]
    pub shares: f64,
    #[serde(rename = "P&L")]
    pub pnl: f64,
    #[serde(rename = "P&L %")]
    pub pnl_percent: f64,
    #[serde(rename = "Holding Period")]
    pub holding_period: i64,
    #[serde(rename = "Exit Reason")]
    pub exit_reason: String,
}

/// Open position at the end of the run
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    pub ticker: Ticker,
    pub shares: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub value: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub days_held: i64,
}

/// Structured outcome of a run; failures are results too, never panics
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub summary: PerformanceReport,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<TradeRow>,
    pub positions: Vec<PositionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_comparison: Option<BenchmarkComparison>,
    pub oracle_signals: Vec<OracleSignalRecord>,
}

impl BacktestResult {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            error: Some(message.into()),
            summary: PerformanceReport::default(),
            equity_curve: Vec::new(),
            trades: Vec::new(),
            positions: Vec::new(),
            benchmark_comparison: None,
            oracle_signals: Vec::new(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Data preparation
// ============================================================================

/// Fetch and prepare the dataset for one run: bars, corporate-action
/// adjustments, missing-data handling, and the optional benchmark curve
pub async fn fetch_and_prepare<P: MarketDataProvider>(
    provider: &P,
    config: &Config,
) -> Result<(MarketDataset, CorporateActions, Option<Vec<(DateTime<Utc>, f64)>>)> {
    let request = FetchRequest {
        tickers: config
            .market_data
            .tickers
            .iter()
            .map(|t| Ticker::new(t))
            .collect(),
        start: config.market_data.start_date,
        end: config.market_data.end_date,
        frequency: config.market_data.frequency,
        include_dividends: config.market_data.include_dividends,
        include_splits: config.market_data.include_splits,
        include_delistings: config.market_data.include_delistings,
    };
    let (bars, actions) = provider.fetch(&request).await?;
    let mut dataset = MarketDataset::from_bars(bars);
    dataset.apply_splits(&actions.splits);
    if config.rebalancing.drop_delisted {
        for delisting in &actions.delistings {
            dataset.remove_from(&delisting.ticker, delisting.date);
        }
    }
    dataset.handle_missing_data(config.trading_execution.handle_missing_data);

    let benchmark = match &config.market_data.benchmark {
        Some(symbol) => {
            let bench_request = FetchRequest {
                tickers: vec![Ticker::new(symbol)],
                include_dividends: false,
                include_splits: false,
                include_delistings: false,
                ..request
            };
            match provider.fetch(&bench_request).await {
                Ok((bars, _)) => {
                    let mut curve: Vec<(DateTime<Utc>, f64)> =
                        bars.iter().map(|b| (b.timestamp, b.close)).collect();
                    curve.sort_by_key(|(ts, _)| *ts);
                    Some(curve)
                }
                Err(e) => {
                    warn!(benchmark = %symbol, error = %e, "benchmark fetch failed, skipping comparison");
                    None
                }
            }
        }
        None => None,
    };

    Ok((dataset, actions, benchmark))
}

// ============================================================================
// Backtester
// ============================================================================

pub struct Backtester {
    config: Config,
    dataset: MarketDataset,
    dividends: Vec<Dividend>,
    benchmark_curve: Option<Vec<(DateTime<Utc>, f64)>>,
    portfolio: Portfolio,
    strategy: StrategyEngine,
    cost_model: CostModel,
    pending_orders: Vec<PendingOrder>,
}

impl Backtester {
    pub fn new(
        config: Config,
        dataset: MarketDataset,
        actions: CorporateActions,
        benchmark_curve: Option<Vec<(DateTime<Utc>, f64)>>,
        strategy: StrategyEngine,
    ) -> Self {
        let portfolio = Portfolio::new(
            config.portfolio_risk.initial_capital,
            RiskLimits::from(&config.portfolio_risk),
        );
        let cost_model = CostModel::from_config(&config.trading_execution);
        Self {
            config,
            dataset,
            dividends: actions.dividends,
            benchmark_curve,
            portfolio,
            strategy,
            cost_model,
            pending_orders: Vec::new(),
        }
    }

    /// Walk every timestamp in order and produce the result record
    ///
    /// Strictly sequential; the only awaits happen inside signal evaluation
    /// when the configured source is oracle-backed.
    pub async fn run(mut self) -> BacktestResult {
        if self.dataset.is_empty() {
            return BacktestResult::failed("No market data could be fetched for any ticker");
        }

        let timestamps = self.dataset.timestamps().to_vec();
        let allowed_weekdays = self.config.allowed_weekdays();
        let settlement_lag =
            self.config.trading_execution.entry_timing == EntryTiming::NextBarOpen;
        info!(
            bars = timestamps.len(),
            tickers = self.dataset.tickers().len(),
            "starting backtest"
        );

        let mut previous: Option<DateTime<Utc>> = None;
        for (bar_index, &timestamp) in timestamps.iter().enumerate() {
            if let Some(allowed) = &allowed_weekdays {
                if !allowed.contains(&timestamp.weekday()) {
                    continue;
                }
            }

            if let Some(prev) = previous {
                if prev.date_naive() != timestamp.date_naive() {
                    self.portfolio.reset_daily_peak();
                }
                if prev.date_naive().iso_week() != timestamp.date_naive().iso_week() {
                    self.portfolio.reset_weekly_peak();
                }
            }

            if settlement_lag {
                self.settle_pending_orders(timestamp).await;
            }

            if self.should_mark_to_market(timestamp, bar_index) {
                self.mark_to_market(timestamp);
            }

            if self.config.mtm.book_dividend_cashflows {
                self.process_dividends(timestamp);
            }

            if self.config.trading_execution.short_selling_allowed
                && self.config.trading_execution.borrow_cost > 0.0
            {
                self.accrue_borrow_costs();
            }

            self.portfolio.check_drawdown_limits();

            self.evaluate_exits(timestamp, settlement_lag).await;
            self.evaluate_entries(timestamp, settlement_lag).await;

            previous = Some(timestamp);
        }

        info!(
            trades = self.portfolio.closed_trades.len(),
            open_positions = self.portfolio.positions.len(),
            final_value = self.portfolio.portfolio_value,
            "backtest complete"
        );
        self.build_result()
    }

    fn should_mark_to_market(&self, timestamp: DateTime<Utc>, bar_index: usize) -> bool {
        match self.config.mtm.mtm_frequency {
            // Bars are daily, so both cadences mark every bar
            MtmFrequency::EveryBar | MtmFrequency::Daily => true,
            MtmFrequency::Weekly => timestamp.weekday() == chrono::Weekday::Fri,
            MtmFrequency::Monthly => timestamp.day() == 1 || bar_index == 0,
        }
    }

    /// Push mark prices into held positions and sample the equity curve
    fn mark_to_market(&mut self, timestamp: DateTime<Utc>) {
        let mut prices = HashMap::new();
        for ticker in self.dataset.tickers() {
            if let Some(bar) = self.dataset.bar(timestamp, ticker) {
                prices.insert(ticker.clone(), mtm_price(bar, self.config.mtm.mtm_price));
            }
        }
        self.portfolio.update_position_prices(&prices);
        self.portfolio.update_portfolio_value(timestamp);
    }

    /// Dividend cashflow pass: a declared capability that books nothing yet
    fn process_dividends(&mut self, timestamp: DateTime<Utc>) {
        let date = timestamp.date_naive();
        for dividend in &self.dividends {
            if dividend.ex_date == date && self.portfolio.positions.contains_key(&dividend.ticker)
            {
                debug!(
                    ticker = %dividend.ticker,
                    amount = dividend.amount,
                    "ex-dividend date for held position, no cashflow booked"
                );
            }
        }
    }

    fn accrue_borrow_costs(&mut self) {
        let rate = self.config.trading_execution.borrow_cost;
        let cost: f64 = self
            .portfolio
            .positions
            .values()
            .filter(|p| p.shares < 0.0)
            .map(|p| borrow_cost(p.current_value(), rate))
            .sum();
        if cost > 0.0 {
            self.portfolio.cash -= cost;
            debug!(cost, "accrued borrow cost on short positions");
        }
    }

    /// Drain the settlement queue against the current bar: exits first so
    /// freed capital is available to the queued entries, then clear
    async fn settle_pending_orders(&mut self, timestamp: DateTime<Utc>) {
        let orders = std::mem::take(&mut self.pending_orders);
        for order in &orders {
            if let PendingOrder::Exit { ticker, reason } = order {
                self.execute_exit(ticker.clone(), timestamp, *reason);
            }
        }
        for order in &orders {
            if let PendingOrder::Entry { ticker } = order {
                self.execute_entry(ticker.clone(), timestamp);
            }
        }
    }

    /// Run the exit chain over every held position
    async fn evaluate_exits(&mut self, timestamp: DateTime<Utc>, settlement_lag: bool) {
        let held: Vec<_> = self.portfolio.positions.values().cloned().collect();
        for position in held {
            let ctx = crate::signals::SignalContext {
                dataset: &self.dataset,
                ticker: &position.ticker,
                timestamp,
                end_date: self.config.market_data.end_date,
            };
            if let Some(reason) = self.strategy.check_exit(&position, &ctx).await {
                if settlement_lag {
                    self.pending_orders.push(PendingOrder::Exit {
                        ticker: position.ticker.clone(),
                        reason,
                    });
                } else {
                    self.execute_exit(position.ticker.clone(), timestamp, reason);
                }
            }
        }
    }

    /// Generate, rank, and place entries for the bar
    async fn evaluate_entries(&mut self, timestamp: DateTime<Utc>, settlement_lag: bool) {
        if self.portfolio.trading_halted {
            return;
        }
        let open_slots = self
            .strategy
            .max_positions
            .saturating_sub(self.portfolio.positions.len());
        if open_slots == 0 {
            return;
        }

        let eligible: Vec<Ticker> = self
            .strategy
            .filter_eligible_universe(&self.dataset, timestamp)
            .into_iter()
            .filter(|t| !self.portfolio.positions.contains_key(t))
            .collect();
        if eligible.is_empty() {
            return;
        }

        let candidates = self
            .strategy
            .generate_entry_signals(&self.dataset, timestamp, &eligible)
            .await;
        let selected = self.strategy.rank_signals(candidates, open_slots);
        for ticker in selected {
            if settlement_lag {
                self.pending_orders.push(PendingOrder::Entry { ticker });
            } else {
                self.execute_entry(ticker, timestamp);
            }
        }
    }

    fn execute_entry(&mut self, ticker: Ticker, timestamp: DateTime<Utc>) {
        let bar = match self.dataset.bar(timestamp, &ticker) {
            Some(bar) => bar,
            None => {
                warn!(%ticker, %timestamp, "no bar for entry, dropping order");
                return;
            }
        };
        let price = execution_price(bar, self.config.trading_execution.entry_timing);
        if price <= 0.0 || !price.is_finite() {
            warn!(%ticker, price, "invalid execution price, dropping entry");
            return;
        }

        let mut shares = self
            .strategy
            .calculate_position_size(price, self.portfolio.portfolio_value);
        if shares <= 0.0 {
            debug!(%ticker, "position size is zero, no trade");
            return;
        }

        let mut execution = self.cost_model.buy(shares, price);
        let buying_power = self.portfolio.buying_power();
        if execution.total > buying_power {
            // Shrink once to the largest whole share count that fits with fees
            shares = self.cost_model.affordable_shares(buying_power, price);
            if shares <= 0.0 {
                debug!(%ticker, buying_power, "cannot afford a single share, dropping entry");
                return;
            }
            execution = self.cost_model.buy(shares, price);
        }

        match self
            .portfolio
            .can_open_position(&ticker, execution.total, None)
        {
            Ok(()) => {
                self.portfolio.open_position(
                    ticker,
                    shares,
                    execution.price,
                    timestamp,
                    execution.total,
                );
            }
            Err(rejection) => {
                debug!(%ticker, %rejection, "entry rejected by risk gate");
            }
        }
    }

    fn execute_exit(&mut self, ticker: Ticker, timestamp: DateTime<Utc>, reason: ExitReason) {
        let bar = match self.dataset.bar(timestamp, &ticker) {
            Some(bar) => bar,
            None => {
                warn!(%ticker, %timestamp, "no bar for exit, dropping order");
                return;
            }
        };
        let price = execution_price(bar, self.config.trading_execution.entry_timing);
        if price <= 0.0 || !price.is_finite() {
            warn!(%ticker, price, "invalid execution price, dropping exit");
            return;
        }
        let shares = match self.portfolio.positions.get(&ticker) {
            Some(position) => position.shares,
            None => return,
        };
        let execution = self.cost_model.sell(shares, price);
        self.portfolio.close_position(
            &ticker,
            execution.price,
            timestamp,
            execution.total,
            execution.fees,
            reason,
        );
    }

    /// Assemble the structured result record from the finished state
    fn build_result(mut self) -> BacktestResult {
        let summary = performance::analyze(
            &self.portfolio.equity_curve,
            &self.portfolio.closed_trades,
            DEFAULT_RISK_FREE_RATE,
        );
        let benchmark_comparison = self.benchmark_curve.as_ref().map(|bench| {
            performance::benchmark_comparison(
                &self.portfolio.equity_curve,
                bench,
                DEFAULT_RISK_FREE_RATE,
            )
        });

        let equity_curve = self
            .portfolio
            .equity_curve
            .iter()
            .map(|(ts, value)| EquityPoint {
                date: ts.to_rfc3339(),
                value: round2(*value),
            })
            .collect();

        let trades = self
            .portfolio
            .closed_trades
            .iter()
            .map(|t| TradeRow {
                ticker: t.ticker.clone(),
                entry_date: t.entry_date.format("%Y-%m-%d").to_string(),
                entry_price: round2(t.entry_price),
                exit_date: t.exit_date.format("%Y-%m-%d").to_string(),
                exit_price: round2(t.exit_price),
                shares: t.shares,
                pnl: round2(t.pnl),
                pnl_percent: round2(t.pnl_percent),
                holding_period: t.holding_period_days,
                exit_reason: t.exit_reason.to_string(),
            })
            .collect();

        let end = self
            .portfolio
            .equity_curve
            .last()
            .map(|(ts, _)| *ts)
            .or_else(|| self.dataset.timestamps().last().copied());
        let positions = self
            .portfolio
            .positions
            .values()
            .map(|p| PositionSummary {
                ticker: p.ticker.clone(),
                shares: p.shares,
                entry_price: round2(p.entry_price),
                current_price: round2(p.current_price),
                value: round2(p.current_value()),
                pnl: round2(p.unrealized_pnl()),
                pnl_percent: if p.entry_price.abs() > f64::EPSILON {
                    round2((p.current_price - p.entry_price) / p.entry_price * 100.0)
                } else {
                    0.0
                },
                days_held: end.map(|ts| p.days_held(ts)).unwrap_or(0),
            })
            .collect();

        BacktestResult {
            status: "success".to_string(),
            error: None,
            summary,
            equity_curve,
            trades,
            positions,
            benchmark_comparison,
            oracle_signals: self.strategy.take_oracle_records(),
        }
    }
}
