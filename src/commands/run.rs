//! Run command implementation

use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use equity_backtester::backtest::{fetch_and_prepare, BacktestResult, Backtester};
use equity_backtester::config::Credentials;
use equity_backtester::data::{AlphaVantageClient, CsvDataProvider, MarketDataProvider};
use equity_backtester::oracle::OracleClient;
use equity_backtester::strategy::StrategyEngine;
use equity_backtester::Config;
use itertools::Itertools;
use std::sync::Arc;
use tracing::{error, info, warn};

pub async fn run(
    config_path: String,
    capital_override: Option<f64>,
    start_override: Option<String>,
    end_override: Option<String>,
    data_dir: Option<String>,
    output: Option<String>,
) -> Result<()> {
    dotenv::dotenv().ok();

    // Load configuration
    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    // Apply overrides
    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: ${:.2}", capital);
        config.portfolio_risk.initial_capital = capital;
    }

    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.market_data.start_date = Some(parse_date(&start)?);
    }

    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.market_data.end_date = Some(parse_date(&end)?);
    }

    config.validate()?;
    info!(
        "Universe: {}",
        config.market_data.tickers.iter().join(", ")
    );

    let credentials = Credentials::from_env();
    let oracle_client = build_oracle_client(&config, &credentials);
    let strategy =
        StrategyEngine::from_config(&config.strategy, &config.portfolio_risk, oracle_client);

    info!("Running backtest...");
    let result = match data_dir {
        Some(dir) => {
            info!("Reading bars from CSV directory: {}", dir);
            execute(&CsvDataProvider::new(dir), config, strategy).await
        }
        None => {
            let api_key = credentials.market_data_api_key.ok_or_else(|| {
                anyhow!("MARKET_DATA_API_KEY is not set; pass --data-dir to run offline")
            })?;
            execute(&AlphaVantageClient::new(api_key), config, strategy).await
        }
    };

    print_results(&result);

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&result)?;
        std::fs::write(&path, json)?;
        info!("Result written to: {}", path);
    }

    info!("Backtest completed");
    Ok(())
}

/// Run end to end against one provider. Data-level failures become a
/// structured failed result rather than an error return.
async fn execute<P: MarketDataProvider>(
    provider: &P,
    config: Config,
    strategy: StrategyEngine,
) -> BacktestResult {
    match fetch_and_prepare(provider, &config).await {
        Ok((dataset, actions, benchmark)) => {
            Backtester::new(config, dataset, actions, benchmark, strategy)
                .run()
                .await
        }
        Err(e) => {
            error!(error = %e, "data preparation failed");
            BacktestResult::failed(e.to_string())
        }
    }
}

fn build_oracle_client(config: &Config, credentials: &Credentials) -> Option<Arc<OracleClient>> {
    let wants_oracle = config.strategy.entry_oracle_slug.is_some()
        || config.strategy.exit_oracle_slug.is_some();
    if !wants_oracle {
        return None;
    }
    match (&credentials.oracle_api_key, &credentials.oracle_base_url) {
        (Some(key), Some(base_url)) => Some(Arc::new(OracleClient::new(
            base_url.clone(),
            key.clone(),
        ))),
        _ => {
            warn!(
                "Oracle slug configured but ORACLE_API_KEY/ORACLE_BASE_URL are not set; \
                 falling back to pattern signals"
            );
            None
        }
    }
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| anyhow!("invalid date '{}': {}", text, e))
}

fn print_results(result: &BacktestResult) {
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));

    if result.status == "failed" {
        println!("Status:             failed");
        if let Some(error) = &result.error {
            println!("Error:              {}", error);
        }
        println!("{}", "=".repeat(60));
        return;
    }

    let summary = &result.summary;
    println!("Total Return:       {:.2}%", summary.total_return);
    println!("CAGR:               {:.2}%", summary.cagr);
    println!("Volatility:         {:.2}%", summary.volatility);
    println!("Sharpe Ratio:       {:.2}", summary.sharpe_ratio);
    println!("Sortino Ratio:      {:.2}", summary.sortino_ratio);
    println!("Calmar Ratio:       {:.2}", summary.calmar_ratio);
    println!("Max Drawdown:       {:.2}%", summary.max_drawdown);
    println!("Drawdown Duration:  {} bars", summary.max_drawdown_duration);
    println!("Win Rate:           {:.2}%", summary.win_rate);
    println!("Profit Factor:      {:.2}", summary.profit_factor);
    println!("Total Trades:       {}", summary.total_trades);
    println!("Winning Trades:     {}", summary.winning_trades);
    println!("Losing Trades:      {}", summary.losing_trades);
    println!("Average Win:        ${:.2}", summary.avg_win);
    println!("Average Loss:       ${:.2}", summary.avg_loss);
    println!("Largest Win:        ${:.2}", summary.largest_win);
    println!("Largest Loss:       ${:.2}", summary.largest_loss);

    if let Some(benchmark) = &result.benchmark_comparison {
        println!("{}", "-".repeat(60));
        println!("Alpha:              {:.2}%", benchmark.alpha);
        println!("Beta:               {:.2}", benchmark.beta);
        println!("Tracking Error:     {:.2}%", benchmark.tracking_error);
        println!("Information Ratio:  {:.2}", benchmark.information_ratio);
    }

    if !result.positions.is_empty() {
        println!("{}", "-".repeat(60));
        println!("Open positions at end of run:");
        for position in &result.positions {
            println!(
                "  {:<8} {:>10.0} shares @ ${:<10.2} P&L ${:.2}",
                position.ticker, position.shares, position.entry_price, position.pnl
            );
        }
    }

    println!("{}", "=".repeat(60));
}
