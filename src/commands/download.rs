//! Download command implementation
//!
//! Fetches historical bars from the remote provider and writes one CSV per
//! ticker, in the layout the run command's `--data-dir` option reads back.

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use equity_backtester::config::{Credentials, DataFrequency};
use equity_backtester::data::{AlphaVantageClient, FetchRequest, MarketDataProvider};
use equity_backtester::types::{Bar, Ticker};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Serialize)]
struct CsvBarRow {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    adjusted_close: Option<f64>,
}

pub async fn run(
    tickers: String,
    start: Option<String>,
    end: Option<String>,
    output: String,
) -> Result<()> {
    dotenv::dotenv().ok();

    let tickers: Vec<Ticker> = tickers
        .split(',')
        .map(|t| Ticker::new(t.trim()))
        .filter(|t| !t.as_str().is_empty())
        .collect();
    if tickers.is_empty() {
        return Err(anyhow!("no tickers given"));
    }

    let credentials = Credentials::from_env();
    let api_key = credentials
        .market_data_api_key
        .ok_or_else(|| anyhow!("MARKET_DATA_API_KEY is not set"))?;
    let client = AlphaVantageClient::new(api_key);

    let request = FetchRequest {
        tickers: tickers.clone(),
        start: start.as_deref().map(parse_date).transpose()?,
        end: end.as_deref().map(parse_date).transpose()?,
        frequency: DataFrequency::Daily,
        include_dividends: false,
        include_splits: false,
        include_delistings: false,
    };

    info!("Downloading {} tickers", tickers.len());
    let (bars, _) = client.fetch(&request).await?;

    let mut by_ticker: BTreeMap<Ticker, Vec<Bar>> = BTreeMap::new();
    for bar in bars {
        by_ticker.entry(bar.ticker.clone()).or_default().push(bar);
    }

    std::fs::create_dir_all(&output)
        .with_context(|| format!("failed to create output directory {output}"))?;

    for ticker in &tickers {
        let Some(mut bars) = by_ticker.remove(ticker) else {
            warn!(%ticker, "no bars downloaded, skipping");
            continue;
        };
        bars.sort_by_key(|b| b.timestamp);
        let path = Path::new(&output).join(format!("{ticker}.csv"));
        write_bars_csv(&path, &bars)?;
        info!(%ticker, bars = bars.len(), path = %path.display(), "wrote CSV");
    }

    Ok(())
}

fn write_bars_csv(path: &Path, bars: &[Bar]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    for bar in bars {
        writer.serialize(CsvBarRow {
            date: bar.timestamp.date_naive(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            adjusted_close: bar.adjusted_close,
        })?;
    }
    writer.flush()?;
    Ok(())
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| anyhow!("invalid date '{}': {}", text, e))
}
