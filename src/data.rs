//! Market data: the time-and-ticker indexed dataset, missing-data handling,
//! corporate actions, CSV ingestion, and the remote provider client

use crate::config::{DataFrequency, MissingDataPolicy};
use crate::types::{Bar, Ticker};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Corporate actions
// ============================================================================

#[derive(Debug, Clone)]
pub struct Dividend {
    pub ticker: Ticker,
    pub ex_date: NaiveDate,
    pub amount: f64,
}

#[derive(Debug, Clone)]
pub struct Split {
    pub ticker: Ticker,
    pub date: NaiveDate,
    /// New shares per old share, e.g. 2.0 for a 2:1 split
    pub ratio: f64,
}

#[derive(Debug, Clone)]
pub struct Delisting {
    pub ticker: Ticker,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Default)]
pub struct CorporateActions {
    pub dividends: Vec<Dividend>,
    pub splits: Vec<Split>,
    pub delistings: Vec<Delisting>,
}

/// Parse a split ratio string like "2:1" or "3:2" into new-per-old shares
pub fn parse_split_ratio(ratio: &str) -> Option<f64> {
    let (new, old) = ratio.split_once(':')?;
    let new: f64 = new.trim().parse().ok()?;
    let old: f64 = old.trim().parse().ok()?;
    if old <= 0.0 || new <= 0.0 {
        return None;
    }
    Some(new / old)
}

// ============================================================================
// Market dataset
// ============================================================================

/// Immutable (after preparation) time-and-ticker indexed table of bars
///
/// Bars are stored sparsely; the timestamp axis is the union across tickers,
/// and the missing-data policy decides what a ticker without a bar at some
/// timestamp looks like to the engine.
#[derive(Debug, Clone, Default)]
pub struct MarketDataset {
    timestamps: Vec<DateTime<Utc>>,
    tickers: Vec<Ticker>,
    bars: HashMap<(DateTime<Utc>, Ticker), Bar>,
}

impl MarketDataset {
    pub fn from_bars(bars: Vec<Bar>) -> Self {
        let mut timestamps = BTreeSet::new();
        let mut tickers = BTreeSet::new();
        let mut map = HashMap::with_capacity(bars.len());
        for bar in bars {
            timestamps.insert(bar.timestamp);
            tickers.insert(bar.ticker.clone());
            map.insert((bar.timestamp, bar.ticker.clone()), bar);
        }
        Self {
            timestamps: timestamps.into_iter().collect(),
            tickers: tickers.into_iter().collect(),
            bars: map,
        }
    }

    /// Sorted union of all bar timestamps
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Sorted list of all tickers present
    pub fn tickers(&self) -> &[Ticker] {
        &self.tickers
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn bar(&self, timestamp: DateTime<Utc>, ticker: &Ticker) -> Option<&Bar> {
        self.bars.get(&(timestamp, ticker.clone()))
    }

    pub fn has_bar(&self, timestamp: DateTime<Utc>, ticker: &Ticker) -> bool {
        self.bars.contains_key(&(timestamp, ticker.clone()))
    }

    pub fn first_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamps.first().copied()
    }

    /// Fill gaps on the ticker axis per the configured policy
    ///
    /// `Skip` leaves the dataset sparse. `ForwardFill` clones the last seen
    /// bar into each gap. `Interpolate` fills interior gaps linearly and
    /// carries the last bar across trailing gaps; leading gaps stay empty
    /// under both fill policies.
    pub fn handle_missing_data(&mut self, policy: MissingDataPolicy) {
        if policy == MissingDataPolicy::Skip {
            return;
        }
        let mut filled = 0usize;
        for ticker in self.tickers.clone() {
            let mut gap_start: Option<usize> = None;
            let mut last_seen: Option<Bar> = None;
            for i in 0..self.timestamps.len() {
                let ts = self.timestamps[i];
                let existing = self.bars.get(&(ts, ticker.clone())).cloned();
                if let Some(bar) = existing {
                    if let (Some(start), Some(prev)) = (gap_start, last_seen.as_ref()) {
                        let next = bar.clone();
                        for j in start..i {
                            let gap_ts = self.timestamps[j];
                            let gap_bar = match policy {
                                MissingDataPolicy::ForwardFill => {
                                    carried_bar(prev, gap_ts)
                                }
                                MissingDataPolicy::Interpolate => interpolated_bar(
                                    prev,
                                    &next,
                                    gap_ts,
                                    (j - start + 1) as f64,
                                    (i - start + 1) as f64,
                                ),
                                MissingDataPolicy::Skip => unreachable!(),
                            };
                            self.bars.insert((gap_ts, ticker.clone()), gap_bar);
                            filled += 1;
                        }
                    }
                    gap_start = None;
                    last_seen = Some(bar);
                } else if gap_start.is_none() {
                    gap_start = Some(i);
                }
            }
            // Trailing gap: no later bar to interpolate toward, carry forward
            if let (Some(start), Some(prev)) = (gap_start, last_seen.as_ref()) {
                for j in start..self.timestamps.len() {
                    let gap_ts = self.timestamps[j];
                    self.bars.insert((gap_ts, ticker.clone()), carried_bar(prev, gap_ts));
                    filled += 1;
                }
            }
        }
        if filled > 0 {
            debug!(filled, policy = ?policy, "filled missing bars");
        }
    }

    /// Rescale prices before each split date so the series is continuous
    pub fn apply_splits(&mut self, splits: &[Split]) {
        for split in splits {
            if split.ratio <= 0.0 || (split.ratio - 1.0).abs() < f64::EPSILON {
                continue;
            }
            let cutoff = split.date;
            let mut adjusted = 0usize;
            for ((ts, ticker), bar) in self.bars.iter_mut() {
                if *ticker == split.ticker && ts.date_naive() < cutoff {
                    bar.open /= split.ratio;
                    bar.high /= split.ratio;
                    bar.low /= split.ratio;
                    bar.close /= split.ratio;
                    bar.volume *= split.ratio;
                    if let Some(adj) = bar.adjusted_close.as_mut() {
                        *adj /= split.ratio;
                    }
                    adjusted += 1;
                }
            }
            debug!(ticker = %split.ticker, ratio = split.ratio, adjusted, "applied split adjustment");
        }
    }

    /// Drop all bars of `ticker` on or after `date` (delisting cleanup)
    pub fn remove_from(&mut self, ticker: &Ticker, date: NaiveDate) {
        self.bars
            .retain(|(ts, t), _| !(t == ticker && ts.date_naive() >= date));
    }
}

fn carried_bar(prev: &Bar, timestamp: DateTime<Utc>) -> Bar {
    let mut bar = prev.clone();
    bar.timestamp = timestamp;
    bar
}

fn interpolated_bar(prev: &Bar, next: &Bar, timestamp: DateTime<Utc>, step: f64, span: f64) -> Bar {
    let t = step / span;
    let lerp = |a: f64, b: f64| a + (b - a) * t;
    Bar {
        timestamp,
        ticker: prev.ticker.clone(),
        open: lerp(prev.open, next.open),
        high: lerp(prev.high, next.high),
        low: lerp(prev.low, next.low),
        close: lerp(prev.close, next.close),
        volume: lerp(prev.volume, next.volume),
        adjusted_close: match (prev.adjusted_close, next.adjusted_close) {
            (Some(a), Some(b)) => Some(lerp(a, b)),
            _ => None,
        },
    }
}

// ============================================================================
// Provider interface
// ============================================================================

/// One dataset request, issued once per run
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub tickers: Vec<Ticker>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub frequency: DataFrequency,
    pub include_dividends: bool,
    pub include_splits: bool,
    pub include_delistings: bool,
}

/// Historical market data source
pub trait MarketDataProvider {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl std::future::Future<Output = Result<(Vec<Bar>, CorporateActions)>> + Send;
}

// ============================================================================
// Alpha Vantage client
// ============================================================================

/// Free tier allows 5 requests per minute
const RATE_LIMIT_PAUSE: Duration = Duration::from_secs(12);

/// Daily/weekly/monthly adjusted time-series client
pub struct AlphaVantageClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AlphaVantageClient {
    pub const DEFAULT_BASE_URL: &'static str = "https://www.alphavantage.co";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(Self::DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn function_and_series_key(frequency: DataFrequency) -> (&'static str, &'static str) {
        match frequency {
            DataFrequency::Daily => ("TIME_SERIES_DAILY_ADJUSTED", "Time Series (Daily)"),
            DataFrequency::Weekly => (
                "TIME_SERIES_WEEKLY_ADJUSTED",
                "Weekly Adjusted Time Series",
            ),
            DataFrequency::Monthly => (
                "TIME_SERIES_MONTHLY_ADJUSTED",
                "Monthly Adjusted Time Series",
            ),
        }
    }

    /// Fetch the full series for one ticker and parse it into bars plus any
    /// dividend/split records embedded in the adjusted series
    async fn fetch_ticker(
        &self,
        ticker: &Ticker,
        frequency: DataFrequency,
    ) -> Result<(Vec<Bar>, Vec<Dividend>, Vec<Split>)> {
        let (function, series_key) = Self::function_and_series_key(frequency);
        let url = format!(
            "{}/query?function={}&symbol={}&outputsize=full&apikey={}",
            self.base_url, function, ticker, self.api_key
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("market data request failed for {ticker}"))?;
        let body: serde_json::Value = response
            .json()
            .await
            .with_context(|| format!("invalid market data response for {ticker}"))?;

        if let Some(note) = body.get("Note").and_then(|v| v.as_str()) {
            warn!(%ticker, note, "provider throttled request");
        }
        let series = match body.get(series_key).and_then(|v| v.as_object()) {
            Some(series) => series,
            None => {
                warn!(%ticker, "no time series in provider response");
                return Ok((Vec::new(), Vec::new(), Vec::new()));
            }
        };

        let mut bars = Vec::with_capacity(series.len());
        let mut dividends = Vec::new();
        let mut splits = Vec::new();
        for (date_str, fields) in series {
            let date = match NaiveDate::parse_from_str(date_str, "%Y-%m-%d") {
                Ok(date) => date,
                Err(_) => {
                    warn!(%ticker, date = %date_str, "unparseable date in series, skipping");
                    continue;
                }
            };
            let field = |key: &str| -> Option<f64> {
                fields.get(key)?.as_str()?.parse::<f64>().ok()
            };
            let (open, high, low, close) = match (
                field("1. open"),
                field("2. high"),
                field("3. low"),
                field("4. close"),
            ) {
                (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
                _ => {
                    warn!(%ticker, date = %date_str, "incomplete OHLC row, skipping");
                    continue;
                }
            };
            // Adjusted series moves volume to field 6
            let volume = field("6. volume").or_else(|| field("5. volume")).unwrap_or(0.0);
            let timestamp = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default());

            bars.push(Bar {
                timestamp,
                ticker: ticker.clone(),
                open,
                high,
                low,
                close,
                volume,
                adjusted_close: field("5. adjusted close"),
            });

            if let Some(amount) = field("7. dividend amount") {
                if amount > 0.0 {
                    dividends.push(Dividend {
                        ticker: ticker.clone(),
                        ex_date: date,
                        amount,
                    });
                }
            }
            if let Some(coefficient) = field("8. split coefficient") {
                if (coefficient - 1.0).abs() > f64::EPSILON && coefficient > 0.0 {
                    splits.push(Split {
                        ticker: ticker.clone(),
                        date,
                        ratio: coefficient,
                    });
                }
            }
        }
        bars.sort_by_key(|b| b.timestamp);
        Ok((bars, dividends, splits))
    }
}

impl MarketDataProvider for AlphaVantageClient {
    async fn fetch(&self, request: &FetchRequest) -> Result<(Vec<Bar>, CorporateActions)> {
        let mut all_bars = Vec::new();
        let mut actions = CorporateActions::default();
        let mut fetched_any = false;

        for (i, ticker) in request.tickers.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(RATE_LIMIT_PAUSE).await;
            }
            let (mut bars, dividends, splits) =
                match self.fetch_ticker(ticker, request.frequency).await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(%ticker, error = %e, "fetch failed, skipping ticker");
                        continue;
                    }
                };
            bars.retain(|bar| in_range(bar.timestamp.date_naive(), request.start, request.end));
            if bars.is_empty() {
                warn!(%ticker, "no bars in requested range");
                continue;
            }
            info!(%ticker, bars = bars.len(), "fetched market data");
            fetched_any = true;
            all_bars.extend(bars);
            if request.include_dividends {
                actions.dividends.extend(
                    dividends
                        .into_iter()
                        .filter(|d| in_range(d.ex_date, request.start, request.end)),
                );
            }
            if request.include_splits {
                actions.splits.extend(
                    splits
                        .into_iter()
                        .filter(|s| in_range(s.date, request.start, request.end)),
                );
            }
        }

        if !fetched_any {
            bail!("No market data could be fetched for any ticker");
        }
        Ok((all_bars, actions))
    }
}

fn in_range(date: NaiveDate, start: Option<NaiveDate>, end: Option<NaiveDate>) -> bool {
    if let Some(start) = start {
        if date < start {
            return false;
        }
    }
    if let Some(end) = end {
        if date > end {
            return false;
        }
    }
    true
}

// ============================================================================
// CSV ingestion
// ============================================================================

#[derive(Debug, Deserialize)]
struct CsvBarRecord {
    date: NaiveDate,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    #[serde(default)]
    adjusted_close: Option<f64>,
}

/// Read bars for one ticker from CSV with a `date,open,high,low,close,volume`
/// header (optional `adjusted_close` column)
pub fn read_bars_csv<R: Read>(reader: R, ticker: &Ticker) -> Result<Vec<Bar>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut bars = Vec::new();
    for record in csv_reader.deserialize() {
        let record: CsvBarRecord = record.context("malformed CSV bar record")?;
        let timestamp =
            Utc.from_utc_datetime(&record.date.and_hms_opt(0, 0, 0).unwrap_or_default());
        bars.push(Bar {
            timestamp,
            ticker: ticker.clone(),
            open: record.open,
            high: record.high,
            low: record.low,
            close: record.close,
            volume: record.volume,
            adjusted_close: record.adjusted_close,
        });
    }
    bars.sort_by_key(|b| b.timestamp);
    Ok(bars)
}

/// Offline provider reading `<dir>/<TICKER>.csv` per ticker
pub struct CsvDataProvider {
    dir: std::path::PathBuf,
}

impl CsvDataProvider {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl MarketDataProvider for CsvDataProvider {
    async fn fetch(&self, request: &FetchRequest) -> Result<(Vec<Bar>, CorporateActions)> {
        let mut all_bars = Vec::new();
        for ticker in &request.tickers {
            let path = self.dir.join(format!("{ticker}.csv"));
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    warn!(%ticker, path = %path.display(), error = %e, "missing CSV, skipping ticker");
                    continue;
                }
            };
            let mut bars = read_bars_csv(file, ticker)
                .with_context(|| format!("failed to read {}", path.display()))?;
            bars.retain(|bar| in_range(bar.timestamp.date_naive(), request.start, request.end));
            all_bars.extend(bars);
        }
        if all_bars.is_empty() {
            bail!("No market data could be fetched for any ticker");
        }
        Ok((all_bars, CorporateActions::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn bar(ticker: &str, d: u32, close: f64) -> Bar {
        Bar {
            timestamp: day(d),
            ticker: Ticker::new(ticker),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000.0,
            adjusted_close: None,
        }
    }

    #[test]
    fn test_dataset_axes_are_sorted_unions() {
        let ds = MarketDataset::from_bars(vec![
            bar("MSFT", 3, 300.0),
            bar("AAPL", 2, 100.0),
            bar("AAPL", 3, 101.0),
        ]);
        assert_eq!(ds.timestamps(), &[day(2), day(3)]);
        assert_eq!(
            ds.tickers(),
            &[Ticker::new("AAPL"), Ticker::new("MSFT")]
        );
        assert!(!ds.has_bar(day(2), &Ticker::new("MSFT")));
    }

    #[test]
    fn test_forward_fill_carries_last_bar_exactly() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 2, 100.0),
            bar("AAPL", 4, 104.0),
            bar("MSFT", 2, 300.0),
            bar("MSFT", 3, 301.0),
            bar("MSFT", 4, 302.0),
        ]);
        ds.handle_missing_data(MissingDataPolicy::ForwardFill);
        let filled = ds.bar(day(3), &Ticker::new("AAPL")).unwrap();
        assert_relative_eq!(filled.close, 100.0);
        assert_relative_eq!(filled.high, 101.0);
        assert_relative_eq!(filled.low, 98.0);
        assert_relative_eq!(filled.volume, 1000.0);
        assert_eq!(filled.timestamp, day(3));
    }

    #[test]
    fn test_interpolate_fills_interior_linearly() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 2, 100.0),
            bar("AAPL", 5, 106.0),
            bar("MSFT", 2, 300.0),
            bar("MSFT", 3, 300.0),
            bar("MSFT", 4, 300.0),
            bar("MSFT", 5, 300.0),
        ]);
        ds.handle_missing_data(MissingDataPolicy::Interpolate);
        let b3 = ds.bar(day(3), &Ticker::new("AAPL")).unwrap();
        let b4 = ds.bar(day(4), &Ticker::new("AAPL")).unwrap();
        assert_relative_eq!(b3.close, 102.0);
        assert_relative_eq!(b4.close, 104.0);
    }

    #[test]
    fn test_skip_leaves_dataset_sparse() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 2, 100.0),
            bar("AAPL", 4, 104.0),
            bar("MSFT", 3, 300.0),
        ]);
        ds.handle_missing_data(MissingDataPolicy::Skip);
        assert!(!ds.has_bar(day(3), &Ticker::new("AAPL")));
    }

    #[test]
    fn test_leading_gap_stays_empty() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 4, 104.0),
            bar("MSFT", 2, 300.0),
            bar("MSFT", 3, 301.0),
            bar("MSFT", 4, 302.0),
        ]);
        ds.handle_missing_data(MissingDataPolicy::ForwardFill);
        assert!(!ds.has_bar(day(2), &Ticker::new("AAPL")));
        assert!(!ds.has_bar(day(3), &Ticker::new("AAPL")));
    }

    #[test]
    fn test_parse_split_ratio() {
        assert_relative_eq!(parse_split_ratio("2:1").unwrap(), 2.0);
        assert_relative_eq!(parse_split_ratio("3:2").unwrap(), 1.5);
        assert!(parse_split_ratio("bogus").is_none());
        assert!(parse_split_ratio("1:0").is_none());
    }

    #[test]
    fn test_split_adjustment_rescales_history() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 2, 200.0),
            bar("AAPL", 3, 100.0),
        ]);
        ds.apply_splits(&[Split {
            ticker: Ticker::new("AAPL"),
            date: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            ratio: 2.0,
        }]);
        let before = ds.bar(day(2), &Ticker::new("AAPL")).unwrap();
        let after = ds.bar(day(3), &Ticker::new("AAPL")).unwrap();
        assert_relative_eq!(before.close, 100.0);
        assert_relative_eq!(before.volume, 2000.0);
        assert_relative_eq!(after.close, 100.0);
    }

    #[test]
    fn test_read_bars_csv() {
        let csv = "date,open,high,low,close,volume\n\
                   2024-01-02,99.0,101.0,98.0,100.0,1000\n\
                   2024-01-03,100.0,103.0,99.5,102.0,1500\n";
        let bars = read_bars_csv(csv.as_bytes(), &Ticker::new("AAPL")).unwrap();
        assert_eq!(bars.len(), 2);
        assert_relative_eq!(bars[0].close, 100.0);
        assert_relative_eq!(bars[1].volume, 1500.0);
        assert_eq!(bars[0].timestamp, day(2));
    }

    #[test]
    fn test_remove_from_drops_delisted_tail() {
        let mut ds = MarketDataset::from_bars(vec![
            bar("AAPL", 2, 100.0),
            bar("AAPL", 3, 101.0),
            bar("AAPL", 4, 102.0),
        ]);
        ds.remove_from(
            &Ticker::new("AAPL"),
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
        );
        assert!(ds.has_bar(day(2), &Ticker::new("AAPL")));
        assert!(!ds.has_bar(day(3), &Ticker::new("AAPL")));
        assert!(!ds.has_bar(day(4), &Ticker::new("AAPL")));
    }
}
