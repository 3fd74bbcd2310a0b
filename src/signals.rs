//! Signal translation and evaluation
//!
//! Free-text strategy descriptions translate into a small set of canned
//! patterns; an oracle slug routes evaluation through the remote oracle
//! instead. Both sides expose the same contract to the strategy engine:
//! entry signals answer (dataset, ticker, timestamp), exit signals
//! additionally see the open position.

use crate::data::MarketDataset;
use crate::oracle::{OracleAction, OracleClient};
use crate::portfolio::Position;
use crate::types::{OracleSignalRecord, SignalKind, Ticker};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a signal may inspect at one bar
pub struct SignalContext<'a> {
    pub dataset: &'a MarketDataset,
    pub ticker: &'a Ticker,
    pub timestamp: DateTime<Utc>,
    /// Configured end of the run; read by end-of-run exit patterns
    pub end_date: Option<NaiveDate>,
}

// ============================================================================
// Free-text translation
// ============================================================================

/// Canned entry patterns recognized by the translator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPattern {
    /// Fire only on the dataset's first bar
    FirstDay,
    /// Fire once, then again each time n calendar days have passed since the
    /// last firing for that ticker
    EveryNDays { n: usize },
    /// Fire once per ticker, ever
    Immediate,
    /// Fast SMA crossing above slow SMA; fallback for unrecognized text
    MovingAverageCross { fast: usize, slow: usize },
    /// Inert; entries never fire
    Never,
}

/// Canned exit patterns recognized by the translator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitPattern {
    /// Close at the ticker's final available bar
    HoldUntilEnd,
    /// Close after the position has been held n calendar days
    AfterNDays { n: i64 },
    /// Close only when the configured end date is reached
    Never,
}

/// Best-effort translation of a free-text entry description
///
/// Not a grammar; only a handful of phrasings are recognized.
pub fn translate_entry(text: &str) -> Option<EntryPattern> {
    let lower = text.trim().to_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().collect();

    if lower.contains("buy") && lower.contains("first day") {
        return Some(EntryPattern::FirstDay);
    }
    if let Some(pos) = tokens.iter().position(|t| *t == "every") {
        if tokens.first() == Some(&"buy") {
            if let Some(n) = tokens.get(pos + 1).and_then(|t| t.parse::<usize>().ok()) {
                if n > 0 && tokens[pos + 1..].iter().any(|t| t.starts_with("day")) {
                    return Some(EntryPattern::EveryNDays { n });
                }
            }
        }
    }
    if lower.contains("buy immediately") || lower.contains("buy now") {
        return Some(EntryPattern::Immediate);
    }
    None
}

/// Best-effort translation of a free-text exit description
pub fn translate_exit(text: &str) -> Option<ExitPattern> {
    let lower = text.trim().to_lowercase();
    let tokens: Vec<&str> = lower.split_whitespace().collect();

    if lower.contains("hold until") && lower.contains("end") {
        return Some(ExitPattern::HoldUntilEnd);
    }
    if (lower.starts_with("sell after") || lower.starts_with("exit after"))
        && tokens.len() >= 3
    {
        if let Some(n) = tokens.get(2).and_then(|t| t.parse::<i64>().ok()) {
            if n > 0 && tokens.get(3).map(|t| t.starts_with("day")).unwrap_or(false) {
                return Some(ExitPattern::AfterNDays { n });
            }
        }
    }
    if lower.contains("never exit") || lower.contains("hold forever") {
        return Some(ExitPattern::Never);
    }
    None
}

// ============================================================================
// Pattern evaluation
// ============================================================================

/// Entry pattern plus its firing history
///
/// Periodic and one-shot patterns remember the last firing date per ticker,
/// so the cadence survives calendar gaps and position re-entry.
pub struct PatternEntry {
    pub pattern: EntryPattern,
    last_fired: HashMap<Ticker, NaiveDate>,
}

impl PatternEntry {
    pub fn new(pattern: EntryPattern) -> Self {
        Self {
            pattern,
            last_fired: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, ctx: &SignalContext<'_>) -> bool {
        let fire = match &self.pattern {
            EntryPattern::FirstDay => ctx.dataset.first_timestamp() == Some(ctx.timestamp),
            EntryPattern::EveryNDays { n } => match self.last_fired.get(ctx.ticker) {
                None => true,
                Some(last) => {
                    (ctx.timestamp.date_naive() - *last).num_days() >= *n as i64
                }
            },
            EntryPattern::Immediate => !self.last_fired.contains_key(ctx.ticker),
            EntryPattern::MovingAverageCross { fast, slow } => {
                moving_average_cross(ctx, *fast, *slow)
            }
            EntryPattern::Never => false,
        };
        if fire {
            self.last_fired
                .insert(ctx.ticker.clone(), ctx.timestamp.date_naive());
        }
        fire
    }
}

impl ExitPattern {
    pub fn evaluate(&self, ctx: &SignalContext<'_>, position: &Position) -> bool {
        match self {
            ExitPattern::HoldUntilEnd => last_bar_timestamp(ctx.dataset, ctx.ticker)
                .map(|last| ctx.timestamp >= last)
                .unwrap_or(false),
            ExitPattern::AfterNDays { n } => position.days_held(ctx.timestamp) >= *n,
            ExitPattern::Never => ctx
                .end_date
                .map(|end| ctx.timestamp.date_naive() >= end)
                .unwrap_or(false),
        }
    }
}

fn last_bar_timestamp(dataset: &MarketDataset, ticker: &Ticker) -> Option<DateTime<Utc>> {
    dataset
        .timestamps()
        .iter()
        .rev()
        .find(|ts| dataset.has_bar(**ts, ticker))
        .copied()
}

/// True when the fast SMA closed above the slow SMA this bar after being at
/// or below it on the previous bar
fn moving_average_cross(ctx: &SignalContext<'_>, fast: usize, slow: usize) -> bool {
    let closes = closes_up_to(ctx.dataset, ctx.ticker, ctx.timestamp);
    if closes.len() < slow + 1 {
        return false;
    }
    let sma = |window: &[f64]| window.iter().sum::<f64>() / window.len() as f64;
    let fast_now = sma(&closes[closes.len() - fast..]);
    let slow_now = sma(&closes[closes.len() - slow..]);
    let prev = &closes[..closes.len() - 1];
    let fast_prev = sma(&prev[prev.len() - fast..]);
    let slow_prev = sma(&prev[prev.len() - slow..]);
    fast_now > slow_now && fast_prev <= slow_prev
}

fn closes_up_to(dataset: &MarketDataset, ticker: &Ticker, until: DateTime<Utc>) -> Vec<f64> {
    dataset
        .timestamps()
        .iter()
        .take_while(|ts| **ts <= until)
        .filter_map(|ts| dataset.bar(*ts, ticker))
        .map(|bar| bar.close)
        .collect()
}

// ============================================================================
// Oracle-backed signals
// ============================================================================

/// Oracle evaluation with per-(ticker, date) result caching
///
/// A failed call is recorded, cached as hold, and never retried within the
/// run, which keeps replays deterministic and the loop always progressing.
pub struct OracleSignal {
    slug: String,
    kind: SignalKind,
    client: Arc<OracleClient>,
    upside_threshold: f64,
    downside_threshold: f64,
    cache: HashMap<(Ticker, NaiveDate), OracleAction>,
    records: Vec<OracleSignalRecord>,
}

impl OracleSignal {
    pub fn new(
        slug: impl Into<String>,
        kind: SignalKind,
        client: Arc<OracleClient>,
        upside_threshold: f64,
        downside_threshold: f64,
    ) -> Self {
        Self {
            slug: slug.into(),
            kind,
            client,
            upside_threshold,
            downside_threshold,
            cache: HashMap::new(),
            records: Vec::new(),
        }
    }

    /// Drain accumulated diagnostics for the result record
    pub fn take_records(&mut self) -> Vec<OracleSignalRecord> {
        std::mem::take(&mut self.records)
    }

    async fn action_for(&mut self, ctx: &SignalContext<'_>) -> OracleAction {
        let date = ctx.timestamp.date_naive();
        let key = (ctx.ticker.clone(), date);
        if let Some(&cached) = self.cache.get(&key) {
            return cached;
        }

        let params = self.build_params(ctx);
        let action = match self
            .client
            .evaluate(&self.slug, ctx.ticker.as_str(), &params)
            .await
        {
            Ok(decision) => {
                debug!(ticker = %ctx.ticker, %date, signal = %decision.signal, "oracle decision");
                self.records.push(OracleSignalRecord {
                    ticker: ctx.ticker.clone(),
                    date,
                    kind: self.kind,
                    signal: decision.signal.as_str().to_string(),
                    confidence: decision.confidence,
                    raw_text: decision.raw_text,
                    error: None,
                });
                decision.signal
            }
            Err(e) => {
                warn!(ticker = %ctx.ticker, %date, error = %e, "oracle call failed, holding");
                self.records.push(OracleSignalRecord {
                    ticker: ctx.ticker.clone(),
                    date,
                    kind: self.kind,
                    signal: OracleAction::Hold.as_str().to_string(),
                    confidence: 0.0,
                    raw_text: String::new(),
                    error: Some(e.to_string()),
                });
                OracleAction::Hold
            }
        };
        self.cache.insert(key, action);
        action
    }

    fn build_params(&self, ctx: &SignalContext<'_>) -> Vec<(String, String)> {
        let mut params = vec![(
            "analysis_date".to_string(),
            ctx.timestamp.date_naive().to_string(),
        )];
        let today = ctx.dataset.bar(ctx.timestamp, ctx.ticker).map(|b| b.close);
        if let Some(close) = today {
            params.push(("todays_price".to_string(), format!("{close:.2}")));
        }
        if self.kind == SignalKind::Exit {
            if let Some(prev) = previous_close(ctx.dataset, ctx.ticker, ctx.timestamp) {
                params.push(("yesterdays_price".to_string(), format!("{prev:.2}")));
            }
            params.push((
                "upside_threshold".to_string(),
                format!("{}%", self.upside_threshold),
            ));
            params.push((
                "downside_threshold".to_string(),
                format!("{}%", self.downside_threshold),
            ));
        }
        params
    }
}

fn previous_close(dataset: &MarketDataset, ticker: &Ticker, before: DateTime<Utc>) -> Option<f64> {
    dataset
        .timestamps()
        .iter()
        .rev()
        .skip_while(|ts| **ts >= before)
        .find_map(|ts| dataset.bar(*ts, ticker))
        .map(|bar| bar.close)
}

// ============================================================================
// Signal sources
// ============================================================================

/// Entry decision function, resolved once at configuration time
pub enum EntrySignal {
    Pattern(PatternEntry),
    Oracle(OracleSignal),
}

impl EntrySignal {
    /// Suspension point: awaits only for the oracle variant
    pub async fn evaluate(&mut self, ctx: &SignalContext<'_>) -> bool {
        match self {
            EntrySignal::Pattern(entry) => entry.evaluate(ctx),
            EntrySignal::Oracle(oracle) => oracle.action_for(ctx).await == OracleAction::Buy,
        }
    }

    pub fn take_oracle_records(&mut self) -> Vec<OracleSignalRecord> {
        match self {
            EntrySignal::Pattern(_) => Vec::new(),
            EntrySignal::Oracle(oracle) => oracle.take_records(),
        }
    }
}

/// Exit decision function, resolved once at configuration time
pub enum ExitSignal {
    Pattern(ExitPattern),
    Oracle(OracleSignal),
}

impl ExitSignal {
    pub async fn evaluate(&mut self, ctx: &SignalContext<'_>, position: &Position) -> bool {
        match self {
            ExitSignal::Pattern(pattern) => pattern.evaluate(ctx, position),
            ExitSignal::Oracle(oracle) => matches!(
                oracle.action_for(ctx).await,
                OracleAction::Sell
            ),
        }
    }

    pub fn take_oracle_records(&mut self) -> Vec<OracleSignalRecord> {
        match self {
            ExitSignal::Pattern(_) => Vec::new(),
            ExitSignal::Oracle(oracle) => oracle.take_records(),
        }
    }
}

/// Resolve the configured entry logic to a signal source
pub fn build_entry_signal(
    entry_logic: Option<&str>,
    oracle_slug: Option<&str>,
    oracle_client: Option<Arc<OracleClient>>,
) -> EntrySignal {
    if let (Some(slug), Some(client)) = (oracle_slug, oracle_client) {
        return EntrySignal::Oracle(OracleSignal::new(
            slug,
            SignalKind::Entry,
            client,
            0.0,
            0.0,
        ));
    }
    match entry_logic {
        Some(text) => match translate_entry(text) {
            Some(pattern) => {
                debug!(?pattern, "translated entry logic");
                EntrySignal::Pattern(PatternEntry::new(pattern))
            }
            None => {
                warn!(text, "unrecognized entry logic, falling back to moving-average cross");
                EntrySignal::Pattern(PatternEntry::new(EntryPattern::MovingAverageCross {
                    fast: 5,
                    slow: 20,
                }))
            }
        },
        None => EntrySignal::Pattern(PatternEntry::new(EntryPattern::Never)),
    }
}

/// Resolve the configured exit logic to a signal source
pub fn build_exit_signal(
    exit_logic: Option<&str>,
    oracle_slug: Option<&str>,
    oracle_client: Option<Arc<OracleClient>>,
    upside_threshold: f64,
    downside_threshold: f64,
) -> ExitSignal {
    if let (Some(slug), Some(client)) = (oracle_slug, oracle_client) {
        return ExitSignal::Oracle(OracleSignal::new(
            slug,
            SignalKind::Exit,
            client,
            upside_threshold,
            downside_threshold,
        ));
    }
    match exit_logic {
        Some(text) => match translate_exit(text) {
            Some(pattern) => {
                debug!(?pattern, "translated exit logic");
                ExitSignal::Pattern(pattern)
            }
            None => {
                warn!(text, "unrecognized exit logic, holding until end");
                ExitSignal::Pattern(ExitPattern::HoldUntilEnd)
            }
        },
        None => ExitSignal::Pattern(ExitPattern::HoldUntilEnd),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn dataset(closes: &[f64]) -> MarketDataset {
        let bars = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Bar {
                timestamp: day(i as u32 + 1),
                ticker: Ticker::new("AAPL"),
                open: close,
                high: close + 1.0,
                low: close - 1.0,
                close,
                volume: 1000.0,
                adjusted_close: None,
            })
            .collect();
        MarketDataset::from_bars(bars)
    }

    #[test]
    fn test_translate_entry_patterns() {
        assert_eq!(translate_entry("Buy on the first day"), Some(EntryPattern::FirstDay));
        assert_eq!(translate_entry("buy on first day"), Some(EntryPattern::FirstDay));
        assert_eq!(
            translate_entry("buy every 5 days"),
            Some(EntryPattern::EveryNDays { n: 5 })
        );
        assert_eq!(
            translate_entry("buy every 3 business days"),
            Some(EntryPattern::EveryNDays { n: 3 })
        );
        assert_eq!(translate_entry("buy immediately"), Some(EntryPattern::Immediate));
        assert_eq!(translate_entry("buy now"), Some(EntryPattern::Immediate));
        assert_eq!(translate_entry("go long when it feels right"), None);
    }

    #[test]
    fn test_translate_exit_patterns() {
        assert_eq!(
            translate_exit("hold until the end"),
            Some(ExitPattern::HoldUntilEnd)
        );
        assert_eq!(
            translate_exit("sell after 10 days"),
            Some(ExitPattern::AfterNDays { n: 10 })
        );
        assert_eq!(
            translate_exit("exit after 1 day"),
            Some(ExitPattern::AfterNDays { n: 1 })
        );
        assert_eq!(translate_exit("never exit"), Some(ExitPattern::Never));
        assert_eq!(translate_exit("hold forever"), Some(ExitPattern::Never));
        assert_eq!(translate_exit("sell when overbought"), None);
    }

    fn ctx<'a>(
        ds: &'a MarketDataset,
        ticker: &'a Ticker,
        d: u32,
        end: Option<NaiveDate>,
    ) -> SignalContext<'a> {
        SignalContext {
            dataset: ds,
            ticker,
            timestamp: day(d),
            end_date: end,
        }
    }

    fn position(ticker: &Ticker) -> Position {
        Position {
            ticker: ticker.clone(),
            shares: 10.0,
            entry_price: 100.0,
            entry_timestamp: day(1),
            entry_cost: 1000.0,
            highest_price_since_entry: 100.0,
            current_price: 100.0,
        }
    }

    #[test]
    fn test_first_day_pattern_fires_once() {
        let ds = dataset(&[100.0, 101.0, 102.0]);
        let ticker = Ticker::new("AAPL");
        let mut entry = PatternEntry::new(EntryPattern::FirstDay);
        assert!(entry.evaluate(&ctx(&ds, &ticker, 1, None)));
        assert!(!entry.evaluate(&ctx(&ds, &ticker, 2, None)));
    }

    #[test]
    fn test_every_n_days_tracks_calendar_gap_per_ticker() {
        let ds = dataset(&[100.0, 101.0, 102.0, 103.0, 104.0]);
        let ticker = Ticker::new("AAPL");
        let mut entry = PatternEntry::new(EntryPattern::EveryNDays { n: 2 });
        let fires: Vec<bool> = (1..=5)
            .map(|d| entry.evaluate(&ctx(&ds, &ticker, d, None)))
            .collect();
        // First evaluation fires, then again each time 2 calendar days have
        // passed since the last firing
        assert_eq!(fires, vec![true, false, true, false, true]);

        // A second ticker keeps its own cadence
        let other = Ticker::new("MSFT");
        assert!(entry.evaluate(&ctx(&ds, &other, 5, None)));
    }

    #[test]
    fn test_every_n_days_counts_calendar_days_across_bar_gaps() {
        // Weekend-style gap: the day-8 bar is 3 calendar days after day 5
        let ds = dataset(&[100.0, 101.0, 102.0]);
        let ticker = Ticker::new("AAPL");
        let mut entry = PatternEntry::new(EntryPattern::EveryNDays { n: 3 });
        assert!(entry.evaluate(&ctx(&ds, &ticker, 5, None)));
        assert!(!entry.evaluate(&ctx(&ds, &ticker, 7, None)));
        assert!(entry.evaluate(&ctx(&ds, &ticker, 8, None)));
    }

    #[test]
    fn test_immediate_fires_once_per_ticker() {
        let ds = dataset(&[100.0, 101.0, 102.0]);
        let ticker = Ticker::new("AAPL");
        let mut entry = PatternEntry::new(EntryPattern::Immediate);
        assert!(entry.evaluate(&ctx(&ds, &ticker, 1, None)));
        assert!(!entry.evaluate(&ctx(&ds, &ticker, 2, None)));
        assert!(!entry.evaluate(&ctx(&ds, &ticker, 3, None)));
        let other = Ticker::new("MSFT");
        assert!(entry.evaluate(&ctx(&ds, &other, 3, None)));
    }

    #[test]
    fn test_after_n_days_exit() {
        let ds = dataset(&[100.0; 15]);
        let ticker = Ticker::new("AAPL");
        let pos = position(&ticker);
        let pattern = ExitPattern::AfterNDays { n: 10 };
        assert!(!pattern.evaluate(&ctx(&ds, &ticker, 5, None), &pos));
        assert!(pattern.evaluate(&ctx(&ds, &ticker, 11, None), &pos));
    }

    #[test]
    fn test_hold_until_end_fires_at_final_bar() {
        let ds = dataset(&[100.0, 101.0, 102.0]);
        let ticker = Ticker::new("AAPL");
        let pos = position(&ticker);
        let pattern = ExitPattern::HoldUntilEnd;
        assert!(!pattern.evaluate(&ctx(&ds, &ticker, 1, None), &pos));
        assert!(!pattern.evaluate(&ctx(&ds, &ticker, 2, None), &pos));
        assert!(pattern.evaluate(&ctx(&ds, &ticker, 3, None), &pos));
    }

    #[test]
    fn test_never_exit_fires_only_at_configured_end() {
        let ds = dataset(&[100.0, 101.0, 102.0]);
        let ticker = Ticker::new("AAPL");
        let pos = position(&ticker);
        let pattern = ExitPattern::Never;
        let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        assert!(!pattern.evaluate(&ctx(&ds, &ticker, 2, Some(end)), &pos));
        assert!(pattern.evaluate(&ctx(&ds, &ticker, 3, Some(end)), &pos));
        // Without a configured end the position rides forever
        assert!(!pattern.evaluate(&ctx(&ds, &ticker, 3, None), &pos));
    }

    #[test]
    fn test_moving_average_cross_detects_crossover() {
        // 6 flat bars, then a jump: fast(2) crosses above slow(4)
        let ds = dataset(&[100.0, 100.0, 100.0, 100.0, 100.0, 100.0, 120.0]);
        let ticker = Ticker::new("AAPL");
        let mut entry = PatternEntry::new(EntryPattern::MovingAverageCross { fast: 2, slow: 4 });
        assert!(!entry.evaluate(&ctx(&ds, &ticker, 6, None)));
        assert!(entry.evaluate(&ctx(&ds, &ticker, 7, None)));
    }

    #[test]
    fn test_unrecognized_entry_text_falls_back_to_ma_cross() {
        let signal = build_entry_signal(Some("something exotic"), None, None);
        assert!(matches!(
            signal,
            EntrySignal::Pattern(entry)
                if entry.pattern == (EntryPattern::MovingAverageCross { fast: 5, slow: 20 })
        ));
    }

    #[test]
    fn test_missing_exit_logic_holds_until_end() {
        let signal = build_exit_signal(None, None, None, 10.0, 5.0);
        assert!(matches!(
            signal,
            ExitSignal::Pattern(ExitPattern::HoldUntilEnd)
        ));
    }
}
