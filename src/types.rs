//! Core data types used across the backtesting engine

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for bar data
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// One OHLCV sample for one ticker at one timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub ticker: Ticker,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adjusted_close: Option<f64>,
}

impl Bar {
    /// Create a new bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        ticker: Ticker,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self {
            timestamp,
            ticker,
            open,
            high,
            low,
            close,
            volume,
            adjusted_close: None,
        };
        bar.validate()?;
        Ok(bar)
    }

    /// Validate the bar data
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Ticker symbol using Arc<str> for cheap cloning
///
/// Tickers are cloned onto every position, pending order, and trade record.
/// Using Arc<str> instead of String reduces heap allocations from O(n) to O(1) per clone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Ticker {
    pub fn new(s: impl AsRef<str>) -> Self {
        Ticker(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Ticker {
    fn from(s: &str) -> Self {
        Ticker::new(s)
    }
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    TakeProfit,
    TimeExit,
    StrategySignal,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TimeExit => "time_exit",
            ExitReason::StrategySignal => "strategy_signal",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record created exactly once when a position is closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: Ticker,
    pub entry_date: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_date: DateTime<Utc>,
    pub exit_price: f64,
    pub shares: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    pub entry_cost: f64,
    pub exit_cost: f64,
    pub holding_period_days: i64,
    pub exit_reason: ExitReason,
}

/// Whether a signal or order is on the entry or exit side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Entry,
    Exit,
}

/// Order queued for next-bar settlement; lives for at most one bar
#[derive(Debug, Clone)]
pub enum PendingOrder {
    Entry { ticker: Ticker },
    Exit { ticker: Ticker, reason: ExitReason },
}

/// Diagnostic record for one oracle call
///
/// Retained for reporting only; never feeds back into engine control flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleSignalRecord {
    pub ticker: Ticker,
    pub date: NaiveDate,
    pub kind: SignalKind,
    pub signal: String,
    pub confidence: f64,
    pub raw_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bar_validation_accepts_good_bar() {
        let bar = Bar::new(ts(), Ticker::new("AAPL"), 100.0, 105.0, 99.0, 103.0, 1e6);
        assert!(bar.is_ok());
    }

    #[test]
    fn test_bar_validation_rejects_high_below_low() {
        let bar = Bar::new(ts(), Ticker::new("AAPL"), 100.0, 99.0, 100.5, 100.0, 1e6);
        assert!(bar.is_err());
    }

    #[test]
    fn test_bar_validation_rejects_negative_volume() {
        let bar = Bar::new(ts(), Ticker::new("AAPL"), 100.0, 105.0, 99.0, 103.0, -1.0);
        assert!(matches!(bar, Err(BarValidationError::NegativeVolume(_))));
    }

    #[test]
    fn test_ticker_ordering_is_lexicographic() {
        let mut tickers = vec![Ticker::new("MSFT"), Ticker::new("AAPL"), Ticker::new("GOOG")];
        tickers.sort();
        let names: Vec<&str> = tickers.iter().map(|t| t.as_str()).collect();
        assert_eq!(names, vec!["AAPL", "GOOG", "MSFT"]);
    }

    #[test]
    fn test_exit_reason_serializes_snake_case() {
        let json = serde_json::to_string(&ExitReason::StopLoss).unwrap();
        assert_eq!(json, "\"stop_loss\"");
    }
}
