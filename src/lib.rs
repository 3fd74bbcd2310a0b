//! Equity Backtester
//!
//! A bar-by-bar multi-asset backtesting engine for equity strategies,
//! with configurable execution costs, portfolio risk limits, oracle-backed
//! signals, and benchmark-relative performance analysis.

pub mod backtest;
pub mod config;
pub mod costs;
pub mod data;
pub mod jobs;
pub mod oracle;
pub mod performance;
pub mod portfolio;
pub mod signals;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use types::*;
