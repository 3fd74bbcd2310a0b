//! Backtest configuration: JSON schema, defaults, and pre-run validation

use anyhow::{Context, Result};
use chrono::{NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Configuration rejected before a run starts
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no tickers configured")]
    MissingTickers,

    #[error("start date {start} must be before end date {end}")]
    InvalidDateRange { start: NaiveDate, end: NaiveDate },

    #[error("initial capital must be positive, got {0}")]
    NonPositiveCapital(f64),

    #[error("no entry logic configured (set entryLogic or entryOracleSlug)")]
    MissingEntryLogic,

    #[error("max leverage must be >= 1 when leverage is allowed, got {0}")]
    InvalidLeverage(f64),
}

/// Execution price rule and settlement lag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryTiming {
    #[default]
    SameBarClose,
    NextBarOpen,
    Midpoint,
    Vwap,
}

/// Valuation cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MtmFrequency {
    EveryBar,
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// Price used when marking positions to market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MtmPrice {
    #[default]
    Close,
    Vwap,
    Mid,
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommissionType {
    #[default]
    PerTrade,
    PerShare,
    PerContract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionSizingMethod {
    FixedDollar,
    #[default]
    PortfolioPercent,
    RiskBased,
}

/// Only fixed-percent is implemented; the other variants are accepted and inert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopLossType {
    #[default]
    FixedPercent,
    DollarBased,
    VolatilityBased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingDataPolicy {
    Skip,
    #[default]
    ForwardFill,
    Interpolate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketDataConfig {
    pub tickers: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub frequency: DataFrequency,
    pub fields: Vec<String>,
    pub include_dividends: bool,
    pub include_splits: bool,
    pub include_delistings: bool,
    pub benchmark: Option<String>,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            start_date: None,
            end_date: None,
            frequency: DataFrequency::Daily,
            fields: vec![
                "open".to_string(),
                "high".to_string(),
                "low".to_string(),
                "close".to_string(),
                "volume".to_string(),
            ],
            include_dividends: false,
            include_splits: false,
            include_delistings: false,
            benchmark: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyConfig {
    /// Free-text entry description, translated to a canned pattern when recognized
    pub entry_logic: Option<String>,
    /// Oracle prompt slug; takes precedence over pattern translation when set
    pub entry_oracle_slug: Option<String>,
    pub exit_logic: Option<String>,
    pub exit_oracle_slug: Option<String>,
    /// Take-profit threshold in percent above entry
    pub take_profit: Option<f64>,
    /// Stop-loss threshold in percent below entry
    pub stop_loss: Option<f64>,
    /// Close after this many calendar days held
    pub time_based_exit: Option<i64>,
    pub upside_threshold: f64,
    pub downside_threshold: f64,
    pub position_sizing_method: PositionSizingMethod,
    pub fixed_dollar_amount: Option<f64>,
    pub portfolio_percent: Option<f64>,
    pub risk_percent: Option<f64>,
    pub max_positions: usize,
    /// Accepted but not evaluated; candidates are truncated in sorted order
    pub ranking_logic: Option<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            entry_logic: None,
            entry_oracle_slug: None,
            exit_logic: None,
            exit_oracle_slug: None,
            take_profit: None,
            stop_loss: None,
            time_based_exit: None,
            upside_threshold: 10.0,
            downside_threshold: 5.0,
            position_sizing_method: PositionSizingMethod::PortfolioPercent,
            fixed_dollar_amount: None,
            portfolio_percent: None,
            risk_percent: None,
            max_positions: 10,
            ranking_logic: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortfolioRiskConfig {
    pub initial_capital: f64,
    pub leverage_allowed: bool,
    pub max_leverage: f64,
    pub max_single_asset_percent: Option<f64>,
    /// Declared capability; sector exposure evaluates to zero (see portfolio module)
    pub max_sector_percent: Option<f64>,
    pub max_net_exposure: Option<f64>,
    pub stop_loss_type: StopLossType,
    pub use_trailing_stops: bool,
    /// Percent below the highest price since entry
    pub trailing_stop_distance: Option<f64>,
    pub max_daily_drawdown: Option<f64>,
    pub max_weekly_drawdown: Option<f64>,
}

impl Default for PortfolioRiskConfig {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            leverage_allowed: false,
            max_leverage: 1.0,
            max_single_asset_percent: None,
            max_sector_percent: None,
            max_net_exposure: None,
            stop_loss_type: StopLossType::FixedPercent,
            use_trailing_stops: false,
            trailing_stop_distance: None,
            max_daily_drawdown: None,
            max_weekly_drawdown: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub entry_timing: EntryTiming,
    pub commission_type: CommissionType,
    pub commission_amount: f64,
    /// Percent of gross trade value
    pub exchange_fees: f64,
    /// Percent applied against the trade direction
    pub slippage: f64,
    /// Weekday allow-list ("Monday", ...); empty = all days allowed
    pub trading_days: Vec<String>,
    pub handle_missing_data: MissingDataPolicy,
    pub short_selling_allowed: bool,
    /// Annualized borrow rate in percent, accrued per bar on short positions
    pub borrow_cost: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_timing: EntryTiming::SameBarClose,
            commission_type: CommissionType::PerTrade,
            commission_amount: 0.0,
            exchange_fees: 0.0,
            slippage: 0.0,
            trading_days: Vec::new(),
            handle_missing_data: MissingDataPolicy::ForwardFill,
            short_selling_allowed: false,
            borrow_cost: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MtmConfig {
    pub mtm_frequency: MtmFrequency,
    pub mtm_price: MtmPrice,
    /// Declared capability; the per-bar dividend step books nothing
    pub book_dividend_cashflows: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RebalancingConfig {
    pub rebalancing_type: Option<String>,
    pub drop_delisted: bool,
}

/// Full backtest configuration, one JSON document per run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub market_data: MarketDataConfig,
    pub strategy: StrategyConfig,
    pub portfolio_risk: PortfolioRiskConfig,
    pub trading_execution: ExecutionConfig,
    pub mtm: MtmConfig,
    pub rebalancing: RebalancingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Reject a bad configuration before the loop starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.market_data.tickers.is_empty() {
            return Err(ConfigError::MissingTickers);
        }
        if let (Some(start), Some(end)) = (self.market_data.start_date, self.market_data.end_date) {
            if start >= end {
                return Err(ConfigError::InvalidDateRange { start, end });
            }
        }
        if self.portfolio_risk.initial_capital <= 0.0 {
            return Err(ConfigError::NonPositiveCapital(
                self.portfolio_risk.initial_capital,
            ));
        }
        if self.strategy.entry_logic.is_none() && self.strategy.entry_oracle_slug.is_none() {
            return Err(ConfigError::MissingEntryLogic);
        }
        if self.portfolio_risk.leverage_allowed && self.portfolio_risk.max_leverage < 1.0 {
            return Err(ConfigError::InvalidLeverage(self.portfolio_risk.max_leverage));
        }
        Ok(())
    }

    /// Parsed weekday allow-list; `None` means all days trade
    pub fn allowed_weekdays(&self) -> Option<Vec<Weekday>> {
        if self.trading_execution.trading_days.is_empty() {
            return None;
        }
        let days = self
            .trading_execution
            .trading_days
            .iter()
            .filter_map(|name| name.parse::<Weekday>().ok())
            .collect::<Vec<_>>();
        if days.is_empty() {
            None
        } else {
            Some(days)
        }
    }
}

/// API credentials, read from the environment (optionally via a .env file)
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub market_data_api_key: Option<String>,
    pub oracle_api_key: Option<String>,
    pub oracle_base_url: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            market_data_api_key: std::env::var("MARKET_DATA_API_KEY").ok(),
            oracle_api_key: std::env::var("ORACLE_API_KEY").ok(),
            oracle_base_url: std::env::var("ORACLE_BASE_URL").ok(),
        }
    }
}
