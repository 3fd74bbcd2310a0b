//! Strategy engine: exit priority chain, position sizing, signal ranking,
//! and universe eligibility

use crate::config::{PortfolioRiskConfig, PositionSizingMethod, StrategyConfig};
use crate::data::MarketDataset;
use crate::oracle::OracleClient;
use crate::portfolio::Position;
use crate::signals::{build_entry_signal, build_exit_signal, EntrySignal, ExitSignal, SignalContext};
use crate::types::{ExitReason, OracleSignalRecord, Ticker};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// Per-run strategy parameters plus the two injected decision functions
pub struct StrategyEngine {
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub use_trailing_stops: bool,
    pub trailing_stop_distance: Option<f64>,
    pub time_based_exit: Option<i64>,
    pub sizing_method: PositionSizingMethod,
    pub fixed_dollar_amount: Option<f64>,
    pub portfolio_percent: Option<f64>,
    pub risk_percent: Option<f64>,
    pub max_positions: usize,
    entry_signal: EntrySignal,
    exit_signal: ExitSignal,
}

impl StrategyEngine {
    pub fn from_config(
        strategy: &StrategyConfig,
        risk: &PortfolioRiskConfig,
        oracle_client: Option<Arc<OracleClient>>,
    ) -> Self {
        let entry_signal = build_entry_signal(
            strategy.entry_logic.as_deref(),
            strategy.entry_oracle_slug.as_deref(),
            oracle_client.clone(),
        );
        let exit_signal = build_exit_signal(
            strategy.exit_logic.as_deref(),
            strategy.exit_oracle_slug.as_deref(),
            oracle_client,
            strategy.upside_threshold,
            strategy.downside_threshold,
        );
        Self {
            take_profit: strategy.take_profit,
            stop_loss: strategy.stop_loss,
            use_trailing_stops: risk.use_trailing_stops,
            trailing_stop_distance: risk.trailing_stop_distance,
            time_based_exit: strategy.time_based_exit,
            sizing_method: strategy.position_sizing_method,
            fixed_dollar_amount: strategy.fixed_dollar_amount,
            portfolio_percent: strategy.portfolio_percent,
            risk_percent: strategy.risk_percent,
            max_positions: strategy.max_positions,
            entry_signal,
            exit_signal,
        }
    }

    /// Fixed-priority exit chain; the first match wins and short-circuits
    /// the rest. Only the custom-signal step can suspend.
    pub async fn check_exit(
        &mut self,
        position: &Position,
        ctx: &SignalContext<'_>,
    ) -> Option<ExitReason> {
        let price = position.current_price;

        if let Some(stop) = self.stop_loss {
            if price <= position.entry_price * (1.0 - stop / 100.0) {
                return Some(ExitReason::StopLoss);
            }
        }

        if self.use_trailing_stops {
            if let Some(distance) = self.trailing_stop_distance {
                if price <= position.highest_price_since_entry * (1.0 - distance / 100.0) {
                    return Some(ExitReason::TrailingStop);
                }
            }
        }

        if let Some(target) = self.take_profit {
            if price >= position.entry_price * (1.0 + target / 100.0) {
                return Some(ExitReason::TakeProfit);
            }
        }

        if let Some(horizon) = self.time_based_exit {
            if position.days_held(ctx.timestamp) >= horizon {
                return Some(ExitReason::TimeExit);
            }
        }

        if self.exit_signal.evaluate(ctx, position).await {
            return Some(ExitReason::StrategySignal);
        }

        None
    }

    /// Shares for one entry, floored to a whole number
    ///
    /// A missing parameter for the selected mode yields zero shares, which
    /// the loop treats as "no trade" rather than an error.
    pub fn calculate_position_size(&self, price: f64, portfolio_value: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let shares = match self.sizing_method {
            PositionSizingMethod::FixedDollar => match self.fixed_dollar_amount {
                Some(amount) => amount / price,
                None => 0.0,
            },
            PositionSizingMethod::PortfolioPercent => match self.portfolio_percent {
                Some(pct) => portfolio_value * pct / 100.0 / price,
                None => 0.0,
            },
            PositionSizingMethod::RiskBased => match (self.risk_percent, self.stop_loss) {
                (Some(risk), Some(stop)) if stop > 0.0 => {
                    (portfolio_value * risk / 100.0) / (price * stop / 100.0)
                }
                _ => 0.0,
            },
        };
        shares.floor().max(0.0)
    }

    /// Tickers with a data row at this timestamp, in sorted order
    ///
    /// A free-text eligibility description is accepted by configuration but
    /// not evaluated; every data-present ticker passes.
    pub fn filter_eligible_universe(
        &self,
        dataset: &MarketDataset,
        timestamp: DateTime<Utc>,
    ) -> Vec<Ticker> {
        dataset
            .tickers()
            .iter()
            .filter(|ticker| dataset.has_bar(timestamp, ticker))
            .cloned()
            .collect()
    }

    /// Collect tickers whose entry signal fires at this bar, preserving the
    /// deterministic eligible order
    pub async fn generate_entry_signals(
        &mut self,
        dataset: &MarketDataset,
        timestamp: DateTime<Utc>,
        eligible: &[Ticker],
    ) -> Vec<Ticker> {
        let mut candidates = Vec::new();
        for ticker in eligible {
            let ctx = SignalContext {
                dataset,
                ticker,
                timestamp,
                end_date: None,
            };
            if self.entry_signal.evaluate(&ctx).await {
                candidates.push(ticker.clone());
            }
        }
        if !candidates.is_empty() {
            debug!(count = candidates.len(), "entry signals generated");
        }
        candidates
    }

    /// Truncate candidates to the available slots
    ///
    /// A ranking description hook exists in configuration but performs no
    /// reordering; candidates keep their iteration order.
    pub fn rank_signals(&self, mut candidates: Vec<Ticker>, slots: usize) -> Vec<Ticker> {
        candidates.truncate(slots);
        candidates
    }

    /// Evaluate the custom exit signal for one position
    /// Drain oracle diagnostics from both signal sides
    pub fn take_oracle_records(&mut self) -> Vec<OracleSignalRecord> {
        let mut records = self.entry_signal.take_oracle_records();
        records.extend(self.exit_signal.take_oracle_records());
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{EntryPattern, ExitPattern};
    use crate::types::Bar;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
    }

    fn engine() -> StrategyEngine {
        let strategy = StrategyConfig {
            entry_logic: Some("buy on the first day".to_string()),
            exit_logic: Some("never exit".to_string()),
            ..Default::default()
        };
        StrategyEngine::from_config(&strategy, &PortfolioRiskConfig::default(), None)
    }

    fn position(entry: f64, current: f64, highest: f64) -> Position {
        Position {
            ticker: Ticker::new("AAPL"),
            shares: 100.0,
            entry_price: entry,
            entry_timestamp: day(1),
            entry_cost: entry * 100.0,
            highest_price_since_entry: highest,
            current_price: current,
        }
    }

    fn dataset() -> MarketDataset {
        MarketDataset::from_bars(vec![Bar {
            timestamp: day(5),
            ticker: Ticker::new("AAPL"),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.0,
            volume: 1000.0,
            adjusted_close: None,
        }])
    }

    #[tokio::test]
    async fn test_stop_loss_fires_first() {
        let mut e = engine();
        e.stop_loss = Some(5.0);
        e.take_profit = Some(1.0);
        e.use_trailing_stops = true;
        e.trailing_stop_distance = Some(1.0);
        // Price below the stop; trailing and take-profit would also match a
        // later step, but the stop is checked first
        let pos = position(100.0, 94.0, 120.0);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(e.check_exit(&pos, &ctx).await, Some(ExitReason::StopLoss));
    }

    #[tokio::test]
    async fn test_trailing_stop_before_take_profit() {
        let mut e = engine();
        e.use_trailing_stops = true;
        e.trailing_stop_distance = Some(5.0);
        e.take_profit = Some(2.0);
        // Up 3% from entry (above target) but 10% off the high
        let pos = position(100.0, 103.0, 114.5);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(e.check_exit(&pos, &ctx).await, Some(ExitReason::TrailingStop));
    }

    #[tokio::test]
    async fn test_take_profit() {
        let mut e = engine();
        e.take_profit = Some(10.0);
        let pos = position(100.0, 111.0, 111.0);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(e.check_exit(&pos, &ctx).await, Some(ExitReason::TakeProfit));
    }

    #[tokio::test]
    async fn test_time_exit_after_horizon() {
        let mut e = engine();
        e.time_based_exit = Some(3);
        let pos = position(100.0, 100.0, 100.0);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(e.check_exit(&pos, &ctx).await, Some(ExitReason::TimeExit));
    }

    #[tokio::test]
    async fn test_strategy_signal_is_last_resort() {
        let strategy = StrategyConfig {
            entry_logic: Some("buy on the first day".to_string()),
            exit_logic: Some("sell after 2 days".to_string()),
            ..Default::default()
        };
        let mut e =
            StrategyEngine::from_config(&strategy, &PortfolioRiskConfig::default(), None);
        let pos = position(100.0, 100.0, 100.0);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(
            e.check_exit(&pos, &ctx).await,
            Some(ExitReason::StrategySignal)
        );
    }

    #[tokio::test]
    async fn test_no_exit_when_nothing_matches() {
        let mut e = engine();
        let pos = position(100.0, 101.0, 101.0);
        let ds = dataset();
        let ticker = Ticker::new("AAPL");
        let ctx = SignalContext {
            dataset: &ds,
            ticker: &ticker,
            timestamp: day(5),
            end_date: None,
        };
        assert_eq!(e.check_exit(&pos, &ctx).await, None);
    }

    #[test]
    fn test_fixed_dollar_sizing() {
        let mut e = engine();
        e.sizing_method = PositionSizingMethod::FixedDollar;
        e.fixed_dollar_amount = Some(10_000.0);
        assert_relative_eq!(e.calculate_position_size(51.0, 100_000.0), 196.0);
    }

    #[test]
    fn test_portfolio_percent_sizing() {
        let mut e = engine();
        e.sizing_method = PositionSizingMethod::PortfolioPercent;
        e.portfolio_percent = Some(100.0);
        assert_relative_eq!(e.calculate_position_size(50.0, 100_000.0), 2000.0);
    }

    #[test]
    fn test_risk_based_sizing() {
        let mut e = engine();
        e.sizing_method = PositionSizingMethod::RiskBased;
        e.risk_percent = Some(1.0);
        e.stop_loss = Some(5.0);
        // (100000 * 0.01) / (100 * 0.05) = 200
        assert_relative_eq!(e.calculate_position_size(100.0, 100_000.0), 200.0);
    }

    #[test]
    fn test_missing_sizing_parameter_yields_zero() {
        let mut e = engine();
        e.sizing_method = PositionSizingMethod::FixedDollar;
        e.fixed_dollar_amount = None;
        assert_relative_eq!(e.calculate_position_size(50.0, 100_000.0), 0.0);

        e.sizing_method = PositionSizingMethod::RiskBased;
        e.risk_percent = Some(1.0);
        e.stop_loss = None;
        assert_relative_eq!(e.calculate_position_size(50.0, 100_000.0), 0.0);
    }

    #[test]
    fn test_rank_signals_truncates_only() {
        let e = engine();
        let candidates = vec![
            Ticker::new("AAPL"),
            Ticker::new("GOOG"),
            Ticker::new("MSFT"),
        ];
        let ranked = e.rank_signals(candidates.clone(), 2);
        assert_eq!(ranked, vec![Ticker::new("AAPL"), Ticker::new("GOOG")]);
        let all = e.rank_signals(candidates, 10);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_eligibility_requires_data_presence() {
        let e = engine();
        let ds = dataset();
        assert_eq!(
            e.filter_eligible_universe(&ds, day(5)),
            vec![Ticker::new("AAPL")]
        );
        assert!(e.filter_eligible_universe(&ds, day(6)).is_empty());
    }

    #[tokio::test]
    async fn test_entry_signals_first_day_only() {
        let strategy = StrategyConfig {
            entry_logic: Some("buy on the first day".to_string()),
            ..Default::default()
        };
        let mut e =
            StrategyEngine::from_config(&strategy, &PortfolioRiskConfig::default(), None);
        assert!(matches!(
            &e.entry_signal,
            EntrySignal::Pattern(entry) if entry.pattern == EntryPattern::FirstDay
        ));
        assert!(matches!(
            e.exit_signal,
            ExitSignal::Pattern(ExitPattern::HoldUntilEnd)
        ));
        let ds = dataset();
        let eligible = vec![Ticker::new("AAPL")];
        let signals = e.generate_entry_signals(&ds, day(5), &eligible).await;
        assert_eq!(signals, eligible);
    }
}
