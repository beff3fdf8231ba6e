//! The analytics entry point.
//!
//! [`AnalyticsEngine::prepare`] cleans and aligns the input once and computes
//! the shared statistics into an [`AnalysisContext`]; every other operation
//! reads from that context.

use crate::budget::RunBudget;
use crate::config::EngineConfig;
use crate::data::{AnalysisInput, AssetSeries, MarketSeries, PortfolioComposition, common_dates};
use crate::error::{AnalyticsError, Result};
use crate::monte_carlo::{MonteCarloResult, MonteCarloSimulator, SimulationInputs};
use crate::observer::{AnalyticsObserver, DegenerateInput, TracingObserver};
use crate::optimizer::{self, EfficientFrontier, OptimizationProblem, OptimizationResult, RiskTolerance, WeightOptimizer};
use crate::risk::{self, MetricsReport};
use crate::stats::{self, CovarianceMatrix, Periodicity};
use chrono::NaiveDate;
use rand::RngCore;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Starting value of the performance index.
pub const INDEX_BASE: f64 = 100.0;

/// An asset left out of the analysis, with the reason.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExcludedAsset {
    pub symbol: String,
    pub reason: String,
}

/// Cleaned, date-aligned input plus every statistic derived from it.
/// Built once per request by [`AnalyticsEngine::prepare`].
#[derive(Clone, Debug)]
pub struct AnalysisContext {
    /// Holdings that survived cleaning, restricted to the common dates.
    pub portfolio: PortfolioComposition,
    /// `None` when the benchmark had too few valid prices.
    pub market: Option<MarketSeries>,
    pub dates: Vec<NaiveDate>,
    pub asset_returns: Vec<Vec<f64>>,
    pub market_returns: Vec<f64>,
    pub mean_daily_returns: Vec<f64>,
    /// `(1 + mean daily)^trading_days − 1` per asset.
    pub expected_returns: Vec<f64>,
    pub daily_covariance: CovarianceMatrix,
    pub annual_covariance: CovarianceMatrix,
    pub correlation: Vec<Vec<f64>>,
    pub weight_sum: f64,
    pub excluded: Vec<ExcludedAsset>,
    pub warnings: Vec<DegenerateInput>,
}

impl AnalysisContext {
    pub fn weights(&self) -> Vec<f64> {
        self.portfolio.weights()
    }

    pub fn symbols(&self) -> Vec<String> {
        self.portfolio.symbols()
    }

    pub fn is_empty(&self) -> bool {
        self.portfolio.is_empty()
    }

    pub fn calculation_date(&self) -> NaiveDate {
        self.dates
            .last()
            .copied()
            .unwrap_or_else(|| chrono::Utc::now().date_naive())
    }

    /// Weighted daily portfolio returns over the aligned dates.
    pub fn portfolio_returns(&self, weights: &[f64]) -> Vec<f64> {
        risk::portfolio_return_series(&self.asset_returns, weights)
    }
}

/// Base-100 value series for the portfolio and the benchmark.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PerformanceSeries {
    pub dates: Vec<NaiveDate>,
    pub portfolio: Vec<f64>,
    pub market: Vec<f64>,
}

pub struct AnalyticsEngine {
    config: EngineConfig,
    observer: Arc<dyn AnalyticsObserver>,
}

impl AnalyticsEngine {
    /// Validates `config`; degenerate inputs go to a [`TracingObserver`].
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            observer: Arc::new(TracingObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn AnalyticsObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn observer(&self) -> &dyn AnalyticsObserver {
        self.observer.as_ref()
    }

    fn report(&self, warnings: &mut Vec<DegenerateInput>, finding: DegenerateInput) {
        self.observer.degenerate_input(&finding);
        warnings.push(finding);
    }

    pub fn prepare(&self, input: &AnalysisInput) -> Result<AnalysisContext> {
        input.portfolio.validate_long_only()?;
        let mut warnings = Vec::new();
        let mut excluded = Vec::new();

        let (market, findings) = input.market.cleaned();
        for f in findings {
            self.report(&mut warnings, f);
        }
        let market = if market.prices.len() < 2 {
            self.report(
                &mut warnings,
                DegenerateInput::ExcludedAsset {
                    symbol: market.symbol.clone(),
                    available: market.prices.len(),
                },
            );
            excluded.push(ExcludedAsset {
                symbol: market.symbol.clone(),
                reason: format!("benchmark has {} valid prices", market.prices.len()),
            });
            None
        } else {
            Some(market)
        };

        let mut holdings = Vec::with_capacity(input.portfolio.len());
        for h in &input.portfolio.holdings {
            let (asset, findings) = h.asset.cleaned();
            for f in findings {
                self.report(&mut warnings, f);
            }
            if asset.prices.len() < 2 {
                self.report(
                    &mut warnings,
                    DegenerateInput::ExcludedAsset {
                        symbol: asset.symbol.clone(),
                        available: asset.prices.len(),
                    },
                );
                excluded.push(ExcludedAsset {
                    symbol: asset.symbol.clone(),
                    reason: format!("only {} valid prices", asset.prices.len()),
                });
                continue;
            }
            holdings.push(crate::data::Holding { asset, weight: h.weight });
        }

        let dates = common_dates(holdings.iter().map(|h| &h.asset).chain(market.as_ref()));
        if !holdings.is_empty() && dates.len() < 2 {
            return Err(AnalyticsError::insufficient_data("common dates", 2, dates.len()));
        }
        for h in &mut holdings {
            h.asset = h.asset.restricted_to(&dates);
        }
        let market = market.map(|m| if holdings.is_empty() { m } else { m.restricted_to(&dates) });

        let asset_returns = holdings
            .iter()
            .map(|h| h.asset.returns())
            .collect::<Result<Vec<_>>>()?;
        let market_returns = match &market {
            Some(m) => m.returns()?,
            None => Vec::new(),
        };

        for (h, r) in holdings.iter().zip(&asset_returns) {
            if stats::variance(r) <= 0.0 {
                self.report(
                    &mut warnings,
                    DegenerateInput::ZeroVariance {
                        context: format!("{} returns", h.asset.symbol),
                    },
                );
            }
        }
        if market.is_some() && stats::variance(&market_returns) <= 0.0 {
            self.report(
                &mut warnings,
                DegenerateInput::ZeroVariance {
                    context: "benchmark returns (beta defaults to 1.0)".to_string(),
                },
            );
        }

        let portfolio = PortfolioComposition::new(input.portfolio.name.clone(), holdings);
        let weight_sum = portfolio.weight_sum();
        if !portfolio.is_empty() && (weight_sum - 1.0).abs() > self.config.weight_sum_tolerance {
            self.report(&mut warnings, DegenerateInput::WeightSum { sum: weight_sum });
        }

        let trading_days = self.config.trading_days;
        let mean_daily_returns: Vec<f64> = asset_returns.iter().map(|r| stats::expected_return(r)).collect();
        let expected_returns = mean_daily_returns
            .iter()
            .map(|&m| stats::annualize_return(m, trading_days))
            .collect();
        let daily_covariance = stats::covariance_matrix(&asset_returns);
        let annual_covariance = daily_covariance.annualized(trading_days);
        let correlation = stats::correlation_matrix(&asset_returns);

        info!(
            "Prepared '{}': {} assets over {} dates ({} excluded, {} warnings)",
            portfolio.name,
            portfolio.len(),
            dates.len(),
            excluded.len(),
            warnings.len()
        );

        Ok(AnalysisContext {
            portfolio,
            market,
            dates: if asset_returns.is_empty() { Vec::new() } else { dates.into_iter().collect() },
            asset_returns,
            market_returns,
            mean_daily_returns,
            expected_returns,
            daily_covariance,
            annual_covariance,
            correlation,
            weight_sum,
            excluded,
            warnings,
        })
    }

    /// Full metrics row for the context's own weights.
    pub fn metrics(&self, ctx: &AnalysisContext) -> MetricsReport {
        self.metrics_for(ctx, &ctx.portfolio, &ctx.weights())
    }

    /// Metrics for arbitrary `weights` over the context's assets, with
    /// `portfolio` supplying name and sectors.
    pub fn metrics_for(&self, ctx: &AnalysisContext, portfolio: &PortfolioComposition, weights: &[f64]) -> MetricsReport {
        let date = ctx.calculation_date();
        if ctx.is_empty() {
            return MetricsReport::empty(portfolio.name.clone(), date);
        }
        let rf = self.config.risk_free_rate;
        let days = self.config.trading_days;
        let confidence = self.config.cvar_confidence;

        let expected_return = optimizer::portfolio_return(weights, &ctx.expected_returns);
        let volatility = optimizer::portfolio_risk(weights, &ctx.annual_covariance);
        let series = ctx.portfolio_returns(weights);
        let beta = risk::beta(&series, &ctx.market_returns);
        let market_return = if ctx.market_returns.is_empty() {
            0.0
        } else {
            stats::annualize_return(stats::mean(&ctx.market_returns), days)
        };

        MetricsReport {
            portfolio: portfolio.name.clone(),
            calculation_date: date,
            expected_return,
            volatility,
            sharpe: risk::sharpe_ratio(expected_return, volatility, rf),
            treynor: risk::treynor_ratio(expected_return, beta, rf),
            beta,
            alpha: risk::alpha(expected_return, beta, market_return, rf),
            cvar: risk::cvar(&series, confidence),
            var: risk::value_at_risk(&series, confidence),
            tracking_error: risk::tracking_error(&series, &ctx.market_returns),
            max_drawdown: risk::max_drawdown(&risk::performance_index(&series, INDEX_BASE)),
            sector_concentration: risk::sector_concentration(portfolio),
            annualized_return: risk::annualized_return(&series, days),
            market_return,
            risk_parity_score: risk::risk_parity_score(weights, &ctx.annual_covariance),
            daily_return: series.last().copied().unwrap_or(0.0),
            weight_sum: weights.iter().sum(),
        }
    }

    pub fn performance(&self, ctx: &AnalysisContext) -> PerformanceSeries {
        let series = ctx.portfolio_returns(&ctx.weights());
        PerformanceSeries {
            dates: ctx.dates.clone(),
            portfolio: risk::performance_index(&series, INDEX_BASE),
            market: risk::performance_index(&ctx.market_returns, INDEX_BASE),
        }
    }

    fn problem<'a>(&'a self, ctx: &'a AnalysisContext, target_return: f64, tolerance: RiskTolerance) -> OptimizationProblem<'a> {
        OptimizationProblem {
            expected_returns: &ctx.expected_returns,
            covariance: &ctx.annual_covariance,
            target_return,
            risk_tolerance: tolerance,
            risk_free_rate: self.config.risk_free_rate,
            settings: &self.config.optimizer,
        }
    }

    /// Optimizes in annual units: `target_return` is an annual return.
    pub fn optimize(
        &self,
        ctx: &AnalysisContext,
        optimizer: &dyn WeightOptimizer,
        target_return: f64,
        tolerance: RiskTolerance,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
    ) -> Result<OptimizationResult> {
        info!(
            "Optimizing '{}' with {} ({} assets, target {:.2}%, tolerance {})",
            ctx.portfolio.name,
            optimizer.name(),
            ctx.expected_returns.len(),
            target_return * 100.0,
            tolerance
        );
        optimizer.optimize(&self.problem(ctx, target_return, tolerance), rng, budget, self.observer())
    }

    pub fn efficient_frontier(
        &self,
        ctx: &AnalysisContext,
        optimizer: &dyn WeightOptimizer,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
    ) -> Result<EfficientFrontier> {
        let weights = ctx.weights();
        optimizer::efficient_frontier(
            optimizer,
            &self.problem(ctx, 0.0, RiskTolerance::Low),
            self.config.frontier_steps,
            Some(&weights),
            rng,
            budget,
            self.observer(),
        )
    }

    /// Simulates the context's historical statistics under `weights`, or the
    /// context's own weights when `None`.
    pub fn simulate(
        &self,
        ctx: &AnalysisContext,
        weights: Option<&[f64]>,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
    ) -> Result<MonteCarloResult> {
        let weights = weights.map(<[f64]>::to_vec).unwrap_or_else(|| ctx.weights());
        let inputs = SimulationInputs::new(
            ctx.mean_daily_returns.clone(),
            ctx.daily_covariance.clone(),
            weights,
            self.config.trading_days,
        )?;
        self.run_simulation(&inputs, rng, budget)
    }

    /// Simulates from a correlation matrix alone, with zero drift and the
    /// configured synthetic daily volatility.
    pub fn simulate_synthetic(
        &self,
        correlation: &[Vec<f64>],
        weights: &[f64],
        rng: &mut dyn RngCore,
        budget: &RunBudget,
    ) -> Result<MonteCarloResult> {
        let inputs = SimulationInputs::synthetic(correlation, weights, self.config.simulation.synthetic_daily_vol)?;
        self.run_simulation(&inputs, rng, budget)
    }

    fn run_simulation(&self, inputs: &SimulationInputs, rng: &mut dyn RngCore, budget: &RunBudget) -> Result<MonteCarloResult> {
        let simulator = MonteCarloSimulator::new(self.config.simulation.clone())?;
        info!(
            "Monte Carlo: {} paths over {} days",
            simulator.settings().iterations,
            simulator.settings().horizon_days
        );
        simulator.run(inputs, rng, budget, self.observer())
    }
}

/// Builds an [`AnalysisInput`] from bare close series sharing a start date.
/// Mostly useful in tests and demos.
pub fn input_from_closes(
    name: &str,
    start: NaiveDate,
    assets: &[(&str, Option<&str>, &[f64], f64)],
    market: &[f64],
) -> AnalysisInput {
    let holdings = assets
        .iter()
        .map(|&(symbol, sector, closes, weight)| crate::data::Holding {
            asset: AssetSeries::from_closes(symbol, sector.map(str::to_string), start, closes),
            weight,
        })
        .collect();
    AnalysisInput {
        portfolio: PortfolioComposition::new(name, holdings),
        market: AssetSeries::from_closes("MARKET", None, start, market),
    }
}

impl std::fmt::Debug for AnalyticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEngine").field("config", &self.config).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::RunBudget;
    use crate::config::{OptimizerSettings, SimulationSettings};
    use crate::data::{Holding, PricePoint};
    use crate::observer::RecordingObserver;
    use crate::optimizer::RandomSearchOptimizer;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            frontier_steps: 5,
            optimizer: OptimizerSettings {
                trials: 512,
                ..OptimizerSettings::default()
            },
            simulation: SimulationSettings {
                iterations: 200,
                horizon_days: 20,
                ..SimulationSettings::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine_with_recorder() -> (AnalyticsEngine, Arc<RecordingObserver>) {
        let obs = Arc::new(RecordingObserver::new());
        let engine = AnalyticsEngine::new(fast_config()).unwrap().with_observer(obs.clone());
        (engine, obs)
    }

    fn mock_input(seed: u64) -> AnalysisInput {
        let mut rng = StdRng::seed_from_u64(seed);
        AnalysisInput::mock(260, &mut rng)
    }

    #[test]
    fn test_prepare_mock_portfolio() {
        let (engine, obs) = engine_with_recorder();
        let ctx = engine.prepare(&mock_input(1)).unwrap();
        assert_eq!(ctx.portfolio.len(), 5);
        assert_eq!(ctx.asset_returns.len(), 5);
        assert!(ctx.asset_returns.iter().all(|r| r.len() == ctx.dates.len() - 1));
        assert_eq!(ctx.market_returns.len(), ctx.dates.len() - 1);
        assert_eq!(ctx.daily_covariance.periodicity(), Periodicity::Daily);
        assert_eq!(ctx.annual_covariance.periodicity(), Periodicity::Annual);
        assert!((ctx.weight_sum - 1.0).abs() < 1e-12);
        assert!(ctx.excluded.is_empty());
        assert!(obs.findings().is_empty());
    }

    #[test]
    fn test_short_asset_is_excluded_not_fatal() {
        let (engine, obs) = engine_with_recorder();
        let mut input = input_from_closes(
            "p",
            start(),
            &[
                ("A", Some("Tech"), &[100.0, 101.0, 99.0, 102.0], 0.5),
                ("B", Some("Energy"), &[50.0, 51.0, 52.0, 50.5], 0.3),
            ],
            &[10.0, 10.1, 10.0, 10.2],
        );
        input.portfolio.holdings.push(Holding {
            asset: AssetSeries::new("C", None, vec![PricePoint { date: start(), price: 5.0 }]),
            weight: 0.2,
        });
        let ctx = engine.prepare(&input).unwrap();
        assert_eq!(ctx.symbols(), vec!["A".to_string(), "B".to_string()]);
        assert_eq!(ctx.excluded.len(), 1);
        assert_eq!(ctx.excluded[0].symbol, "C");
        let findings = obs.findings();
        assert!(findings.iter().any(|f| matches!(f, DegenerateInput::ExcludedAsset { available: 1, .. })));
        assert!(findings.iter().any(|f| matches!(f, DegenerateInput::WeightSum { .. })));
        let report = engine.metrics(&ctx);
        assert!((report.weight_sum - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_dates_are_aligned_and_bad_prices_dropped() {
        let (engine, obs) = engine_with_recorder();
        let mut input = input_from_closes(
            "p",
            start(),
            &[
                ("A", None, &[100.0, 101.0, -1.0, 102.0, 103.0], 0.5),
                ("B", None, &[50.0, 51.0, 52.0, 50.5, 51.0], 0.5),
            ],
            &[10.0, 10.1, 10.0, 10.2, 10.3],
        );
        // B misses the second day.
        input.portfolio.holdings[1].asset.prices.remove(1);
        let ctx = engine.prepare(&input).unwrap();
        // Common dates: day 1, 4 and 5.
        assert_eq!(ctx.dates.len(), 3);
        assert!(ctx.asset_returns.iter().all(|r| r.len() == 2));
        assert!(obs
            .findings()
            .iter()
            .any(|f| matches!(f, DegenerateInput::DroppedPrice { index: 2, .. })));
    }

    #[test]
    fn test_prepare_orders_json_prices_by_date() {
        let (engine, _) = engine_with_recorder();
        let text = r#"{
            "portfolio": {"name": "p", "holdings": [
                {"symbol": "A", "weight": 1.0, "prices": [
                    {"date": "2024-01-04", "price": 121.0},
                    {"date": "2024-01-03", "price": 110.0},
                    {"date": "2024-01-02", "price": 100.0}
                ]}
            ]},
            "market": {"symbol": "M", "prices": [
                {"date": "2024-01-02", "price": 10.0},
                {"date": "2024-01-04", "price": 10.4},
                {"date": "2024-01-03", "price": 10.2}
            ]}
        }"#;
        let input = AnalysisInput::from_json_str(text).unwrap();
        let ctx = engine.prepare(&input).unwrap();
        assert_eq!(ctx.dates.len(), 3);
        assert!(ctx.asset_returns[0].iter().all(|&r| (r - 0.1).abs() < 1e-12));
        assert!(ctx.market_returns.iter().all(|&r| r > 0.0));
    }

    #[test]
    fn test_short_selling_rejected() {
        let (engine, _) = engine_with_recorder();
        let input = input_from_closes("p", start(), &[("A", None, &[1.0, 2.0], -0.5)], &[1.0, 2.0]);
        assert!(engine.prepare(&input).unwrap_err().is_fatal_configuration());
    }

    #[test]
    fn test_constant_market_beta_defaults() {
        let (engine, obs) = engine_with_recorder();
        let input = input_from_closes(
            "p",
            start(),
            &[("A", Some("Tech"), &[100.0, 102.0, 101.0, 104.0, 103.0], 1.0)],
            &[100.0; 5],
        );
        let ctx = engine.prepare(&input).unwrap();
        let report = engine.metrics(&ctx);
        assert_eq!(report.beta, 1.0);
        assert!(report.sharpe.is_finite());
        assert!((report.sector_concentration - 1.0).abs() < 1e-12);
        assert!(obs
            .findings()
            .iter()
            .any(|f| matches!(f, DegenerateInput::ZeroVariance { .. })));
    }

    #[test]
    fn test_empty_portfolio_defaults() {
        let (engine, _) = engine_with_recorder();
        let input = input_from_closes("empty", start(), &[], &[100.0, 101.0, 102.0]);
        let ctx = engine.prepare(&input).unwrap();
        let report = engine.metrics(&ctx);
        assert_eq!(report.volatility, 0.0);
        assert_eq!(report.expected_return, 0.0);
        assert_eq!(report.beta, 1.0);
        let mut rng = StdRng::seed_from_u64(0);
        let r = engine
            .optimize(&ctx, &RandomSearchOptimizer, 0.1, RiskTolerance::Medium, &mut rng, &RunBudget::unlimited())
            .unwrap();
        assert!(r.weights.is_empty());
    }

    #[test]
    fn test_metrics_are_consistent() {
        let (engine, _) = engine_with_recorder();
        let ctx = engine.prepare(&mock_input(2)).unwrap();
        let m = engine.metrics(&ctx);
        assert!(m.volatility > 0.0);
        assert!((m.sharpe - (m.expected_return - 0.0475) / m.volatility).abs() < 1e-12);
        assert!(m.cvar <= m.var);
        assert!((0.0..=1.0).contains(&m.max_drawdown));
        // Two technology names at 0.45, three singletons.
        let hhi = 0.45f64.powi(2) + 0.15f64.powi(2) + 0.15f64.powi(2) + 0.25f64.powi(2);
        assert!((m.sector_concentration - hhi).abs() < 1e-12);
        assert_eq!(m.calculation_date, *ctx.dates.last().unwrap());

        let perf = engine.performance(&ctx);
        assert_eq!(perf.portfolio.len(), ctx.dates.len());
        assert_eq!(perf.portfolio[0], INDEX_BASE);
    }

    #[test]
    fn test_optimize_and_frontier_on_context() {
        let (engine, _) = engine_with_recorder();
        let ctx = engine.prepare(&mock_input(3)).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let r = engine
            .optimize(&ctx, &RandomSearchOptimizer, 0.10, RiskTolerance::Medium, &mut rng, &RunBudget::unlimited())
            .unwrap();
        assert_eq!(r.weights.len(), 5);
        assert!((r.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert_eq!(r.trials_evaluated, 512);

        let frontier = engine
            .efficient_frontier(&ctx, &RandomSearchOptimizer, &mut rng, &RunBudget::unlimited())
            .unwrap();
        assert_eq!(frontier.points.len(), 5);
        assert!(frontier.current.is_some());
    }

    #[test]
    fn test_simulation_reproducible_through_engine() {
        let (engine, _) = engine_with_recorder();
        let ctx = engine.prepare(&mock_input(5)).unwrap();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            engine.simulate(&ctx, None, &mut rng, &RunBudget::unlimited()).unwrap()
        };
        let a = run(99);
        assert_eq!(a.results.len(), 200);
        assert_eq!(a.results, run(99).results);

        let mut rng = StdRng::seed_from_u64(1);
        let synthetic = engine
            .simulate_synthetic(&ctx.correlation, &ctx.weights(), &mut rng, &RunBudget::unlimited())
            .unwrap();
        assert_eq!(synthetic.results.len(), 200);
    }
}
