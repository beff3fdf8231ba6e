//! Async facade over the analytics engine.
//!
//! A full analysis runs on tokio's blocking pool. The run's cancellation
//! token fires when the service timeout elapses or when the caller drops the
//! returned future; the engine notices it between batches.

use crate::budget::{CancellationToken, RunBudget};
use crate::data::{AnalysisInput, AssetSeries};
use crate::engine::{AnalysisContext, AnalyticsEngine, ExcludedAsset, PerformanceSeries};
use crate::error::AnalyticsError;
use crate::monte_carlo::MonteCarloResult;
use crate::observer::DegenerateInput;
use crate::optimizer::{EfficientFrontier, OptimizationResult, OptimizerStrategy, RiskTolerance};
use crate::risk::MetricsReport;
use crate::scenario::{self, CorrelationCandidate, ScenarioOutcome, SectorCandidate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Seed used when a request does not carry one.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Analytics(#[from] AnalyticsError),

    #[error("Analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("Analysis task failed: {0}")]
    Task(String),
}

/// Which stages to run and how.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Annual target return; defaults to the current portfolio's expected return.
    pub target_return: Option<f64>,
    pub risk_tolerance: RiskTolerance,
    pub strategy: OptimizerStrategy,
    pub seed: u64,
    pub optimize: bool,
    pub frontier: bool,
    pub simulation: bool,
    /// Soft limit per run: stages stop early and flag their result truncated.
    pub time_limit_ms: Option<u64>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            target_return: None,
            risk_tolerance: RiskTolerance::default(),
            strategy: OptimizerStrategy::default(),
            seed: DEFAULT_SEED,
            optimize: true,
            frontier: true,
            simulation: true,
            time_limit_ms: None,
        }
    }
}

/// A what-if weight for one holding; the others are rescaled around it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightTarget {
    pub symbol: String,
    pub weight: f64,
}

/// One analysis request: the portfolio, optional candidate assets for
/// diversification suggestions, weight changes to evaluate, and options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(flatten)]
    pub input: AnalysisInput,
    #[serde(default)]
    pub candidates: Vec<AssetSeries>,
    #[serde(default)]
    pub weight_changes: Vec<WeightTarget>,
    #[serde(default)]
    pub options: AnalysisOptions,
}

impl AnalysisRequest {
    pub fn new(input: AnalysisInput) -> Self {
        Self {
            input,
            candidates: Vec::new(),
            weight_changes: Vec::new(),
            options: AnalysisOptions::default(),
        }
    }

    pub fn from_json_str(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CorrelationTable {
    pub symbols: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

/// A stage that failed without sinking the whole analysis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageFailure {
    pub stage: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub symbols: Vec<String>,
    pub weights: Vec<f64>,
    pub expected_returns: Vec<f64>,
    pub metrics: MetricsReport,
    pub correlation: CorrelationTable,
    pub performance: PerformanceSeries,
    pub optimization: Option<OptimizationResult>,
    pub frontier: Option<EfficientFrontier>,
    pub simulation: Option<MonteCarloResult>,
    pub low_correlation: Vec<CorrelationCandidate>,
    pub sector_candidates: Vec<SectorCandidate>,
    pub scenarios: Vec<ScenarioOutcome>,
    pub excluded: Vec<ExcludedAsset>,
    pub warnings: Vec<DegenerateInput>,
    pub failures: Vec<StageFailure>,
}

/// Runs `stage`, turning data errors into a recorded failure.
/// Cancellation and configuration errors propagate.
fn stage<T>(
    name: &str,
    failures: &mut Vec<StageFailure>,
    f: impl FnOnce() -> crate::error::Result<T>,
) -> crate::error::Result<Option<T>> {
    match f() {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_fatal_configuration() || matches!(e, AnalyticsError::Cancelled { .. }) => Err(e),
        Err(e) => {
            warn!("{} failed: {}", name, e);
            failures.push(StageFailure {
                stage: name.to_string(),
                reason: e.to_string(),
            });
            Ok(None)
        }
    }
}

/// Synchronous full analysis. Preparation errors are returned; later stages
/// that fail are listed in [`AnalysisReport::failures`].
pub fn run_analysis(engine: &AnalyticsEngine, request: &AnalysisRequest, budget: &RunBudget) -> crate::error::Result<AnalysisReport> {
    let opts = &request.options;
    let ctx: AnalysisContext = engine.prepare(&request.input)?;
    let metrics = engine.metrics(&ctx);
    let optimizer = opts.strategy.build();
    let target = opts.target_return.unwrap_or(metrics.expected_return);
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut failures = Vec::new();

    let optimization = if opts.optimize {
        stage("optimization", &mut failures, || {
            engine.optimize(&ctx, optimizer.as_ref(), target, opts.risk_tolerance, &mut rng, budget)
        })?
    } else {
        None
    };
    let frontier = if opts.frontier {
        stage("efficient frontier", &mut failures, || {
            engine.efficient_frontier(&ctx, optimizer.as_ref(), &mut rng, budget)
        })?
    } else {
        None
    };
    let simulation = if opts.simulation {
        stage("simulation", &mut failures, || engine.simulate(&ctx, None, &mut rng, budget))?
    } else {
        None
    };

    let low_correlation = scenario::low_correlation_candidates(&ctx, &request.candidates, scenario::DEFAULT_TOP_K);
    let sector_candidates =
        scenario::sector_diversification_candidates(&ctx.portfolio, &request.candidates, scenario::DEFAULT_TOP_K);
    let mut scenarios = Vec::new();
    for pick in &low_correlation {
        let Some(candidate) = request.candidates.iter().find(|c| c.symbol == pick.symbol) else {
            continue;
        };
        let name = format!("add {}", candidate.symbol);
        if let Some(outcome) = stage(&name, &mut failures, || scenario::add_asset(engine, &ctx, candidate, None))? {
            scenarios.push(outcome);
        }
    }

    for change in &request.weight_changes {
        let name = format!("change {}", change.symbol);
        if let Some(outcome) = stage(&name, &mut failures, || {
            scenario::change_weight(engine, &ctx, &change.symbol, change.weight)
        })? {
            scenarios.push(outcome);
        }
    }

    Ok(AnalysisReport {
        symbols: ctx.symbols(),
        weights: ctx.weights(),
        expected_returns: ctx.expected_returns.clone(),
        correlation: CorrelationTable {
            symbols: ctx.symbols(),
            values: ctx.correlation.clone(),
        },
        performance: engine.performance(&ctx),
        metrics,
        optimization,
        frontier,
        simulation,
        low_correlation,
        sector_candidates,
        scenarios,
        excluded: ctx.excluded.clone(),
        warnings: ctx.warnings.clone(),
        failures,
    })
}

/// Cancels the token when dropped, so an abandoned future stops its worker.
struct CancelOnDrop(CancellationToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

#[derive(Clone, Debug)]
pub struct AnalyticsService {
    engine: Arc<AnalyticsEngine>,
    timeout: Option<Duration>,
}

impl AnalyticsService {
    pub fn new(engine: AnalyticsEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            timeout: None,
        }
    }

    /// Hard limit after which the run is cancelled and [`ServiceError::Timeout`]
    /// is returned.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn engine(&self) -> &AnalyticsEngine {
        &self.engine
    }

    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, ServiceError> {
        let token = CancellationToken::new();
        let _guard = CancelOnDrop(token.clone());
        let mut budget = RunBudget::with_token(token.clone());
        if let Some(ms) = request.options.time_limit_ms {
            budget = budget.with_time_limit(Duration::from_millis(ms));
        }

        let engine = Arc::clone(&self.engine);
        let handle = tokio::task::spawn_blocking(move || run_analysis(&engine, &request, &budget));

        let joined = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    warn!("Analysis exceeded {:?}; cancelled", limit);
                    return Err(ServiceError::Timeout(limit));
                }
            },
            None => handle.await,
        };

        let report = joined.map_err(|e| ServiceError::Task(e.to_string()))??;
        info!(
            "Analysis of '{}' finished: {} warnings, {} stage failures",
            report.metrics.portfolio,
            report.warnings.len(),
            report.failures.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, OptimizerSettings, SimulationSettings};
    use crate::engine::input_from_closes;
    use crate::observer::RecordingObserver;
    use chrono::NaiveDate;

    fn quick_engine(trials: usize) -> AnalyticsEngine {
        let config = EngineConfig {
            frontier_steps: 3,
            optimizer: OptimizerSettings {
                trials,
                ..OptimizerSettings::default()
            },
            simulation: SimulationSettings {
                iterations: 100,
                horizon_days: 10,
                ..SimulationSettings::default()
            },
            ..EngineConfig::default()
        };
        AnalyticsEngine::new(config)
            .unwrap()
            .with_observer(Arc::new(RecordingObserver::new()))
    }

    fn mock_request(seed: u64) -> AnalysisRequest {
        let mut rng = StdRng::seed_from_u64(seed);
        AnalysisRequest::new(AnalysisInput::mock(120, &mut rng))
    }

    #[tokio::test]
    async fn test_analyze_mock_portfolio() {
        let service = AnalyticsService::new(quick_engine(300));
        let report = service.analyze(mock_request(1)).await.unwrap();
        assert_eq!(report.symbols.len(), 5);
        assert_eq!(report.correlation.values.len(), 5);
        assert!(report.optimization.is_some());
        assert_eq!(report.frontier.as_ref().map(|f| f.points.len()), Some(3));
        assert_eq!(report.simulation.as_ref().map(|s| s.results.len()), Some(100));
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_same_seed_same_report() {
        let service = AnalyticsService::new(quick_engine(300));
        let a = service.analyze(mock_request(2)).await.unwrap();
        let b = service.analyze(mock_request(2)).await.unwrap();
        assert_eq!(a.optimization, b.optimization);
        assert_eq!(a.simulation, b.simulation);
    }

    #[tokio::test]
    async fn test_timeout_cancels() {
        let service = AnalyticsService::new(quick_engine(5_000_000)).with_timeout(Duration::from_millis(1));
        let mut request = mock_request(3);
        request.options.frontier = false;
        request.options.simulation = false;
        let err = service.analyze(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_configuration_error_surfaces() {
        let service = AnalyticsService::new(quick_engine(10));
        let mut request = mock_request(4);
        request.input.portfolio.holdings[0].weight = 1.5;
        let err = service.analyze(request).await.unwrap_err();
        assert!(matches!(err, ServiceError::Analytics(ref e) if e.is_fatal_configuration()));
    }

    #[tokio::test]
    async fn test_min_weight_too_large_for_asset_count_is_fatal() {
        let service = AnalyticsService::new(quick_engine(50));
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let symbols: Vec<String> = (0..25).map(|i| format!("S{:02}", i)).collect();
        let closes: Vec<Vec<f64>> = (0..25)
            .map(|i| (0..10).map(|d| 100.0 + ((i * 7 + d * 3) % 11) as f64).collect())
            .collect();
        let assets: Vec<(&str, Option<&str>, &[f64], f64)> = symbols
            .iter()
            .zip(&closes)
            .map(|(s, c)| (s.as_str(), None, c.as_slice(), 1.0 / 25.0))
            .collect();
        let market: Vec<f64> = (0..10).map(|d| 1000.0 + d as f64).collect();
        let request = AnalysisRequest::new(input_from_closes("wide", start, &assets, &market));

        let err = service.analyze(request).await.unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Analytics(AnalyticsError::Configuration { ref message }) if message.contains("min_weight")
        ));
    }

    #[tokio::test]
    async fn test_data_failure_keeps_partial_report() {
        let service = AnalyticsService::new(quick_engine(100));
        let mut request = mock_request(7);
        request.options.frontier = false;
        request.options.simulation = false;
        let start = request.input.market.prices[0].date;
        request.input.portfolio.holdings.push(crate::data::Holding {
            asset: AssetSeries::from_closes("THIN", None, start, &[10.0]),
            weight: 0.0,
        });
        let jpm = request.input.portfolio.holdings[2].asset.symbol.clone();
        request.weight_changes = vec![
            WeightTarget { symbol: "THIN".into(), weight: 0.1 },
            WeightTarget { symbol: jpm, weight: 0.3 },
        ];

        let report = service.analyze(request).await.unwrap();
        assert_eq!(report.symbols.len(), 5);
        assert!(report.metrics.volatility > 0.0);
        assert!(report.optimization.is_some());
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, "change THIN");
        assert!(report.failures[0].reason.contains("THIN"));
        assert_eq!(report.scenarios.len(), 1);
    }

    #[tokio::test]
    async fn test_time_limit_spans_whole_run() {
        let service = AnalyticsService::new(quick_engine(300));
        let mut request = mock_request(8);
        request.options.time_limit_ms = Some(0);
        let report = service.analyze(request).await.unwrap();
        let opt = report.optimization.unwrap();
        assert!(opt.truncated);
        assert_eq!(opt.trials_evaluated, 0);
        let frontier = report.frontier.unwrap();
        assert!(frontier.truncated);
        assert!(frontier.points.is_empty());
        let sim = report.simulation.unwrap();
        assert!(sim.truncated);
        assert!(sim.results.is_empty());
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_candidates_produce_scenarios() {
        let service = AnalyticsService::new(quick_engine(100));
        let mut request = mock_request(5);
        request.options.frontier = false;
        request.options.simulation = false;
        let market = request.input.market.clone();
        let mut rng = StdRng::seed_from_u64(6);
        request.candidates = vec![
            AssetSeries::mock_from_market("GLD", Some("Materials"), &market, -0.2, 0.01, &mut rng),
            AssetSeries::mock_from_market("NVDA", Some("Technology"), &market, 1.5, 0.02, &mut rng),
        ];
        let report = service.analyze(request).await.unwrap();
        assert_eq!(report.low_correlation.len(), 2);
        assert_eq!(report.low_correlation[0].symbol, "GLD");
        assert_eq!(report.sector_candidates.len(), 1);
        assert_eq!(report.scenarios.len(), 2);
    }

    #[test]
    fn test_request_json_defaults() {
        let json = r#"{
            "portfolio": {"name": "p", "holdings": [
                {"symbol": "A", "sector": "Tech", "weight": 1.0,
                 "prices": [{"date": "2024-01-02", "price": 10.0}, {"date": "2024-01-03", "price": 11.0}]}
            ]},
            "market": {"symbol": "SPX", "prices": [{"date": "2024-01-02", "price": 100.0}, {"date": "2024-01-03", "price": 101.0}]},
            "options": {"seed": 7, "strategy": "gradient-descent"}
        }"#;
        let req = AnalysisRequest::from_json_str(json).unwrap();
        assert_eq!(req.options.seed, 7);
        assert_eq!(req.options.strategy, OptimizerStrategy::GradientDescent);
        assert!(req.options.simulation);
        assert!(req.candidates.is_empty());
        assert_eq!(req.input.portfolio.holdings[0].asset.symbol, "A");
    }
}
