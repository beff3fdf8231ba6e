//! Portfolio risk and optimization analytics.
//!
//! Statistics over price histories, mean-variance weight optimization and
//! the efficient frontier, classical risk ratios, correlated Monte Carlo
//! simulation, and what-if scenarios, behind an [`engine::AnalyticsEngine`]
//! and an async [`service::AnalyticsService`].

pub mod budget;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod monte_carlo;
pub mod observer;
pub mod optimizer;
pub mod report;
pub mod risk;
pub mod scenario;
pub mod service;
pub mod stats;

pub use budget::{CancellationToken, RunBudget};
pub use config::EngineConfig;
pub use data::{AnalysisInput, AssetSeries, Holding, MarketSeries, PortfolioComposition, PricePoint};
pub use engine::{AnalysisContext, AnalyticsEngine};
pub use error::{AnalyticsError, Result};
pub use monte_carlo::{MonteCarloResult, MonteCarloSimulator};
pub use observer::{AnalyticsObserver, DegenerateInput, TracingObserver};
pub use optimizer::{
    EfficientFrontier, GradientDescentOptimizer, OptimizationResult, OptimizerStrategy, RandomSearchOptimizer,
    RiskTolerance, WeightOptimizer,
};
pub use risk::MetricsReport;
pub use service::{AnalysisReport, AnalysisRequest, AnalyticsService};
