use crate::error::{AnalyticsError, Result};
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

// ──────────────────────────────────────────────────────────────────────────────
// Defaults
// ──────────────────────────────────────────────────────────────────────────────

/// Annual risk-free rate (approx. Fed funds) used by every ratio in the engine.
pub const RISK_FREE_RATE: f64 = 0.0475;

/// Annual trading days for annualization.
pub const TRADING_DAYS: usize = 252;

/// Minimum weight every asset receives in optimizer candidates.
pub const MIN_SINGLE_WEIGHT: f64 = 0.05;

/// Maximum weight any single asset can take (0.0–1.0).
pub const MAX_SINGLE_WEIGHT: f64 = 0.40;

/// Number of random portfolios sampled per optimizer run.
pub const OPTIMIZER_TRIALS: usize = 10_000;

/// Trials / paths handled by one worker task before the budget is re-checked.
pub const BATCH_SIZE: usize = 256;

/// Number of Monte Carlo paths per simulation.
pub const MC_ITERATIONS: usize = 10_000;

/// Forecast horizon in trading days for Monte Carlo.
pub const MC_HORIZON_DAYS: usize = 252;

/// Daily std-dev assumed when only a correlation matrix is available.
pub const SYNTHETIC_DAILY_VOL: f64 = 0.02;

/// CVaR / VaR confidence used by the metrics report.
pub const CVAR_CONFIDENCE: f64 = 0.95;

/// Number of target-return steps traced on the efficient frontier.
pub const FRONTIER_STEPS: usize = 20;

/// Allowed deviation of the weight sum from 1.0 before a warning is raised.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

// ──────────────────────────────────────────────────────────────────────────────
// Settings
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    pub min_weight: f64,
    pub max_weight: f64,
    pub trials: usize,
    pub batch_size: usize,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            min_weight: MIN_SINGLE_WEIGHT,
            max_weight: MAX_SINGLE_WEIGHT,
            trials: OPTIMIZER_TRIALS,
            batch_size: BATCH_SIZE,
        }
    }
}

impl OptimizerSettings {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_weight) {
            return Err(AnalyticsError::configuration(format!(
                "min_weight must be within [0, 1], got {}",
                self.min_weight
            )));
        }
        if !(self.max_weight > 0.0 && self.max_weight <= 1.0) {
            return Err(AnalyticsError::configuration(format!(
                "max_weight must be within (0, 1], got {}",
                self.max_weight
            )));
        }
        if self.max_weight < self.min_weight {
            return Err(AnalyticsError::configuration(format!(
                "max_weight ({}) < min_weight ({})",
                self.max_weight, self.min_weight
            )));
        }
        if self.trials == 0 || self.batch_size == 0 {
            return Err(AnalyticsError::configuration(
                "optimizer trials and batch_size must be > 0",
            ));
        }
        Ok(())
    }

    /// Bounds that depend on the number of assets being optimized.
    pub fn validate_for_assets(&self, n: usize) -> Result<()> {
        self.validate()?;
        if self.min_weight * n as f64 > 1.0 + 1e-12 {
            return Err(AnalyticsError::configuration(format!(
                "min_weight × assets = {} × {} exceeds 1",
                self.min_weight, n
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationSettings {
    pub iterations: usize,
    pub horizon_days: usize,
    pub batch_size: usize,
    pub synthetic_daily_vol: f64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            iterations: MC_ITERATIONS,
            horizon_days: MC_HORIZON_DAYS,
            batch_size: BATCH_SIZE,
            synthetic_daily_vol: SYNTHETIC_DAILY_VOL,
        }
    }
}

impl SimulationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.iterations == 0 || self.horizon_days == 0 || self.batch_size == 0 {
            return Err(AnalyticsError::configuration(
                "Monte Carlo iterations, horizon_days and batch_size must be > 0",
            ));
        }
        if !self.synthetic_daily_vol.is_finite() || self.synthetic_daily_vol < 0.0 {
            return Err(AnalyticsError::configuration(format!(
                "synthetic_daily_vol must be a non-negative number, got {}",
                self.synthetic_daily_vol
            )));
        }
        Ok(())
    }
}

/// Process-wide engine configuration. Set once at startup, read-only afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub risk_free_rate: f64,
    pub trading_days: usize,
    pub cvar_confidence: f64,
    pub frontier_steps: usize,
    pub weight_sum_tolerance: f64,
    pub optimizer: OptimizerSettings,
    pub simulation: SimulationSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: RISK_FREE_RATE,
            trading_days: TRADING_DAYS,
            cvar_confidence: CVAR_CONFIDENCE,
            frontier_steps: FRONTIER_STEPS,
            weight_sum_tolerance: WEIGHT_SUM_TOLERANCE,
            optimizer: OptimizerSettings::default(),
            simulation: SimulationSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `PORTFOLIO_*` environment variables.
    ///
    /// Unparseable values fall back to the default with a warning; the result
    /// still has to pass [`EngineConfig::validate`].
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_f64("PORTFOLIO_RISK_FREE_RATE") {
            cfg.risk_free_rate = v;
        }
        if let Some(v) = env_usize("PORTFOLIO_TRADING_DAYS") {
            cfg.trading_days = v;
        }
        if let Some(v) = env_f64("PORTFOLIO_CVAR_CONFIDENCE") {
            cfg.cvar_confidence = v;
        }
        if let Some(v) = env_usize("PORTFOLIO_FRONTIER_STEPS") {
            cfg.frontier_steps = v;
        }
        if let Some(v) = env_f64("PORTFOLIO_MIN_WEIGHT") {
            cfg.optimizer.min_weight = v;
        }
        if let Some(v) = env_f64("PORTFOLIO_MAX_WEIGHT") {
            cfg.optimizer.max_weight = v;
        }
        if let Some(v) = env_usize("PORTFOLIO_OPTIMIZER_TRIALS") {
            cfg.optimizer.trials = v;
        }
        if let Some(v) = env_usize("PORTFOLIO_MC_ITERATIONS") {
            cfg.simulation.iterations = v;
        }
        if let Some(v) = env_usize("PORTFOLIO_MC_HORIZON_DAYS") {
            cfg.simulation.horizon_days = v;
        }
        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if !self.risk_free_rate.is_finite() {
            return Err(AnalyticsError::configuration(format!(
                "risk_free_rate must be finite, got {}",
                self.risk_free_rate
            )));
        }
        if self.trading_days == 0 {
            return Err(AnalyticsError::configuration("trading_days must be > 0"));
        }
        if !(self.cvar_confidence > 0.0 && self.cvar_confidence < 1.0) {
            return Err(AnalyticsError::configuration(format!(
                "cvar_confidence must be within (0, 1), got {}",
                self.cvar_confidence
            )));
        }
        if self.frontier_steps == 0 {
            return Err(AnalyticsError::configuration("frontier_steps must be > 0"));
        }
        if !(self.weight_sum_tolerance >= 0.0) {
            return Err(AnalyticsError::configuration(
                "weight_sum_tolerance must be non-negative",
            ));
        }
        self.optimizer.validate()?;
        self.simulation.validate()
    }

    /// Risk-free rate expressed per trading day, compounding-consistent with
    /// `(1 + daily)^trading_days − 1 = annual`.
    pub fn daily_risk_free_rate(&self) -> f64 {
        (1.0 + self.risk_free_rate).powf(1.0 / self.trading_days as f64) - 1.0
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_f64(name: &str) -> Option<f64> {
    let raw = env_value(name)?;
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            warn!("Ignoring {}={} (not a finite number); using default", name, raw);
            None
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    let raw = env_value(name)?;
    match raw.parse::<usize>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {}={} (not a non-negative integer); using default", name, raw);
            None
        }
    }
}

/// Sizes the global rayon pool used by optimizer trials and Monte Carlo paths.
pub fn init_cpu_parallelism(threads: Option<usize>) {
    RAYON_INIT.get_or_init(|| {
        let num_threads = threads.unwrap_or_else(num_cpus::get).max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!("Initialized Rayon thread pool with {} threads", num_threads),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}
