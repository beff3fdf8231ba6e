//! Mean-variance weight optimization.
//!
//! The primary strategy is a constrained random search. It is a heuristic:
//! results are approximate and only as good as the number of trials allows.
//! A projected gradient descent is available as an alternative behind the
//! same [`WeightOptimizer`] trait.

use crate::budget::{BudgetState, RunBudget};
use crate::config::OptimizerSettings;
use crate::error::{AnalyticsError, Result};
use crate::observer::{AnalyticsObserver, DegenerateInput, Stage};
use crate::risk;
use crate::stats::CovarianceMatrix;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

// ──────────────────────────────────────────────────────────────────────────────
// Configuration
// ──────────────────────────────────────────────────────────────────────────────

/// Gradient descent iterations.
pub const GD_ITERATIONS: usize = 1000;

/// Gradient descent step size.
pub const GD_LEARNING_RATE: f64 = 0.001;

/// Iterations between budget checks in gradient descent.
const GD_BUDGET_CHECK_EVERY: usize = 100;

const BOUND_EPS: f64 = 1e-12;

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// How much risk the caller accepts, as a value in [0, 1].
///
/// Random search weights risk by `1 − value`: `Low` penalises it fully and
/// `High` not at all. Gradient descent weights it by `1.5 − value`, so there
/// `Low` gives 1.5 and `High` still gives 0.5.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum RiskTolerance {
    Low,
    #[default]
    Medium,
    High,
    Custom(f64),
}

impl RiskTolerance {
    pub fn value(self) -> f64 {
        match self {
            Self::Low => 0.0,
            Self::Medium => 0.5,
            Self::High => 1.0,
            Self::Custom(v) => v,
        }
    }

    /// Risk weight in the random-search score.
    pub fn search_risk_weight(self) -> f64 {
        1.0 - self.value()
    }

    /// Risk weight in the gradient-descent objective.
    pub fn gradient_risk_weight(self) -> f64 {
        1.5 - self.value()
    }

    pub fn validate(self) -> Result<()> {
        let v = self.value();
        if !(0.0..=1.0).contains(&v) {
            return Err(AnalyticsError::configuration(format!(
                "risk tolerance must be within [0, 1], got {}",
                v
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RiskTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Custom(v) => write!(f, "{}", v),
        }
    }
}

impl FromStr for RiskTolerance {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        let tolerance = match s.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            other => other
                .parse::<f64>()
                .map(Self::Custom)
                .map_err(|_| AnalyticsError::configuration(format!("unknown risk tolerance '{}'", s)))?,
        };
        tolerance.validate()?;
        Ok(tolerance)
    }
}

/// Approximate optimum found by a [`WeightOptimizer`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub weights: Vec<f64>,
    pub expected_return: f64,
    /// Standard deviation of the portfolio return.
    pub risk: f64,
    pub sharpe: f64,
    pub score: f64,
    pub trials_evaluated: usize,
    /// A deadline stopped the run before every trial was evaluated.
    pub truncated: bool,
}

/// Inputs for one optimizer run. Expected returns, covariance and the
/// risk-free rate must share the same periodicity.
#[derive(Clone, Copy, Debug)]
pub struct OptimizationProblem<'a> {
    pub expected_returns: &'a [f64],
    pub covariance: &'a CovarianceMatrix,
    pub target_return: f64,
    pub risk_tolerance: RiskTolerance,
    pub risk_free_rate: f64,
    pub settings: &'a OptimizerSettings,
}

impl<'a> OptimizationProblem<'a> {
    pub fn num_assets(&self) -> usize {
        self.expected_returns.len()
    }

    pub fn with_target(self, target_return: f64) -> Self {
        Self { target_return, ..self }
    }

    pub fn with_tolerance(self, risk_tolerance: RiskTolerance) -> Self {
        Self { risk_tolerance, ..self }
    }

    /// Fatal checks, run before any trial.
    pub fn validate(&self) -> Result<()> {
        let n = self.num_assets();
        if self.covariance.size() != n {
            return Err(AnalyticsError::dimension_mismatch("covariance", n, self.covariance.size()));
        }
        if !self.target_return.is_finite() {
            return Err(AnalyticsError::configuration(format!(
                "target return must be finite, got {}",
                self.target_return
            )));
        }
        if !self.risk_free_rate.is_finite() {
            return Err(AnalyticsError::configuration("risk-free rate must be finite"));
        }
        self.risk_tolerance.validate()?;
        self.settings.validate_for_assets(n)
    }

    /// `max_weight`, raised to `1/N` when the configured ceiling cannot add
    /// up to a full allocation.
    fn effective_max_weight(&self, observer: &dyn AnalyticsObserver) -> f64 {
        let n = self.num_assets() as f64;
        let configured = self.settings.max_weight;
        if configured * n < 1.0 - BOUND_EPS {
            let effective = 1.0 / n;
            observer.degenerate_input(&DegenerateInput::InfeasibleCeiling {
                max_weight: configured,
                effective,
            });
            effective
        } else {
            configured
        }
    }

    fn report_missing_covariance(&self, observer: &dyn AnalyticsObserver) {
        for (i, row) in self.covariance.rows().iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                if !v.is_finite() {
                    observer.degenerate_input(&DegenerateInput::MissingCovariance { row: i, col: j });
                }
            }
        }
    }

    fn score(&self, weights: &[f64]) -> (f64, f64, f64) {
        let ret = portfolio_return(weights, self.expected_returns);
        let risk = portfolio_risk(weights, self.covariance);
        let concentration: f64 = weights.iter().map(|w| w * w).sum();
        let score = (ret - self.target_return).abs() + risk * self.risk_tolerance.search_risk_weight() + concentration;
        (score, ret, risk)
    }

    fn result(&self, weights: Vec<f64>, trials_evaluated: usize, truncated: bool) -> OptimizationResult {
        let (score, ret, risk) = self.score(&weights);
        OptimizationResult {
            sharpe: risk::sharpe_ratio(ret, risk, self.risk_free_rate),
            weights,
            expected_return: ret,
            risk,
            score,
            trials_evaluated,
            truncated,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Helpers
// ──────────────────────────────────────────────────────────────────────────────

pub fn portfolio_return(weights: &[f64], expected_returns: &[f64]) -> f64 {
    weights.iter().zip(expected_returns).map(|(w, r)| w * r).sum()
}

/// `wᵗΣw`. Missing or non-finite covariance entries contribute 0.
pub fn portfolio_variance(weights: &[f64], covariance: &CovarianceMatrix) -> f64 {
    let mut var = 0.0;
    for (i, wi) in weights.iter().enumerate() {
        for (j, wj) in weights.iter().enumerate() {
            let c = covariance.get(i, j).filter(|c| c.is_finite()).unwrap_or(0.0);
            var += wi * wj * c;
        }
    }
    var
}

/// `sqrt(max(0, wᵗΣw))`; never negative, never NaN for finite weights.
pub fn portfolio_risk(weights: &[f64], covariance: &CovarianceMatrix) -> f64 {
    let var = portfolio_variance(weights, covariance);
    if var.is_finite() { var.max(0.0).sqrt() } else { 0.0 }
}

/// One random allocation: every asset starts at `min_weight`, the remaining
/// mass is handed out asset by asset under `max_weight`, and the leftover
/// goes to the last asset. Any excess over `max_weight` on the last asset
/// spills to earlier assets that still have headroom.
pub fn random_candidate<R: Rng + ?Sized>(n: usize, min_weight: f64, max_weight: f64, rng: &mut R) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    let mut weights = vec![min_weight; n];
    let mut remaining = 1.0 - min_weight * n as f64;
    for w in weights.iter_mut().take(n - 1) {
        let cap = (max_weight - *w).min(remaining).max(0.0);
        let allocation = rng.r#gen::<f64>() * cap;
        *w += allocation;
        remaining -= allocation;
    }
    weights[n - 1] += remaining;

    let mut excess = weights[n - 1] - max_weight;
    if excess > BOUND_EPS {
        weights[n - 1] = max_weight;
        for w in weights.iter_mut().take(n - 1) {
            let room = (max_weight - *w).max(0.0);
            let add = room.min(excess);
            *w += add;
            excess -= add;
            if excess <= BOUND_EPS {
                break;
            }
        }
    }
    weights
}

/// Clamps into `[lo, hi]` and redistributes the difference to 1.0 evenly
/// over the assets that are not pinned at a bound.
pub fn project_to_bounds(weights: &[f64], lo: f64, hi: f64) -> Vec<f64> {
    let n = weights.len();
    let mut w: Vec<f64> = weights.iter().map(|v| v.clamp(lo, hi)).collect();
    for _ in 0..(2 * n + 1) {
        let diff = 1.0 - w.iter().sum::<f64>();
        if diff.abs() <= BOUND_EPS {
            break;
        }
        let free: Vec<usize> = (0..n)
            .filter(|&i| if diff > 0.0 { w[i] < hi - BOUND_EPS } else { w[i] > lo + BOUND_EPS })
            .collect();
        if free.is_empty() {
            break;
        }
        let share = diff / free.len() as f64;
        for i in free {
            w[i] = (w[i] + share).clamp(lo, hi);
        }
    }
    w
}

// ──────────────────────────────────────────────────────────────────────────────
// Strategies
// ──────────────────────────────────────────────────────────────────────────────

pub trait WeightOptimizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn optimize(
        &self,
        problem: &OptimizationProblem<'_>,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
        observer: &dyn AnalyticsObserver,
    ) -> Result<OptimizationResult>;
}

enum Prelude {
    Done(OptimizationResult),
    Bounds { lo: f64, hi: f64 },
}

/// Validation, trivial sizes and effective bounds shared by every strategy.
fn prelude(problem: &OptimizationProblem<'_>, observer: &dyn AnalyticsObserver) -> Result<Prelude> {
    let n = problem.num_assets();
    if n == 0 {
        return Ok(Prelude::Done(OptimizationResult::default()));
    }
    problem.validate()?;
    problem.report_missing_covariance(observer);
    if n == 1 {
        return Ok(Prelude::Done(problem.result(vec![1.0], 0, false)));
    }
    Ok(Prelude::Bounds {
        lo: problem.settings.min_weight,
        hi: problem.effective_max_weight(observer),
    })
}

struct BatchBest {
    trial: usize,
    score: f64,
    weights: Vec<f64>,
}

/// Scores `trials` random candidates in fixed-size rayon batches and keeps the
/// lowest score, earliest trial first on ties.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSearchOptimizer;

impl WeightOptimizer for RandomSearchOptimizer {
    fn name(&self) -> &'static str {
        "random-search"
    }

    fn optimize(
        &self,
        problem: &OptimizationProblem<'_>,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
        observer: &dyn AnalyticsObserver,
    ) -> Result<OptimizationResult> {
        let (lo, hi) = match prelude(problem, observer)? {
            Prelude::Done(result) => return Ok(result),
            Prelude::Bounds { lo, hi } => (lo, hi),
        };
        let n = problem.num_assets();
        let trials = problem.settings.trials;
        let batch_size = problem.settings.batch_size;
        let num_batches = trials.div_ceil(batch_size);
        let base_seed: u64 = rng.r#gen();

        debug!(
            "Random search: {} assets, {} trials in {} batches, bounds [{:.3}, {:.3}]",
            n, trials, num_batches, lo, hi
        );

        let completed = AtomicUsize::new(0);
        let batches: Vec<Option<BatchBest>> = (0..num_batches)
            .into_par_iter()
            .map(|b| {
                if budget.state() != BudgetState::Continue {
                    return None;
                }
                let mut batch_rng = StdRng::seed_from_u64(base_seed.wrapping_add(b as u64));
                let start = b * batch_size;
                let end = (start + batch_size).min(trials);
                let mut best: Option<BatchBest> = None;
                for trial in start..end {
                    let weights = random_candidate(n, lo, hi, &mut batch_rng);
                    let (score, _, _) = problem.score(&weights);
                    if best.as_ref().is_none_or(|b| score < b.score) {
                        best = Some(BatchBest { trial, score, weights });
                    }
                }
                let done = completed.fetch_add(end - start, Ordering::Relaxed) + (end - start);
                observer.progress(Stage::Optimization, done, trials);
                best
            })
            .collect();

        let evaluated = completed.load(Ordering::Relaxed);
        let skipped = batches.iter().any(Option::is_none);
        if skipped && budget.token().is_cancelled() {
            return Err(AnalyticsError::Cancelled {
                completed: evaluated,
                requested: trials,
            });
        }

        let best = batches.into_iter().flatten().fold(None::<BatchBest>, |acc, cand| match acc {
            Some(cur) if cur.score < cand.score || (cur.score == cand.score && cur.trial <= cand.trial) => Some(cur),
            _ => Some(cand),
        });

        let weights = match best {
            Some(b) => b.weights,
            None => vec![1.0 / n as f64; n],
        };
        if skipped {
            info!("Optimizer deadline reached after {}/{} trials", evaluated, trials);
        }
        Ok(problem.result(weights, evaluated, skipped))
    }
}

/// Projected gradient descent on
/// `m·wᵗΣw + (wᵗμ − target)²` with `m = 1.5 − tolerance`. Unlike random
/// search, `High` tolerance keeps a risk weight of 0.5.
#[derive(Clone, Copy, Debug)]
pub struct GradientDescentOptimizer {
    pub iterations: usize,
    pub learning_rate: f64,
}

impl Default for GradientDescentOptimizer {
    fn default() -> Self {
        Self {
            iterations: GD_ITERATIONS,
            learning_rate: GD_LEARNING_RATE,
        }
    }
}

impl GradientDescentOptimizer {
    fn gradients(&self, problem: &OptimizationProblem<'_>, weights: &[f64], risk_multiplier: f64) -> Vec<f64> {
        let current = portfolio_return(weights, problem.expected_returns);
        let return_gradient = 2.0 * (current - problem.target_return);
        (0..weights.len())
            .map(|i| {
                let risk_gradient: f64 = weights
                    .iter()
                    .enumerate()
                    .map(|(j, wj)| 2.0 * problem.covariance.get(i, j).filter(|c| c.is_finite()).unwrap_or(0.0) * wj)
                    .sum();
                risk_gradient * risk_multiplier + return_gradient * problem.expected_returns[i]
            })
            .collect()
    }
}

impl WeightOptimizer for GradientDescentOptimizer {
    fn name(&self) -> &'static str {
        "gradient-descent"
    }

    fn optimize(
        &self,
        problem: &OptimizationProblem<'_>,
        _rng: &mut dyn RngCore,
        budget: &RunBudget,
        observer: &dyn AnalyticsObserver,
    ) -> Result<OptimizationResult> {
        let (lo, hi) = match prelude(problem, observer)? {
            Prelude::Done(result) => return Ok(result),
            Prelude::Bounds { lo, hi } => (lo, hi),
        };
        let n = problem.num_assets();
        let risk_multiplier = problem.risk_tolerance.gradient_risk_weight();
        let mut weights = vec![1.0 / n as f64; n];
        let mut truncated = false;
        let mut done = 0;

        for iter in 0..self.iterations {
            if iter % GD_BUDGET_CHECK_EVERY == 0 {
                match budget.state() {
                    BudgetState::Continue => {}
                    BudgetState::Expired => {
                        truncated = true;
                        break;
                    }
                    BudgetState::Cancelled => {
                        return Err(AnalyticsError::Cancelled {
                            completed: iter,
                            requested: self.iterations,
                        });
                    }
                }
            }
            let grads = self.gradients(problem, &weights, risk_multiplier);
            for (w, g) in weights.iter_mut().zip(&grads) {
                *w = (*w - self.learning_rate * g).clamp(0.0, 1.0);
            }
            let sum: f64 = weights.iter().sum();
            if sum > BOUND_EPS {
                weights.iter_mut().for_each(|w| *w /= sum);
            } else {
                weights = vec![1.0 / n as f64; n];
            }
            done = iter + 1;
        }

        observer.progress(Stage::Optimization, done, self.iterations);
        Ok(problem.result(project_to_bounds(&weights, lo, hi), done, truncated))
    }
}

/// Selectable optimizer implementation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerStrategy {
    #[default]
    RandomSearch,
    GradientDescent,
}

impl OptimizerStrategy {
    pub fn build(self) -> Box<dyn WeightOptimizer> {
        match self {
            Self::RandomSearch => Box::new(RandomSearchOptimizer),
            Self::GradientDescent => Box::new(GradientDescentOptimizer::default()),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Efficient Frontier
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontierPoint {
    pub target_return: f64,
    pub achieved_return: f64,
    pub achieved_risk: f64,
    pub sharpe: f64,
    pub weights: Vec<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EfficientFrontier {
    pub points: Vec<EfficientFrontierPoint>,
    /// Where the caller's current weights sit.
    pub current: Option<EfficientFrontierPoint>,
    pub truncated: bool,
}

/// Runs the optimizer at `steps` evenly spaced targets from `min(μ)` towards
/// `max(μ)` (the top of the range itself is not included) with a low risk
/// tolerance.
pub fn efficient_frontier(
    optimizer: &dyn WeightOptimizer,
    problem: &OptimizationProblem<'_>,
    steps: usize,
    current_weights: Option<&[f64]>,
    rng: &mut dyn RngCore,
    budget: &RunBudget,
    observer: &dyn AnalyticsObserver,
) -> Result<EfficientFrontier> {
    let mu = problem.expected_returns;
    if mu.is_empty() {
        return Ok(EfficientFrontier::default());
    }
    let min_ret = mu.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ret = mu.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let base = problem.with_tolerance(RiskTolerance::Low);

    let mut frontier = EfficientFrontier::default();
    for i in 0..steps {
        match budget.state() {
            BudgetState::Continue => {}
            BudgetState::Expired => {
                frontier.truncated = true;
                break;
            }
            BudgetState::Cancelled => {
                return Err(AnalyticsError::Cancelled {
                    completed: i,
                    requested: steps,
                });
            }
        }
        let target = min_ret + (i as f64 / steps as f64) * (max_ret - min_ret);
        let result = optimizer.optimize(&base.with_target(target), rng, budget, observer)?;
        frontier.truncated |= result.truncated;
        frontier.points.push(EfficientFrontierPoint {
            target_return: target,
            achieved_return: result.expected_return,
            achieved_risk: result.risk,
            sharpe: result.sharpe,
            weights: result.weights,
        });
        observer.progress(Stage::Frontier, i + 1, steps);
    }

    frontier.current = current_weights.map(|w| {
        let ret = portfolio_return(w, mu);
        let risk = portfolio_risk(w, problem.covariance);
        EfficientFrontierPoint {
            target_return: ret,
            achieved_return: ret,
            achieved_risk: risk,
            sharpe: risk::sharpe_ratio(ret, risk, problem.risk_free_rate),
            weights: w.to_vec(),
        }
    });
    Ok(frontier)
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
