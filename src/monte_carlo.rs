//! Monte Carlo simulation of correlated portfolio paths.
//!
//! Daily asset returns are drawn as `μ + L·z`, where `L` is the Cholesky
//! factor of the daily covariance and `z` a vector of independent standard
//! normals. Paths run in fixed-size rayon batches, each with its own seeded
//! RNG, so results depend only on the caller's seed.

use crate::budget::{BudgetState, RunBudget};
use crate::config::SimulationSettings;
use crate::error::{AnalyticsError, Result};
use crate::observer::{AnalyticsObserver, DegenerateInput, Stage};
use crate::risk;
use crate::stats::{self, CovarianceMatrix, Periodicity};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::Distribution;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

// ──────────────────────────────────────────────────────────────────────────────
// Cholesky
// ──────────────────────────────────────────────────────────────────────────────

/// Lower-triangular `L` with `L·Lᵗ ≈ Σ`.
#[derive(Clone, Debug, PartialEq)]
pub struct CholeskyFactor {
    pub lower: Vec<Vec<f64>>,
    /// Rows whose diagonal residue was negative and clamped to 0, with the
    /// residue found.
    pub clamped_rows: Vec<(usize, f64)>,
    /// Lower-triangle entries that were non-finite and read as 0.
    pub missing: Vec<(usize, usize)>,
}

impl CholeskyFactor {
    /// `L·z`, using only the lower triangle.
    pub fn correlate(&self, z: &[f64], out: &mut [f64]) {
        for (i, row) in self.lower.iter().enumerate() {
            out[i] = row.iter().take(i + 1).zip(z).map(|(l, zj)| l * zj).sum();
        }
    }
}

/// Cholesky–Banachiewicz. Negative diagonal residues are clamped to zero
/// before the square root; columns with a zero pivot stay zero below it.
/// Non-finite entries count as 0.
pub fn cholesky(covariance: &CovarianceMatrix) -> CholeskyFactor {
    let a = covariance.rows();
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    let mut clamped_rows = Vec::new();
    let mut missing = Vec::new();

    for i in 0..n {
        for j in 0..=i {
            let entry = a[i][j];
            let entry = if entry.is_finite() {
                entry
            } else {
                missing.push((i, j));
                0.0
            };
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let residue = entry - sum;
                if residue < 0.0 {
                    clamped_rows.push((i, residue));
                }
                l[i][j] = residue.max(0.0).sqrt();
            } else if l[j][j] > 0.0 {
                l[i][j] = (entry - sum) / l[j][j];
            }
        }
    }

    CholeskyFactor {
        lower: l,
        clamped_rows,
        missing,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Normal sampler
// ──────────────────────────────────────────────────────────────────────────────

/// Standard normal via the Box–Muller transform (cosine branch).
#[derive(Clone, Copy, Debug, Default)]
pub struct BoxMuller;

impl Distribution<f64> for BoxMuller {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        // gen() is in [0, 1); flip it so ln never sees 0.
        let u = 1.0 - rng.r#gen::<f64>();
        let v = rng.r#gen::<f64>();
        (-2.0 * u.ln()).sqrt() * (2.0 * PI * v).cos()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Inputs & Results
// ──────────────────────────────────────────────────────────────────────────────

/// Daily means, daily covariance and weights for one simulation.
#[derive(Clone, Debug, PartialEq)]
pub struct SimulationInputs {
    pub mean_returns: Vec<f64>,
    pub covariance: CovarianceMatrix,
    pub weights: Vec<f64>,
}

impl SimulationInputs {
    /// `covariance` is converted to daily units if it is annual.
    pub fn new(mean_returns: Vec<f64>, covariance: CovarianceMatrix, weights: Vec<f64>, trading_days: usize) -> Result<Self> {
        let n = weights.len();
        if mean_returns.len() != n {
            return Err(AnalyticsError::dimension_mismatch("mean returns", n, mean_returns.len()));
        }
        if covariance.size() != n {
            return Err(AnalyticsError::dimension_mismatch("covariance", n, covariance.size()));
        }
        Ok(Self {
            mean_returns,
            covariance: covariance.daily(trading_days),
            weights,
        })
    }

    /// Means and covariance estimated from historical daily returns.
    pub fn historical(asset_returns: &[Vec<f64>], weights: &[f64]) -> Result<Self> {
        let means = asset_returns.iter().map(|r| stats::mean(r)).collect();
        Self::new(means, stats::covariance_matrix(asset_returns), weights.to_vec(), 1)
    }

    /// Zero means and `Σᵢⱼ = ρᵢⱼ·vol²` from a correlation matrix alone.
    pub fn synthetic(correlation: &[Vec<f64>], weights: &[f64], daily_vol: f64) -> Result<Self> {
        let n = weights.len();
        let covariance = CovarianceMatrix::from_correlation(correlation, &vec![daily_vol; n], Periodicity::Daily)?;
        Self::new(vec![0.0; n], covariance, weights.to_vec(), 1)
    }
}

/// Distribution summary of terminal returns. Percentiles, median and VaR
/// read the sorted sample at `floor(n·p)`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub mean: f64,
    pub median: f64,
    pub volatility: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
    pub var95: f64,
    pub var99: f64,
    pub cvar95: f64,
}

impl SimulationSummary {
    pub fn from_results(results: &[f64]) -> Self {
        if results.is_empty() {
            return Self::default();
        }
        let mut sorted = results.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let at = |p: f64| sorted[((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1)];

        Self {
            mean: stats::mean(results),
            median: at(0.5),
            volatility: stats::std_dev(results),
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p5: at(0.05),
            p25: at(0.25),
            p75: at(0.75),
            p95: at(0.95),
            var95: risk::value_at_risk(results, 0.95),
            var99: risk::value_at_risk(results, 0.99),
            cvar95: risk::cvar(results, 0.95),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloResult {
    /// Terminal return `Π(1 + rₜ) − 1` of each path, in path order.
    pub results: Vec<f64>,
    pub summary: SimulationSummary,
    pub horizon_days: usize,
    pub iterations_requested: usize,
    /// A deadline stopped the run; `results` holds the completed paths only.
    pub truncated: bool,
}

// ──────────────────────────────────────────────────────────────────────────────
// Simulator
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct MonteCarloSimulator {
    settings: SimulationSettings,
}

impl MonteCarloSimulator {
    pub fn new(settings: SimulationSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    /// One path's terminal return.
    fn simulate_path(&self, inputs: &SimulationInputs, chol: &CholeskyFactor, rng: &mut StdRng, z: &mut [f64], correlated: &mut [f64]) -> f64 {
        let mut value = 1.0;
        for _ in 0..self.settings.horizon_days {
            for zi in z.iter_mut() {
                *zi = BoxMuller.sample(rng);
            }
            chol.correlate(z, correlated);
            let daily: f64 = correlated
                .iter()
                .zip(&inputs.mean_returns)
                .zip(&inputs.weights)
                .map(|((c, mu), w)| (mu + c) * w)
                .sum();
            value *= 1.0 + daily;
        }
        value - 1.0
    }

    pub fn run(
        &self,
        inputs: &SimulationInputs,
        rng: &mut dyn RngCore,
        budget: &RunBudget,
        observer: &dyn AnalyticsObserver,
    ) -> Result<MonteCarloResult> {
        let iterations = self.settings.iterations;
        let horizon_days = self.settings.horizon_days;
        let n = inputs.weights.len();
        if n == 0 {
            return Ok(MonteCarloResult {
                horizon_days,
                iterations_requested: iterations,
                ..MonteCarloResult::default()
            });
        }

        let chol = cholesky(&inputs.covariance);
        for &(row, col) in &chol.missing {
            observer.degenerate_input(&DegenerateInput::MissingCovariance { row, col });
        }
        for &(row, residue) in &chol.clamped_rows {
            observer.degenerate_input(&DegenerateInput::NonPositiveDefinite { row, residue });
        }

        let batch_size = self.settings.batch_size;
        let num_batches = iterations.div_ceil(batch_size);
        let base_seed: u64 = rng.r#gen();
        debug!(
            "Monte Carlo: {} assets, {} paths x {} days in {} batches",
            n, iterations, horizon_days, num_batches
        );

        let completed = AtomicUsize::new(0);
        let batches: Vec<Option<Vec<f64>>> = (0..num_batches)
            .into_par_iter()
            .map(|b| {
                if budget.state() != BudgetState::Continue {
                    return None;
                }
                let mut batch_rng = StdRng::seed_from_u64(base_seed.wrapping_add(b as u64));
                let start = b * batch_size;
                let end = (start + batch_size).min(iterations);
                let mut z = vec![0.0; n];
                let mut correlated = vec![0.0; n];
                let paths: Vec<f64> = (start..end)
                    .map(|_| self.simulate_path(inputs, &chol, &mut batch_rng, &mut z, &mut correlated))
                    .collect();
                let done = completed.fetch_add(paths.len(), Ordering::Relaxed) + paths.len();
                observer.progress(Stage::Simulation, done, iterations);
                Some(paths)
            })
            .collect();

        let skipped = batches.iter().any(Option::is_none);
        if skipped && budget.token().is_cancelled() {
            return Err(AnalyticsError::Cancelled {
                completed: completed.load(Ordering::Relaxed),
                requested: iterations,
            });
        }

        let results: Vec<f64> = batches.into_iter().flatten().flatten().collect();
        if skipped {
            info!("Monte Carlo deadline reached after {}/{} paths", results.len(), iterations);
        }

        Ok(MonteCarloResult {
            summary: SimulationSummary::from_results(&results),
            results,
            horizon_days,
            iterations_requested: iterations,
            truncated: skipped,
        })
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::CancellationToken;
    use crate::observer::RecordingObserver;
    use std::time::Duration;

    fn small_settings(iterations: usize) -> SimulationSettings {
        SimulationSettings {
            iterations,
            horizon_days: 21,
            batch_size: 50,
            ..SimulationSettings::default()
        }
    }

    fn two_asset_inputs() -> SimulationInputs {
        let corr = vec![vec![1.0, 0.3], vec![0.3, 1.0]];
        SimulationInputs::synthetic(&corr, &[0.6, 0.4], 0.02).unwrap()
    }

    #[test]
    fn test_cholesky_reconstructs_matrix() {
        let cov = CovarianceMatrix::from_rows(
            vec![vec![4.0, 2.0, 0.6], vec![2.0, 2.0, 0.5], vec![0.6, 0.5, 3.0]],
            Periodicity::Daily,
        )
        .unwrap();
        let f = cholesky(&cov);
        assert!(f.clamped_rows.is_empty());
        for i in 0..3 {
            for j in 0..3 {
                let v: f64 = (0..3).map(|k| f.lower[i][k] * f.lower[j][k]).sum();
                assert!((v - cov.get(i, j).unwrap()).abs() < 1e-12);
            }
            for j in (i + 1)..3 {
                assert_eq!(f.lower[i][j], 0.0);
            }
        }
    }

    #[test]
    fn test_cholesky_clamps_non_positive_definite() {
        let cov = CovarianceMatrix::from_rows(vec![vec![1.0, 2.0], vec![2.0, 1.0]], Periodicity::Daily).unwrap();
        let f = cholesky(&cov);
        assert_eq!(f.clamped_rows.len(), 1);
        assert_eq!(f.clamped_rows[0].0, 1);
        assert_eq!(f.lower[1][1], 0.0);
        assert!(f.lower.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_non_finite_covariance_is_reported_and_ignored() {
        let cov = CovarianceMatrix::from_rows(
            vec![vec![0.04, f64::NAN], vec![f64::NAN, 0.09]],
            Periodicity::Annual,
        )
        .unwrap();
        let inputs = SimulationInputs::new(vec![0.0004, 0.0002], cov, vec![0.5, 0.5], 252).unwrap();
        let f = cholesky(&inputs.covariance);
        assert_eq!(f.missing, vec![(1, 0)]);
        assert_eq!(f.lower[1][0], 0.0);

        let obs = RecordingObserver::new();
        let sim = MonteCarloSimulator::new(small_settings(100)).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let r = sim.run(&inputs, &mut rng, &RunBudget::unlimited(), &obs).unwrap();
        assert!(r.results.iter().all(|v| v.is_finite()));
        assert!(obs
            .findings()
            .contains(&DegenerateInput::MissingCovariance { row: 1, col: 0 }));
    }

    #[test]
    fn test_box_muller_moments() {
        let mut rng = StdRng::seed_from_u64(3);
        let draws: Vec<f64> = (0..20_000).map(|_| BoxMuller.sample(&mut rng)).collect();
        assert!(draws.iter().all(|d| d.is_finite()));
        assert!(stats::mean(&draws).abs() < 0.05);
        assert!((stats::std_dev(&draws) - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_same_seed_same_results() {
        let sim = MonteCarloSimulator::new(small_settings(300)).unwrap();
        let inputs = two_asset_inputs();
        let obs = RecordingObserver::new();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            sim.run(&inputs, &mut rng, &RunBudget::unlimited(), &obs).unwrap()
        };
        let a = run(7);
        let b = run(7);
        assert_eq!(a.results, b.results);
        assert_eq!(a.results.len(), 300);
        assert_ne!(a.results, run(8).results);
    }

    #[test]
    fn test_summary_ordering() {
        let sim = MonteCarloSimulator::new(small_settings(500)).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let r = sim
            .run(&two_asset_inputs(), &mut rng, &RunBudget::unlimited(), &RecordingObserver::new())
            .unwrap();
        let s = &r.summary;
        assert!(s.min <= s.p5 && s.p5 <= s.p25 && s.p25 <= s.median);
        assert!(s.median <= s.p75 && s.p75 <= s.p95 && s.p95 <= s.max);
        assert!(s.var99 <= s.var95);
        assert!(s.cvar95 <= s.var95);
        assert!(s.volatility > 0.0);
        assert!(!r.truncated);
    }

    #[test]
    fn test_summary_matches_sorted_indices() {
        let results: Vec<f64> = (0..100).map(|i| i as f64 / 100.0).collect();
        let s = SimulationSummary::from_results(&results);
        assert_eq!(s.median, 0.50);
        assert_eq!(s.p5, 0.05);
        assert_eq!(s.p95, 0.95);
        assert_eq!(s.min, 0.0);
        assert_eq!(s.max, 0.99);
        assert_eq!(s.var95, 0.05);
        assert_eq!(SimulationSummary::from_results(&[]), SimulationSummary::default());
    }

    #[test]
    fn test_zero_covariance_is_deterministic_growth() {
        let cov = CovarianceMatrix::from_rows(vec![vec![0.0]], Periodicity::Daily).unwrap();
        let inputs = SimulationInputs::new(vec![0.001], cov, vec![1.0], 252).unwrap();
        let sim = MonteCarloSimulator::new(small_settings(10)).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let r = sim.run(&inputs, &mut rng, &RunBudget::unlimited(), &RecordingObserver::new()).unwrap();
        let expected = 1.001f64.powi(21) - 1.0;
        assert!(r.results.iter().all(|v| (v - expected).abs() < 1e-12));
    }

    #[test]
    fn test_non_positive_definite_reported() {
        let corr = vec![vec![1.0, 1.5], vec![1.5, 1.0]];
        let inputs = SimulationInputs::synthetic(&corr, &[0.5, 0.5], 0.02).unwrap();
        let sim = MonteCarloSimulator::new(small_settings(20)).unwrap();
        let obs = RecordingObserver::new();
        let mut rng = StdRng::seed_from_u64(0);
        let r = sim.run(&inputs, &mut rng, &RunBudget::unlimited(), &obs).unwrap();
        assert!(r.results.iter().all(|v| v.is_finite()));
        assert!(obs
            .findings()
            .iter()
            .any(|f| matches!(f, DegenerateInput::NonPositiveDefinite { row: 1, .. })));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let corr = vec![vec![1.0]];
        assert!(SimulationInputs::synthetic(&corr, &[0.5, 0.5], 0.02).is_err());
        let cov = CovarianceMatrix::from_rows(vec![vec![0.1]], Periodicity::Daily).unwrap();
        assert!(SimulationInputs::new(vec![0.0, 0.0], cov, vec![0.5, 0.5], 252).is_err());
    }

    #[test]
    fn test_budget_cancel_and_deadline() {
        let sim = MonteCarloSimulator::new(small_settings(200)).unwrap();
        let inputs = two_asset_inputs();
        let token = CancellationToken::new();
        token.cancel();
        let mut rng = StdRng::seed_from_u64(0);
        let err = sim
            .run(&inputs, &mut rng, &RunBudget::with_token(token), &RecordingObserver::new())
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::Cancelled { requested: 200, .. }));

        let expired = RunBudget::unlimited().with_time_limit(Duration::ZERO);
        let r = sim.run(&inputs, &mut rng, &expired, &RecordingObserver::new()).unwrap();
        assert!(r.truncated);
        assert!(r.results.is_empty());
    }

    #[test]
    fn test_historical_inputs_use_sample_statistics() {
        let a = vec![0.01, -0.02, 0.015, 0.0];
        let b = vec![0.0, 0.01, -0.01, 0.02];
        let inputs = SimulationInputs::historical(&[a.clone(), b.clone()], &[0.5, 0.5]).unwrap();
        assert!((inputs.mean_returns[0] - stats::mean(&a)).abs() < 1e-15);
        assert!((inputs.covariance.get(0, 1).unwrap() - stats::covariance(&a, &b)).abs() < 1e-15);
        assert_eq!(inputs.covariance.periodicity(), Periodicity::Daily);
    }
}
