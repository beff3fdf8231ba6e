//! Observability hook for the analytics core.
//!
//! The numeric code never logs directly when it substitutes a default for a
//! degenerate input; it reports a [`DegenerateInput`] to the injected observer.
//! [`TracingObserver`] forwards those reports to `tracing`.

use chrono::NaiveDate;
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Non-fatal data-quality findings. The engine always continues with a safe
/// default after reporting one of these.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum DegenerateInput {
    /// A price ≤ 0 (or non-finite) was removed before computing returns.
    DroppedPrice { symbol: String, index: usize, price: f64 },
    /// Two prices shared a date; the later one in the input was kept.
    DuplicateDate { symbol: String, date: NaiveDate },
    /// An asset was excluded because too few valid prices remained.
    ExcludedAsset { symbol: String, available: usize },
    /// A variance term was zero, so the dependent statistic used its default.
    ZeroVariance { context: String },
    /// Cholesky hit a negative diagonal residue and clamped it to zero.
    NonPositiveDefinite { row: usize, residue: f64 },
    /// Weights do not sum to 1 within tolerance.
    WeightSum { sum: f64 },
    /// A covariance entry was missing or non-finite and contributed nothing.
    MissingCovariance { row: usize, col: usize },
    /// `max_weight × N < 1`; the ceiling was raised to `1/N` for this run.
    InfeasibleCeiling { max_weight: f64, effective: f64 },
}

impl fmt::Display for DegenerateInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DroppedPrice { symbol, index, price } => {
                write!(f, "{}: dropped non-positive price {} at index {}", symbol, price, index)
            }
            Self::DuplicateDate { symbol, date } => {
                write!(f, "{}: duplicate price for {}, kept the last one", symbol, date)
            }
            Self::ExcludedAsset { symbol, available } => {
                write!(f, "{}: excluded, only {} valid price points", symbol, available)
            }
            Self::ZeroVariance { context } => write!(f, "zero variance in {}", context),
            Self::NonPositiveDefinite { row, residue } => write!(
                f,
                "covariance not positive definite at row {} (residue {:.3e}), clamped to 0",
                row, residue
            ),
            Self::WeightSum { sum } => write!(f, "weights sum to {:.6}, expected 1.0", sum),
            Self::MissingCovariance { row, col } => {
                write!(f, "covariance entry [{}][{}] missing, treated as 0", row, col)
            }
            Self::InfeasibleCeiling { max_weight, effective } => write!(
                f,
                "max_weight {} cannot reach a full allocation, using {:.4}",
                max_weight, effective
            ),
        }
    }
}

/// Long-running stages that report progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Stage {
    Optimization,
    Frontier,
    Simulation,
}

pub trait AnalyticsObserver: Send + Sync {
    fn degenerate_input(&self, finding: &DegenerateInput);

    fn progress(&self, _stage: Stage, _completed: usize, _total: usize) {}
}

/// Default observer: one `warn!` per finding, progress at debug level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl AnalyticsObserver for TracingObserver {
    fn degenerate_input(&self, finding: &DegenerateInput) {
        warn!("Degenerate input: {}", finding);
    }

    fn progress(&self, stage: Stage, completed: usize, total: usize) {
        debug!("{:?}: {}/{}", stage, completed, total);
    }
}

/// Keeps every finding in memory. Useful for callers that attach warnings to
/// a response, and for tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    findings: Mutex<Vec<DegenerateInput>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn findings(&self) -> Vec<DegenerateInput> {
        self.findings
            .lock()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl AnalyticsObserver for RecordingObserver {
    fn degenerate_input(&self, finding: &DegenerateInput) {
        match self.findings.lock() {
            Ok(mut g) => g.push(finding.clone()),
            Err(poisoned) => poisoned.into_inner().push(finding.clone()),
        }
    }
}
