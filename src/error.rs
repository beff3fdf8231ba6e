use thiserror::Error;

/// Result type alias for analytics operations.
pub type Result<T> = std::result::Result<T, AnalyticsError>;

/// Failures the analytics core surfaces to its caller.
///
/// Data-quality problems that have a documented default (zero variance,
/// dropped prices, non-positive-definite covariance) are not errors; they are
/// reported through [`crate::observer::AnalyticsObserver`] instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    /// Fewer price points than a return computation needs.
    #[error("Insufficient data for {context}: need at least {required} points, got {available}")]
    InsufficientData {
        context: String,
        required: usize,
        available: usize,
    },

    /// Invalid bounds or parameters, detected before any computation runs.
    #[error("Invalid configuration: {message}")]
    Configuration { message: String },

    /// Vector/matrix sizes that do not line up.
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// The caller's cancellation token fired between batches.
    #[error("Computation cancelled after {completed} of {requested} iterations")]
    Cancelled { completed: usize, requested: usize },
}

impl AnalyticsError {
    pub fn insufficient_data(context: impl Into<String>, required: usize, available: usize) -> Self {
        Self::InsufficientData {
            context: context.into(),
            required,
            available,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn dimension_mismatch(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// True for errors caused by the caller's inputs rather than by the data.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. } | Self::DimensionMismatch { .. })
    }
}
