//! Descriptive statistics over return series.
//!
//! Every function here is pure. Degenerate inputs (too few points, zero
//! variance) produce the documented default instead of an error, except
//! [`returns`], which needs at least two prices.

use crate::error::{AnalyticsError, Result};
use serde::{Deserialize, Serialize};

/// Time unit of a return or covariance figure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Periodicity {
    Daily,
    Annual,
}

/// Simple period returns `(pᵢ − pᵢ₋₁) / pᵢ₋₁`.
pub fn returns(prices: &[f64]) -> Result<Vec<f64>> {
    if prices.len() < 2 {
        return Err(AnalyticsError::insufficient_data("returns", 2, prices.len()));
    }
    Ok(prices.windows(2).map(|w| (w[1] - w[0]) / w[0]).collect())
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance (n − 1). Zero for fewer than two points.
pub fn variance(values: &[f64]) -> f64 {
    covariance(values, values)
}

pub fn std_dev(values: &[f64]) -> f64 {
    variance(values).sqrt()
}

/// Sample covariance over the first `min(len₁, len₂)` points.
/// Returns 0.0 when either series has fewer than two points.
pub fn covariance(returns1: &[f64], returns2: &[f64]) -> f64 {
    let n = returns1.len().min(returns2.len());
    if n < 2 {
        return 0.0;
    }
    let (x, y) = (&returns1[..n], &returns2[..n]);
    let (mx, my) = (mean(x), mean(y));
    let sum: f64 = x.iter().zip(y).map(|(a, b)| (a - mx) * (b - my)).sum();
    sum / (n as f64 - 1.0)
}

/// Pearson correlation clamped to [-1, 1]; 0.0 when either side has zero
/// variance.
pub fn correlation(returns1: &[f64], returns2: &[f64]) -> f64 {
    let n = returns1.len().min(returns2.len());
    if n < 2 {
        return 0.0;
    }
    let (x, y) = (&returns1[..n], &returns2[..n]);
    let var_x = variance(x);
    let var_y = variance(y);
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    (covariance(x, y) / (var_x * var_y).sqrt()).clamp(-1.0, 1.0)
}

pub fn annualized_volatility(returns: &[f64], trading_days: usize) -> f64 {
    std_dev(returns) * (trading_days as f64).sqrt()
}

/// Mean period return.
pub fn expected_return(returns: &[f64]) -> f64 {
    mean(returns)
}

/// `(1 + mean_daily)^trading_days − 1`.
pub fn annualize_return(mean_daily: f64, trading_days: usize) -> f64 {
    (1.0 + mean_daily).powf(trading_days as f64) - 1.0
}

/// Inverse of [`annualize_return`].
pub fn deannualize_return(annual: f64, trading_days: usize) -> f64 {
    (1.0 + annual).max(0.0).powf(1.0 / trading_days as f64) - 1.0
}

/// Square, symmetric covariance matrix tagged with its periodicity so that
/// callers never mix daily and annual figures.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovarianceMatrix {
    values: Vec<Vec<f64>>,
    periodicity: Periodicity,
}

impl CovarianceMatrix {
    pub fn from_rows(values: Vec<Vec<f64>>, periodicity: Periodicity) -> Result<Self> {
        let n = values.len();
        if let Some(row) = values.iter().find(|r| r.len() != n) {
            return Err(AnalyticsError::dimension_mismatch("covariance row", n, row.len()));
        }
        Ok(Self { values, periodicity })
    }

    pub fn empty(periodicity: Periodicity) -> Self {
        Self {
            values: Vec::new(),
            periodicity,
        }
    }

    /// `Σᵢⱼ = ρᵢⱼ σᵢ σⱼ`.
    pub fn from_correlation(correlation: &[Vec<f64>], std_devs: &[f64], periodicity: Periodicity) -> Result<Self> {
        let n = std_devs.len();
        if correlation.len() != n {
            return Err(AnalyticsError::dimension_mismatch("correlation matrix", n, correlation.len()));
        }
        let values = correlation
            .iter()
            .enumerate()
            .map(|(i, row)| {
                if row.len() != n {
                    return Err(AnalyticsError::dimension_mismatch("correlation row", n, row.len()));
                }
                Ok(row.iter().enumerate().map(|(j, rho)| rho * std_devs[i] * std_devs[j]).collect())
            })
            .collect::<Result<Vec<Vec<f64>>>>()?;
        Ok(Self { values, periodicity })
    }

    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn periodicity(&self) -> Periodicity {
        self.periodicity
    }

    pub fn get(&self, i: usize, j: usize) -> Option<f64> {
        self.values.get(i).and_then(|row| row.get(j)).copied()
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.values
    }

    pub fn variances(&self) -> Vec<f64> {
        (0..self.size()).map(|i| self.values[i][i]).collect()
    }

    /// Same matrix expressed per year (×`trading_days` when daily).
    pub fn annualized(&self, trading_days: usize) -> Self {
        match self.periodicity {
            Periodicity::Annual => self.clone(),
            Periodicity::Daily => self.scaled(trading_days as f64, Periodicity::Annual),
        }
    }

    /// Same matrix expressed per trading day.
    pub fn daily(&self, trading_days: usize) -> Self {
        match self.periodicity {
            Periodicity::Daily => self.clone(),
            Periodicity::Annual => self.scaled(1.0 / trading_days as f64, Periodicity::Daily),
        }
    }

    fn scaled(&self, factor: f64, periodicity: Periodicity) -> Self {
        Self {
            values: self
                .values
                .iter()
                .map(|row| row.iter().map(|v| v * factor).collect())
                .collect(),
            periodicity,
        }
    }

    /// Correlation matrix implied by this covariance. Assets with zero
    /// variance get 0 everywhere, including the diagonal.
    pub fn to_correlation(&self) -> Vec<Vec<f64>> {
        let sd: Vec<f64> = self.variances().iter().map(|v| v.max(0.0).sqrt()).collect();
        (0..self.size())
            .map(|i| {
                (0..self.size())
                    .map(|j| {
                        let denom = sd[i] * sd[j];
                        if denom > 0.0 {
                            (self.values[i][j] / denom).clamp(-1.0, 1.0)
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect()
    }
}

/// Pairwise sample covariance of each return series, daily periodicity.
/// Entries are computed once for `j ≥ i` and mirrored.
pub fn covariance_matrix(series: &[Vec<f64>]) -> CovarianceMatrix {
    let n = series.len();
    let mut values = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = covariance(&series[i], &series[j]);
            values[i][j] = c;
            values[j][i] = c;
        }
    }
    CovarianceMatrix {
        values,
        periodicity: Periodicity::Daily,
    }
}

pub fn correlation_matrix(series: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = series.len();
    let mut values = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = correlation(&series[i], &series[j]);
            values[i][j] = c;
            values[j][i] = c;
        }
    }
    values
}

/// Mean of the pairwise correlations above the diagonal; 0 with fewer than
/// two series.
pub fn average_pairwise_correlation(series: &[Vec<f64>]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..series.len() {
        for j in (i + 1)..series.len() {
            total += correlation(&series[i], &series[j]);
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { total / count as f64 }
}
