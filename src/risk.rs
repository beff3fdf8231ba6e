//! Risk and performance ratios.
//!
//! Return-based tail measures (`cvar`, `value_at_risk`) keep the sign of the
//! returns: a loss is a negative number.

use crate::data::PortfolioComposition;
use crate::stats::{self, CovarianceMatrix};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Values at or below this are treated as zero in ratio denominators.
const DENOMINATOR_EPS: f64 = 1e-12;

/// `(return − rf) / risk`, or 0 when risk is zero.
pub fn sharpe_ratio(portfolio_return: f64, portfolio_risk: f64, risk_free_rate: f64) -> f64 {
    if !portfolio_risk.is_finite() || portfolio_risk.abs() <= DENOMINATOR_EPS {
        return 0.0;
    }
    (portfolio_return - risk_free_rate) / portfolio_risk
}

/// `(return − rf) / beta`, or 0 when beta is zero.
pub fn treynor_ratio(portfolio_return: f64, beta: f64, risk_free_rate: f64) -> f64 {
    if !beta.is_finite() || beta.abs() <= DENOMINATOR_EPS {
        return 0.0;
    }
    (portfolio_return - risk_free_rate) / beta
}

/// `cov(r, m) / var(m)`. Falls back to the market-neutral 1.0 when the market
/// has no variance or either series is too short.
pub fn beta(returns: &[f64], market_returns: &[f64]) -> f64 {
    let n = returns.len().min(market_returns.len());
    if n < 2 {
        return 1.0;
    }
    let market_var = stats::variance(&market_returns[..n]);
    if market_var <= DENOMINATOR_EPS * DENOMINATOR_EPS {
        return 1.0;
    }
    stats::covariance(&returns[..n], &market_returns[..n]) / market_var
}

/// Jensen's alpha: `return − (rf + beta·(market − rf))`.
pub fn alpha(portfolio_return: f64, beta: f64, market_return: f64, risk_free_rate: f64) -> f64 {
    portfolio_return - (risk_free_rate + beta * (market_return - risk_free_rate))
}

fn sorted_ascending(returns: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = returns.iter().copied().filter(|r| r.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Mean of the worst `floor((1 − confidence)·n)` returns. Zero when that
/// tail is empty.
pub fn cvar(returns: &[f64], confidence: f64) -> f64 {
    let sorted = sorted_ascending(returns);
    let cutoff = ((1.0 - confidence) * sorted.len() as f64).floor() as usize;
    if cutoff == 0 {
        return 0.0;
    }
    stats::mean(&sorted[..cutoff.min(sorted.len())])
}

/// The sorted return at index `floor((1 − confidence)·n)`. Zero for an empty
/// series.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    let sorted = sorted_ascending(returns);
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((1.0 - confidence) * sorted.len() as f64).floor() as usize;
    sorted[index.min(sorted.len() - 1)]
}

/// Std-dev of the period-by-period difference between portfolio and market.
pub fn tracking_error(portfolio_returns: &[f64], market_returns: &[f64]) -> f64 {
    let diffs: Vec<f64> = portfolio_returns
        .iter()
        .zip(market_returns)
        .map(|(p, m)| p - m)
        .collect();
    stats::std_dev(&diffs)
}

/// Largest peak-to-trough decline as a fraction of the peak.
pub fn max_drawdown(prices: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut max_dd: f64 = 0.0;
    for &price in prices {
        if !price.is_finite() {
            continue;
        }
        if price > peak {
            peak = price;
        }
        if peak > 0.0 {
            max_dd = max_dd.max((peak - price) / peak);
        }
    }
    max_dd
}

/// Herfindahl index over sector weights.
pub fn sector_concentration(portfolio: &PortfolioComposition) -> f64 {
    portfolio.sector_weights().values().map(|w| w * w).sum()
}

/// Geometric annualization: `(Π(1 + rᵢ))^(days / n) − 1`.
pub fn annualized_return(returns: &[f64], trading_days: usize) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
    if growth <= 0.0 {
        return -1.0;
    }
    growth.powf(trading_days as f64 / returns.len() as f64) - 1.0
}

/// `Π(1 + rᵢ) − 1`.
pub fn total_return(returns: &[f64]) -> f64 {
    returns.iter().map(|r| 1.0 + r).product::<f64>() - 1.0
}

/// Squared deviation of each asset's share of total risk from the equal
/// share `1/N`. Zero means every asset contributes the same risk.
pub fn risk_parity_score(weights: &[f64], covariance: &CovarianceMatrix) -> f64 {
    let n = weights.len().min(covariance.size());
    if n == 0 {
        return 0.0;
    }
    let contributions: Vec<f64> = (0..n)
        .map(|i| {
            let marginal: f64 = (0..n).map(|j| covariance.get(i, j).unwrap_or(0.0) * weights[j]).sum();
            weights[i] * marginal
        })
        .collect();
    let total: f64 = contributions.iter().sum();
    if total.abs() <= DENOMINATOR_EPS * DENOMINATOR_EPS {
        return 0.0;
    }
    let target = 1.0 / n as f64;
    contributions.iter().map(|rc| (rc / total - target).powi(2)).sum()
}

/// Weighted per-period portfolio returns over the shortest asset history.
pub fn portfolio_return_series(asset_returns: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    let len = asset_returns.iter().map(Vec::len).min().unwrap_or(0);
    (0..len)
        .map(|t| {
            asset_returns
                .iter()
                .zip(weights)
                .map(|(r, w)| w * r[t])
                .sum()
        })
        .collect()
}

/// Value index that starts at `base` and compounds `returns`.
pub fn performance_index(returns: &[f64], base: f64) -> Vec<f64> {
    let mut values = Vec::with_capacity(returns.len() + 1);
    let mut value = base;
    values.push(value);
    for r in returns {
        value *= 1.0 + r;
        values.push(value);
    }
    values
}

/// One row of portfolio metrics, keyed by portfolio name and calculation date.
///
/// `expected_return`, `volatility`, `sharpe`, `treynor`, `alpha`,
/// `annualized_return` and `market_return` are annual figures; `cvar`, `var`,
/// `tracking_error` and `daily_return` are per trading day.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub portfolio: String,
    pub calculation_date: NaiveDate,
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe: f64,
    pub treynor: f64,
    pub beta: f64,
    pub alpha: f64,
    pub cvar: f64,
    pub var: f64,
    pub tracking_error: f64,
    pub max_drawdown: f64,
    pub sector_concentration: f64,
    pub annualized_return: f64,
    pub market_return: f64,
    pub risk_parity_score: f64,
    pub daily_return: f64,
    pub weight_sum: f64,
}

impl MetricsReport {
    /// Zero risk, zero return, market-neutral beta.
    pub fn empty(portfolio: impl Into<String>, calculation_date: NaiveDate) -> Self {
        Self {
            portfolio: portfolio.into(),
            calculation_date,
            expected_return: 0.0,
            volatility: 0.0,
            sharpe: 0.0,
            treynor: 0.0,
            beta: 1.0,
            alpha: 0.0,
            cvar: 0.0,
            var: 0.0,
            tracking_error: 0.0,
            max_drawdown: 0.0,
            sector_concentration: 0.0,
            annualized_return: 0.0,
            market_return: 0.0,
            risk_parity_score: 0.0,
            daily_return: 0.0,
            weight_sum: 0.0,
        }
    }
}
