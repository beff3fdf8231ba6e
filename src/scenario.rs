//! What-if analysis and diversification candidates.

use crate::data::{AnalysisInput, AssetSeries, Holding, PortfolioComposition, common_dates};
use crate::engine::{AnalysisContext, AnalyticsEngine};
use crate::error::{AnalyticsError, Result};
use crate::observer::DegenerateInput;
use crate::risk::MetricsReport;
use crate::stats;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Weight given to a candidate asset when the caller does not pick one.
pub const DEFAULT_CANDIDATE_WEIGHT: f64 = 0.05;

/// Number of candidates returned by the ranking helpers.
pub const DEFAULT_TOP_K: usize = 5;

const WEIGHT_EPS: f64 = 1e-12;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ScenarioKind {
    AddAsset { symbol: String, weight: f64 },
    ChangeWeight { symbol: String, from: f64, to: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricDeltas {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe: f64,
    pub beta: f64,
    pub alpha: f64,
}

impl MetricDeltas {
    fn between(before: &MetricsReport, after: &MetricsReport) -> Self {
        Self {
            expected_return: after.expected_return - before.expected_return,
            volatility: after.volatility - before.volatility,
            sharpe: after.sharpe - before.sharpe,
            beta: after.beta - before.beta,
            alpha: after.alpha - before.alpha,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SectorChange {
    pub sector: String,
    pub before: f64,
    pub after: f64,
    pub change: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightChange {
    pub symbol: String,
    pub before: f64,
    pub after: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DiversificationEffect {
    /// `(σ_before − σ_after) / σ_before`; positive means less risk.
    pub risk_reduction: f64,
    pub avg_correlation_before: f64,
    pub avg_correlation_after: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ScenarioOutcome {
    pub kind: ScenarioKind,
    pub before: MetricsReport,
    pub after: MetricsReport,
    pub deltas: MetricDeltas,
    pub weights: Vec<WeightChange>,
    pub sector_changes: Vec<SectorChange>,
    pub diversification: DiversificationEffect,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CorrelationCandidate {
    pub symbol: String,
    pub sector: Option<String>,
    pub avg_correlation: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SectorCandidate {
    pub symbol: String,
    pub sector: String,
}

fn sector_changes(before: &PortfolioComposition, after: &PortfolioComposition) -> Vec<SectorChange> {
    let b = before.sector_weights();
    let a = after.sector_weights();
    let sectors: BTreeSet<&String> = b.keys().chain(a.keys()).collect();
    sectors
        .into_iter()
        .map(|s| {
            let before = b.get(s).copied().unwrap_or(0.0);
            let after = a.get(s).copied().unwrap_or(0.0);
            SectorChange {
                sector: s.clone(),
                before,
                after,
                change: after - before,
            }
        })
        .collect()
}

/// Average pairwise correlation among the assets actually held.
fn held_correlation(asset_returns: &[Vec<f64>], weights: &[f64]) -> f64 {
    let held: Vec<Vec<f64>> = asset_returns
        .iter()
        .zip(weights)
        .filter(|(_, w)| **w > WEIGHT_EPS)
        .map(|(r, _)| r.clone())
        .collect();
    stats::average_pairwise_correlation(&held)
}

fn reweighted(portfolio: &PortfolioComposition, weights: &[f64]) -> PortfolioComposition {
    let holdings = portfolio
        .holdings
        .iter()
        .zip(weights)
        .map(|(h, &weight)| Holding {
            asset: h.asset.clone(),
            weight,
        })
        .collect();
    PortfolioComposition::new(portfolio.name.clone(), holdings)
}

fn outcome(
    kind: ScenarioKind,
    ctx: &AnalysisContext,
    before: MetricsReport,
    after: MetricsReport,
    before_portfolio: &PortfolioComposition,
    after_portfolio: &PortfolioComposition,
    before_weights: &[f64],
    after_weights: &[f64],
) -> ScenarioOutcome {
    let risk_reduction = if before.volatility > 0.0 {
        (before.volatility - after.volatility) / before.volatility
    } else {
        0.0
    };
    let weights = after_portfolio
        .holdings
        .iter()
        .enumerate()
        .map(|(i, h)| WeightChange {
            symbol: h.asset.symbol.clone(),
            before: before_weights.get(i).copied().unwrap_or(0.0),
            after: after_weights[i],
        })
        .collect();
    ScenarioOutcome {
        kind,
        deltas: MetricDeltas::between(&before, &after),
        weights,
        sector_changes: sector_changes(before_portfolio, after_portfolio),
        diversification: DiversificationEffect {
            risk_reduction,
            avg_correlation_before: held_correlation(&ctx.asset_returns, before_weights),
            avg_correlation_after: held_correlation(&ctx.asset_returns, after_weights),
        },
        before,
        after,
    }
}

/// Adds `candidate` at `weight` (default 5%) and scales existing weights by
/// `1 − weight`. Both sides are measured over the dates all assets share.
pub fn add_asset(
    engine: &AnalyticsEngine,
    ctx: &AnalysisContext,
    candidate: &AssetSeries,
    weight: Option<f64>,
) -> Result<ScenarioOutcome> {
    let weight = weight.unwrap_or(DEFAULT_CANDIDATE_WEIGHT);
    if !(weight > 0.0 && weight < 1.0) {
        return Err(AnalyticsError::configuration(format!(
            "candidate weight must be within (0, 1), got {}",
            weight
        )));
    }
    if ctx.symbols().iter().any(|s| s == &candidate.symbol) {
        return Err(AnalyticsError::configuration(format!(
            "{} is already in the portfolio",
            candidate.symbol
        )));
    }

    let mut holdings: Vec<Holding> = ctx
        .portfolio
        .holdings
        .iter()
        .map(|h| Holding {
            asset: h.asset.clone(),
            weight: h.weight * (1.0 - weight),
        })
        .collect();
    holdings.push(Holding {
        asset: candidate.clone(),
        weight,
    });
    let input = AnalysisInput {
        portfolio: PortfolioComposition::new(ctx.portfolio.name.clone(), holdings),
        market: ctx
            .market
            .clone()
            .unwrap_or_else(|| AssetSeries::new("MARKET", None, Vec::new())),
    };
    let after_ctx = engine.prepare(&input)?;
    if after_ctx.symbols().last() != Some(&candidate.symbol) {
        return Err(AnalyticsError::insufficient_data(
            format!("{} prices", candidate.symbol),
            2,
            candidate.prices.len(),
        ));
    }

    let mut before_weights = ctx.weights();
    before_weights.push(0.0);
    let after_weights = after_ctx.weights();
    let before = engine.metrics_for(&after_ctx, &ctx.portfolio, &before_weights);
    let after = engine.metrics(&after_ctx);

    info!(
        "Scenario add {} at {:.1}%: volatility {:.4} -> {:.4}",
        candidate.symbol,
        weight * 100.0,
        before.volatility,
        after.volatility
    );
    Ok(outcome(
        ScenarioKind::AddAsset {
            symbol: candidate.symbol.clone(),
            weight,
        },
        &after_ctx,
        before,
        after,
        &ctx.portfolio,
        &after_ctx.portfolio,
        &before_weights,
        &after_weights,
    ))
}

/// Sets `symbol` to `new_weight` and rescales the other holdings by
/// `(1 − new) / (1 − old)`. A holding that was the whole portfolio hands the
/// freed weight out equally.
pub fn change_weight(
    engine: &AnalyticsEngine,
    ctx: &AnalysisContext,
    symbol: &str,
    new_weight: f64,
) -> Result<ScenarioOutcome> {
    if !new_weight.is_finite() || !(0.0..=1.0).contains(&new_weight) {
        return Err(AnalyticsError::configuration(format!(
            "new weight must be within [0, 1], got {}",
            new_weight
        )));
    }
    let symbols = ctx.symbols();
    let Some(idx) = symbols.iter().position(|s| s == symbol) else {
        let available = ctx.warnings.iter().find_map(|w| match w {
            DegenerateInput::ExcludedAsset { symbol: s, available } if s == symbol => Some(*available),
            _ => None,
        });
        return Err(match available {
            Some(available) => AnalyticsError::insufficient_data(format!("{} prices", symbol), 2, available),
            None => AnalyticsError::configuration(format!("{} is not in the portfolio", symbol)),
        });
    };

    let before_weights = ctx.weights();
    let old = before_weights[idx];
    let others = before_weights.len() - 1;
    let after_weights: Vec<f64> = before_weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            if i == idx {
                new_weight
            } else if (1.0 - old).abs() <= WEIGHT_EPS {
                (1.0 - new_weight) / others as f64
            } else {
                w * (1.0 - new_weight) / (1.0 - old)
            }
        })
        .collect();
    debug!("Scenario weights for {}: {:?}", symbol, after_weights);

    let after_portfolio = reweighted(&ctx.portfolio, &after_weights);
    let before = engine.metrics(ctx);
    let after = engine.metrics_for(ctx, &after_portfolio, &after_weights);
    Ok(outcome(
        ScenarioKind::ChangeWeight {
            symbol: symbol.to_string(),
            from: old,
            to: new_weight,
        },
        ctx,
        before,
        after,
        &ctx.portfolio,
        &after_portfolio,
        &before_weights,
        &after_weights,
    ))
}

/// Candidates ranked by average return correlation with the current
/// holdings, lowest first. Held symbols and candidates without two shared
/// prices are skipped.
pub fn low_correlation_candidates(ctx: &AnalysisContext, candidates: &[AssetSeries], top_k: usize) -> Vec<CorrelationCandidate> {
    if ctx.is_empty() {
        return Vec::new();
    }
    let held = ctx.symbols();
    let mut ranked: Vec<CorrelationCandidate> = candidates
        .iter()
        .filter(|c| !held.contains(&c.symbol))
        .filter_map(|c| {
            let (clean, _) = c.cleaned();
            let dates = common_dates(ctx.portfolio.holdings.iter().map(|h| &h.asset).chain([&clean]));
            let candidate_returns = clean.restricted_to(&dates).returns().ok()?;
            let total: f64 = ctx
                .portfolio
                .holdings
                .iter()
                .filter_map(|h| h.asset.restricted_to(&dates).returns().ok())
                .map(|r| stats::correlation(&candidate_returns, &r))
                .sum();
            Some(CorrelationCandidate {
                symbol: c.symbol.clone(),
                sector: c.sector.clone(),
                avg_correlation: total / ctx.portfolio.len() as f64,
            })
        })
        .collect();
    ranked.sort_by(|a, b| a.avg_correlation.total_cmp(&b.avg_correlation));
    ranked.truncate(top_k);
    ranked
}

/// Up to `top_k` candidates from sectors the portfolio does not hold, in the
/// order given.
pub fn sector_diversification_candidates(
    portfolio: &PortfolioComposition,
    candidates: &[AssetSeries],
    top_k: usize,
) -> Vec<SectorCandidate> {
    let held_sectors: BTreeMap<String, f64> = portfolio.sector_weights();
    let held_symbols = portfolio.symbols();
    candidates
        .iter()
        .filter(|c| !held_symbols.contains(&c.symbol))
        .filter_map(|c| {
            let sector = c.sector.as_ref()?;
            (!held_sectors.contains_key(sector)).then(|| SectorCandidate {
                symbol: c.symbol.clone(),
                sector: sector.clone(),
            })
        })
        .take(top_k)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::input_from_closes;
    use crate::observer::RecordingObserver;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn engine() -> AnalyticsEngine {
        AnalyticsEngine::new(EngineConfig::default())
            .unwrap()
            .with_observer(Arc::new(RecordingObserver::new()))
    }

    const A: [f64; 6] = [100.0, 102.0, 101.0, 104.0, 103.0, 106.0];
    const B: [f64; 6] = [50.0, 51.0, 50.2, 51.5, 51.0, 52.4];
    const C: [f64; 6] = [20.0, 19.6, 20.1, 19.5, 19.9, 19.4];
    const M: [f64; 6] = [1000.0, 1010.0, 1005.0, 1020.0, 1015.0, 1030.0];

    fn context(engine: &AnalyticsEngine) -> AnalysisContext {
        let input = input_from_closes(
            "demo",
            start(),
            &[("A", Some("Tech"), &A, 0.6), ("B", Some("Energy"), &B, 0.4)],
            &M,
        );
        engine.prepare(&input).unwrap()
    }

    #[test]
    fn test_add_anticorrelated_asset_reduces_risk() {
        let engine = engine();
        let ctx = context(&engine);
        let candidate = AssetSeries::from_closes("C", Some("Utilities".into()), start(), &C);
        let out = add_asset(&engine, &ctx, &candidate, Some(0.2)).unwrap();

        assert_eq!(out.weights.len(), 3);
        assert!((out.weights[0].after - 0.48).abs() < 1e-12);
        assert!((out.weights[1].after - 0.32).abs() < 1e-12);
        assert_eq!(out.weights[2].before, 0.0);
        assert!(out.diversification.risk_reduction > 0.0);
        assert!(out.diversification.avg_correlation_after < out.diversification.avg_correlation_before);
        let utilities = out.sector_changes.iter().find(|s| s.sector == "Utilities").unwrap();
        assert!((utilities.change - 0.2).abs() < 1e-12);
        assert!((out.deltas.volatility - (out.after.volatility - out.before.volatility)).abs() < 1e-15);
    }

    #[test]
    fn test_add_existing_or_bad_weight_rejected() {
        let engine = engine();
        let ctx = context(&engine);
        let dup = AssetSeries::from_closes("A", None, start(), &A);
        assert!(add_asset(&engine, &ctx, &dup, None).is_err());
        let c = AssetSeries::from_closes("C", None, start(), &C);
        assert!(add_asset(&engine, &ctx, &c, Some(1.0)).is_err());
    }

    #[test]
    fn test_change_weight_rescales_others() {
        let engine = engine();
        let ctx = context(&engine);
        let out = change_weight(&engine, &ctx, "A", 0.8).unwrap();
        assert!((out.weights[0].after - 0.8).abs() < 1e-12);
        assert!((out.weights[1].after - 0.2).abs() < 1e-12);
        let sum: f64 = out.weights.iter().map(|w| w.after).sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(matches!(out.kind, ScenarioKind::ChangeWeight { from, .. } if (from - 0.6).abs() < 1e-12));
        assert!(change_weight(&engine, &ctx, "ZZZ", 0.5).is_err());
    }

    #[test]
    fn test_change_weight_of_excluded_asset_is_a_data_error() {
        let engine = engine();
        let mut input = input_from_closes(
            "demo",
            start(),
            &[("A", Some("Tech"), &A, 0.6), ("B", Some("Energy"), &B, 0.4)],
            &M,
        );
        input.portfolio.holdings.push(Holding {
            asset: AssetSeries::from_closes("THIN", None, start(), &[10.0]),
            weight: 0.0,
        });
        let ctx = engine.prepare(&input).unwrap();
        let err = change_weight(&engine, &ctx, "THIN", 0.1).unwrap_err();
        assert!(matches!(err, AnalyticsError::InsufficientData { available: 1, .. }));
        assert!(!err.is_fatal_configuration());
    }

    #[test]
    fn test_change_weight_from_full_position() {
        let engine = engine();
        let input = input_from_closes(
            "solo",
            start(),
            &[("A", None, &A, 1.0), ("B", None, &B, 0.0), ("C", None, &C, 0.0)],
            &M,
        );
        let ctx = engine.prepare(&input).unwrap();
        let out = change_weight(&engine, &ctx, "A", 0.5).unwrap();
        assert!((out.weights[1].after - 0.25).abs() < 1e-12);
        assert!((out.weights[2].after - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_low_correlation_ranking() {
        let engine = engine();
        let ctx = context(&engine);
        let twin = AssetSeries::from_closes("A2", None, start(), &A.map(|p| p * 2.0));
        let hedge = AssetSeries::from_closes("C", None, start(), &C);
        let held = AssetSeries::from_closes("A", None, start(), &A);
        let ranked = low_correlation_candidates(&ctx, &[twin, hedge, held], DEFAULT_TOP_K);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].symbol, "C");
        assert!(ranked[0].avg_correlation < ranked[1].avg_correlation);
        assert!(low_correlation_candidates(&ctx, &[], 1).is_empty());
    }

    #[test]
    fn test_sector_candidates_skip_held_sectors() {
        let engine = engine();
        let ctx = context(&engine);
        let candidates = vec![
            AssetSeries::from_closes("T2", Some("Tech".into()), start(), &A),
            AssetSeries::from_closes("U1", Some("Utilities".into()), start(), &C),
            AssetSeries::from_closes("N1", None, start(), &C),
            AssetSeries::from_closes("H1", Some("Health Care".into()), start(), &B),
        ];
        let picks = sector_diversification_candidates(&ctx.portfolio, &candidates, 1);
        assert_eq!(picks, vec![SectorCandidate { symbol: "U1".into(), sector: "Utilities".into() }]);
        assert_eq!(sector_diversification_candidates(&ctx.portfolio, &candidates, 5).len(), 2);
    }
}
