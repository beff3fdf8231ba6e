use crate::service::AnalysisReport;
use std::fmt::Write;

const RULE: &str = "╠════════════════════════════════════════════════════════════╣";

/// Box-drawn text summary of a full analysis.
pub fn render(report: &AnalysisReport) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = write_report(&mut out, report);
    out
}

/// Pretty-prints the analysis to stdout.
pub fn print_report(report: &AnalysisReport) {
    println!("{}", render(report));
}

fn write_report(out: &mut String, report: &AnalysisReport) -> std::fmt::Result {
    let m = &report.metrics;
    writeln!(out)?;
    writeln!(out, "╔════════════════════════════════════════════════════════════╗")?;
    writeln!(out, "║  Portfolio: {:<47}║", truncate(&m.portfolio, 46))?;
    writeln!(out, "║  As of    : {:<47}║", m.calculation_date)?;
    writeln!(out, "{}", RULE)?;
    writeln!(out, "║  Expected Annual Return : {:>+8.2}%                        ║", m.expected_return * 100.0)?;
    writeln!(out, "║  Annual Volatility      : {:>8.2}%                        ║", m.volatility * 100.0)?;
    writeln!(out, "║  Sharpe Ratio           : {:>8.2}                         ║", m.sharpe)?;
    writeln!(out, "║  Treynor Ratio          : {:>8.4}                         ║", m.treynor)?;
    writeln!(out, "║  Beta / Alpha           : {:>8.2} / {:>+7.2}%              ║", m.beta, m.alpha * 100.0)?;
    writeln!(out, "║  VaR / CVaR (daily)     : {:>+7.2}% / {:>+7.2}%             ║", m.var * 100.0, m.cvar * 100.0)?;
    writeln!(out, "║  Tracking Error (daily) : {:>8.2}%                        ║", m.tracking_error * 100.0)?;
    writeln!(out, "║  Max Drawdown           : {:>8.2}%                        ║", m.max_drawdown * 100.0)?;
    writeln!(out, "║  Sector HHI             : {:>8.4}                         ║", m.sector_concentration)?;
    writeln!(out, "║  Risk Parity Score      : {:>8.4}                         ║", m.risk_parity_score)?;
    writeln!(out, "║  Weight Sum             : {:>8.4}                         ║", m.weight_sum)?;

    writeln!(out, "{}", RULE)?;
    writeln!(out, "║  Symbol     Weight   E[Ann.Ret]   Optimized                ║")?;
    writeln!(out, "{}", RULE)?;
    let optimized = report.optimization.as_ref().map(|o| o.weights.as_slice());
    for (i, sym) in report.symbols.iter().enumerate() {
        let opt = optimized
            .and_then(|w| w.get(i))
            .map(|w| format!("{:>7.2}%", w * 100.0))
            .unwrap_or_else(|| "      -".to_string());
        writeln!(
            out,
            "║  {:<8} {:>7.2}%   {:>+8.2}%    {}                 ║",
            truncate(sym, 8),
            report.weights[i] * 100.0,
            report.expected_returns.get(i).copied().unwrap_or(0.0) * 100.0,
            opt
        )?;
    }

    if let Some(opt) = &report.optimization {
        writeln!(out, "{}", RULE)?;
        writeln!(
            out,
            "║  Optimized: ret {:>+6.2}%  risk {:>6.2}%  Sharpe {:>5.2}{}      ║",
            opt.expected_return * 100.0,
            opt.risk * 100.0,
            opt.sharpe,
            if opt.truncated { " (partial)" } else { "          " }
        )?;
    }

    if let Some(frontier) = &report.frontier {
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║                    Efficient Frontier                     ║")?;
        writeln!(out, "{}", RULE)?;
        for p in &frontier.points {
            writeln!(
                out,
                "║    target {:>+7.2}%   risk {:>6.2}%   Sharpe {:>6.2}         ║",
                p.target_return * 100.0,
                p.achieved_risk * 100.0,
                p.sharpe
            )?;
        }
        if let Some(cur) = &frontier.current {
            writeln!(
                out,
                "║    current {:>+6.2}%   risk {:>6.2}%   Sharpe {:>6.2}         ║",
                cur.achieved_return * 100.0,
                cur.achieved_risk * 100.0,
                cur.sharpe
            )?;
        }
    }

    if let Some(sim) = &report.simulation {
        let s = &sim.summary;
        writeln!(out, "{}", RULE)?;
        writeln!(
            out,
            "║  Monte Carlo ({} paths, {}-day horizon){:>w$}║",
            sim.results.len(),
            sim.horizon_days,
            "",
            w = 20usize.saturating_sub(digits(sim.results.len()) + digits(sim.horizon_days))
        )?;
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║    Mean {:>+7.2}%   Median {:>+7.2}%   Vol {:>6.2}%        ║", s.mean * 100.0, s.median * 100.0, s.volatility * 100.0)?;
        writeln!(out, "║    P5 {:>+7.2}%  P25 {:>+7.2}%  P75 {:>+7.2}%  P95 {:>+7.2}% ║", s.p5 * 100.0, s.p25 * 100.0, s.p75 * 100.0, s.p95 * 100.0)?;
        writeln!(out, "║    VaR95 {:>+7.2}%  VaR99 {:>+7.2}%  CVaR95 {:>+7.2}%     ║", s.var95 * 100.0, s.var99 * 100.0, s.cvar95 * 100.0)?;
    }

    if !report.low_correlation.is_empty() || !report.sector_candidates.is_empty() || !report.scenarios.is_empty() {
        writeln!(out, "{}", RULE)?;
        writeln!(out, "║                  Diversification Ideas                    ║")?;
        writeln!(out, "{}", RULE)?;
        for c in &report.low_correlation {
            writeln!(out, "║    {:<8} avg corr {:>+5.2}                                ║", truncate(&c.symbol, 8), c.avg_correlation)?;
        }
        for c in &report.sector_candidates {
            writeln!(out, "║    {:<8} new sector: {:<34}║", truncate(&c.symbol, 8), truncate(&c.sector, 33))?;
        }
        for s in &report.scenarios {
            writeln!(
                out,
                "║    {:<44} vol {:>+6.2}% ║",
                truncate(&format!("{:?}", s.kind), 44),
                s.deltas.volatility * 100.0
            )?;
        }
    }

    if !report.warnings.is_empty() || !report.excluded.is_empty() || !report.failures.is_empty() {
        writeln!(out, "{}", RULE)?;
        for e in &report.excluded {
            writeln!(out, "║  excluded {:<48}║", truncate(&format!("{}: {}", e.symbol, e.reason), 47))?;
        }
        for w in &report.warnings {
            writeln!(out, "║  ⚠ {:<55}║", truncate(&w.to_string(), 55))?;
        }
        for f in &report.failures {
            writeln!(out, "║  ✗ {:<55}║", truncate(&format!("{}: {}", f.stage, f.reason), 55))?;
        }
    }

    writeln!(out, "╚════════════════════════════════════════════════════════════╝")?;
    writeln!(out)?;
    write!(out, "⚠  Educational use only. Not financial advice.")
}

fn digits(n: usize) -> usize {
    n.to_string().len()
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max.saturating_sub(1)).chain(['…']).collect()
    }
}
