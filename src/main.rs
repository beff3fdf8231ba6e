use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use portfolio_analytics::config::{self, EngineConfig};
use portfolio_analytics::service::{AnalysisRequest, AnalyticsService};
use portfolio_analytics::{AnalysisInput, AnalyticsEngine, OptimizerStrategy, RiskTolerance, report};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyChoice {
    RandomSearch,
    GradientDescent,
}

impl From<StrategyChoice> for OptimizerStrategy {
    fn from(choice: StrategyChoice) -> Self {
        match choice {
            StrategyChoice::RandomSearch => OptimizerStrategy::RandomSearch,
            StrategyChoice::GradientDescent => OptimizerStrategy::GradientDescent,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Portfolio risk & optimization analytics: statistics, mean-variance optimization, risk ratios and Monte Carlo VaR",
    after_help = "EXAMPLES:
    # Analyze a generated sample portfolio
    cargo run --release -- --demo

    # Analyze a portfolio file and write the JSON report
    cargo run --release -- --input portfolio.json --json --output report.json

    # Conservative optimization with more trials
    cargo run --release -- --input portfolio.json --risk-tolerance low --trials 50000"
)]
struct Args {
    /// Analysis request JSON (portfolio, market, optional candidates and options)
    #[arg(long)]
    input: Option<PathBuf>,

    /// Analyze a generated sample portfolio instead of --input
    #[arg(long)]
    demo: bool,

    /// Trading days of history generated for --demo
    #[arg(long, default_value_t = 504)]
    demo_days: usize,

    /// RNG seed for optimizer and simulation (overrides the request)
    #[arg(long)]
    seed: Option<u64>,

    /// Annual target return, e.g. 0.12 (default: current expected return)
    #[arg(long)]
    target_return: Option<f64>,

    /// low | medium | high | number in [0, 1]
    #[arg(long)]
    risk_tolerance: Option<RiskTolerance>,

    /// Optimizer implementation
    #[arg(long, value_enum)]
    strategy: Option<StrategyChoice>,

    /// Random portfolios sampled per optimizer run (default: 10000)
    #[arg(long)]
    trials: Option<usize>,

    /// Monte Carlo paths (default: 10000)
    #[arg(long)]
    iterations: Option<usize>,

    /// Monte Carlo horizon in trading days (default: 252)
    #[arg(long)]
    horizon: Option<usize>,

    /// Efficient frontier points (default: 20)
    #[arg(long)]
    frontier_steps: Option<usize>,

    /// Skip the efficient frontier
    #[arg(long)]
    no_frontier: bool,

    /// Skip the Monte Carlo simulation
    #[arg(long)]
    no_simulation: bool,

    /// Soft time limit for the whole run in milliseconds; later stages may come back partial or empty
    #[arg(long)]
    time_limit_ms: Option<u64>,

    /// Hard limit for the whole analysis in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Worker threads (default: all cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Print the report as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Write the JSON report to this file
    #[arg(long)]
    output: Option<PathBuf>,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::from_env();
        if let Some(v) = self.trials {
            cfg.optimizer.trials = v;
        }
        if let Some(v) = self.iterations {
            cfg.simulation.iterations = v;
        }
        if let Some(v) = self.horizon {
            cfg.simulation.horizon_days = v;
        }
        if let Some(v) = self.frontier_steps {
            cfg.frontier_steps = v;
        }
        cfg
    }

    fn request(&self) -> Result<AnalysisRequest> {
        let mut request = match &self.input {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                AnalysisRequest::from_json_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => {
                if !self.demo {
                    warn!("No --input given; analyzing a generated sample portfolio");
                }
                let mut rng = StdRng::seed_from_u64(self.seed.unwrap_or(portfolio_analytics::service::DEFAULT_SEED));
                AnalysisRequest::new(AnalysisInput::mock(self.demo_days, &mut rng))
            }
        };
        let opts = &mut request.options;
        if let Some(seed) = self.seed {
            opts.seed = seed;
        }
        if self.target_return.is_some() {
            opts.target_return = self.target_return;
        }
        if let Some(tol) = self.risk_tolerance {
            opts.risk_tolerance = tol;
        }
        if let Some(s) = self.strategy {
            opts.strategy = s.into();
        }
        if self.no_frontier {
            opts.frontier = false;
        }
        if self.no_simulation {
            opts.simulation = false;
        }
        if self.time_limit_ms.is_some() {
            opts.time_limit_ms = self.time_limit_ms;
        }
        Ok(request)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portfolio_analytics=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    let args = Args::parse();

    config::init_cpu_parallelism(args.threads);

    let engine = AnalyticsEngine::new(args.engine_config()).context("invalid configuration")?;
    let mut service = AnalyticsService::new(engine);
    if let Some(secs) = args.timeout_secs {
        service = service.with_timeout(Duration::from_secs(secs));
    }

    let request = args.request()?;
    info!(
        "Analyzing '{}' ({} holdings, {} candidates)",
        request.input.portfolio.name,
        request.input.portfolio.len(),
        request.candidates.len()
    );
    let analysis = service.analyze(request).await.context("analysis failed")?;

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&analysis)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!("Report written to {}", path.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&analysis)?);
    } else {
        report::print_report(&analysis);
    }

    Ok(())
}
