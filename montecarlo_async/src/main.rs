mod monte_carlo;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use montecarlo::config::{default_worker_count, DEFAULT_TOTAL_SAMPLES};
use montecarlo::{plan, QuarterCircle};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "montecarlo_async", version, about = "Monte Carlo pi estimator on the tokio blocking pool")]
struct Args {
    /// Total number of samples across all tasks
    #[arg(long, env = "MONTECARLO_SAMPLES", default_value_t = DEFAULT_TOTAL_SAMPLES)]
    samples: u64,

    /// Number of blocking tasks; defaults to the available CPUs
    #[arg(long, env = "MONTECARLO_WORKERS")]
    tasks: Option<usize>,

    /// Give up on tasks still running after this many milliseconds
    #[arg(long, env = "MONTECARLO_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

async fn run(args: Args) -> Result<()> {
    let num_tasks = args.tasks.unwrap_or_else(default_worker_count);
    let plan = plan(args.samples, num_tasks).context("partitioning the sample budget")?;
    let timeout = args.timeout_ms.map(Duration::from_millis);

    info!("sampling with {} blocking tasks", num_tasks);
    let start = tokio::time::Instant::now();
    let result = monte_carlo::estimate_async(&plan, Arc::new(QuarterCircle), timeout)
        .await
        .with_context(|| format!("estimating pi with {} async tasks", num_tasks))?;
    let duration = start.elapsed();

    println!("Monte Carlo Pi Estimation (Async)");
    println!("Tasks: {}", num_tasks);
    println!("Total samples: {}", result.total_samples());
    println!("Points inside circle: {}", result.total_hits());
    println!("Pi estimate: {:.6}", result.value());
    println!("Error: {:.6}", std::f64::consts::PI - result.value());
    println!("Completed in {:?}", duration);

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
