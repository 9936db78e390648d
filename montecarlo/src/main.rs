use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::error;
use montecarlo::config::{Config, DEFAULT_TOTAL_SAMPLES};
use montecarlo::strategy::process::serve_worker;
use montecarlo::{estimate_with, QuarterCircle, StrategyKind};
use std::io;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "montecarlo", version, about = "Parallel Monte Carlo pi estimator")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate pi (the default)
    Run(RunArgs),
    /// Sample one task read from stdin and write its result to stdout
    #[command(hide = true)]
    Worker,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Total number of samples across all workers
    #[arg(long, env = "MONTECARLO_SAMPLES", default_value_t = DEFAULT_TOTAL_SAMPLES)]
    samples: u64,

    /// Number of workers; defaults to the available CPUs
    #[arg(long, env = "MONTECARLO_WORKERS")]
    workers: Option<usize>,

    #[arg(long, value_enum, env = "MONTECARLO_STRATEGY", default_value_t = StrategyKind::InProcess)]
    strategy: StrategyKind,

    /// Give up on workers still running after this many milliseconds
    #[arg(long, env = "MONTECARLO_TIMEOUT_MS")]
    timeout_ms: Option<u64>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = Config::new()
        .with_total_samples(args.samples)
        .with_strategy(args.strategy);
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config = config.with_timeout(Duration::from_millis(timeout_ms));
    }

    let start = Instant::now();
    let result = estimate_with(&config).with_context(|| {
        format!(
            "estimating pi with {} {} workers",
            config.worker_count(),
            config.strategy()
        )
    })?;
    let elapsed = start.elapsed();

    println!("Monte Carlo Pi Estimation ({})", config.strategy());
    println!("Workers: {}", config.worker_count());
    println!("Total samples: {}", result.total_samples());
    println!("Points inside circle: {}", result.total_hits());
    println!("Pi estimate: {:.6}", result.value());
    println!("Error: {:.6}", std::f64::consts::PI - result.value());
    println!("Time: {}ms", elapsed.as_millis());

    Ok(())
}

fn worker() -> Result<()> {
    serve_worker(io::stdin().lock(), io::stdout().lock(), &QuarterCircle)
        .context("worker could not complete its task")
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let outcome = match cli.command {
        Some(Command::Run(args)) => run(args),
        Some(Command::Worker) => worker(),
        None => run(cli.run),
    };

    if let Err(e) = outcome {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
