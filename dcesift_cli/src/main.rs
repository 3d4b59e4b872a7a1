use dcesift_core::config::SiftConfig;
use dcesift_core::setting::{CompilerSetting, Scenario};
use dcesift_core::worker::{WORKER_ID_ENV, build_discovery, prepare_scenario, run_worker};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "dcesift_core=info,dcesift_cli=info";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search for programs some compiler settings optimize worse than others.
    Search(SearchArgs),
    /// Runs one discovery loop, reading the scenario from stdin.
    #[clap(hide = true)]
    Worker {
        #[clap(long, env = WORKER_ID_ENV, default_value_t = 0)]
        id: u64,
        #[clap(long)]
        seed: Option<u64>,
    },
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// JSON or TOML scenario file.
    #[clap(long, conflicts_with_all = ["target", "attacker"])]
    scenario: Option<PathBuf>,
    /// Setting suspected of missing an optimization, e.g. `gcc@trunk:O2`.
    #[clap(long)]
    target: Vec<CompilerSetting>,
    /// Setting expected to perform the optimization.
    #[clap(long)]
    attacker: Vec<CompilerSetting>,
    #[clap(short, long)]
    output_dir: Option<PathBuf>,
    /// Worker processes; without it a single discovery runs in-process.
    #[clap(short, long, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    jobs: Option<usize>,
    /// Cases to collect with `--jobs`; 0 keeps going forever.
    #[clap(short, long)]
    amount: Option<u64>,
    #[clap(long)]
    start_stop: bool,
    #[clap(long)]
    seed: Option<u64>,
}

fn main() -> Result<(), anyhow::Error> {
    // stdout carries case records in worker mode, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Worker { id, seed } => {
            if seed.is_some() {
                config.search.seed = seed;
            }
            let stdin = std::io::stdin().lock();
            let stdout = std::io::stdout().lock();
            run_worker(&config, id, stdin, stdout).with_context(|| format!("Worker {id} stopped"))
        }
        Commands::Search(args) => {
            if let Some(jobs) = args.jobs {
                config.search.workers = jobs;
            }
            if let Some(seed) = args.seed {
                config.search.seed = Some(seed);
            }
            config.search.start_stop |= args.start_stop;
            let scenario = scenario_from_args(&args)?;

            if args.jobs.is_some() {
                search_parallel(cli.config.as_deref(), &config, &scenario, &args)
            } else {
                search_in_process(&config, scenario, args.output_dir.as_deref())
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SiftConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!("Loading configuration from specified path: {config_path:?}");
            SiftConfig::load_from_file(config_path)
        }
        None => {
            let default_config_path = PathBuf::from("config.toml");
            if default_config_path.exists() {
                info!("No config file specified via CLI, loading default: {default_config_path:?}");
                SiftConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and default 'config.toml' not found, using built-in defaults.");
                Ok(SiftConfig::default())
            }
        }
    }
}

fn scenario_from_args(args: &SearchArgs) -> Result<Scenario, anyhow::Error> {
    let scenario = match &args.scenario {
        Some(path) => Scenario::from_file(path)?,
        None => Scenario::new(args.target.clone(), args.attacker.clone()),
    };
    if scenario.target_settings.is_empty() || scenario.attacker_settings.is_empty() {
        bail!("A scenario needs at least one target and one attacker setting");
    }
    Ok(scenario)
}

fn search_in_process(
    config: &SiftConfig,
    scenario: Scenario,
    output_dir: Option<&Path>,
) -> Result<(), anyhow::Error> {
    let mut discovery = build_discovery(config, 0);
    let scenario = prepare_scenario(&discovery, scenario);
    let mut case = discovery.discover(&scenario)?;
    info!(attempts = discovery.attempts(), "Discovery finished");

    match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create output directory {dir:?}"))?;
            let path = dir.join(case.archive_name(0)?);
            case.path = Some(path.clone());
            case.to_file(&path)?;
            println!("{}", path.display());
        }
        None => println!("{}", case.to_json_line()?),
    }
    Ok(())
}

#[cfg(unix)]
fn search_parallel(
    config_path: Option<&Path>,
    config: &SiftConfig,
    scenario: &Scenario,
    args: &SearchArgs,
) -> Result<(), anyhow::Error> {
    use dcesift_core::orchestrator::{ParallelSearch, WorkerCommand};

    let Some(output_dir) = &args.output_dir else {
        bail!("--output-dir is required when searching with --jobs");
    };
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {output_dir:?}"))?;

    let mut worker_args = Vec::new();
    if let Some(path) = config_path {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        worker_args.push("--config".to_string());
        worker_args.push(path.display().to_string());
    }
    worker_args.push("worker".to_string());
    if let Some(seed) = config.search.seed {
        worker_args.push("--seed".to_string());
        worker_args.push(seed.to_string());
    }
    let command = WorkerCommand::new(std::env::current_exe()?, worker_args);

    let amount = args.amount.unwrap_or(0);
    info!(
        workers = config.search.workers,
        start_stop = config.search.start_stop,
        amount,
        "Starting parallel search"
    );
    let mut search = ParallelSearch::start(
        &command,
        scenario,
        config.search.workers,
        config.search.start_stop,
    )?;

    let mut found = 0u64;
    let result = loop {
        if amount != 0 && found >= amount {
            break Ok(());
        }
        match search.next_to_file(output_dir) {
            Ok(path) => {
                found += 1;
                println!("{}", path.display());
            }
            Err(e) => break Err(e),
        }
    };
    search.terminate();
    if let Err(e) = &result {
        warn!("Search ended after {found} cases: {e}");
    }
    result.context("Parallel search failed")
}

#[cfg(not(unix))]
fn search_parallel(
    _config_path: Option<&Path>,
    _config: &SiftConfig,
    _scenario: &Scenario,
    _args: &SearchArgs,
) -> Result<(), anyhow::Error> {
    bail!("Parallel search relies on Unix process signals")
}
