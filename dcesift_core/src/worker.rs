//! Wiring of one discovery instance from configuration, and the loop a
//! worker process runs: scenario in on stdin, one JSON case per line out.

use crate::builder::{AsmBuilder, Toolchains};
use crate::case::{Case, CaseError};
use crate::checker::ReproductionChecker;
use crate::config::SiftConfig;
use crate::discovery::{CaseDiscovery, DiscoveryError, GeneratedCandidates};
use crate::generator::build_generator;
use crate::instrument::{IncludeResolver, InstrumentationPipeline, Instrumenter};
use crate::setting::Scenario;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::io::{BufRead, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Environment variable telling a worker process its index.
pub const WORKER_ID_ENV: &str = "DCESIFT_WORKER_ID";

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("No scenario received on input")]
    MissingScenario,
    #[error("Malformed scenario: {0}")]
    Scenario(#[from] serde_json::Error),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Case(#[from] CaseError),
}

pub type SiftDiscovery =
    CaseDiscovery<GeneratedCandidates, Arc<AsmBuilder>, ReproductionChecker<Arc<AsmBuilder>>>;

/// Seed used by worker `worker_id`. Without a configured seed every worker
/// draws a random base.
pub fn worker_seed(config: &SiftConfig, worker_id: u64) -> u64 {
    config
        .search
        .seed
        .unwrap_or_else(rand::random)
        .wrapping_add(worker_id)
}

/// Assembles generator, pipeline, builder and checker as configured.
pub fn build_discovery(config: &SiftConfig, worker_id: u64) -> SiftDiscovery {
    let seed = worker_seed(config, worker_id);
    let generator = build_generator(
        config.search.generator,
        config.generator_settings().clone(),
        ChaCha8Rng::seed_from_u64(seed),
    );
    info!(
        worker_id,
        seed,
        generator = generator.name(),
        "Discovery initialized"
    );

    let pipeline = InstrumentationPipeline::new(
        IncludeResolver::new(&config.reference),
        Instrumenter::new(&config.instrumenter),
    );
    let builder = Arc::new(AsmBuilder::new(
        Toolchains::new(&config.toolchains),
        config.builder.compile_timeout_ms,
    ));
    let checker = ReproductionChecker::new(
        Arc::clone(&builder),
        config.instrumenter.marker_prefix.clone(),
    );

    CaseDiscovery::new(GeneratedCandidates::new(generator, pipeline), builder, checker)
}

/// Adds the flags the configured generator's programs need to build.
pub fn prepare_scenario(discovery: &SiftDiscovery, mut scenario: Scenario) -> Scenario {
    scenario.add_flags(discovery.source().generator().scenario_flags());
    scenario
}

/// Reads one scenario line, then reports cases forever.
///
/// Returns only when discovery fails fatally or the output goes away.
pub fn run_worker<R, W>(
    config: &SiftConfig,
    worker_id: u64,
    mut input: R,
    mut output: W,
) -> Result<(), WorkerError>
where
    R: BufRead,
    W: Write,
{
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(WorkerError::MissingScenario);
    }
    let scenario: Scenario = serde_json::from_str(line.trim_end())?;

    let mut discovery = build_discovery(config, worker_id);
    let scenario = prepare_scenario(&discovery, scenario);

    loop {
        let case = discovery.discover(&scenario)?;
        emit_case(&case, &mut output)?;
        info!(worker_id, attempts = discovery.attempts(), "Case reported");
    }
}

fn emit_case<W: Write>(case: &Case, output: &mut W) -> Result<(), WorkerError> {
    writeln!(output, "{}", case.to_json_line()?)?;
    output.flush()?;
    Ok(())
}
