pub mod builder;
pub mod case;
pub mod checker;
pub mod config;
pub mod discovery;
pub mod generator;
pub mod instrument;
#[cfg(unix)]
pub mod orchestrator;
pub mod process;
pub mod setting;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use builder::{AliveMarkerSet, AsmBuilder, Builder, CompileError, MarkerScanner, Toolchains};
pub use case::{Case, CaseError};
pub use checker::{Checker, ReproductionChecker};
pub use config::{GeneratorKind, GeneratorSettings, SiftConfig};
pub use discovery::{CandidateSource, CaseDiscovery, DiscoveryError, GeneratedCandidates};
pub use generator::{CsmithGenerator, GeneratorError, ProgramGenerator, YarpgenGenerator};
pub use instrument::{InstrumentationPipeline, InstrumentedProgram, PipelineError};
#[cfg(unix)]
pub use orchestrator::{ParallelSearch, SearchError, WorkerCommand};
pub use process::{CommandRunner, ProcessOutput, RunError};
pub use setting::{CompilerSetting, OptLevel, Scenario};
pub use worker::{
    SiftDiscovery, WORKER_ID_ENV, WorkerError, build_discovery, prepare_scenario, run_worker,
};
