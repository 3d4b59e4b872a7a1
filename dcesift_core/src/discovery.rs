//! The generate, analyze, verify loop that yields one case per call.

use crate::builder::{AliveMarkerSet, Builder, CompileError};
use crate::case::Case;
use crate::checker::Checker;
use crate::generator::ProgramGenerator;
use crate::instrument::{InstrumentationPipeline, InstrumentedProgram, PipelineError};
use crate::setting::{CompilerSetting, OptLevel, Scenario};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Candidate pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Supplies instrumented programs to analyze.
pub trait CandidateSource: Send {
    fn next_candidate(&mut self, extra_flags: &[String]) -> Result<InstrumentedProgram, PipelineError>;
}

/// Draws candidates from a program generator through the instrumentation pipeline.
pub struct GeneratedCandidates {
    generator: Box<dyn ProgramGenerator>,
    pipeline: InstrumentationPipeline,
}

impl GeneratedCandidates {
    pub fn new(generator: Box<dyn ProgramGenerator>, pipeline: InstrumentationPipeline) -> Self {
        Self {
            generator,
            pipeline,
        }
    }

    pub fn generator(&self) -> &dyn ProgramGenerator {
        self.generator.as_ref()
    }
}

impl CandidateSource for GeneratedCandidates {
    fn next_candidate(&mut self, extra_flags: &[String]) -> Result<InstrumentedProgram, PipelineError> {
        self.pipeline.generate_file(self.generator.as_mut(), extra_flags)
    }
}

/// A marker kept alive by `bad_setting` but eliminated by every one of
/// `good_settings`, where some good setting shares the bad one's tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence<'s> {
    pub marker: String,
    pub bad_setting: &'s CompilerSetting,
    pub good_settings: Vec<&'s CompilerSetting>,
}

impl Divergence<'_> {
    pub fn into_case(self, code: &str, scenario: &Scenario) -> Case {
        Case::new(
            code,
            self.marker,
            self.bad_setting.clone(),
            self.good_settings.into_iter().cloned().collect(),
            scenario.clone(),
        )
    }
}

/// Lists every tentative divergence between the alive sets of targets and
/// attackers. Markers are visited in ascending order, targets in the order given.
pub fn find_divergences<'s>(
    targets: &[(&'s CompilerSetting, AliveMarkerSet)],
    attackers: &[(&'s CompilerSetting, AliveMarkerSet)],
) -> Vec<Divergence<'s>> {
    let target_alive: BTreeSet<&String> = targets.iter().flat_map(|(_, alive)| alive).collect();

    let mut divergences = Vec::new();
    for marker in target_alive {
        let good: Vec<&'s CompilerSetting> = attackers
            .iter()
            .filter(|(_, alive)| !alive.contains(marker))
            .map(|(setting, _)| *setting)
            .collect();
        if good.is_empty() {
            continue;
        }
        let good_tiers: BTreeSet<OptLevel> = good.iter().map(|s| s.opt_level).collect();

        for (bad, alive) in targets {
            if alive.contains(marker) && good_tiers.contains(&bad.opt_level) {
                divergences.push(Divergence {
                    marker: marker.clone(),
                    bad_setting: *bad,
                    good_settings: good.clone(),
                });
            }
        }
    }
    divergences
}

/// Searches for one missed-optimization case at a time.
pub struct CaseDiscovery<S, B, C> {
    source: S,
    builder: B,
    checker: C,
    attempts: u64,
}

impl<S: CandidateSource, B: Builder, C: Checker> CaseDiscovery<S, B, C> {
    pub fn new(source: S, builder: B, checker: C) -> Self {
        Self {
            source,
            builder,
            checker,
            attempts: 0,
        }
    }

    /// Attempts made so far across all `discover` calls.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Blocks until a checked case turns up. Only a fatal pipeline error ends the search early.
    pub fn discover(&mut self, scenario: &Scenario) -> Result<Case, DiscoveryError> {
        loop {
            self.attempts += 1;
            let attempt = self.attempts;
            debug!(attempt, "Starting attempt");

            let program = self.source.next_candidate(&scenario.flags)?;

            let (targets, attackers) = match self.alive_sets(&program, scenario) {
                Ok(sets) => sets,
                Err(e) => {
                    debug!(attempt, "Abandoning candidate: {e}");
                    continue;
                }
            };

            for divergence in find_divergences(&targets, &attackers) {
                let case = divergence.into_case(&program.code, scenario);
                match self.checker.is_interesting(&case) {
                    Ok(true) => {
                        info!("Try {attempt}: Found case! LENGTH: {}", case.code.len());
                        return Ok(case);
                    }
                    Ok(false) => {
                        debug!(attempt, marker = %case.marker, bad = %case.bad_setting, "Case rejected by checker");
                    }
                    Err(e) => {
                        debug!(attempt, marker = %case.marker, "Discarding case: {e}");
                    }
                }
            }
            debug!(attempt, "No confirmed divergence in candidate");
        }
    }

    #[allow(clippy::type_complexity)]
    fn alive_sets<'s>(
        &self,
        program: &InstrumentedProgram,
        scenario: &'s Scenario,
    ) -> Result<
        (
            Vec<(&'s CompilerSetting, AliveMarkerSet)>,
            Vec<(&'s CompilerSetting, AliveMarkerSet)>,
        ),
        CompileError,
    > {
        let compute = |settings: &'s [CompilerSetting]| {
            settings
                .iter()
                .map(|setting| {
                    self.builder
                        .find_alive_markers(&program.code, setting, &program.marker_prefix)
                        .map(|alive| (setting, alive))
                })
                .collect::<Result<Vec<_>, CompileError>>()
        };
        Ok((
            compute(scenario.target_settings.as_slice())?,
            compute(scenario.attacker_settings.as_slice())?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn setting(compiler: &str, level: OptLevel) -> CompilerSetting {
        CompilerSetting::new(compiler, "trunk", level)
    }

    fn markers(names: &[&str]) -> AliveMarkerSet {
        names.iter().map(|n| n.to_string()).collect()
    }

    /// Hands out a fixed list of programs, then a fatal error.
    struct QueuedSource {
        programs: VecDeque<String>,
        seen_flags: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl QueuedSource {
        fn new(programs: &[&str]) -> Self {
            Self {
                programs: programs.iter().map(|p| p.to_string()).collect(),
                seen_flags: Arc::default(),
            }
        }
    }

    impl CandidateSource for QueuedSource {
        fn next_candidate(&mut self, extra_flags: &[String]) -> Result<InstrumentedProgram, PipelineError> {
            self.seen_flags.lock().unwrap().push(extra_flags.to_vec());
            match self.programs.pop_front() {
                Some(code) => Ok(InstrumentedProgram {
                    marker_prefix: "DCEMarker".to_string(),
                    code,
                }),
                None => Err(PipelineError::Generator(GeneratorError::Exhausted {
                    tool: "queued",
                    attempts: 10,
                })),
            }
        }
    }

    /// Alive sets keyed by `(code, compiler)`.
    #[derive(Default)]
    struct TableBuilder {
        table: HashMap<(String, String), Result<AliveMarkerSet, CompileError>>,
    }

    impl TableBuilder {
        fn alive(mut self, code: &str, compiler: &str, names: &[&str]) -> Self {
            self.table
                .insert((code.to_string(), compiler.to_string()), Ok(markers(names)));
            self
        }

        fn failing(mut self, code: &str, compiler: &str) -> Self {
            self.table.insert(
                (code.to_string(), compiler.to_string()),
                Err(CompileError::Failed {
                    setting: compiler.to_string(),
                    detail: "internal compiler error".to_string(),
                }),
            );
            self
        }
    }

    impl Builder for TableBuilder {
        fn find_alive_markers(
            &self,
            code: &str,
            setting: &CompilerSetting,
            _marker_prefix: &str,
        ) -> Result<AliveMarkerSet, CompileError> {
            self.table
                .get(&(code.to_string(), setting.compiler.clone()))
                .cloned()
                .unwrap_or_else(|| Ok(AliveMarkerSet::new()))
        }
    }

    /// Accepts or rejects through a closure and counts calls.
    struct FnChecker<F> {
        verdict: F,
        calls: AtomicUsize,
    }

    impl<F> FnChecker<F>
    where
        F: Fn(&Case) -> Result<bool, CompileError> + Send + Sync,
    {
        fn new(verdict: F) -> Self {
            Self {
                verdict,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl<F> Checker for FnChecker<F>
    where
        F: Fn(&Case) -> Result<bool, CompileError> + Send + Sync,
    {
        fn is_interesting(&self, case: &Case) -> Result<bool, CompileError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.verdict)(case)
        }
    }

    fn accept_all() -> FnChecker<impl Fn(&Case) -> Result<bool, CompileError> + Send + Sync> {
        FnChecker::new(|_: &Case| Ok(true))
    }

    fn a_vs_b() -> Scenario {
        Scenario::new(
            vec![setting("A", OptLevel::O2)],
            vec![setting("B", OptLevel::O2)],
        )
    }

    #[test]
    fn finds_marker_alive_only_under_target() {
        let builder = TableBuilder::default()
            .alive("prog", "A", &["DCEMarker3_", "DCEMarker7_"])
            .alive("prog", "B", &["DCEMarker3_"]);
        let mut discovery = CaseDiscovery::new(QueuedSource::new(&["prog"]), builder, accept_all());

        let case = discovery.discover(&a_vs_b()).unwrap();
        assert_eq!(case.code, "prog");
        assert_eq!(case.marker, "DCEMarker7_");
        assert_eq!(case.bad_setting, setting("A", OptLevel::O2));
        assert_eq!(case.good_settings, vec![setting("B", OptLevel::O2)]);
        assert_eq!(case.scenario, a_vs_b());
        assert_eq!(case.reduced_code, None);
        assert_eq!(case.bisection, None);
        assert_eq!(case.path, None);
        assert_eq!(discovery.attempts(), 1);
    }

    #[test]
    fn identical_alive_sets_move_on_to_next_attempt() {
        let builder = TableBuilder::default()
            .alive("same", "A", &["DCEMarker1_", "DCEMarker2_"])
            .alive("same", "B", &["DCEMarker1_", "DCEMarker2_"])
            .alive("diff", "A", &["DCEMarker5_"]);
        let checker = accept_all();
        let mut discovery =
            CaseDiscovery::new(QueuedSource::new(&["same", "diff"]), builder, checker);

        let case = discovery.discover(&a_vs_b()).unwrap();
        assert_eq!(case.code, "diff");
        assert_eq!(case.marker, "DCEMarker5_");
        assert_eq!(discovery.attempts(), 2);
        assert_eq!(discovery.checker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn compile_error_abandons_whole_attempt() {
        let builder = TableBuilder::default()
            .alive("broken", "A", &["DCEMarker1_"])
            .failing("broken", "B")
            .alive("ok", "A", &["DCEMarker2_"]);
        let mut discovery =
            CaseDiscovery::new(QueuedSource::new(&["broken", "ok"]), builder, accept_all());

        let case = discovery.discover(&a_vs_b()).unwrap();
        assert_eq!(case.code, "ok");
        assert_eq!(discovery.checker.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn checker_compile_error_discards_only_that_case() {
        let scenario = Scenario::new(
            vec![setting("A", OptLevel::O2)],
            vec![setting("B", OptLevel::O2)],
        );
        let builder = TableBuilder::default()
            .alive("prog", "A", &["DCEMarker1_", "DCEMarker2_"]);
        let checker = FnChecker::new(|case: &Case| {
            if case.marker == "DCEMarker1_" {
                Err(CompileError::Timeout {
                    setting: "B@trunk:O2".to_string(),
                })
            } else {
                Ok(true)
            }
        });
        let mut discovery = CaseDiscovery::new(QueuedSource::new(&["prog"]), builder, checker);

        let case = discovery.discover(&scenario).unwrap();
        assert_eq!(case.marker, "DCEMarker2_");
        assert_eq!(discovery.attempts(), 1);
    }

    #[test]
    fn rejected_cases_do_not_end_the_search() {
        let builder = TableBuilder::default()
            .alive("first", "A", &["DCEMarker1_"])
            .alive("second", "A", &["DCEMarker1_"]);
        let checker = FnChecker::new(|case: &Case| Ok(case.code == "second"));
        let mut discovery =
            CaseDiscovery::new(QueuedSource::new(&["first", "second"]), builder, checker);

        assert_eq!(discovery.discover(&a_vs_b()).unwrap().code, "second");
        assert_eq!(discovery.attempts(), 2);
    }

    #[test]
    fn pipeline_failure_is_fatal() {
        let builder = TableBuilder::default().alive("x", "A", &[]).alive("x", "B", &[]);
        let mut discovery = CaseDiscovery::new(QueuedSource::new(&["x"]), builder, accept_all());

        let err = discovery.discover(&a_vs_b()).unwrap_err();
        assert!(matches!(
            err,
            DiscoveryError::Pipeline(PipelineError::Generator(GeneratorError::Exhausted { .. }))
        ));
        assert_eq!(discovery.attempts(), 2);
    }

    #[test]
    fn scenario_flags_reach_the_candidate_source() {
        let mut scenario = a_vs_b();
        scenario.add_flags(["-I/opt/csmith/include"]);
        let builder = TableBuilder::default().alive("prog", "A", &["DCEMarker1_"]);
        let source = QueuedSource::new(&["prog"]);
        let seen = Arc::clone(&source.seen_flags);
        let mut discovery = CaseDiscovery::new(source, builder, accept_all());

        discovery.discover(&scenario).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![vec!["-I/opt/csmith/include".to_string()]]);
    }

    #[test]
    fn tiers_must_match_between_bad_and_good() {
        let (a2, a3, b2) = (
            setting("A", OptLevel::O2),
            setting("A", OptLevel::O3),
            setting("B", OptLevel::O2),
        );
        let targets = vec![
            (&a3, markers(&["DCEMarker4_"])),
            (&a2, markers(&["DCEMarker4_"])),
        ];
        let attackers = vec![(&b2, markers(&[]))];

        let divergences = find_divergences(&targets, &attackers);
        assert_eq!(divergences.len(), 1);
        assert_eq!(divergences[0].bad_setting, &a2);
        assert_eq!(divergences[0].good_settings, vec![&b2]);
    }

    #[test]
    fn divergences_follow_marker_then_target_order() {
        let (t1, t2) = (setting("T1", OptLevel::O1), setting("T2", OptLevel::O1));
        let (g1, g2) = (setting("G1", OptLevel::O1), setting("G2", OptLevel::O1));
        let targets = vec![
            (&t1, markers(&["DCEMarker9_", "DCEMarker10_"])),
            (&t2, markers(&["DCEMarker10_"])),
        ];
        let attackers = vec![
            (&g1, markers(&["DCEMarker9_"])),
            (&g2, markers(&[])),
        ];

        let found: Vec<(String, &str, Vec<&str>)> = find_divergences(&targets, &attackers)
            .into_iter()
            .map(|d| {
                (
                    d.marker,
                    d.bad_setting.compiler.as_str(),
                    d.good_settings.iter().map(|g| g.compiler.as_str()).collect(),
                )
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("DCEMarker10_".to_string(), "T1", vec!["G1", "G2"]),
                ("DCEMarker10_".to_string(), "T2", vec!["G1", "G2"]),
                ("DCEMarker9_".to_string(), "T1", vec!["G2"]),
            ]
        );
    }

    #[test]
    fn every_divergence_satisfies_the_case_invariant() {
        let settings: Vec<CompilerSetting> = [
            ("T1", OptLevel::O1),
            ("T2", OptLevel::O3),
            ("G1", OptLevel::O1),
            ("G2", OptLevel::O3),
            ("G3", OptLevel::Os),
        ]
        .into_iter()
        .map(|(c, l)| setting(c, l))
        .collect();
        let targets = vec![
            (&settings[0], markers(&["DCEMarker1_", "DCEMarker2_", "DCEMarker3_"])),
            (&settings[1], markers(&["DCEMarker2_", "DCEMarker4_"])),
        ];
        let attackers = vec![
            (&settings[2], markers(&["DCEMarker1_"])),
            (&settings[3], markers(&["DCEMarker2_", "DCEMarker3_"])),
            (&settings[4], markers(&["DCEMarker4_"])),
        ];
        let alive_of = |s: &CompilerSetting| {
            targets
                .iter()
                .chain(&attackers)
                .find(|(setting, _)| *setting == s)
                .map(|(_, alive)| alive.clone())
                .unwrap()
        };

        let divergences = find_divergences(&targets, &attackers);
        assert!(!divergences.is_empty());
        for d in divergences {
            assert!(alive_of(d.bad_setting).contains(&d.marker));
            for good in &d.good_settings {
                assert!(!alive_of(good).contains(&d.marker));
            }
            assert!(d.good_settings.iter().any(|g| g.opt_level == d.bad_setting.opt_level));
        }
    }
}
