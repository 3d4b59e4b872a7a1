use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GeneratorKind {
    #[default]
    Csmith,
    Yarpgen,
}

impl GeneratorKind {
    pub fn name(&self) -> &'static str {
        match self {
            GeneratorKind::Csmith => "csmith",
            GeneratorKind::Yarpgen => "yarpgen",
        }
    }
}

/// Settings shared by every external program generator.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GeneratorSettings {
    pub executable: PathBuf,
    #[serde(default)]
    pub include_path: Option<PathBuf>,
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

impl GeneratorSettings {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            include_path: None,
            min_size: default_min_size(),
            max_size: default_max_size(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }

    pub fn accepts_size(&self, len: usize) -> bool {
        (self.min_size..=self.max_size).contains(&len)
    }
}

fn default_min_size() -> usize {
    10_000
}

fn default_max_size() -> usize {
    50_000
}

fn default_tool_timeout_ms() -> u64 {
    8_000
}

fn default_csmith() -> GeneratorSettings {
    GeneratorSettings::new("csmith")
}

fn default_yarpgen() -> GeneratorSettings {
    GeneratorSettings::new("yarpgen")
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SearchSettings {
    #[serde(default)]
    pub generator: GeneratorKind,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub start_stop: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

pub fn default_workers() -> usize {
    1
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            generator: GeneratorKind::default(),
            workers: default_workers(),
            start_stop: false,
            seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InstrumenterSettings {
    #[serde(default = "default_instrumenter")]
    pub executable: PathBuf,
    #[serde(default = "default_marker_prefix")]
    pub marker_prefix: String,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_instrumenter() -> PathBuf {
    PathBuf::from("dcei")
}

pub fn default_marker_prefix() -> String {
    "DCEMarker".to_string()
}

impl Default for InstrumenterSettings {
    fn default() -> Self {
        Self {
            executable: default_instrumenter(),
            marker_prefix: default_marker_prefix(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }
}

/// The known-good compiler whose header search list is handed to the instrumenter.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ReferenceSettings {
    #[serde(default = "default_reference_compiler")]
    pub compiler: PathBuf,
    #[serde(default = "default_tool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_reference_compiler() -> PathBuf {
    PathBuf::from("clang")
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            compiler: default_reference_compiler(),
            timeout_ms: default_tool_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BuilderSettings {
    #[serde(default = "default_tool_timeout_ms")]
    pub compile_timeout_ms: u64,
}

impl Default for BuilderSettings {
    fn default() -> Self {
        Self {
            compile_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

/// Maps a `(compiler, version)` pair used in settings to an executable.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolchainEntry {
    pub name: String,
    pub version: String,
    pub executable: PathBuf,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SiftConfig {
    #[serde(default)]
    pub search: SearchSettings,
    #[serde(default = "default_csmith")]
    pub csmith: GeneratorSettings,
    #[serde(default = "default_yarpgen")]
    pub yarpgen: GeneratorSettings,
    #[serde(default)]
    pub instrumenter: InstrumenterSettings,
    #[serde(default)]
    pub reference: ReferenceSettings,
    #[serde(default)]
    pub builder: BuilderSettings,
    #[serde(default, rename = "toolchain")]
    pub toolchains: Vec<ToolchainEntry>,
}

impl SiftConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: SiftConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Settings of the generator selected in `[search]`.
    pub fn generator_settings(&self) -> &GeneratorSettings {
        match self.search.generator {
            GeneratorKind::Csmith => &self.csmith,
            GeneratorKind::Yarpgen => &self.yarpgen,
        }
    }
}

impl Default for SiftConfig {
    fn default() -> Self {
        Self {
            search: SearchSettings::default(),
            csmith: default_csmith(),
            yarpgen: default_yarpgen(),
            instrumenter: InstrumenterSettings::default(),
            reference: ReferenceSettings::default(),
            builder: BuilderSettings::default(),
            toolchains: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let config: SiftConfig = toml::from_str(
            r#"
[search]
generator = "yarpgen"
workers = 8
start-stop = true
seed = 1234

[csmith]
executable = "/opt/csmith/bin/csmith"
include-path = "/opt/csmith/include"
min-size = 5000
max-size = 20000

[yarpgen]
executable = "/opt/yarpgen/yarpgen"
timeout-ms = 3000

[instrumenter]
executable = "/opt/dcei/dcei"

[reference]
compiler = "/usr/bin/clang-17"

[builder]
compile-timeout-ms = 0

[[toolchain]]
name = "gcc"
version = "trunk"
executable = "/opt/gcc-trunk/bin/gcc"

[[toolchain]]
name = "clang"
version = "17"
executable = "/usr/bin/clang-17"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.search.generator, GeneratorKind::Yarpgen);
        assert_eq!(config.search.workers, 8);
        assert!(config.search.start_stop);
        assert_eq!(config.search.seed, Some(1234));
        assert_eq!(
            config.csmith.include_path.as_deref(),
            Some(Path::new("/opt/csmith/include"))
        );
        assert_eq!(config.csmith.min_size, 5000);
        assert_eq!(config.yarpgen.min_size, default_min_size());
        assert_eq!(config.yarpgen.timeout_ms, 3000);
        assert_eq!(config.instrumenter.marker_prefix, "DCEMarker");
        assert_eq!(config.builder.compile_timeout_ms, 0);
        assert_eq!(config.toolchains.len(), 2);
        assert_eq!(
            config.generator_settings().executable,
            PathBuf::from("/opt/yarpgen/yarpgen")
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: SiftConfig = toml::from_str("").expect("empty config should parse");
        assert_eq!(config.search.generator, GeneratorKind::Csmith);
        assert_eq!(config.search.workers, 1);
        assert_eq!(config.csmith.executable, PathBuf::from("csmith"));
        assert_eq!(config.reference.compiler, PathBuf::from("clang"));
        assert!(config.toolchains.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<SiftConfig, _> = toml::from_str("[search]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn size_bounds_are_inclusive() {
        let mut settings = GeneratorSettings::new("csmith");
        settings.min_size = 10;
        settings.max_size = 20;
        assert!(!settings.accepts_size(9));
        assert!(settings.accepts_size(10));
        assert!(settings.accepts_size(20));
        assert!(!settings.accepts_size(21));
    }

    #[test]
    fn load_from_file_reports_missing_file() {
        let err = SiftConfig::load_from_file(Path::new("/nonexistent/dcesift.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
