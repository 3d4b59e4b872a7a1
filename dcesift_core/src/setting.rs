use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingParseError {
    #[error("Unknown optimization level '{0}'")]
    UnknownOptLevel(String),
    #[error("Malformed compiler setting '{0}', expected compiler[@version]:O<level>")]
    Malformed(String),
}

/// Optimization tier of a compiler invocation.
///
/// Serialized as the bare level (`"2"`, `"s"`), which is also what
/// follows `-O` on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptLevel {
    #[serde(rename = "0")]
    O0,
    #[serde(rename = "1")]
    O1,
    #[serde(rename = "2")]
    O2,
    #[serde(rename = "3")]
    O3,
    #[serde(rename = "s")]
    Os,
    #[serde(rename = "z")]
    Oz,
}

impl OptLevel {
    pub fn as_flag(&self) -> &'static str {
        match self {
            OptLevel::O0 => "-O0",
            OptLevel::O1 => "-O1",
            OptLevel::O2 => "-O2",
            OptLevel::O3 => "-O3",
            OptLevel::Os => "-Os",
            OptLevel::Oz => "-Oz",
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_flag()[1..])
    }
}

impl FromStr for OptLevel {
    type Err = SettingParseError;

    /// Accepts `2`, `O2` and `-O2`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let level = s.trim_start_matches('-');
        let level = level.strip_prefix('O').unwrap_or(level);
        match level {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            "s" => Ok(OptLevel::Os),
            "z" => Ok(OptLevel::Oz),
            _ => Err(SettingParseError::UnknownOptLevel(s.to_string())),
        }
    }
}

fn default_version() -> String {
    "trunk".to_string()
}

/// One fully specified compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerSetting {
    pub compiler: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub opt_level: OptLevel,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl CompilerSetting {
    pub fn new(compiler: impl Into<String>, version: impl Into<String>, opt_level: OptLevel) -> Self {
        Self {
            compiler: compiler.into(),
            version: version.into(),
            opt_level,
            flags: Vec::new(),
        }
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn add_flag(&mut self, flag: impl Into<String>) {
        self.flags.push(flag.into());
    }

    /// Full argument list handed to the compiler, optimization flag first.
    pub fn command_line_flags(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.flags.len() + 1);
        args.push(self.opt_level.as_flag().to_string());
        args.extend(self.flags.iter().cloned());
        args
    }
}

impl fmt::Display for CompilerSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.compiler, self.version, self.opt_level)?;
        if !self.flags.is_empty() {
            write!(f, " {}", self.flags.join(" "))?;
        }
        Ok(())
    }
}

impl FromStr for CompilerSetting {
    type Err = SettingParseError;

    /// Parses `gcc@trunk:O2` or `clang:O3` (version defaults to `trunk`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (identity, level) = s
            .rsplit_once(':')
            .ok_or_else(|| SettingParseError::Malformed(s.to_string()))?;
        let (compiler, version) = match identity.split_once('@') {
            Some((compiler, version)) => (compiler, version),
            None => (identity, "trunk"),
        };
        if compiler.is_empty() || version.is_empty() {
            return Err(SettingParseError::Malformed(s.to_string()));
        }
        Ok(CompilerSetting::new(compiler, version, level.parse()?))
    }
}

/// Which settings are suspected of keeping dead code (`target_settings`)
/// and which are expected to remove it (`attacker_settings`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub target_settings: Vec<CompilerSetting>,
    pub attacker_settings: Vec<CompilerSetting>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl Scenario {
    pub fn new(
        target_settings: Vec<CompilerSetting>,
        attacker_settings: Vec<CompilerSetting>,
    ) -> Self {
        Self {
            target_settings,
            attacker_settings,
            flags: Vec::new(),
        }
    }

    /// Appends scenario-wide flags. Every target and attacker setting
    /// receives them too, so a setting alone describes its invocation.
    pub fn add_flags<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for flag in flags {
            let flag = flag.into();
            for setting in self
                .target_settings
                .iter_mut()
                .chain(self.attacker_settings.iter_mut())
            {
                setting.add_flag(flag.clone());
            }
            self.flags.push(flag);
        }
    }

    pub fn all_settings(&self) -> impl Iterator<Item = &CompilerSetting> {
        self.target_settings
            .iter()
            .chain(self.attacker_settings.iter())
    }

    /// Loads a scenario from JSON (`.json`) or TOML (anything else).
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read scenario file at {:?}: {}", path, e))?;

        let mut scenario: Scenario = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse JSON from scenario file {:?}: {}", path, e)
            })?
        } else {
            toml::from_str(&content).map_err(|e| {
                anyhow::anyhow!("Failed to parse TOML from scenario file {:?}: {}", path, e)
            })?
        };
        scenario.spread_flags();

        Ok(scenario)
    }

    /// Gives every setting the scenario-wide flags it does not carry yet.
    fn spread_flags(&mut self) {
        for setting in self
            .target_settings
            .iter_mut()
            .chain(self.attacker_settings.iter_mut())
        {
            for flag in &self.flags {
                if !setting.flags.contains(flag) {
                    setting.add_flag(flag.clone());
                }
            }
        }
    }
}
