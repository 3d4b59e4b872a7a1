use crate::setting::{CompilerSetting, Scenario};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const CODE_ENTRY: &str = "code.c";
const REDUCED_CODE_ENTRY: &str = "reduced_code.c";
const INFO_ENTRY: &str = "case.json";

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Case I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Case (de)serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Case archive {path:?} has no '{entry}' entry")]
    MissingEntry { path: PathBuf, entry: &'static str },
}

/// A program together with a marker that `bad_setting` keeps alive
/// while every one of `good_settings` eliminates it.
///
/// `reduced_code`, `bisection` and `path` are never set by discovery;
/// later pipeline stages fill them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub code: String,
    pub marker: String,
    pub bad_setting: CompilerSetting,
    pub good_settings: Vec<CompilerSetting>,
    pub scenario: Scenario,
    #[serde(default)]
    pub reduced_code: Option<String>,
    #[serde(default)]
    pub bisection: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Everything in a case archive apart from the source files.
#[derive(Debug, Serialize, Deserialize)]
struct CaseInfo {
    marker: String,
    bad_setting: CompilerSetting,
    good_settings: Vec<CompilerSetting>,
    scenario: Scenario,
    #[serde(default)]
    bisection: Option<String>,
    #[serde(default)]
    path: Option<PathBuf>,
}

impl Case {
    pub fn new(
        code: impl Into<String>,
        marker: impl Into<String>,
        bad_setting: CompilerSetting,
        good_settings: Vec<CompilerSetting>,
        scenario: Scenario,
    ) -> Self {
        Self {
            code: code.into(),
            marker: marker.into(),
            bad_setting,
            good_settings,
            scenario,
            reduced_code: None,
            bisection: None,
            path: None,
        }
    }

    /// Single-line JSON record, the unit sent over the worker channel.
    pub fn to_json_line(&self) -> Result<String, CaseError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(line: &str) -> Result<Self, CaseError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Stable 63-bit digest of the case's canonical JSON form.
    ///
    /// The first eight bytes of the MD5 digest are read as a signed
    /// integer and folded to their magnitude, so the result always fits
    /// in 19 decimal digits.
    pub fn fingerprint(&self) -> Result<u64, CaseError> {
        let canonical = self.to_json_line()?;
        let digest = md5::compute(canonical.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.0[..8]);
        Ok(i64::from_le_bytes(head).unsigned_abs())
    }

    /// File name for the `counter`-th archive of a run: `case_<counter>-<fingerprint>.tar`.
    pub fn archive_name(&self, counter: u64) -> Result<String, CaseError> {
        Ok(format!("case_{:08}-{:019}.tar", counter, self.fingerprint()?))
    }

    /// Writes the case as a tar archive at `path`.
    pub fn to_file(&self, path: &Path) -> Result<(), CaseError> {
        let info = CaseInfo {
            marker: self.marker.clone(),
            bad_setting: self.bad_setting.clone(),
            good_settings: self.good_settings.clone(),
            scenario: self.scenario.clone(),
            bisection: self.bisection.clone(),
            path: self.path.clone(),
        };
        let info_json = serde_json::to_vec_pretty(&info)?;

        let writer = BufWriter::new(File::create(path)?);
        let mut archive = tar::Builder::new(writer);
        append_entry(&mut archive, CODE_ENTRY, self.code.as_bytes())?;
        append_entry(&mut archive, INFO_ENTRY, &info_json)?;
        if let Some(reduced) = &self.reduced_code {
            append_entry(&mut archive, REDUCED_CODE_ENTRY, reduced.as_bytes())?;
        }
        archive.into_inner()?.flush()?;
        Ok(())
    }

    /// Reads back an archive written by [`Case::to_file`].
    pub fn from_file(path: &Path) -> Result<Self, CaseError> {
        let mut archive = tar::Archive::new(File::open(path)?);

        let mut code = None;
        let mut reduced_code = None;
        let mut info = None;
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut content = String::new();
            entry.read_to_string(&mut content)?;
            match name.as_str() {
                CODE_ENTRY => code = Some(content),
                REDUCED_CODE_ENTRY => reduced_code = Some(content),
                INFO_ENTRY => info = Some(serde_json::from_str::<CaseInfo>(&content)?),
                _ => {}
            }
        }

        let missing = |entry| CaseError::MissingEntry {
            path: path.to_path_buf(),
            entry,
        };
        let code = code.ok_or_else(|| missing(CODE_ENTRY))?;
        let info = info.ok_or_else(|| missing(INFO_ENTRY))?;

        Ok(Case {
            code,
            marker: info.marker,
            bad_setting: info.bad_setting,
            good_settings: info.good_settings,
            scenario: info.scenario,
            reduced_code,
            bisection: info.bisection,
            path: info.path,
        })
    }
}

fn append_entry<W: Write>(
    archive: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> std::io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, name, data)
}
