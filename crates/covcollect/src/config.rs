//! Collector Configuration
//!
//! Settings for [`CoverageCollector`](crate::CoverageCollector) and the
//! profile file pattern normalisation it applies on start-up.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::result::{CoverageError, CoverageResult};
use crate::toolchain::Toolchain;

/// Environment variable the LLVM profile runtime reads its file pattern from
///
/// `__llvm_profile_initialize` reads no other name, so the collector always
/// reads and writes this one.
pub const PROFILE_FILE_VAR: &str = "LLVM_PROFILE_FILE";

/// Default prefix of per-window profile files
pub const DEFAULT_FILE_PREFIX: &str = "code-coverage";

/// Configuration for a coverage collector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectorConfig {
    /// Directory that receives one profile file per measurement window
    pub temp_dir: PathBuf,
    /// File name prefix of per-window profile files
    pub file_prefix: String,
    /// Record layout to assume instead of each binary's declared version
    pub toolchain: Option<Toolchain>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            toolchain: None,
        }
    }
}

impl CollectorConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory for per-window profile files
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the per-window file name prefix
    #[must_use]
    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = prefix.into();
        self
    }

    /// Force a toolchain for every binary
    #[must_use]
    pub const fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    /// Parse and validate a JSON configuration; missing fields take defaults
    /// and unknown fields are rejected
    pub fn from_json(json: &str) -> CoverageResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values can produce usable file names
    pub fn validate(&self) -> CoverageResult<()> {
        if self.file_prefix.is_empty() || self.file_prefix.contains(['/', '\0']) {
            return Err(CoverageError::config(format!(
                "invalid file prefix {:?}",
                self.file_prefix
            )));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(CoverageError::config("temp_dir must not be empty"));
        }
        Ok(())
    }

    /// Path of the profile file for window `index` of process `pid`
    #[must_use]
    pub fn window_file(&self, pid: u32, index: u64) -> PathBuf {
        self.temp_dir
            .join(format!("{}-{pid}-{index}.profraw", self.file_prefix))
    }
}

/// A profile file pattern after normalisation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFilePattern {
    /// The normalised pattern
    pub path: String,
    /// Whether normalisation altered the input
    pub changed: bool,
    /// Whether the input requested continuous mode (`%c`)
    pub continuous: bool,
}

impl ProfileFilePattern {
    /// Drop continuous mode and make the pattern merge per binary
    ///
    /// Every `%c` is removed. Without `%m`, each binary's runtime would
    /// overwrite the others' file, so `.profraw` becomes `%m.profraw`.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let mut path = raw.replace("%c", "");
        let continuous = path.len() != raw.len();
        let mut changed = continuous;
        if !path.contains("%m") {
            path = path.replace(".profraw", "%m.profraw");
            changed = true;
        }
        Self {
            path,
            changed,
            continuous,
        }
    }
}
