//! Coverage Collector
//!
//! Splits a process's coverage into measurement windows. Each window gets
//! its own profile file: opening a window flushes what was recorded so far,
//! points every runtime at a fresh file and clears the counters; closing it
//! flushes into that file and restores the original pattern.
//!
//! ```text
//! new ──► base pattern ──start──► <temp>/<prefix>-<pid>-<n>.profraw ──stop──► base pattern
//!              ▲                                                             │
//!              └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Whether a window is open is read back from the profile file variable, so
//! the collector agrees with whatever the runtimes will actually write to.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::binary::CoveredBinaries;
use crate::config::{CollectorConfig, ProfileFilePattern, PROFILE_FILE_VAR};
use crate::result::{CoverageError, CoverageResult};

/// Where the profile file variable lives
pub trait ProfileFileEnv {
    /// Current value of `var`, if set
    fn get(&self, var: &str) -> Option<String>;
    /// Set `var` to `value`
    fn set(&self, var: &str, value: &str);
}

/// The real process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl ProfileFileEnv for ProcessEnv {
    fn get(&self, var: &str) -> Option<String> {
        std::env::var(var).ok()
    }

    fn set(&self, var: &str, value: &str) {
        std::env::set_var(var, value);
    }
}

/// In-memory environment, for driving a collector without touching the
/// process environment
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: RefCell<HashMap<String, String>>,
}

impl MemoryEnv {
    /// Environment with a single variable set
    #[must_use]
    pub fn with_var(var: &str, value: &str) -> Self {
        let env = Self::default();
        env.set(var, value);
        env
    }
}

impl ProfileFileEnv for MemoryEnv {
    fn get(&self, var: &str) -> Option<String> {
        self.vars.borrow().get(var).cloned()
    }

    fn set(&self, var: &str, value: &str) {
        self.vars.borrow_mut().insert(var.to_string(), value.to_string());
    }
}

/// Drives measurement windows over a set of covered binaries
///
/// Dropping the collector flushes pending coverage.
#[derive(Debug)]
pub struct CoverageCollector<E: ProfileFileEnv = ProcessEnv> {
    config: CollectorConfig,
    binaries: CoveredBinaries,
    env: E,
    pattern: String,
    next_index: u64,
    pid: u32,
}

impl CoverageCollector<ProcessEnv> {
    /// Collector over the process environment
    pub fn new(config: CollectorConfig, binaries: CoveredBinaries) -> CoverageResult<Self> {
        Self::with_env(config, binaries, ProcessEnv)
    }

    /// Collector over every covered binary of the current process
    #[cfg(target_os = "macos")]
    pub fn for_current_process(config: CollectorConfig) -> CoverageResult<Self> {
        Self::new(config, CoveredBinaries::current_process())
    }
}

impl<E: ProfileFileEnv> CoverageCollector<E> {
    /// Collector over a custom environment
    ///
    /// Fails with [`CoverageError::CoverageDisabled`] when the profile file
    /// variable is unset. A pattern that requests continuous mode or lacks
    /// `%m` is normalised and handed back to every runtime; pending coverage
    /// is then flushed.
    pub fn with_env(config: CollectorConfig, binaries: CoveredBinaries, env: E) -> CoverageResult<Self> {
        config.validate()?;
        let raw = env
            .get(PROFILE_FILE_VAR)
            .ok_or_else(|| CoverageError::coverage_disabled(PROFILE_FILE_VAR))?;
        let pattern = ProfileFilePattern::normalize(&raw);

        let collector = Self {
            config,
            binaries,
            env,
            pattern: pattern.path,
            next_index: 0,
            pid: std::process::id(),
        };

        if pattern.changed {
            if pattern.continuous {
                tracing::debug!("disabling continuous mode");
                collector.binaries.disable_continuous_mode();
            }
            tracing::debug!(from = %raw, to = %collector.pattern, "normalised profile file pattern");
            collector.set_profile_file(&collector.pattern);
        }
        collector.binaries.write_all();

        tracing::info!(
            binaries = collector.binaries.len(),
            pattern = %collector.pattern,
            "coverage collector ready"
        );
        Ok(collector)
    }

    /// Open a measurement window; returns the file it will be written to
    ///
    /// Coverage recorded so far is flushed to the base pattern and every
    /// counter is cleared.
    pub fn start_gathering(&mut self) -> CoverageResult<PathBuf> {
        if self.current_profile_file()? != self.pattern {
            return Err(CoverageError::GatheringAlreadyStarted);
        }
        self.binaries.write_all();

        let file = self.config.window_file(self.pid, self.next_index);
        self.next_index = self.next_index.wrapping_add(1);
        self.set_profile_file(&file.to_string_lossy());

        let stats = self.binaries.reset_all(self.config.toolchain)?;
        tracing::info!(
            file = %file.display(),
            binaries = stats.len(),
            counter_bytes = stats.iter().map(|s| s.counter_bytes).sum::<usize>(),
            "coverage gathering started"
        );
        Ok(file)
    }

    /// Close the open window; returns the file it was written to
    pub fn stop_gathering(&self) -> CoverageResult<PathBuf> {
        let current = self.current_profile_file()?;
        if current == self.pattern || !Path::new(&current).starts_with(&self.config.temp_dir) {
            return Err(CoverageError::GatheringNotStarted);
        }
        let written = self.binaries.write_all();
        self.set_profile_file(&self.pattern);

        tracing::info!(file = %current, written, "coverage gathering stopped");
        Ok(PathBuf::from(current))
    }

    /// Point every runtime at `path`
    pub fn set_profile_file(&self, path: &str) {
        self.env.set(PROFILE_FILE_VAR, path);
        self.binaries.initialize_all();
    }

    /// Current value of the profile file variable
    pub fn current_profile_file(&self) -> CoverageResult<String> {
        self.env
            .get(PROFILE_FILE_VAR)
            .ok_or_else(|| CoverageError::coverage_disabled(PROFILE_FILE_VAR))
    }

    /// Whether a window is open
    #[must_use]
    pub fn is_gathering(&self) -> bool {
        self.current_profile_file()
            .is_ok_and(|current| current != self.pattern)
    }

    /// The normalised base pattern
    #[must_use]
    pub fn profile_pattern(&self) -> &str {
        &self.pattern
    }

    /// The collector's configuration
    #[must_use]
    pub const fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// The binaries under control
    #[must_use]
    pub const fn binaries(&self) -> &CoveredBinaries {
        &self.binaries
    }

    /// The environment holding the profile file variable
    #[must_use]
    pub const fn env(&self) -> &E {
        &self.env
    }
}

impl<E: ProfileFileEnv> Drop for CoverageCollector<E> {
    fn drop(&mut self) {
        self.binaries.write_all();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::binary::tests::fake_runtime as rt;
    use crate::toolchain::Toolchain;
    use std::cell::Cell;
    use tempfile::TempDir;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::new("covcollect=debug"))
            .try_init();
    }

    fn collector(pattern: &str, temp: &TempDir) -> CoverageCollector<MemoryEnv> {
        let config = CollectorConfig::new().with_temp_dir(temp.path());
        let binaries = CoveredBinaries::new(vec![rt::binary("App", false)]);
        CoverageCollector::with_env(config, binaries, MemoryEnv::with_var(PROFILE_FILE_VAR, pattern))
            .unwrap()
    }

    mod setup_tests {
        use super::*;

        #[test]
        fn test_unset_variable_disables_coverage() {
            let config = CollectorConfig::new();
            let result = CoverageCollector::with_env(config, CoveredBinaries::default(), MemoryEnv::default());
            assert!(matches!(result, Err(CoverageError::CoverageDisabled { ref var }) if var == PROFILE_FILE_VAR));
        }

        #[test]
        fn test_only_the_runtime_variable_is_used() {
            let env = MemoryEnv::with_var("MY_PROFILE", "/tmp/a%m.profraw");
            let result = CoverageCollector::with_env(CollectorConfig::new(), CoveredBinaries::default(), env);
            assert!(matches!(result, Err(CoverageError::CoverageDisabled { ref var }) if var == "LLVM_PROFILE_FILE"));

            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            collector.env().set("MY_PROFILE", "/data/other.profraw");
            let file = collector.start_gathering().unwrap();
            assert_eq!(
                collector.env().get(PROFILE_FILE_VAR),
                Some(file.to_string_lossy().into_owned())
            );
            assert_eq!(collector.env().get("MY_PROFILE").as_deref(), Some("/data/other.profraw"));
        }

        #[test]
        fn test_invalid_config_is_rejected() {
            let config = CollectorConfig::new().with_file_prefix("");
            let env = MemoryEnv::with_var(PROFILE_FILE_VAR, "/tmp/a%m.profraw");
            let result = CoverageCollector::with_env(config, CoveredBinaries::default(), env);
            assert!(matches!(result, Err(CoverageError::Config { .. })));
        }

        #[test]
        fn test_normal_pattern_is_left_alone() {
            let temp = TempDir::new().unwrap();
            let collector = collector("/data/app-%m.profraw", &temp);
            assert_eq!(collector.profile_pattern(), "/data/app-%m.profraw");
            assert_eq!(rt::INITS.with(Cell::get), 0);
            assert_eq!(rt::PAGE_SIZE.with(Cell::get), None);
            assert_eq!(rt::WRITES.with(Cell::get), 1);
        }

        #[test]
        fn test_continuous_pattern_is_rewritten() {
            init_tracing();
            let temp = TempDir::new().unwrap();
            let collector = collector("/data/%cdefault.profraw", &temp);
            assert_eq!(collector.profile_pattern(), "/data/default%m.profraw");
            assert_eq!(collector.current_profile_file().unwrap(), "/data/default%m.profraw");
            assert_eq!(rt::PAGE_SIZE.with(Cell::get), Some(0));
            assert_eq!(rt::INITS.with(Cell::get), 1);
        }

        #[test]
        fn test_drop_flushes() {
            let temp = TempDir::new().unwrap();
            let collector = collector("/data/%m.profraw", &temp);
            let before = rt::WRITES.with(Cell::get);
            drop(collector);
            assert_eq!(rt::WRITES.with(Cell::get), before + 1);
        }
    }

    mod window_tests {
        use super::*;

        #[test]
        fn test_start_and_stop() {
            init_tracing();
            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            rt::VERSION.with(|v| v.set(8));

            let file = collector.start_gathering().unwrap();
            let expected = temp
                .path()
                .join(format!("code-coverage-{}-0.profraw", std::process::id()));
            assert_eq!(file, expected);
            assert!(collector.is_gathering());
            assert_eq!(rt::COUNTERS.with(|c| *c.borrow()), [0; 16]);
            assert_eq!(rt::node_counts(), vec![0, 0]);

            let stopped = collector.stop_gathering().unwrap();
            assert_eq!(stopped, expected);
            assert!(!collector.is_gathering());
            assert_eq!(collector.current_profile_file().unwrap(), "/data/%m.profraw");
        }

        #[test]
        fn test_window_index_advances() {
            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            let first = collector.start_gathering().unwrap();
            collector.stop_gathering().unwrap();
            let second = collector.start_gathering().unwrap();
            assert_ne!(first, second);
            assert!(second.to_string_lossy().ends_with("-1.profraw"));
        }

        #[test]
        fn test_double_start_fails() {
            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            collector.start_gathering().unwrap();
            assert!(matches!(
                collector.start_gathering(),
                Err(CoverageError::GatheringAlreadyStarted)
            ));
        }

        #[test]
        fn test_stop_without_start_fails() {
            let temp = TempDir::new().unwrap();
            let collector = collector("/data/%m.profraw", &temp);
            assert!(matches!(
                collector.stop_gathering(),
                Err(CoverageError::GatheringNotStarted)
            ));
        }

        #[test]
        fn test_stop_with_base_pattern_inside_temp_dir_fails() {
            let temp = TempDir::new().unwrap();
            let base = temp.path().join("%m.profraw");
            let collector = collector(&base.to_string_lossy(), &temp);
            assert!(matches!(
                collector.stop_gathering(),
                Err(CoverageError::GatheringNotStarted)
            ));
        }

        #[test]
        fn test_externally_changed_file_blocks_start() {
            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            collector.env().set(PROFILE_FILE_VAR, "/elsewhere/x.profraw");
            assert!(matches!(
                collector.start_gathering(),
                Err(CoverageError::GatheringAlreadyStarted)
            ));
            assert!(matches!(
                collector.stop_gathering(),
                Err(CoverageError::GatheringNotStarted)
            ));
        }

        #[test]
        fn test_reset_error_surfaces_from_start() {
            let temp = TempDir::new().unwrap();
            let mut collector = collector("/data/%m.profraw", &temp);
            rt::VERSION.with(|v| v.set(9));
            let err = collector.start_gathering().unwrap_err();
            assert!(matches!(err, CoverageError::BitmapCallbacksMissing { .. }));
        }

        #[test]
        fn test_forced_toolchain_is_used() {
            let temp = TempDir::new().unwrap();
            let config = CollectorConfig::new()
                .with_temp_dir(temp.path())
                .with_toolchain(Toolchain::Llvm17);
            let binaries = CoveredBinaries::new(vec![rt::binary("App", false)]);
            let env = MemoryEnv::with_var(PROFILE_FILE_VAR, "/data/%m.profraw");
            let mut collector = CoverageCollector::with_env(config, binaries, env).unwrap();
            rt::VERSION.with(|v| v.set(9));
            assert!(collector.start_gathering().is_ok());
        }
    }

    mod process_env_tests {
        use super::*;

        #[test]
        fn test_process_env_round_trip() {
            let var = "COVCOLLECT_TEST_PROFILE_FILE";
            ProcessEnv.set(var, "/tmp/x%m.profraw");
            assert_eq!(ProcessEnv.get(var).as_deref(), Some("/tmp/x%m.profraw"));
        }
    }
}
