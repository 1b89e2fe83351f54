//! covcollect: In-Process LLVM Coverage Control
//!
//! Splits the coverage of a long-running, instrumented process into
//! measurement windows without restarting it. Two leaf components do the
//! unsafe work; the rest is plumbing around them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     covcollect Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ Coverage   │    │ Covered    │    │ Symbol     │            │
//! │   │ Collector  │───►│ Binaries   │───►│ Resolver   │            │
//! │   │ (windows)  │    │ (runtime)  │    │ (Mach-O)   │            │
//! │   └────────────┘    └─────┬──────┘    └────────────┘            │
//! │                           │                                     │
//! │                           ▼                                     │
//! │                     ┌────────────┐                              │
//! │                     │ Counter    │  basic / bitmap layouts      │
//! │                     │ Reset      │                              │
//! │                     └────────────┘                              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use covcollect::{CollectorConfig, CoverageCollector, CoveredBinaries, MemoryEnv};
//!
//! let env = MemoryEnv::with_var("LLVM_PROFILE_FILE", "/tmp/app-%c.profraw");
//! let collector = CoverageCollector::with_env(
//!     CollectorConfig::default(),
//!     CoveredBinaries::default(),
//!     env,
//! )?;
//! assert_eq!(collector.profile_pattern(), "/tmp/app-%m.profraw");
//! # Ok::<(), covcollect::CoverageError>(())
//! ```

#![warn(missing_docs)]
// Lints are configured in workspace Cargo.toml [workspace.lints.clippy]

/// Mach-O symbol lookup without the dynamic loader
#[allow(unsafe_code)]
pub mod image;

/// Profile counter reset for the basic and bitmap record layouts
#[allow(unsafe_code)]
pub mod reset;

#[allow(unsafe_code)]
mod binary;
mod collector;
mod config;
#[cfg(target_os = "macos")]
#[allow(unsafe_code)]
mod dyld;
mod result;
mod toolchain;

pub use binary::{
    symbol_names, CoveredBinaries, CoveredBinary, ProfileHooks, SetPageSizeFn, VersionFn, VoidFn,
    WriteFileFn,
};
pub use collector::{CoverageCollector, MemoryEnv, ProcessEnv, ProfileFileEnv};
pub use config::{CollectorConfig, ProfileFilePattern, DEFAULT_FILE_PREFIX, PROFILE_FILE_VAR};
#[cfg(target_os = "macos")]
pub use dyld::loaded_images;
pub use image::{resolve, LoadedImage, SymbolAddress};
pub use reset::{reset_basic, reset_bitmap, RegionBounds, ResetStats};
pub use result::{CoverageError, CoverageResult};
pub use toolchain::{Toolchain, VARIANT_MASKS_ALL};
