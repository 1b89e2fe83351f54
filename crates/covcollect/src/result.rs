//! Result and error types for covcollect.
//!
//! A symbol that cannot be found is not an error: lookups return `Option`.
//! Only conditions a caller can act on are represented here.

use thiserror::Error;

/// Result type for covcollect operations
pub type CoverageResult<T> = Result<T, CoverageError>;

/// Errors that can occur while controlling coverage collection
#[derive(Debug, Error)]
pub enum CoverageError {
    /// The bitmap ABI was asked to reset without a usable bitmap region
    #[error("bitmap pointers required")]
    BitmapRequired,

    /// The profile file variable is not set, so the runtime is not recording
    #[error("Coverage is disabled: {var} is not set")]
    CoverageDisabled {
        /// Name of the environment variable that was consulted
        var: String,
    },

    /// A measurement window is already open
    #[error("Coverage gathering already started")]
    GatheringAlreadyStarted,

    /// No measurement window is open
    #[error("Coverage gathering isn't started")]
    GatheringNotStarted,

    /// The binary uses the bitmap ABI but does not export bitmap accessors
    #[error("Binary {binary} does not export bitmap accessors")]
    BitmapCallbacksMissing {
        /// Name of the binary
        binary: String,
    },

    /// The binary declared a profile format this crate has no layout for
    #[error("Unsupported profile format version {version:#x}")]
    UnsupportedFormatVersion {
        /// Declared format version, variant flags included
        version: u64,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoverageError {
    /// Create a coverage-disabled error for the given variable
    #[must_use]
    pub fn coverage_disabled(var: impl Into<String>) -> Self {
        Self::CoverageDisabled { var: var.into() }
    }

    /// Create a missing-bitmap-accessors error for the given binary
    #[must_use]
    pub fn bitmap_callbacks_missing(binary: impl Into<String>) -> Self {
        Self::BitmapCallbacksMissing {
            binary: binary.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether retrying after fixing the caller's state can succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::UnsupportedFormatVersion { .. })
    }
}
