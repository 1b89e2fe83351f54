//! Profile runtime generations.
//!
//! Each LLVM release that changed the in-memory profile data record bumped
//! the raw profile version the runtime reports through
//! `__llvm_profile_get_version`. The upper 32 bits of that value carry
//! variant flags and are masked off before matching.

use serde::{Deserialize, Serialize};

use crate::reset::RecordLayout;

/// Mask covering every variant flag of a profile format version
pub const VARIANT_MASKS_ALL: u64 = 0xffff_ffff_0000_0000;

/// LLVM profile runtime generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    /// Raw profile version 8
    Llvm17,
    /// Raw profile version 9, first with MC/DC bitmaps
    Llvm18,
    /// Raw profile version 10
    Llvm19,
}

impl Toolchain {
    /// Every supported generation, oldest first
    pub const ALL: [Self; 3] = [Self::Llvm17, Self::Llvm18, Self::Llvm19];

    /// Generation that writes `format_version`, ignoring variant flags
    #[must_use]
    pub const fn from_format_version(format_version: u64) -> Option<Self> {
        match format_version & !VARIANT_MASKS_ALL {
            8 => Some(Self::Llvm17),
            9 => Some(Self::Llvm18),
            10 => Some(Self::Llvm19),
            _ => None,
        }
    }

    /// Raw profile version without variant flags
    #[must_use]
    pub const fn raw_profile_version(self) -> u64 {
        match self {
            Self::Llvm17 => 8,
            Self::Llvm18 => 9,
            Self::Llvm19 => 10,
        }
    }

    /// Shape of the profile data records this generation emits
    #[must_use]
    pub const fn record_layout(self) -> RecordLayout {
        match self {
            Self::Llvm17 => RecordLayout::Basic,
            Self::Llvm18 | Self::Llvm19 => RecordLayout::Bitmap,
        }
    }

    /// LLVM major release
    #[must_use]
    pub const fn llvm_major(self) -> u32 {
        match self {
            Self::Llvm17 => 17,
            Self::Llvm18 => 18,
            Self::Llvm19 => 19,
        }
    }
}

impl std::fmt::Display for Toolchain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LLVM {}", self.llvm_major())
    }
}
