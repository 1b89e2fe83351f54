//! Profile data record layouts.
//!
//! The `__llvm_profile_data` record changed shape when MC/DC bitmaps were
//! introduced. Each shape is declared once as a `#[repr(C)]` struct and
//! summarised by a [`LayoutDescriptor`]; the reset engine only ever looks at
//! the descriptor, so adding a shape means adding a variant here and nothing
//! else.

use std::ffi::c_void;
use std::mem::{offset_of, size_of};

use super::value_prof::ValueProfNode;
use crate::toolchain::Toolchain;

/// Alignment of every profile data record
pub const PROFILE_DATA_ALIGNMENT: usize = 8;

/// Value-profile kinds tracked per call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum ValueKind {
    /// Targets of indirect calls
    IndirectCallTarget = 0,
    /// Sizes passed to memory intrinsics (`memcpy`, `memset`, ...)
    MemOpSize = 1,
}

impl ValueKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; VALUE_KINDS] = [Self::IndirectCallTarget, Self::MemOpSize];

    /// Index into a record's site-count array
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Number of value-profile kinds with a site count in each record
pub const VALUE_KINDS: usize = 2;

/// Profile data record without bitmap fields
#[derive(Debug, Clone, Copy)]
#[repr(C, align(8))]
pub struct BasicProfileData {
    /// Hash of the function name
    pub name_ref: u64,
    /// Structural hash of the function body
    pub func_hash: u64,
    /// Counters of this function
    pub counter_ptr: *const u8,
    /// The instrumented function
    pub function_pointer: *const c_void,
    /// Array of value-site list heads, or null
    pub values: *mut *mut ValueProfNode,
    /// Number of counters
    pub num_counters: u32,
    /// Value sites per kind
    pub num_value_sites: [u16; VALUE_KINDS],
}

/// Profile data record carrying MC/DC bitmap fields
#[derive(Debug, Clone, Copy)]
#[repr(C, align(8))]
pub struct BitmapProfileData {
    /// Hash of the function name
    pub name_ref: u64,
    /// Structural hash of the function body
    pub func_hash: u64,
    /// Counters of this function
    pub counter_ptr: *const u8,
    /// Bitmap bytes of this function
    pub bitmap_ptr: *const u8,
    /// The instrumented function
    pub function_pointer: *const c_void,
    /// Array of value-site list heads, or null
    pub values: *mut *mut ValueProfNode,
    /// Number of counters
    pub num_counters: u32,
    /// Value sites per kind
    pub num_value_sites: [u16; VALUE_KINDS],
    /// Number of bitmap bytes
    pub num_bitmap_bytes: u32,
}

macro_rules! empty_record {
    ($ty:ident { $($extra:ident: $value:expr),* }) => {
        impl Default for $ty {
            fn default() -> Self {
                Self {
                    name_ref: 0,
                    func_hash: 0,
                    counter_ptr: std::ptr::null(),
                    function_pointer: std::ptr::null(),
                    values: std::ptr::null_mut(),
                    num_counters: 0,
                    num_value_sites: [0; VALUE_KINDS],
                    $($extra: $value,)*
                }
            }
        }
    };
}

empty_record!(BasicProfileData {});
empty_record!(BitmapProfileData {
    bitmap_ptr: std::ptr::null(),
    num_bitmap_bytes: 0
});

/// Where the reset engine finds things inside one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDescriptor {
    /// Size of one record, padding included
    pub record_size: usize,
    /// Offset of the value-site array pointer
    pub values_offset: usize,
    /// Offset of the first per-kind site count (`u16` each)
    pub value_sites_offset: usize,
    /// Whether the byte-coverage variant flag selects the `0xFF` fill
    pub honors_byte_coverage: bool,
    /// Whether a bitmap region accompanies the counters
    pub has_bitmap: bool,
}

impl LayoutDescriptor {
    /// Offset of the site count for `kind`
    #[must_use]
    pub const fn site_count_offset(&self, kind: ValueKind) -> usize {
        self.value_sites_offset + kind.index() * size_of::<u16>()
    }
}

/// Closed set of record layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordLayout {
    /// Counters and value profiles only
    Basic,
    /// Counters, value profiles and MC/DC bitmap bytes
    Bitmap,
}

const BASIC: LayoutDescriptor = LayoutDescriptor {
    record_size: size_of::<BasicProfileData>(),
    values_offset: offset_of!(BasicProfileData, values),
    value_sites_offset: offset_of!(BasicProfileData, num_value_sites),
    honors_byte_coverage: true,
    has_bitmap: false,
};

const BITMAP: LayoutDescriptor = LayoutDescriptor {
    record_size: size_of::<BitmapProfileData>(),
    values_offset: offset_of!(BitmapProfileData, values),
    value_sites_offset: offset_of!(BitmapProfileData, num_value_sites),
    honors_byte_coverage: false,
    has_bitmap: true,
};

impl RecordLayout {
    /// Layout declared by a profile format version, variant flags included
    #[must_use]
    pub const fn for_format_version(format_version: u64) -> Option<Self> {
        match Toolchain::from_format_version(format_version) {
            Some(toolchain) => Some(toolchain.record_layout()),
            None => None,
        }
    }

    /// Offsets and sizes for this layout
    #[must_use]
    pub const fn descriptor(self) -> LayoutDescriptor {
        match self {
            Self::Basic => BASIC,
            Self::Bitmap => BITMAP,
        }
    }

    /// Whether resetting this layout needs a bitmap region
    #[must_use]
    pub const fn requires_bitmap(self) -> bool {
        self.descriptor().has_bitmap
    }
}
