//! In-Process Counter Reset
//!
//! Clears the LLVM profile state of an instrumented binary so that the next
//! measurement window starts from zero, without restarting the process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  counters [begin, end)  ── fill 0x00 / 0xFF (byte coverage)      │
//! │  data     [begin, end)  ── record[i].values ─► site lists ─► 0   │
//! │  bitmap   [begin, end)  ── fill 0x00            (bitmap ABI)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One algorithm serves both record layouts; everything layout-specific is
//! read from a [`LayoutDescriptor`].
//!
//! # Concurrency
//!
//! Fills and list walks are plain, non-atomic memory operations. Callers must
//! reach a quiescent point (no instrumented code running against the same
//! image) before resetting. Distinct images may be reset in parallel.

mod layout;
mod region;
mod value_prof;


pub use layout::{
    BasicProfileData, BitmapProfileData, LayoutDescriptor, RecordLayout, ValueKind,
    PROFILE_DATA_ALIGNMENT, VALUE_KINDS,
};
pub use region::{BoundaryFn, ExportedRegion, RawRegion, RegionBounds};
pub use value_prof::{clear_site, SiteCounts, ValueProfNode};

use std::ptr;

use crate::result::{CoverageError, CoverageResult};

/// Format-version flag marking single-byte coverage counters
pub const VARIANT_MASK_BYTE_COVERAGE: u64 = 1 << 60;

/// Counter value meaning "not executed" in byte-coverage mode
pub const BYTE_COVERAGE_UNEXECUTED: u8 = 0xFF;

/// What a reset touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetStats {
    /// Byte written into every counter
    pub fill_byte: u8,
    /// Counter bytes overwritten
    pub counter_bytes: usize,
    /// Profile data records inspected
    pub records: usize,
    /// Value-profile nodes whose count was cleared
    pub value_nodes: usize,
    /// Bitmap bytes cleared
    pub bitmap_bytes: usize,
}

/// The regions of one profiled image
#[derive(Clone, Copy)]
pub struct ProfileRegions<'a> {
    /// Execution counters
    pub counters: &'a dyn RegionBounds,
    /// Profile data records
    pub data: &'a dyn RegionBounds,
    /// MC/DC bitmap bytes, when the binary has them
    pub bitmap: Option<&'a dyn RegionBounds>,
}

impl std::fmt::Debug for ProfileRegions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileRegions")
            .field("bitmap", &self.bitmap.is_some())
            .finish_non_exhaustive()
    }
}

/// Byte a counter is reset to for the given layout and format version
#[must_use]
pub const fn counter_fill_byte(layout: RecordLayout, format_version: u64) -> u8 {
    if layout.descriptor().honors_byte_coverage
        && format_version & VARIANT_MASK_BYTE_COVERAGE != 0
    {
        BYTE_COVERAGE_UNEXECUTED
    } else {
        0
    }
}

/// Reset a binary using the basic record layout
///
/// # Safety
///
/// Both regions must describe live memory of the profiled binary: the counter
/// region writable, the data region a dense array of [`BasicProfileData`]
/// whose value-site arrays and lists are valid. No instrumented code may run
/// against these regions during the call.
pub unsafe fn reset_basic(
    format_version: u64,
    counters: &dyn RegionBounds,
    data: &dyn RegionBounds,
) -> ResetStats {
    let regions = ProfileRegions {
        counters,
        data,
        bitmap: None,
    };
    // The basic layout has no failure mode.
    reset_with_layout(RecordLayout::Basic, format_version, &regions).unwrap_or_default()
}

/// Reset a binary using the bitmap record layout
///
/// Fails with [`CoverageError::BitmapRequired`] when either bitmap bound is
/// null. That check happens after the counters and value profiles have
/// already been cleared.
///
/// # Safety
///
/// As [`reset_basic`], with [`BitmapProfileData`] records, plus a writable
/// bitmap region whenever both of its bounds are non-null.
pub unsafe fn reset_bitmap(
    format_version: u64,
    counters: &dyn RegionBounds,
    data: &dyn RegionBounds,
    bitmap: &dyn RegionBounds,
) -> CoverageResult<ResetStats> {
    let regions = ProfileRegions {
        counters,
        data,
        bitmap: Some(bitmap),
    };
    reset_with_layout(RecordLayout::Bitmap, format_version, &regions)
}

/// Reset the regions of one binary according to `layout`
///
/// Every bound is requested exactly once, in the order counters, data,
/// bitmap. For [`RecordLayout::Basic`] the bitmap region is ignored.
///
/// # Safety
///
/// See [`reset_basic`] and [`reset_bitmap`]; records must have `layout`'s
/// shape.
pub unsafe fn reset_with_layout(
    layout: RecordLayout,
    format_version: u64,
    regions: &ProfileRegions<'_>,
) -> CoverageResult<ResetStats> {
    let descriptor = layout.descriptor();
    let mut stats = ResetStats {
        fill_byte: counter_fill_byte(layout, format_version),
        ..ResetStats::default()
    };

    let begin = regions.counters.begin();
    let end = regions.counters.end();
    stats.counter_bytes = fill(begin, end, stats.fill_byte);

    let begin = regions.data.begin();
    let end = regions.data.end();
    stats.records = region::span(begin, end) / descriptor.record_size;
    for index in 0..stats.records {
        let record = begin.add(index * descriptor.record_size);
        stats.value_nodes += clear_record_values(record, &descriptor);
    }

    if descriptor.has_bitmap {
        let (begin, end) = regions
            .bitmap
            .map_or((ptr::null_mut(), ptr::null_mut()), |bitmap| {
                (bitmap.begin(), bitmap.end())
            });
        if begin.is_null() || end.is_null() {
            tracing::debug!(
                counter_bytes = stats.counter_bytes,
                records = stats.records,
                "bitmap bounds missing after counters were cleared"
            );
            return Err(CoverageError::BitmapRequired);
        }
        stats.bitmap_bytes = fill(begin, end, 0);
    }

    tracing::trace!(
        ?layout,
        fill_byte = stats.fill_byte,
        counter_bytes = stats.counter_bytes,
        records = stats.records,
        value_nodes = stats.value_nodes,
        bitmap_bytes = stats.bitmap_bytes,
        "profile counters reset"
    );
    Ok(stats)
}

/// Fill `[begin, end)` with `byte`; returns the number of bytes written
unsafe fn fill(begin: *mut u8, end: *mut u8, byte: u8) -> usize {
    let len = region::span(begin, end);
    if len > 0 {
        ptr::write_bytes(begin, byte, len);
    }
    len
}

/// Clear the value-site lists of the record at `record`
unsafe fn clear_record_values(record: *mut u8, descriptor: &LayoutDescriptor) -> usize {
    let values = record
        .add(descriptor.values_offset)
        .cast::<*mut *mut ValueProfNode>()
        .read();
    if values.is_null() {
        return 0;
    }

    let sites: usize = ValueKind::ALL
        .iter()
        .map(|&kind| usize::from(record.add(descriptor.site_count_offset(kind)).cast::<u16>().read()))
        .sum();

    (0..sites).map(|site| clear_site(values.add(site).read())).sum()
}
