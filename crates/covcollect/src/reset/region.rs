//! Region accessors.
//!
//! The true bounds of a profiled binary's counter, data and bitmap sections
//! are only known to its own compiled code, which exports zero-argument
//! functions returning them. [`RegionBounds`] is the capability the reset
//! engine consumes; it asks for each bound exactly once per reset.

use std::fmt;
use std::ptr;

/// Zero-argument accessor exported by an instrumented binary
pub type BoundaryFn = unsafe extern "C" fn() -> *mut u8;

/// Capability exposing the `[begin, end)` bounds of one region
pub trait RegionBounds {
    /// First byte of the region
    fn begin(&self) -> *mut u8;
    /// One past the last byte of the region
    fn end(&self) -> *mut u8;
}

impl<T: RegionBounds + ?Sized> RegionBounds for &T {
    fn begin(&self) -> *mut u8 {
        (**self).begin()
    }

    fn end(&self) -> *mut u8 {
        (**self).end()
    }
}

/// Region whose bounds come from accessor functions
///
/// A missing accessor reports a null bound.
#[derive(Clone, Copy)]
pub struct ExportedRegion {
    begin: Option<BoundaryFn>,
    end: Option<BoundaryFn>,
}

impl ExportedRegion {
    /// Region from a pair of accessors
    #[must_use]
    pub const fn new(begin: BoundaryFn, end: BoundaryFn) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
        }
    }

    /// Region from accessors that may be absent
    #[must_use]
    pub const fn from_parts(begin: Option<BoundaryFn>, end: Option<BoundaryFn>) -> Self {
        Self { begin, end }
    }

    /// Whether both accessors are present
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.begin.is_some() && self.end.is_some()
    }
}

impl RegionBounds for ExportedRegion {
    fn begin(&self) -> *mut u8 {
        // SAFETY: accessors are zero-argument functions with no preconditions.
        self.begin.map_or(ptr::null_mut(), |f| unsafe { f() })
    }

    fn end(&self) -> *mut u8 {
        // SAFETY: as above.
        self.end.map_or(ptr::null_mut(), |f| unsafe { f() })
    }
}

impl fmt::Debug for ExportedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedRegion")
            .field("begin", &self.begin.map(|p| p as usize as *const ()))
            .field("end", &self.end.map(|p| p as usize as *const ()))
            .finish()
    }
}

/// Region with fixed bounds, for callers that link against the sections
/// directly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegion {
    begin: *mut u8,
    end: *mut u8,
}

impl RawRegion {
    /// Region spanning `[begin, end)`
    #[must_use]
    pub const fn new(begin: *mut u8, end: *mut u8) -> Self {
        Self { begin, end }
    }

    /// Region covering a mutable slice
    #[must_use]
    pub fn from_slice<T>(slice: &mut [T]) -> Self {
        let range = slice.as_mut_ptr_range();
        Self::new(range.start.cast(), range.end.cast())
    }

    /// Region with both bounds null
    #[must_use]
    pub const fn null() -> Self {
        Self::new(ptr::null_mut(), ptr::null_mut())
    }

    /// Length in bytes; zero when `end` precedes `begin`
    #[must_use]
    pub fn len(&self) -> usize {
        span(self.begin, self.end)
    }

    /// Whether the region holds no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegionBounds for RawRegion {
    fn begin(&self) -> *mut u8 {
        self.begin
    }

    fn end(&self) -> *mut u8 {
        self.end
    }
}

/// Distance in bytes from `begin` to `end`, zero when inverted
#[inline]
pub(crate) fn span(begin: *mut u8, end: *mut u8) -> usize {
    (end as usize).saturating_sub(begin as usize)
}
