//! Covered Binaries
//!
//! An instrumented image carries its own copy of the LLVM profile runtime.
//! [`CoveredBinary`] finds that runtime's entry points through the symbol
//! resolver and exposes the handful of operations a collector needs: point it
//! at a new profile file, flush, and clear the counters in place.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::image::LoadedImage;
use crate::reset::{self, BoundaryFn, ExportedRegion, RecordLayout, ResetStats};
use crate::result::{CoverageError, CoverageResult};
use crate::toolchain::Toolchain;

/// Mach-O names of the profile runtime entry points
pub mod symbol_names {
    /// Re-reads the profile file variable
    pub const INITIALIZE: &str = "___llvm_profile_initialize";
    /// Writes the current counters to the profile file
    pub const WRITE_FILE: &str = "___llvm_profile_write_file";
    /// Sets the page size used by continuous mode; 0 disables it
    pub const SET_PAGE_SIZE: &str = "___llvm_profile_set_page_size";
    /// Raw profile format version, variant flags included
    pub const GET_VERSION: &str = "___llvm_profile_get_version";
    /// Start of the counter section
    pub const BEGIN_COUNTERS: &str = "___llvm_profile_begin_counters";
    /// End of the counter section
    pub const END_COUNTERS: &str = "___llvm_profile_end_counters";
    /// Start of the profile data section
    pub const BEGIN_DATA: &str = "___llvm_profile_begin_data";
    /// End of the profile data section
    pub const END_DATA: &str = "___llvm_profile_end_data";
    /// Start of the MC/DC bitmap section
    pub const BEGIN_BITMAP: &str = "___llvm_profile_begin_bitmap";
    /// End of the MC/DC bitmap section
    pub const END_BITMAP: &str = "___llvm_profile_end_bitmap";

    /// Entry points every covered binary must export
    pub const REQUIRED: [&str; 8] = [
        INITIALIZE,
        WRITE_FILE,
        SET_PAGE_SIZE,
        GET_VERSION,
        BEGIN_COUNTERS,
        END_COUNTERS,
        BEGIN_DATA,
        END_DATA,
    ];
}

/// `void __llvm_profile_initialize(void)`
pub type VoidFn = unsafe extern "C" fn();
/// `void __llvm_profile_set_page_size(unsigned)`
pub type SetPageSizeFn = unsafe extern "C" fn(usize);
/// `int __llvm_profile_write_file(void)`
pub type WriteFileFn = unsafe extern "C" fn() -> c_int;
/// `uint64_t __llvm_profile_get_version(void)`
pub type VersionFn = unsafe extern "C" fn() -> u64;

/// Profile runtime entry points of one binary
#[derive(Clone, Copy)]
pub struct ProfileHooks {
    /// `__llvm_profile_initialize`
    pub initialize: VoidFn,
    /// `__llvm_profile_write_file`
    pub write_file: WriteFileFn,
    /// `__llvm_profile_set_page_size`
    pub set_page_size: SetPageSizeFn,
    /// `__llvm_profile_get_version`
    pub get_version: VersionFn,
    /// Counter section accessors
    pub counters: ExportedRegion,
    /// Profile data section accessors
    pub data: ExportedRegion,
    /// Bitmap section accessors, present only when both exist
    pub bitmap: Option<ExportedRegion>,
}

impl fmt::Debug for ProfileHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileHooks")
            .field("initialize", &self.initialize)
            .field("write_file", &self.write_file)
            .field("set_page_size", &self.set_page_size)
            .field("get_version", &self.get_version)
            .field("counters", &self.counters)
            .field("data", &self.data)
            .field("bitmap", &self.bitmap)
            .finish()
    }
}

macro_rules! hook {
    ($image:expr, $name:expr, $ty:ty) => {
        $image
            .resolve($name)
            .map(|address| std::mem::transmute::<*const c_void, $ty>(address.as_ptr()))
    };
}

impl ProfileHooks {
    /// Resolve every entry point in `image`
    ///
    /// `None` unless all [`symbol_names::REQUIRED`] symbols are present.
    ///
    /// # Safety
    ///
    /// Symbols found under the runtime's names must be functions with the
    /// runtime's signatures.
    pub unsafe fn resolve(image: &LoadedImage<'_>) -> Option<Self> {
        use symbol_names as names;

        let bitmap = match (
            hook!(image, names::BEGIN_BITMAP, BoundaryFn),
            hook!(image, names::END_BITMAP, BoundaryFn),
        ) {
            (Some(begin), Some(end)) => Some(ExportedRegion::new(begin, end)),
            _ => None,
        };

        Some(Self {
            initialize: hook!(image, names::INITIALIZE, VoidFn)?,
            write_file: hook!(image, names::WRITE_FILE, WriteFileFn)?,
            set_page_size: hook!(image, names::SET_PAGE_SIZE, SetPageSizeFn)?,
            get_version: hook!(image, names::GET_VERSION, VersionFn)?,
            counters: ExportedRegion::new(
                hook!(image, names::BEGIN_COUNTERS, BoundaryFn)?,
                hook!(image, names::END_COUNTERS, BoundaryFn)?,
            ),
            data: ExportedRegion::new(
                hook!(image, names::BEGIN_DATA, BoundaryFn)?,
                hook!(image, names::END_DATA, BoundaryFn)?,
            ),
            bitmap,
        })
    }
}

/// An instrumented image and its profile runtime
pub struct CoveredBinary {
    name: String,
    path: PathBuf,
    hooks: ProfileHooks,
}

impl CoveredBinary {
    /// Find the profile runtime of the image at `path`
    ///
    /// # Safety
    ///
    /// Same contract as [`ProfileHooks::resolve`]; additionally the image must
    /// stay loaded for as long as the returned value is used.
    pub unsafe fn locate(path: impl Into<PathBuf>, image: &LoadedImage<'_>) -> Option<Self> {
        let hooks = ProfileHooks::resolve(image)?;
        Some(Self::from_hooks(path, hooks))
    }

    /// Wrap already-resolved entry points
    ///
    /// # Safety
    ///
    /// Every hook must stay callable, with the runtime's semantics, for the
    /// lifetime of the returned value.
    pub unsafe fn from_hooks(path: impl Into<PathBuf>, hooks: ProfileHooks) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        Self { name, path, hooks }
    }

    /// File name of the image
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the image
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the image exports bitmap accessors
    #[must_use]
    pub const fn has_bitmap(&self) -> bool {
        self.hooks.bitmap.is_some()
    }

    /// Profile format version declared by the runtime, variant flags included
    #[must_use]
    pub fn profile_version(&self) -> u64 {
        // SAFETY: `from_hooks` guarantees the hook is callable.
        unsafe { (self.hooks.get_version)() }
    }

    /// Make the runtime pick up the current profile file variable
    pub fn initialize_profile_file(&self) {
        // SAFETY: as above.
        unsafe {
            (self.hooks.initialize)();
        }
    }

    /// Set the continuous-mode page size; 0 turns continuous mode off
    pub fn set_page_size(&self, size: usize) {
        // SAFETY: as above.
        unsafe {
            (self.hooks.set_page_size)(size);
        }
    }

    /// Flush counters to the current profile file
    ///
    /// Returns whether the runtime reported success.
    pub fn write(&self) -> bool {
        // SAFETY: as above.
        let status = unsafe { (self.hooks.write_file)() };
        if status != 0 {
            tracing::warn!(binary = %self.name, status, "profile runtime failed to write");
        }
        status == 0
    }

    /// Clear all counters of this binary
    ///
    /// `toolchain` forces a record layout; `None` uses the one declared by
    /// [`profile_version`](Self::profile_version). Nothing is modified when
    /// an error is returned.
    ///
    /// The caller must ensure no instrumented code of this binary runs
    /// concurrently.
    pub fn reset_counters(&self, toolchain: Option<Toolchain>) -> CoverageResult<ResetStats> {
        let version = self.profile_version();
        let layout = match toolchain {
            Some(toolchain) => toolchain.record_layout(),
            None => RecordLayout::for_format_version(version)
                .ok_or(CoverageError::UnsupportedFormatVersion { version })?,
        };

        let stats = match layout {
            // SAFETY: the accessors come from this binary's runtime, which
            // describes its own sections.
            RecordLayout::Basic => unsafe {
                reset::reset_basic(version, &self.hooks.counters, &self.hooks.data)
            },
            RecordLayout::Bitmap => {
                let bitmap = self
                    .hooks
                    .bitmap
                    .as_ref()
                    .ok_or_else(|| CoverageError::bitmap_callbacks_missing(&self.name))?;
                // SAFETY: as above.
                unsafe {
                    reset::reset_bitmap(version, &self.hooks.counters, &self.hooks.data, bitmap)?
                }
            }
        };

        tracing::debug!(
            binary = %self.name,
            version = format_args!("{version:#x}"),
            counter_bytes = stats.counter_bytes,
            records = stats.records,
            "counters reset"
        );
        Ok(stats)
    }
}

impl fmt::Debug for CoveredBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoveredBinary")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Every covered binary of a process
#[derive(Debug, Default)]
pub struct CoveredBinaries(Vec<CoveredBinary>);

impl CoveredBinaries {
    /// Wrap a list of binaries
    #[must_use]
    pub const fn new(binaries: Vec<CoveredBinary>) -> Self {
        Self(binaries)
    }

    /// Covered binaries loaded in the current process
    ///
    /// Images with a zero slide (the shared cache and the like) are skipped.
    #[cfg(target_os = "macos")]
    #[must_use]
    pub fn current_process() -> Self {
        let binaries: Vec<_> = crate::dyld::loaded_images()
            .into_iter()
            .filter(|(_, image)| image.slide() != 0)
            .filter_map(|(path, image)| {
                // SAFETY: dyld images stay mapped and follow the runtime ABI.
                unsafe { CoveredBinary::locate(path, &image) }
            })
            .inspect(|binary| {
                tracing::debug!(
                    binary = %binary.name(),
                    bitmap = binary.has_bitmap(),
                    "found covered binary"
                );
            })
            .collect();
        tracing::info!(count = binaries.len(), "covered binaries discovered");
        Self(binaries)
    }

    /// Flush every binary; returns how many writes succeeded
    pub fn write_all(&self) -> usize {
        self.0.iter().filter(|binary| binary.write()).count()
    }

    /// Re-point every runtime at the current profile file variable
    pub fn initialize_all(&self) {
        self.0.iter().for_each(CoveredBinary::initialize_profile_file);
    }

    /// Turn continuous mode off everywhere
    pub fn disable_continuous_mode(&self) {
        for binary in &self.0 {
            binary.set_page_size(0);
        }
    }

    /// Reset every binary, stopping at the first error
    pub fn reset_all(&self, toolchain: Option<Toolchain>) -> CoverageResult<Vec<ResetStats>> {
        self.0
            .iter()
            .map(|binary| binary.reset_counters(toolchain))
            .collect()
    }

    /// Unwrap into the underlying list
    #[must_use]
    pub fn into_inner(self) -> Vec<CoveredBinary> {
        self.0
    }
}

impl Deref for CoveredBinaries {
    type Target = [CoveredBinary];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromIterator<CoveredBinary> for CoveredBinaries {
    fn from_iter<I: IntoIterator<Item = CoveredBinary>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<CoveredBinary>> for CoveredBinaries {
    fn from(binaries: Vec<CoveredBinary>) -> Self {
        Self(binaries)
    }
}
