//! Loader-Independent Symbol Resolution
//!
//! Finds a named symbol in a Mach-O image that is already mapped into the
//! current process, without asking the dynamic loader. The command table is
//! walked once per lookup to find `__TEXT`, `__LINKEDIT` and `LC_SYMTAB`;
//! the symbol table is then scanned in order and the first exact name match
//! wins.
//!
//! ```text
//! header ─► load commands ─► __LINKEDIT (vmaddr, fileoff) ─┐
//!                         └► LC_SYMTAB (symoff, stroff) ───┴─► nlist[] ─► slide + n_value
//! ```
//!
//! Lookups never allocate, never log, and report absence as `None`: many
//! symbols are legitimately missing depending on how a binary was built.

mod layout;
#[cfg(any(test, feature = "test-support"))]
pub mod synthetic;

#[cfg(test)]
mod tests;

pub use layout::{
    fixed_name_eq, ImageLayout, ImageWidth, LoadCommand, MachHeader32, MachHeader64, Nlist32,
    Nlist64, SegmentCommand32, SegmentCommand64, SegmentDescriptor, SymbolEntry,
    SymbolTableDescriptor, SymtabCommand, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB, MH_MAGIC,
    MH_MAGIC_64, N_ARM_THUMB_DEF, SEGNAME_LEN, SEG_LINKEDIT, SEG_TEXT,
};

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// Runtime address of a resolved symbol
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolAddress(NonZeroUsize);

impl SymbolAddress {
    /// Address as an integer
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0.get()
    }

    /// Address as an untyped pointer
    #[inline]
    #[must_use]
    pub const fn as_ptr(self) -> *const c_void {
        self.0.get() as *const c_void
    }

    /// Whether the low bit marks a Thumb entry point
    #[inline]
    #[must_use]
    pub const fn is_thumb(self) -> bool {
        self.0.get() & 1 == 1
    }
}

impl fmt::Debug for SymbolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolAddress({:#x})", self.0.get())
    }
}

impl fmt::Display for SymbolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0.get())
    }
}

/// A Mach-O image mapped into this process, paired with its slide
///
/// The lifetime ties the handle to whatever owns the mapping; images handed
/// out by the dynamic loader are `LoadedImage<'static>`.
#[derive(Clone, Copy)]
pub struct LoadedImage<'a> {
    header: NonNull<u8>,
    slide: isize,
    _mapping: PhantomData<&'a [u8]>,
}

// The handle only ever reads the mapping.
unsafe impl Send for LoadedImage<'_> {}
unsafe impl Sync for LoadedImage<'_> {}

impl LoadedImage<'_> {
    /// Wrap a header pointer; `None` when the pointer is null
    ///
    /// # Safety
    ///
    /// `header` must point to a well-formed Mach-O image that stays mapped for
    /// the handle's lifetime, laid out so that `slide + (vmaddr - fileoff)` of its
    /// `__LINKEDIT` segment addresses the link-edit data in memory.
    #[must_use]
    pub unsafe fn new(header: *const u8, slide: isize) -> Option<Self> {
        NonNull::new(header.cast_mut()).map(|header| Self {
            header,
            slide,
            _mapping: PhantomData,
        })
    }

    /// Pointer to the image header
    #[must_use]
    pub const fn header(&self) -> *const u8 {
        self.header.as_ptr()
    }

    /// Relocation offset between link-time and load-time addresses
    #[must_use]
    pub const fn slide(&self) -> isize {
        self.slide
    }

    /// Word width declared by the header magic
    #[must_use]
    pub fn width(&self) -> Option<ImageWidth> {
        // SAFETY: `new` requires a readable header; the magic is its first field.
        unsafe { layout::magic(self.header.as_ptr() as usize) }.and_then(ImageWidth::from_magic)
    }

    /// Look up `symbol` by its exact (mangled) name
    #[must_use]
    pub fn resolve(&self, symbol: &str) -> Option<SymbolAddress> {
        // SAFETY: the constructor's contract covers the whole image.
        unsafe { resolve(symbol, self.header.as_ptr(), self.slide) }
    }
}

impl fmt::Debug for LoadedImage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedImage")
            .field("header", &self.header)
            .field("slide", &format_args!("{:#x}", self.slide))
            .finish()
    }
}

/// Return the runtime address of `symbol` in the image at `header`
///
/// Returns `None` when `header` is null, `symbol` is empty or contains a NUL,
/// the magic is not a native Mach-O magic, any of `__TEXT`, `__LINKEDIT` or
/// `LC_SYMTAB` is missing, or no entry carries the name.
///
/// Headers with any other magic are rejected rather than parsed as 32-bit
/// images, so byte-swapped and fat headers are never misread.
///
/// # Safety
///
/// A non-null `header` must point to a well-formed, mapped Mach-O image whose
/// link-edit data sits at `slide + (linkedit.vmaddr - linkedit.fileoff)`.
/// Corrupt command or symbol tables are undefined behavior.
#[must_use]
pub unsafe fn resolve(symbol: &str, header: *const u8, slide: isize) -> Option<SymbolAddress> {
    if header.is_null() || symbol.is_empty() || symbol.as_bytes().contains(&0) {
        return None;
    }
    let header = header as usize;
    let width = ImageWidth::from_magic(layout::magic(header)?)?;
    find_symbol(symbol.as_bytes(), header, slide, width.layout())
}

/// Commands the resolver needs, located in one pass over the command table
#[derive(Debug, Clone, Copy)]
struct RequiredCommands {
    linkedit: SegmentDescriptor,
    symtab: SymbolTableDescriptor,
}

unsafe fn scan_commands(header: usize, layout: &ImageLayout) -> Option<RequiredCommands> {
    let mut has_text = false;
    let mut linkedit = None;
    let mut symtab = None;

    let mut cursor = header + layout.header_size;
    for _ in 0..layout.command_count(header)? {
        let command = layout::load_command(cursor)?;
        if command.cmd == layout.segment_command {
            let segment = layout.segment(cursor)?;
            if segment.is_named(SEG_TEXT) {
                has_text = true;
            } else if segment.is_named(SEG_LINKEDIT) {
                linkedit = Some(segment);
            }
        } else if command.cmd == LC_SYMTAB {
            symtab = Some(layout::symbol_table(cursor)?);
        }
        cursor = cursor.wrapping_add(command.cmdsize as usize);
    }

    // __TEXT only has to be present
    if !has_text {
        return None;
    }
    Some(RequiredCommands {
        linkedit: linkedit?,
        symtab: symtab?,
    })
}

unsafe fn find_symbol(
    symbol: &[u8],
    header: usize,
    slide: isize,
    layout: &ImageLayout,
) -> Option<SymbolAddress> {
    let commands = scan_commands(header, layout)?;

    let linkedit_base = (slide as usize).wrapping_add(layout.segment_bias(&commands.linkedit));
    let symbols = linkedit_base.wrapping_add(commands.symtab.symoff as usize);
    let strings = linkedit_base.wrapping_add(commands.symtab.stroff as usize);

    for index in 0..commands.symtab.nsyms as usize {
        let entry = layout.symbol(symbols + index * layout.nlist_size)?;
        if entry.strx == 0 || !layout::c_str_eq(strings + entry.strx as usize, symbol) {
            continue;
        }
        let mut address = (slide as usize).wrapping_add(entry.value as usize);
        if entry.is_thumb() {
            address |= 1;
        }
        return NonZeroUsize::new(address).map(SymbolAddress);
    }
    None
}
