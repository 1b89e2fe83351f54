//! Mach-O layout descriptors.
//!
//! The header, load commands and symbol entries the resolver reads are
//! declared as `#[repr(C)]` zerocopy types, one set per word width. Reads copy
//! a structure out of image memory with `read_from_prefix`, so callers never
//! reason about the alignment of foreign memory. [`ImageLayout`] records the
//! sizes and field offsets of those types for each width.

use std::mem::{offset_of, size_of};
use std::slice;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// 32-bit Mach-O magic (native byte order)
pub const MH_MAGIC: u32 = 0xfeed_face;
/// 64-bit Mach-O magic (native byte order)
pub const MH_MAGIC_64: u32 = 0xfeed_facf;

/// 32-bit segment load command
pub const LC_SEGMENT: u32 = 0x1;
/// Symbol table load command
pub const LC_SYMTAB: u32 = 0x2;
/// 64-bit segment load command
pub const LC_SEGMENT_64: u32 = 0x19;

/// `n_desc` flag marking a Thumb function
pub const N_ARM_THUMB_DEF: u16 = 0x0008;

/// Name of the code segment
pub const SEG_TEXT: &str = "__TEXT";
/// Name of the link-edit segment holding symbol and string tables
pub const SEG_LINKEDIT: &str = "__LINKEDIT";

/// Length of the fixed segment name field
pub const SEGNAME_LEN: usize = 16;

// =============================================================================
// Mach-O Structures
// =============================================================================

/// `mach_header`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader32 {
    /// [`MH_MAGIC`]
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Total size of the load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
}

/// `mach_header_64`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// [`MH_MAGIC_64`]
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Total size of the load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

/// `load_command`, the prefix shared by every load command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Command type
    pub cmd: u32,
    /// Total size of the command, including any trailing data
    pub cmdsize: u32,
}

/// `segment_command`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand32 {
    /// [`LC_SEGMENT`]
    pub cmd: u32,
    /// Size including section headers
    pub cmdsize: u32,
    /// NUL-padded segment name
    pub segname: [u8; SEGNAME_LEN],
    /// Link-time virtual address
    pub vmaddr: u32,
    /// Virtual memory size
    pub vmsize: u32,
    /// File offset of the contents
    pub fileoff: u32,
    /// Bytes mapped from the file
    pub filesize: u32,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of section headers that follow
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

/// `segment_command_64`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// [`LC_SEGMENT_64`]
    pub cmd: u32,
    /// Size including section headers
    pub cmdsize: u32,
    /// NUL-padded segment name
    pub segname: [u8; SEGNAME_LEN],
    /// Link-time virtual address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset of the contents
    pub fileoff: u64,
    /// Bytes mapped from the file
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of section headers that follow
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

/// `symtab_command`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// [`LC_SYMTAB`]
    pub cmd: u32,
    /// Size of this command
    pub cmdsize: u32,
    /// File offset of the symbol array
    pub symoff: u32,
    /// Number of symbol entries
    pub nsyms: u32,
    /// File offset of the string table
    pub stroff: u32,
    /// Size of the string table
    pub strsize: u32,
}

/// `nlist`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist32 {
    /// Index into the string table
    pub strx: u32,
    /// Type flags
    pub type_flags: u8,
    /// Section number
    pub sect: u8,
    /// Descriptor flags
    pub desc: u16,
    /// Link-time address
    pub value: u32,
}

/// `nlist_64`
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into the string table
    pub strx: u32,
    /// Type flags
    pub type_flags: u8,
    /// Section number
    pub sect: u8,
    /// Descriptor flags
    pub desc: u16,
    /// Link-time address
    pub value: u64,
}

// =============================================================================
// Width Descriptors
// =============================================================================

/// Word width of a loaded image, selected by its magic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageWidth {
    /// [`MachHeader32`], [`SegmentCommand32`], [`Nlist32`]
    Bits32,
    /// [`MachHeader64`], [`SegmentCommand64`], [`Nlist64`]
    Bits64,
}

impl ImageWidth {
    /// Pick the width for a header magic; `None` for anything that is not a
    /// native-endian thin Mach-O
    #[must_use]
    pub const fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            MH_MAGIC_64 => Some(Self::Bits64),
            MH_MAGIC => Some(Self::Bits32),
            _ => None,
        }
    }

    /// Layout descriptor for this width
    #[must_use]
    pub const fn layout(self) -> &'static ImageLayout {
        match self {
            Self::Bits32 => &LAYOUT_32,
            Self::Bits64 => &LAYOUT_64,
        }
    }
}

/// Sizes and field offsets of the Mach-O structures for one word width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    /// Width this descriptor belongs to
    pub width: ImageWidth,
    /// Header magic
    pub magic: u32,
    /// Size of the image header; the command table starts right after it
    pub header_size: usize,
    /// Segment command identifier for this width
    pub segment_command: u32,
    /// Size of a segment command without sections
    pub segment_command_size: usize,
    /// Offset of `vmaddr` in a segment command
    pub segment_vmaddr: usize,
    /// Offset of `fileoff` in a segment command
    pub segment_fileoff: usize,
    /// Size of one symbol table entry
    pub nlist_size: usize,
}

static LAYOUT_32: ImageLayout = ImageLayout {
    width: ImageWidth::Bits32,
    magic: MH_MAGIC,
    header_size: size_of::<MachHeader32>(),
    segment_command: LC_SEGMENT,
    segment_command_size: size_of::<SegmentCommand32>(),
    segment_vmaddr: offset_of!(SegmentCommand32, vmaddr),
    segment_fileoff: offset_of!(SegmentCommand32, fileoff),
    nlist_size: size_of::<Nlist32>(),
};

static LAYOUT_64: ImageLayout = ImageLayout {
    width: ImageWidth::Bits64,
    magic: MH_MAGIC_64,
    header_size: size_of::<MachHeader64>(),
    segment_command: LC_SEGMENT_64,
    segment_command_size: size_of::<SegmentCommand64>(),
    segment_vmaddr: offset_of!(SegmentCommand64, vmaddr),
    segment_fileoff: offset_of!(SegmentCommand64, fileoff),
    nlist_size: size_of::<Nlist64>(),
};

/// A segment command as the resolver sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// NUL-padded segment name
    pub segname: [u8; SEGNAME_LEN],
    /// Link-time virtual address
    pub vmaddr: u64,
    /// Offset of the segment's contents in the file
    pub fileoff: u64,
}

impl SegmentDescriptor {
    /// Whether the segment carries exactly `name`
    #[must_use]
    pub fn is_named(&self, name: &str) -> bool {
        fixed_name_eq(&self.segname, name.as_bytes())
    }
}

impl From<SegmentCommand32> for SegmentDescriptor {
    fn from(command: SegmentCommand32) -> Self {
        Self {
            segname: command.segname,
            vmaddr: u64::from(command.vmaddr),
            fileoff: u64::from(command.fileoff),
        }
    }
}

impl From<SegmentCommand64> for SegmentDescriptor {
    fn from(command: SegmentCommand64) -> Self {
        Self {
            segname: command.segname,
            vmaddr: command.vmaddr,
            fileoff: command.fileoff,
        }
    }
}

/// The parts of an `LC_SYMTAB` command the resolver uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableDescriptor {
    /// Offset of the symbol array from the link-edit base
    pub symoff: u32,
    /// Number of symbol entries
    pub nsyms: u32,
    /// Offset of the string table from the link-edit base
    pub stroff: u32,
}

impl From<SymtabCommand> for SymbolTableDescriptor {
    fn from(command: SymtabCommand) -> Self {
        Self {
            symoff: command.symoff,
            nsyms: command.nsyms,
            stroff: command.stroff,
        }
    }
}

/// One symbol table entry, widened to 64 bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Index into the string table; 0 means unnamed
    pub strx: u32,
    /// Descriptor flags
    pub desc: u16,
    /// Link-time address
    pub value: u64,
}

impl SymbolEntry {
    /// Whether the entry marks a Thumb function
    #[must_use]
    pub const fn is_thumb(&self) -> bool {
        self.desc & N_ARM_THUMB_DEF != 0
    }
}

impl From<Nlist32> for SymbolEntry {
    fn from(entry: Nlist32) -> Self {
        Self {
            strx: entry.strx,
            desc: entry.desc,
            value: u64::from(entry.value),
        }
    }
}

impl From<Nlist64> for SymbolEntry {
    fn from(entry: Nlist64) -> Self {
        Self {
            strx: entry.strx,
            desc: entry.desc,
            value: entry.value,
        }
    }
}

impl ImageLayout {
    /// Distance between a segment's load address and its file offset,
    /// wrapped to the image word width
    #[must_use]
    pub const fn segment_bias(&self, segment: &SegmentDescriptor) -> usize {
        match self.width {
            ImageWidth::Bits32 => (segment.vmaddr as u32).wrapping_sub(segment.fileoff as u32) as usize,
            ImageWidth::Bits64 => segment.vmaddr.wrapping_sub(segment.fileoff) as usize,
        }
    }

    /// Number of load commands declared by the header at `header`
    ///
    /// # Safety
    ///
    /// `header` must point to a readable image header of this width.
    #[inline]
    pub unsafe fn command_count(&self, header: usize) -> Option<u32> {
        match self.width {
            ImageWidth::Bits32 => read::<MachHeader32>(header).map(|h| h.ncmds),
            ImageWidth::Bits64 => read::<MachHeader64>(header).map(|h| h.ncmds),
        }
    }

    /// Decode the segment command at `command`
    ///
    /// # Safety
    ///
    /// `command` must be readable for `self.segment_command_size` bytes.
    #[inline]
    pub unsafe fn segment(&self, command: usize) -> Option<SegmentDescriptor> {
        match self.width {
            ImageWidth::Bits32 => read::<SegmentCommand32>(command).map(SegmentDescriptor::from),
            ImageWidth::Bits64 => read::<SegmentCommand64>(command).map(SegmentDescriptor::from),
        }
    }

    /// Decode the symbol table entry at `entry`
    ///
    /// # Safety
    ///
    /// `entry` must be readable for `self.nlist_size` bytes.
    #[inline]
    pub unsafe fn symbol(&self, entry: usize) -> Option<SymbolEntry> {
        match self.width {
            ImageWidth::Bits32 => read::<Nlist32>(entry).map(SymbolEntry::from),
            ImageWidth::Bits64 => read::<Nlist64>(entry).map(SymbolEntry::from),
        }
    }
}

/// Header magic of the image at `header`
///
/// # Safety
///
/// `header` must be readable for 4 bytes.
#[inline]
pub unsafe fn magic(header: usize) -> Option<u32> {
    read::<u32>(header)
}

/// Read the load command prefix at `command`
///
/// # Safety
///
/// `command` must be readable for `size_of::<LoadCommand>()` bytes.
#[inline]
pub unsafe fn load_command(command: usize) -> Option<LoadCommand> {
    read::<LoadCommand>(command)
}

/// Decode the `LC_SYMTAB` command at `command`
///
/// # Safety
///
/// `command` must be readable for `size_of::<SymtabCommand>()` bytes.
#[inline]
pub unsafe fn symbol_table(command: usize) -> Option<SymbolTableDescriptor> {
    read::<SymtabCommand>(command).map(SymbolTableDescriptor::from)
}

/// Compare the NUL-terminated string at `addr` with `expected`, stopping at
/// the first difference
///
/// # Safety
///
/// `addr` must point to a readable NUL-terminated byte string.
#[inline]
pub unsafe fn c_str_eq(addr: usize, expected: &[u8]) -> bool {
    let base = addr as *const u8;
    for (i, &want) in expected.iter().enumerate() {
        if *base.add(i) != want {
            return false;
        }
    }
    *base.add(expected.len()) == 0
}

/// `strcmp`-style comparison of a NUL-padded fixed-width name
#[must_use]
pub fn fixed_name_eq(raw: &[u8; SEGNAME_LEN], expected: &[u8]) -> bool {
    let len = raw.iter().position(|&b| b == 0).unwrap_or(SEGNAME_LEN);
    &raw[..len] == expected
}

/// Copy a `T` out of image memory at any alignment
#[inline]
unsafe fn read<T: FromBytes>(addr: usize) -> Option<T> {
    let bytes = slice::from_raw_parts(addr as *const u8, size_of::<T>());
    T::read_from_prefix(bytes).ok().map(|(value, _)| value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_width_from_magic() {
        assert_eq!(ImageWidth::from_magic(MH_MAGIC_64), Some(ImageWidth::Bits64));
        assert_eq!(ImageWidth::from_magic(MH_MAGIC), Some(ImageWidth::Bits32));
        assert_eq!(ImageWidth::from_magic(0xcafe_babe), None);
        assert_eq!(ImageWidth::from_magic(0), None);
    }

    #[test]
    fn test_layout_matches_width() {
        assert_eq!(ImageWidth::Bits32.layout().magic, MH_MAGIC);
        assert_eq!(ImageWidth::Bits64.layout().segment_command, LC_SEGMENT_64);
        assert_eq!(ImageWidth::Bits64.layout().nlist_size, 16);
        assert_eq!(ImageWidth::Bits32.layout().nlist_size, 12);
    }

    #[test]
    fn test_structures_match_loader_headers() {
        assert_eq!(size_of::<MachHeader32>(), 28);
        assert_eq!(size_of::<MachHeader64>(), 32);
        assert_eq!(size_of::<LoadCommand>(), 8);
        assert_eq!(size_of::<SegmentCommand32>(), 56);
        assert_eq!(size_of::<SegmentCommand64>(), 72);
        assert_eq!(size_of::<SymtabCommand>(), 24);
        assert_eq!(size_of::<Nlist32>(), 12);
        assert_eq!(size_of::<Nlist64>(), 16);

        assert_eq!(offset_of!(MachHeader64, ncmds), 16);
        assert_eq!(offset_of!(SegmentCommand32, segname), 8);
        assert_eq!(offset_of!(SymtabCommand, stroff), 16);
        assert_eq!(offset_of!(Nlist64, desc), 6);

        let layout = ImageWidth::Bits32.layout();
        assert_eq!((layout.segment_vmaddr, layout.segment_fileoff), (24, 32));
        let layout = ImageWidth::Bits64.layout();
        assert_eq!((layout.segment_vmaddr, layout.segment_fileoff), (24, 40));
    }

    #[test]
    fn test_reads_misaligned_commands() {
        let command = SymtabCommand {
            cmd: LC_SYMTAB,
            cmdsize: 24,
            symoff: 0x100,
            nsyms: 7,
            stroff: 0x200,
            strsize: 64,
        };
        let mut bytes = vec![0u8; 1];
        bytes.extend_from_slice(command.as_bytes());
        let addr = bytes.as_ptr() as usize + 1;

        let prefix = unsafe { load_command(addr) }.unwrap();
        assert_eq!(prefix, LoadCommand { cmd: LC_SYMTAB, cmdsize: 24 });
        let table = unsafe { symbol_table(addr) }.unwrap();
        assert_eq!(table, SymbolTableDescriptor { symoff: 0x100, nsyms: 7, stroff: 0x200 });
    }

    #[test]
    fn test_segment_decodes_per_width() {
        let mut segname = [0u8; SEGNAME_LEN];
        segname[..SEG_LINKEDIT.len()].copy_from_slice(SEG_LINKEDIT.as_bytes());
        let command = SegmentCommand32 {
            cmd: LC_SEGMENT,
            cmdsize: 56,
            segname,
            vmaddr: 0x8000,
            fileoff: 0x3000,
            ..SegmentCommand32::default()
        };
        let bytes = command.as_bytes();

        let segment = unsafe { ImageWidth::Bits32.layout().segment(bytes.as_ptr() as usize) }.unwrap();
        assert!(segment.is_named(SEG_LINKEDIT));
        assert!(!segment.is_named(SEG_TEXT));
        assert_eq!((segment.vmaddr, segment.fileoff), (0x8000, 0x3000));
    }

    #[test]
    fn test_segment_bias_wraps_at_width() {
        let seg = SegmentDescriptor {
            segname: [0; SEGNAME_LEN],
            vmaddr: 0x1000,
            fileoff: 0x2000,
        };
        assert_eq!(
            ImageWidth::Bits32.layout().segment_bias(&seg),
            0xffff_f000_usize
        );
        assert_eq!(
            ImageWidth::Bits64.layout().segment_bias(&seg) as u64,
            0xffff_ffff_ffff_f000
        );
    }

    #[test]
    fn test_fixed_name_eq() {
        let mut raw = [0u8; SEGNAME_LEN];
        raw[..6].copy_from_slice(b"__TEXT");
        assert!(fixed_name_eq(&raw, b"__TEXT"));
        assert!(!fixed_name_eq(&raw, b"__TEX"));
        assert!(!fixed_name_eq(&raw, b"__TEXT_EXEC"));

        let full = *b"0123456789abcdef";
        assert!(fixed_name_eq(&full, b"0123456789abcdef"));
    }

    #[test]
    fn test_c_str_eq_stops_at_nul() {
        let bytes = b"_main\0_other\0";
        let addr = bytes.as_ptr() as usize;
        unsafe {
            assert!(c_str_eq(addr, b"_main"));
            assert!(!c_str_eq(addr, b"_mai"));
            assert!(!c_str_eq(addr, b"_main_"));
            assert!(c_str_eq(addr + 6, b"_other"));
        }
    }

    #[test]
    fn test_thumb_flag() {
        let entry = SymbolEntry { strx: 1, desc: N_ARM_THUMB_DEF, value: 0 };
        assert!(entry.is_thumb());
        let entry = SymbolEntry::from(Nlist32 { strx: 1, desc: 0x0010, ..Nlist32::default() });
        assert!(!entry.is_thumb());
    }
}
