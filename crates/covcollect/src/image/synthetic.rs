//! In-memory Mach-O images for tests and benchmarks.
//!
//! Available to unit tests and, outside the crate, behind the `test-support`
//! feature. [`ImageBuilder`] lays out a header, a handful of load commands, a
//! symbol table and a string table in one 8-byte-aligned buffer. Because the
//! buffer lives wherever the allocator put it, [`SyntheticImage::load`]
//! rewrites the `__LINKEDIT` segment so that the tables are found for the
//! slide the caller wants to resolve with.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;

use zerocopy::{Immutable, IntoBytes};

use super::layout::{
    ImageWidth, LoadCommand, MachHeader32, MachHeader64, Nlist32, Nlist64, SegmentCommand32,
    SegmentCommand64, SymtabCommand, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB, N_ARM_THUMB_DEF, SEGNAME_LEN, SEG_LINKEDIT, SEG_TEXT,
};
use super::LoadedImage;

/// `LC_UUID`, used as a command the resolver must step over
const LC_UUID: u32 = 0x1b;
const UUID_COMMAND_SIZE: usize = size_of::<LoadCommand>() + 16;
const MH_DYLIB: u32 = 0x6;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_ARM64: u32 = 0x0100_000c;
const N_SECT_EXT: u8 = 0x0f;
const SEG_DATA: &str = "__DATA";

#[derive(Debug, Clone, PartialEq, Eq)]
struct SyntheticSymbol {
    name: String,
    value: u64,
    desc: u16,
}

/// Builder for [`SyntheticImage`]
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    width: ImageWidth,
    symbols: Vec<SyntheticSymbol>,
    unnamed_symbols: usize,
    magic: Option<u32>,
    text: bool,
    linkedit: bool,
    symtab: bool,
}

impl ImageBuilder {
    /// Start an image of the given width with `__TEXT`, `__DATA`,
    /// `__LINKEDIT` and `LC_SYMTAB` commands and no symbols
    #[must_use]
    pub fn new(width: ImageWidth) -> Self {
        Self {
            width,
            symbols: Vec::new(),
            unnamed_symbols: 0,
            magic: None,
            text: true,
            linkedit: true,
            symtab: true,
        }
    }

    /// Add a symbol with the given link-time value
    #[must_use]
    pub fn symbol(mut self, name: &str, value: u64) -> Self {
        self.symbols.push(SyntheticSymbol {
            name: name.to_string(),
            value,
            desc: 0,
        });
        self
    }

    /// Add a symbol flagged as a Thumb function
    #[must_use]
    pub fn thumb_symbol(mut self, name: &str, value: u64) -> Self {
        self.symbols.push(SyntheticSymbol {
            name: name.to_string(),
            value,
            desc: N_ARM_THUMB_DEF,
        });
        self
    }

    /// Prepend entries with string index 0
    #[must_use]
    pub fn unnamed_symbols(mut self, count: usize) -> Self {
        self.unnamed_symbols = count;
        self
    }

    /// Write `magic` into the header in place of the width's own magic
    #[must_use]
    pub const fn with_magic(mut self, magic: u32) -> Self {
        self.magic = Some(magic);
        self
    }

    /// Leave out the `__TEXT` segment command
    #[must_use]
    pub fn without_text(mut self) -> Self {
        self.text = false;
        self
    }

    /// Leave out the `__LINKEDIT` segment command
    #[must_use]
    pub fn without_linkedit(mut self) -> Self {
        self.linkedit = false;
        self
    }

    /// Leave out the `LC_SYMTAB` command
    #[must_use]
    pub fn without_symtab(mut self) -> Self {
        self.symtab = false;
        self
    }

    /// Lay the image out in memory
    #[must_use]
    pub fn build(self) -> SyntheticImage {
        let layout = self.width.layout();
        let mut out = ByteWriter::new(self.width);

        let mut ncmds = 2; // LC_UUID + __DATA
        let mut sizeofcmds = UUID_COMMAND_SIZE + layout.segment_command_size;
        for present in [self.text, self.linkedit] {
            if present {
                ncmds += 1;
                sizeofcmds += layout.segment_command_size;
            }
        }
        if self.symtab {
            ncmds += 1;
            sizeofcmds += size_of::<SymtabCommand>();
        }

        let nsyms = self.unnamed_symbols + self.symbols.len();
        let symoff = align8(layout.header_size + sizeofcmds);
        let stroff = symoff + nsyms * layout.nlist_size;

        // string table: index 0 is reserved for "no name"
        let mut strings = vec![0u8];
        let mut strx = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            strx.push(strings.len() as u32);
            strings.extend_from_slice(symbol.name.as_bytes());
            strings.push(0);
        }

        out.header(self.magic.unwrap_or(layout.magic), ncmds, sizeofcmds as u32);
        out.put(&LoadCommand {
            cmd: LC_UUID,
            cmdsize: UUID_COMMAND_SIZE as u32,
        });
        out.bytes(&[0xab; 16]);

        if self.text {
            out.segment(SEG_TEXT, 0, 0);
        }
        out.segment(SEG_DATA, 0x4000, 0x4000);
        let linkedit_command = if self.linkedit {
            let offset = out.len();
            out.segment(SEG_LINKEDIT, 0x8000, 0);
            Some(offset)
        } else {
            None
        };
        if self.symtab {
            out.put(&SymtabCommand {
                cmd: LC_SYMTAB,
                cmdsize: size_of::<SymtabCommand>() as u32,
                symoff: symoff as u32,
                nsyms: nsyms as u32,
                stroff: stroff as u32,
                strsize: strings.len() as u32,
            });
        }

        out.pad_to(symoff);
        for _ in 0..self.unnamed_symbols {
            out.nlist(0, 0, 0);
        }
        for (symbol, &index) in self.symbols.iter().zip(&strx) {
            out.nlist(index, symbol.desc, symbol.value);
        }
        out.bytes(&strings);

        SyntheticImage::from_bytes(self.width, &out.finish(), linkedit_command)
    }
}

/// A Mach-O image laid out in an owned, 8-byte-aligned buffer
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    width: ImageWidth,
    words: Vec<u64>,
    len: usize,
    linkedit_command: Option<usize>,
}

impl SyntheticImage {
    fn from_bytes(width: ImageWidth, bytes: &[u8], linkedit_command: Option<usize>) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(8)];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        Self {
            width,
            words,
            len: bytes.len(),
            linkedit_command,
        }
    }

    /// Width the image was built with
    #[must_use]
    pub const fn width(&self) -> ImageWidth {
        self.width
    }

    /// Pointer to the image header
    #[must_use]
    pub fn header(&self) -> *const u8 {
        self.words.as_ptr().cast()
    }

    /// Address of the first byte of the image
    #[must_use]
    pub fn base_address(&self) -> usize {
        self.header() as usize
    }

    /// Size of the image in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the image is empty (never true for built images)
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw image bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the words are initialised and `len <= words.len() * 8`.
        unsafe { std::slice::from_raw_parts(self.header(), self.len) }
    }

    /// Point `__LINKEDIT` at this buffer for `slide` and hand out a loaded view
    ///
    /// # Panics
    ///
    /// For 32-bit images the distance between the buffer and `slide` has to
    /// fit in 32 bits; pass `base_address()` as the slide to guarantee it.
    pub fn load(&mut self, slide: isize) -> LoadedImage<'_> {
        if let Some(command) = self.linkedit_command {
            let layout = self.width.layout();
            let bias = self.base_address().wrapping_sub(slide as usize);
            match self.width {
                ImageWidth::Bits32 => {
                    assert!(
                        u32::try_from(bias).is_ok(),
                        "32-bit image cannot be linked {bias:#x} bytes away from its slide"
                    );
                    self.write(command + layout.segment_vmaddr, (bias as u32).as_bytes());
                    self.write(command + layout.segment_fileoff, 0u32.as_bytes());
                }
                ImageWidth::Bits64 => {
                    self.write(command + layout.segment_vmaddr, (bias as u64).as_bytes());
                    self.write(command + layout.segment_fileoff, 0u64.as_bytes());
                }
            }
        }
        // The buffer is a complete image that outlives the borrow, and the
        // link-edit segment was just pointed at it for this slide.
        LoadedImage {
            header: NonNull::from(self.words.as_slice()).cast(),
            slide,
            _mapping: PhantomData,
        }
    }

    fn write(&mut self, offset: usize, bytes: &[u8]) {
        // SAFETY: offsets come from the builder and lie inside the buffer.
        let buffer =
            unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), self.len) };
        buffer[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

struct ByteWriter {
    width: ImageWidth,
    buf: Vec<u8>,
}

impl ByteWriter {
    const fn new(width: ImageWidth) -> Self {
        Self {
            width,
            buf: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn put<T: IntoBytes + Immutable>(&mut self, value: &T) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn pad_to(&mut self, offset: usize) {
        self.buf.resize(offset, 0);
    }

    fn header(&mut self, magic: u32, ncmds: u32, sizeofcmds: u32) {
        match self.width {
            ImageWidth::Bits32 => self.put(&MachHeader32 {
                magic,
                cputype: CPU_TYPE_ARM,
                filetype: MH_DYLIB,
                ncmds,
                sizeofcmds,
                ..MachHeader32::default()
            }),
            ImageWidth::Bits64 => self.put(&MachHeader64 {
                magic,
                cputype: CPU_TYPE_ARM64,
                filetype: MH_DYLIB,
                ncmds,
                sizeofcmds,
                ..MachHeader64::default()
            }),
        }
    }

    fn segment(&mut self, name: &str, vmaddr: u64, fileoff: u64) {
        let mut segname = [0u8; SEGNAME_LEN];
        segname[..name.len()].copy_from_slice(name.as_bytes());

        match self.width {
            ImageWidth::Bits32 => self.put(&SegmentCommand32 {
                cmd: LC_SEGMENT,
                cmdsize: size_of::<SegmentCommand32>() as u32,
                segname,
                vmaddr: vmaddr as u32,
                vmsize: 0x4000,
                fileoff: fileoff as u32,
                filesize: 0x4000,
                maxprot: 5,
                initprot: 5,
                ..SegmentCommand32::default()
            }),
            ImageWidth::Bits64 => self.put(&SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: size_of::<SegmentCommand64>() as u32,
                segname,
                vmaddr,
                vmsize: 0x4000,
                fileoff,
                filesize: 0x4000,
                maxprot: 5,
                initprot: 5,
                ..SegmentCommand64::default()
            }),
        }
    }

    fn nlist(&mut self, strx: u32, desc: u16, value: u64) {
        match self.width {
            ImageWidth::Bits32 => self.put(&Nlist32 {
                strx,
                type_flags: N_SECT_EXT,
                sect: 1,
                desc,
                value: value as u32,
            }),
            ImageWidth::Bits64 => self.put(&Nlist64 {
                strx,
                type_flags: N_SECT_EXT,
                sect: 1,
                desc,
                value,
            }),
        }
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

const fn align8(offset: usize) -> usize {
    (offset + 7) & !7
}
