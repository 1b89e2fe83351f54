//! Images registered with the macOS dynamic loader.

use std::ffi::{c_char, CStr};
use std::path::PathBuf;

use crate::image::LoadedImage;

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(image_index: u32) -> *const u8;
    fn _dyld_get_image_vmaddr_slide(image_index: u32) -> isize;
    fn _dyld_get_image_name(image_index: u32) -> *const c_char;
}

/// Every image currently loaded, with its path
///
/// Indices that dyld reports as empty (images unloaded mid-walk) are skipped.
#[must_use]
pub fn loaded_images() -> Vec<(PathBuf, LoadedImage<'static>)> {
    // SAFETY: dyld's query functions accept any index and return null for
    // indices that are no longer valid.
    let count = unsafe { _dyld_image_count() };
    let mut images = Vec::with_capacity(count as usize);
    for index in 0..count {
        let (header, slide, name) = unsafe {
            (
                _dyld_get_image_header(index),
                _dyld_get_image_vmaddr_slide(index),
                _dyld_get_image_name(index),
            )
        };
        if name.is_null() {
            continue;
        }
        // SAFETY: a non-null name is a NUL-terminated string owned by dyld.
        let path = PathBuf::from(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned());
        // SAFETY: dyld headers describe mapped images that are never unmapped
        // while referenced from the image list.
        if let Some(image) = unsafe { LoadedImage::new(header, slide) } {
            images.push((path, image));
        }
    }
    tracing::trace!(count = images.len(), "enumerated dyld images");
    images
}
