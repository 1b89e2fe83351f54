//! Resolver tests against synthetic Mach-O images.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::synthetic::ImageBuilder;
use super::*;

const SLIDE: isize = 0x1000;

fn two_symbol_image(width: ImageWidth) -> synthetic::SyntheticImage {
    ImageBuilder::new(width)
        .symbol("a", 0x100)
        .symbol("b", 0x200)
        .build()
}

mod resolve_tests {
    use super::*;

    #[test]
    fn test_resolves_with_slide() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("a").map(SymbolAddress::as_usize), Some(0x1100));
        assert_eq!(loaded.resolve("b").map(SymbolAddress::as_usize), Some(0x1200));
        assert_eq!(loaded.resolve("c"), None);
    }

    #[test]
    fn test_free_function_matches_method() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        let direct = unsafe { resolve("b", loaded.header(), loaded.slide()) };
        assert_eq!(direct, loaded.resolve("b"));
    }

    #[test]
    fn test_resolves_32bit_image() {
        let mut image = two_symbol_image(ImageWidth::Bits32);
        let slide = image.base_address() as isize;
        let loaded = image.load(slide);
        assert_eq!(loaded.width(), Some(ImageWidth::Bits32));
        assert_eq!(
            loaded.resolve("a").map(SymbolAddress::as_usize),
            Some(slide as usize + 0x100)
        );
        assert_eq!(
            loaded.resolve("b").map(SymbolAddress::as_usize),
            Some(slide as usize + 0x200)
        );
        assert_eq!(loaded.resolve("c"), None);
    }

    #[test]
    fn test_negative_slide() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .symbol("_start", 0x1_0000_4000)
            .build();
        let loaded = image.load(-0x1000);
        assert_eq!(
            loaded.resolve("_start").map(SymbolAddress::as_usize),
            Some(0x1_0000_3000)
        );
    }

    #[test]
    fn test_names_must_match_exactly() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .symbol("_ab", 0x10)
            .symbol("_a", 0x20)
            .build();
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("_a").map(SymbolAddress::as_usize), Some(0x1020));
        assert_eq!(loaded.resolve("_ab").map(SymbolAddress::as_usize), Some(0x1010));
        assert_eq!(loaded.resolve("_abc"), None);
        assert_eq!(loaded.resolve("_"), None);
    }

    #[test]
    fn test_first_match_wins() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .symbol("_dup", 0x10)
            .symbol("_dup", 0x20)
            .build();
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("_dup").map(SymbolAddress::as_usize), Some(0x1010));
    }

    #[test]
    fn test_unnamed_entries_are_skipped() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .unnamed_symbols(3)
            .symbol("_named", 0x40)
            .build();
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("_named").map(SymbolAddress::as_usize), Some(0x1040));
    }

    #[test]
    fn test_zero_address_is_not_found() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64).symbol("_zero", 0).build();
        let loaded = image.load(0);
        assert_eq!(loaded.resolve("_zero"), None);
    }

    #[test]
    fn test_concurrent_lookups() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        assert_eq!(loaded.resolve("b").map(SymbolAddress::as_usize), Some(0x1200));
                    }
                });
            }
        });
    }
}

mod thumb_tests {
    use super::*;

    #[test]
    fn test_thumb_sets_low_bit() {
        let mut image = ImageBuilder::new(ImageWidth::Bits32)
            .thumb_symbol("_thumb", 0x2000)
            .symbol("_arm", 0x3000)
            .build();
        let slide = image.base_address() as isize;
        let loaded = image.load(slide);

        let thumb = loaded.resolve("_thumb").unwrap();
        assert_eq!(thumb.as_usize(), (slide as usize + 0x2000) | 1);
        assert!(thumb.is_thumb());

        let arm = loaded.resolve("_arm").unwrap();
        assert_eq!(arm.as_usize(), slide as usize + 0x3000);
        assert!(!arm.is_thumb());
    }

    #[test]
    fn test_thumb_on_64bit_image() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .thumb_symbol("_t", 0x101)
            .build();
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("_t").map(SymbolAddress::as_usize), Some(0x1101));
    }
}

mod missing_structure_tests {
    use super::*;

    #[test]
    fn test_missing_symtab() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .symbol("a", 0x100)
            .without_symtab()
            .build();
        let loaded = image.load(SLIDE);
        for name in ["a", "b", "_main", "___llvm_profile_begin_data"] {
            assert_eq!(loaded.resolve(name), None);
        }
    }

    #[test]
    fn test_missing_linkedit() {
        let mut image = ImageBuilder::new(ImageWidth::Bits64)
            .symbol("a", 0x100)
            .without_linkedit()
            .build();
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve("a"), None);
    }

    #[test]
    fn test_missing_text() {
        let mut image = ImageBuilder::new(ImageWidth::Bits32)
            .symbol("a", 0x100)
            .without_text()
            .build();
        let slide = image.base_address() as isize;
        let loaded = image.load(slide);
        assert_eq!(loaded.resolve("a"), None);
    }

    #[test]
    fn test_null_header() {
        assert_eq!(unsafe { resolve("a", std::ptr::null(), SLIDE) }, None);
        assert!(unsafe { LoadedImage::new(std::ptr::null(), SLIDE) }.is_none());
    }

    #[test]
    fn test_unknown_magic() {
        let words = [0u64; 8];
        assert_eq!(unsafe { resolve("a", words.as_ptr().cast(), 0) }, None);
    }

    #[test]
    fn test_byte_swapped_magic_is_not_parsed_as_32_bit() {
        let mut native = ImageBuilder::new(ImageWidth::Bits32).symbol("a", 0x100).build();
        let slide = native.base_address() as isize;
        assert!(native.load(slide).resolve("a").is_some());

        let mut swapped = ImageBuilder::new(ImageWidth::Bits32)
            .symbol("a", 0x100)
            .with_magic(MH_MAGIC.swap_bytes())
            .build();
        let slide = swapped.base_address() as isize;
        let loaded = swapped.load(slide);
        assert_eq!(loaded.width(), None);
        assert_eq!(loaded.resolve("a"), None);
    }

    #[test]
    fn test_empty_and_nul_names() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        assert_eq!(loaded.resolve(""), None);
        assert_eq!(loaded.resolve("a\0"), None);
    }
}

mod formatting_tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        let address = loaded.resolve("a").unwrap();
        assert_eq!(address.to_string(), "0x1100");
        assert_eq!(format!("{address:?}"), "SymbolAddress(0x1100)");
        assert_eq!(address.as_ptr() as usize, 0x1100);
    }

    #[test]
    fn test_loaded_image_debug() {
        let mut image = two_symbol_image(ImageWidth::Bits64);
        let loaded = image.load(SLIDE);
        let debug = format!("{loaded:?}");
        assert!(debug.contains("LoadedImage"));
        assert!(debug.contains("0x1000"));
    }
}

mod property_tests {
    use super::*;
    use proptest::collection::btree_map;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_every_symbol_resolves(
            symbols in btree_map("_[a-z][a-z0-9_]{0,24}", 0x20_0000u64..0xffff_ffff, 1..32),
            slide in -0x10_0000isize..0x10_0000,
        ) {
            let builder = symbols
                .iter()
                .fold(ImageBuilder::new(ImageWidth::Bits64), |b, (name, &value)| b.symbol(name, value));
            let mut image = builder.build();
            let loaded = image.load(slide);
            for (name, &value) in &symbols {
                let expected = (slide as usize).wrapping_add(value as usize);
                prop_assert_eq!(loaded.resolve(name).map(SymbolAddress::as_usize), Some(expected));
            }
        }

        #[test]
        fn prop_absent_names_not_found(
            symbols in btree_map("_[a-z]{1,8}", 1u64..0xffff, 0..16),
            absent in "_[A-Z]{1,8}",
        ) {
            let builder = symbols
                .iter()
                .fold(ImageBuilder::new(ImageWidth::Bits32), |b, (name, &value)| b.symbol(name, value));
            let mut image = builder.build();
            let slide = image.base_address() as isize;
            let loaded = image.load(slide);
            prop_assert_eq!(loaded.resolve(&absent), None);
        }
    }
}
