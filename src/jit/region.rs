//! Guest address space classification.
//!
//! The GBA bus decodes the top byte of an address into a region. Only code
//! that can live in BIOS, work RAM or the cartridge windows is worth
//! translating; everything else is I/O or video memory.

/// Named guest memory regions, keyed by `address >> 24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Bios,
    WorkingRam,
    WorkingIram,
    Io,
    PaletteRam,
    Vram,
    Oam,
    Cart0,
    Cart0Ex,
    Cart1,
    Cart1Ex,
    Cart2,
    Cart2Ex,
    CartSram,
    CartSramMirror,
    Unmapped,
}

/// Whether translations may be made from a region, and whether they can go stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionClass {
    NotJitable,
    ReadOnlyJitable,
    WritableJitable,
}

pub const BASE_BIOS: u32 = 0x0000_0000;
pub const BASE_WORKING_RAM: u32 = 0x0200_0000;
pub const BASE_WORKING_IRAM: u32 = 0x0300_0000;

pub const SIZE_WORKING_RAM: u32 = 0x0004_0000;
pub const SIZE_WORKING_IRAM: u32 = 0x0000_8000;

/// Offset masks folding every mirror of a work RAM region onto its base.
pub const MASK_WORKING_RAM: u32 = SIZE_WORKING_RAM - 1;
pub const MASK_WORKING_IRAM: u32 = SIZE_WORKING_IRAM - 1;

impl Region {
    pub fn of(address: u32) -> Self {
        match address >> 24 {
            0x0 => Region::Bios,
            0x2 => Region::WorkingRam,
            0x3 => Region::WorkingIram,
            0x4 => Region::Io,
            0x5 => Region::PaletteRam,
            0x6 => Region::Vram,
            0x7 => Region::Oam,
            0x8 => Region::Cart0,
            0x9 => Region::Cart0Ex,
            0xA => Region::Cart1,
            0xB => Region::Cart1Ex,
            0xC => Region::Cart2,
            0xD => Region::Cart2Ex,
            0xE => Region::CartSram,
            0xF => Region::CartSramMirror,
            _ => Region::Unmapped,
        }
    }

    pub fn class(self) -> RegionClass {
        match self {
            Region::WorkingRam | Region::WorkingIram => RegionClass::WritableJitable,
            Region::Bios
            | Region::Cart0
            | Region::Cart0Ex
            | Region::Cart1
            | Region::Cart1Ex
            | Region::Cart2
            | Region::Cart2Ex
            | Region::CartSram
            | Region::CartSramMirror => RegionClass::ReadOnlyJitable,
            Region::Io | Region::PaletteRam | Region::Vram | Region::Oam | Region::Unmapped => {
                RegionClass::NotJitable
            }
        }
    }

    /// `(base, mask)` for regions whose writes are dirty-tracked.
    pub fn tracked_span(self) -> Option<(u32, u32)> {
        match self {
            Region::WorkingRam => Some((BASE_WORKING_RAM, MASK_WORKING_RAM)),
            Region::WorkingIram => Some((BASE_WORKING_IRAM, MASK_WORKING_IRAM)),
            _ => None,
        }
    }
}

pub fn classify(address: u32) -> RegionClass {
    Region::of(address).class()
}

pub fn is_jitable(address: u32) -> bool {
    classify(address) != RegionClass::NotJitable
}

/// Fold work RAM mirrors onto the base mirror; other addresses pass through.
pub fn canonicalize(address: u32) -> u32 {
    match Region::of(address).tracked_span() {
        Some((base, mask)) => base | (address & mask),
        None => address,
    }
}
