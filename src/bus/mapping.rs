//! Page-table construction. The 28-bit effective address space is covered
//! by 4 KiB pages; each mapped page names a backing region owned by the bus
//! plus a byte offset into it, so pages can never outlive their storage.

use crate::cart;
use crate::ocpm;
use crate::vdp;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_COUNT: usize = (1 << 28) / PAGE_SIZE;

/// Bits 28-31 are ignored by the address decoder.
pub const ADDR_MASK: u32 = 0x0FFF_FFFF;

pub const BIOS_START: u32 = 0x0000_0000;
pub const BIOS_SIZE: usize = 0x8000;

/// The BIOS also appears high in the map; the reset PC points there.
pub const BIOS_MIRROR_START: u32 = 0x0E00_0000;

pub const RAM_START: u32 = 0x0100_0000;
pub const RAM_SIZE: usize = 0x80000;

const REGION_SIZE: u32 = 1 << 24;

#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum Region {
    Bios,
    Ram,
    Sram,
    CartRom,
    BitmapVram,
    TileVram,
    Oram,
}

impl Region {
    /// ROM-backed pages ignore writes.
    pub fn writable(self) -> bool {
        !matches!(self, Region::Bios | Region::CartRom)
    }
}

#[derive(Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct PageRef {
    pub region: Region,
    pub offset: u32,
}

pub(super) fn map_pages(pages: &mut [Option<PageRef>], region: Region, start: u32, size: usize) {
    let first = (start >> 12) as usize;
    for i in 0..(size >> 12) {
        pages[first + i] = Some(PageRef {
            region,
            offset: (i << 12) as u32,
        });
    }
}

/// Builds the full table for the given backing sizes. Mirrors are applied
/// here: RAM repeats across its whole region, bitmap VRAM appears twice and
/// the BIOS shows up again at its high mirror.
pub(super) fn build_pagetable(sram_size: usize, cart_rom_size: usize) -> Vec<Option<PageRef>> {
    let mut pages = vec![None; PAGE_COUNT];

    map_pages(&mut pages, Region::Bios, BIOS_START, BIOS_SIZE);
    map_pages(&mut pages, Region::Bios, BIOS_MIRROR_START, BIOS_SIZE);

    let mut offset = 0;
    while offset < REGION_SIZE {
        map_pages(&mut pages, Region::Ram, RAM_START + offset, RAM_SIZE);
        offset += RAM_SIZE as u32;
    }

    map_pages(&mut pages, Region::Sram, cart::SRAM_START, sram_size);
    map_pages(&mut pages, Region::CartRom, cart::ROM_START, cart_rom_size);

    map_pages(
        &mut pages,
        Region::BitmapVram,
        vdp::BITMAP_VRAM_START,
        vdp::BITMAP_VRAM_SIZE,
    );
    map_pages(
        &mut pages,
        Region::BitmapVram,
        vdp::BITMAP_VRAM_START + vdp::BITMAP_VRAM_SIZE as u32,
        vdp::BITMAP_VRAM_SIZE,
    );
    map_pages(
        &mut pages,
        Region::TileVram,
        vdp::TILE_VRAM_START,
        vdp::TILE_VRAM_SIZE,
    );

    map_pages(&mut pages, Region::Oram, ocpm::ORAM_START, ocpm::ORAM_SIZE);

    pages
}
