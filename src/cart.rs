//! Cartridge ROM and battery-backed SRAM.
//!
//! The ROM header carries two big-endian pointers at 0x10/0x14 delimiting
//! the SRAM address range; the blob is persisted to the sibling `.sav` file
//! once per ~60 frames and at shutdown.

use std::fs;

use crate::bswp::bswp32;

pub const SRAM_START: u32 = 0x0200_0000;
pub const ROM_START: u32 = 0x0600_0000;

const SRAM_COMMIT_FRAMES: u32 = 60;

#[derive(Debug, thiserror::Error)]
pub enum CartError {
    #[error("cartridge image too small for header ({0} bytes)")]
    TruncatedHeader(usize),
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Cart {
    pub rom: Vec<u8>,
    pub sram: Vec<u8>,
    sram_file_path: Option<String>,
    frame_count: u32,
}

impl Cart {
    /// Builds the cartridge from a raw ROM image plus whatever `.sav`
    /// contents the host found. The SRAM blob is normalized to the
    /// header-declared size: short files pad with 0xFF, long ones truncate.
    pub fn new(
        rom: Vec<u8>,
        sram: Vec<u8>,
        sram_file_path: Option<String>,
    ) -> Result<Self, CartError> {
        if rom.len() < 0x18 {
            return Err(CartError::TruncatedHeader(rom.len()));
        }

        // Header words are big-endian pointers into the SRAM region.
        let sram_start = bswp32(u32::from_le_bytes([rom[0x10], rom[0x11], rom[0x12], rom[0x13]]));
        let sram_end = bswp32(u32::from_le_bytes([rom[0x14], rom[0x15], rom[0x16], rom[0x17]]));
        let sram_size = sram_end.wrapping_sub(sram_start).wrapping_add(1) as usize;

        let mut sram = sram;
        sram.resize(sram_size, 0xFF);

        Ok(Self {
            rom,
            sram,
            sram_file_path,
            frame_count: 0,
        })
    }

    pub fn sram_size(&self) -> usize {
        self.sram.len()
    }

    /// Best-effort writeback of the SRAM blob; failure is logged, never fatal.
    pub fn commit_sram(&self) {
        let Some(path) = &self.sram_file_path else {
            return;
        };
        if let Err(err) = fs::write(path, &self.sram) {
            log::warn!("[Cart] failed to write SRAM to {path}: {err}");
        }
    }

    /// Forces a save every 60 frames.
    pub fn sram_commit_check(&mut self) {
        self.frame_count += 1;
        if self.frame_count < SRAM_COMMIT_FRAMES {
            return;
        }
        self.frame_count = 0;
        self.commit_sram();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rom_with_sram_range(start: u32, end: u32) -> Vec<u8> {
        let mut rom = vec![0u8; 0x40];
        rom[0x10..0x14].copy_from_slice(&start.to_be_bytes());
        rom[0x14..0x18].copy_from_slice(&end.to_be_bytes());
        rom
    }

    #[test]
    fn sram_size_comes_from_header() {
        let rom = rom_with_sram_range(0x0200_0000, 0x0200_1FFF);
        let cart = Cart::new(rom, Vec::new(), None).unwrap();
        assert_eq!(cart.sram_size(), 0x2000);
        // Uninitialized SRAM reads back 0xFF.
        assert!(cart.sram.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn short_sav_pads_and_long_sav_truncates() {
        let rom = rom_with_sram_range(0x0200_0000, 0x0200_0FFF);
        let cart = Cart::new(rom.clone(), vec![0xAA; 0x800], None).unwrap();
        assert_eq!(cart.sram.len(), 0x1000);
        assert_eq!(cart.sram[0x7FF], 0xAA);
        assert_eq!(cart.sram[0x800], 0xFF);

        let cart = Cart::new(rom, vec![0xBB; 0x4000], None).unwrap();
        assert_eq!(cart.sram.len(), 0x1000);
        assert!(cart.sram.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            Cart::new(vec![0u8; 4], Vec::new(), None),
            Err(CartError::TruncatedHeader(4))
        ));
    }
}
