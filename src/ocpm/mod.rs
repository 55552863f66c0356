//! SH-1 on-chip peripheral modules: interrupt controller, integrated timer
//! unit, DMA controller and serial ports, plus the 4 KiB on-chip RAM.
//!
//! The register block decodes at `0x05FFFE00-0x05FFFFFF`; the bus rebases
//! accesses to `0xE00 + (addr & 0x1FF)` before handing them here.

pub mod dmac;
pub mod intc;
pub mod itu;
pub mod sci;


pub use dmac::{Dmac, Dreq};
pub use intc::{Intc, Irq};
pub use itu::Itu;
pub use sci::Sci;

pub const OCPM_REG_START: u32 = 0x05FF_FE00;
pub const OCPM_REG_END: u32 = 0x0600_0000;

pub const ORAM_START: u32 = 0x0F00_0000;
pub const ORAM_SIZE: usize = 0x1000;

pub const SERIAL_START: u32 = 0xEC0;
pub const SERIAL_END: u32 = 0xED0;

pub const TIMER_START: u32 = 0xF00;
pub const TIMER_END: u32 = 0xF40;

pub const DMAC_START: u32 = 0xF40;
pub const DMAC_END: u32 = 0xF80;

pub const INTC_START: u32 = 0xF84;
pub const INTC_END: u32 = 0xF90;

#[derive(bincode::Encode, bincode::Decode)]
pub struct Ocpm {
    pub intc: Intc,
    pub itu: Itu,
    pub dmac: Dmac,
    pub sci: Sci,
    pub oram: Vec<u8>,
}

impl Ocpm {
    pub fn new() -> Self {
        Self {
            intc: Intc::new(),
            itu: Itu::new(),
            dmac: Dmac::new(),
            sci: Sci::new(),
            oram: vec![0; ORAM_SIZE],
        }
    }
}

impl Default for Ocpm {
    fn default() -> Self {
        Self::new()
    }
}
