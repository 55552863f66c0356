//! Paged system bus. Mapped pages resolve to owned backing stores with
//! explicit big-endian byte swaps; everything else dispatches to MMIO
//! handlers by address range. Handlers that arm timers or start transfers
//! receive the scheduler, so device writes can reshape the current slice.

pub mod mapping;

#[cfg(test)]
mod tests;

pub use mapping::{
    Region, ADDR_MASK, BIOS_MIRROR_START, BIOS_SIZE, BIOS_START, PAGE_COUNT, PAGE_SIZE, RAM_SIZE,
    RAM_START,
};

use crate::cart::Cart;
use crate::ocpm::{self, dmac::Channel, Ocpm};
use crate::pad::{self, PadIo};
use crate::synth::{self, SoundPort};
use crate::timing::{self, EventFn, Scheduler, CPU_DOMAIN};
use crate::vdp::{self, Vdp};
use mapping::PageRef;

#[derive(bincode::Encode, bincode::Decode)]
pub struct Bus {
    pages: Vec<Option<PageRef>>,
    bios: Vec<u8>,
    ram: Vec<u8>,
    pub cart: Cart,
    pub vdp: Vdp,
    pub ocpm: Ocpm,
    pub pad: PadIo,
    pub sound: SoundPort,
}

impl Bus {
    pub fn new(bios: Vec<u8>, cart: Cart) -> Self {
        assert_eq!(bios.len(), BIOS_SIZE, "BIOS image must be 32 KiB");

        let pages = mapping::build_pagetable(cart.sram.len(), cart.rom.len());
        Self {
            pages,
            bios,
            ram: vec![0; RAM_SIZE],
            cart,
            vdp: Vdp::new(),
            ocpm: Ocpm::new(),
            pad: PadIo::new(),
            sound: SoundPort::disconnected(),
        }
    }

    fn region(&self, region: Region) -> &[u8] {
        match region {
            Region::Bios => &self.bios,
            Region::Ram => &self.ram,
            Region::Sram => &self.cart.sram,
            Region::CartRom => &self.cart.rom,
            Region::BitmapVram => &self.vdp.bitmap,
            Region::TileVram => &self.vdp.tile,
            Region::Oram => &self.ocpm.oram,
        }
    }

    fn region_mut(&mut self, region: Region) -> &mut [u8] {
        match region {
            Region::Bios => &mut self.bios,
            Region::Ram => &mut self.ram,
            Region::Sram => &mut self.cart.sram,
            Region::CartRom => &mut self.cart.rom,
            Region::BitmapVram => &mut self.vdp.bitmap,
            Region::TileVram => &mut self.vdp.tile,
            Region::Oram => &mut self.ocpm.oram,
        }
    }

    #[inline]
    fn page(&self, addr: u32) -> Option<PageRef> {
        self.pages[(addr >> 12) as usize]
    }

    pub fn read8(&mut self, addr: u32, sched: &mut Scheduler) -> u8 {
        let addr = addr & ADDR_MASK;
        if let Some(page) = self.page(addr) {
            let offset = page.offset as usize + (addr & 0xFFF) as usize;
            return self.region(page.region)[offset];
        }
        self.mmio_read8(addr, sched)
    }

    pub fn read16(&mut self, addr: u32, sched: &mut Scheduler) -> u16 {
        let addr = addr & ADDR_MASK & !1;
        if let Some(page) = self.page(addr) {
            let offset = page.offset as usize + (addr & 0xFFF) as usize;
            let data = self.region(page.region);
            return u16::from_be_bytes([data[offset], data[offset + 1]]);
        }
        self.mmio_read16(addr, sched)
    }

    pub fn read32(&mut self, addr: u32, sched: &mut Scheduler) -> u32 {
        let addr = addr & ADDR_MASK & !3;
        if let Some(page) = self.page(addr) {
            let offset = page.offset as usize + (addr & 0xFFF) as usize;
            let data = self.region(page.region);
            return u32::from_be_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]);
        }
        self.mmio_read32(addr, sched)
    }

    pub fn write8(&mut self, addr: u32, value: u8, sched: &mut Scheduler) {
        let addr = addr & ADDR_MASK;
        if let Some(page) = self.page(addr) {
            if page.region.writable() {
                let offset = page.offset as usize + (addr & 0xFFF) as usize;
                self.region_mut(page.region)[offset] = value;
            } else {
                log::warn!("[Bus] write8 to ROM {addr:08X}: {value:02X}");
            }
            return;
        }
        self.mmio_write8(addr, value, sched);
    }

    pub fn write16(&mut self, addr: u32, value: u16, sched: &mut Scheduler) {
        let addr = addr & ADDR_MASK & !1;
        if let Some(page) = self.page(addr) {
            if page.region.writable() {
                let offset = page.offset as usize + (addr & 0xFFF) as usize;
                self.region_mut(page.region)[offset..offset + 2]
                    .copy_from_slice(&value.to_be_bytes());
            } else {
                log::warn!("[Bus] write16 to ROM {addr:08X}: {value:04X}");
            }
            return;
        }
        self.mmio_write16(addr, value, sched);
    }

    pub fn write32(&mut self, addr: u32, value: u32, sched: &mut Scheduler) {
        let addr = addr & ADDR_MASK & !3;
        if let Some(page) = self.page(addr) {
            if page.region.writable() {
                let offset = page.offset as usize + (addr & 0xFFF) as usize;
                self.region_mut(page.region)[offset..offset + 4]
                    .copy_from_slice(&value.to_be_bytes());
            } else {
                log::warn!("[Bus] write32 to ROM {addr:08X}: {value:08X}");
            }
            return;
        }
        self.mmio_write32(addr, value, sched);
    }

    /// Schedules the one-cycle-deferred interrupt check whenever the INTC
    /// has something pending. The handler re-validates against the CPU's
    /// mask, so spurious checks are harmless.
    pub fn intc_check(&mut self, sched: &mut Scheduler) {
        if self.ocpm.intc.current().is_some() {
            sched.add_event(EventFn::CpuIrq, timing::convert_cpu(1), 0, CPU_DOMAIN);
        }
    }

    // MMIO dispatch.

    fn mmio_read8(&mut self, addr: u32, sched: &mut Scheduler) -> u8 {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_read8(addr),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_read8(addr),
            ocpm::OCPM_REG_START..=0x05FF_FFFF => self.ocpm_read8(addr, sched),
            _ => {
                log::warn!("[Bus] unmapped read8 {addr:08X}");
                0
            }
        }
    }

    fn mmio_read16(&mut self, addr: u32, sched: &mut Scheduler) -> u16 {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_read16(addr),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_read16(addr),
            vdp::CAPTURE_START..=0x0405_21FF => self.vdp.capture_read16(addr),
            vdp::CTRL_REG_START..=0x0405_8FFF => self.vdp.ctrl_read16(addr),
            vdp::BITMAP_REG_START..=0x0405_9FFF => self.vdp.bitmap_reg_read16(addr),
            vdp::BGOBJ_REG_START..=0x0405_AFFF => self.vdp.bgobj_read16(addr),
            vdp::DISPLAY_REG_START..=0x0405_BFFF => self.vdp.display_read16(addr),
            vdp::CMP_IRQ_REG_START..=0x0405_CFFF => self.vdp.cmp_irq_read16(addr),
            pad::PAD_IO_START..=0x0405_DFFF => self.pad.reg_read16(addr),
            vdp::DMA_CTRL_REG_START..=0x0405_EFFF => self.vdp.dma_ctrl_read16(addr),
            synth::SOUND_CTRL_START..=0x0409_FFFF => 0,
            ocpm::OCPM_REG_START..=0x05FF_FFFF => self.ocpm_read16(addr, sched),
            _ => {
                log::warn!("[Bus] unmapped read16 {addr:08X}");
                0
            }
        }
    }

    fn mmio_read32(&mut self, addr: u32, sched: &mut Scheduler) -> u32 {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_read32(addr),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_read32(addr),
            ocpm::OCPM_REG_START..=0x05FF_FFFF => {
                let _ = sched;
                log::warn!("[OCPM] unmapped read32 {addr:08X}");
                0
            }
            _ => {
                log::warn!("[Bus] unmapped read32 {addr:08X}");
                0
            }
        }
    }

    fn mmio_write8(&mut self, addr: u32, value: u8, sched: &mut Scheduler) {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_write8(addr, value),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_write8(addr, value),
            ocpm::OCPM_REG_START..=0x05FF_FFFF => self.ocpm_write8(addr, value, sched),
            _ => log::warn!("[Bus] unmapped write8 {addr:08X}: {value:02X}"),
        }
    }

    fn mmio_write16(&mut self, addr: u32, value: u16, sched: &mut Scheduler) {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_write16(addr, value),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_write16(addr, value),
            vdp::CTRL_REG_START..=0x0405_8FFF => self.vdp.ctrl_write16(addr, value),
            vdp::BITMAP_REG_START..=0x0405_9FFF => self.vdp.bitmap_reg_write16(addr, value),
            vdp::BGOBJ_REG_START..=0x0405_AFFF => self.vdp.bgobj_write16(addr, value),
            vdp::DISPLAY_REG_START..=0x0405_BFFF => self.vdp.display_write16(addr, value),
            vdp::CMP_IRQ_REG_START..=0x0405_CFFF => self.vdp.cmp_irq_write16(addr, value),
            pad::PAD_IO_START..=0x0405_DFFF => self.pad.reg_write16(addr, value),
            vdp::DMA_CTRL_REG_START..=0x0405_EFFF => self.vdp.dma_ctrl_write16(addr, value),
            vdp::DMA_TRIGGER_START..=0x0405_FFFF => self.vdp.dma_trigger_write16(addr, value),
            synth::SOUND_CTRL_START..=0x0409_FFFF => self.sound.write_control(value),
            ocpm::OCPM_REG_START..=0x05FF_FFFF => self.ocpm_write16(addr, value, sched),
            _ => log::warn!("[Bus] unmapped write16 {addr:08X}: {value:04X}"),
        }
    }

    fn mmio_write32(&mut self, addr: u32, value: u32, sched: &mut Scheduler) {
        match addr {
            vdp::PALETTE_START..=0x0405_11FF => self.vdp.palette_write32(addr, value),
            vdp::OAM_START..=0x0405_01FF => self.vdp.oam_write32(addr, value),
            ocpm::OCPM_REG_START..=0x05FF_FFFF => self.ocpm_write32(addr, value, sched),
            _ => log::warn!("[Bus] unmapped write32 {addr:08X}: {value:08X}"),
        }
    }

    // On-chip peripheral register block, rebased to 0xE00..0x1000.

    fn ocpm_addr(addr: u32) -> u32 {
        (addr & 0x1FF) + 0xE00
    }

    fn ocpm_read8(&mut self, addr: u32, sched: &mut Scheduler) -> u8 {
        let addr = Self::ocpm_addr(addr);

        if (ocpm::SERIAL_START..ocpm::SERIAL_END).contains(&addr) {
            return self.ocpm.sci.read8(addr);
        }

        if (ocpm::TIMER_START..ocpm::TIMER_END).contains(&addr) {
            return self.ocpm.itu.read8(addr, sched);
        }

        log::warn!("[OCPM] read8 {addr:03X}");
        0
    }

    fn ocpm_read16(&mut self, addr: u32, sched: &mut Scheduler) -> u16 {
        let addr = Self::ocpm_addr(addr);

        if (ocpm::TIMER_START..ocpm::TIMER_END).contains(&addr) {
            return self.ocpm.itu.read16(addr, sched);
        }

        if (ocpm::DMAC_START..ocpm::DMAC_END).contains(&addr) {
            return self.ocpm.dmac.read16(addr);
        }

        if (ocpm::INTC_START..ocpm::INTC_END).contains(&addr) {
            return self.ocpm.intc.read16(addr);
        }

        log::warn!("[OCPM] read16 {addr:03X}");
        0
    }

    fn ocpm_write8(&mut self, addr: u32, value: u8, sched: &mut Scheduler) {
        let addr = Self::ocpm_addr(addr);

        if (ocpm::SERIAL_START..ocpm::SERIAL_END).contains(&addr) {
            let ocpm = &mut self.ocpm;
            ocpm.sci.write8(addr, value, sched, &mut ocpm.dmac);
            return;
        }

        if (ocpm::TIMER_START..ocpm::TIMER_END).contains(&addr) {
            let ocpm = &mut self.ocpm;
            ocpm.itu.write8(addr, value, sched, &mut ocpm.intc);
            self.intc_check(sched);
            return;
        }

        log::warn!("[OCPM] write8 {addr:03X}: {value:02X}");
    }

    fn ocpm_write16(&mut self, addr: u32, value: u16, sched: &mut Scheduler) {
        let addr = Self::ocpm_addr(addr);

        if (ocpm::TIMER_START..ocpm::TIMER_END).contains(&addr) {
            let ocpm = &mut self.ocpm;
            ocpm.itu.write16(addr, value, sched, &mut ocpm.intc);
            self.intc_check(sched);
            return;
        }

        if (ocpm::DMAC_START..ocpm::DMAC_END).contains(&addr) {
            if let Some(channel) = self.ocpm.dmac.write16(addr, value) {
                self.dmac_start_transfer(channel, sched);
            }
            return;
        }

        if (ocpm::INTC_START..ocpm::INTC_END).contains(&addr) {
            self.ocpm.intc.write16(addr, value);
            self.intc_check(sched);
            return;
        }

        log::warn!("[OCPM] write16 {addr:03X}: {value:04X}");
    }

    fn ocpm_write32(&mut self, addr: u32, value: u32, sched: &mut Scheduler) {
        let _ = sched;
        let addr = Self::ocpm_addr(addr);

        if (ocpm::DMAC_START..ocpm::DMAC_END).contains(&addr) {
            self.ocpm.dmac.write32(addr, value);
            return;
        }

        log::warn!("[OCPM] write32 {addr:03X}: {value:08X}");
    }

    /// Runs a whole burst at once. The channel state is copied out so the
    /// unit loop can read and write through the bus it lives in.
    fn dmac_start_transfer(&mut self, index: usize, sched: &mut Scheduler) {
        let mut chan = self.ocpm.dmac.chan[index];
        let ctrl = chan.ctrl;

        assert!(!ctrl.irq_enable, "[DMAC] IRQ-driven transfers unsupported");
        assert!(ctrl.transfer_16bit, "[DMAC] 8-bit transfers unsupported");
        assert!(ctrl.is_burst, "[DMAC] cycle-steal transfers unsupported");
        assert!(ctrl.mode == 0x0C, "[DMAC] mode {:X} unsupported", ctrl.mode);

        let src_step = Channel::step_bytes(ctrl.src_step);
        let dst_step = Channel::step_bytes(ctrl.dst_step);

        while chan.transfer_size > 0 {
            let value = self.read16(chan.src_addr, sched);
            self.write16(chan.dst_addr, value, sched);

            chan.src_addr = chan.src_addr.wrapping_add(src_step as u32);
            chan.dst_addr = chan.dst_addr.wrapping_add(dst_step as u32);
            chan.transfer_size -= 1;
        }

        chan.ctrl.finished = true;
        self.ocpm.dmac.chan[index] = chan;
    }
}
