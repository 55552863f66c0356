//! Video display processor: memories, register file and MMIO decode.
//!
//! Rendering happens a scanline at a time from `render.rs`, driven by two
//! scheduler events per line (HSYNC start at ~75% of the line, line advance
//! at the end). The machine owns those events; this module owns all state
//! they touch.

mod render;

#[cfg(test)]
mod tests;

use crate::timing::F_CPU;

pub const DISPLAY_WIDTH: usize = 256;
pub const DISPLAY_HEIGHT: usize = 240;

pub const LINES_PER_FRAME: u16 = 263;
pub const CYCLES_PER_LINE: i64 = F_CPU / (60 * 263);
pub const HSYNC_START: i64 = CYCLES_PER_LINE * 3 / 4;

pub const BITMAP_VRAM_START: u32 = 0x0400_0000;
pub const BITMAP_VRAM_SIZE: usize = 0x20000;

pub const TILE_VRAM_START: u32 = 0x0404_0000;
pub const TILE_VRAM_SIZE: usize = 0x10000;

pub const OAM_START: u32 = 0x0405_0000;
pub const OAM_SIZE: usize = 0x200;

pub const PALETTE_START: u32 = 0x0405_1000;
pub const PALETTE_SIZE: usize = 0x200;

pub const CAPTURE_START: u32 = 0x0405_2000;
pub const CAPTURE_SIZE: usize = 0x200;

pub const CTRL_REG_START: u32 = 0x0405_8000;
pub const CTRL_REG_END: u32 = 0x0405_9000;

pub const BITMAP_REG_START: u32 = 0x0405_9000;
pub const BITMAP_REG_END: u32 = 0x0405_A000;

pub const BGOBJ_REG_START: u32 = 0x0405_A000;
pub const BGOBJ_REG_END: u32 = 0x0405_B000;

pub const DISPLAY_REG_START: u32 = 0x0405_B000;
pub const DISPLAY_REG_END: u32 = 0x0405_C000;

pub const CMP_IRQ_REG_START: u32 = 0x0405_C000;
pub const CMP_IRQ_REG_END: u32 = 0x0405_D000;

pub const DMA_CTRL_REG_START: u32 = 0x0405_E000;
pub const DMA_CTRL_REG_END: u32 = 0x0405_F000;

pub const DMA_TRIGGER_START: u32 = 0x0405_F000;
pub const DMA_TRIGGER_END: u32 = 0x0406_0000;

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct BitmapRegs {
    pub scrollx: u16,
    pub scrolly: u16,
    pub screenx: u16,
    pub screeny: u16,
    pub w: u16,
    pub clipx: u16,
    pub h: u16,
    pub buffer_ctrl: u16,
    /// Last below-threshold pixel seen by the edge fill in the current row.
    pub buffered_color: u8,
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct LayerCtrl {
    pub bg_enable: [bool; 2],
    pub bitmap_enable: [bool; 4],
    pub obj_enable: [bool; 2],
    /// Per bitmap pair: 0x1 writes screen B, 0x2 writes screen A.
    pub bitmap_screen_mode: [u8; 2],
    pub obj_screen_mode: [u8; 2],
}

impl LayerCtrl {
    fn get(&self) -> u16 {
        let mut result = 0u16;
        for i in 0..2 {
            result |= (self.bg_enable[i] as u16) << i;
            result |= (self.obj_enable[i] as u16) << (i + 6);
            result |= (self.bitmap_screen_mode[i] as u16) << (8 + i * 2);
            result |= (self.obj_screen_mode[i] as u16) << (12 + i * 2);
        }
        for i in 0..4 {
            result |= (self.bitmap_enable[i] as u16) << (i + 2);
        }
        result
    }

    fn set(&mut self, value: u16) {
        for i in 0..2 {
            self.bg_enable[i] = (value >> i) & 0x1 != 0;
            self.obj_enable[i] = (value >> (i + 6)) & 0x1 != 0;
            self.bitmap_screen_mode[i] = ((value >> (8 + i * 2)) & 0x3) as u8;
            self.obj_screen_mode[i] = ((value >> (12 + i * 2)) & 0x3) as u8;
        }
        for i in 0..4 {
            self.bitmap_enable[i] = (value >> (i + 2)) & 0x1 != 0;
        }
    }
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct ColorPrio {
    /// Which bitmap pair sits below BG0 (the other goes above BG1).
    pub bitmap_prio: bool,
    /// BG0 above both bitmap pairs instead of below them.
    pub bg0_prio: bool,
    /// Stack level of OBJ layer 0 (0 = top).
    pub obj0_prio: u8,
    pub screen_b_backdrop_only: bool,
    pub blend_subtract: bool,
    pub half: bool,
}

impl ColorPrio {
    fn get(&self) -> u16 {
        (self.bitmap_prio as u16)
            | ((self.bg0_prio as u16) << 1)
            | ((self.obj0_prio as u16) << 2)
            | ((self.screen_b_backdrop_only as u16) << 4)
            | ((self.blend_subtract as u16) << 5)
            | ((self.half as u16) << 6)
    }

    fn set(&mut self, value: u16) {
        self.bitmap_prio = value & 0x1 != 0;
        self.bg0_prio = (value >> 1) & 0x1 != 0;
        self.obj0_prio = ((value >> 2) & 0x3) as u8;
        self.screen_b_backdrop_only = (value >> 4) & 0x1 != 0;
        self.blend_subtract = (value >> 5) & 0x1 != 0;
        self.half = (value >> 6) & 0x1 != 0;
    }
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct CaptureCtrl {
    pub scanline: u16,
    pub format: u8,
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
pub struct CmpIrqCtrl {
    pub irq0_enable: bool,
    pub nmi_enable: bool,
    pub use_hcmp: bool,
    pub hcmp: u16,
    pub vcmp: u16,
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Vdp {
    pub bitmap: Vec<u8>,
    pub tile: Vec<u8>,
    pub oam: Vec<u8>,
    pub palette: Vec<u8>,
    pub capture_buffer: Vec<u8>,

    // Control registers - 0x04058xxx
    pub mode: u16,
    pub hcount: u16,
    pub vcount: u16,
    pub capture_enable: bool,

    // Bitmap registers - 0x04059xxx
    pub bitmap_regs: [BitmapRegs; 4],
    pub bitmap_mode: u16,
    pub bitmap_palsel: u16,

    // BG/OBJ registers - 0x0405Axxx
    bg_ctrl: u16,
    pub bg_shared_maps: bool,
    pub bg_map_size: u8,
    pub bg0_8bit: bool,
    pub bg_tile_size: [u16; 2],
    pub bg_scrollx: [u16; 2],
    pub bg_scrolly: [u16; 2],
    pub bg_palsel: [u16; 2],
    pub tilebase: u16,
    obj_ctrl: u16,
    pub obj_id_offs: u16,
    pub obj_8bit: bool,
    pub obj_palsel: [u16; 2],
    pub obj_tile_offs: [u16; 2],

    // Display registers - 0x0405Bxxx
    pub dispmode: u16,
    pub layer_ctrl: LayerCtrl,
    pub color_prio: ColorPrio,
    pub backdrops: [u16; 2],
    pub capture_ctrl: CaptureCtrl,

    // Compare IRQ registers - 0x0405Cxxx
    pub cmp_irq: CmpIrqCtrl,

    // DMA registers - 0x0405Exxx
    pub dma_mask: u16,
    pub dma_value: u16,

    // Scanline state: 8-bit paletted screens A and B, cleared per line.
    pub screens: [[u8; DISPLAY_WIDTH]; 2],

    // Full-frame per-layer outputs plus the composited display.
    pub bg_output: [Vec<u16>; 2],
    pub obj_output: [Vec<u16>; 2],
    pub bitmap_output: [Vec<u16>; 4],
    pub screen_output: [Vec<u16>; 2],
    pub display_output: Vec<u16>,

    pub frame_ended: bool,
}

impl Vdp {
    pub fn new() -> Self {
        let frame = || vec![0u16; DISPLAY_WIDTH * DISPLAY_HEIGHT];
        Self {
            bitmap: vec![0; BITMAP_VRAM_SIZE],
            tile: vec![0; TILE_VRAM_SIZE],
            oam: vec![0; OAM_SIZE],
            palette: vec![0; PALETTE_SIZE],
            capture_buffer: vec![0; CAPTURE_SIZE],
            mode: 0,
            hcount: 0,
            vcount: 0,
            capture_enable: false,
            bitmap_regs: [BitmapRegs::default(); 4],
            bitmap_mode: 0,
            bitmap_palsel: 0,
            bg_ctrl: 0,
            bg_shared_maps: false,
            bg_map_size: 0,
            bg0_8bit: false,
            bg_tile_size: [8; 2],
            bg_scrollx: [0; 2],
            bg_scrolly: [0; 2],
            bg_palsel: [0; 2],
            tilebase: 0,
            obj_ctrl: 0,
            obj_id_offs: 0,
            obj_8bit: false,
            obj_palsel: [0; 2],
            obj_tile_offs: [0; 2],
            dispmode: 0,
            layer_ctrl: LayerCtrl::default(),
            color_prio: ColorPrio::default(),
            backdrops: [0; 2],
            capture_ctrl: CaptureCtrl::default(),
            cmp_irq: CmpIrqCtrl::default(),
            dma_mask: 0,
            dma_value: 0,
            screens: [[0; DISPLAY_WIDTH]; 2],
            bg_output: [frame(), frame()],
            obj_output: [frame(), frame()],
            bitmap_output: [frame(), frame(), frame(), frame()],
            screen_output: [frame(), frame()],
            display_output: frame(),
            frame_ended: false,
        }
    }

    pub fn display_output(&self) -> &[u16] {
        &self.display_output
    }

    pub fn read_palette(&self, index: u8) -> u16 {
        let offset = index as usize * 2;
        u16::from_be_bytes([self.palette[offset], self.palette[offset + 1]])
    }

    // Palette - raw bytes in guest (big-endian) order.

    pub fn palette_read8(&self, addr: u32) -> u8 {
        self.palette[(addr & 0x1FF) as usize]
    }

    pub fn palette_read16(&self, addr: u32) -> u16 {
        let offset = (addr & 0x1FE) as usize;
        u16::from_be_bytes([self.palette[offset], self.palette[offset + 1]])
    }

    pub fn palette_read32(&self, addr: u32) -> u32 {
        let offset = (addr & 0x1FC) as usize;
        u32::from_be_bytes([
            self.palette[offset],
            self.palette[offset + 1],
            self.palette[offset + 2],
            self.palette[offset + 3],
        ])
    }

    pub fn palette_write8(&mut self, addr: u32, value: u8) {
        self.palette[(addr & 0x1FF) as usize] = value;
    }

    pub fn palette_write16(&mut self, addr: u32, value: u16) {
        let offset = (addr & 0x1FE) as usize;
        self.palette[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn palette_write32(&mut self, addr: u32, value: u32) {
        let offset = (addr & 0x1FC) as usize;
        self.palette[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    // OAM - same storage discipline as the palette.

    pub fn oam_read8(&self, addr: u32) -> u8 {
        self.oam[(addr & 0x1FF) as usize]
    }

    pub fn oam_read16(&self, addr: u32) -> u16 {
        let offset = (addr & 0x1FE) as usize;
        u16::from_be_bytes([self.oam[offset], self.oam[offset + 1]])
    }

    pub fn oam_read32(&self, addr: u32) -> u32 {
        let offset = (addr & 0x1FC) as usize;
        u32::from_be_bytes([
            self.oam[offset],
            self.oam[offset + 1],
            self.oam[offset + 2],
            self.oam[offset + 3],
        ])
    }

    pub fn oam_write8(&mut self, addr: u32, value: u8) {
        self.oam[(addr & 0x1FF) as usize] = value;
    }

    pub fn oam_write16(&mut self, addr: u32, value: u16) {
        let offset = (addr & 0x1FE) as usize;
        self.oam[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn oam_write32(&mut self, addr: u32, value: u32) {
        let offset = (addr & 0x1FC) as usize;
        self.oam[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn capture_read16(&self, addr: u32) -> u16 {
        let offset = (addr & 0x1FE) as usize;
        u16::from_be_bytes([self.capture_buffer[offset], self.capture_buffer[offset + 1]])
    }

    // Control registers.

    pub fn ctrl_read16(&self, addr: u32) -> u16 {
        match addr & 0xFFF {
            0x000 => self.mode,
            0x002 => self.hcount,
            0x004 => self.vcount,
            0x006 => self.capture_enable as u16,
            reg => {
                log::warn!("[VDP] unmapped ctrl read16 {reg:03X}");
                0
            }
        }
    }

    pub fn ctrl_write16(&mut self, addr: u32, value: u16) {
        match addr & 0xFFF {
            0x000 => self.mode = value,
            0x006 => {
                if value & 0x01 != 0 {
                    self.capture_enable = true;
                }
                if value & !0x01 != 0 {
                    log::warn!("[VDP] ctrl 006 extra bits: {value:04X}");
                }
            }
            reg => log::warn!("[VDP] unmapped ctrl write16 {reg:03X}: {value:04X}"),
        }
    }

    // Bitmap registers. The per-layer registers interleave by layer in
    // the low three bits; the register is selected by the rest.

    pub fn bitmap_reg_read16(&self, addr: u32) -> u16 {
        let addr = addr & 0xFFF;
        let index = ((addr >> 1) & 0x3) as usize;
        let layer = &self.bitmap_regs[index];

        match addr & !0x7 {
            0x000 => layer.scrollx,
            0x008 => layer.scrolly,
            0x010 => layer.screenx,
            0x018 => layer.screeny,
            0x020 => layer.w | (layer.clipx << 8),
            0x028 => layer.h,
            0x030 => self.bitmap_mode,
            0x040 => self.bitmap_palsel,
            0x050 => layer.buffer_ctrl,
            reg => {
                log::warn!("[VDP] unmapped bitmap read16 {reg:03X}");
                0
            }
        }
    }

    pub fn bitmap_reg_write16(&mut self, addr: u32, value: u16) {
        let addr = addr & 0xFFF;
        let index = ((addr >> 1) & 0x3) as usize;

        match addr & !0x7 {
            0x000 => self.bitmap_regs[index].scrollx = value & 0x1FF,
            0x008 => self.bitmap_regs[index].scrolly = value & 0x1FF,
            0x010 => self.bitmap_regs[index].screenx = value & 0x1FF,
            0x018 => self.bitmap_regs[index].screeny = value & 0x1FF,
            0x020 => {
                self.bitmap_regs[index].w = value & 0xFF;
                self.bitmap_regs[index].clipx = value >> 8;
            }
            0x028 => self.bitmap_regs[index].h = value & 0xFF,
            0x030 => {
                assert!(
                    value & 0x3 != 3,
                    "[VDP] bitmap mode {value:04X} unsupported"
                );
                self.bitmap_mode = value;
            }
            0x040 => self.bitmap_palsel = value,
            0x050 => self.bitmap_regs[index].buffer_ctrl = value & 0x1FF,
            reg => log::warn!("[VDP] unmapped bitmap write16 {reg:03X}: {value:04X}"),
        }
    }

    // BG/OBJ registers.

    pub fn bgobj_read16(&self, addr: u32) -> u16 {
        match addr & 0xFFF {
            0x000 => self.bg_ctrl,
            0x002 => self.bg_scrollx[0],
            0x004 => self.bg_scrolly[0],
            0x006 => self.bg_scrollx[1],
            0x008 => self.bg_scrolly[1],
            0x010 => self.bg_palsel[0],
            0x012 => self.bg_palsel[1],
            0x014 => self.tilebase,
            0x020 => self.obj_ctrl,
            0x022 => self.obj_palsel[0],
            0x024 => self.obj_palsel[1],
            0x026 => self.obj_tile_offs[0],
            0x028 => self.obj_tile_offs[1],
            reg => {
                log::warn!("[VDP] unmapped bg/obj read16 {reg:03X}");
                0
            }
        }
    }

    pub fn bgobj_write16(&mut self, addr: u32, value: u16) {
        match addr & 0xFFF {
            0x000 => {
                self.bg_ctrl = value;
                self.bg_shared_maps = value & 0x1 != 0;
                self.bg_map_size = ((value >> 1) & 0x3) as u8;
                self.bg0_8bit = (value >> 3) & 0x1 != 0;
                self.bg_tile_size[0] = 8 << ((value >> 4) & 0x3);
                self.bg_tile_size[1] = 8 << ((value >> 6) & 0x3);
            }
            0x002 => self.bg_scrollx[0] = value & 0x1FF,
            0x004 => self.bg_scrolly[0] = value & 0x1FF,
            0x006 => self.bg_scrollx[1] = value & 0x1FF,
            0x008 => self.bg_scrolly[1] = value & 0x1FF,
            0x010 => self.bg_palsel[0] = value,
            0x012 => self.bg_palsel[1] = value,
            0x014 => self.tilebase = value & 0x1FF,
            0x020 => {
                self.obj_ctrl = value;
                self.obj_id_offs = value & 0x7F;
                self.obj_8bit = (value >> 7) & 0x1 != 0;
            }
            0x022 => self.obj_palsel[0] = value,
            0x024 => self.obj_palsel[1] = value,
            0x026 => self.obj_tile_offs[0] = value & 0xFF,
            0x028 => self.obj_tile_offs[1] = value & 0xFF,
            reg => log::warn!("[VDP] unmapped bg/obj write16 {reg:03X}: {value:04X}"),
        }
    }

    // Display registers.

    pub fn display_read16(&self, addr: u32) -> u16 {
        match addr & 0xFFF {
            0x000 => self.dispmode,
            0x002 => self.layer_ctrl.get(),
            0x004 => self.color_prio.get(),
            0x006 => self.backdrops[0],
            0x008 => self.backdrops[1],
            0x00A => self.capture_ctrl.scanline | ((self.capture_ctrl.format as u16) << 8),
            reg => {
                log::warn!("[VDP] unmapped display read16 {reg:03X}");
                0
            }
        }
    }

    pub fn display_write16(&mut self, addr: u32, value: u16) {
        match addr & 0xFFF {
            0x000 => {
                assert!(
                    matches!(value & 0x7, 0 | 1 | 4 | 5),
                    "[VDP] display mode {value:04X} unsupported"
                );
                self.dispmode = value;
            }
            0x002 => self.layer_ctrl.set(value),
            0x004 => self.color_prio.set(value),
            0x006 => self.backdrops[0] = value,
            0x008 => self.backdrops[1] = value,
            0x00A => {
                self.capture_ctrl.scanline = value & 0xFF;
                self.capture_ctrl.format = ((value >> 8) & 0x3) as u8;
            }
            reg => log::warn!("[VDP] unmapped display write16 {reg:03X}: {value:04X}"),
        }
    }

    // Compare IRQ registers.

    pub fn cmp_irq_read16(&self, addr: u32) -> u16 {
        match addr & 0xFFF {
            0x000 => {
                (self.cmp_irq.irq0_enable as u16)
                    | ((self.cmp_irq.nmi_enable as u16) << 1)
                    | ((self.cmp_irq.use_hcmp as u16) << 2)
            }
            0x002 => self.cmp_irq.hcmp,
            0x004 => self.cmp_irq.vcmp,
            reg => {
                log::warn!("[VDP] unmapped cmp-irq read16 {reg:03X}");
                0
            }
        }
    }

    pub fn cmp_irq_write16(&mut self, addr: u32, value: u16) {
        match addr & 0xFFF {
            0x000 => {
                self.cmp_irq.irq0_enable = value & 0x1 != 0;
                self.cmp_irq.nmi_enable = (value >> 1) & 0x1 != 0;
                self.cmp_irq.use_hcmp = (value >> 2) & 0x1 != 0;
            }
            0x002 => self.cmp_irq.hcmp = value & 0x1FF,
            0x004 => self.cmp_irq.vcmp = value & 0x1FF,
            reg => log::warn!("[VDP] unmapped cmp-irq write16 {reg:03X}: {value:04X}"),
        }
    }

    // DMA fill.

    pub fn dma_ctrl_read16(&self, addr: u32) -> u16 {
        match addr & 0xFFF {
            0x000 => self.dma_mask,
            0x002 => self.dma_value,
            reg => {
                log::warn!("[VDP] unmapped dma-ctrl read16 {reg:03X}");
                0
            }
        }
    }

    pub fn dma_ctrl_write16(&mut self, addr: u32, value: u16) {
        match addr & 0xFFF {
            0x000 => self.dma_mask = value,
            0x002 => self.dma_value = value,
            reg => log::warn!("[VDP] unmapped dma-ctrl write16 {reg:03X}: {value:04X}"),
        }
    }

    /// A 16-bit write at trigger offset `2*y` rewrites scanline `y` of
    /// bitmap VRAM: mask-selected bits of every byte take the fill value.
    pub fn dma_trigger_write16(&mut self, addr: u32, _value: u16) {
        let y = ((addr & 0xFFF) >> 1) as usize & 0x1FF;
        let mask = self.dma_mask as u8;
        let value = self.dma_value as u8;

        let row = &mut self.bitmap[y * DISPLAY_WIDTH..(y + 1) * DISPLAY_WIDTH];
        for byte in row {
            *byte = (*byte & !mask) | (value & mask);
        }
    }
}

impl Default for Vdp {
    fn default() -> Self {
        Self::new()
    }
}
