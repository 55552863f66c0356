//! The owning machine composite: CPU, bus, scheduler and the sound-engine
//! handles, plus the per-frame slice loop and event dispatch.
//!
//! Everything lives in one struct so tests can instantiate several machines
//! side by side. Scheduler events name their handler through `EventFn`; the
//! dispatch below is the only place that resolves them.

#[cfg(test)]
mod tests;

use std::error::Error;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::bus::Bus;
use crate::cart::{Cart, CartError};
use crate::cpu::Cpu;
use crate::ocpm::Irq;
use crate::pad::{KeyBindings, PadButton};
use crate::synth::{
    SoundEngine, SoundPort, SynthShared, TARGET_BUFFER_SIZE, TARGET_SAMPLE_RATE,
    TIMEREF_FREQUENCY,
};
use crate::timing::{self, EventFn, Scheduler, CPU_DOMAIN, F_CPU};
use crate::vdp::{self, CYCLES_PER_LINE, DISPLAY_HEIGHT, HSYNC_START, LINES_PER_FRAME};

/// Entry point inside the high BIOS mirror.
pub const INITIAL_PC: u32 = 0x0E00_0480;

/// The serial port whose TX stream feeds the synth.
const MIDI_PORT: usize = 0;

const DUMP_MAGIC: &[u8; 8] = b"LPSTATE\0";

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("BIOS image must be exactly 32 KiB, got {0} bytes")]
    BadBiosSize(usize),
    #[error(transparent)]
    Cart(#[from] CartError),
}

#[derive(Clone, Copy)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub buffer_size: usize,
}

#[derive(Default)]
pub struct SystemConfig {
    pub bios_rom: Vec<u8>,
    pub cart_rom: Vec<u8>,
    pub cart_sram: Vec<u8>,
    pub sram_file_path: Option<String>,
    pub sound_rom: Option<Vec<u8>>,
    pub audio: AudioConfig,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: TARGET_SAMPLE_RATE,
            buffer_size: TARGET_BUFFER_SIZE,
        }
    }
}

pub struct Emulator {
    pub cpu: Cpu,
    pub bus: Bus,
    pub sched: Scheduler,
    sound_shared: Option<Arc<SynthShared>>,
    sound_engine: Option<SoundEngine>,
    key_bindings: KeyBindings,
}

impl Emulator {
    pub fn new(config: SystemConfig) -> Result<Self, SetupError> {
        if config.bios_rom.len() != crate::bus::BIOS_SIZE {
            return Err(SetupError::BadBiosSize(config.bios_rom.len()));
        }

        let cart = Cart::new(config.cart_rom, config.cart_sram, config.sram_file_path)?;
        let mut bus = Bus::new(config.bios_rom, cart);
        let mut sched = Scheduler::new();

        let mut cpu = Cpu::new();
        cpu.set_pc(INITIAL_PC);

        // Arm the per-line VDP events.
        sched.add_event(
            EventFn::VdpHsync,
            timing::convert_cpu(HSYNC_START),
            0,
            CPU_DOMAIN,
        );
        sched.add_event(
            EventFn::VdpLineAdvance,
            timing::convert_cpu(CYCLES_PER_LINE),
            0,
            CPU_DOMAIN,
        );

        let mut sound_shared = None;
        let mut sound_engine = None;
        if let Some(rom) = config.sound_rom.filter(|rom| !rom.is_empty()) {
            let (engine, shared) = SoundEngine::new(
                rom,
                config.audio.sample_rate as f32,
                config.audio.buffer_size,
            );
            bus.sound = SoundPort::connected(shared.clone());
            sound_shared = Some(shared);
            sound_engine = Some(engine);
        }

        let mut emulator = Self {
            cpu,
            bus,
            sched,
            sound_shared,
            sound_engine,
            key_bindings: KeyBindings::new(),
        };

        if emulator.bus.sound.is_connected() {
            log::info!("[Sound] Schedule timeref {TIMEREF_FREQUENCY} Hz");
            emulator.sound_timeref_event(0);
        }

        Ok(emulator)
    }

    /// Runs one video frame: arm the end-of-frame flag, then alternate CPU
    /// slices (bounded by the next pending event) with event dispatch until
    /// the VDP signals VSYNC entry.
    pub fn run_frame(&mut self) {
        self.bus.vdp.frame_ended = false;

        while !self.bus.vdp.frame_ended {
            let slice = self.sched.calc_slice_length(CPU_DOMAIN) as i32;
            self.sched.begin_slice(CPU_DOMAIN, slice);
            self.cpu.run(&mut self.bus, &mut self.sched);
            self.sched.end_slice(CPU_DOMAIN);

            while let Some((ev, cycles_late)) = self.sched.pop_due(CPU_DOMAIN) {
                self.handle_event(ev.func, ev.param, cycles_late);
            }
        }

        self.bus.cart.sram_commit_check();
    }

    fn handle_event(&mut self, func: EventFn, param: u64, cycles_late: i64) {
        match func {
            EventFn::CpuIrq => self.handle_irq(),
            EventFn::ItuCompare => {
                let ocpm = &mut self.bus.ocpm;
                ocpm.itu
                    .compare_event(param as usize, &mut self.sched, &mut ocpm.intc);
                self.bus.intc_check(&mut self.sched);
            }
            EventFn::SciTxBit => {
                let port = param as usize;
                let completed = {
                    let ocpm = &mut self.bus.ocpm;
                    ocpm.sci.tx_bit_event(port, &mut self.sched, &mut ocpm.dmac)
                };
                if let Some(byte) = completed {
                    if port == MIDI_PORT {
                        self.bus.sound.midi_in(byte);
                    }
                }
            }
            EventFn::VdpHsync => self.vdp_hsync_event(cycles_late),
            EventFn::VdpLineAdvance => self.vdp_line_event(cycles_late),
            EventFn::SoundTimeref => self.sound_timeref_event(cycles_late),
        }
    }

    /// Deferred interrupt acceptance: take the INTC's proposal if it beats
    /// the mask, push state, then raise the mask to the taken priority.
    fn handle_irq(&mut self) {
        let Some((irq, vector, prio)) = self.bus.ocpm.intc.current() else {
            return;
        };
        if (prio as i32) <= self.cpu.imask() {
            return;
        }

        self.cpu
            .raise_exception(vector as u32, &mut self.bus, &mut self.sched);

        // The mask changes only after the pushes so the stacked SR holds
        // the pre-entry value.
        self.cpu.set_imask((prio as u32).min(15));

        self.bus.ocpm.intc.acknowledge(irq);
    }

    fn vdp_hsync_event(&mut self, cycles_late: i64) {
        self.bus.vdp.hcount |= 0x100;

        let cmp = self.bus.vdp.cmp_irq;
        if cmp.irq0_enable && cmp.use_hcmp {
            self.bus.ocpm.intc.assert_irq(Irq::Irq0, 0);
            self.bus.intc_check(&mut self.sched);
        }

        self.sched.add_event(
            EventFn::VdpHsync,
            timing::convert_cpu(CYCLES_PER_LINE - cycles_late),
            0,
            CPU_DOMAIN,
        );
    }

    /// End of line: draw the line VCOUNT points at, then advance it,
    /// entering VSYNC past the visible region and wrapping at 0x200.
    fn vdp_line_event(&mut self, cycles_late: i64) {
        {
            let vdp = &mut self.bus.vdp;
            vdp.hcount &= !0x100;

            let line = vdp.vcount as usize;
            if line < DISPLAY_HEIGHT {
                vdp.draw_scanline(line);
            }
            vdp.vcount += 1;
        }

        if self.bus.vdp.vcount == DISPLAY_HEIGHT as u16 {
            // VSYNC entry: shift into the negative wrap region.
            self.bus.vdp.vcount = self.bus.vdp.vcount.wrapping_sub(LINES_PER_FRAME) & 0x1FF;
            self.bus.vdp.frame_ended = true;

            if self.bus.vdp.cmp_irq.nmi_enable {
                self.bus.ocpm.intc.assert_irq(Irq::Nmi, 0);
                self.bus.intc_check(&mut self.sched);
            }
        }

        if self.bus.vdp.vcount == 0x200 {
            self.bus.vdp.vcount = 0;
        }

        let cmp = self.bus.vdp.cmp_irq;
        if cmp.irq0_enable && !cmp.use_hcmp && self.bus.vdp.vcount == cmp.vcmp {
            self.bus.ocpm.intc.assert_irq(Irq::Irq0, 0);
            self.bus.intc_check(&mut self.sched);
        }

        self.sched.add_event(
            EventFn::VdpLineAdvance,
            timing::convert_cpu(CYCLES_PER_LINE - cycles_late),
            0,
            CPU_DOMAIN,
        );
    }

    fn sound_timeref_event(&mut self, cycles_late: i64) {
        let cycles_per_timeref = F_CPU / TIMEREF_FREQUENCY;
        self.sched.add_event(
            EventFn::SoundTimeref,
            timing::convert_cpu(cycles_per_timeref - cycles_late),
            0,
            CPU_DOMAIN,
        );

        self.bus
            .sound
            .time_reference(1.0 / TIMEREF_FREQUENCY as f32);
    }

    /// The composited 256x240 ARGB1555 frame.
    pub fn get_display_output(&self) -> &[u16] {
        self.bus.vdp.display_output()
    }

    /// Hands the audio engine to the host; it is `Send` and meant to live
    /// on the audio callback thread. Absent when no sound ROM was given.
    pub fn take_sound_engine(&mut self) -> Option<SoundEngine> {
        self.sound_engine.take()
    }

    pub fn set_mute(&self, mute: bool) {
        self.bus.sound.set_mute(mute);
    }

    pub fn add_key_binding(&mut self, code: i32, button: PadButton) {
        self.key_bindings.add(code, button);
    }

    pub fn set_key_state(&mut self, code: i32, pressed: bool) {
        if let Some(button) = self.key_bindings.lookup(code) {
            self.bus.pad.update(button, pressed);
        }
    }

    pub fn update_pad(&mut self, button: PadButton, pressed: bool) {
        self.bus.pad.update(button, pressed);
    }

    pub fn sram(&self) -> &[u8] {
        &self.bus.cart.sram
    }

    /// Final SRAM commit; the periodic one already runs every 60 frames.
    pub fn shutdown(&mut self) {
        self.bus.cart.commit_sram();
    }

    pub fn save_state_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn Error>> {
        let bytes = bincode::encode_to_vec(
            (&self.cpu, &self.bus, &self.sched),
            bincode::config::standard(),
        )?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_state_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Box<dyn Error>> {
        let bytes = fs::read(path)?;
        let ((cpu, mut bus, sched), _): ((Cpu, Bus, Scheduler), usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())?;

        // The sound port is transient; reattach the live queue.
        if let Some(shared) = &self.sound_shared {
            bus.sound = SoundPort::connected(shared.clone());
        }

        self.cpu = cpu;
        self.bus = bus;
        self.sched = sched;
        Ok(())
    }

    /// Serial-debug memory dump: magic plus big-endian region records of
    /// bitmap VRAM, tile VRAM, palette and OAM.
    pub fn debug_dump_bytes(&self) -> Vec<u8> {
        let vdp = &self.bus.vdp;
        let regions: [(u32, &[u8]); 4] = [
            (vdp::BITMAP_VRAM_START, &vdp.bitmap),
            (vdp::TILE_VRAM_START, &vdp.tile),
            (vdp::PALETTE_START, &vdp.palette),
            (vdp::OAM_START, &vdp.oam),
        ];

        let mut out = Vec::new();
        out.extend_from_slice(DUMP_MAGIC);
        for (addr, data) in regions {
            out.extend_from_slice(&addr.to_be_bytes());
            out.extend_from_slice(&(data.len() as u32).to_be_bytes());
            out.extend_from_slice(&2u32.to_be_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    pub fn write_debug_dump<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        fs::write(path, self.debug_dump_bytes())
    }
}
