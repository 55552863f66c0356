//! Integrated timer unit: five 16-bit compare-match timers.
//!
//! A running timer keeps no per-tick state; it snapshots the counter and
//! timestamp when (re)armed and schedules one event at the nearest of
//! compare 1, compare 2 and the 0x10000 overflow. The counter is
//! reconstructed from elapsed time on demand.

use crate::ocpm::intc::{Intc, Irq};
use crate::timing::{self, EventFn, EventHandle, Scheduler, CPU_DOMAIN};

pub const TIMER_COUNT: usize = 5;

const OVERFLOW_TARGET: u32 = 0x10000;

const TIMER_IRQS: [Irq; TIMER_COUNT] = [Irq::Itu0, Irq::Itu1, Irq::Itu2, Irq::Itu3, Irq::Itu4];

/// Interrupt flag bits: compare A, compare B, overflow.
const FLAG_IMFA: u8 = 0x1;
const FLAG_IMFB: u8 = 0x2;
const FLAG_OVF: u8 = 0x4;

#[derive(Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct Timer {
    ev: EventHandle,
    enabled: bool,

    clock: u8,
    edge_mode: u8,
    clear_mode: u8,

    intr_enable: u8,
    intr_flag: u8,

    counter: u32,
    counter_when_started: u32,
    gen_reg: [u32; 2],

    time_when_started: i64,
}

impl Timer {
    fn new() -> Self {
        Self {
            ev: EventHandle::invalid(),
            enabled: false,
            clock: 0,
            edge_mode: 0,
            clear_mode: 0,
            intr_enable: 0,
            intr_flag: 0,
            counter: 0,
            counter_when_started: 0,
            gen_reg: [0; 2],
            time_when_started: 0,
        }
    }
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Itu {
    pub timers: [Timer; TIMER_COUNT],
    timer_enable: u8,
    sync_ctrl: u8,
    mode: u8,
}

impl Itu {
    pub fn new() -> Self {
        Self {
            timers: [Timer::new(); TIMER_COUNT],
            timer_enable: 0,
            sync_ctrl: 0,
            mode: 0,
        }
    }

    pub fn counter(&self, id: usize) -> u32 {
        self.timers[id].counter
    }

    pub fn intr_flag(&self, id: usize) -> u8 {
        self.timers[id].intr_flag
    }

    fn update_counter(&mut self, id: usize, sched: &Scheduler) {
        let timer = &mut self.timers[id];
        if !timer.ev.is_valid() {
            return;
        }

        assert!(timer.clock & !0x3 == 0);

        let time_elapsed = sched.timestamp(CPU_DOMAIN) - timer.time_when_started;
        timer.counter =
            (timer.counter_when_started + (time_elapsed >> timer.clock) as u32) & 0xFFFF;
    }

    fn set_enable(&mut self, id: usize, enable: bool, sched: &mut Scheduler) {
        self.timers[id].enabled = enable;

        if !self.timers[id].ev.is_valid() && enable {
            self.start(id, sched);
        } else if self.timers[id].ev.is_valid() && !enable {
            let mut ev = self.timers[id].ev;
            sched.cancel_event(&mut ev);
            self.timers[id].ev = ev;
        }
    }

    fn start(&mut self, id: usize, sched: &mut Scheduler) {
        let timer = &mut self.timers[id];

        assert!(timer.clock & !0x3 == 0);
        assert!(timer.edge_mode == 0);
        assert!(timer.clear_mode != 3);

        // Find the target which takes the smallest amount of time to reach.
        let mut nearest_target = OVERFLOW_TARGET;
        for i in 0..2 {
            if timer.counter < timer.gen_reg[i] {
                nearest_target = nearest_target.min(timer.gen_reg[i]);
            }
        }

        let cycles = ((nearest_target - timer.counter) as i64) << timer.clock;
        timer.time_when_started = sched.timestamp(CPU_DOMAIN);
        timer.counter_when_started = timer.counter;
        self.timers[id].ev = sched.add_event(
            EventFn::ItuCompare,
            timing::convert_cpu(cycles),
            id as u64,
            CPU_DOMAIN,
        );
    }

    /// Disable and re-enable to force new timing to take effect.
    fn update_target(&mut self, id: usize, sched: &mut Scheduler) {
        if self.timers[id].enabled {
            self.set_enable(id, false, sched);
            self.set_enable(id, true, sched);
        }
    }

    fn update_timer_irq(&mut self, id: usize, intc: &mut Intc) {
        let timer = &self.timers[id];

        let mut subirq = None;
        for i in 0..3 {
            if timer.intr_enable & timer.intr_flag & (1 << i) != 0 {
                subirq = Some(i);
                break;
            }
        }

        match subirq {
            Some(i) => intc.assert_irq(TIMER_IRQS[id], i),
            None => intc.deassert_irq(TIMER_IRQS[id]),
        }
    }

    /// Compare-match event handler. Reconstructs the counter, raises the
    /// matching flags, applies the clear mode, updates the INTC and re-arms.
    pub fn compare_event(&mut self, id: usize, sched: &mut Scheduler, intc: &mut Intc) {
        self.update_counter(id, sched);
        self.timers[id].ev = EventHandle::invalid();

        let timer = &mut self.timers[id];
        let mut clear_counter = false;

        if timer.counter == timer.gen_reg[0] {
            timer.intr_flag |= FLAG_IMFA;
            if timer.clear_mode == 1 {
                clear_counter = true;
            }
        }

        if timer.counter == timer.gen_reg[1] {
            timer.intr_flag |= FLAG_IMFB;
            if timer.clear_mode == 2 {
                clear_counter = true;
            }
        }

        if timer.counter == 0 {
            // Free-running wrap past 0xFFFF.
            timer.intr_flag |= FLAG_OVF;
        }

        if clear_counter {
            timer.counter = 0;
        }

        self.update_timer_irq(id, intc);

        if self.timers[id].enabled {
            self.start(id, sched);
        }
    }

    /// Timers 3 and 4 have extra registers and are also spaced oddly; the
    /// remaining timers have predictable spacing. Shared registers return no
    /// timer index.
    fn decode(addr: u32) -> (Option<usize>, u32) {
        let addr = addr & 0x3F;

        if addr >= 0x32 {
            return (Some(4), addr - 0x32);
        }

        if (0x22..0x30).contains(&addr) {
            return (Some(3), addr - 0x22);
        }

        if (0x04..0x22).contains(&addr) {
            let addr = addr - 0x04;
            return (Some((addr / 0xA) as usize), addr % 0xA);
        }

        (None, addr)
    }

    pub fn read8(&mut self, addr: u32, sched: &Scheduler) -> u8 {
        let (timer, reg) = Self::decode(addr);

        if let Some(id) = timer {
            return match reg {
                0x03 => self.timers[id].intr_flag | 0x78,
                0x04 => {
                    self.update_counter(id, sched);
                    (self.timers[id].counter >> 8) as u8
                }
                0x05 => {
                    self.update_counter(id, sched);
                    self.timers[id].counter as u8
                }
                _ => {
                    log::warn!("[Timer] unmapped read8 timer{id} reg {reg:X}");
                    0
                }
            };
        }

        match reg {
            0x00 => self.timer_enable | 0x60,
            0x01 => self.sync_ctrl | 0x60,
            0x02 => self.mode,
            _ => {
                log::warn!("[Timer] unmapped read8 shared reg {reg:X}");
                0
            }
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8, sched: &mut Scheduler, intc: &mut Intc) {
        let (timer, reg) = Self::decode(addr);

        if let Some(id) = timer {
            match reg {
                0x00 => {
                    self.update_counter(id, sched);
                    let timer = &mut self.timers[id];
                    timer.clock = value & 0x7;
                    timer.edge_mode = (value >> 3) & 0x3;
                    timer.clear_mode = (value >> 5) & 0x3;
                    self.update_target(id, sched);
                }
                0x01 => {
                    assert!(value == 0, "[Timer] timer{id} io ctrl {value:02X} unsupported");
                }
                0x02 => {
                    self.timers[id].intr_enable = value;
                    self.update_timer_irq(id, intc);
                }
                0x03 => {
                    self.timers[id].intr_flag &= value;
                    self.update_timer_irq(id, intc);
                }
                0x04 => {
                    // The BIOS writes 0 here assuming it resets the whole counter.
                    self.update_counter(id, sched);
                    let timer = &mut self.timers[id];
                    timer.counter &= 0x00FF;
                    timer.counter |= (value as u32) << 8;
                    self.update_target(id, sched);
                }
                0x05 => {
                    self.update_counter(id, sched);
                    let timer = &mut self.timers[id];
                    timer.counter &= 0xFF00;
                    timer.counter |= value as u32;
                    self.update_target(id, sched);
                }
                _ => log::warn!("[Timer] unmapped write8 timer{id} reg {reg:X}: {value:02X}"),
            }
            return;
        }

        match reg {
            0x00 => {
                self.timer_enable = value & 0x1F;
                for id in 0..TIMER_COUNT {
                    self.set_enable(id, (value >> id) & 0x1 != 0, sched);
                }
            }
            0x01 => {
                self.sync_ctrl = value & 0x1F;
                assert!(self.sync_ctrl == 0, "[Timer] sync ctrl unsupported");
            }
            0x02 => {
                self.mode = value & 0x7F;
                assert!(self.mode == 0, "[Timer] mode {value:02X} unsupported");
            }
            _ => log::warn!("[Timer] unmapped write8 shared reg {reg:X}: {value:02X}"),
        }
    }

    pub fn read16(&mut self, addr: u32, sched: &Scheduler) -> u16 {
        let (timer, reg) = Self::decode(addr);

        if let Some(id) = timer {
            return match reg {
                0x04 => {
                    self.update_counter(id, sched);
                    self.timers[id].counter as u16
                }
                0x06 | 0x08 => self.timers[id].gen_reg[((reg - 0x06) >> 1) as usize] as u16,
                _ => {
                    log::warn!("[Timer] unmapped read16 timer{id} reg {reg:X}");
                    0
                }
            };
        }

        log::warn!("[Timer] unmapped read16 shared reg {reg:X}");
        0
    }

    pub fn write16(&mut self, addr: u32, value: u16, sched: &mut Scheduler, intc: &mut Intc) {
        let _ = intc;
        let (timer, reg) = Self::decode(addr);

        if let Some(id) = timer {
            match reg {
                0x04 => {
                    self.timers[id].counter = value as u32;
                    self.update_target(id, sched);
                }
                0x06 | 0x08 => {
                    let index = ((reg - 0x06) >> 1) as usize;
                    self.update_counter(id, sched);
                    self.timers[id].gen_reg[index] = value as u32;
                    self.update_target(id, sched);
                }
                _ => log::warn!("[Timer] unmapped write16 timer{id} reg {reg:X}: {value:04X}"),
            }
            return;
        }

        log::warn!("[Timer] unmapped write16 shared reg {reg:X}: {value:04X}");
    }
}

impl Default for Itu {
    fn default() -> Self {
        Self::new()
    }
}
