//! Serial communication interface: two bit-timed TX ports.
//!
//! Each bit lasts `(32 << (clock_factor * 2)) * (bit_factor + 1)` CPU
//! cycles. A scheduler event per bit shifts the character out LSB-first;
//! when a byte completes it is handed to the machine (port 0 feeds the
//! synth's MIDI queue) and a buffered follow-up byte restarts the shifter
//! and raises the TX DREQ.

use crate::ocpm::dmac::{Dmac, Dreq};
use crate::timing::{self, EventFn, EventHandle, Scheduler, CPU_DOMAIN};

pub const PORT_COUNT: usize = 2;

const TX_DREQS: [Dreq; PORT_COUNT] = [Dreq::Txi0, Dreq::Txi1];

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
struct Mode {
    clock_factor: u8,
    mp_enable: bool,
    stop_bit_length: u8,
    parity_mode: u8,
    parity_enable: bool,
    seven_bit_mode: bool,
    sync_mode: bool,
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
struct Ctrl {
    clock_mode: u8,
    tx_end_intr_enable: bool,
    mp_intr_enable: bool,
    rx_enable: bool,
    tx_enable: bool,
    rx_intr_enable: bool,
    tx_intr_enable: bool,
}

#[derive(Clone, Copy, bincode::Encode, bincode::Decode)]
pub struct Port {
    tx_ev: EventHandle,

    bit_factor: u32,
    cycles_per_bit: i64,

    mode: Mode,
    ctrl: Ctrl,
    tx_empty: bool,

    tx_bits_left: u8,
    tx_shift_reg: u8,
    tx_buffer: u8,
    tx_prepared_data: u8,
}

impl Port {
    fn new() -> Self {
        let mut port = Self {
            tx_ev: EventHandle::invalid(),
            bit_factor: 0,
            cycles_per_bit: 0,
            mode: Mode::default(),
            ctrl: Ctrl::default(),
            tx_empty: true,
            tx_bits_left: 0,
            tx_shift_reg: 0,
            tx_buffer: 0,
            tx_prepared_data: 0,
        };
        port.calc_cycles_per_bit();
        port
    }

    fn calc_cycles_per_bit(&mut self) {
        assert!(!self.mode.sync_mode, "[Serial] sync mode unsupported");
        self.cycles_per_bit =
            (32i64 << (self.mode.clock_factor * 2)) * (self.bit_factor as i64 + 1);
    }
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Sci {
    ports: [Port; PORT_COUNT],
}

impl Sci {
    pub fn new() -> Self {
        Self {
            ports: [Port::new(); PORT_COUNT],
        }
    }

    pub fn tx_empty(&self, port: usize) -> bool {
        self.ports[port].tx_empty
    }

    fn sched_tx_ev(&mut self, port: usize, sched: &mut Scheduler) {
        let cycles = self.ports[port].cycles_per_bit;
        self.ports[port].tx_ev = sched.add_event(
            EventFn::SciTxBit,
            timing::convert_cpu(cycles),
            port as u64,
            CPU_DOMAIN,
        );
    }

    fn tx_start(&mut self, port: usize, value: u8, sched: &mut Scheduler) {
        let p = &mut self.ports[port];
        p.tx_bits_left = 8;
        p.tx_shift_reg = value;
        p.tx_empty = true;
        self.sched_tx_ev(port, sched);
    }

    fn check_tx_dreqs(&self, dmac: &mut Dmac) {
        for (index, port) in self.ports.iter().enumerate() {
            if port.tx_empty && port.ctrl.tx_enable {
                dmac.send_dreq(TX_DREQS[index]);
            }
        }
    }

    /// Shifts one bit out. Returns the assembled byte once a full character
    /// has been transmitted.
    pub fn tx_bit_event(
        &mut self,
        port: usize,
        sched: &mut Scheduler,
        dmac: &mut Dmac,
    ) -> Option<u8> {
        let p = &mut self.ports[port];
        let bit = p.tx_shift_reg & 0x1;
        p.tx_shift_reg >>= 1;
        p.tx_prepared_data >>= 1;
        p.tx_prepared_data |= bit << 7;
        p.tx_bits_left -= 1;

        if p.tx_bits_left == 0 {
            let byte = p.tx_prepared_data;
            log::debug!("[Serial] port{port} tx {byte:02X}");

            if !p.tx_empty {
                let next = p.tx_buffer;
                self.tx_start(port, next, sched);
                self.check_tx_dreqs(dmac);
            } else {
                log::debug!("[Serial] port{port} finished tx");
            }

            Some(byte)
        } else {
            self.sched_tx_ev(port, sched);
            None
        }
    }

    pub fn read8(&self, addr: u32) -> u8 {
        let addr = addr & 0xF;
        let port = &self.ports[(addr >> 3) as usize];
        match addr & 0x7 {
            0x04 => {
                if port.tx_empty {
                    0x80
                } else {
                    0
                }
            }
            reg => {
                log::debug!("[Serial] read port reg {reg}");
                0
            }
        }
    }

    pub fn write8(&mut self, addr: u32, value: u8, sched: &mut Scheduler, dmac: &mut Dmac) {
        let addr = addr & 0xF;
        let index = (addr >> 3) as usize;

        match addr & 0x7 {
            0x00 => {
                let port = &mut self.ports[index];
                port.mode.clock_factor = value & 0x3;
                port.mode.mp_enable = (value >> 2) & 0x1 != 0;
                port.mode.stop_bit_length = (value >> 3) & 0x1;
                port.mode.parity_mode = (value >> 4) & 0x1;
                port.mode.parity_enable = (value >> 5) & 0x1 != 0;
                port.mode.seven_bit_mode = (value >> 6) & 0x1 != 0;
                port.mode.sync_mode = (value >> 7) & 0x1 != 0;
                assert!(value & !0x3 == 0, "[Serial] mode {value:02X} unsupported");
                port.calc_cycles_per_bit();
            }
            0x01 => {
                let port = &mut self.ports[index];
                port.bit_factor = value as u32;
                port.calc_cycles_per_bit();
                log::debug!(
                    "[Serial] port{index} baudrate: {} bit/s",
                    timing::F_CPU / port.cycles_per_bit
                );
            }
            0x02 => {
                let port = &mut self.ports[index];
                port.ctrl.clock_mode = value & 0x3;
                port.ctrl.tx_end_intr_enable = (value >> 2) & 0x1 != 0;
                port.ctrl.mp_intr_enable = (value >> 3) & 0x1 != 0;
                port.ctrl.rx_enable = (value >> 4) & 0x1 != 0;
                port.ctrl.tx_enable = (value >> 5) & 0x1 != 0;
                port.ctrl.rx_intr_enable = (value >> 6) & 0x1 != 0;
                port.ctrl.tx_intr_enable = (value >> 7) & 0x1 != 0;

                if !port.ctrl.tx_enable {
                    port.tx_empty = true;
                }

                self.check_tx_dreqs(dmac);
            }
            0x03 => {
                assert!(
                    self.ports[index].tx_empty && self.ports[index].ctrl.tx_enable,
                    "[Serial] tx data written while busy or disabled"
                );

                if self.ports[index].tx_bits_left == 0 {
                    // Space is available; start the timed transfer.
                    self.tx_start(index, value, sched);
                } else {
                    // A byte is in flight; buffer the data and drop DREQ.
                    let port = &mut self.ports[index];
                    port.tx_buffer = value;
                    port.tx_empty = false;
                    dmac.clear_dreq(TX_DREQS[index]);
                }
            }
            0x04 => {
                log::debug!("[Serial] write port{index} status: {value:02X}");
            }
            reg => log::warn!("[Serial] unmapped write8 reg {reg}: {value:02X}"),
        }
    }
}

impl Default for Sci {
    fn default() -> Self {
        Self::new()
    }
}
