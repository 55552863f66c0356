//! Interrupt controller. Each source carries a priority, a pending bit and
//! an optional vector offset (the ITU demultiplexes its sub-IRQs through
//! it). Any state change recomputes the single highest-priority pending
//! source, which the CPU compares against its interrupt mask.

pub const NMI_PRIORITY: u8 = 16;
pub const USER_BREAK_PRIORITY: u8 = 15;

#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum Irq {
    Nmi,
    UserBreak,
    Irq0,
    Irq1,
    Irq2,
    Irq3,
    Irq4,
    Irq5,
    Irq6,
    Irq7,
    Dmac0,
    Dmac1,
    Dmac2,
    Dmac3,
    Itu0,
    Itu1,
    Itu2,
    Itu3,
    Itu4,
    Sci0,
    Sci1,
    Prt,
    Wdt,
    Ref,
}

const IRQ_COUNT: usize = 24;

const ALL_IRQS: [Irq; IRQ_COUNT] = [
    Irq::Nmi,
    Irq::UserBreak,
    Irq::Irq0,
    Irq::Irq1,
    Irq::Irq2,
    Irq::Irq3,
    Irq::Irq4,
    Irq::Irq5,
    Irq::Irq6,
    Irq::Irq7,
    Irq::Dmac0,
    Irq::Dmac1,
    Irq::Dmac2,
    Irq::Dmac3,
    Irq::Itu0,
    Irq::Itu1,
    Irq::Itu2,
    Irq::Itu3,
    Irq::Itu4,
    Irq::Sci0,
    Irq::Sci1,
    Irq::Prt,
    Irq::Wdt,
    Irq::Ref,
];

impl Irq {
    pub fn vector_base(self) -> u8 {
        match self {
            Irq::Nmi => 11,
            Irq::UserBreak => 12,
            Irq::Irq0 => 64,
            Irq::Irq1 => 65,
            Irq::Irq2 => 66,
            Irq::Irq3 => 67,
            Irq::Irq4 => 68,
            Irq::Irq5 => 69,
            Irq::Irq6 => 70,
            Irq::Irq7 => 71,
            Irq::Dmac0 => 72,
            Irq::Dmac1 => 76,
            Irq::Dmac2 => 80,
            Irq::Dmac3 => 84,
            Irq::Itu0 => 80,
            Irq::Itu1 => 84,
            Irq::Itu2 => 88,
            Irq::Itu3 => 92,
            Irq::Itu4 => 96,
            Irq::Sci0 => 100,
            Irq::Sci1 => 104,
            Irq::Prt => 108,
            Irq::Wdt => 112,
            Irq::Ref => 116,
        }
    }

    /// Edge-latched sources are cleared when the CPU takes the interrupt;
    /// the rest stay asserted until their module deasserts them.
    pub fn is_edge(self) -> bool {
        matches!(
            self,
            Irq::Nmi
                | Irq::UserBreak
                | Irq::Irq0
                | Irq::Irq1
                | Irq::Irq2
                | Irq::Irq3
                | Irq::Irq4
                | Irq::Irq5
                | Irq::Irq6
                | Irq::Irq7
        )
    }

    fn index(self) -> usize {
        ALL_IRQS.iter().position(|&irq| irq == self).unwrap()
    }
}

#[derive(Clone, Copy, Default, bincode::Encode, bincode::Decode)]
struct Source {
    prio: u8,
    pending: bool,
    offset: u8,
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Intc {
    sources: [Source; IRQ_COUNT],
    current: Option<(usize, u8, u8)>,
}

impl Intc {
    pub fn new() -> Self {
        let mut intc = Self {
            sources: [Source::default(); IRQ_COUNT],
            current: None,
        };
        // NMI and UserBreak have fixed priorities.
        intc.sources[Irq::Nmi.index()].prio = NMI_PRIORITY;
        intc.sources[Irq::UserBreak.index()].prio = USER_BREAK_PRIORITY;
        intc
    }

    /// Highest-priority pending source as `(irq, vector, priority)`.
    pub fn current(&self) -> Option<(Irq, u8, u8)> {
        self.current
            .map(|(index, vector, prio)| (ALL_IRQS[index], vector, prio))
    }

    pub fn assert_irq(&mut self, irq: Irq, offset: u8) {
        let src = &mut self.sources[irq.index()];
        src.pending = true;
        src.offset = offset;
        self.update();
    }

    pub fn deassert_irq(&mut self, irq: Irq) {
        self.sources[irq.index()].pending = false;
        self.update();
    }

    /// Drops the pending bit of an edge source once the CPU has entered it.
    pub fn acknowledge(&mut self, irq: Irq) {
        if irq.is_edge() {
            self.sources[irq.index()].pending = false;
            self.update();
        }
    }

    pub fn set_priority(&mut self, irq: Irq, prio: u8) {
        // Fixed-priority sources are not configurable.
        if matches!(irq, Irq::Nmi | Irq::UserBreak) {
            return;
        }
        self.sources[irq.index()].prio = prio & 0xF;
        self.update();
    }

    pub fn priority(&self, irq: Irq) -> u8 {
        self.sources[irq.index()].prio
    }

    /// IPR window at `0x05FFFE00 + 0xF84..0xF90`, packed nibbles high to low.
    pub fn write16(&mut self, addr: u32, value: u16) {
        match addr & 0xF {
            0x04 => {
                self.set_priority(Irq::Irq0, (value >> 12) as u8);
                self.set_priority(Irq::Irq1, (value >> 8) as u8);
                self.set_priority(Irq::Irq2, (value >> 4) as u8);
                self.set_priority(Irq::Irq3, value as u8);
            }
            0x06 => {
                self.set_priority(Irq::Irq4, (value >> 12) as u8);
                self.set_priority(Irq::Irq5, (value >> 8) as u8);
                self.set_priority(Irq::Irq6, (value >> 4) as u8);
                self.set_priority(Irq::Irq7, value as u8);
            }
            0x08 => {
                self.set_priority(Irq::Dmac0, (value >> 12) as u8);
                self.set_priority(Irq::Dmac1, (value >> 12) as u8);
                self.set_priority(Irq::Dmac2, (value >> 8) as u8);
                self.set_priority(Irq::Dmac3, (value >> 8) as u8);
                self.set_priority(Irq::Itu0, (value >> 4) as u8);
                self.set_priority(Irq::Itu1, value as u8);
            }
            0x0A => {
                self.set_priority(Irq::Itu2, (value >> 12) as u8);
                self.set_priority(Irq::Itu3, (value >> 8) as u8);
                self.set_priority(Irq::Itu4, (value >> 4) as u8);
            }
            0x0C => {
                self.set_priority(Irq::Sci0, (value >> 12) as u8);
                self.set_priority(Irq::Sci1, (value >> 8) as u8);
                self.set_priority(Irq::Prt, (value >> 4) as u8);
                self.set_priority(Irq::Wdt, value as u8);
            }
            reg => log::warn!("[INTC] unmapped write16 reg {reg:X}: {value:04X}"),
        }
    }

    pub fn read16(&self, addr: u32) -> u16 {
        match addr & 0xF {
            0x08 => {
                ((self.priority(Irq::Dmac0) as u16) << 12)
                    | ((self.priority(Irq::Dmac2) as u16) << 8)
                    | ((self.priority(Irq::Itu0) as u16) << 4)
                    | self.priority(Irq::Itu1) as u16
            }
            reg => {
                log::warn!("[INTC] unmapped read16 reg {reg:X}");
                0
            }
        }
    }

    fn update(&mut self) {
        let mut best: Option<(usize, u8, u8)> = None;
        for (index, src) in self.sources.iter().enumerate() {
            if !src.pending || src.prio == 0 {
                continue;
            }
            let vector = ALL_IRQS[index].vector_base() + src.offset;
            match best {
                Some((_, _, prio)) if prio >= src.prio => {}
                _ => best = Some((index, vector, src.prio)),
            }
        }
        self.current = best;
    }
}

impl Default for Intc {
    fn default() -> Self {
        Self::new()
    }
}
