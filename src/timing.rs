//! Event scheduler. Each timer domain owns an absolute timestamp and a
//! min-heap of pending events; the CPU driver consumes a bounded cycle slice
//! and events fire once the slice is accounted for. Adding an event that
//! lands inside the current slice truncates the slice so the driver yields
//! early.

/// The clockrate of the CPU is exactly 16 MHz.
pub const F_CPU: i64 = 16_000_000;

/// Maximum amount of cycles alloted to one slice.
pub const MAX_SLICE_LENGTH: i64 = 512;

pub const MAX_TIMESTAMP: i64 = i64::MAX;

pub const CPU_DOMAIN: usize = 0;
const NUM_DOMAINS: usize = 1;

/// A scheduler cycle in units of the CPU's clockrate.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, bincode::Encode, bincode::Decode)]
pub struct UnitCycle(pub i64);

/// Converts `num` ticks of a `freq`-Hz clock into unit cycles, guarding
/// against multiplication overflow by saturating at `MAX_TIMESTAMP`.
pub fn convert(freq: i64, num: i64) -> UnitCycle {
    match num.checked_mul(F_CPU) {
        Some(product) => UnitCycle(product / freq),
        None => {
            // Divide first, rounding down; saturate if even that overflows.
            UnitCycle((num / freq).saturating_mul(F_CPU).min(MAX_TIMESTAMP))
        }
    }
}

pub fn convert_cpu(cycles: i64) -> UnitCycle {
    convert(F_CPU, cycles)
}

/// Every event handler known to the machine. Handles name behavior, never
/// addresses; the emulator dispatches on this after each slice.
#[derive(Clone, Copy, PartialEq, Eq, Debug, bincode::Encode, bincode::Decode)]
pub enum EventFn {
    /// Deferred interrupt acceptance, one cycle after the INTC changed.
    CpuIrq,
    /// ITU compare-match / overflow; param is the timer index.
    ItuCompare,
    /// Serial TX shifts one bit; param is the port index.
    SciTxBit,
    /// VDP horizontal sync begins for the current line.
    VdpHsync,
    /// VDP end of line: draw, advance VCOUNT, handle VSYNC entry/exit.
    VdpLineAdvance,
    /// 100 Hz audio time-reference tick.
    SoundTimeref,
}

/// A scheduled event for a particular domain.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct Event {
    pub exec_time: i64,
    pub func: EventFn,
    pub param: u64,
    id: i64,
}

impl Event {
    fn key(&self) -> (i64, i64) {
        (self.exec_time, self.id)
    }
}

/// Identifies a scheduled event: `(event id << 8) | domain`. Invalid once
/// cancelled or constructed via `invalid()`.
#[derive(Clone, Copy, Debug, bincode::Encode, bincode::Decode)]
pub struct EventHandle(i64);

impl EventHandle {
    pub fn invalid() -> Self {
        EventHandle(-1)
    }

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }

    fn domain(&self) -> usize {
        (self.0 & 0xFF) as usize
    }

    fn ev_id(&self) -> i64 {
        self.0 >> 8
    }
}

impl Default for EventHandle {
    fn default() -> Self {
        Self::invalid()
    }
}

#[derive(bincode::Encode, bincode::Decode)]
struct Domain {
    timestamp: i64,
    next_event_id: i64,
    slice_length: i32,
    cycles_left: i32,
    in_slice: bool,
    /// Strict min-heap on (exec_time, id), kept in a Vec so that the whole
    /// scheduler state serializes with the rest of the machine.
    events: Vec<Event>,
}

impl Domain {
    fn new() -> Self {
        Self {
            timestamp: 0,
            next_event_id: 0,
            slice_length: 0,
            cycles_left: 0,
            in_slice: false,
            events: Vec::new(),
        }
    }

    /// Current time including progress through an in-flight slice.
    fn current_time(&self) -> i64 {
        let mut result = self.timestamp;
        if self.in_slice {
            result += (self.slice_length - self.cycles_left) as i64;
        }
        result
    }

    fn heap_push(&mut self, ev: Event) {
        self.events.push(ev);
        let mut i = self.events.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.events[parent].key() <= self.events[i].key() {
                break;
            }
            self.events.swap(parent, i);
            i = parent;
        }
    }

    fn heap_pop(&mut self) -> Option<Event> {
        if self.events.is_empty() {
            return None;
        }
        let last = self.events.len() - 1;
        self.events.swap(0, last);
        let ev = self.events.pop();
        self.sift_down(0);
        ev
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.events.len();
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < len && self.events[left].key() < self.events[smallest].key() {
                smallest = left;
            }
            if right < len && self.events[right].key() < self.events[smallest].key() {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.events.swap(i, smallest);
            i = smallest;
        }
    }

    fn rebuild_heap(&mut self) {
        for i in (0..self.events.len() / 2).rev() {
            self.sift_down(i);
        }
    }
}

#[derive(bincode::Encode, bincode::Decode)]
pub struct Scheduler {
    domains: Vec<Domain>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            domains: (0..NUM_DOMAINS).map(|_| Domain::new()).collect(),
        }
    }

    pub fn timestamp(&self, domain: usize) -> i64 {
        self.domains[domain].current_time()
    }

    pub fn cycles_left(&self, domain: usize) -> i32 {
        self.domains[domain].cycles_left
    }

    pub fn consume_cycles(&mut self, domain: usize, count: i32) {
        self.domains[domain].cycles_left -= count;
    }

    /// Schedules `func` to run `cycles` from now on `domain`. If the event
    /// lands inside the current slice, the slice is truncated so the driver
    /// yields before the event's exec time.
    pub fn add_event(
        &mut self,
        func: EventFn,
        cycles: UnitCycle,
        param: u64,
        domain: usize,
    ) -> EventHandle {
        let dom = &mut self.domains[domain];

        let id = dom.next_event_id;
        dom.next_event_id += 1;

        let raw_cycles = cycles.0;
        let ev = Event {
            exec_time: dom.current_time().saturating_add(raw_cycles),
            func,
            param,
            id,
        };

        if dom.in_slice && raw_cycles < dom.cycles_left as i64 {
            let raw = raw_cycles as i32;
            dom.slice_length -= dom.cycles_left - raw;
            dom.cycles_left = raw;
        }

        dom.heap_push(ev);

        EventHandle((id << 8) | domain as i64)
    }

    /// Removes the event named by `handle` and invalidates it. A handle whose
    /// event already fired matches nothing and the call is a no-op.
    pub fn cancel_event(&mut self, handle: &mut EventHandle) {
        if !handle.is_valid() {
            return;
        }

        let dom = &mut self.domains[handle.domain()];
        let id = handle.ev_id();
        if let Some(pos) = dom.events.iter().position(|ev| ev.id == id) {
            dom.events.swap_remove(pos);
            dom.rebuild_heap();
        }

        *handle = EventHandle::invalid();
    }

    /// Cycles until the next event on `domain`, capped at `MAX_SLICE_LENGTH`.
    pub fn calc_slice_length(&self, domain: usize) -> i64 {
        let dom = &self.domains[domain];

        match dom.events.first() {
            None => MAX_SLICE_LENGTH,
            Some(ev) => MAX_SLICE_LENGTH.min((ev.exec_time - dom.current_time()).max(0)),
        }
    }

    pub fn begin_slice(&mut self, domain: usize, slice: i32) {
        let dom = &mut self.domains[domain];
        dom.slice_length = slice;
        dom.cycles_left = slice;
        dom.in_slice = true;
    }

    /// Accounts the executed portion of the slice into the domain timestamp.
    pub fn end_slice(&mut self, domain: usize) {
        let dom = &mut self.domains[domain];
        let executed = dom.slice_length - dom.cycles_left;
        dom.timestamp += executed as i64;
        dom.slice_length = 0;
        dom.cycles_left = 0;
        dom.in_slice = false;
    }

    /// Pops the next due event, if any. Events are popped one at a time so a
    /// handler that schedules another due-now event sees it fire in the same
    /// batch. Returns the event and how late it fired.
    pub fn pop_due(&mut self, domain: usize) -> Option<(Event, i64)> {
        let now = self.domains[domain].current_time();
        let due = matches!(self.domains[domain].events.first(), Some(ev) if ev.exec_time <= now);
        if !due {
            return None;
        }
        let ev = self.domains[domain].heap_pop()?;
        Some((ev, now - ev.exec_time))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_zero_is_zero() {
        assert_eq!(convert(60, 0), UnitCycle(0));
        assert_eq!(convert_cpu(0), UnitCycle(0));
    }

    #[test]
    fn convert_is_identity_at_cpu_rate() {
        assert_eq!(convert_cpu(1), UnitCycle(1));
        assert_eq!(convert_cpu(12345), UnitCycle(12345));
    }

    #[test]
    fn convert_scales_by_frequency() {
        // One tick of a 60 Hz clock lasts F_CPU / 60 cycles.
        assert_eq!(convert(60, 1), UnitCycle(F_CPU / 60));
        assert_eq!(convert(100, 2), UnitCycle(2 * F_CPU / 100));
    }

    #[test]
    fn convert_is_monotonic() {
        let mut last = UnitCycle(0);
        for n in 0..1000 {
            let c = convert(263, n);
            assert!(c >= last);
            last = c;
        }
    }

    #[test]
    fn convert_saturates_on_overflow() {
        assert_eq!(convert(1, MAX_TIMESTAMP), UnitCycle(MAX_TIMESTAMP));
        assert_eq!(convert(60, MAX_TIMESTAMP), UnitCycle(MAX_TIMESTAMP));
        // The divide-first fallback stays in range without saturating.
        let near = convert(F_CPU, MAX_TIMESTAMP / F_CPU * F_CPU);
        assert!(near.0 <= MAX_TIMESTAMP);
    }

    #[test]
    fn events_fire_in_time_order_with_id_tiebreak() {
        let mut sched = Scheduler::new();
        sched.add_event(EventFn::VdpHsync, UnitCycle(10), 0, CPU_DOMAIN);
        sched.add_event(EventFn::VdpLineAdvance, UnitCycle(10), 1, CPU_DOMAIN);
        sched.add_event(EventFn::CpuIrq, UnitCycle(5), 2, CPU_DOMAIN);

        sched.begin_slice(CPU_DOMAIN, 16);
        sched.consume_cycles(CPU_DOMAIN, 16);
        sched.end_slice(CPU_DOMAIN);

        let (ev, late) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(ev.func, EventFn::CpuIrq);
        assert_eq!(late, 11);
        // Equal exec times resolve by insertion order.
        let (ev, _) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(ev.func, EventFn::VdpHsync);
        let (ev, _) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(ev.func, EventFn::VdpLineAdvance);
        assert!(sched.pop_due(CPU_DOMAIN).is_none());
    }

    #[test]
    fn adding_event_mid_slice_truncates_it() {
        let mut sched = Scheduler::new();
        sched.begin_slice(CPU_DOMAIN, 100);
        sched.consume_cycles(CPU_DOMAIN, 10);

        sched.add_event(EventFn::CpuIrq, UnitCycle(1), 0, CPU_DOMAIN);
        assert_eq!(sched.cycles_left(CPU_DOMAIN), 1);

        sched.consume_cycles(CPU_DOMAIN, 1);
        sched.end_slice(CPU_DOMAIN);
        // 10 executed + 1 after the truncation point.
        assert_eq!(sched.timestamp(CPU_DOMAIN), 11);
        let (ev, late) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(ev.func, EventFn::CpuIrq);
        assert_eq!(late, 0);
    }

    #[test]
    fn slice_length_is_bounded_by_next_event() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.calc_slice_length(CPU_DOMAIN), MAX_SLICE_LENGTH);
        sched.add_event(EventFn::VdpHsync, UnitCycle(7), 0, CPU_DOMAIN);
        assert_eq!(sched.calc_slice_length(CPU_DOMAIN), 7);
        sched.add_event(EventFn::VdpHsync, UnitCycle(5000), 0, CPU_DOMAIN);
        assert_eq!(sched.calc_slice_length(CPU_DOMAIN), 7);
    }

    #[test]
    fn cancelled_events_do_not_fire() {
        let mut sched = Scheduler::new();
        let mut keep = sched.add_event(EventFn::VdpHsync, UnitCycle(5), 0, CPU_DOMAIN);
        let mut gone = sched.add_event(EventFn::CpuIrq, UnitCycle(3), 0, CPU_DOMAIN);
        sched.cancel_event(&mut gone);
        assert!(!gone.is_valid());

        sched.begin_slice(CPU_DOMAIN, 8);
        sched.consume_cycles(CPU_DOMAIN, 8);
        sched.end_slice(CPU_DOMAIN);

        let (ev, _) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(ev.func, EventFn::VdpHsync);
        assert!(sched.pop_due(CPU_DOMAIN).is_none());

        // Cancelling after the fact is a no-op.
        sched.cancel_event(&mut keep);
    }

    #[test]
    fn events_scheduled_by_handlers_fire_same_batch() {
        let mut sched = Scheduler::new();
        sched.add_event(EventFn::ItuCompare, UnitCycle(4), 0, CPU_DOMAIN);
        sched.begin_slice(CPU_DOMAIN, 4);
        sched.consume_cycles(CPU_DOMAIN, 4);
        sched.end_slice(CPU_DOMAIN);

        let (first, _) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(first.func, EventFn::ItuCompare);
        // A handler scheduling a zero-delay follow-up still fires now.
        sched.add_event(EventFn::CpuIrq, UnitCycle(0), 0, CPU_DOMAIN);
        let (second, _) = sched.pop_due(CPU_DOMAIN).unwrap();
        assert_eq!(second.func, EventFn::CpuIrq);
    }
}
