//! State shared between the emulator thread and the host audio thread.
//!
//! MIDI bytes travel through a bounded single-producer single-consumer ring
//! of packed `(byte, timestamp)` words; the producer publishes each entry
//! with a release store on the write index and the consumer pairs it with an
//! acquire load. Control-register writes and mute go through plain atomics
//! (a value plus a generation counter), applied by the consumer at its next
//! processing boundary.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

/// Big enough retiming queue for >250ms of audio buffer. Must be a power
/// of two.
pub const MIDI_QUEUE_CAPACITY: usize = 2048;

pub struct SynthShared {
    entries: Vec<AtomicU64>,
    queue_read: AtomicUsize,
    queue_write: AtomicUsize,
    overflowed: AtomicBool,

    time_reference_samples: AtomicI64,
    has_time_reference: AtomicBool,
    out_sample_count: AtomicI64,

    control_value: AtomicU16,
    control_generation: AtomicU32,
    mute: AtomicBool,

    out_rate: f32,
    buffer_size: i64,
}

impl SynthShared {
    pub fn new(out_rate: f32, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: (0..MIDI_QUEUE_CAPACITY).map(|_| AtomicU64::new(0)).collect(),
            queue_read: AtomicUsize::new(0),
            queue_write: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
            time_reference_samples: AtomicI64::new(0),
            has_time_reference: AtomicBool::new(false),
            out_sample_count: AtomicI64::new(0),
            control_value: AtomicU16::new(0),
            control_generation: AtomicU32::new(0),
            mute: AtomicBool::new(false),
            out_rate,
            buffer_size: buffer_size as i64,
        })
    }

    pub fn out_rate(&self) -> f32 {
        self.out_rate
    }

    // Producer (emulator thread) side.

    /// Enqueues a MIDI byte stamped with the current reference time.
    /// Returns false when the ring is full; the byte is dropped and the
    /// overflow is logged once per episode.
    pub fn enqueue_midi_byte(&self, byte: u8) -> bool {
        let write = self.queue_write.load(Relaxed);
        let next = (write + 1) & (MIDI_QUEUE_CAPACITY - 1);
        if next == self.queue_read.load(Acquire) {
            if !self.overflowed.swap(true, Relaxed) {
                log::warn!(
                    "[Sound] MIDI queue overflow, increase queue capacity or \
                     send smaller groups more often"
                );
            }
            return false;
        }
        self.overflowed.store(false, Relaxed);

        let timestamp = self.time_reference_samples.load(Relaxed);
        let packed = (byte as u64) | ((timestamp as u64) << 8);
        self.entries[write].store(packed, Relaxed);
        self.queue_write.store(next, Release);
        true
    }

    /// Advances the reference clock by `delta` seconds of emulated time,
    /// then applies a hard clamp to a sane distance from the audio clock
    /// and a soft drift toward the middle of that window.
    pub fn time_reference(&self, delta: f32) {
        self.has_time_reference.store(true, Relaxed);

        let mut reference = self.time_reference_samples.load(Relaxed);
        if delta > 0.0 {
            reference += (delta * self.out_rate).floor() as i64;
        }

        let now = self.out_sample_count.load(Acquire);
        if reference < now {
            reference = now;
        } else if reference > now + 2 * self.buffer_size {
            reference = now + 2 * self.buffer_size;
        }

        // Soft correction biases the reference toward the window middle so
        // the hard limits are hit less often.
        reference += (now + self.buffer_size - reference + 32) >> 6;

        self.time_reference_samples.store(reference, Relaxed);
    }

    pub fn set_control(&self, value: u16) {
        self.control_value.store(value, Relaxed);
        self.control_generation.fetch_add(1, Release);
    }

    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Relaxed);
    }

    // Consumer (audio thread) side.

    /// Pops the head entry if its timestamp is due at `now`.
    pub fn pop_due(&self, now: i64) -> Option<u8> {
        let read = self.queue_read.load(Relaxed);
        if read == self.queue_write.load(Acquire) {
            return None;
        }
        let packed = self.entries[read].load(Relaxed);
        let timestamp = (packed >> 8) as i64;
        if self.has_time_reference.load(Relaxed) && timestamp > now {
            return None;
        }
        self.queue_read
            .store((read + 1) & (MIDI_QUEUE_CAPACITY - 1), Release);
        Some(packed as u8)
    }

    /// Returns the control value when its generation moved past `seen`.
    pub fn poll_control(&self, seen: &mut u32) -> Option<u16> {
        let generation = self.control_generation.load(Acquire);
        if generation == *seen {
            return None;
        }
        *seen = generation;
        Some(self.control_value.load(Relaxed))
    }

    pub fn muted(&self) -> bool {
        self.mute.load(Relaxed)
    }

    pub fn advance_out_samples(&self, count: i64) {
        self.out_sample_count.fetch_add(count, Release);
    }

    pub fn timestamp_now(&self) -> i64 {
        self.time_reference_samples.load(Relaxed)
    }
}

/// The bus-facing handle for the sound hardware. Absent when no sound ROM
/// is loaded (or no audio device exists); every operation then degrades to
/// a no-op and the machine keeps running silently.
#[derive(Default)]
pub struct SoundPort {
    shared: Option<Arc<SynthShared>>,
}

impl SoundPort {
    pub fn disconnected() -> Self {
        Self { shared: None }
    }

    pub fn connected(shared: Arc<SynthShared>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_some()
    }

    pub fn write_control(&self, value: u16) {
        if let Some(shared) = &self.shared {
            shared.set_control(value & 0xFFF);
        }
    }

    pub fn midi_in(&self, byte: u8) {
        if let Some(shared) = &self.shared {
            shared.enqueue_midi_byte(byte);
        }
    }

    pub fn time_reference(&self, delta: f32) {
        if let Some(shared) = &self.shared {
            shared.time_reference(delta);
        }
    }

    pub fn set_mute(&self, mute: bool) {
        if let Some(shared) = &self.shared {
            shared.set_mute(mute);
        }
    }
}

// The port never enters save states; it reconnects when the machine is
// rebuilt around a loaded state.

impl bincode::Encode for SoundPort {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        _encoder: &mut E,
    ) -> Result<(), bincode::error::EncodeError> {
        Ok(())
    }
}

impl<Context> bincode::Decode<Context> for SoundPort {
    fn decode<D: bincode::de::Decoder>(
        _decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self::disconnected())
    }
}

impl<'de, Context> bincode::BorrowDecode<'de, Context> for SoundPort {
    fn borrow_decode<D: bincode::de::BorrowDecoder<'de>>(
        _decoder: &mut D,
    ) -> Result<Self, bincode::error::DecodeError> {
        Ok(Self::disconnected())
    }
}
