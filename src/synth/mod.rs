//! uPD937-derived wavetable synthesizer and the audio output path.
//!
//! The synth core runs at its own rate (`TUNING * 192` Hz) on the host's
//! audio thread; the emulator feeds it MIDI bytes and control-register
//! writes through `SynthShared` and keeps the two clocks drift-bounded with
//! a 100 Hz time reference.

mod queue;


pub use queue::{SoundPort, SynthShared, MIDI_QUEUE_CAPACITY};

use std::sync::Arc;

pub const SOUND_CTRL_START: u32 = 0x0408_0000;
pub const SOUND_CTRL_END: u32 = 0x040A_0000;

/// Tuning of the A4 note, which fixes the internal sample rate.
/// Standard is 442 Hz (internal rate 84864 Hz).
pub const TUNING: f32 = 442.0;

/// Final mix level after the amplification circuit. Typical hardware level
/// is 0.62; 0.7 is a comfortable listening level.
pub const MIX_LEVEL: f32 = 0.7;

/// The filters approximate the hardware's resonant LPF; cutoff and
/// resonance derived from circuit analysis.
pub const FILTER_ENABLE: bool = true;
pub const FILTER_CUTOFF: f32 = 8247.0;
pub const FILTER_RESONANCE: f32 = 1.67;

pub const TARGET_SAMPLE_RATE: u32 = 48000;
pub const TARGET_BUFFER_SIZE: usize = 2048;

/// Time reference to smooth out audio timing at larger buffer sizes.
pub const TIMEREF_FREQUENCY: i64 = 100;

/// Fade time in milliseconds when the output is muted.
pub const MUTE_FADE_MS: f32 = 20.0;

// Fixed table offsets in the sound ROM.
const HC_RATETABLE: usize = 0x1000;
const HC_VOLTABLE: usize = 0x1400;
const HC_PITCHTABLE: usize = 0x1600;
const HC_INSTDESC: usize = 0x2200;
const HC_KEYMAPS: usize = 0x3DA0;
const HC_NUM_BANKS: i32 = 1;

// Pitch envelopes update at MIDICLK(4M)/32768 instead of the main clock,
// approximated from the sample rate with a rational counter.
const CLK2_MUL: i32 = 15625;
const CLK2_DIVP: i32 = 128;

/// Volume sliders arbitrarily scaled to 4096. Values for 0,2,3,4
/// approximated, 1 guessed.
const VOLUME_SLIDER_LEVELS: [i32; 5] = [0, 2048, 2580, 3251, 4096];

#[derive(Clone, Copy, Default)]
struct VoiceState {
    channel: usize,
    note: i32,
    active: bool,
    sustained: bool,
    pitch: i32,
    volume: i32,
    volume_target: i32,
    volume_rate_mul: i32,
    volume_rate_div: i32,
    volume_rate_counter: i32,
    volume_down: bool,
    volume_env: i32,
    volume_env_step: i32,
    volume_env_delay: i32,
    pitch_env: i32,
    pitch_env_step: i32,
    pitch_env_delay: i32,
    pitch_env_value: i32,
    pitch_env_rate: i32,
    pitch_env_target: i32,
    sample_start: i32,
    sample_end: i32,
    sample_loop: i32,
    sample_ptr: i32,
    sample_fract: i32,
    sample_last_val: i32,
}

#[derive(Clone, Copy, Default)]
struct ChannelState {
    midi_enabled: bool,
    mute: bool,
    first_voice: usize,
    voice_count: usize,
    sustain: bool,
    instrument: i32,
    partials_offset: i32,
    keymap_no: i32,
    layered: bool,
    bend_offset: i32,
    bend_value: i32,
    allocate_next: usize,
}

/// The synth core proper: 32 voices over 4 channels, envelope engines and
/// the MIDI status parser. Everything here runs on the audio thread.
pub struct Upd937 {
    rom: Vec<u8>,
    rom_mask: usize,

    ptr_partials: usize,
    ptr_pitchenv: usize,
    ptr_volenv: usize,
    ptr_sampdesc: usize,
    #[allow(dead_code)]
    ptr_demosong: usize,

    voices: [VoiceState; 32],
    channels: [ChannelState; 4],
    volume_slider: [usize; 2],

    clk2_counter: i32,
    delay_update_phase: i32,
    sample_count: u32,

    synthesis_rate: f32,

    midi_status: i32,
    midi_running_status: i32,
    midi_param_bytes: [u8; 8],
    midi_param_count: usize,
    midi_in_sysex: bool,
}

impl Upd937 {
    pub fn new(rom_in: Vec<u8>, synthesis_rate: f32) -> Self {
        // Pad the ROM to a power of 2.
        let mut rom_size = 1;
        while rom_size < rom_in.len() {
            rom_size <<= 1;
        }
        let mut rom = rom_in;
        rom.resize(rom_size, 0);

        let mut synth = Self {
            rom_mask: rom_size - 1,
            rom,
            ptr_partials: 0,
            ptr_pitchenv: 0,
            ptr_volenv: 0,
            ptr_sampdesc: 0,
            ptr_demosong: 0,
            voices: [VoiceState::default(); 32],
            channels: [ChannelState::default(); 4],
            volume_slider: [4; 2],
            clk2_counter: 0,
            delay_update_phase: 0,
            sample_count: 0,
            synthesis_rate,
            midi_status: 0,
            midi_running_status: 0,
            midi_param_bytes: [0; 8],
            midi_param_count: 0,
            midi_in_sysex: false,
        };

        synth.ptr_partials = synth.read_rom_16(0) as usize * 32;
        synth.ptr_pitchenv = synth.read_rom_16(2) as usize * 32;
        synth.ptr_volenv = synth.read_rom_16(4) as usize * 32;
        synth.ptr_sampdesc = synth.read_rom_16(6) as usize * 32;
        synth.ptr_demosong = synth.read_rom_16(8) as usize * 32;

        for c in 0..4 {
            synth.prog_chg(c, 0);
        }
        synth.set_channel_configuration(false, false);

        synth
    }

    fn read_rom_8(&self, offset: usize) -> i32 {
        self.rom[offset & self.rom_mask] as i32
    }

    fn read_rom_16(&self, offset: usize) -> i32 {
        ((self.rom[(offset + 1) & self.rom_mask] as i32) << 8)
            | self.rom[offset & self.rom_mask] as i32
    }

    fn read_rom_24(&self, offset: usize) -> i32 {
        ((self.rom[(offset + 2) & self.rom_mask] as i32) << 16)
            | ((self.rom[(offset + 1) & self.rom_mask] as i32) << 8)
            | self.rom[offset & self.rom_mask] as i32
    }

    /// One stereo sample. Even voices mix left, odd voices right; channels
    /// above 0 scale by the selected volume-slider coefficient.
    pub fn gen_sample(&mut self) -> [i32; 2] {
        self.update_sample();

        let mut out = [0i32; 2];
        for (lr, slot) in out.iter_mut().enumerate() {
            let mut accum = 0i32;
            for v in (0..32).step_by(2) {
                let vo = &self.voices[v + lr];
                let ch = &self.channels[vo.channel];
                if vo.volume == 0 || ch.mute {
                    continue;
                }

                let mut s = vo.sample_last_val;
                let sb = (self.read_rom_16(vo.sample_ptr as usize * 2) >> 4) - 0x800;
                let sd = ((sb - s) * vo.sample_fract) / 0x8000;
                s += sd;
                s = (s * vo.volume) / 65536;
                if vo.channel > 0 {
                    let group = if vo.channel == 3 { 1 } else { 0 };
                    s = (s * VOLUME_SLIDER_LEVELS[self.volume_slider[group]]) / 4096;
                }
                accum += s;
            }
            *slot = accum.clamp(-32767, 32767);
        }
        out
    }

    pub fn set_channel_configuration(&mut self, multi: bool, all: bool) {
        if multi {
            self.channels[0].first_voice = 0;
            self.channels[0].voice_count = 2 * 6;
            self.channels[1].first_voice = 2 * 6;
            self.channels[1].voice_count = 2 * 4;
            self.channels[2].first_voice = 2 * 10;
            self.channels[2].voice_count = 2 * 2;
            self.channels[3].first_voice = 2 * 12;
            self.channels[3].voice_count = 2 * 4;
            self.channels[0].midi_enabled = true;
            self.channels[1].midi_enabled = true;
            self.channels[2].midi_enabled = true;
            self.channels[3].midi_enabled = all;
        } else {
            self.channels[0].first_voice = 0;
            self.channels[0].voice_count = 2 * 12;
            self.channels[0].midi_enabled = true;
            for c in 1..4 {
                self.channels[c].midi_enabled = false;
                self.channels[c].voice_count = 0;
            }
        }

        for voice in self.voices.iter_mut() {
            voice.channel = 0;
        }
        for c in 1..4 {
            for v in 0..self.channels[c].voice_count {
                self.voices[self.channels[c].first_voice + v].channel = c;
            }
        }
    }

    pub fn set_volume_slider(&mut self, group: usize, slider: usize) {
        self.volume_slider[group.min(1)] = slider.min(4);
    }

    pub fn set_channel_muted(&mut self, channel: usize, mute: bool) {
        self.channels[channel].mute = mute;
    }

    pub fn reset_channels(&mut self, clear_program: bool) {
        let p = if clear_program { 0 } else { 128 };
        for c in 0..4 {
            self.prog_chg(c, p);
        }
    }

    /// Status-byte MIDI parser with running status and SysEx bracketing.
    pub fn process_midi_now(&mut self, midi_byte: u8) {
        let m = midi_byte as i32;
        if m >= 0x80 {
            if m == 0xF0 && !self.midi_in_sysex {
                self.midi_in_sysex = true;
            }
            if m == 0xF7 && self.midi_in_sysex {
                self.midi_in_sysex = false;
            }
            if m < 0xF8 {
                self.midi_status = m;
                self.midi_running_status = if m < 0xF0 { m } else { 0 };
                self.midi_param_count = 0;
            }
            return;
        }

        if self.midi_param_count >= self.midi_param_bytes.len() || self.midi_status == 0 {
            return;
        }
        self.midi_param_bytes[self.midi_param_count] = (m & 0x7F) as u8;
        self.midi_param_count += 1;
        if self.midi_in_sysex {
            return;
        }

        let status_hi = self.midi_status >> 4;
        if status_hi == 0xF {
            return;
        }

        let channel = (self.midi_status & 0x0F) as usize;
        let message_size = if status_hi == 0xC || status_hi == 0xD {
            1
        } else {
            2
        };
        if self.midi_param_count < message_size {
            return;
        }

        if channel < 4 && self.channels[channel].midi_enabled {
            let p0 = self.midi_param_bytes[0] as i32;
            let p1 = self.midi_param_bytes[1] as i32;
            match status_hi {
                0x8 => self.note_off(channel, p0),
                0x9 => {
                    if p1 > 0 {
                        self.note_on(channel, p0);
                    } else {
                        self.note_off(channel, p0);
                    }
                }
                0xB => {
                    if p0 == 0x40 {
                        self.control_chg_sustain(channel, p1 >= 0x40);
                    } else {
                        log::debug!("[Sound] unhandled CONTROL CHANGE {p0:02X} {p1:02X}");
                    }
                }
                0xC => self.prog_chg(channel, p0),
                0xE => self.pitch_bend(channel, (p1 << 1) | (p1 >> 6)),
                other => log::debug!("[Sound] unhandled message type {other:X}"),
            }
        }
        self.midi_param_count = 0;
        self.midi_status = self.midi_running_status;
    }

    fn update_sample(&mut self) {
        // Clock the volume & pitch envelope generators.
        if self.sample_count % 384 == 0 {
            self.update_volume_envelopes();
        }
        let clk2_div = (CLK2_DIVP as f32 * self.synthesis_rate).round() as i32;
        self.clk2_counter += CLK2_MUL;
        if self.clk2_counter >= clk2_div {
            self.update_pitch_envelopes();
            self.clk2_counter -= clk2_div;
        }

        // Update volume/pitch ramps.
        for v in 0..32 {
            {
                let vo = &mut self.voices[v];
                vo.volume_rate_counter += 1;
                if vo.volume_rate_counter >= vo.volume_rate_div {
                    vo.volume_rate_counter = 0;
                    if vo.volume_down {
                        vo.volume =
                            vo.volume_target.max(vo.volume - vo.volume_rate_mul).clamp(0, 65535);
                    } else {
                        vo.volume =
                            vo.volume_target.min(vo.volume + vo.volume_rate_mul).clamp(0, 65535);
                    }
                }
            }

            if self.voices[v].volume > 0 {
                let pitch_relative = {
                    let vo = &self.voices[v];
                    vo.pitch + vo.pitch_env_value / 16 + self.channels[vo.channel].bend_offset
                };
                let step =
                    self.read_rom_16((HC_PITCHTABLE as i32 + pitch_relative * 2) as usize);
                self.voices[v].sample_fract += step;
                if self.voices[v].sample_fract >= 0x8000 {
                    self.voices[v].sample_fract -= 0x8000;
                    let last =
                        (self.read_rom_16(self.voices[v].sample_ptr as usize * 2) >> 4) - 0x800;
                    self.voices[v].sample_last_val = last;
                    self.voices[v].sample_ptr += 1;
                }
                if self.voices[v].sample_ptr > self.voices[v].sample_end {
                    self.voices[v].sample_ptr = self.voices[v].sample_loop;
                }
            }
        }

        self.sample_count = self.sample_count.wrapping_add(1);
    }

    fn update_volume_envelopes(&mut self) {
        self.delay_update_phase = (self.delay_update_phase + 1) & 1;
        for v in 0..32 {
            let mut changed = false;
            {
                let vo = &mut self.voices[v];
                if vo.volume_env_delay > 0 {
                    if self.delay_update_phase == 0 {
                        vo.volume_env_delay -= 1;
                    }
                    if vo.volume_env_delay > 0 {
                        continue;
                    } else if vo.active {
                        changed = true;
                    }
                }
                if vo.volume_env_step < 16 && vo.volume > 0 && !vo.active {
                    // Key released: enter the release phase at the same step.
                    vo.volume_env_step |= 16;
                    changed = true;
                } else if (vo.volume <= vo.volume_target && vo.volume_down)
                    || (vo.volume >= vo.volume_target && !vo.volume_down)
                {
                    // Reached the target; advance unless the envelope ended.
                    if vo.volume_target > 0 && vo.volume_rate_mul != 0 {
                        // Wrap after 16 steps, stay in the same phase.
                        vo.volume_env_step =
                            ((vo.volume_env_step + 1) & 15) + (vo.volume_env_step & 16);
                        changed = true;
                    }
                }
            }

            let mut already_reset = false;
            while changed {
                changed = false;
                let env_base =
                    self.ptr_volenv + self.voices[v].volume_env as usize * 64
                        + self.voices[v].volume_env_step as usize * 2;
                let mut env_rate = self.read_rom_8(env_base);
                let env_target = self.read_rom_8(env_base + 1);
                let env_down = env_rate >= 128;
                env_rate &= 127;
                let env_volume_target = self.read_rom_16(HC_VOLTABLE + env_target as usize * 2);
                let rate_index = (env_rate as usize * 2) + 2;
                let rate_mul = self.read_rom_16(HC_RATETABLE + rate_index * 4);
                let rate_div = self.read_rom_8(HC_RATETABLE + rate_index * 4 + 2) + 1;

                let vo = &mut self.voices[v];
                vo.volume_down = env_down;
                if env_rate == 127 {
                    // Instant apply.
                    vo.volume_rate_mul = 0xFFFF;
                    vo.volume_rate_div = 1;
                } else if env_rate == 0 && env_down {
                    // Hold condition.
                    vo.volume_rate_mul = 0;
                    vo.volume_rate_div = 1;
                } else if env_volume_target == 0 && !env_down && !already_reset {
                    // The real firmware loops forever on an invalid first
                    // step; some envelopes use "00 00" intentionally as a
                    // loop, so reset once per pass instead.
                    vo.volume_env_step &= 16;
                    already_reset = true;
                    changed = true;
                } else {
                    vo.volume_rate_mul = rate_mul;
                    vo.volume_rate_div = rate_div;
                }
                vo.volume_target = env_volume_target;
            }
        }
    }

    fn update_pitch_envelopes(&mut self) {
        for v in 0..32 {
            if self.voices[v].volume == 0 {
                continue;
            }
            let mut changed = false;
            {
                let vo = &mut self.voices[v];
                if vo.pitch_env_delay > 0 {
                    vo.pitch_env_delay -= 1;
                    if vo.pitch_env_delay > 0 {
                        continue;
                    }
                    changed = true;
                }

                if vo.pitch_env_rate != 0 {
                    vo.pitch_env_value += vo.pitch_env_rate;
                    let reached_target = if vo.pitch_env_rate > 0 {
                        vo.pitch_env_value >= vo.pitch_env_target
                    } else {
                        vo.pitch_env_value <= vo.pitch_env_target
                    };
                    if reached_target {
                        vo.pitch_env_value = vo.pitch_env_target;
                        vo.pitch_env_step += 1;
                        if vo.pitch_env_step >= 8 {
                            vo.pitch_env_step = 1;
                        }
                        changed = true;
                    }
                }
            }

            let mut already_looped = false;
            while changed && self.voices[v].pitch_env_step < 8 {
                changed = false;
                let env_base = self.ptr_pitchenv
                    + self.voices[v].pitch_env as usize * 32
                    + self.voices[v].pitch_env_step as usize * 4;
                let mut env_rate = self.read_rom_16(env_base);
                let env_target = self.read_rom_16(env_base + 2);
                let loop_flag = env_rate & 0x2000 != 0;
                let env_down = env_rate & 0x1000 != 0;
                env_rate &= 0xFFF;

                let vo = &mut self.voices[v];
                if loop_flag {
                    vo.pitch_env_step = env_rate & 7;
                    changed = !already_looped;
                    already_looped = true;
                } else {
                    vo.pitch_env_rate = env_rate * if env_down { -1 } else { 1 };
                    vo.pitch_env_target += env_target * if env_down { -16 } else { 16 };
                }
            }
        }
    }

    /// Round-robin allocation within the channel's voice range.
    fn get_free_voice(&mut self, c: usize) -> usize {
        let ch = &mut self.channels[c];

        let mut ret = ch.first_voice + ch.allocate_next;
        for _ in 0..ch.voice_count {
            if !self.voices[ret].active {
                break;
            }
            ch.allocate_next += 1;
            if ch.allocate_next >= ch.voice_count {
                ch.allocate_next = 0;
            }
            ret = ch.first_voice + ch.allocate_next;
        }

        ch.allocate_next += 1;
        if ch.allocate_next >= ch.voice_count {
            ch.allocate_next = 0;
        }

        ret
    }

    fn note_on(&mut self, channel: usize, note: i32) {
        let note = note & 127;
        let mut note_ranged = note;
        while note_ranged < 36 {
            note_ranged += 12;
        }
        while note_ranged > 96 {
            note_ranged -= 12;
        }

        let ch = self.channels[channel];
        let voices_per_note = if ch.layered { 4 } else { 2 };

        // Keymap selects the partial group for this key range.
        let keymap_byte = ((note_ranged - 36) / 2) as usize;
        let keymap_shift = ((note_ranged - 36) & 1) * 4;
        let keymap_val =
            (self.read_rom_8(HC_KEYMAPS + ch.keymap_no as usize * 32 + keymap_byte)
                >> keymap_shift)
                & 0xF;

        let mut partial_addr =
            ((ch.partials_offset + keymap_val * voices_per_note * 3) * 2) as usize;

        for _ in 0..voices_per_note {
            let index = self.get_free_voice(channel);

            let pitch_env = self.read_rom_16(self.ptr_partials + partial_addr);
            let volume_env = self.read_rom_16(self.ptr_partials + partial_addr + 2);
            let sample_descriptor =
                self.read_rom_16(self.ptr_partials + partial_addr + 4) as usize;

            let sample_start = self.read_rom_24(self.ptr_sampdesc + sample_descriptor * 10 + 1);
            let sample_end = self.read_rom_24(self.ptr_sampdesc + sample_descriptor * 10 + 4);
            let sample_loop = self.read_rom_24(self.ptr_sampdesc + sample_descriptor * 10 + 7);
            let sample_note = self.read_rom_8(self.ptr_sampdesc + sample_descriptor * 10);

            // First step of the volume envelope: a zero target is a delay
            // step, anything else programs the first ramp.
            let env_rate_raw = self.read_rom_8(self.ptr_volenv + volume_env as usize * 64);
            let env_target = self.read_rom_8(self.ptr_volenv + volume_env as usize * 64 + 1);

            // Pitch envelope initial value and delay.
            let pitch_initial_raw = self.read_rom_16(self.ptr_pitchenv + pitch_env as usize * 32);
            let pitch_initial = (pitch_initial_raw & 0xFFF)
                * if pitch_initial_raw >= 0x1000 { -1 } else { 1 };
            let pitch_delay =
                self.read_rom_16(self.ptr_pitchenv + pitch_env as usize * 32 + 2) + 1;

            let volume_target = self.read_rom_16(HC_VOLTABLE + env_target as usize * 2);
            let rate_index = ((env_rate_raw & 127) as usize * 2) + 2;
            let rate_mul = self.read_rom_16(HC_RATETABLE + rate_index * 4);
            let rate_div = self.read_rom_8(HC_RATETABLE + rate_index * 4 + 2) + 1;

            let vo = &mut self.voices[index];
            vo.pitch_env = pitch_env;
            vo.volume_env = volume_env;
            vo.sample_start = sample_start;
            vo.sample_end = sample_end;
            vo.sample_loop = sample_loop;
            vo.sample_ptr = sample_start;
            vo.sample_fract = 0;
            vo.sample_last_val = 0;

            vo.note = note;
            if sample_note > 0 {
                vo.pitch = (note_ranged - sample_note) * 32;
            } else {
                // Default for unpitched notes.
                vo.pitch = 0x200;
            }

            vo.volume = 0;
            vo.volume_target = 0;
            vo.volume_rate_mul = 0;
            vo.volume_rate_div = 1;
            vo.volume_rate_counter = 0;
            vo.volume_down = false;
            vo.volume_env_delay = 0;
            vo.volume_env_step = 0;

            if env_target == 0 {
                // Delay step.
                vo.volume_env_delay = env_rate_raw + 1;
                vo.volume_env_step = 1;
            } else {
                vo.volume_down = env_rate_raw >= 128;
                vo.volume_target = volume_target;
                if env_rate_raw & 127 == 127 {
                    vo.volume_rate_mul = 0xFFFF;
                    vo.volume_rate_div = 1;
                } else {
                    vo.volume_rate_mul = rate_mul;
                    vo.volume_rate_div = rate_div;
                }
            }

            vo.pitch_env_value = pitch_initial * 16;
            vo.pitch_env_target = pitch_initial * 16;
            vo.pitch_env_rate = 0;
            vo.pitch_env_delay = pitch_delay;
            vo.pitch_env_step = 1;

            vo.active = true;
            vo.sustained = false;

            partial_addr += 6;
        }
    }

    fn note_off(&mut self, channel: usize, note: i32) {
        let note = note & 127;
        let ch = self.channels[channel];
        let voices_per_note = if ch.layered { 4 } else { 2 };

        let mut v = ch.first_voice;
        while v < ch.first_voice + ch.voice_count {
            let vo = &self.voices[v];
            if vo.note == note && vo.active && !vo.sustained {
                for i in 0..voices_per_note {
                    if ch.sustain {
                        self.voices[v + i].sustained = true;
                    } else {
                        self.voices[v + i].active = false;
                    }
                }
                break;
            }
            v += voices_per_note;
        }
    }

    fn prog_chg(&mut self, channel: usize, prog: i32) {
        let ch = self.channels[channel];
        // Silence the channel's notes by decaying over a 512 sample period.
        for v in ch.first_voice..ch.first_voice + ch.voice_count {
            let vo = &mut self.voices[v];
            vo.active = false;
            vo.sustained = false;
            vo.volume_rate_mul = (vo.volume + 511) / 512;
            vo.volume_rate_div = 1;
            vo.volume_target = 0;
            vo.volume_down = true;
            // Park the envelope in the release phase.
            vo.volume_env_step = 16;
        }
        self.channels[channel].allocate_next = 0;

        // Validate the new program only after silencing.
        if !(0..=109).contains(&prog) {
            return;
        }
        let prog = Self::midi_prog_to_bank(prog, 0);

        let partials_offset = self.read_rom_16(HC_INSTDESC + prog as usize * 4);
        let keymap_no = self.read_rom_8(HC_INSTDESC + prog as usize * 4 + 2);
        let flags = self.read_rom_8(HC_INSTDESC + prog as usize * 4 + 3);

        let ch = &mut self.channels[channel];
        ch.instrument = prog;
        ch.partials_offset = partials_offset;
        ch.keymap_no = keymap_no;
        ch.layered = flags & 0x10 != 0;
    }

    fn pitch_bend(&mut self, channel: usize, bend_byte: i32) {
        let bend_offset = self.read_rom_8(HC_RATETABLE + bend_byte as usize * 4 + 3) - 128;
        let ch = &mut self.channels[channel];
        ch.bend_value = bend_byte - 128;
        ch.bend_offset = bend_offset;
    }

    fn control_chg_sustain(&mut self, channel: usize, sustain: bool) {
        self.channels[channel].sustain = sustain;
        if !sustain {
            let ch = self.channels[channel];
            for i in ch.first_voice..ch.first_voice + ch.voice_count {
                if self.voices[i].sustained {
                    self.voices[i].sustained = false;
                    self.voices[i].active = false;
                }
            }
        }
    }

    fn midi_prog_to_bank(prog: i32, bank_select: i32) -> i32 {
        if prog < 10 {
            return prog + bank_select * 10;
        }
        prog - 10 + bank_select * 100 + HC_NUM_BANKS * 10
    }
}

/// RBJ-style second-order filter shared by the tone LPF and the DC-blocking
/// HPF, processing both channels with one set of coefficients.
pub struct BiquadStereoFilter {
    fs: f32,
    fc: f32,
    q: f32,
    hp: bool,
    a1: f32,
    a2: f32,
    b0: f32,
    b1: f32,
    b2: f32,
    x1: [f32; 2],
    x2: [f32; 2],
    y1: [f32; 2],
    y2: [f32; 2],
}

impl BiquadStereoFilter {
    pub fn new(fs: f32, fc: f32, q: f32, hp: bool) -> Self {
        let mut filter = Self {
            fs,
            fc,
            q,
            hp,
            a1: 0.0,
            a2: 0.0,
            b0: 0.0,
            b1: 0.0,
            b2: 0.0,
            x1: [0.0; 2],
            x2: [0.0; 2],
            y1: [0.0; 2],
            y2: [0.0; 2],
        };
        filter.update_coefficients();
        filter
    }

    pub fn reset(&mut self) {
        self.x1 = [0.0; 2];
        self.x2 = [0.0; 2];
        self.y1 = [0.0; 2];
        self.y2 = [0.0; 2];
    }

    pub fn process(&mut self, sample: &mut [f32; 2]) {
        for c in 0..2 {
            let x0 = sample[c];
            let y0 = self.b0 * x0 + self.b1 * self.x1[c] + self.b2 * self.x2[c]
                - self.a1 * self.y1[c]
                - self.a2 * self.y2[c];
            self.x2[c] = self.x1[c];
            self.x1[c] = x0;
            self.y2[c] = self.y1[c];
            self.y1[c] = y0;
            sample[c] = y0;
        }
    }

    fn update_coefficients(&mut self) {
        let k = (std::f32::consts::PI * self.fc / self.fs).tan();
        let w = k * k;
        let alpha = 1.0 + (k / self.q) + w;
        self.a1 = 2.0 * (w - 1.0) / alpha;
        self.a2 = (1.0 - (k / self.q) + w) / alpha;
        if self.hp {
            self.b0 = 1.0 / alpha;
            self.b2 = self.b0;
            self.b1 = -2.0 * self.b0;
        } else {
            self.b0 = w / alpha;
            self.b2 = self.b0;
            self.b1 = 2.0 * self.b0;
        }
    }
}

/// The audio-thread half of the sound system: synth core, EQ chain,
/// resampler, control-register state machine and the retiming consumer.
/// Hand this to the host's audio callback and call `fill_buffer`.
pub struct SoundEngine {
    shared: Arc<SynthShared>,
    synth: Upd937,
    filter_tone: Option<BiquadStereoFilter>,
    filter_block_dc: Option<BiquadStereoFilter>,

    mix_level: f32,
    out_rate: f32,
    synth_rate: f32,

    current_sample: [f32; 2],
    last_sample: [f32; 2],
    interpolation_step: f32,

    out_sample_count: i64,

    buttons_last: u16,
    channel_config_state: u8,
    in_demo: bool,
    control_seen: u32,

    volume_level: f32,
}

impl SoundEngine {
    pub fn new(rom: Vec<u8>, out_rate: f32, buffer_size: usize) -> (Self, Arc<SynthShared>) {
        let synth_rate = TUNING * 192.0;
        log::info!(
            "[Sound] Init uPD937 core: synth rate {synth_rate:.1}, out rate {out_rate:.1}, \
             buffer size {buffer_size}"
        );
        let shared = SynthShared::new(out_rate, buffer_size);
        let engine = Self {
            shared: shared.clone(),
            synth: Upd937::new(rom, synth_rate),
            filter_tone: FILTER_ENABLE
                .then(|| BiquadStereoFilter::new(synth_rate, FILTER_CUTOFF, FILTER_RESONANCE, false)),
            filter_block_dc: FILTER_ENABLE
                .then(|| BiquadStereoFilter::new(out_rate, 20.0, 0.7, true)),
            mix_level: MIX_LEVEL,
            out_rate,
            synth_rate,
            current_sample: [0.0; 2],
            last_sample: [0.0; 2],
            interpolation_step: 0.0,
            out_sample_count: 0,
            buttons_last: 0,
            channel_config_state: 0,
            in_demo: false,
            control_seen: 0,
            volume_level: 1.0,
        };
        (engine, shared)
    }

    /// One stereo frame at the output rate: drain retimed MIDI every 64
    /// samples, pull synth samples through the tone filter as the phase
    /// accumulator crosses 1, then resample, amplify and DC-block.
    pub fn gen_sample(&mut self, out: &mut [f32; 2]) {
        if self.out_sample_count & 63 == 0 {
            self.handle_midi_event();
        }

        self.interpolation_step += self.synth_rate / self.out_rate;
        while self.interpolation_step >= 1.0 {
            self.last_sample = self.current_sample;
            let raw = self.synth.gen_sample();
            self.current_sample[0] = raw[0] as f32 / 32768.0;
            self.current_sample[1] = raw[1] as f32 / 32768.0;
            if let Some(filter) = &mut self.filter_tone {
                filter.process(&mut self.current_sample);
            }
            self.interpolation_step -= 1.0;
        }

        let mut mix = [0.0f32; 2];
        for c in 0..2 {
            mix[c] = (self.last_sample[c]
                + (self.current_sample[c] - self.last_sample[c]) * self.interpolation_step)
                * 6.8
                * self.mix_level;
        }
        if let Some(filter) = &mut self.filter_block_dc {
            filter.process(&mut mix);
        }

        out[0] = mix[0].clamp(-1.0, 1.0);
        out[1] = mix[1].clamp(-1.0, 1.0);
        self.out_sample_count += 1;
        self.shared.advance_out_samples(1);
    }

    /// Fills an interleaved stereo buffer, applying the mute ramp per frame.
    /// This is the host audio callback's entry point.
    pub fn fill_buffer(&mut self, buffer: &mut [f32]) {
        let mut tmp = [0.0f32; 2];
        for frame in buffer.chunks_exact_mut(2) {
            self.update_volume_level();
            self.gen_sample(&mut tmp);
            frame[0] = tmp[0] * self.volume_level;
            frame[1] = tmp[1] * self.volume_level;
        }
    }

    pub fn synth(&mut self) -> &mut Upd937 {
        &mut self.synth
    }

    fn update_volume_level(&mut self) {
        let mut delta = 1000.0 / (self.out_rate * MUTE_FADE_MS);
        if self.shared.muted() {
            delta = -delta;
        }
        self.volume_level = (self.volume_level + delta).clamp(0.0, 1.0);
    }

    fn handle_midi_event(&mut self) {
        if let Some(creg) = self.shared.poll_control(&mut self.control_seen) {
            self.apply_control(creg);
        }

        while let Some(byte) = self.shared.pop_due(self.out_sample_count) {
            // MIDI is ignored in demo and keyboard modes.
            if self.in_demo || self.channel_config_state == 0 {
                continue;
            }
            self.synth.process_midi_now(byte);
        }
    }

    /// Sound control register: bits 0-5 are one-shot buttons (DEMO, CH3,
    /// EXT, CH4, ON, MIDI), bits 6-8 / 9-11 the two one-hot volume-slider
    /// groups selecting levels 2..4.
    fn apply_control(&mut self, creg: u16) {
        let creg = creg & 0xFFF;

        let vol_sw_0 = (creg >> 6) & 7;
        let vol_sw_1 = (creg >> 9) & 7;
        if vol_sw_0 & 1 != 0 {
            self.synth.set_volume_slider(0, 2);
        } else if vol_sw_0 & 2 != 0 {
            self.synth.set_volume_slider(0, 3);
        } else if vol_sw_0 & 4 != 0 {
            self.synth.set_volume_slider(0, 4);
        }
        if vol_sw_1 & 1 != 0 {
            self.synth.set_volume_slider(1, 2);
        } else if vol_sw_1 & 2 != 0 {
            self.synth.set_volume_slider(1, 3);
        } else if vol_sw_1 & 4 != 0 {
            self.synth.set_volume_slider(1, 4);
        }

        let buttons = creg & 63;
        let buttons_pushed = buttons & !self.buttons_last;
        self.buttons_last = buttons;

        if buttons_pushed & 16 != 0 {
            // ON
            self.channel_config_state = 0;
            self.synth.set_channel_configuration(false, false);
            self.synth.reset_channels(true);
        }
        if buttons_pushed & 1 != 0 {
            // DEMO: silence the channels while toggled on.
            self.in_demo = !self.in_demo;
            if self.in_demo {
                self.synth.reset_channels(false);
            }
        }
        if buttons_pushed & 32 != 0 && self.channel_config_state == 0 {
            // MIDI
            self.channel_config_state = 1;
            self.synth.set_channel_configuration(false, false);
            self.synth.reset_channels(true);
        }
        if buttons_pushed & 8 != 0 {
            // EXT: rhythm paths are not implemented.
        }
        if buttons_pushed & 4 != 0 && matches!(self.channel_config_state, 1 | 3) {
            // CH4
            self.synth.set_channel_configuration(true, true);
            self.synth.reset_channels(false);
            self.channel_config_state = 4;
        }
        if buttons_pushed & 2 != 0 && self.channel_config_state == 1 {
            // CH3
            self.synth.set_channel_configuration(true, false);
            self.synth.reset_channels(false);
            self.channel_config_state = 3;
        }
    }
}
