use super::*;
use crate::bus::RAM_START;
use crate::synth::SynthShared;
use crate::timing::CPU_DOMAIN;

/// BIOS that parks the CPU on a branch-to-self at the entry point.
fn spin_bios() -> Vec<u8> {
    let mut bios = vec![0u8; 0x8000];
    bios[0x480..0x482].copy_from_slice(&0xAFFEu16.to_be_bytes()); // BRA -2
    bios[0x482..0x484].copy_from_slice(&0x0009u16.to_be_bytes()); // delay NOP
    bios
}

fn test_cart_rom() -> Vec<u8> {
    let mut rom = vec![0u8; 0x2000];
    rom[0x10..0x14].copy_from_slice(&0x0200_0000u32.to_be_bytes());
    rom[0x14..0x18].copy_from_slice(&0x0200_0FFFu32.to_be_bytes());
    rom
}

fn test_config() -> SystemConfig {
    SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: test_cart_rom(),
        ..Default::default()
    }
}

/// Writes a branch-to-self loop at `addr` so a handler visibly parks there.
fn write_spin_loop(emu: &mut Emulator, addr: u32) {
    emu.bus.write16(addr, 0xAFFE, &mut emu.sched);
    emu.bus.write16(addr + 2, 0x0009, &mut emu.sched);
}

/// Drives the machine like `run_frame`, but for a bounded cycle count.
fn run_cycles(emu: &mut Emulator, target: i64) {
    while emu.sched.timestamp(CPU_DOMAIN) < target {
        let remaining = target - emu.sched.timestamp(CPU_DOMAIN);
        let slice = emu.sched.calc_slice_length(CPU_DOMAIN).min(remaining) as i32;
        emu.sched.begin_slice(CPU_DOMAIN, slice);
        emu.cpu.run(&mut emu.bus, &mut emu.sched);
        emu.sched.end_slice(CPU_DOMAIN);

        while let Some((ev, cycles_late)) = emu.sched.pop_due(CPU_DOMAIN) {
            emu.handle_event(ev.func, ev.param, cycles_late);
        }
    }
}

#[test]
fn boots_at_the_bios_mirror() {
    let emu = Emulator::new(test_config()).unwrap();
    assert_eq!(emu.cpu.pc, INITIAL_PC + 4);
}

#[test]
fn bios_size_is_enforced() {
    let config = SystemConfig {
        bios_rom: vec![0; 0x4000],
        cart_rom: test_cart_rom(),
        ..Default::default()
    };
    assert!(matches!(
        Emulator::new(config),
        Err(SetupError::BadBiosSize(0x4000))
    ));
}

#[test]
fn truncated_cart_header_is_rejected() {
    let config = SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: vec![0; 8],
        ..Default::default()
    };
    assert!(matches!(Emulator::new(config), Err(SetupError::Cart(_))));
}

#[test]
fn run_frame_reaches_vsync_entry() {
    let mut emu = Emulator::new(test_config()).unwrap();
    emu.run_frame();

    // VCOUNT sits in the negative wrap region right after VSYNC entry.
    assert_eq!(emu.bus.vdp.vcount, (240u16.wrapping_sub(263)) & 0x1FF);
    assert!(emu.bus.vdp.frame_ended);

    // 240 visible lines were accounted for.
    let lines = emu.sched.timestamp(CPU_DOMAIN) / crate::vdp::CYCLES_PER_LINE;
    assert!((239..=241).contains(&lines), "lines {lines}");

    // The next frame wraps VCOUNT through 0x200 back to the top.
    emu.run_frame();
    assert_eq!(emu.bus.vdp.vcount, (240u16.wrapping_sub(263)) & 0x1FF);
}

#[test]
fn hsync_flag_toggles_within_a_line() {
    let mut emu = Emulator::new(test_config()).unwrap();
    // Before 75% of the first line: HSYNC clear.
    run_cycles(&mut emu, crate::vdp::HSYNC_START - 8);
    assert_eq!(emu.bus.vdp.hcount & 0x100, 0);
    // After it: set.
    run_cycles(&mut emu, crate::vdp::HSYNC_START + 8);
    assert_eq!(emu.bus.vdp.hcount & 0x100, 0x100);
    // Past the line boundary: cleared again.
    run_cycles(&mut emu, crate::vdp::CYCLES_PER_LINE + 8);
    assert_eq!(emu.bus.vdp.hcount & 0x100, 0);
}

#[test]
fn vsync_nmi_enters_the_vector_with_mask_15() {
    let mut emu = Emulator::new(test_config()).unwrap();
    let handler = RAM_START + 0x100;

    emu.cpu.vbr = RAM_START + 0x4000;
    emu.cpu.gpr[15] = RAM_START + 0x2_0000;
    let vector_addr = emu.cpu.vbr + 11 * 4;
    emu.bus.write32(vector_addr, handler, &mut emu.sched);
    write_spin_loop(&mut emu, handler);

    // NMI enable in the compare-IRQ control register.
    emu.bus.write16(0x0405_C000, 0x0002, &mut emu.sched);

    emu.run_frame();
    // The acceptance is deferred one cycle past VSYNC entry.
    let after_vsync = emu.sched.timestamp(CPU_DOMAIN) + 16;
    run_cycles(&mut emu, after_vsync);

    let fetch = emu.cpu.pc.wrapping_sub(4);
    assert!(
        fetch == handler || fetch == handler + 2,
        "pc {:08X}",
        emu.cpu.pc
    );
    assert_eq!(emu.cpu.imask(), 15);

    // The pushed return PC points back into the BIOS spin loop.
    let pushed_pc = emu.bus.read32(emu.cpu.gpr[15], &mut emu.sched);
    assert!((INITIAL_PC..INITIAL_PC + 4).contains(&pushed_pc));
    // The pushed SR still holds the pre-entry mask (0).
    let pushed_sr = emu.bus.read32(emu.cpu.gpr[15] + 4, &mut emu.sched);
    assert_eq!(pushed_sr & 0xF0, 0);
}

#[test]
fn itu_compare_interrupt_enters_its_sub_vector() {
    let mut emu = Emulator::new(test_config()).unwrap();
    let handler = RAM_START + 0x200;

    emu.cpu.vbr = RAM_START + 0x4000;
    emu.cpu.gpr[15] = RAM_START + 0x2_0000;
    // ITU0 compare-A demultiplexes to vector 80 + 0.
    emu.bus
        .write32(emu.cpu.vbr + 80 * 4, handler, &mut emu.sched);
    write_spin_loop(&mut emu, handler);

    // ITU0 priority 5.
    emu.bus.write16(0x05FF_FF88, 0x0050, &mut emu.sched);
    // Clock shift 2, GRA 0x100, compare-A interrupt, master enable.
    emu.bus.write8(0x05FF_FF04, 0x02, &mut emu.sched);
    emu.bus.write16(0x05FF_FF0A, 0x0100, &mut emu.sched);
    emu.bus.write8(0x05FF_FF06, 0x01, &mut emu.sched);
    emu.bus.write8(0x05FF_FF00, 0x01, &mut emu.sched);

    // 0x100 counts at 1/4 clock = 0x400 cycles, plus the deferred entry.
    run_cycles(&mut emu, 0x400 + 16);

    assert_eq!(emu.bus.ocpm.itu.counter(0), 0x100);
    assert_eq!(emu.bus.ocpm.itu.intr_flag(0) & 0x1, 0x1);
    let fetch = emu.cpu.pc.wrapping_sub(4);
    assert!(
        fetch == handler || fetch == handler + 2,
        "pc {:08X}",
        emu.cpu.pc
    );
    assert_eq!(emu.cpu.imask(), 5);
}

#[test]
fn serial_tx_feeds_the_midi_queue() {
    let mut emu = Emulator::new(test_config()).unwrap();
    let shared = SynthShared::new(48000.0, 2048);
    emu.bus.sound = crate::synth::SoundPort::connected(shared.clone());

    // TX enable on port 0, then one byte.
    emu.bus.write8(0x05FF_FEC2, 0x20, &mut emu.sched);
    emu.bus.write8(0x05FF_FEC3, 0xA5, &mut emu.sched);

    // 8 bits at 32 cycles each.
    run_cycles(&mut emu, 8 * 32 + 8);
    assert_eq!(shared.pop_due(i64::MAX), Some(0xA5));
    assert_eq!(shared.pop_due(i64::MAX), None);
}

#[test]
fn sound_engine_is_created_with_a_sound_rom() {
    let config = SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: test_cart_rom(),
        sound_rom: Some(vec![0; 0x1000]),
        ..Default::default()
    };
    let mut emu = Emulator::new(config).unwrap();
    assert!(emu.bus.sound.is_connected());
    let engine = emu.take_sound_engine();
    assert!(engine.is_some());
    assert!(emu.take_sound_engine().is_none());

    // The 100 Hz time reference keeps ticking with the machine.
    emu.run_frame();
}

#[test]
fn sram_round_trips_through_the_sav_file() {
    let path = std::env::temp_dir().join("loopy_test_sram.sav");
    let path_str = path.to_str().unwrap().to_string();

    let config = SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: test_cart_rom(),
        sram_file_path: Some(path_str.clone()),
        ..Default::default()
    };
    let mut emu = Emulator::new(config).unwrap();
    emu.bus.cart.sram[..4].copy_from_slice(b"SAVE");
    emu.shutdown();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), 0x1000);
    assert_eq!(&written[..4], b"SAVE");

    // Reload through the normal config path.
    let config = SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: test_cart_rom(),
        cart_sram: written,
        sram_file_path: Some(path_str),
        ..Default::default()
    };
    let emu = Emulator::new(config).unwrap();
    assert_eq!(&emu.sram()[..4], b"SAVE");

    let _ = std::fs::remove_file(path);
}

#[test]
fn save_state_round_trips_machine_state() {
    let path = std::env::temp_dir().join("loopy_test_state.bin");

    let mut emu = Emulator::new(test_config()).unwrap();
    emu.run_frame();
    emu.cpu.gpr[3] = 0x1234_5678;
    emu.bus.write16(RAM_START + 0x40, 0xBEEF, &mut emu.sched);
    emu.bus.vdp.backdrops[0] = 0x7C00;
    let vcount = emu.bus.vdp.vcount;

    emu.save_state_to_file(&path).unwrap();

    emu.cpu.gpr[3] = 0;
    emu.bus.write16(RAM_START + 0x40, 0, &mut emu.sched);
    emu.bus.vdp.backdrops[0] = 0;
    emu.run_frame();

    emu.load_state_from_file(&path).unwrap();
    assert_eq!(emu.cpu.gpr[3], 0x1234_5678);
    assert_eq!(emu.bus.read16(RAM_START + 0x40, &mut emu.sched), 0xBEEF);
    assert_eq!(emu.bus.vdp.backdrops[0], 0x7C00);
    assert_eq!(emu.bus.vdp.vcount, vcount);

    // The restored machine keeps running.
    emu.run_frame();

    let _ = std::fs::remove_file(path);
}

#[test]
fn debug_dump_carries_all_video_regions() {
    let mut emu = Emulator::new(test_config()).unwrap();
    emu.bus.vdp.bitmap[0] = 0x11;
    emu.bus.vdp.tile[0] = 0x22;

    let dump = emu.debug_dump_bytes();
    assert_eq!(&dump[..8], b"LPSTATE\0");

    // First record: bitmap VRAM at its base, width 2.
    assert_eq!(&dump[8..12], &0x0400_0000u32.to_be_bytes());
    assert_eq!(&dump[12..16], &(0x20000u32).to_be_bytes());
    assert_eq!(&dump[16..20], &2u32.to_be_bytes());
    assert_eq!(dump[20], 0x11);

    let expected = 8 + 4 * 12 + 0x20000 + 0x10000 + 0x200 + 0x200;
    assert_eq!(dump.len(), expected);
}

#[test]
fn display_output_is_a_full_frame() {
    let mut emu = Emulator::new(test_config()).unwrap();
    emu.bus.vdp.backdrops[0] = 0x03E0;
    emu.run_frame();
    let frame = emu.get_display_output();
    assert_eq!(frame.len(), 256 * 240);
    assert!(frame.iter().all(|&px| px == 0x03E0));
}

#[test]
fn key_bindings_drive_the_pad_word() {
    let mut emu = Emulator::new(test_config()).unwrap();
    emu.add_key_binding(13, PadButton::Start);
    emu.set_key_state(13, true);
    assert_eq!(
        emu.bus.pad.buttons(),
        PadButton::Presence as u16 | PadButton::Start as u16
    );
    emu.set_key_state(13, false);
    assert_eq!(emu.bus.pad.buttons(), PadButton::Presence as u16);
    // Unbound keys are ignored.
    emu.set_key_state(99, true);
    assert_eq!(emu.bus.pad.buttons(), PadButton::Presence as u16);
}

#[test]
fn periodic_sram_commit_fires_every_60_frames() {
    let path = std::env::temp_dir().join("loopy_test_sram_periodic.sav");
    let path_str = path.to_str().unwrap().to_string();
    let _ = std::fs::remove_file(&path);

    let config = SystemConfig {
        bios_rom: spin_bios(),
        cart_rom: test_cart_rom(),
        sram_file_path: Some(path_str),
        ..Default::default()
    };
    let mut emu = Emulator::new(config).unwrap();
    emu.bus.cart.sram[0] = 0x5A;

    for _ in 0..59 {
        emu.bus.cart.sram_commit_check();
    }
    assert!(!path.exists());
    emu.bus.cart.sram_commit_check();
    assert!(path.exists());

    let _ = std::fs::remove_file(path);
}
