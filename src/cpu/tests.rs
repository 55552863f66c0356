use super::*;
use crate::bus::Bus;
use crate::cart::Cart;
use crate::timing::{Scheduler, CPU_DOMAIN};

const BASE: u32 = 0x0100_0000;

fn test_cart() -> Cart {
    let mut rom = vec![0u8; 0x1000];
    rom[0x10..0x14].copy_from_slice(&0x0200_0000u32.to_be_bytes());
    rom[0x14..0x18].copy_from_slice(&0x0200_1FFFu32.to_be_bytes());
    Cart::new(rom, Vec::new(), None).unwrap()
}

/// Loads a program into main RAM and points the CPU at it.
fn machine(program: &[u16]) -> (Cpu, Bus, Scheduler) {
    let mut bus = Bus::new(vec![0; 0x8000], test_cart());
    let mut sched = Scheduler::new();
    for (i, word) in program.iter().enumerate() {
        bus.write16(BASE + i as u32 * 2, *word, &mut sched);
    }
    let mut cpu = Cpu::new();
    cpu.set_pc(BASE);
    cpu.gpr[15] = 0x0107_0000;
    (cpu, bus, sched)
}

fn step(cpu: &mut Cpu, bus: &mut Bus, sched: &mut Scheduler, cycles: i32) {
    sched.begin_slice(CPU_DOMAIN, cycles);
    cpu.run(bus, sched);
    sched.end_slice(CPU_DOMAIN);
}

#[test]
fn mov_imm_sign_extends() {
    let (mut cpu, mut bus, mut sched) = machine(&[0xE0FF, 0xE17F]);
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[0], 0xFFFF_FFFF);
    assert_eq!(cpu.gpr[1], 0x0000_007F);
}

#[test]
fn add_imm_and_reg() {
    // MOV #4, R0; ADD #-1, R0; MOV #3, R1; ADD R1, R0
    let (mut cpu, mut bus, mut sched) = machine(&[0xE004, 0x70FF, 0xE103, 0x301C]);
    step(&mut cpu, &mut bus, &mut sched, 4);
    assert_eq!(cpu.gpr[0], 6);
}

#[test]
fn bsr_delay_slot_runs_before_the_branch() {
    // BSR +4; delay slot MOV #0x42, R1
    let (mut cpu, mut bus, mut sched) = machine(&[0xB002, 0xE142]);
    cpu.gpr[0] = 0x1000;
    step(&mut cpu, &mut bus, &mut sched, 1);

    // The slot executed, PR links past the delay slot, and the next fetch
    // (pc - 4) lands on the branch target BSR + 8.
    assert_eq!(cpu.gpr[1], 0x42);
    assert_eq!(cpu.pr, BASE + 4);
    assert_eq!(cpu.pc, BASE + 12);
}

#[test]
fn mulu_w_is_16x16_into_macl() {
    let (mut cpu, mut bus, mut sched) = machine(&[0x232E]);
    cpu.gpr[2] = 0x8000;
    cpu.gpr[3] = 0x8000;
    cpu.mach = 0xAAAA_5555;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.macl, 0x4000_0000);
    assert_eq!(cpu.mach, 0xAAAA_5555);
}

#[test]
fn compare_instructions_set_t() {
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x3100, // CMP/EQ R0, R1
        0x3102, // CMP/HS R0, R1
        0x3103, // CMP/GE R0, R1
        0x3107, // CMP/GT R0, R1
        0x4111, // CMP/PZ R1
        0x4115, // CMP/PL R1
        0x8805, // CMP/EQ #5, R0
    ]);
    cpu.gpr[0] = 5;
    cpu.gpr[1] = 0xFFFF_FFFF; // -1 signed

    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 0); // -1 != 5
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 1); // unsigned max >= 5
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 0); // -1 < 5 signed
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 0);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 0); // -1 not >= 0
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 0);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 1); // R0 == 5
}

#[test]
fn logic_immediates_target_r0() {
    let (mut cpu, mut bus, mut sched) = machine(&[0xC90F, 0xCBF0, 0xC800]);
    cpu.gpr[0] = 0x5A;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0x0A);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0xFA);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr & 1, 1); // TST #0 always sets T
}

#[test]
fn shifts_and_rotates_update_t() {
    // SHLL, ROTL, ROTCR, SHAR
    let (mut cpu, mut bus, mut sched) = machine(&[0x4000, 0x4004, 0x4025, 0x4021]);
    cpu.gpr[0] = 0x8000_0001;

    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0x0000_0002);
    assert_eq!(cpu.sr & 1, 1); // ejected the sign bit

    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0x0000_0004);
    assert_eq!(cpu.sr & 1, 0);

    // ROTCR inserts the previous T (0) and ejects bit 0.
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0x0000_0002);
    assert_eq!(cpu.sr & 1, 0);

    cpu.gpr[0] = 0x8000_0001;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], 0xC000_0000); // arithmetic shift keeps the sign
    assert_eq!(cpu.sr & 1, 1);
}

#[test]
fn rotcl_carries_through_t() {
    let (mut cpu, mut bus, mut sched) = machine(&[0x0018, 0x4024]);
    cpu.gpr[0] = 0x4000_0000;
    // SETT, then ROTCL pulls T into bit 0.
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[0], 0x8000_0001);
    assert_eq!(cpu.sr & 1, 0);
}

#[test]
fn extension_and_swap_forms() {
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x610E, // EXTS.B R0, R1
        0x620C, // EXTU.B R0, R2
        0x630F, // EXTS.W R0, R3
        0x640D, // EXTU.W R0, R4
        0x6509, // SWAP.W R0, R5
        0x260D, // XTRCT R0, R6
    ]);
    cpu.gpr[0] = 0x1234_80FF;
    cpu.gpr[6] = 0xAABB_CCDD;
    step(&mut cpu, &mut bus, &mut sched, 6);
    assert_eq!(cpu.gpr[1], 0xFFFF_FFFF);
    assert_eq!(cpu.gpr[2], 0x0000_00FF);
    assert_eq!(cpu.gpr[3], 0xFFFF_80FF);
    assert_eq!(cpu.gpr[4], 0x0000_80FF);
    assert_eq!(cpu.gpr[5], 0x80FF_1234);
    assert_eq!(cpu.gpr[6], 0x80FF_AABB);
}

#[test]
fn memory_moves_round_trip_through_ram() {
    let addr = BASE + 0x4000;
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x2102, // MOV.L R0, @R1
        0x6212, // MOV.L @R1, R2
        0x2101, // MOV.W R0, @R1
        0x6311, // MOV.W @R1, R3
        0x2100, // MOV.B R0, @R1
        0x6410, // MOV.B @R1, R4
    ]);
    cpu.gpr[0] = 0xCAFE_BABE;
    cpu.gpr[1] = addr;
    step(&mut cpu, &mut bus, &mut sched, 6);
    assert_eq!(cpu.gpr[2], 0xCAFE_BABE);
    assert_eq!(cpu.gpr[3], 0xFFFF_BABE);
    assert_eq!(cpu.gpr[4], 0xFFFF_FFBE);
}

#[test]
fn post_increment_and_pre_decrement_step_pointers() {
    let addr = BASE + 0x4000;
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x2106, // MOV.L R0, @-R1
        0x6216, // MOV.L @R1+, R2
    ]);
    cpu.gpr[0] = 0x1122_3344;
    cpu.gpr[1] = addr;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[1], addr - 4);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[2], 0x1122_3344);
    assert_eq!(cpu.gpr[1], addr);
}

#[test]
fn displacement_and_r0_relative_moves() {
    let addr = BASE + 0x4000;
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x1123, // MOV.L R2, @(disp 3, R1)
        0x5313, // MOV.L @(disp 3, R1), R3
        0x0126, // MOV.L R2, @(R0, R1)
        0x041C, // MOV.B @(R0, R1), R4
    ]);
    cpu.gpr[1] = addr;
    cpu.gpr[2] = 0xDEAD_BEEF;
    cpu.gpr[0] = 0x40;
    step(&mut cpu, &mut bus, &mut sched, 4);
    assert_eq!(cpu.gpr[3], 0xDEAD_BEEF);
    // Guest memory is big-endian: the first byte is the high one.
    assert_eq!(cpu.gpr[4], 0xFFFF_FFDE);
}

#[test]
fn gbr_relative_moves_use_the_base() {
    let (mut cpu, mut bus, mut sched) = machine(&[
        0xC103, // MOV.W R0, @(disp 3, GBR)
        0xC503, // MOV.W @(disp 3, GBR), R0
        0xC010, // MOV.B R0, @(disp 0x10, GBR)
        0xC410, // MOV.B @(disp 0x10, GBR), R0
    ]);
    cpu.gbr = BASE + 0x5000;
    cpu.gpr[0] = 0x8001;
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[0], 0xFFFF_8001);
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[0], 0x0000_0001);
}

#[test]
fn pc_relative_loads_fetch_literals() {
    // MOV.W @(2, PC), R1; MOV.L @(2, PC), R2; then literal pool.
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x9102, // word at pc+4 -> index 4
        0xD202, // long at (pc & ~3) + 8 -> index 6
        0x0009, 0x0009, 0x8001, 0x0009, 0x1234, 0x5678,
    ]);
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[1], 0xFFFF_8001);
    assert_eq!(cpu.gpr[2], 0x1234_5678);
}

#[test]
fn mova_is_long_aligned() {
    let (mut cpu, mut bus, mut sched) = machine(&[0xC701]);
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[0], (BASE + 4) + 4);
}

#[test]
fn movt_reads_the_t_flag() {
    let (mut cpu, mut bus, mut sched) = machine(&[0x0018, 0x0529]);
    step(&mut cpu, &mut bus, &mut sched, 2);
    assert_eq!(cpu.gpr[5], 1);
}

#[test]
fn conditional_branches_follow_t() {
    // SETT; BT +1 branches over the fall-through MOV.
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x0018, // SETT
        0x8901, // BT +1 -> target = branch + 4 + 2
        0xE001, // skipped
        0x0009,
        0xE002, // branch target: MOV #2, R0
    ]);
    step(&mut cpu, &mut bus, &mut sched, 3);
    assert_eq!(cpu.gpr[0], 2);

    // BF with T set falls through.
    let (mut cpu, mut bus, mut sched) = machine(&[0x0018, 0x8B01, 0xE001, 0xE002]);
    step(&mut cpu, &mut bus, &mut sched, 3);
    assert_eq!(cpu.gpr[0], 1);
}

#[test]
fn jsr_and_rts_pair_links_correctly() {
    let (mut cpu, mut bus, mut sched) = machine(&[
        0xE700, // MOV #0, R7 (scratch)
        0x410B, // JSR @R1
        0xE201, // delay slot: MOV #1, R2
        0xE305, // return point: MOV #5, R3
    ]);
    // Subroutine at BASE + 0x100: MOV #9, R4; RTS; delay MOV #7, R5
    let sub = BASE + 0x100;
    for (i, word) in [0xE409u16, 0x000B, 0xE507].iter().enumerate() {
        bus.write16(sub + i as u32 * 2, *word, &mut sched);
    }
    cpu.gpr[1] = sub;

    step(&mut cpu, &mut bus, &mut sched, 5);
    assert_eq!(cpu.gpr[2], 1); // delay slot ran
    assert_eq!(cpu.gpr[4], 9); // subroutine body
    assert_eq!(cpu.gpr[5], 7); // RTS delay slot
    assert_eq!(cpu.gpr[3], 5); // resumed after the call pair
}

#[test]
fn control_and_system_register_moves() {
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x401E, // LDC R0, GBR
        0x402E, // LDC R0, VBR
        0x0112, // STC GBR, R1
        0x0222, // STC VBR, R2
    ]);
    cpu.gpr[0] = 0x0123_4567;
    step(&mut cpu, &mut bus, &mut sched, 4);
    assert_eq!(cpu.gbr, 0x0123_4567);
    assert_eq!(cpu.vbr, 0x0123_4567);
    assert_eq!(cpu.gpr[1], 0x0123_4567);
    assert_eq!(cpu.gpr[2], 0x0123_4567);
}

#[test]
fn sts_and_lds_memory_forms() {
    let addr = BASE + 0x6000;
    let (mut cpu, mut bus, mut sched) = machine(&[
        0x4122, // STS.L PR, @-R1
        0x4126, // LDS.L @R1+, PR
    ]);
    cpu.pr = 0x0E00_0480;
    cpu.gpr[1] = addr;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.gpr[1], addr - 4);
    assert_eq!(bus.read32(addr - 4, &mut sched), 0x0E00_0480);

    cpu.pr = 0;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.pr, 0x0E00_0480);
    assert_eq!(cpu.gpr[1], addr);
}

#[test]
fn sts_reads_mac_registers() {
    let (mut cpu, mut bus, mut sched) = machine(&[0x000A, 0x011A, 0x022A]);
    cpu.mach = 0x1111;
    cpu.macl = 0x2222;
    cpu.pr = 0x3333;
    step(&mut cpu, &mut bus, &mut sched, 3);
    assert_eq!(cpu.gpr[0], 0x1111);
    assert_eq!(cpu.gpr[1], 0x2222);
    assert_eq!(cpu.gpr[2], 0x3333);
}

#[test]
fn sr_writes_mask_to_implemented_bits() {
    let (mut cpu, bus, mut sched) = machine(&[]);
    cpu.set_sr(0xFFFF_FFFF, &bus, &mut sched);
    assert_eq!(cpu.sr, 0x3F3);
}

#[test]
fn ldc_to_sr_applies_the_mask() {
    let (mut cpu, mut bus, mut sched) = machine(&[0x400E]);
    cpu.gpr[0] = 0xFFFF_FFFF;
    step(&mut cpu, &mut bus, &mut sched, 1);
    assert_eq!(cpu.sr, 0x3F3);
}

#[test]
fn exception_entry_pushes_sr_then_return_pc() {
    let (mut cpu, mut bus, mut sched) = machine(&[]);
    cpu.vbr = BASE + 0x1000;
    cpu.sr = 0x0000_0041;
    cpu.gpr[15] = BASE + 0x3000;
    bus.write32(cpu.vbr + 0x40 * 4, BASE + 0x2000, &mut sched);

    cpu.raise_exception(0x40, &mut bus, &mut sched);

    assert_eq!(cpu.gpr[15], BASE + 0x3000 - 8);
    // Return PC on top, SR above it.
    assert_eq!(bus.read32(cpu.gpr[15], &mut sched), BASE);
    assert_eq!(bus.read32(cpu.gpr[15] + 4, &mut sched), 0x41);
    assert_eq!(cpu.pc, BASE + 0x2000 + 4);
}

#[test]
#[should_panic(expected = "unrecognized instruction")]
fn invalid_opcode_is_fatal() {
    let (mut cpu, mut bus, mut sched) = machine(&[0xFFFF]);
    step(&mut cpu, &mut bus, &mut sched, 1);
}
