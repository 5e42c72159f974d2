//! Black-box scenarios against the public `Vm` API (spec.md sec. 8).

use haiku32_vm::{HaltReason, Vm, VmConfig};

fn write_minimal_exec(entry_vaddr: u32, payload: &[u8]) -> std::path::PathBuf {
    let mut bytes = vec![0u8; 0x34];
    bytes[0..4].copy_from_slice(&haiku32_vm::elf::header::ELF_MAGIC);
    bytes[4] = 1;
    bytes[5] = 1;
    bytes[0x10..0x12].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    bytes[0x12..0x14].copy_from_slice(&3u16.to_le_bytes()); // EM_386
    bytes[0x18..0x1C].copy_from_slice(&entry_vaddr.to_le_bytes());
    bytes[0x1C..0x20].copy_from_slice(&0x34u32.to_le_bytes());
    bytes[0x2A..0x2C].copy_from_slice(&32u16.to_le_bytes());
    bytes[0x2C..0x2E].copy_from_slice(&1u16.to_le_bytes());

    let ph_off = bytes.len();
    let mut phdr = vec![0u8; 32];
    phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    phdr[4..8].copy_from_slice(&(ph_off as u32 + 32).to_le_bytes());
    phdr[8..12].copy_from_slice(&entry_vaddr.to_le_bytes());
    phdr[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    phdr[20..24].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    phdr[24..28].copy_from_slice(&5u32.to_le_bytes()); // PF_R|PF_X
    bytes.extend_from_slice(&phdr);
    bytes.extend_from_slice(payload);

    let path = std::env::temp_dir().join(format!(
        "haiku32_vm_scenario_{}_{:x}",
        std::process::id(),
        entry_vaddr
    ));
    std::fs::write(&path, bytes).unwrap();
    path
}

#[test]
fn s1_minimal_exit_halts_with_the_guests_exit_status() {
    // mov eax,1 ; mov ebx,7 ; int 0x63  (sys_exit(7))
    let payload: &[u8] = &[0xB8, 1, 0, 0, 0, 0xBB, 7, 0, 0, 0, 0xCD, 0x63];
    let path = write_minimal_exec(0x1000, payload);

    let mut vm = Vm::new(VmConfig::default());
    vm.load(&path).unwrap();
    let reason = vm.run().unwrap();

    assert_eq!(reason, HaltReason::GracefulExit);
    assert_eq!(vm.exit_status(), 7);
    std::fs::remove_file(&path).ok();
}

#[test]
fn s2_arithmetic_and_conditional_jump() {
    // mov eax,3 ; mov ebx,5 ; sub eax,ebx ; jl +2 ; nop ; nop
    let payload: &[u8] = &[
        0xB8, 3, 0, 0, 0, 0xBB, 5, 0, 0, 0, 0x29, 0xD8, 0x7C, 0x02, 0x90, 0x90,
    ];
    let entry = 0x1000u32;
    let path = write_minimal_exec(entry, payload);

    let mut config = VmConfig::default();
    config.instruction_limit = 4; // mov, mov, sub, jl -- halt before the nops
    let mut vm = Vm::new(config);
    vm.load(&path).unwrap();
    let reason = vm.run().unwrap();

    assert_eq!(reason, HaltReason::InstructionLimit);
    assert_eq!(vm.registers().eax, 0xFFFF_FFFE);
    assert!(vm.registers().flags().sf());
    assert!(!vm.registers().flags().of());
    // SUB is 2 bytes, JL is 2 bytes; taken branch skips both NOPs.
    assert_eq!(vm.registers().eip, entry + 14 + 2);
    std::fs::remove_file(&path).ok();
}

#[test]
fn s3_push_then_pop_round_trips_through_the_stack() {
    // push 7 ; pop eax
    let payload: &[u8] = &[0x6A, 0x07, 0x58];
    let path = write_minimal_exec(0x1000, payload);

    let mut config = VmConfig::default();
    config.instruction_limit = 2;
    let mut vm = Vm::new(config);
    vm.load(&path).unwrap();
    let initial_esp = {
        // the stack pointer the loader set up, captured before it moves.
        let mut probe = Vm::new(VmConfig::default());
        probe.load(&path).unwrap();
        probe.registers().esp
    };

    let reason = vm.run().unwrap();
    assert_eq!(reason, HaltReason::InstructionLimit);
    assert_eq!(vm.registers().eax, 7);
    assert_eq!(vm.registers().esp, initial_esp);
    assert_eq!(vm.read_u32(initial_esp - 4).unwrap(), 7);
    std::fs::remove_file(&path).ok();
}

#[test]
fn s6_fpu_round_trip_leaves_the_ieee754_bit_pattern_and_an_empty_stack() {
    // fld1 ; fstp dword [esp]
    let payload: &[u8] = &[0xD9, 0xE8, 0xD9, 0x1C, 0x24];
    let path = write_minimal_exec(0x1000, payload);

    let mut config = VmConfig::default();
    config.instruction_limit = 2;
    let mut vm = Vm::new(config);
    vm.load(&path).unwrap();
    let esp = vm.registers().esp;

    let reason = vm.run().unwrap();
    assert_eq!(reason, HaltReason::InstructionLimit);
    assert_eq!(vm.read_u32(esp).unwrap(), 0x3F80_0000);
    assert_eq!(vm.fpu().tag_word(), 0xFFFF);
    std::fs::remove_file(&path).ok();
}
