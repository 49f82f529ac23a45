//! End-to-end machine tests: assemble → load → run → observe.

use arm2_asm::{AsmConfig, assemble_str};
use arm2_vm::{
    CoverageMap, ManualClock, RunEvent, Vm, VmConfig, VmError, VmState, XorShiftRng, load,
};

/// Assemble and load a program into a deterministic machine.
fn boot(source: &str) -> Vm {
    boot_with(source, VmConfig::default())
}

fn boot_with(source: &str, config: VmConfig) -> Vm {
    let program = assemble_str(source, &AsmConfig::default()).expect("program assembles");
    let mut vm = Vm::with_sources(
        config,
        Box::new(ManualClock::new()),
        Box::new(XorShiftRng::seeded(7)),
    );
    load(&mut vm, &program).expect("program loads");
    vm
}

#[test]
fn hello_a_prints_and_exits_zero() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #65
        SWI 0x01
        MOV R0, #0
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.io.drain_stdout(), b"A");
    assert_eq!(vm.state(), VmState::Halted(0));
}

#[test]
fn two_operand_adds_exit_with_30() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #0
        ADD R0, #10
        ADD R0, #20
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(30)));
}

#[test]
fn recursive_factorial_of_five() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #5
        BL fact
        SWI 0x00

; n in R0, result in R0, clobbers R1-R2
fact:   CMP R0, #1
        MOVLE R0, #1
        MOVLE PC, LR
        PUSH {R0, LR}
        SUB R0, R0, #1
        BL fact
        POP {R1, LR}
        MUL R2, R1, R0
        MOV R0, R2
        MOV PC, LR
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(120)));
    assert_eq!(vm.cpu.regs.get(0), 120, "R0 holds 5!");
}

#[test]
fn asciz_string_prints_exactly_three_bytes() {
    let mut vm = boot(
        "\
.org 0x8000
_start: LDR R0, =msg
        SWI 0x02
        SWI 0x00
msg:    .asciz \"Hi\\n\"
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.io.drain_stdout(), b"Hi\n");
}

#[test]
fn exit_code_is_low_eight_bits() {
    let mut vm = boot(
        "\
.org 0x8000
_start: LDR R0, =260
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(4)));
}

#[test]
fn write_int_bases() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #254
        MOV R1, #10
        SWI 0x03
        SWI 0x07
        MOV R0, #254
        MOV R1, #16
        SWI 0x03
        SWI 0x07
        MVN R0, #0
        MOV R1, #10
        SWI 0x03
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(255)));
    assert_eq!(vm.io.drain_stdout(), b"254\nFE\n-1");
}

#[test]
fn read_char_echoes_stdin() {
    let mut vm = boot(
        "\
.org 0x8000
_start: SWI 0x04
        SWI 0x01
        MOV R0, #0
        SWI 0x00
",
    );
    vm.io.send_stdin(b"Q");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.io.drain_stdout(), b"Q");
}

#[test]
fn read_string_stops_at_newline() {
    let mut vm = boot(
        "\
.org 0x8000
_start: LDR R0, =0x10000
        MOV R1, #64
        SWI 0x05
        MOV R2, R0          ; length
        LDR R0, =0x10000
        SWI 0x02            ; echo the buffer back
        MOV R0, R2
        SWI 0x00
",
    );
    vm.io.send_stdin(b"hello\nrest");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(5)));
    assert_eq!(vm.io.drain_stdout(), b"hello");
}

#[test]
fn heap_allocate_free_reallocate() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #32
        SWI 0x20            ; allocate
        MOV R4, R0
        LDR R1, =0xDEADBEEF
        STR R1, [R4]
        MOV R0, R4
        MOV R1, #64
        SWI 0x22            ; reallocate
        MOV R5, R0
        LDR R6, [R5]        ; survives the move
        MOV R0, R5
        SWI 0x21            ; free
        MOV R0, #0
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    let base = vm.cpu.regs.get(4);
    assert!(
        (0x3_0000..0x4_0000).contains(&base),
        "allocation {base:#X} inside the heap segment"
    );
    assert_eq!(vm.cpu.regs.get(6), 0xDEAD_BEEF, "contents copied on realloc");
}

#[test]
fn get_time_and_random_are_injected() {
    let clock = ManualClock::new();
    clock.advance(1234);
    let program = assemble_str(
        "\
.org 0x8000
_start: SWI 0x30
        MOV R4, R0
        SWI 0x31
        MOV R5, R0
        MOV R0, #0
        SWI 0x00
",
        &AsmConfig::default(),
    )
    .expect("assembles");
    let mut vm = Vm::with_sources(
        VmConfig::default(),
        Box::new(clock),
        Box::new(XorShiftRng::seeded(7)),
    );
    load(&mut vm, &program).expect("loads");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.cpu.regs.get(4), 1234, "manual clock value");
    let mut reference = XorShiftRng::seeded(7);
    use arm2_vm::Rng;
    assert_eq!(vm.cpu.regs.get(5), reference.next_u32(), "seeded RNG");
}

#[test]
fn get_error_reports_and_clears() {
    let mut vm = boot(
        "\
.org 0x8000
_start: MOV R0, #99
        SWI 0x21            ; free of a bogus address fails
        SWI 0x32            ; GET_ERROR
        MOV R4, R0
        SWI 0x32            ; reads as clear now
        MOV R5, R0
        MOV R0, #0
        SWI 0x00
",
    );
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.cpu.regs.get(4), arm2_vm::errno::BAD_ARG);
    assert_eq!(vm.cpu.regs.get(5), arm2_vm::errno::NONE);
}

#[test]
fn unknown_syscall_is_fatal() {
    let mut vm = boot(".org 0x8000\n_start: SWI 0x99\n");
    assert_eq!(vm.run(), Err(VmError::UnknownSyscall(0x99)));
    assert_eq!(vm.state(), VmState::Error);
}

#[test]
fn undefined_instruction_is_fatal() {
    let mut vm = boot(".org 0x8000\n.word 0xE7000010\n");
    match vm.run() {
        Err(VmError::Cpu(acorn_arm2::CpuFault::Undefined { addr, opcode })) => {
            assert_eq!(addr, 0x8000);
            assert_eq!(opcode, 0xE700_0010);
        }
        other => panic!("expected undefined instruction, got {other:?}"),
    }
}

#[test]
fn cycle_limit_stops_runaway_loops() {
    let mut vm = boot_with(
        ".org 0x8000\n_start: B _start\n",
        VmConfig {
            cycle_limit: 100,
            ..VmConfig::default()
        },
    );
    assert_eq!(vm.run(), Err(VmError::CycleLimit));
    assert_eq!(vm.cycles(), 100);
}

#[test]
fn wall_clock_timeout_is_distinct() {
    let clock = ManualClock::new();
    clock.advance(60_000);
    let program = assemble_str(".org 0x8000\n_start: B _start\n", &AsmConfig::default())
        .expect("assembles");
    let mut vm = Vm::with_sources(
        VmConfig {
            wall_clock_ms: 1000,
            ..VmConfig::default()
        },
        Box::new(clock),
        Box::new(XorShiftRng::seeded(1)),
    );
    load(&mut vm, &program).expect("loads");
    assert_eq!(vm.run(), Err(VmError::WallClockTimeout));
}

#[test]
fn guest_assertion_failure_is_fatal() {
    let mut vm = boot(
        ".org 0x8000\n_start: MOV R0, #1\n MOV R1, #2\n SWI 0xF3\n",
    );
    assert_eq!(
        vm.run(),
        Err(VmError::AssertionFailed {
            actual: 1,
            expected: 2
        })
    );
}

#[test]
fn debug_break_pauses_for_the_debugger() {
    let mut vm = boot(".org 0x8000\n_start: SWI 0xF1\n MOV R0, #0\n SWI 0x00\n");
    assert_eq!(vm.run(), Ok(RunEvent::DebugBreak));
    assert_eq!(vm.state(), VmState::Paused);
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)), "continues after the break");
}

#[test]
fn pause_flag_interrupts_between_instructions() {
    let mut vm = boot(".org 0x8000\n_start: B _start\n");
    vm.pause_handle().store(true, std::sync::atomic::Ordering::Release);
    assert_eq!(vm.run(), Ok(RunEvent::Paused));
    assert_eq!(vm.state(), VmState::Paused);
}

#[test]
fn low_memory_segment_is_created_on_demand() {
    // No .org: the program originates at 0
    let mut vm = boot("_start: MOV R0, #7\n SWI 0x00\n");
    assert_eq!(vm.cpu.regs.pc(), 0, "entry at the origin");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(7)));
}

#[test]
fn sandbox_violation_fails_open_but_keeps_running() {
    let scratch = std::env::temp_dir().join(format!("arm2-vmtest-{}", std::process::id()));
    let _ = std::fs::create_dir_all(&scratch);
    let program = assemble_str(
        "\
.org 0x8000
_start: LDR R0, =path
        MOV R1, #0
        SWI 0x10            ; OPEN
        MOV R4, R0
        SWI 0x32            ; GET_ERROR
        MOV R5, R0
        MOV R0, #0
        SWI 0x00
path:   .asciz \"../escape.txt\"
",
        &AsmConfig::default(),
    )
    .expect("assembles");
    let mut vm = Vm::with_sources(
        VmConfig {
            fs_root: scratch.clone(),
            ..VmConfig::default()
        },
        Box::new(ManualClock::new()),
        Box::new(XorShiftRng::seeded(1)),
    );
    vm.io.set_stderr(Box::new(std::io::sink()));
    load(&mut vm, &program).expect("loads");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)), "violation is not fatal");
    assert_eq!(vm.cpu.regs.get(4), 0xFFFF_FFFF, "OPEN returned failure");
    assert_eq!(vm.cpu.regs.get(5), arm2_vm::errno::SANDBOX);
    let _ = std::fs::remove_dir_all(&scratch);
}

#[test]
fn file_round_trip_inside_sandbox() {
    let scratch = std::env::temp_dir().join(format!("arm2-vmfile-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&scratch);
    std::fs::create_dir_all(&scratch).expect("scratch dir");
    std::fs::write(scratch.join("in.txt"), b"filedata").expect("seed file");
    let program = assemble_str(
        "\
.org 0x8000
_start: LDR R0, =path
        MOV R1, #0
        SWI 0x10            ; OPEN read
        MOV R4, R0          ; fd
        SWI 0x16            ; FILE_SIZE
        MOV R6, R0
        MOV R0, R4
        LDR R1, =0x10000
        MOV R2, #64
        SWI 0x12            ; READ_FILE
        MOV R7, R0          ; bytes read
        MOV R0, R4
        SWI 0x11            ; CLOSE
        MOV R0, #0
        SWI 0x00
path:   .asciz \"in.txt\"
",
        &AsmConfig::default(),
    )
    .expect("assembles");
    let mut vm = Vm::with_sources(
        VmConfig {
            fs_root: scratch.clone(),
            ..VmConfig::default()
        },
        Box::new(ManualClock::new()),
        Box::new(XorShiftRng::seeded(1)),
    );
    load(&mut vm, &program).expect("loads");
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    assert_eq!(vm.cpu.regs.get(6), 8, "FILE_SIZE");
    assert_eq!(vm.cpu.regs.get(7), 8, "READ_FILE count");
    assert_eq!(
        vm.mem.peek_bytes(0x10000, 8).expect("mapped"),
        b"filedata".to_vec()
    );
    let _ = std::fs::remove_dir_all(&scratch);
}

#[test]
fn coverage_tracer_sees_executed_addresses() {
    let program = assemble_str(
        ".org 0x8000\n_start: MOV R0, #0\n MOV R1, #1\n SWI 0x00\n",
        &AsmConfig::default(),
    )
    .expect("assembles");
    let mut vm = Vm::with_sources(
        VmConfig::default(),
        Box::new(ManualClock::new()),
        Box::new(XorShiftRng::seeded(1)),
    );
    load(&mut vm, &program).expect("loads");
    vm.add_tracer(Box::new(CoverageMap::new()));
    assert_eq!(vm.run(), Ok(RunEvent::Halted(0)));
    // The tracer is owned by the VM; this test mainly pins that tracing
    // does not disturb execution. Accesses of the last step are
    // observable directly:
    assert!(vm.last_accesses().iter().any(|a| a.addr == 0x8008));
}
