//! Single-step vector tests.
//!
//! Each vector sets up registers, flags, and memory, executes exactly one
//! instruction, and compares the resulting state. The vector file lives
//! in `tests/data/` and covers the flag-table and shifter boundary cases.

use acorn_arm2::{Cpu, Cpsr};
use arm2_core::{Bus, FlatBus};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Every vector executes at this address.
const BASE: u32 = 0x100;

#[derive(Deserialize)]
struct TestCase {
    name: String,
    opcode: String,
    initial: MachineState,
    #[serde(rename = "final")]
    final_state: MachineState,
}

#[derive(Deserialize)]
struct MachineState {
    regs: Vec<(u8, String)>,
    flags: String,
    #[serde(default)]
    mem: Vec<(String, String)>,
    #[serde(default)]
    pc: Option<String>,
}

fn parse_hex(s: &str) -> u32 {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16).expect("hex literal in vector file")
}

fn parse_flags(s: &str) -> Cpsr {
    let bytes = s.as_bytes();
    assert_eq!(bytes.len(), 4, "flags string is NZCV with '-' for clear");
    Cpsr {
        n: bytes[0] == b'N',
        z: bytes[1] == b'Z',
        c: bytes[2] == b'C',
        v: bytes[3] == b'V',
    }
}

fn setup(case: &TestCase) -> (Cpu, FlatBus) {
    let mut bus = FlatBus::new();
    bus.load_words(BASE, &[parse_hex(&case.opcode)]);
    for (addr, value) in &case.initial.mem {
        bus.load_words(parse_hex(addr), &[parse_hex(value)]);
    }
    let mut cpu = Cpu::new();
    cpu.regs.set_pc(BASE);
    cpu.regs.cpsr = parse_flags(&case.initial.flags);
    for (reg, value) in &case.initial.regs {
        cpu.regs.set(*reg, parse_hex(value));
    }
    (cpu, bus)
}

fn check(case: &TestCase, cpu: &Cpu, bus: &mut FlatBus) -> Vec<String> {
    let mut errors = Vec::new();
    let expected = &case.final_state;
    for (reg, value) in &expected.regs {
        let want = parse_hex(value);
        let got = cpu.regs.get(*reg);
        if got != want {
            errors.push(format!("R{reg}: got {got:#010X}, want {want:#010X}"));
        }
    }
    let want_flags = parse_flags(&expected.flags);
    if cpu.regs.cpsr != want_flags {
        errors.push(format!(
            "flags: got {}, want {}",
            cpu.regs.cpsr, want_flags
        ));
    }
    if let Some(pc) = &expected.pc {
        let want = parse_hex(pc);
        if cpu.regs.pc() != want {
            errors.push(format!("PC: got {:#010X}, want {want:#010X}", cpu.regs.pc()));
        }
    }
    for (addr, value) in &expected.mem {
        let addr = parse_hex(addr);
        let want = parse_hex(value);
        let got = bus.read_word(addr).expect("vector memory is aligned");
        if got != want {
            errors.push(format!("[{addr:#010X}]: got {got:#010X}, want {want:#010X}"));
        }
    }
    errors
}

#[test]
fn single_step_vectors() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/arm2_v1.json");
    let data = fs::read_to_string(&path).expect("vector file present in repo");
    let cases: Vec<TestCase> = serde_json::from_str(&data).expect("vector file parses");
    assert!(!cases.is_empty());

    let mut failures = Vec::new();
    for case in &cases {
        let (mut cpu, mut bus) = setup(case);
        if let Err(fault) = cpu.step(&mut bus) {
            failures.push(format!("{}: faulted: {fault}", case.name));
            continue;
        }
        for error in check(case, &cpu, &mut bus) {
            failures.push(format!("{}: {error}", case.name));
        }
    }
    assert!(failures.is_empty(), "vector failures:\n{}", failures.join("\n"));
}
