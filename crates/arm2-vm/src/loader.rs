//! Program loader.
//!
//! Places an assembled [`Program`] into guest memory: directive data
//! first (escapes were already processed by the lexer), then encoded
//! instructions and literal-pool words, then PC and SP seeding.

use std::fmt;

use arm2_asm::{DirArg, Program, encode_program};
use arm2_core::MemFault;

use crate::memory::{CODE_BASE, Perm, STACK_TOP};
use crate::vm::{Vm, VmState};

/// Loading failure.
#[derive(Debug, Clone)]
pub enum LoadError {
    /// The encoder rejected an instruction (diagnostics carry positions).
    Encode(Vec<arm2_asm::Diagnostic>),
    /// Emitted data landed outside every segment.
    Memory(MemFault),
    /// A segment could not be created.
    Segment(String),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(diags) => {
                write!(f, "encoding failed:")?;
                for d in diags {
                    write!(f, "\n  {d}")?;
                }
                Ok(())
            }
            Self::Memory(fault) => write!(f, "load fault: {fault}"),
            Self::Segment(msg) => write!(f, "segment setup: {msg}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// Granularity for on-demand segments covering out-of-layout addresses.
const PAGE: u32 = 0x1000;

/// Load `program` into `vm` and seed PC/SP. Returns the entry address.
pub fn load(vm: &mut Vm, program: &Program) -> Result<u32, LoadError> {
    ensure_segments(vm, program)?;

    // Directive data
    for dir in &program.directives {
        let mut addr = dir.addr;
        match dir.name.as_str() {
            "word" | "half" | "byte" => {
                let unit = match dir.name.as_str() {
                    "word" => 4u32,
                    "half" => 2,
                    _ => 1,
                };
                for arg in &dir.args {
                    let DirArg::Expr(expr) = arg else { continue };
                    let value = expr
                        .eval(&program.symbols, dir.addr)
                        .unwrap_or_default() as u32;
                    let bytes = value.to_le_bytes();
                    vm.mem
                        .poke_bytes(addr, &bytes[..unit as usize])
                        .map_err(LoadError::Memory)?;
                    addr += unit;
                }
            }
            "ascii" | "asciz" | "string" => {
                for arg in &dir.args {
                    let DirArg::Str(bytes) = arg else { continue };
                    vm.mem.poke_bytes(addr, bytes).map_err(LoadError::Memory)?;
                    addr += bytes.len() as u32;
                    if dir.name != "ascii" {
                        vm.mem.poke_bytes(addr, &[0]).map_err(LoadError::Memory)?;
                        addr += 1;
                    }
                }
            }
            // .space and .skip reserve zeroed bytes; fresh segments are
            // already zero
            _ => {}
        }
    }

    // Instructions and literal pools
    let words = encode_program(program).map_err(LoadError::Encode)?;
    for (addr, word) in words {
        vm.mem
            .poke_bytes(addr, &word.to_le_bytes())
            .map_err(LoadError::Memory)?;
    }

    let entry = program.entry_point().unwrap_or(CODE_BASE);
    vm.cpu.regs.set_pc(entry);
    vm.cpu.regs.set(13, STACK_TOP);
    vm.set_state(VmState::Idle);
    Ok(entry)
}

/// Make sure every emitted byte lands in a segment, creating a
/// low-memory segment for programs originating below the code base and
/// page-granular segments for anything else out of layout.
fn ensure_segments(vm: &mut Vm, program: &Program) -> Result<(), LoadError> {
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    for instr in &program.instructions {
        ranges.push((instr.addr, 4));
    }
    for dir in &program.directives {
        if dir.size > 0 {
            ranges.push((dir.addr, dir.size));
        }
    }
    for pool in &program.pools {
        ranges.push((pool.addr, 4 * pool.entries.len() as u32));
    }

    for (start, len) in ranges {
        let end = start.saturating_add(len.saturating_sub(1));
        // Walk page by page so wide reservations are fully covered
        let mut points = Vec::new();
        let mut addr = start;
        loop {
            points.push(addr);
            let next_page = (addr & !(PAGE - 1)).saturating_add(PAGE);
            if next_page > end || next_page <= addr {
                break;
            }
            addr = next_page;
        }
        points.push(end);
        for addr in points {
            if vm.mem.is_mapped(addr) {
                continue;
            }
            if addr < CODE_BASE {
                // Low-memory segment: everything below the code base
                if !vm.mem.is_mapped(0) {
                    vm.mem
                        .add_segment("low", 0, CODE_BASE, Perm::RWX)
                        .map_err(|e| LoadError::Segment(e.to_string()))?;
                }
                continue;
            }
            let base = addr & !(PAGE - 1);
            vm.mem
                .add_segment(&format!("mapped-{base:08X}"), base, PAGE, Perm::RWX)
                .map_err(|e| LoadError::Segment(e.to_string()))?;
        }
    }
    Ok(())
}
