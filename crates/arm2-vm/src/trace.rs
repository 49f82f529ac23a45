//! Diagnostics observers.
//!
//! Tracers are pure observers: the VM hands them events by value after
//! each instruction and they share no mutable state with the core.
//! Queries never affect emulation.

use std::collections::HashSet;

use acorn_arm2::Cpsr;
use arm2_core::MemAccess;

/// One observable fact about an executed instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// An instruction retired at `addr`.
    Exec { addr: u32, opcode: u32 },
    /// A memory access the instruction (or its syscall) performed.
    Mem(MemAccess),
    /// A register changed value.
    RegWrite { reg: u8, value: u32 },
    /// The flags changed.
    Flags(Cpsr),
    /// A syscall was dispatched.
    Swi { number: u32 },
}

/// A diagnostics observer.
pub trait Tracer: Send {
    fn event(&mut self, event: &TraceEvent);
}

/// Records every executed (address, opcode) pair, capped to keep long
/// runs bounded.
pub struct ExecutionTrace {
    pub entries: Vec<(u32, u32)>,
    cap: usize,
}

impl ExecutionTrace {
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            entries: Vec::new(),
            cap,
        }
    }
}

impl Tracer for ExecutionTrace {
    fn event(&mut self, event: &TraceEvent) {
        if let TraceEvent::Exec { addr, opcode } = event {
            if self.entries.len() < self.cap {
                self.entries.push((*addr, *opcode));
            }
        }
    }
}

/// The set of instruction addresses that have executed.
#[derive(Default)]
pub struct CoverageMap {
    pub executed: HashSet<u32>,
}

impl CoverageMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CoverageMap {
    fn event(&mut self, event: &TraceEvent) {
        if let TraceEvent::Exec { addr, .. } = event {
            self.executed.insert(*addr);
        }
    }
}

/// Records every memory access.
#[derive(Default)]
pub struct MemoryTrace {
    pub accesses: Vec<MemAccess>,
}

impl MemoryTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for MemoryTrace {
    fn event(&mut self, event: &TraceEvent) {
        if let TraceEvent::Mem(access) = event {
            self.accesses.push(*access);
        }
    }
}

/// Tracks BL call/return pairs by watching LR writes and branches.
///
/// A BL opcode pushes its return address; executing at the top-of-stack
/// return address pops it. Approximate (tail calls fold), which is fine
/// for a diagnostic view.
#[derive(Default)]
pub struct CallStackTrace {
    pub stack: Vec<u32>,
}

impl CallStackTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CallStackTrace {
    fn event(&mut self, event: &TraceEvent) {
        if let TraceEvent::Exec { addr, opcode } = event {
            if self.stack.last() == Some(addr) {
                self.stack.pop();
            }
            // BL: bits 27-24 = 1011
            if opcode & 0x0F00_0000 == 0x0B00_0000 {
                self.stack.push(addr.wrapping_add(4));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coverage_dedups_addresses() {
        let mut coverage = CoverageMap::new();
        for _ in 0..3 {
            coverage.event(&TraceEvent::Exec {
                addr: 0x8000,
                opcode: 0,
            });
        }
        coverage.event(&TraceEvent::Exec {
            addr: 0x8004,
            opcode: 0,
        });
        assert_eq!(coverage.executed.len(), 2);
    }

    #[test]
    fn execution_trace_respects_cap() {
        let mut trace = ExecutionTrace::new(2);
        for addr in [0u32, 4, 8] {
            trace.event(&TraceEvent::Exec { addr, opcode: 0 });
        }
        assert_eq!(trace.entries.len(), 2);
    }

    #[test]
    fn call_stack_pairs_bl_with_return() {
        let mut stack = CallStackTrace::new();
        // BL at 0x8000
        stack.event(&TraceEvent::Exec {
            addr: 0x8000,
            opcode: 0xEB00_0010,
        });
        assert_eq!(stack.stack, vec![0x8004]);
        // Subroutine body
        stack.event(&TraceEvent::Exec {
            addr: 0x8050,
            opcode: 0xE1A0_F00E,
        });
        assert_eq!(stack.stack.len(), 1);
        // Return address executes
        stack.event(&TraceEvent::Exec {
            addr: 0x8004,
            opcode: 0xE1A0_0000,
        });
        assert!(stack.stack.is_empty());
    }
}
