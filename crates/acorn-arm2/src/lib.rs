//! ARM2 CPU interpreter.
//!
//! Semantic (instruction-level) emulation of the ARM2: 16 registers with
//! the 8-byte PC pipeline offset, four CPSR flags held separately from PC
//! (full 32-bit address space, no 26-bit PSR packing), the barrel shifter,
//! and the ARM2 instruction classes. No coprocessor, SWP, long multiply,
//! or PSR transfer instructions.
//!
//! The executor is pure over a [`Bus`](arm2_core::Bus): syscalls surface
//! as [`ExecEvent::Swi`](arm2_core::ExecEvent) for the machine layer.

mod cpu;
mod decode;
mod flags;
mod instr;
mod registers;
mod shifter;

pub use cpu::{Cpu, CpuFault};
pub use decode::{DecodeError, decode};
pub use flags::{Cond, Cpsr};
pub use instr::{
    AluOp, BlockMode, HalfOffset, Instr, Operand2, RegList, ShiftOp, TransferOffset,
    register_name,
};
pub use registers::{LR, PC, Registers, SP};
pub use shifter::shift;
