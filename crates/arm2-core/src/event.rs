//! Execution events.

/// What a single instruction step produced.
///
/// Control-flow transitions are values returned from the executor, never
/// unwinding. `Swi` hands the comment field to the machine layer, which
/// owns the syscall table; the CPU itself knows nothing about syscalls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecEvent {
    /// Instruction retired normally.
    Continue,
    /// `SWI #imm24` executed; the machine dispatches the handler.
    Swi(u32),
}
