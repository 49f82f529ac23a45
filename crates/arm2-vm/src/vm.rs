//! The virtual machine actor.
//!
//! Single-threaded and cooperative: one owner advances CPU + memory by
//! exactly one instruction per [`step`](Vm::step). The only cross-thread
//! primitive is an atomic pause flag checked between instructions;
//! everything else happens on the actor's thread, or from another thread
//! only while the machine is known to be paused or halted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use acorn_arm2::{Cpu, CpuFault};
use arm2_core::{ExecEvent, MemAccess, MemFault};

use crate::clock::{Clock, MonotonicClock, Rng, XorShiftRng};
use crate::config::VmConfig;
use crate::heap::HeapAllocator;
use crate::io::GuestIo;
use crate::memory::{HEAP_BASE, Memory, SEGMENT_SIZE};
use crate::sandbox::{FileTable, Sandbox};
use crate::syscall::{SyscallCtx, SyscallOutcome, dispatch};
use crate::trace::{TraceEvent, Tracer};

/// Fatal run-ending conditions, each with its own exit-code class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    /// Memory fault or undefined instruction raised by the executor.
    Cpu(CpuFault),
    /// Memory fault raised while a syscall handler touched guest memory.
    Memory(MemFault),
    UnknownSyscall(u32),
    /// Instruction budget exhausted: the guest is running away.
    CycleLimit,
    /// Wall-clock budget exhausted: the guest is slow, not runaway.
    WallClockTimeout,
    /// WRITE_STRING scanned past the configured cap without a NUL.
    StringTooLong { addr: u32 },
    /// The guest's ASSERT_EQ debug helper failed.
    AssertionFailed { actual: u32, expected: u32 },
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu(fault) => write!(f, "{fault}"),
            Self::Memory(fault) => write!(f, "memory fault in syscall: {fault}"),
            Self::UnknownSyscall(n) => write!(f, "unknown syscall {n:#04X}"),
            Self::CycleLimit => write!(f, "cycle limit exceeded"),
            Self::WallClockTimeout => write!(f, "wall-clock timeout"),
            Self::StringTooLong { addr } => {
                write!(f, "string at {addr:#010X} exceeds the length cap")
            }
            Self::AssertionFailed { actual, expected } => {
                write!(f, "guest assertion failed: {actual:#010X} != {expected:#010X}")
            }
        }
    }
}

impl std::error::Error for VmError {}

/// Machine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No program loaded or a reset machine.
    Idle,
    Running,
    Paused,
    Halted(u8),
    Error,
}

/// What one step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Continue,
    Halted(u8),
    /// The guest requested a debugger stop (DEBUG_BREAK).
    DebugBreak,
}

/// Why a `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEvent {
    Halted(u8),
    Paused,
    DebugBreak,
}

/// Interval between wall-clock checks, in instructions.
const WALL_CLOCK_STRIDE: u64 = 1024;

pub struct Vm {
    pub cpu: Cpu,
    pub mem: Memory,
    pub heap: HeapAllocator,
    pub io: GuestIo,
    files: FileTable,
    sandbox: Option<Sandbox>,
    clock: Box<dyn Clock>,
    rng: Box<dyn Rng>,
    config: VmConfig,
    state: VmState,
    cycles: u64,
    last_error: u32,
    pause_flag: Arc<AtomicBool>,
    tracers: Vec<Box<dyn Tracer>>,
    /// Accesses performed by the most recent step (instruction plus any
    /// syscall buffer traffic), for watchpoints.
    last_accesses: Vec<MemAccess>,
}

impl Vm {
    /// A machine with the standard memory layout and production
    /// clock/RNG.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self::with_sources(
            config,
            Box::new(MonotonicClock::new()),
            Box::new(XorShiftRng::from_entropy()),
        )
    }

    /// A machine with injected time and randomness (tests).
    #[must_use]
    pub fn with_sources(config: VmConfig, clock: Box<dyn Clock>, rng: Box<dyn Rng>) -> Self {
        let sandbox = Sandbox::new(&config.fs_root).ok();
        Self {
            cpu: Cpu::new(),
            mem: Memory::with_standard_layout(),
            heap: HeapAllocator::new(HEAP_BASE, SEGMENT_SIZE, config.heap_cap),
            io: GuestIo::new(),
            files: FileTable::new(),
            sandbox,
            clock,
            rng,
            config,
            state: VmState::Idle,
            cycles: 0,
            last_error: 0,
            pause_flag: Arc::new(AtomicBool::new(false)),
            tracers: Vec::new(),
            last_accesses: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> VmState {
        self.state
    }

    pub fn set_state(&mut self, state: VmState) {
        self.state = state;
    }

    #[must_use]
    pub const fn cycles(&self) -> u64 {
        self.cycles
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The cross-thread pause handle. Setting it makes the next
    /// inter-instruction check return control.
    #[must_use]
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pause_flag)
    }

    /// Attach a diagnostics observer.
    pub fn add_tracer(&mut self, tracer: Box<dyn Tracer>) {
        self.tracers.push(tracer);
    }

    /// The memory accesses of the most recent step, by value.
    #[must_use]
    pub fn last_accesses(&self) -> &[MemAccess] {
        &self.last_accesses
    }

    /// Reset CPU, cycle counter, and state; memory contents stay (a
    /// fresh load rewrites them).
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.cycles = 0;
        self.last_error = 0;
        self.state = VmState::Idle;
        self.pause_flag.store(false, Ordering::Release);
        self.last_accesses.clear();
    }

    fn emit(&mut self, event: &TraceEvent) {
        for tracer in &mut self.tracers {
            tracer.event(event);
        }
    }

    /// Execute exactly one instruction.
    ///
    /// A condition-failed instruction still counts as one step. Fatal
    /// errors leave the machine in `Error` with the PC at the faulting
    /// instruction.
    pub fn step(&mut self) -> Result<StepEvent, VmError> {
        if let VmState::Halted(code) = self.state {
            return Ok(StepEvent::Halted(code));
        }
        if self.cycles >= self.config.cycle_limit {
            self.state = VmState::Error;
            return Err(VmError::CycleLimit);
        }
        self.cycles += 1;

        let pc = self.cpu.regs.pc();
        let regs_before = self.cpu.regs.raw();
        let flags_before = self.cpu.regs.cpsr;
        let opcode = self.mem.peek_word(pc & !3).unwrap_or(0);

        let event = match self.cpu.step(&mut self.mem) {
            Ok(event) => event,
            Err(fault) => {
                self.last_accesses = self.mem.drain_accesses();
                self.state = VmState::Error;
                return Err(VmError::Cpu(fault));
            }
        };
        self.last_accesses = self.mem.drain_accesses();

        let outcome = match event {
            ExecEvent::Continue => SyscallOutcome::Continue,
            ExecEvent::Swi(number) => {
                self.emit(&TraceEvent::Swi { number });
                let result = {
                    let ctx = &mut SyscallCtx {
                        regs: &mut self.cpu.regs,
                        mem: &mut self.mem,
                        heap: &mut self.heap,
                        io: &mut self.io,
                        files: &mut self.files,
                        sandbox: self.sandbox.as_ref(),
                        clock: self.clock.as_ref(),
                        rng: self.rng.as_mut(),
                        config: &self.config,
                        last_error: &mut self.last_error,
                    };
                    dispatch(ctx, number)
                };
                // Syscall buffer traffic is visible to watchpoints too
                self.last_accesses.extend(self.mem.drain_accesses());
                match result {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        self.state = VmState::Error;
                        return Err(error);
                    }
                }
            }
        };

        // Observers see the instruction and its effects by value
        self.emit(&TraceEvent::Exec { addr: pc, opcode });
        let accesses: Vec<MemAccess> = self.last_accesses.clone();
        for access in accesses {
            self.emit(&TraceEvent::Mem(access));
        }
        let regs_after = self.cpu.regs.raw();
        for (i, (before, after)) in regs_before.iter().zip(regs_after.iter()).enumerate() {
            if before != after {
                self.emit(&TraceEvent::RegWrite {
                    reg: i as u8,
                    value: *after,
                });
            }
        }
        if flags_before != self.cpu.regs.cpsr {
            let flags = self.cpu.regs.cpsr;
            self.emit(&TraceEvent::Flags(flags));
        }

        match outcome {
            SyscallOutcome::Continue => Ok(StepEvent::Continue),
            SyscallOutcome::Halt(code) => {
                self.state = VmState::Halted(code);
                Ok(StepEvent::Halted(code))
            }
            SyscallOutcome::Break => {
                self.state = VmState::Paused;
                Ok(StepEvent::DebugBreak)
            }
        }
    }

    /// Run until halt, pause, or a fatal error. The pause flag and the
    /// wall clock are checked between instructions only.
    pub fn run(&mut self) -> Result<RunEvent, VmError> {
        if let VmState::Halted(code) = self.state {
            return Ok(RunEvent::Halted(code));
        }
        self.state = VmState::Running;
        loop {
            if self.pause_flag.swap(false, Ordering::AcqRel) {
                self.state = VmState::Paused;
                return Ok(RunEvent::Paused);
            }
            if self.config.wall_clock_ms > 0
                && self.cycles % WALL_CLOCK_STRIDE == 0
                && self.clock.now_ms() > self.config.wall_clock_ms
            {
                self.state = VmState::Error;
                return Err(VmError::WallClockTimeout);
            }
            match self.step()? {
                StepEvent::Continue => {}
                StepEvent::Halted(code) => return Ok(RunEvent::Halted(code)),
                StepEvent::DebugBreak => return Ok(RunEvent::DebugBreak),
            }
        }
    }

    /// `pause` followed by the halted state: the cooperative stop.
    pub fn stop(&mut self) {
        self.pause_flag.store(true, Ordering::Release);
        self.io.close_stdin();
        self.state = VmState::Halted(0);
    }

    /// Guest-visible errno side channel (reset by GET_ERROR).
    #[must_use]
    pub const fn last_error(&self) -> u32 {
        self.last_error
    }

    /// Wall-clock budget check, for drivers that run the instruction
    /// loop themselves (the debugger's continue).
    #[must_use]
    pub fn wall_clock_exceeded(&self) -> bool {
        self.config.wall_clock_ms > 0 && self.clock.now_ms() > self.config.wall_clock_ms
    }

    /// True when the pause flag was raised; clears it.
    #[must_use]
    pub fn take_pause_request(&mut self) -> bool {
        self.pause_flag.swap(false, Ordering::AcqRel)
    }
}
