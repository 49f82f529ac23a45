//! The debugger core.
//!
//! Holds the VM (single owner, no cycles) and drives it through the
//! fixed frontend operation set: load/reset/restart, the four stepping
//! modes, breakpoint and watchpoint management, expression evaluation,
//! memory/register inspection, and guest I/O plumbing. Frontends (CLI,
//! TUI, GUI, HTTP) render; this core never prints.

use std::collections::HashMap;

use acorn_arm2::{Cpsr, Instr, decode};
use arm2_asm::Program;
use arm2_core::{AccessKind, MemFault};
use arm2_vm::{LoadError, STACK_TOP, StepEvent, Vm, VmError, VmState, load};

use crate::breakpoints::{Breakpoint, BreakpointStore, WatchKind, Watchpoint, WatchpointStore};
use crate::expr::{EvalContext, EvalError, evaluate};

/// Why control returned to the frontend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// A step completed (condition-failed fall-through included).
    Step,
    BreakpointAt { addr: u32, id: u32 },
    WatchpointHit { addr: u32, kind: AccessKind, id: u32 },
    /// The guest executed the DEBUG_BREAK helper.
    DebugBreak,
    /// The pause flag was honoured between instructions.
    Paused,
    Halted(u8),
    CycleLimit,
    WallClockTimeout,
    UndefinedInstruction(u32),
    MemoryFault { addr: u32, fault: MemFault },
    /// Remaining fatal classes (unknown syscall, guest assertion, ...).
    Fatal(String),
}

impl StopReason {
    /// Stops that leave the machine inspectable but finished.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::CycleLimit
                | Self::WallClockTimeout
                | Self::UndefinedInstruction(_)
                | Self::MemoryFault { .. }
                | Self::Fatal(_)
        )
    }
}

/// The debugger. Owns the VM; observers get copies, never references.
pub struct Debugger {
    vm: Vm,
    breakpoints: BreakpointStore,
    watchpoints: WatchpointStore,
    /// `$N` targets; only interactive `evaluate` appends.
    history: Vec<u32>,
    symbols: HashMap<String, u32>,
    source_map: HashMap<u32, String>,
    entry: u32,
    program: Option<Program>,
}

impl Debugger {
    #[must_use]
    pub fn new(vm: Vm) -> Self {
        Self {
            vm,
            breakpoints: BreakpointStore::new(),
            watchpoints: WatchpointStore::new(),
            history: Vec::new(),
            symbols: HashMap::new(),
            source_map: HashMap::new(),
            entry: 0,
            program: None,
        }
    }

    /// Load a program, capturing its symbol and source maps. Both maps
    /// are read-only from here on.
    pub fn load(&mut self, program: Program) -> Result<u32, LoadError> {
        let entry = load(&mut self.vm, &program)?;
        self.entry = entry;
        self.symbols = program
            .symbols
            .iter()
            .map(|(name, sym)| (name.to_string(), sym.value))
            .collect();
        self.source_map = program.source_map.clone();
        self.program = Some(program);
        Ok(entry)
    }

    /// Reset CPU state to the entry point. Memory keeps whatever the
    /// run wrote; use [`restart`](Self::restart) for a fresh image.
    pub fn reset(&mut self) {
        self.vm.reset();
        self.vm.cpu.regs.set_pc(self.entry);
        self.vm.cpu.regs.set(13, STACK_TOP);
    }

    /// Reset and re-place the program image.
    pub fn restart(&mut self) -> Result<u32, LoadError> {
        self.vm.reset();
        match self.program.clone() {
            Some(program) => {
                let entry = load(&mut self.vm, &program)?;
                Ok(entry)
            }
            None => {
                self.vm.cpu.regs.set_pc(self.entry);
                Ok(self.entry)
            }
        }
    }

    // -- stepping -----------------------------------------------------

    /// Execute exactly one instruction.
    pub fn step(&mut self) -> StopReason {
        self.step_once().unwrap_or(StopReason::Step)
    }

    /// Like step, but a BL runs to its return address.
    pub fn step_over(&mut self) -> StopReason {
        let pc = self.vm.cpu.regs.pc();
        let is_call = self
            .vm
            .mem
            .peek_word(pc & !3)
            .and_then(|word| decode(word).ok())
            .is_some_and(|instr| matches!(instr, Instr::Branch { link: true, .. }));
        if is_call {
            self.breakpoints.add(pc.wrapping_add(4), None, true);
            self.continue_run()
        } else {
            self.step()
        }
    }

    /// Run until the current function returns (PC reaches the LR
    /// recorded at entry to this operation).
    pub fn step_out(&mut self) -> StopReason {
        let lr = self.vm.cpu.regs.get(14) & !3;
        self.breakpoints.add(lr, None, true);
        self.continue_run()
    }

    /// Run until a breakpoint, watchpoint, fatal event, halt, or pause.
    ///
    /// Breakpoints are checked *before* executing each instruction;
    /// the instruction currently under the PC always runs first, so a
    /// continue from a breakpoint makes progress.
    pub fn continue_run(&mut self) -> StopReason {
        if matches!(self.vm.state(), VmState::Idle | VmState::Paused) {
            self.vm.set_state(VmState::Running);
        }
        let mut first = true;
        loop {
            if self.vm.take_pause_request() {
                self.vm.set_state(VmState::Paused);
                self.breakpoints.clear_one_shots();
                return StopReason::Paused;
            }
            if self.vm.wall_clock_exceeded() {
                self.vm.set_state(VmState::Error);
                self.breakpoints.clear_one_shots();
                return StopReason::WallClockTimeout;
            }
            if !first {
                let pc = self.vm.cpu.regs.pc();
                let hit = self
                    .breakpoints
                    .enabled_at(pc)
                    .map(|b| (b.id, b.one_shot, b.condition.clone()));
                if let Some((id, one_shot, condition)) = hit {
                    // Conditions run side-effect-free: no history entry
                    if self.condition_true(condition.as_deref()) {
                        self.breakpoints.record_hit(id);
                        self.breakpoints.clear_one_shots();
                        self.vm.set_state(VmState::Paused);
                        return if one_shot {
                            // Internal step-over/step-out stop
                            StopReason::Step
                        } else {
                            StopReason::BreakpointAt { addr: pc, id }
                        };
                    }
                }
            }
            first = false;
            if let Some(reason) = self.step_once() {
                self.breakpoints.clear_one_shots();
                return reason;
            }
        }
    }

    /// Raise the pause flag (safe from another thread via
    /// [`pause_handle`](Self::pause_handle)).
    pub fn pause(&mut self) {
        self.vm
            .pause_handle()
            .store(true, std::sync::atomic::Ordering::Release);
    }

    #[must_use]
    pub fn pause_handle(&self) -> std::sync::Arc<std::sync::atomic::AtomicBool> {
        self.vm.pause_handle()
    }

    /// Pause and transition to halted.
    pub fn stop(&mut self) {
        self.vm.stop();
    }

    fn step_once(&mut self) -> Option<StopReason> {
        match self.vm.step() {
            Ok(StepEvent::Continue) => self.check_watchpoints(),
            Ok(StepEvent::Halted(code)) => Some(StopReason::Halted(code)),
            Ok(StepEvent::DebugBreak) => Some(StopReason::DebugBreak),
            Err(error) => Some(Self::map_error(&error)),
        }
    }

    fn map_error(error: &VmError) -> StopReason {
        match error {
            VmError::Cpu(acorn_arm2::CpuFault::Mem(fault)) | VmError::Memory(fault) => {
                StopReason::MemoryFault {
                    addr: fault.address(),
                    fault: *fault,
                }
            }
            VmError::Cpu(acorn_arm2::CpuFault::Undefined { addr, .. }) => {
                StopReason::UndefinedInstruction(*addr)
            }
            VmError::CycleLimit => StopReason::CycleLimit,
            VmError::WallClockTimeout => StopReason::WallClockTimeout,
            other => StopReason::Fatal(other.to_string()),
        }
    }

    /// Watchpoints fire on the drained access log of the last step,
    /// filtered by their access-kind set.
    fn check_watchpoints(&mut self) -> Option<StopReason> {
        let accesses = self.vm.last_accesses().to_vec();
        for access in accesses {
            let mut hit = None;
            for wp in self.watchpoints.iter() {
                if wp.triggered_by(&access) && self.condition_true(wp.condition.as_deref()) {
                    hit = Some(wp.id);
                    break;
                }
            }
            if let Some(id) = hit {
                self.watchpoints.record_hit(id);
                self.vm.set_state(VmState::Paused);
                return Some(StopReason::WatchpointHit {
                    addr: access.addr,
                    kind: access.kind,
                    id,
                });
            }
        }
        None
    }

    // -- breakpoints --------------------------------------------------

    pub fn add_breakpoint(&mut self, addr: u32, condition: Option<String>) -> u32 {
        self.breakpoints.add(addr, condition, false)
    }

    pub fn remove_breakpoint(&mut self, id: u32) -> bool {
        self.breakpoints.remove(id)
    }

    #[must_use]
    pub fn list_breakpoints(&self) -> &[Breakpoint] {
        self.breakpoints.list()
    }

    pub fn set_breakpoint_enabled(&mut self, id: u32, enabled: bool) -> bool {
        self.breakpoints.set_enabled(id, enabled)
    }

    pub fn add_watchpoint(
        &mut self,
        addr: u32,
        len: u32,
        kind: WatchKind,
        condition: Option<String>,
    ) -> u32 {
        self.watchpoints.add(addr, len, kind, condition)
    }

    pub fn remove_watchpoint(&mut self, id: u32) -> bool {
        self.watchpoints.remove(id)
    }

    #[must_use]
    pub fn list_watchpoints(&self) -> &[Watchpoint] {
        self.watchpoints.list()
    }

    // -- expressions --------------------------------------------------

    /// Interactive evaluation: the result joins the `$N` history.
    pub fn evaluate(&mut self, text: &str) -> Result<u32, EvalError> {
        let value = self.eval_quiet(text)?;
        self.history.push(value);
        Ok(value)
    }

    /// Side-effect-free evaluation (breakpoint conditions).
    pub fn eval_quiet(&self, text: &str) -> Result<u32, EvalError> {
        let ctx = EvalContext {
            regs: &self.vm.cpu.regs,
            mem: &self.vm.mem,
            symbols: &self.symbols,
            history: &self.history,
        };
        evaluate(text, &ctx)
    }

    fn condition_true(&self, condition: Option<&str>) -> bool {
        match condition {
            None => true,
            // A broken condition never fires; the frontend can probe it
            // with evaluate() to see why
            Some(text) => self.eval_quiet(text).is_ok_and(|v| v != 0),
        }
    }

    #[must_use]
    pub fn history(&self) -> &[u32] {
        &self.history
    }

    // -- inspection ---------------------------------------------------

    /// Raw register snapshot plus flags.
    #[must_use]
    pub fn get_registers(&self) -> ([u32; 16], Cpsr) {
        (self.vm.cpu.regs.raw(), self.vm.cpu.regs.cpsr)
    }

    /// Side-effect-free memory read.
    #[must_use]
    pub fn read_memory(&self, addr: u32, len: u32) -> Option<Vec<u8>> {
        self.vm.mem.peek_bytes(addr, len)
    }

    /// Disassemble `count` words from `addr`. Undecodable words render
    /// as `.word`, unmapped ones stop the listing.
    #[must_use]
    pub fn disassemble(&self, addr: u32, count: u32) -> Vec<(u32, String)> {
        let mut out = Vec::new();
        let mut cursor = addr & !3;
        for _ in 0..count {
            let Some(word) = self.vm.mem.peek_word(cursor) else {
                break;
            };
            let text = match decode(word) {
                Ok(instr) => instr.disassemble(cursor),
                Err(_) => format!(".word {word:#010X}"),
            };
            out.push((cursor, text));
            cursor = cursor.wrapping_add(4);
        }
        out
    }

    /// The source line that produced the instruction at `addr`.
    #[must_use]
    pub fn source_line(&self, addr: u32) -> Option<&str> {
        self.source_map.get(&addr).map(String::as_str)
    }

    /// Look up a symbol's address.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<u32> {
        self.symbols.get(name).copied()
    }

    // -- guest I/O ----------------------------------------------------

    pub fn send_stdin(&mut self, bytes: &[u8]) {
        self.vm.io.send_stdin(bytes);
    }

    pub fn drain_stdout(&mut self) -> Vec<u8> {
        self.vm.io.drain_stdout()
    }

    // -- machine access -----------------------------------------------

    #[must_use]
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}
