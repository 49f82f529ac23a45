//! The instruction executor.
//!
//! One [`step`](Cpu::step) fetches, decodes, and retires exactly one
//! instruction against a [`Bus`]. The executor is non-suspending: every
//! suspension point (debugger, syscalls, pausing) sits *between* steps.

use arm2_core::{Bus, ExecEvent, MemFault};

use crate::decode::decode;
use crate::instr::{
    AluOp, BlockMode, HalfOffset, Instr, Operand2, RegList, TransferOffset,
};
use crate::registers::{LR, PC, Registers};
use crate::shifter::shift;

/// A fatal execution fault. Recoverable only from the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFault {
    Mem(MemFault),
    Undefined { addr: u32, opcode: u32 },
}

impl std::fmt::Display for CpuFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mem(fault) => write!(f, "memory fault: {fault}"),
            Self::Undefined { addr, opcode } => {
                write!(f, "undefined instruction {opcode:#010X} at {addr:#010X}")
            }
        }
    }
}

impl std::error::Error for CpuFault {}

impl From<MemFault> for CpuFault {
    fn from(fault: MemFault) -> Self {
        Self::Mem(fault)
    }
}

/// `a + b + carry_in`, returning `(result, carry_out, overflow)`.
///
/// Subtraction goes through here as `a + !b + 1` (and SBC as `a + !b + c`),
/// which makes the ARM borrow convention fall out naturally: C is set
/// exactly when no borrow occurred.
fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let sum = u64::from(a) + u64::from(b) + u64::from(carry_in);
    let result = sum as u32;
    let carry = sum > u64::from(u32::MAX);
    let overflow = (a ^ result) & (b ^ result) & 0x8000_0000 != 0;
    (result, carry, overflow)
}

/// The ARM2 CPU.
#[derive(Debug, Clone, Default)]
pub struct Cpu {
    pub regs: Registers,
    /// Set when the executing instruction wrote R15; suppresses the
    /// PC+4 advance so `B .` spins in place instead of falling through.
    pc_written: bool,
}

impl Cpu {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: Registers::new(),
            pc_written: false,
        }
    }

    /// Reset registers and flags to power-on state. PC is the loader's
    /// business.
    pub fn reset(&mut self) {
        self.regs = Registers::new();
        self.pc_written = false;
    }

    /// Execute one instruction.
    ///
    /// A condition that fails still advances PC and counts as one step.
    /// On `Err` the PC is left at the faulting instruction so the
    /// debugger can inspect it.
    pub fn step<B: Bus>(&mut self, bus: &mut B) -> Result<ExecEvent, CpuFault> {
        // Writes to R15 re-align before the next fetch
        let pc = self.regs.pc() & !3;
        self.regs.set_pc(pc);

        let opcode = bus.fetch_word(pc)?;
        let instr =
            decode(opcode).map_err(|_| CpuFault::Undefined { addr: pc, opcode })?;

        if !instr.cond().passes(&self.regs.cpsr) {
            self.regs.set_pc(pc.wrapping_add(4));
            return Ok(ExecEvent::Continue);
        }

        self.pc_written = false;
        let event = self.execute(bus, instr)?;
        if !self.pc_written {
            self.regs.set_pc(pc.wrapping_add(4));
        }
        Ok(event)
    }

    fn write_reg(&mut self, n: u8, value: u32) {
        if n == PC {
            self.pc_written = true;
        }
        self.regs.set(n, value);
    }

    fn execute<B: Bus>(&mut self, bus: &mut B, instr: Instr) -> Result<ExecEvent, CpuFault> {
        match instr {
            Instr::DataProc {
                op, s, rd, rn, op2, ..
            } => {
                self.data_proc(op, s, rd, rn, op2);
                Ok(ExecEvent::Continue)
            }
            Instr::Multiply {
                accumulate,
                s,
                rd,
                rm,
                rs,
                rn,
                ..
            } => {
                let mut result = self.regs.get(rm).wrapping_mul(self.regs.get(rs));
                if accumulate {
                    result = result.wrapping_add(self.regs.get(rn));
                }
                self.write_reg(rd, result);
                if s {
                    // C and V are unaffected by multiply
                    self.regs.cpsr.set_nz(result);
                }
                Ok(ExecEvent::Continue)
            }
            Instr::SingleTransfer {
                load,
                byte,
                pre,
                up,
                writeback,
                rd,
                rn,
                offset,
                ..
            } => {
                let offset = match offset {
                    TransferOffset::Imm(v) => u32::from(v),
                    TransferOffset::Reg { rm, op, amount } => {
                        shift(self.regs.get(rm), op, u32::from(amount), self.regs.cpsr.c).0
                    }
                };
                self.transfer(bus, load, byte, false, pre, up, writeback, rd, rn, offset)?;
                Ok(ExecEvent::Continue)
            }
            Instr::HalfTransfer {
                load,
                pre,
                up,
                writeback,
                rd,
                rn,
                offset,
                ..
            } => {
                let offset = match offset {
                    HalfOffset::Imm(v) => u32::from(v),
                    HalfOffset::Reg(rm) => self.regs.get(rm),
                };
                self.transfer(bus, load, false, true, pre, up, writeback, rd, rn, offset)?;
                Ok(ExecEvent::Continue)
            }
            Instr::BlockTransfer {
                load,
                mode,
                writeback,
                rn,
                regs,
                ..
            } => {
                self.block_transfer(bus, load, mode, writeback, rn, regs)?;
                Ok(ExecEvent::Continue)
            }
            Instr::Branch { link, offset, .. } => {
                let target = self.regs.get(PC).wrapping_add(offset as u32);
                if link {
                    let ret = self.regs.pc().wrapping_add(4);
                    self.write_reg(LR, ret);
                }
                self.write_reg(PC, target);
                Ok(ExecEvent::Continue)
            }
            Instr::BranchExchange { rm, .. } => {
                let target = self.regs.get(rm) & !1;
                self.write_reg(PC, target);
                Ok(ExecEvent::Continue)
            }
            Instr::Swi { imm, .. } => Ok(ExecEvent::Swi(imm)),
        }
    }

    fn data_proc(&mut self, op: AluOp, s: bool, rd: u8, rn: u8, op2: Operand2) {
        let (b, shifter_carry) = self.eval_operand2(op2);
        let a = self.regs.get(rn);
        let c = self.regs.cpsr.c;

        // Arithmetic ops report (result, carry, overflow); logical ops
        // take carry from the shifter and leave V alone.
        let (result, carry, overflow) = match op {
            AluOp::And | AluOp::Tst => (a & b, false, false),
            AluOp::Eor | AluOp::Teq => (a ^ b, false, false),
            AluOp::Orr => (a | b, false, false),
            AluOp::Bic => (a & !b, false, false),
            AluOp::Mov => (b, false, false),
            AluOp::Mvn => (!b, false, false),
            AluOp::Add | AluOp::Cmn => add_with_carry(a, b, false),
            AluOp::Adc => add_with_carry(a, b, c),
            AluOp::Sub | AluOp::Cmp => add_with_carry(a, !b, true),
            AluOp::Sbc => add_with_carry(a, !b, c),
            AluOp::Rsb => add_with_carry(b, !a, true),
            AluOp::Rsc => add_with_carry(b, !a, c),
        };

        if !op.is_compare() {
            self.write_reg(rd, result);
        }

        if s || op.is_compare() {
            if rd == PC && !op.is_compare() {
                // S-bit writes to R15 would restore SPSR on a privileged
                // ARM2; this machine has no SPSR, so flags are untouched.
                // The encoder rejects the form; only hand-built opcodes
                // reach here.
                return;
            }
            self.regs.cpsr.set_nz(result);
            if op.is_logical() {
                self.regs.cpsr.c = shifter_carry;
            } else {
                self.regs.cpsr.c = carry;
                self.regs.cpsr.v = overflow;
            }
        }
    }

    fn eval_operand2(&self, op2: Operand2) -> (u32, bool) {
        let carry_in = self.regs.cpsr.c;
        match op2 {
            Operand2::Imm { value, rotate } => {
                let v = Operand2::imm_value(value, rotate);
                let carry = if rotate == 0 {
                    carry_in
                } else {
                    v & 0x8000_0000 != 0
                };
                (v, carry)
            }
            Operand2::RegImm { rm, op, amount } => {
                shift(self.regs.get(rm), op, u32::from(amount), carry_in)
            }
            Operand2::RegReg { rm, op, rs } => {
                // Amount is the low byte; 0 is the identity with C kept
                let amount = self.regs.get(rs) & 0xFF;
                shift(self.regs.get(rm), op, amount, carry_in)
            }
        }
    }

    #[allow(clippy::too_many_arguments)] // the transfer field set is the instruction
    fn transfer<B: Bus>(
        &mut self,
        bus: &mut B,
        load: bool,
        byte: bool,
        half: bool,
        pre: bool,
        up: bool,
        writeback: bool,
        rd: u8,
        rn: u8,
        offset: u32,
    ) -> Result<(), CpuFault> {
        let base = self.regs.get(rn);
        let indexed = if up {
            base.checked_add(offset)
                .ok_or(MemFault::AddressOverflow(base))?
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if pre { indexed } else { base };
        let update_base = !pre || writeback;

        if load {
            let value = if byte {
                u32::from(bus.read_byte(addr)?)
            } else if half {
                u32::from(bus.read_half(addr)?)
            } else {
                bus.read_word(addr)?
            };
            if update_base {
                self.write_reg(rn, indexed);
            }
            // When rd == rn the loaded value wins over the writeback
            self.write_reg(rd, value);
        } else {
            let value = self.regs.get(rd);
            if byte {
                bus.write_byte(addr, value as u8)?;
            } else if half {
                bus.write_half(addr, value as u16)?;
            } else {
                bus.write_word(addr, value)?;
            }
            if update_base {
                self.write_reg(rn, indexed);
            }
        }
        Ok(())
    }

    fn block_transfer<B: Bus>(
        &mut self,
        bus: &mut B,
        load: bool,
        mode: BlockMode,
        writeback: bool,
        rn: u8,
        regs: RegList,
    ) -> Result<(), CpuFault> {
        let base = self.regs.get(rn);
        let bytes = 4 * regs.count();

        // Registers are always transferred low-to-high from the lowest
        // address, whatever the mode; only the window placement differs.
        let start = match mode {
            BlockMode::Ia => base,
            BlockMode::Ib => base.wrapping_add(4),
            BlockMode::Da => base.wrapping_sub(bytes).wrapping_add(4),
            BlockMode::Db => base.wrapping_sub(bytes),
        };
        let new_base = if mode.up() {
            base.checked_add(bytes)
                .ok_or(MemFault::AddressOverflow(base))?
        } else {
            base.wrapping_sub(bytes)
        };

        let mut addr = start;
        if load {
            for r in regs.iter() {
                let value = bus.read_word(addr)?;
                self.write_reg(r, value);
                addr = addr.wrapping_add(4);
            }
            // A loaded base wins over writeback
            if writeback && !regs.contains(rn) {
                self.write_reg(rn, new_base);
            }
        } else {
            for r in regs.iter() {
                // Values read before writeback: the stored base is the
                // original one
                bus.write_word(addr, self.regs.get(r))?;
                addr = addr.wrapping_add(4);
            }
            if writeback {
                self.write_reg(rn, new_base);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::SP;
    use arm2_core::FlatBus;

    fn cpu_at(pc: u32) -> Cpu {
        let mut cpu = Cpu::new();
        cpu.regs.set_pc(pc);
        cpu
    }

    fn step_one(cpu: &mut Cpu, bus: &mut FlatBus) -> ExecEvent {
        cpu.step(bus).expect("step should not fault")
    }

    #[test]
    fn adds_overflow_boundary() {
        // ADDS R2, R1, #1 with R1 = 0x7FFFFFFF
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE291_2001]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(1, 0x7FFF_FFFF);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(2), 0x8000_0000);
        let f = cpu.regs.cpsr;
        assert!(f.n && f.v && !f.c && !f.z, "flags were {f}");
    }

    #[test]
    fn subs_borrow_boundary() {
        // SUBS R0, R1, #1 with R1 = 0
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE251_0001]);
        let mut cpu = cpu_at(0x100);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 0xFFFF_FFFF);
        let f = cpu.regs.cpsr;
        assert!(f.n && !f.v && !f.c && !f.z, "borrow clears C; flags were {f}");
    }

    #[test]
    fn movs_lsr_32() {
        // MOVS R0, R1, LSR #32 (encoded as LSR #0)
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE1B0_0021]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(1, 0x8000_0001);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 0);
        assert!(cpu.regs.cpsr.c, "C takes bit 31 of R1");
        assert!(cpu.regs.cpsr.z);
    }

    #[test]
    fn mov_rrx() {
        // MOVS R0, R1, RRX with C set
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE1B0_0061]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.cpsr.c = true;
        cpu.regs.set(1, 0x0000_0002);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 0x8000_0001);
        assert!(!cpu.regs.cpsr.c, "C takes bit 0 of R1");
    }

    #[test]
    fn ldr_address_overflow_faults() {
        // LDR R0, [R1, #4] with R1 = 0xFFFFFFFE
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE591_0004]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(1, 0xFFFF_FFFE);
        let err = cpu.step(&mut bus).expect_err("must fault");
        assert_eq!(err, CpuFault::Mem(MemFault::AddressOverflow(0xFFFF_FFFE)));
        assert_eq!(cpu.regs.pc(), 0x100, "PC stays at the faulting instruction");
    }

    #[test]
    fn condition_failure_is_one_step() {
        // MOVEQ R0, #1 with Z clear: only PC moves
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0x03A0_0001]);
        let mut cpu = cpu_at(0x100);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 0);
        assert_eq!(cpu.regs.pc(), 0x104);
    }

    #[test]
    fn branch_link_and_return() {
        // 0x100: BL 0x200 ; at 0x200: MOV PC, LR
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xEB00_003E]);
        bus.load_words(0x200, &[0xE1A0_F00E]);
        let mut cpu = cpu_at(0x100);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.pc(), 0x200, "branched");
        assert_eq!(cpu.regs.get(LR), 0x104, "LR holds the return address");
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.pc(), 0x104, "returned");
    }

    #[test]
    fn branch_to_self_spins() {
        // B . : offset -8, target == own address
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xEAFF_FFFE]);
        let mut cpu = cpu_at(0x100);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.pc(), 0x100, "B . must not fall through");
    }

    #[test]
    fn str_of_pc_stores_pipelined_value() {
        // STR PC, [R1] at 0x100: stores 0x108
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE581_F000]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(1, 0x1000);
        step_one(&mut cpu, &mut bus);
        assert_eq!(bus.read_word(0x1000), Ok(0x108));
    }

    #[test]
    fn push_pop_round_trip() {
        // STMDB SP!, {R0, R1, LR} then LDMIA SP!, {R2, R3, R4}
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE92D_4003, 0xE8BD_001C]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(SP, 0x2000);
        cpu.regs.set(0, 0xAAAA_0000);
        cpu.regs.set(1, 0xBBBB_0000);
        cpu.regs.set(LR, 0xCCCC_0000);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(SP), 0x1FF4, "descending push of 3 words");
        assert_eq!(bus.read_word(0x1FF4), Ok(0xAAAA_0000), "lowest reg, lowest addr");
        assert_eq!(bus.read_word(0x1FFC), Ok(0xCCCC_0000));
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(SP), 0x2000);
        assert_eq!(cpu.regs.get(2), 0xAAAA_0000);
        assert_eq!(cpu.regs.get(4), 0xCCCC_0000);
    }

    #[test]
    fn mul_leaves_c_and_v() {
        // MULS R0, R1, R2
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE010_0291]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.cpsr.c = true;
        cpu.regs.cpsr.v = true;
        cpu.regs.set(1, 6);
        cpu.regs.set(2, 7);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 42);
        assert!(cpu.regs.cpsr.c && cpu.regs.cpsr.v, "C and V unaffected");
        assert!(!cpu.regs.cpsr.n && !cpu.regs.cpsr.z);
    }

    #[test]
    fn swi_surfaces_event_and_advances() {
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xEF00_0000]);
        let mut cpu = cpu_at(0x100);
        assert_eq!(step_one(&mut cpu, &mut bus), ExecEvent::Swi(0));
        assert_eq!(cpu.regs.pc(), 0x104, "resumes at the next instruction");
    }

    #[test]
    fn post_indexed_updates_base() {
        // LDR R0, [R1], #4
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE491_0004]);
        bus.load_words(0x1000, &[0x1234_5678]);
        let mut cpu = cpu_at(0x100);
        cpu.regs.set(1, 0x1000);
        step_one(&mut cpu, &mut bus);
        assert_eq!(cpu.regs.get(0), 0x1234_5678, "loaded from the old base");
        assert_eq!(cpu.regs.get(1), 0x1004, "base stepped afterwards");
    }

    #[test]
    fn undefined_instruction_faults_with_opcode() {
        let mut bus = FlatBus::new();
        bus.load_words(0x100, &[0xE700_0010]); // register transfer with bit 4 set
        let mut cpu = cpu_at(0x100);
        match cpu.step(&mut bus) {
            Err(CpuFault::Undefined { addr, opcode }) => {
                assert_eq!(addr, 0x100);
                assert_eq!(opcode, 0xE700_0010);
            }
            other => panic!("expected undefined fault, got {other:?}"),
        }
    }
}
