//! Decoded instruction model and disassembly.
//!
//! [`Instr`] is a closed sum over the ARM2 instruction classes; dispatch
//! is always a `match` on decoded fields, never dynamic. The text
//! rendering here is the debugger's disassembler and is written to
//! round-trip through the assembler's parser.

use std::fmt;
use std::fmt::Write as _;

use crate::flags::Cond;

/// Barrel shifter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
    Ror,
    /// Rotate right extended: one bit through carry. Encoded as ROR #0.
    Rrx,
}

impl ShiftOp {
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Lsl => "LSL",
            Self::Lsr => "LSR",
            Self::Asr => "ASR",
            Self::Ror => "ROR",
            Self::Rrx => "RRX",
        }
    }

    /// The 2-bit shift-type field (RRX shares ROR's encoding).
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Lsl => 0b00,
            Self::Lsr => 0b01,
            Self::Asr => 0b10,
            Self::Ror | Self::Rrx => 0b11,
        }
    }
}

/// Data-processing ALU operation, in encoding order (bits 24-21).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
}

impl AluOp {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0xF {
            0x0 => Self::And,
            0x1 => Self::Eor,
            0x2 => Self::Sub,
            0x3 => Self::Rsb,
            0x4 => Self::Add,
            0x5 => Self::Adc,
            0x6 => Self::Sbc,
            0x7 => Self::Rsc,
            0x8 => Self::Tst,
            0x9 => Self::Teq,
            0xA => Self::Cmp,
            0xB => Self::Cmn,
            0xC => Self::Orr,
            0xD => Self::Mov,
            0xE => Self::Bic,
            _ => Self::Mvn,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::And => 0x0,
            Self::Eor => 0x1,
            Self::Sub => 0x2,
            Self::Rsb => 0x3,
            Self::Add => 0x4,
            Self::Adc => 0x5,
            Self::Sbc => 0x6,
            Self::Rsc => 0x7,
            Self::Tst => 0x8,
            Self::Teq => 0x9,
            Self::Cmp => 0xA,
            Self::Cmn => 0xB,
            Self::Orr => 0xC,
            Self::Mov => 0xD,
            Self::Bic => 0xE,
            Self::Mvn => 0xF,
        }
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Eor => "EOR",
            Self::Sub => "SUB",
            Self::Rsb => "RSB",
            Self::Add => "ADD",
            Self::Adc => "ADC",
            Self::Sbc => "SBC",
            Self::Rsc => "RSC",
            Self::Tst => "TST",
            Self::Teq => "TEQ",
            Self::Cmp => "CMP",
            Self::Cmn => "CMN",
            Self::Orr => "ORR",
            Self::Mov => "MOV",
            Self::Bic => "BIC",
            Self::Mvn => "MVN",
        }
    }

    /// TST/TEQ/CMP/CMN: no destination, flags always written.
    #[must_use]
    pub const fn is_compare(self) -> bool {
        matches!(self, Self::Tst | Self::Teq | Self::Cmp | Self::Cmn)
    }

    /// MOV/MVN take no first operand.
    #[must_use]
    pub const fn ignores_rn(self) -> bool {
        matches!(self, Self::Mov | Self::Mvn)
    }

    /// Logical ops take C from the shifter and leave V alone.
    #[must_use]
    pub const fn is_logical(self) -> bool {
        matches!(
            self,
            Self::And
                | Self::Eor
                | Self::Tst
                | Self::Teq
                | Self::Orr
                | Self::Mov
                | Self::Bic
                | Self::Mvn
        )
    }
}

/// Second operand of a data-processing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand2 {
    /// 8-bit value rotated right by `2 * rotate`.
    Imm { value: u8, rotate: u8 },
    /// Register shifted by an immediate *semantic* amount: 0-31 for LSL,
    /// 1-32 for LSR/ASR (the encoded 0 already mapped), 1-31 for ROR.
    RegImm { rm: u8, op: ShiftOp, amount: u8 },
    /// Register shifted by the low byte of another register.
    RegReg { rm: u8, op: ShiftOp, rs: u8 },
}

impl Operand2 {
    /// The constant an `Imm` operand denotes.
    #[must_use]
    pub fn imm_value(value: u8, rotate: u8) -> u32 {
        // rotate 0 is the identity; rotate_right(0) is defined but spell
        // the branch out so the edge contract is visible
        if rotate == 0 {
            u32::from(value)
        } else {
            u32::from(value).rotate_right(2 * u32::from(rotate))
        }
    }
}

/// Offset of a word/byte single transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOffset {
    /// 12-bit unsigned immediate (direction is the U bit).
    Imm(u16),
    /// Register scaled by an immediate shift.
    Reg { rm: u8, op: ShiftOp, amount: u8 },
}

/// Offset of a halfword transfer (no scaled-register form).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfOffset {
    /// 8-bit immediate, split across the high/low nibble fields.
    Imm(u8),
    Reg(u8),
}

/// Block-transfer addressing mode (the P and U bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// Increment after.
    Ia,
    /// Increment before.
    Ib,
    /// Decrement after.
    Da,
    /// Decrement before.
    Db,
}

impl BlockMode {
    #[must_use]
    pub const fn pre(self) -> bool {
        matches!(self, Self::Ib | Self::Db)
    }

    #[must_use]
    pub const fn up(self) -> bool {
        matches!(self, Self::Ia | Self::Ib)
    }

    #[must_use]
    pub const fn from_pu(pre: bool, up: bool) -> Self {
        match (pre, up) {
            (false, true) => Self::Ia,
            (true, true) => Self::Ib,
            (false, false) => Self::Da,
            (true, false) => Self::Db,
        }
    }

    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Ia => "IA",
            Self::Ib => "IB",
            Self::Da => "DA",
            Self::Db => "DB",
        }
    }
}

/// A 16-bit register list for LDM/STM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegList(pub u16);

impl RegList {
    #[must_use]
    pub const fn contains(self, n: u8) -> bool {
        self.0 & (1 << n) != 0
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Registers in ascending order.
    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0u8..16).filter(move |&n| self.contains(n))
    }
}

impl fmt::Display for RegList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        let mut n = 0u8;
        while n < 16 {
            if self.contains(n) {
                let mut end = n;
                while end + 1 < 16 && self.contains(end + 1) {
                    end += 1;
                }
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                if end > n {
                    write!(f, "{}-{}", register_name(n), register_name(end))?;
                } else {
                    write!(f, "{}", register_name(n))?;
                }
                n = end + 1;
            } else {
                n += 1;
            }
        }
        write!(f, "}}")
    }
}

/// Canonical register name (R0-R12, SP, LR, PC).
#[must_use]
pub const fn register_name(n: u8) -> &'static str {
    match n {
        0 => "R0",
        1 => "R1",
        2 => "R2",
        3 => "R3",
        4 => "R4",
        5 => "R5",
        6 => "R6",
        7 => "R7",
        8 => "R8",
        9 => "R9",
        10 => "R10",
        11 => "R11",
        12 => "R12",
        13 => "SP",
        14 => "LR",
        _ => "PC",
    }
}

/// A decoded ARM2 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    DataProc {
        cond: Cond,
        op: AluOp,
        s: bool,
        rd: u8,
        rn: u8,
        op2: Operand2,
    },
    /// MUL / MLA. Note the ARM-specific field layout: Rd sits at bits
    /// 19-16 and Rn at bits 15-12, the *reverse* of data processing.
    Multiply {
        cond: Cond,
        accumulate: bool,
        s: bool,
        rd: u8,
        rm: u8,
        rs: u8,
        rn: u8,
    },
    SingleTransfer {
        cond: Cond,
        load: bool,
        byte: bool,
        pre: bool,
        up: bool,
        writeback: bool,
        rd: u8,
        rn: u8,
        offset: TransferOffset,
    },
    HalfTransfer {
        cond: Cond,
        load: bool,
        pre: bool,
        up: bool,
        writeback: bool,
        rd: u8,
        rn: u8,
        offset: HalfOffset,
    },
    BlockTransfer {
        cond: Cond,
        load: bool,
        mode: BlockMode,
        writeback: bool,
        /// The `^` suffix. An exception-return marker on LDM-with-PC;
        /// a no-op here (no SPSR), kept for faithful disassembly.
        user_bank: bool,
        rn: u8,
        regs: RegList,
    },
    Branch {
        cond: Cond,
        link: bool,
        /// Signed byte offset (already shifted left 2 and sign-extended).
        offset: i32,
    },
    BranchExchange {
        cond: Cond,
        rm: u8,
    },
    Swi {
        cond: Cond,
        imm: u32,
    },
}

impl Instr {
    /// The condition gating this instruction.
    #[must_use]
    pub const fn cond(&self) -> Cond {
        match self {
            Self::DataProc { cond, .. }
            | Self::Multiply { cond, .. }
            | Self::SingleTransfer { cond, .. }
            | Self::HalfTransfer { cond, .. }
            | Self::BlockTransfer { cond, .. }
            | Self::Branch { cond, .. }
            | Self::BranchExchange { cond, .. }
            | Self::Swi { cond, .. } => *cond,
        }
    }

    /// Render assembly text for this instruction at `addr`.
    ///
    /// Branch targets are shown absolute (`addr + 8 + offset`). The
    /// output parses back to the same instruction.
    #[must_use]
    pub fn disassemble(&self, addr: u32) -> String {
        let mut out = String::new();
        // String formatting cannot fail
        let _ = self.render(&mut out, addr);
        out
    }

    fn render(&self, f: &mut String, addr: u32) -> fmt::Result {
        match *self {
            Self::DataProc {
                cond,
                op,
                s,
                rd,
                rn,
                op2,
            } => {
                let s_suffix = if s && !op.is_compare() { "S" } else { "" };
                write!(f, "{}{}{}", op.mnemonic(), cond.suffix(), s_suffix)?;
                if op.is_compare() {
                    write!(f, " {}, ", register_name(rn))?;
                } else if op.ignores_rn() {
                    write!(f, " {}, ", register_name(rd))?;
                } else {
                    write!(f, " {}, {}, ", register_name(rd), register_name(rn))?;
                }
                render_operand2(f, op2)
            }
            Self::Multiply {
                cond,
                accumulate,
                s,
                rd,
                rm,
                rs,
                rn,
            } => {
                let mn = if accumulate { "MLA" } else { "MUL" };
                write!(
                    f,
                    "{}{}{} {}, {}, {}",
                    mn,
                    cond.suffix(),
                    if s { "S" } else { "" },
                    register_name(rd),
                    register_name(rm),
                    register_name(rs),
                )?;
                if accumulate {
                    write!(f, ", {}", register_name(rn))?;
                }
                Ok(())
            }
            Self::SingleTransfer {
                cond,
                load,
                byte,
                pre,
                up,
                writeback,
                rd,
                rn,
                offset,
            } => {
                write!(
                    f,
                    "{}{}{} {}, ",
                    if load { "LDR" } else { "STR" },
                    cond.suffix(),
                    if byte { "B" } else { "" },
                    register_name(rd),
                )?;
                let zero = matches!(offset, TransferOffset::Imm(0));
                if pre {
                    write!(f, "[{}", register_name(rn))?;
                    if !zero {
                        write!(f, ", ")?;
                        render_transfer_offset(f, offset, up)?;
                    }
                    write!(f, "]")?;
                    if writeback {
                        write!(f, "!")?;
                    }
                } else {
                    write!(f, "[{}], ", register_name(rn))?;
                    render_transfer_offset(f, offset, up)?;
                }
                Ok(())
            }
            Self::HalfTransfer {
                cond,
                load,
                pre,
                up,
                writeback,
                rd,
                rn,
                offset,
            } => {
                write!(
                    f,
                    "{}{}H {}, ",
                    if load { "LDR" } else { "STR" },
                    cond.suffix(),
                    register_name(rd),
                )?;
                let zero = matches!(offset, HalfOffset::Imm(0));
                if pre {
                    write!(f, "[{}", register_name(rn))?;
                    if !zero {
                        write!(f, ", ")?;
                        render_half_offset(f, offset, up)?;
                    }
                    write!(f, "]")?;
                    if writeback {
                        write!(f, "!")?;
                    }
                } else {
                    write!(f, "[{}], ", register_name(rn))?;
                    render_half_offset(f, offset, up)?;
                }
                Ok(())
            }
            Self::BlockTransfer {
                cond,
                load,
                mode,
                writeback,
                user_bank,
                rn,
                regs,
            } => {
                write!(
                    f,
                    "{}{}{} {}{}, {}{}",
                    if load { "LDM" } else { "STM" },
                    cond.suffix(),
                    mode.suffix(),
                    register_name(rn),
                    if writeback { "!" } else { "" },
                    regs,
                    if user_bank { "^" } else { "" },
                )
            }
            Self::Branch { cond, link, offset } => {
                let target = addr.wrapping_add(8).wrapping_add(offset as u32);
                write!(
                    f,
                    "B{}{} {:#010X}",
                    if link { "L" } else { "" },
                    cond.suffix(),
                    target
                )
            }
            Self::BranchExchange { cond, rm } => {
                write!(f, "BX{} {}", cond.suffix(), register_name(rm))
            }
            Self::Swi { cond, imm } => {
                write!(f, "SWI{} {:#04X}", cond.suffix(), imm)
            }
        }
    }
}

fn render_operand2(f: &mut String, op2: Operand2) -> fmt::Result {
    match op2 {
        Operand2::Imm { value, rotate } => {
            let v = Operand2::imm_value(value, rotate);
            render_imm(f, v)
        }
        Operand2::RegImm { rm, op, amount } => {
            write!(f, "{}", register_name(rm))?;
            match op {
                ShiftOp::Rrx => write!(f, ", RRX"),
                ShiftOp::Lsl if amount == 0 => Ok(()),
                _ => write!(f, ", {} #{}", op.mnemonic(), amount),
            }
        }
        Operand2::RegReg { rm, op, rs } => {
            write!(
                f,
                "{}, {} {}",
                register_name(rm),
                op.mnemonic(),
                register_name(rs)
            )
        }
    }
}

fn render_imm(f: &mut String, v: u32) -> fmt::Result {
    if v < 10 {
        write!(f, "#{v}")
    } else {
        write!(f, "#{v:#X}")
    }
}

fn render_transfer_offset(f: &mut String, offset: TransferOffset, up: bool) -> fmt::Result {
    let sign = if up { "" } else { "-" };
    match offset {
        TransferOffset::Imm(v) => write!(f, "#{sign}{v}"),
        TransferOffset::Reg { rm, op, amount } => {
            write!(f, "{sign}{}", register_name(rm))?;
            match op {
                ShiftOp::Rrx => write!(f, ", RRX"),
                ShiftOp::Lsl if amount == 0 => Ok(()),
                _ => write!(f, ", {} #{}", op.mnemonic(), amount),
            }
        }
    }
}

fn render_half_offset(f: &mut String, offset: HalfOffset, up: bool) -> fmt::Result {
    let sign = if up { "" } else { "-" };
    match offset {
        HalfOffset::Imm(v) => write!(f, "#{sign}{v}"),
        HalfOffset::Reg(rm) => write!(f, "{sign}{}", register_name(rm)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_list_display_uses_ranges() {
        let list = RegList(0b1100_0000_0001_1111);
        assert_eq!(list.to_string(), "{R0-R4, LR, PC}");
        assert_eq!(RegList(0b1).to_string(), "{R0}");
        assert_eq!(RegList(0b101).to_string(), "{R0, R2}");
    }

    #[test]
    fn disassemble_data_processing() {
        let i = Instr::DataProc {
            cond: Cond::Eq,
            op: AluOp::Add,
            s: true,
            rd: 0,
            rn: 1,
            op2: Operand2::Imm {
                value: 10,
                rotate: 0,
            },
        };
        assert_eq!(i.disassemble(0), "ADDEQS R0, R1, #0xA");

        let i = Instr::DataProc {
            cond: Cond::Al,
            op: AluOp::Mov,
            s: false,
            rd: 0,
            rn: 0,
            op2: Operand2::RegImm {
                rm: 1,
                op: ShiftOp::Lsr,
                amount: 32,
            },
        };
        assert_eq!(i.disassemble(0), "MOV R0, R1, LSR #32");
    }

    #[test]
    fn disassemble_branch_shows_absolute_target() {
        let i = Instr::Branch {
            cond: Cond::Al,
            link: true,
            offset: -16,
        };
        assert_eq!(i.disassemble(0x8010), "BL 0x00008008");
    }

    #[test]
    fn disassemble_transfers() {
        let i = Instr::SingleTransfer {
            cond: Cond::Al,
            load: true,
            byte: false,
            pre: true,
            up: false,
            writeback: true,
            rd: 0,
            rn: 1,
            offset: TransferOffset::Imm(4),
        };
        assert_eq!(i.disassemble(0), "LDR R0, [R1, #-4]!");

        let i = Instr::BlockTransfer {
            cond: Cond::Al,
            load: false,
            mode: BlockMode::Db,
            writeback: true,
            user_bank: false,
            rn: 13,
            regs: RegList(0b0100_0000_0000_0011),
        };
        assert_eq!(i.disassemble(0), "STMDB SP!, {R0, R1, LR}");
    }
}
