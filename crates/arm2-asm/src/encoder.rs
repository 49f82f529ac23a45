//! Opcode encoder: parsed instruction → 32-bit ARM2 opcode.
//!
//! Pseudo-instructions (NOP, ADR, PUSH/POP, `LDR =`) expand here. The
//! encoder is the half of the round-trip law: everything it emits must
//! decode back to a semantically equal instruction.

use std::fmt;

use acorn_arm2::ShiftOp;

use crate::error::{Diagnostic, DiagnosticKind};
use crate::program::{
    Expr, MemOffset, Operand, Program, ShiftAmount, ShiftSpec, SourceInstruction,
};

/// Encoding failure kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    InvalidOperand(String),
    ImmediateUnencodable(u32),
    LiteralOutOfRange(u32),
    RegisterDisallowed(String),
    /// An expression failed to evaluate (division by zero; undefined
    /// symbols were already rejected in pass 2).
    BadExpression(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOperand(msg) => write!(f, "invalid operand: {msg}"),
            Self::ImmediateUnencodable(v) => {
                write!(f, "immediate {v:#010X} cannot be encoded as a rotated 8-bit value")
            }
            Self::LiteralOutOfRange(v) => {
                write!(f, "literal for {v:#010X} is out of PC-relative range")
            }
            Self::RegisterDisallowed(msg) => write!(f, "register disallowed: {msg}"),
            Self::BadExpression(msg) => write!(f, "bad expression: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Search for the 8-bit-value/even-rotation immediate form.
///
/// Rotation 0 is the identity and is checked with an explicit branch;
/// the search never relies on a rotate-by-32.
#[must_use]
pub fn try_encode_imm(value: u32) -> Option<(u8, u8)> {
    if value <= 0xFF {
        return Some((value as u8, 0));
    }
    for rotate in 1..16u32 {
        let rotated = value.rotate_left(2 * rotate);
        if rotated <= 0xFF {
            return Some((rotated as u8, rotate as u8));
        }
    }
    None
}

/// ALU opcode numbers by mnemonic.
fn alu_opcode(mnemonic: &str) -> Option<u32> {
    let n = match mnemonic {
        "AND" => 0x0,
        "EOR" => 0x1,
        "SUB" => 0x2,
        "RSB" => 0x3,
        "ADD" => 0x4,
        "ADC" => 0x5,
        "SBC" => 0x6,
        "RSC" => 0x7,
        "TST" => 0x8,
        "TEQ" => 0x9,
        "CMP" => 0xA,
        "CMN" => 0xB,
        "ORR" => 0xC,
        "MOV" => 0xD,
        "BIC" => 0xE,
        "MVN" => 0xF,
        _ => return None,
    };
    Some(n)
}

/// The complementary ALU op usable when the immediate doesn't encode:
/// bitwise complement pairs and negation pairs.
fn complement_op(opcode: u32) -> Option<(u32, ComplementKind)> {
    match opcode {
        0xD => Some((0xF, ComplementKind::Not)), // MOV -> MVN
        0xF => Some((0xD, ComplementKind::Not)), // MVN -> MOV
        0x0 => Some((0xE, ComplementKind::Not)), // AND -> BIC
        0xE => Some((0x0, ComplementKind::Not)), // BIC -> AND
        0x4 => Some((0x2, ComplementKind::Neg)), // ADD -> SUB
        0x2 => Some((0x4, ComplementKind::Neg)), // SUB -> ADD
        0xA => Some((0xB, ComplementKind::Neg)), // CMP -> CMN
        0xB => Some((0xA, ComplementKind::Neg)), // CMN -> CMP
        _ => None,
    }
}

#[derive(Clone, Copy)]
enum ComplementKind {
    Not,
    Neg,
}

struct Ctx<'a> {
    program: &'a Program,
    addr: u32,
}

impl Ctx<'_> {
    fn eval(&self, expr: &Expr) -> Result<i64, EncodeError> {
        expr.eval(&self.program.symbols, self.addr)
            .map_err(EncodeError::BadExpression)
    }

    fn eval_u32(&self, expr: &Expr) -> Result<u32, EncodeError> {
        Ok(self.eval(expr)? as u32)
    }
}

/// Encode one instruction at its resolved address.
pub fn encode_instruction(
    instr: &SourceInstruction,
    program: &Program,
) -> Result<u32, EncodeError> {
    let ctx = Ctx {
        program,
        addr: instr.addr,
    };
    let cond = instr.cond.bits() << 28;
    let ops = &instr.operands;

    if let Some(opcode) = alu_opcode(&instr.mnemonic) {
        return encode_data_proc(&ctx, instr, opcode, cond);
    }

    match instr.mnemonic.as_str() {
        "MUL" | "MLA" => encode_multiply(instr, cond),
        "LDR" | "STR" => encode_transfer(&ctx, instr, cond),
        "LDM" | "STM" | "PUSH" | "POP" => encode_block(instr, cond),
        "B" | "BL" => {
            let target = match ops.first() {
                Some(Operand::Target(e)) => ctx.eval_u32(e)?,
                _ => return Err(EncodeError::InvalidOperand("branch needs a target".into())),
            };
            let diff = target.wrapping_sub(instr.addr.wrapping_add(8)) as i32;
            if diff % 4 != 0 {
                return Err(EncodeError::InvalidOperand(
                    "branch target is not word-aligned".into(),
                ));
            }
            let words = diff >> 2;
            if !(-0x0080_0000..0x0080_0000).contains(&words) {
                return Err(EncodeError::InvalidOperand(
                    "branch target out of ±32 MiB range".into(),
                ));
            }
            let link = u32::from(instr.mnemonic == "BL") << 24;
            Ok(cond | 0b101 << 25 | link | (words as u32 & 0x00FF_FFFF))
        }
        "BX" => match ops.first() {
            Some(Operand::Reg(rm)) => Ok(cond | 0x012F_FF10 | u32::from(*rm)),
            _ => Err(EncodeError::InvalidOperand("BX needs a register".into())),
        },
        "SWI" => {
            let imm = match ops.first() {
                Some(Operand::Imm(e)) => ctx.eval_u32(e)?,
                _ => return Err(EncodeError::InvalidOperand("SWI needs a number".into())),
            };
            Ok(cond | 0xF << 24 | (imm & 0x00FF_FFFF))
        }
        "NOP" => {
            // Canonical NOP is MOV R0, R0
            Ok(cond | 0x01A0_0000)
        }
        "ADR" => {
            let (rd, target) = match (ops.first(), ops.get(1)) {
                (Some(Operand::Reg(rd)), Some(Operand::Target(e))) => (*rd, ctx.eval_u32(e)?),
                _ => {
                    return Err(EncodeError::InvalidOperand(
                        "ADR needs a register and a target".into(),
                    ));
                }
            };
            let pc = instr.addr.wrapping_add(8);
            let (alu, magnitude) = if target >= pc {
                (0x4u32, target - pc) // ADD Rd, PC, #off
            } else {
                (0x2u32, pc - target) // SUB Rd, PC, #off
            };
            let Some((value, rotate)) = try_encode_imm(magnitude) else {
                return Err(EncodeError::ImmediateUnencodable(magnitude));
            };
            Ok(cond
                | 1 << 25
                | alu << 21
                | 15 << 16
                | u32::from(rd) << 12
                | u32::from(rotate) << 8
                | u32::from(value))
        }
        other => Err(EncodeError::InvalidOperand(format!(
            "cannot encode mnemonic '{other}'"
        ))),
    }
}

fn encode_data_proc(
    ctx: &Ctx<'_>,
    instr: &SourceInstruction,
    mut opcode: u32,
    cond: u32,
) -> Result<u32, EncodeError> {
    let is_compare = (0x8..=0xB).contains(&opcode);
    let no_rn = opcode == 0xD || opcode == 0xF;

    let (rd, rn, op2) = match (is_compare, no_rn) {
        (true, _) => match (&instr.operands[0], &instr.operands[1]) {
            (Operand::Reg(rn), op2) => (0u8, *rn, op2),
            _ => return Err(EncodeError::InvalidOperand("compare needs Rn".into())),
        },
        (_, true) => match (&instr.operands[0], &instr.operands[1]) {
            (Operand::Reg(rd), op2) => (*rd, 0u8, op2),
            _ => return Err(EncodeError::InvalidOperand("MOV needs Rd".into())),
        },
        _ => match (&instr.operands[0], &instr.operands[1], &instr.operands[2]) {
            (Operand::Reg(rd), Operand::Reg(rn), op2) => (*rd, *rn, op2),
            _ => return Err(EncodeError::InvalidOperand("expected Rd, Rn, operand".into())),
        },
    };

    if instr.set_flags && rd == 15 && !is_compare {
        // S-bit writes to R15 would be an SPSR restore; rejected here
        return Err(EncodeError::RegisterDisallowed(
            "S-bit data processing may not target PC".into(),
        ));
    }

    let s_bit = u32::from(instr.set_flags || is_compare) << 20;

    let operand_bits = match op2 {
        Operand::Imm(expr) => {
            let value = ctx.eval_u32(expr)?;
            match try_encode_imm(value) {
                Some((v, rot)) => 1 << 25 | u32::from(rot) << 8 | u32::from(v),
                None => {
                    // Complement rewriting: MOV<->MVN, AND<->BIC by NOT;
                    // ADD<->SUB, CMP<->CMN by negation
                    let Some((new_opcode, kind)) = complement_op(opcode) else {
                        return Err(EncodeError::ImmediateUnencodable(value));
                    };
                    let complemented = match kind {
                        ComplementKind::Not => !value,
                        ComplementKind::Neg => value.wrapping_neg(),
                    };
                    let Some((v, rot)) = try_encode_imm(complemented) else {
                        return Err(EncodeError::ImmediateUnencodable(value));
                    };
                    opcode = new_opcode;
                    1 << 25 | u32::from(rot) << 8 | u32::from(v)
                }
            }
        }
        Operand::Shifted { rm, shift } => {
            u32::from(*rm) | shift_field(ctx, shift.as_ref())?
        }
        _ => {
            return Err(EncodeError::InvalidOperand(
                "second operand must be #imm or register".into(),
            ));
        }
    };

    Ok(cond
        | opcode << 21
        | s_bit
        | u32::from(rn) << 16
        | u32::from(rd) << 12
        | operand_bits)
}

/// Bits 11-4: the shift field applied to Rm.
fn shift_field(ctx: &Ctx<'_>, shift: Option<&ShiftSpec>) -> Result<u32, EncodeError> {
    let Some(spec) = shift else {
        return Ok(0); // LSL #0
    };
    let ty = spec.op.bits() << 5;
    match (&spec.op, &spec.amount) {
        (ShiftOp::Rrx, _) => Ok(0b11 << 5), // ROR #0 encodes RRX
        (_, ShiftAmount::Reg(rs)) => {
            if *rs == 15 {
                return Err(EncodeError::RegisterDisallowed(
                    "PC cannot supply a shift amount".into(),
                ));
            }
            Ok(u32::from(*rs) << 8 | ty | 1 << 4)
        }
        (op, ShiftAmount::Imm(expr)) => {
            let amount = ctx.eval(expr)?;
            let encoded = match (op, amount) {
                (ShiftOp::Lsl, 0..=31) => amount as u32,
                (ShiftOp::Lsr | ShiftOp::Asr, 32) => 0,
                (ShiftOp::Lsr | ShiftOp::Asr, 1..=31) => amount as u32,
                (ShiftOp::Ror, 1..=31) => amount as u32,
                (ShiftOp::Lsl, 32) => {
                    return Err(EncodeError::InvalidOperand(
                        "LSL amount must be 0-31".into(),
                    ));
                }
                _ => {
                    return Err(EncodeError::InvalidOperand(format!(
                        "shift amount {amount} out of range"
                    )));
                }
            };
            Ok(encoded << 7 | ty)
        }
    }
}

fn encode_multiply(instr: &SourceInstruction, cond: u32) -> Result<u32, EncodeError> {
    let accumulate = instr.mnemonic == "MLA";
    let regs: Vec<u8> = instr
        .operands
        .iter()
        .map(|op| match op {
            Operand::Reg(r) => Ok(*r),
            _ => Err(EncodeError::InvalidOperand(
                "multiply takes only registers".into(),
            )),
        })
        .collect::<Result<_, _>>()?;
    let (rd, rm, rs) = (regs[0], regs[1], regs[2]);
    let rn = if accumulate { regs[3] } else { 0 };
    if rd == rm {
        return Err(EncodeError::RegisterDisallowed(
            "multiply requires Rd != Rm".into(),
        ));
    }
    if regs.iter().any(|&r| r == 15) {
        return Err(EncodeError::RegisterDisallowed(
            "multiply cannot use PC".into(),
        ));
    }
    // Multiply swaps the register fields relative to data processing:
    // Rd occupies bits 19-16 and Rn bits 15-12. This is the ARM layout,
    // not a transcription error.
    Ok(cond
        | u32::from(accumulate) << 21
        | u32::from(instr.set_flags) << 20
        | u32::from(rd) << 16
        | u32::from(rn) << 12
        | u32::from(rs) << 8
        | 0b1001 << 4
        | u32::from(rm))
}

fn encode_transfer(
    ctx: &Ctx<'_>,
    instr: &SourceInstruction,
    cond: u32,
) -> Result<u32, EncodeError> {
    let load = instr.mnemonic == "LDR";
    let rd = match instr.operands.first() {
        Some(Operand::Reg(rd)) => *rd,
        _ => return Err(EncodeError::InvalidOperand("transfer needs Rd".into())),
    };

    match &instr.operands[1] {
        Operand::Mem {
            base,
            offset,
            pre,
            writeback,
        } => {
            if instr.half {
                return encode_half_transfer(
                    ctx, instr, cond, load, rd, *base, offset, *pre, *writeback,
                );
            }
            let l = u32::from(load) << 20;
            let b = u32::from(instr.byte) << 22;
            let p = u32::from(*pre) << 24;
            // Post-indexed transfers always write back; the W bit there
            // selects the user-mode translate variant, which this
            // machine does not model
            let w = u32::from(*pre && *writeback) << 21;
            let (up, offset_bits) = match offset {
                MemOffset::Imm(expr) => {
                    let value = ctx.eval(expr)?;
                    let up = value >= 0;
                    let magnitude = value.unsigned_abs();
                    if magnitude > 4095 {
                        return Err(EncodeError::InvalidOperand(format!(
                            "transfer offset {value} exceeds 4095"
                        )));
                    }
                    (up, magnitude as u32)
                }
                MemOffset::Reg {
                    rm,
                    negative,
                    shift,
                } => {
                    if let Some(ShiftSpec {
                        amount: ShiftAmount::Reg(_),
                        ..
                    }) = shift
                    {
                        return Err(EncodeError::InvalidOperand(
                            "transfer offsets cannot use register shift amounts".into(),
                        ));
                    }
                    (
                        !*negative,
                        1 << 25 | u32::from(*rm) | shift_field(ctx, shift.as_ref())?,
                    )
                }
            };
            Ok(cond
                | 0b01 << 26
                | p
                | u32::from(up) << 23
                | b
                | w
                | l
                | u32::from(*base) << 16
                | u32::from(rd) << 12
                | offset_bits)
        }
        Operand::Literal { text, expr } => {
            if !load {
                return Err(EncodeError::InvalidOperand(
                    "STR cannot take an = literal".into(),
                ));
            }
            let value = ctx.eval_u32(expr)?;
            // An encodable constant rewrites to MOV (or MVN) and needs
            // no pool entry
            if let Some((v, rot)) = try_encode_imm(value) {
                return Ok(cond
                    | 1 << 25
                    | 0xD << 21
                    | u32::from(rd) << 12
                    | u32::from(rot) << 8
                    | u32::from(v));
            }
            if let Some((v, rot)) = try_encode_imm(!value) {
                return Ok(cond
                    | 1 << 25
                    | 0xF << 21
                    | u32::from(rd) << 12
                    | u32::from(rot) << 8
                    | u32::from(v));
            }
            let Some(entry) = ctx.program.pool_for(instr.addr, text) else {
                return Err(EncodeError::LiteralOutOfRange(value));
            };
            pc_relative_load(instr.addr, entry, rd, cond, value)
        }
        Operand::Target(expr) => {
            if !load {
                return Err(EncodeError::InvalidOperand(
                    "STR needs an addressing-mode operand".into(),
                ));
            }
            let target = ctx.eval_u32(expr)?;
            pc_relative_load(instr.addr, target, rd, cond, target)
        }
        _ => Err(EncodeError::InvalidOperand(
            "transfer needs an addressing-mode operand".into(),
        )),
    }
}

/// `LDR Rd, [PC, #offset]` reaching `target` from `addr`.
fn pc_relative_load(
    addr: u32,
    target: u32,
    rd: u8,
    cond: u32,
    reported: u32,
) -> Result<u32, EncodeError> {
    let pc = addr.wrapping_add(8);
    let diff = target.wrapping_sub(pc) as i32;
    if diff.unsigned_abs() > 4095 {
        return Err(EncodeError::LiteralOutOfRange(reported));
    }
    let up = diff >= 0;
    Ok(cond
        | 0b01 << 26
        | 1 << 24
        | u32::from(up) << 23
        | 1 << 20
        | 15 << 16
        | u32::from(rd) << 12
        | diff.unsigned_abs())
}

#[allow(clippy::too_many_arguments)] // the field set is the instruction
fn encode_half_transfer(
    ctx: &Ctx<'_>,
    instr: &SourceInstruction,
    cond: u32,
    load: bool,
    rd: u8,
    base: u8,
    offset: &MemOffset,
    pre: bool,
    writeback: bool,
) -> Result<u32, EncodeError> {
    if instr.byte {
        return Err(EncodeError::InvalidOperand(
            "B and H suffixes are exclusive".into(),
        ));
    }
    let l = u32::from(load) << 20;
    let p = u32::from(pre) << 24;
    let w = u32::from(pre && writeback) << 21;
    let (up, imm_bit, offset_bits) = match offset {
        MemOffset::Imm(expr) => {
            let value = ctx.eval(expr)?;
            let magnitude = value.unsigned_abs();
            if magnitude > 255 {
                return Err(EncodeError::InvalidOperand(format!(
                    "halfword offset {value} exceeds 255"
                )));
            }
            // The 8-bit immediate splits across the high/low nibbles
            let magnitude = magnitude as u32;
            (value >= 0, 1u32, (magnitude & 0xF0) << 4 | (magnitude & 0x0F))
        }
        MemOffset::Reg { rm, negative, shift } => {
            if shift.is_some() {
                return Err(EncodeError::InvalidOperand(
                    "halfword offsets cannot be shifted".into(),
                ));
            }
            (!*negative, 0u32, u32::from(*rm))
        }
    };
    Ok(cond
        | p
        | u32::from(up) << 23
        | imm_bit << 22
        | w
        | l
        | u32::from(base) << 16
        | u32::from(rd) << 12
        | 1 << 7
        | 0b01 << 5
        | 1 << 4
        | offset_bits)
}

fn encode_block(instr: &SourceInstruction, cond: u32) -> Result<u32, EncodeError> {
    let (load, base, writeback, mask, pre, up) = match instr.mnemonic.as_str() {
        "PUSH" | "POP" => {
            let mask = match instr.operands.first() {
                Some(Operand::RegList(mask)) => *mask,
                _ => return Err(EncodeError::InvalidOperand("expected register list".into())),
            };
            let load = instr.mnemonic == "POP";
            // PUSH is STMDB SP!, POP is LDMIA SP!
            let (pre, up) = if load { (false, true) } else { (true, false) };
            (load, 13u8, true, mask, pre, up)
        }
        _ => {
            let load = instr.mnemonic == "LDM";
            let (base, writeback) = match instr.operands.first() {
                Some(Operand::Mem {
                    base, writeback, ..
                }) => (*base, *writeback),
                _ => return Err(EncodeError::InvalidOperand("expected base register".into())),
            };
            let mask = match instr.operands.get(1) {
                Some(Operand::RegList(mask)) => *mask,
                _ => return Err(EncodeError::InvalidOperand("expected register list".into())),
            };
            let suffix = instr.block.unwrap_or(crate::program::BlockSuffix::Ia);
            let (pre, up) = suffix.resolve(load);
            (load, base, writeback, mask, pre, up)
        }
    };
    if base == 15 {
        return Err(EncodeError::RegisterDisallowed(
            "block transfer base cannot be PC".into(),
        ));
    }
    // Register lists are encoded as a bitmask: numeric order is inherent,
    // whatever order the source wrote
    Ok(cond
        | 0b100 << 25
        | u32::from(pre) << 24
        | u32::from(up) << 23
        | u32::from(instr.user_bank) << 22
        | u32::from(writeback) << 21
        | u32::from(load) << 20
        | u32::from(base) << 16
        | u32::from(mask))
}

/// Encode every instruction and literal-pool entry of a program.
///
/// Returns `(address, word)` pairs ready for the loader, or diagnostics
/// with source positions.
pub fn encode_program(program: &Program) -> Result<Vec<(u32, u32)>, Vec<Diagnostic>> {
    let mut words = Vec::with_capacity(program.instructions.len());
    let mut diagnostics = Vec::new();
    for instr in &program.instructions {
        match encode_instruction(instr, program) {
            Ok(word) => words.push((instr.addr, word)),
            Err(err) => diagnostics.push(Diagnostic::error(
                DiagnosticKind::Encode,
                instr.loc.clone(),
                err.to_string(),
            )),
        }
    }
    for pool in &program.pools {
        for (i, (_, expr)) in pool.entries.iter().enumerate() {
            let addr = pool.addr + 4 * i as u32;
            match expr.eval(&program.symbols, addr) {
                Ok(value) => words.push((addr, value as u32)),
                Err(sym) => diagnostics.push(Diagnostic::error(
                    DiagnosticKind::UndefinedSymbol,
                    crate::error::SourceLoc::default(),
                    format!("undefined symbol '{sym}' in literal pool"),
                )),
            }
        }
    }
    if diagnostics.is_empty() {
        Ok(words)
    } else {
        Err(diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_search_prefers_rotation_zero() {
        assert_eq!(try_encode_imm(0xFF), Some((0xFF, 0)));
        assert_eq!(try_encode_imm(0), Some((0, 0)));
    }

    #[test]
    fn immediate_search_finds_rotations() {
        // 0xFF000000 = 0xFF rotated right by 8 (rotate field 4)
        assert_eq!(try_encode_imm(0xFF00_0000), Some((0xFF, 4)));
        // 0x3FC = 0xFF rotated right by 30 (rotate field 15)
        assert_eq!(try_encode_imm(0x3FC), Some((0xFF, 15)));
        assert_eq!(try_encode_imm(0x104), None);
        assert_eq!(try_encode_imm(0x0001_0001), None);
    }

    #[test]
    fn rotated_immediates_round_trip() {
        for &value in &[0x3F0u32, 0xFF00, 0xF000_000F, 0x0003_FC00] {
            let (v, rot) = try_encode_imm(value).expect("encodable");
            let decoded = if rot == 0 {
                u32::from(v)
            } else {
                u32::from(v).rotate_right(2 * u32::from(rot))
            };
            assert_eq!(decoded, value, "value {value:#X}");
        }
    }
}
