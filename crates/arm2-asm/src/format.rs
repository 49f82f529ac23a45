//! Canonical instruction formatting.
//!
//! Renders a parsed instruction back to source text such that parsing
//! the output reproduces the same instruction. Used by tooling that
//! rewrites assembly, and pinned by the parse∘format∘parse law in the
//! round-trip tests.

use std::fmt::Write as _;

use acorn_arm2::register_name;

use crate::program::{
    BinOp, BlockSuffix, Expr, MemOffset, Operand, ShiftAmount, ShiftSpec, SourceInstruction,
    UnaryOp,
};

/// Render an expression. Sub-expressions are parenthesised so the
/// re-parse rebuilds the identical tree.
#[must_use]
pub fn format_expr(expr: &Expr) -> String {
    match expr {
        Expr::Num(n) => {
            if *n < 10 {
                format!("{n}")
            } else {
                format!("{n:#X}")
            }
        }
        Expr::Sym(name) => name.clone(),
        Expr::Here => ".".to_string(),
        Expr::Unary(UnaryOp::Neg, inner) => format!("-{}", format_factor(inner)),
        Expr::Bin(op, a, b) => {
            let op = match op {
                BinOp::Add => "+",
                BinOp::Sub => "-",
                BinOp::Mul => "*",
                BinOp::Div => "/",
                BinOp::Mod => "%",
                BinOp::Shl => "<<",
                BinOp::Shr => ">>",
            };
            format!("{} {op} {}", format_factor(a), format_factor(b))
        }
    }
}

fn format_factor(expr: &Expr) -> String {
    match expr {
        Expr::Bin(..) => format!("({})", format_expr(expr)),
        _ => format_expr(expr),
    }
}

fn format_shift(out: &mut String, shift: Option<&ShiftSpec>) {
    let Some(spec) = shift else { return };
    match (&spec.op, &spec.amount) {
        (acorn_arm2::ShiftOp::Rrx, _) => {
            let _ = write!(out, ", RRX");
        }
        (op, ShiftAmount::Imm(expr)) => {
            let _ = write!(out, ", {} #{}", op.mnemonic(), format_expr(expr));
        }
        (op, ShiftAmount::Reg(rs)) => {
            let _ = write!(out, ", {} {}", op.mnemonic(), register_name(*rs));
        }
    }
}

fn format_reg_list(mask: u16) -> String {
    acorn_arm2::RegList(mask).to_string()
}

fn format_operand(op: &Operand) -> String {
    let mut out = String::new();
    match op {
        Operand::Reg(r) => out.push_str(register_name(*r)),
        Operand::Imm(expr) => {
            let _ = write!(out, "#{}", format_expr(expr));
        }
        Operand::Shifted { rm, shift } => {
            out.push_str(register_name(*rm));
            format_shift(&mut out, shift.as_ref());
        }
        Operand::Mem {
            base,
            offset,
            pre,
            writeback,
        } => {
            let mut offset_text = String::new();
            let trivial = match offset {
                MemOffset::Imm(expr) => {
                    let _ = write!(offset_text, "#{}", format_expr(expr));
                    matches!(expr, Expr::Num(0))
                }
                MemOffset::Reg {
                    rm,
                    negative,
                    shift,
                } => {
                    if *negative {
                        offset_text.push('-');
                    }
                    offset_text.push_str(register_name(*rm));
                    format_shift(&mut offset_text, shift.as_ref());
                    false
                }
            };
            if *pre {
                if trivial {
                    let _ = write!(out, "[{}]", register_name(*base));
                } else {
                    let _ = write!(out, "[{}, {offset_text}]", register_name(*base));
                }
                if *writeback {
                    out.push('!');
                }
            } else {
                let _ = write!(out, "[{}], {offset_text}", register_name(*base));
            }
        }
        Operand::RegList(mask) => out.push_str(&format_reg_list(*mask)),
        Operand::Literal { text, .. } => out.push_str(text),
        Operand::Target(expr) => out.push_str(&format_expr(expr)),
    }
    out
}

/// Render the canonical text of one instruction (label excluded).
#[must_use]
pub fn format_instruction(instr: &SourceInstruction) -> String {
    let mut out = String::new();
    out.push_str(&instr.mnemonic);
    out.push_str(instr.cond.suffix());
    if instr.set_flags {
        out.push('S');
    }
    if instr.byte {
        out.push('B');
    }
    if instr.half {
        out.push('H');
    }
    if let Some(block) = instr.block {
        out.push_str(match block {
            BlockSuffix::Ia => "IA",
            BlockSuffix::Ib => "IB",
            BlockSuffix::Da => "DA",
            BlockSuffix::Db => "DB",
            BlockSuffix::Fd => "FD",
            BlockSuffix::Ed => "ED",
            BlockSuffix::Fa => "FA",
            BlockSuffix::Ea => "EA",
        });
    }

    // Block transfers print base! before the list; everything else is a
    // comma-joined operand row
    if instr.mnemonic == "LDM" || instr.mnemonic == "STM" {
        if let (
            Some(Operand::Mem {
                base, writeback, ..
            }),
            Some(Operand::RegList(mask)),
        ) = (instr.operands.first(), instr.operands.get(1))
        {
            let _ = write!(
                out,
                " {}{}, {}",
                register_name(*base),
                if *writeback { "!" } else { "" },
                format_reg_list(*mask)
            );
            if instr.user_bank {
                out.push('^');
            }
        }
        return out;
    }

    for (i, op) in instr.operands.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        out.push_str(&format_operand(op));
    }
    out
}
