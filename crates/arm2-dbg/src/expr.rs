//! Debugger expression evaluator.
//!
//! Recursive descent over a small grammar:
//!
//! ```text
//! cond   := expr (('==' | '!=' | '<' | '<=' | '>' | '>=') expr)?
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/' | '%' | '<<' | '>>') factor)*
//! factor := number | register | symbol | '[' cond ']' | '$' N
//!         | '(' cond ')' | '-' factor
//! ```
//!
//! Comparisons yield 1 or 0, which is what breakpoint conditions use.
//! All arithmetic is unsigned 32-bit wrapping; shift amounts are
//! clamped modulo 32 so no host shift is ever out of range.

use std::collections::HashMap;
use std::fmt;

use acorn_arm2::Registers;
use arm2_vm::Memory;

/// Evaluation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    Parse(String),
    UndefinedSymbol(String),
    /// `[addr]` where the word is unmapped or unaligned.
    BadDeref(u32),
    DivisionByZero,
    /// `$N` beyond the history.
    BadHistory(usize),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::UndefinedSymbol(name) => write!(f, "undefined symbol '{name}'"),
            Self::BadDeref(addr) => write!(f, "cannot read word at {addr:#010X}"),
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::BadHistory(n) => write!(f, "no history entry ${n}"),
        }
    }
}

impl std::error::Error for EvalError {}

/// Read-only state an expression may reference.
pub struct EvalContext<'a> {
    pub regs: &'a Registers,
    pub mem: &'a Memory,
    pub symbols: &'a HashMap<String, u32>,
    pub history: &'a [u32],
}

/// Evaluate `text` against the context. Never mutates anything; the
/// caller decides whether the result joins the history.
pub fn evaluate(text: &str, ctx: &EvalContext<'_>) -> Result<u32, EvalError> {
    let mut parser = ExprParser {
        chars: text.as_bytes(),
        pos: 0,
        ctx,
    };
    let value = parser.cond()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(EvalError::Parse(format!(
            "trailing input at '{}'",
            &text[parser.pos..]
        )));
    }
    Ok(value)
}

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct ExprParser<'a, 'c> {
    chars: &'a [u8],
    pos: usize,
    ctx: &'a EvalContext<'c>,
}

impl ExprParser<'_, '_> {
    fn skip_ws(&mut self) {
        while self.chars.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.chars[self.pos..].starts_with(token.as_bytes()) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn cond(&mut self) -> Result<u32, EvalError> {
        let lhs = self.expr()?;
        // Two-character operators are matched before their prefixes
        for (token, op) in [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            ("<=", CmpOp::Le),
            (">=", CmpOp::Ge),
            ("<", CmpOp::Lt),
            (">", CmpOp::Gt),
        ] {
            // '<' and '>' must not swallow '<<' / '>>'
            if (token == "<" && self.peek_is("<<")) || (token == ">" && self.peek_is(">>")) {
                continue;
            }
            if self.eat(token) {
                let rhs = self.expr()?;
                let result = match op {
                    CmpOp::Eq => lhs == rhs,
                    CmpOp::Ne => lhs != rhs,
                    CmpOp::Lt => lhs < rhs,
                    CmpOp::Le => lhs <= rhs,
                    CmpOp::Gt => lhs > rhs,
                    CmpOp::Ge => lhs >= rhs,
                };
                return Ok(u32::from(result));
            }
        }
        Ok(lhs)
    }

    fn peek_is(&mut self, token: &str) -> bool {
        self.skip_ws();
        self.chars[self.pos..].starts_with(token.as_bytes())
    }

    fn expr(&mut self) -> Result<u32, EvalError> {
        let mut value = self.term()?;
        loop {
            if self.eat("+") {
                value = value.wrapping_add(self.term()?);
            } else if self.eat("-") {
                value = value.wrapping_sub(self.term()?);
            } else {
                return Ok(value);
            }
        }
    }

    fn term(&mut self) -> Result<u32, EvalError> {
        let mut value = self.factor()?;
        loop {
            if self.eat("<<") {
                // Clamped modulo 32 for defined behaviour
                value = value.wrapping_shl(self.factor()? & 31);
            } else if self.eat(">>") {
                value = value.wrapping_shr(self.factor()? & 31);
            } else if self.eat("*") {
                value = value.wrapping_mul(self.factor()?);
            } else if self.eat("/") {
                let rhs = self.factor()?;
                if rhs == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                value /= rhs;
            } else if self.eat("%") {
                let rhs = self.factor()?;
                if rhs == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                value %= rhs;
            } else {
                return Ok(value);
            }
        }
    }

    fn factor(&mut self) -> Result<u32, EvalError> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                Ok(self.factor()?.wrapping_neg())
            }
            Some(b'(') => {
                self.pos += 1;
                let inner = self.cond()?;
                if !self.eat(")") {
                    return Err(EvalError::Parse("expected ')'".to_string()));
                }
                Ok(inner)
            }
            Some(b'[') => {
                self.pos += 1;
                let addr = self.cond()?;
                if !self.eat("]") {
                    return Err(EvalError::Parse("expected ']'".to_string()));
                }
                self.ctx.mem.peek_word(addr).ok_or(EvalError::BadDeref(addr))
            }
            Some(b'$') => {
                self.pos += 1;
                let n = self.number_literal()? as usize;
                // $1 is the first recorded result
                n.checked_sub(1)
                    .and_then(|i| self.ctx.history.get(i))
                    .copied()
                    .ok_or(EvalError::BadHistory(n))
            }
            Some(b'0'..=b'9') => self.number_literal(),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.name(),
            other => Err(EvalError::Parse(format!(
                "unexpected {:?}",
                other.map(char::from)
            ))),
        }
    }

    fn number_literal(&mut self) -> Result<u32, EvalError> {
        self.skip_ws();
        let start = self.pos;
        let (radix, skip) = if self.chars[self.pos..].starts_with(b"0x")
            || self.chars[self.pos..].starts_with(b"0X")
        {
            (16, 2)
        } else if self.chars[self.pos..].starts_with(b"0b")
            || self.chars[self.pos..].starts_with(b"0B")
        {
            (2, 2)
        } else {
            (10, 0)
        };
        self.pos += skip;
        let digits_start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let digits = std::str::from_utf8(&self.chars[digits_start..self.pos])
            .map_err(|_| EvalError::Parse("bad number".to_string()))?;
        u32::from_str_radix(digits, radix).map_err(|_| {
            EvalError::Parse(format!(
                "bad number '{}'",
                String::from_utf8_lossy(&self.chars[start..self.pos])
            ))
        })
    }

    fn name(&mut self) -> Result<u32, EvalError> {
        self.skip_ws();
        let start = self.pos;
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_ascii_alphanumeric() || *c == b'_')
        {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.chars[start..self.pos])
            .map_err(|_| EvalError::Parse("bad name".to_string()))?;
        if let Some(reg) = arm2_asm::register_number(name) {
            return Ok(self.ctx.regs.get(reg));
        }
        self.ctx
            .symbols
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::UndefinedSymbol(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arm2_vm::{DATA_BASE, Perm};

    fn context() -> (Registers, Memory, HashMap<String, u32>, Vec<u32>) {
        let mut regs = Registers::new();
        regs.set(0, 5);
        regs.set(1, 0x100);
        regs.set(13, 0x4F000);
        let mut mem = Memory::new();
        mem.add_segment("data", DATA_BASE, 0x1000, Perm::RW)
            .expect("segment");
        mem.poke_bytes(DATA_BASE, &0xAABB_CCDDu32.to_le_bytes())
            .expect("poke");
        let mut symbols = HashMap::new();
        symbols.insert("buffer".to_string(), DATA_BASE);
        (regs, mem, symbols, vec![11, 22])
    }

    fn eval(text: &str) -> Result<u32, EvalError> {
        let (regs, mem, symbols, history) = context();
        let ctx = EvalContext {
            regs: &regs,
            mem: &mem,
            symbols: &symbols,
            history: &history,
        };
        evaluate(text, &ctx)
    }

    #[test]
    fn precedence_and_arithmetic() {
        assert_eq!(eval("2 + 3 * 4"), Ok(14));
        assert_eq!(eval("(2 + 3) * 4"), Ok(20));
        assert_eq!(eval("100 / 3"), Ok(33));
        assert_eq!(eval("100 % 3"), Ok(1));
        assert_eq!(eval("1 << 4"), Ok(16));
        assert_eq!(eval("0x100 >> 4"), Ok(16));
    }

    #[test]
    fn shift_amounts_clamp_modulo_32() {
        assert_eq!(eval("1 << 33"), Ok(2));
        assert_eq!(eval("0x80000000 >> 33"), Ok(0x4000_0000));
    }

    #[test]
    fn registers_and_symbols() {
        assert_eq!(eval("R0"), Ok(5));
        assert_eq!(eval("R0 * 2 + 1"), Ok(11));
        assert_eq!(eval("sp"), Ok(0x4F000));
        assert_eq!(eval("buffer"), Ok(DATA_BASE));
        assert_eq!(
            eval("nonsense"),
            Err(EvalError::UndefinedSymbol("nonsense".to_string()))
        );
    }

    #[test]
    fn dereference_reads_a_word() {
        assert_eq!(eval("[buffer]"), Ok(0xAABB_CCDD));
        assert_eq!(eval("[buffer + 4] + 1"), Ok(1));
        assert_eq!(eval("[0x100]"), Err(EvalError::BadDeref(0x100)));
    }

    #[test]
    fn history_references() {
        assert_eq!(eval("$1"), Ok(11));
        assert_eq!(eval("$2 + $1"), Ok(33));
        assert_eq!(eval("$3"), Err(EvalError::BadHistory(3)));
    }

    #[test]
    fn comparisons_give_zero_or_one() {
        assert_eq!(eval("R0 == 5"), Ok(1));
        assert_eq!(eval("R0 == 6"), Ok(0));
        assert_eq!(eval("R0 != 6"), Ok(1));
        assert_eq!(eval("R0 <= 5"), Ok(1));
        assert_eq!(eval("R0 > 5"), Ok(0));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(eval("1 / 0"), Err(EvalError::DivisionByZero));
        assert_eq!(eval("1 % (R0 - 5)"), Err(EvalError::DivisionByZero));
    }

    #[test]
    fn unary_minus_wraps() {
        assert_eq!(eval("-1"), Ok(0xFFFF_FFFF));
        assert_eq!(eval("0 - 1"), Ok(0xFFFF_FFFF));
    }

    #[test]
    fn trailing_junk_is_rejected() {
        assert!(matches!(eval("1 2"), Err(EvalError::Parse(_))));
    }
}
