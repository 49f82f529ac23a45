//! Assembler output model.
//!
//! A [`Program`] is what two-pass parsing produces: instructions and
//! directives with resolved addresses, the symbol table, literal pools,
//! and a source map for the debugger.

use std::collections::HashMap;
use std::fmt;

use acorn_arm2::{Cond, ShiftOp};

use crate::error::SourceLoc;

/// Constant expression appearing in operands and directive arguments.
///
/// Symbols resolve against the symbol table in pass 2; arithmetic is
/// evaluated in `i64` and truncated to 32 bits at the use site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Num(i64),
    Sym(String),
    /// The current location counter (`.`).
    Here,
    Unary(UnaryOp, Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
}

impl Expr {
    /// Evaluate against the symbol table. `here` is the address of the
    /// statement the expression belongs to.
    pub fn eval(&self, symbols: &SymbolTable, here: u32) -> Result<i64, String> {
        match self {
            Self::Num(n) => Ok(*n),
            Self::Here => Ok(i64::from(here)),
            Self::Sym(name) => symbols
                .lookup(name)
                .map(|s| i64::from(s.value))
                .ok_or_else(|| name.clone()),
            Self::Unary(UnaryOp::Neg, e) => Ok(-e.eval(symbols, here)?),
            Self::Bin(op, a, b) => {
                let a = a.eval(symbols, here)?;
                let b = b.eval(symbols, here)?;
                Ok(match op {
                    BinOp::Add => a.wrapping_add(b),
                    BinOp::Sub => a.wrapping_sub(b),
                    BinOp::Mul => a.wrapping_mul(b),
                    BinOp::Div => {
                        if b == 0 {
                            return Err("division by zero".to_string());
                        }
                        a.wrapping_div(b)
                    }
                    BinOp::Mod => {
                        if b == 0 {
                            return Err("modulo by zero".to_string());
                        }
                        a.wrapping_rem(b)
                    }
                    // Amounts masked so host shifts stay in range
                    BinOp::Shl => a.wrapping_shl((b as u32) & 31),
                    BinOp::Shr => ((a as u64) >> ((b as u32) & 31)) as i64,
                })
            }
        }
    }
}

/// What kind of thing a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// A code/data address bound by `label:`.
    Label,
    /// `.equ` definition; cannot be redefined.
    Constant,
    /// `.set` definition; may be redefined.
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub value: u32,
    pub kind: SymbolKind,
    pub defined: bool,
    /// Marked by `.global`.
    pub global: bool,
}

/// Name → symbol map.
///
/// After pass 2 every referenced symbol has `defined == true`, or the
/// parse fails with an undefined-symbol diagnostic.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    map: HashMap<String, Symbol>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Define a symbol. Returns `false` when the definition collides
    /// (duplicate label, or `.equ` redefinition).
    pub fn define(&mut self, name: &str, value: u32, kind: SymbolKind) -> bool {
        match self.map.get_mut(name) {
            Some(existing) if existing.defined => {
                if existing.kind == SymbolKind::Variable && kind == SymbolKind::Variable {
                    existing.value = value;
                    true
                } else {
                    false
                }
            }
            Some(existing) => {
                existing.value = value;
                existing.kind = kind;
                existing.defined = true;
                true
            }
            None => {
                self.map.insert(
                    name.to_string(),
                    Symbol {
                        value,
                        kind,
                        defined: true,
                        global: false,
                    },
                );
                true
            }
        }
    }

    /// Record a `.global` marker, creating a forward entry if needed.
    pub fn mark_global(&mut self, name: &str) {
        self.map
            .entry(name.to_string())
            .or_insert(Symbol {
                value: 0,
                kind: SymbolKind::Label,
                defined: false,
                global: false,
            })
            .global = true;
    }

    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Symbol> {
        self.map.get(name).filter(|s| s.defined)
    }

    /// All defined symbols, for the debugger's symbol map.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Symbol)> {
        self.map
            .iter()
            .filter(|(_, s)| s.defined)
            .map(|(k, v)| (k.as_str(), v))
    }
}

/// Shift amount in an operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShiftAmount {
    Imm(Expr),
    Reg(u8),
}

/// A shift applied to a register operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShiftSpec {
    pub op: ShiftOp,
    /// Ignored for RRX.
    pub amount: ShiftAmount,
}

/// Offset part of a memory operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemOffset {
    /// `#expr`; a negative value selects the down direction.
    Imm(Expr),
    /// `[Rn, ±Rm, shift]`.
    Reg {
        rm: u8,
        negative: bool,
        shift: Option<ShiftSpec>,
    },
}

/// One parsed operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    /// `#expr`.
    Imm(Expr),
    /// Bare register possibly with a shift: `R1, LSL #2`.
    Shifted { rm: u8, shift: Option<ShiftSpec> },
    /// `[Rn, off]`, `[Rn, off]!`, `[Rn], off`.
    Mem {
        base: u8,
        offset: MemOffset,
        pre: bool,
        writeback: bool,
    },
    /// `{R0-R4, LR}` as a bitmask.
    RegList(u16),
    /// `=expr` with the original operand text (the literal-pool dedup
    /// key is the text, not the value).
    Literal { text: String, expr: Expr },
    /// Branch target or ADR source.
    Target(Expr),
}

/// Block-transfer addressing written in source (`IA`… or stack alias).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSuffix {
    Ia,
    Ib,
    Da,
    Db,
    Fd,
    Ed,
    Fa,
    Ea,
}

impl BlockSuffix {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IA" => Some(Self::Ia),
            "IB" => Some(Self::Ib),
            "DA" => Some(Self::Da),
            "DB" => Some(Self::Db),
            "FD" => Some(Self::Fd),
            "ED" => Some(Self::Ed),
            "FA" => Some(Self::Fa),
            "EA" => Some(Self::Ea),
            _ => None,
        }
    }

    /// Resolve to concrete (pre, up) bits. The stack aliases mean
    /// opposite things for loads and stores (a full-descending push is
    /// DB, the matching pop is IA).
    #[must_use]
    pub const fn resolve(self, load: bool) -> (bool, bool) {
        match (self, load) {
            (Self::Ia, _) | (Self::Fd, true) | (Self::Ea, false) => (false, true),
            (Self::Ib, _) | (Self::Ed, true) | (Self::Fa, false) => (true, true),
            (Self::Da, _) | (Self::Fa, true) | (Self::Ed, false) => (false, false),
            (Self::Db, _) | (Self::Ea, true) | (Self::Fd, false) => (true, false),
        }
    }
}

/// One parsed instruction with its resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInstruction {
    /// Base mnemonic, upper-case (`ADD`, `LDR`, `LDM`, `PUSH`, ...).
    pub mnemonic: String,
    pub cond: Cond,
    /// The S suffix.
    pub set_flags: bool,
    /// B suffix on LDR/STR.
    pub byte: bool,
    /// H suffix on LDR/STR.
    pub half: bool,
    /// Addressing-mode suffix on LDM/STM.
    pub block: Option<BlockSuffix>,
    /// `^` after the register list.
    pub user_bank: bool,
    pub operands: Vec<Operand>,
    /// The raw source text of the line.
    pub raw: String,
    pub label: Option<String>,
    pub addr: u32,
    pub loc: SourceLoc,
}

/// Directive argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirArg {
    Expr(Expr),
    Str(Vec<u8>),
}

/// One parsed directive with its resolved address and reserved size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    /// Lower-case name without the dot.
    pub name: String,
    pub args: Vec<DirArg>,
    pub addr: u32,
    /// Bytes this directive occupies in memory.
    pub size: u32,
    pub loc: SourceLoc,
}

/// A literal pool emitted at an `.ltorg` boundary (or at the end of the
/// program).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralPool {
    /// Word-aligned base address of the pool.
    pub addr: u32,
    /// Deduplicated `LDR =` operand texts, in first-seen order. Entry
    /// `i` lives at `addr + 4 * i`.
    pub entries: Vec<(String, Expr)>,
}

impl LiteralPool {
    /// Address of the entry for an operand text.
    #[must_use]
    pub fn entry_addr(&self, text: &str) -> Option<u32> {
        self.entries
            .iter()
            .position(|(t, _)| t == text)
            .map(|i| self.addr + 4 * i as u32)
    }
}

/// The assembled program.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instructions: Vec<SourceInstruction>,
    pub directives: Vec<Directive>,
    pub symbols: SymbolTable,
    /// `.org` value, when the source set one.
    pub origin: Option<u32>,
    pub pools: Vec<LiteralPool>,
    /// Address → raw source line, for the debugger.
    pub source_map: HashMap<u32, String>,
    /// Non-fatal diagnostics (e.g. the NV deprecation warning).
    pub warnings: Vec<crate::error::Diagnostic>,
}

impl Program {
    /// The pool serving a `LDR =` at `addr`: the nearest one at or after
    /// the instruction, falling back to the last pool before it.
    #[must_use]
    pub fn pool_for(&self, addr: u32, text: &str) -> Option<u32> {
        self.pools
            .iter()
            .filter(|p| p.addr >= addr)
            .find_map(|p| p.entry_addr(text))
            .or_else(|| {
                self.pools
                    .iter()
                    .rev()
                    .filter(|p| p.addr < addr)
                    .find_map(|p| p.entry_addr(text))
            })
    }

    /// Entry point by convention: `_start`, then `main`, then the first
    /// instruction.
    #[must_use]
    pub fn entry_point(&self) -> Option<u32> {
        self.symbols
            .lookup("_start")
            .or_else(|| self.symbols.lookup("main"))
            .map(|s| s.value)
            .or_else(|| self.instructions.first().map(|i| i.addr))
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label => write!(f, "label"),
            Self::Constant => write!(f, "constant"),
            Self::Variable => write!(f, "variable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equ_cannot_be_redefined_but_set_can() {
        let mut table = SymbolTable::new();
        assert!(table.define("K", 1, SymbolKind::Constant));
        assert!(!table.define("K", 2, SymbolKind::Constant));
        assert!(table.define("V", 1, SymbolKind::Variable));
        assert!(table.define("V", 2, SymbolKind::Variable));
        assert_eq!(table.lookup("V").map(|s| s.value), Some(2));
    }

    #[test]
    fn expr_arithmetic() {
        let table = SymbolTable::new();
        let e = Expr::Bin(
            BinOp::Add,
            Box::new(Expr::Num(8)),
            Box::new(Expr::Bin(
                BinOp::Shl,
                Box::new(Expr::Num(1)),
                Box::new(Expr::Num(4)),
            )),
        );
        assert_eq!(e.eval(&table, 0), Ok(24));
    }

    #[test]
    fn undefined_symbol_reports_name() {
        let table = SymbolTable::new();
        let e = Expr::Sym("missing".to_string());
        assert_eq!(e.eval(&table, 0), Err("missing".to_string()));
    }

    #[test]
    fn stack_aliases_resolve_per_direction() {
        // Full-descending: push is STMDB, pop is LDMIA
        assert_eq!(BlockSuffix::Fd.resolve(false), (true, false));
        assert_eq!(BlockSuffix::Fd.resolve(true), (false, true));
        // Empty-ascending: push is STMIA, pop is LDMDB
        assert_eq!(BlockSuffix::Ea.resolve(false), (false, true));
        assert_eq!(BlockSuffix::Ea.resolve(true), (true, false));
    }
}
