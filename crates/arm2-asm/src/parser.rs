//! Two-pass parser.
//!
//! Pass 1 walks the preprocessed lines, parses every statement, assigns
//! addresses (instructions auto-align to 4; data directives sit where
//! the location counter is), defines labels and constants, and sizes
//! literal pools at each `.ltorg` boundary. Pass 2 re-evaluates every
//! expression against the completed symbol table so forward references
//! either resolve or produce an undefined-symbol diagnostic.

use acorn_arm2::{Cond, ShiftOp};

use crate::error::{Diagnostic, DiagnosticKind, SourceLoc};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::preprocess::SourceLine;
use crate::program::{
    BinOp, BlockSuffix, DirArg, Directive, Expr, LiteralPool, MemOffset, Operand, Program,
    ShiftAmount, ShiftSpec, SourceInstruction, SymbolKind, SymbolTable, UnaryOp,
};

/// Default cap on collected diagnostics before parsing aborts.
pub const DEFAULT_MAX_DIAGNOSTICS: usize = 20;

/// Default section bases when no `.org` is given. The text base of 0
/// puts un-originated programs in low memory; the loader maps it.
const DATA_BASE: u32 = 0x0001_0000;
const BSS_BASE: u32 = 0x0002_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Text,
    Data,
    Bss,
}

/// Token cursor over one line.
struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    loc: &'a SourceLoc,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token], loc: &'a SourceLoc) -> Self {
        Self {
            tokens,
            pos: 0,
            loc,
        }
    }

    fn peek(&self) -> Option<&'a TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn next(&mut self) -> Option<&'a TokenKind> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token.map(|t| &t.kind)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn here(&self) -> SourceLoc {
        let col = self
            .tokens
            .get(self.pos)
            .map_or(self.loc.col, |t| t.col);
        SourceLoc {
            file: self.loc.file.clone(),
            line: self.loc.line,
            col,
        }
    }

    fn error(&self, message: impl Into<String>) -> Diagnostic {
        Diagnostic::error(DiagnosticKind::Parse, self.here(), message)
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), Diagnostic> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn expect_register(&mut self, what: &str) -> Result<u8, Diagnostic> {
        match self.next() {
            Some(TokenKind::Register(n)) => Ok(*n),
            _ => Err(self.error(format!("expected register for {what}"))),
        }
    }

    fn expect_end(&self) -> Result<(), Diagnostic> {
        if self.at_end() {
            Ok(())
        } else {
            Err(self.error("trailing tokens after operands"))
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

fn parse_expr(c: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_term(c)?;
    loop {
        let op = match c.peek() {
            Some(TokenKind::Plus) => BinOp::Add,
            Some(TokenKind::Minus) => BinOp::Sub,
            _ => break,
        };
        c.next();
        let rhs = parse_term(c)?;
        lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_term(c: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    let mut lhs = parse_factor(c)?;
    loop {
        let op = match c.peek() {
            Some(TokenKind::Star) => BinOp::Mul,
            Some(TokenKind::Slash) => BinOp::Div,
            Some(TokenKind::Percent) => BinOp::Mod,
            Some(TokenKind::Shl) => BinOp::Shl,
            Some(TokenKind::Shr) => BinOp::Shr,
            _ => break,
        };
        c.next();
        let rhs = parse_factor(c)?;
        lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
    }
    Ok(lhs)
}

fn parse_factor(c: &mut Cursor<'_>) -> Result<Expr, Diagnostic> {
    match c.next() {
        Some(TokenKind::Number(n)) => Ok(Expr::Num(*n)),
        Some(TokenKind::Char(b)) => Ok(Expr::Num(i64::from(*b))),
        Some(TokenKind::Ident(name)) => Ok(Expr::Sym(name.clone())),
        Some(TokenKind::Directive(name)) if name.is_empty() => Ok(Expr::Here),
        Some(TokenKind::Minus) => Ok(Expr::Unary(UnaryOp::Neg, Box::new(parse_factor(c)?))),
        Some(TokenKind::Plus) => parse_factor(c),
        Some(TokenKind::LParen) => {
            let inner = parse_expr(c)?;
            c.expect(&TokenKind::RParen, "closing parenthesis")?;
            Ok(inner)
        }
        _ => Err(c.error("expected expression")),
    }
}

// ---------------------------------------------------------------------------
// Mnemonics
// ---------------------------------------------------------------------------

/// Parsed mnemonic parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mnemonic {
    pub base: &'static str,
    pub cond: Cond,
    pub set_flags: bool,
    pub byte: bool,
    pub half: bool,
    pub block: Option<BlockSuffix>,
}

/// Families drive which suffixes are legal after the condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Data,
    Multiply,
    Mem,
    Block,
    Plain,
}

/// Every base mnemonic. Matching tries each as a prefix and accepts the
/// split whose suffix string parses cleanly, which resolves the classic
/// `BLS` (B + LS) versus `BLEQ` (BL + EQ) ambiguity without tables of
/// special cases.
const MNEMONICS: &[(&str, Family)] = &[
    ("AND", Family::Data),
    ("EOR", Family::Data),
    ("SUB", Family::Data),
    ("RSB", Family::Data),
    ("ADD", Family::Data),
    ("ADC", Family::Data),
    ("SBC", Family::Data),
    ("RSC", Family::Data),
    ("TST", Family::Data),
    ("TEQ", Family::Data),
    ("CMP", Family::Data),
    ("CMN", Family::Data),
    ("ORR", Family::Data),
    ("MOV", Family::Data),
    ("BIC", Family::Data),
    ("MVN", Family::Data),
    ("MUL", Family::Multiply),
    ("MLA", Family::Multiply),
    ("LDR", Family::Mem),
    ("STR", Family::Mem),
    ("LDM", Family::Block),
    ("STM", Family::Block),
    ("SWI", Family::Plain),
    ("NOP", Family::Plain),
    ("ADR", Family::Plain),
    ("PUSH", Family::Plain),
    ("POP", Family::Plain),
    ("BX", Family::Plain),
    ("BL", Family::Plain),
    ("B", Family::Plain),
];

fn parse_cond(s: &str) -> Option<(Cond, &str)> {
    if s.len() < 2 {
        return None;
    }
    let cond = match &s[..2] {
        "EQ" => Cond::Eq,
        "NE" => Cond::Ne,
        "CS" | "HS" => Cond::Cs,
        "CC" | "LO" => Cond::Cc,
        "MI" => Cond::Mi,
        "PL" => Cond::Pl,
        "VS" => Cond::Vs,
        "VC" => Cond::Vc,
        "HI" => Cond::Hi,
        "LS" => Cond::Ls,
        "GE" => Cond::Ge,
        "LT" => Cond::Lt,
        "GT" => Cond::Gt,
        "LE" => Cond::Le,
        "AL" => Cond::Al,
        "NV" => Cond::Nv,
        _ => return None,
    };
    Some((cond, &s[2..]))
}

/// Split an identifier into base mnemonic, condition, and suffixes.
#[must_use]
pub fn parse_mnemonic(ident: &str) -> Option<Mnemonic> {
    let upper = ident.to_ascii_uppercase();
    for &(base, family) in MNEMONICS {
        let Some(rest) = upper.strip_prefix(base) else {
            continue;
        };
        let (cond, rest) = parse_cond(rest).unwrap_or((Cond::Al, rest));
        let parsed = match family {
            Family::Data | Family::Multiply => match rest {
                "" => Some((false, false, false, None)),
                "S" => Some((true, false, false, None)),
                _ => None,
            },
            Family::Mem => match rest {
                "" => Some((false, false, false, None)),
                "B" => Some((false, true, false, None)),
                "H" => Some((false, false, true, None)),
                _ => None,
            },
            Family::Block => {
                if rest.is_empty() {
                    // Bare LDM/STM defaults to IA
                    Some((false, false, false, Some(BlockSuffix::Ia)))
                } else {
                    BlockSuffix::parse(rest).map(|b| (false, false, false, Some(b)))
                }
            }
            Family::Plain => {
                if rest.is_empty() {
                    Some((false, false, false, None))
                } else {
                    None
                }
            }
        };
        if let Some((set_flags, byte, half, block)) = parsed {
            return Some(Mnemonic {
                base,
                cond,
                set_flags,
                byte,
                half,
                block,
            });
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Operand parsing
// ---------------------------------------------------------------------------

fn parse_shift_spec(c: &mut Cursor<'_>) -> Result<ShiftSpec, Diagnostic> {
    let name = match c.next() {
        Some(TokenKind::Ident(name)) => name.to_ascii_uppercase(),
        _ => return Err(c.error("expected shift operation")),
    };
    let op = match name.as_str() {
        "LSL" => ShiftOp::Lsl,
        "LSR" => ShiftOp::Lsr,
        "ASR" => ShiftOp::Asr,
        "ROR" => ShiftOp::Ror,
        "RRX" => {
            return Ok(ShiftSpec {
                op: ShiftOp::Rrx,
                amount: ShiftAmount::Imm(Expr::Num(1)),
            });
        }
        other => return Err(c.error(format!("unknown shift '{other}'"))),
    };
    let amount = if c.eat(&TokenKind::Hash) {
        ShiftAmount::Imm(parse_expr(c)?)
    } else if let Some(TokenKind::Register(n)) = c.peek() {
        let n = *n;
        c.next();
        ShiftAmount::Reg(n)
    } else {
        return Err(c.error("shift needs #amount or a register"));
    };
    Ok(ShiftSpec { op, amount })
}

/// `#expr` or `Rm[, shift]`: the flexible second operand.
fn parse_operand2(c: &mut Cursor<'_>) -> Result<Operand, Diagnostic> {
    if c.eat(&TokenKind::Hash) {
        return Ok(Operand::Imm(parse_expr(c)?));
    }
    if let Some(TokenKind::Register(rm)) = c.peek() {
        let rm = *rm;
        c.next();
        let shift = if c.eat(&TokenKind::Comma) {
            Some(parse_shift_spec(c)?)
        } else {
            None
        };
        return Ok(Operand::Shifted { rm, shift });
    }
    Err(c.error("expected #immediate or register operand"))
}

/// `[Rn, off]`, `[Rn, off]!`, `[Rn], off`, `=expr`, or a bare target.
fn parse_mem_operand(c: &mut Cursor<'_>, raw: &str) -> Result<Operand, Diagnostic> {
    if matches!(c.peek(), Some(TokenKind::Equals)) {
        // The literal-pool dedup key is the operand's *source text*, so
        // =255 and =0xFF occupy separate slots. Slice the raw line from
        // the '=' to the token after the expression (or end of line).
        let eq_col = c.tokens[c.pos].col;
        c.next();
        let expr = parse_expr(c)?;
        let end = c.tokens.get(c.pos).map_or(raw.len(), |t| t.col - 1);
        let mut text = raw.get(eq_col - 1..end).unwrap_or("=").to_string();
        for pattern in [";", "@", "//"] {
            if let Some(i) = text.find(pattern) {
                text.truncate(i);
            }
        }
        return Ok(Operand::Literal {
            text: text.trim().to_string(),
            expr,
        });
    }
    if !matches!(c.peek(), Some(TokenKind::LBracket)) {
        // PC-relative label load: LDR R0, message
        return Ok(Operand::Target(parse_expr(c)?));
    }
    c.next();
    let base = c.expect_register("transfer base")?;
    if c.eat(&TokenKind::RBracket) {
        if c.eat(&TokenKind::Comma) {
            // Post-indexed
            let offset = parse_mem_offset(c)?;
            return Ok(Operand::Mem {
                base,
                offset,
                pre: false,
                writeback: true,
            });
        }
        // Plain [Rn]; '!' here is meaningless but harmless to accept
        let writeback = c.eat(&TokenKind::Bang);
        return Ok(Operand::Mem {
            base,
            offset: MemOffset::Imm(Expr::Num(0)),
            pre: true,
            writeback,
        });
    }
    c.expect(&TokenKind::Comma, "',' or ']' after base register")?;
    let offset = parse_mem_offset(c)?;
    c.expect(&TokenKind::RBracket, "']'")?;
    let writeback = c.eat(&TokenKind::Bang);
    Ok(Operand::Mem {
        base,
        offset,
        pre: true,
        writeback,
    })
}

fn parse_mem_offset(c: &mut Cursor<'_>) -> Result<MemOffset, Diagnostic> {
    if c.eat(&TokenKind::Hash) {
        return Ok(MemOffset::Imm(parse_expr(c)?));
    }
    let negative = c.eat(&TokenKind::Minus);
    if !negative {
        let _ = c.eat(&TokenKind::Plus);
    }
    match c.next() {
        Some(TokenKind::Register(rm)) => {
            let shift = if c.eat(&TokenKind::Comma) {
                Some(parse_shift_spec(c)?)
            } else {
                None
            };
            Ok(MemOffset::Reg {
                rm: *rm,
                negative,
                shift,
            })
        }
        _ => Err(c.error("expected #immediate or register offset")),
    }
}

fn parse_reg_list(c: &mut Cursor<'_>) -> Result<u16, Diagnostic> {
    c.expect(&TokenKind::LBrace, "'{'")?;
    let mut mask: u16 = 0;
    loop {
        let first = c.expect_register("register list entry")?;
        if c.eat(&TokenKind::Minus) {
            let last = c.expect_register("range end")?;
            if last < first {
                return Err(c.error("register range must ascend"));
            }
            for r in first..=last {
                mask |= 1 << r;
            }
        } else {
            mask |= 1 << first;
        }
        if !c.eat(&TokenKind::Comma) {
            break;
        }
    }
    c.expect(&TokenKind::RBrace, "'}'")?;
    if mask == 0 {
        return Err(c.error("empty register list"));
    }
    Ok(mask)
}

fn parse_operands(
    c: &mut Cursor<'_>,
    mnemonic: &Mnemonic,
    raw: &str,
) -> Result<(Vec<Operand>, bool), Diagnostic> {
    let mut user_bank = false;
    let operands = match mnemonic.base {
        "MOV" | "MVN" => {
            let rd = c.expect_register("destination")?;
            c.expect(&TokenKind::Comma, "','")?;
            vec![Operand::Reg(rd), parse_operand2(c)?]
        }
        "CMP" | "CMN" | "TST" | "TEQ" => {
            let rn = c.expect_register("first operand")?;
            c.expect(&TokenKind::Comma, "','")?;
            vec![Operand::Reg(rn), parse_operand2(c)?]
        }
        "AND" | "EOR" | "SUB" | "RSB" | "ADD" | "ADC" | "SBC" | "RSC" | "ORR" | "BIC" => {
            let rd = c.expect_register("destination")?;
            c.expect(&TokenKind::Comma, "','")?;
            // Two-operand shorthand: `ADD R0, #10` means `ADD R0, R0, #10`.
            // A bare register followed by a comma is the full form.
            let full_form = matches!(c.peek(), Some(TokenKind::Register(_)))
                && matches!(
                    c.tokens.get(c.pos + 1).map(|t| &t.kind),
                    Some(TokenKind::Comma)
                );
            let rn = if full_form {
                let rn = c.expect_register("first operand")?;
                c.expect(&TokenKind::Comma, "','")?;
                rn
            } else {
                rd
            };
            vec![Operand::Reg(rd), Operand::Reg(rn), parse_operand2(c)?]
        }
        "MUL" => {
            let rd = c.expect_register("destination")?;
            c.expect(&TokenKind::Comma, "','")?;
            let rm = c.expect_register("multiplicand")?;
            c.expect(&TokenKind::Comma, "','")?;
            let rs = c.expect_register("multiplier")?;
            vec![Operand::Reg(rd), Operand::Reg(rm), Operand::Reg(rs)]
        }
        "MLA" => {
            let rd = c.expect_register("destination")?;
            c.expect(&TokenKind::Comma, "','")?;
            let rm = c.expect_register("multiplicand")?;
            c.expect(&TokenKind::Comma, "','")?;
            let rs = c.expect_register("multiplier")?;
            c.expect(&TokenKind::Comma, "','")?;
            let rn = c.expect_register("accumulator")?;
            vec![
                Operand::Reg(rd),
                Operand::Reg(rm),
                Operand::Reg(rs),
                Operand::Reg(rn),
            ]
        }
        "LDR" | "STR" => {
            let rd = c.expect_register("transfer register")?;
            c.expect(&TokenKind::Comma, "','")?;
            vec![Operand::Reg(rd), parse_mem_operand(c, raw)?]
        }
        "LDM" | "STM" => {
            let rn = c.expect_register("base register")?;
            let writeback = c.eat(&TokenKind::Bang);
            c.expect(&TokenKind::Comma, "','")?;
            let mask = parse_reg_list(c)?;
            user_bank = c.eat(&TokenKind::Caret);
            // The base + writeback ride in a Mem operand; the encoder
            // reads only those two fields for block transfers
            vec![
                Operand::Mem {
                    base: rn,
                    offset: MemOffset::Imm(Expr::Num(0)),
                    pre: false,
                    writeback,
                },
                Operand::RegList(mask),
            ]
        }
        "PUSH" | "POP" => {
            vec![Operand::RegList(parse_reg_list(c)?)]
        }
        "B" | "BL" => {
            vec![Operand::Target(parse_expr(c)?)]
        }
        "BX" => {
            vec![Operand::Reg(c.expect_register("target register")?)]
        }
        "SWI" => {
            let _ = c.eat(&TokenKind::Hash);
            vec![Operand::Imm(parse_expr(c)?)]
        }
        "ADR" => {
            let rd = c.expect_register("destination")?;
            c.expect(&TokenKind::Comma, "','")?;
            vec![Operand::Reg(rd), Operand::Target(parse_expr(c)?)]
        }
        "NOP" => Vec::new(),
        other => return Err(c.error(format!("unhandled mnemonic '{other}'"))),
    };
    c.expect_end()?;
    Ok((operands, user_bank))
}

// ---------------------------------------------------------------------------
// Two-pass driver
// ---------------------------------------------------------------------------

/// Directives the parser understands.
const KNOWN_DIRECTIVES: &[&str] = &[
    "org", "equ", "set", "word", "half", "byte", "ascii", "asciz", "string", "space", "skip",
    "align", "balign", "global", "ltorg", "text", "data", "bss",
];

pub struct Parser {
    max_diagnostics: usize,
    diagnostics: Vec<Diagnostic>,
}

impl Parser {
    #[must_use]
    pub fn new(max_diagnostics: usize) -> Self {
        Self {
            max_diagnostics,
            diagnostics: Vec::new(),
        }
    }

    fn report(&mut self, diag: Diagnostic) -> Result<(), Vec<Diagnostic>> {
        self.diagnostics.push(diag);
        let errors = self.diagnostics.iter().filter(|d| !d.warning).count();
        if errors >= self.max_diagnostics {
            Err(std::mem::take(&mut self.diagnostics))
        } else {
            Ok(())
        }
    }

    /// Run both passes over preprocessed lines.
    pub fn parse(mut self, lines: &[SourceLine]) -> Result<Program, Vec<Diagnostic>> {
        let mut program = Program::default();
        let mut lexer = Lexer::new();

        let mut section = Section::Text;
        let mut text_lc: u32 = 0;
        let mut data_lc: u32 = DATA_BASE;
        let mut bss_lc: u32 = BSS_BASE;
        let mut emitted_in_section = false;
        // LDR = operand texts pending the next .ltorg, dedup by text
        let mut pending_literals: Vec<(String, Expr)> = Vec::new();

        for line in lines {
            let tokens = match lexer.lex_line(&line.text, &line.loc) {
                Ok(tokens) => tokens,
                Err(diag) => {
                    self.report(diag)?;
                    continue;
                }
            };
            if tokens.is_empty() {
                continue;
            }
            let mut c = Cursor::new(&tokens, &line.loc);

            // Optional leading label
            let mut label: Option<String> = None;
            if let (Some(TokenKind::Ident(name)), Some(t2)) =
                (c.peek(), tokens.get(1).map(|t| &t.kind))
            {
                if *t2 == TokenKind::Colon {
                    label = Some(name.clone());
                    c.next();
                    c.next();
                }
            }

            let lc = match section {
                Section::Text => &mut text_lc,
                Section::Data => &mut data_lc,
                Section::Bss => &mut bss_lc,
            };

            let result = match c.peek() {
                None => {
                    // Label-only line binds to the current counter
                    if let Some(name) = &label {
                        Self::bind_label(&mut program.symbols, name, *lc, &line.loc)
                    } else {
                        Ok(())
                    }
                }
                Some(TokenKind::Directive(_)) => {
                    let outcome = self.directive(
                        &mut c,
                        line,
                        label.as_deref(),
                        &mut program,
                        lc,
                        &mut pending_literals,
                        &mut emitted_in_section,
                    );
                    match outcome {
                        Ok(Some(new_section)) => {
                            section = new_section;
                            emitted_in_section = false;
                            Ok(())
                        }
                        Ok(None) => Ok(()),
                        Err(diag) => Err(diag),
                    }
                }
                Some(TokenKind::Ident(_)) => {
                    emitted_in_section = true;
                    self.instruction(
                        &mut c,
                        line,
                        label.take(),
                        &mut program,
                        lc,
                        &mut pending_literals,
                    )
                }
                _ => Err(c.error("expected label, directive, or instruction")),
            };
            if let Err(diag) = result {
                self.report(diag)?;
            }
        }

        if lexer.in_comment() {
            let loc = lines.last().map(|l| l.loc.clone()).unwrap_or_default();
            let _ = self.report(Diagnostic::error(
                DiagnosticKind::Lex,
                loc,
                "unterminated block comment",
            ));
        }

        // Implicit final pool after the last text-section byte
        if !pending_literals.is_empty() {
            let addr = (text_lc + 3) & !3;
            program.pools.push(LiteralPool {
                addr,
                entries: std::mem::take(&mut pending_literals),
            });
        }

        self.resolve_pass(&program);

        if self.diagnostics.iter().any(|d| !d.warning) {
            Err(self.diagnostics)
        } else {
            program.warnings = self.diagnostics;
            Ok(program)
        }
    }

    fn bind_label(
        symbols: &mut SymbolTable,
        name: &str,
        addr: u32,
        loc: &SourceLoc,
    ) -> Result<(), Diagnostic> {
        if symbols.define(name, addr, SymbolKind::Label) {
            Ok(())
        } else {
            Err(Diagnostic::error(
                DiagnosticKind::DuplicateLabel,
                loc.clone(),
                format!("label '{name}' is already defined"),
            ))
        }
    }

    fn instruction(
        &mut self,
        c: &mut Cursor<'_>,
        line: &SourceLine,
        label: Option<String>,
        program: &mut Program,
        lc: &mut u32,
        pending_literals: &mut Vec<(String, Expr)>,
    ) -> Result<(), Diagnostic> {
        let Some(TokenKind::Ident(ident)) = c.next() else {
            unreachable!("caller checked for an identifier");
        };
        let Some(mnemonic) = parse_mnemonic(ident) else {
            return Err(Diagnostic::error(
                DiagnosticKind::Parse,
                line.loc.clone(),
                format!("unknown mnemonic '{ident}'"),
            ));
        };
        if mnemonic.cond == Cond::Nv {
            let _ = self.report(Diagnostic::warning(
                DiagnosticKind::Parse,
                line.loc.clone(),
                "NV condition is deprecated and never executes",
            ));
        }

        // Instructions are word-aligned regardless of preceding data
        let addr = (*lc + 3) & !3;
        if let Some(name) = &label {
            Self::bind_label(&mut program.symbols, name, addr, &line.loc)?;
        }

        let (operands, user_bank) = parse_operands(c, &mnemonic, &line.text)?;

        // Pool bookkeeping for LDR =
        for op in &operands {
            if let Operand::Literal { text, expr } = op {
                if !pending_literals.iter().any(|(t, _)| t == text) {
                    pending_literals.push((text.clone(), expr.clone()));
                }
            }
        }

        program.source_map.insert(addr, line.text.trim().to_string());
        program.instructions.push(SourceInstruction {
            mnemonic: mnemonic.base.to_string(),
            cond: mnemonic.cond,
            set_flags: mnemonic.set_flags,
            byte: mnemonic.byte,
            half: mnemonic.half,
            block: mnemonic.block,
            user_bank,
            operands,
            raw: line.text.trim().to_string(),
            label,
            addr,
            loc: line.loc.clone(),
        });
        *lc = addr + 4;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)] // pass-1 state is wide by nature
    fn directive(
        &mut self,
        c: &mut Cursor<'_>,
        line: &SourceLine,
        label: Option<&str>,
        program: &mut Program,
        lc: &mut u32,
        pending_literals: &mut Vec<(String, Expr)>,
        emitted_in_section: &mut bool,
    ) -> Result<Option<Section>, Diagnostic> {
        let Some(TokenKind::Directive(name)) = c.next() else {
            unreachable!("caller checked for a directive");
        };
        let name = name.clone();
        if !KNOWN_DIRECTIVES.contains(&name.as_str()) {
            return Err(Diagnostic::error(
                DiagnosticKind::Parse,
                line.loc.clone(),
                format!("unknown directive '.{name}'"),
            ));
        }

        if let Some(label) = label {
            Self::bind_label(&mut program.symbols, label, *lc, &line.loc)?;
        }

        let mut record = |program: &mut Program, args: Vec<DirArg>, addr: u32, size: u32| {
            program.directives.push(Directive {
                name: name.clone(),
                args,
                addr,
                size,
                loc: line.loc.clone(),
            });
        };

        match name.as_str() {
            "text" => return Ok(Some(Section::Text)),
            "data" => return Ok(Some(Section::Data)),
            "bss" => return Ok(Some(Section::Bss)),
            "org" => {
                let expr = parse_expr(c)?;
                c.expect_end()?;
                let value = Self::eval_now(&expr, program, *lc, &line.loc)?;
                if *emitted_in_section {
                    return Err(Diagnostic::error(
                        DiagnosticKind::Parse,
                        line.loc.clone(),
                        ".org after emission in this section",
                    ));
                }
                *lc = value;
                if program.origin.is_none() {
                    program.origin = Some(value);
                }
                record(program, vec![DirArg::Expr(expr)], value, 0);
            }
            "equ" | "set" => {
                let sym = match c.next() {
                    Some(TokenKind::Ident(sym)) => sym.clone(),
                    _ => return Err(c.error(format!(".{name} needs a symbol name"))),
                };
                c.expect(&TokenKind::Comma, "','")?;
                let expr = parse_expr(c)?;
                c.expect_end()?;
                let value = Self::eval_now(&expr, program, *lc, &line.loc)?;
                let kind = if name == "equ" {
                    SymbolKind::Constant
                } else {
                    SymbolKind::Variable
                };
                if !program.symbols.define(&sym, value, kind) {
                    return Err(Diagnostic::error(
                        DiagnosticKind::DuplicateLabel,
                        line.loc.clone(),
                        format!("symbol '{sym}' is already defined"),
                    ));
                }
                record(program, vec![DirArg::Expr(expr)], *lc, 0);
            }
            "word" | "half" | "byte" => {
                let unit = match name.as_str() {
                    "word" => 4,
                    "half" => 2,
                    _ => 1,
                };
                let mut args = Vec::new();
                loop {
                    args.push(DirArg::Expr(parse_expr(c)?));
                    if !c.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                c.expect_end()?;
                let size = unit * args.len() as u32;
                *emitted_in_section = true;
                record(program, args, *lc, size);
                *lc += size;
            }
            "ascii" | "asciz" | "string" => {
                let mut args = Vec::new();
                let mut size = 0u32;
                loop {
                    match c.next() {
                        Some(TokenKind::Str(bytes)) => {
                            size += bytes.len() as u32;
                            if name != "ascii" {
                                size += 1; // trailing NUL
                            }
                            args.push(DirArg::Str(bytes.clone()));
                        }
                        _ => return Err(c.error(format!(".{name} needs a string"))),
                    }
                    if !c.eat(&TokenKind::Comma) {
                        break;
                    }
                }
                c.expect_end()?;
                *emitted_in_section = true;
                record(program, args, *lc, size);
                *lc += size;
            }
            "space" | "skip" => {
                let expr = parse_expr(c)?;
                c.expect_end()?;
                let size = Self::eval_now(&expr, program, *lc, &line.loc)?;
                *emitted_in_section = true;
                record(program, vec![DirArg::Expr(expr)], *lc, size);
                *lc += size;
            }
            "align" => {
                let expr = parse_expr(c)?;
                c.expect_end()?;
                let power = Self::eval_now(&expr, program, *lc, &line.loc)?;
                if power > 16 {
                    return Err(c.error(".align power is too large"));
                }
                let unit = 1u32 << power;
                let aligned = lc.div_ceil(unit) * unit;
                record(program, vec![DirArg::Expr(expr)], *lc, aligned - *lc);
                *lc = aligned;
            }
            "balign" => {
                let expr = parse_expr(c)?;
                c.expect_end()?;
                let unit = Self::eval_now(&expr, program, *lc, &line.loc)?;
                if unit == 0 || !unit.is_power_of_two() {
                    return Err(c.error(".balign needs a power of two"));
                }
                let aligned = lc.div_ceil(unit) * unit;
                record(program, vec![DirArg::Expr(expr)], *lc, aligned - *lc);
                *lc = aligned;
            }
            "global" => {
                let sym = match c.next() {
                    Some(TokenKind::Ident(sym)) => sym.clone(),
                    _ => return Err(c.error(".global needs a symbol name")),
                };
                c.expect_end()?;
                program.symbols.mark_global(&sym);
                record(program, Vec::new(), *lc, 0);
            }
            "ltorg" => {
                c.expect_end()?;
                let addr = (*lc + 3) & !3;
                let entries = std::mem::take(pending_literals);
                let size = 4 * entries.len() as u32;
                record(program, Vec::new(), addr, size);
                if !entries.is_empty() {
                    program.pools.push(LiteralPool { addr, entries });
                    *emitted_in_section = true;
                }
                *lc = addr + size;
            }
            _ => unreachable!("directive list checked above"),
        }
        Ok(None)
    }

    /// Evaluate an expression that must be known in pass 1 (`.org`,
    /// `.equ`, `.space`, alignment).
    fn eval_now(
        expr: &Expr,
        program: &Program,
        here: u32,
        loc: &SourceLoc,
    ) -> Result<u32, Diagnostic> {
        match expr.eval(&program.symbols, here) {
            Ok(v) => Ok(v as u32),
            Err(sym) => Err(Diagnostic::error(
                DiagnosticKind::UndefinedSymbol,
                loc.clone(),
                format!("'{sym}' must be defined before use here"),
            )),
        }
    }

    /// Pass 2: every expression must now evaluate.
    fn resolve_pass(&mut self, program: &Program) {
        let mut failures: Vec<Diagnostic> = Vec::new();
        let mut check = |expr: &Expr, addr: u32, loc: &SourceLoc| {
            if let Err(sym) = expr.eval(&program.symbols, addr) {
                failures.push(Diagnostic::error(
                    DiagnosticKind::UndefinedSymbol,
                    loc.clone(),
                    format!("undefined symbol '{sym}'"),
                ));
            }
        };
        for instr in &program.instructions {
            for op in &instr.operands {
                match op {
                    Operand::Imm(e) | Operand::Target(e) => check(e, instr.addr, &instr.loc),
                    Operand::Literal { expr, .. } => check(expr, instr.addr, &instr.loc),
                    Operand::Shifted {
                        shift: Some(ShiftSpec {
                            amount: ShiftAmount::Imm(e),
                            ..
                        }),
                        ..
                    } => check(e, instr.addr, &instr.loc),
                    Operand::Mem { offset, .. } => match offset {
                        MemOffset::Imm(e) => check(e, instr.addr, &instr.loc),
                        MemOffset::Reg {
                            shift:
                                Some(ShiftSpec {
                                    amount: ShiftAmount::Imm(e),
                                    ..
                                }),
                            ..
                        } => check(e, instr.addr, &instr.loc),
                        MemOffset::Reg { .. } => {}
                    },
                    _ => {}
                }
            }
        }
        for dir in &program.directives {
            for arg in &dir.args {
                if let DirArg::Expr(e) = arg {
                    check(e, dir.addr, &dir.loc);
                }
            }
        }
        self.diagnostics.extend(failures);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(ident: &str) -> Mnemonic {
        parse_mnemonic(ident).expect("mnemonic parses")
    }

    #[test]
    fn branch_condition_ambiguity() {
        // BLS is B + LS, BLEQ is BL + EQ, BLE is B + LE
        let m = split("BLS");
        assert_eq!((m.base, m.cond), ("B", Cond::Ls));
        let m = split("BLEQ");
        assert_eq!((m.base, m.cond), ("BL", Cond::Eq));
        let m = split("BLE");
        assert_eq!((m.base, m.cond), ("B", Cond::Le));
        let m = split("BICS");
        assert_eq!((m.base, m.cond, m.set_flags), ("BIC", Cond::Al, true));
    }

    #[test]
    fn suffix_order_is_cond_then_flags() {
        let m = split("ADDEQS");
        assert_eq!((m.base, m.cond, m.set_flags), ("ADD", Cond::Eq, true));
        let m = split("LDREQB");
        assert_eq!((m.base, m.cond, m.byte), ("LDR", Cond::Eq, true));
        let m = split("STMNEFD");
        assert_eq!(m.base, "STM");
        assert_eq!(m.cond, Cond::Ne);
        assert_eq!(m.block, Some(BlockSuffix::Fd));
    }

    #[test]
    fn hs_and_lo_alias_cs_and_cc() {
        assert_eq!(split("BHS").cond, Cond::Cs);
        assert_eq!(split("BLO").cond, Cond::Cc);
    }

    #[test]
    fn lowercase_accepted() {
        let m = split("ldrb");
        assert_eq!((m.base, m.byte), ("LDR", true));
    }

    #[test]
    fn junk_is_rejected() {
        assert!(parse_mnemonic("FROB").is_none());
        assert!(parse_mnemonic("ADDX").is_none());
        assert!(parse_mnemonic("MOVSS").is_none());
    }
}
