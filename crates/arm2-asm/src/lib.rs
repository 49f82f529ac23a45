//! ARM2 assembler.
//!
//! Source text runs through the [`Preprocessor`] (includes, conditionals,
//! macros), the two-pass [`Parser`] (addresses, symbols, literal-pool
//! sizing), and the [`encoder`] (32-bit opcodes, pool synthesis). The
//! result is a [`Program`] the loader can place into memory.

mod encoder;
mod error;
mod format;
mod lexer;
mod parser;
mod preprocess;
mod program;

use std::fs;
use std::path::{Path, PathBuf};

pub use encoder::{EncodeError, encode_instruction, encode_program, try_encode_imm};
pub use error::{AsmError, Diagnostic, DiagnosticKind, SourceLoc};
pub use format::{format_expr, format_instruction};
pub use lexer::{Lexer, Token, TokenKind, process_escapes, register_number};
pub use parser::{DEFAULT_MAX_DIAGNOSTICS, Mnemonic, Parser, parse_mnemonic};
pub use preprocess::{Preprocessor, SourceLine};
pub use program::{
    BinOp, BlockSuffix, DirArg, Directive, Expr, LiteralPool, MemOffset, Operand, Program,
    ShiftAmount, ShiftSpec, SourceInstruction, Symbol, SymbolKind, SymbolTable, UnaryOp,
};

/// Assembler configuration.
pub struct AsmConfig {
    /// Extra directories searched by `.include`.
    pub include_dirs: Vec<PathBuf>,
    /// Symbols treated as defined by `.ifdef` before any source is read.
    pub defines: Vec<String>,
    /// Errors collected before parsing aborts.
    pub max_diagnostics: usize,
}

impl Default for AsmConfig {
    fn default() -> Self {
        Self {
            include_dirs: Vec::new(),
            defines: Vec::new(),
            max_diagnostics: DEFAULT_MAX_DIAGNOSTICS,
        }
    }
}

/// Assemble in-memory source text.
pub fn assemble_str(source: &str, config: &AsmConfig) -> Result<Program, AsmError> {
    assemble(source, None, config)
}

/// Assemble a file from disk (include resolution is relative to it).
pub fn assemble_file(path: &Path, config: &AsmConfig) -> Result<Program, AsmError> {
    let text = fs::read_to_string(path).map_err(|e| {
        AsmError::new(vec![Diagnostic::error(
            DiagnosticKind::Parse,
            SourceLoc::in_file(path.to_path_buf(), 0, 0),
            format!("cannot read source: {e}"),
        )])
    })?;
    assemble(&text, Some(path), config)
}

fn assemble(source: &str, path: Option<&Path>, config: &AsmConfig) -> Result<Program, AsmError> {
    let mut preprocessor = Preprocessor::new(config.include_dirs.clone(), &config.defines);
    let lines = preprocessor
        .run(source, path)
        .map_err(|d| AsmError::new(vec![d]))?;
    Parser::new(config.max_diagnostics)
        .parse(&lines)
        .map_err(AsmError::new)
}
