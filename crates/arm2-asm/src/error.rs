//! Assembler diagnostics.
//!
//! Diagnostics carry file, line, and column. Assembly collects a bounded
//! batch of errors before giving up, so one bad line doesn't hide the
//! next twenty.

use std::fmt;
use std::path::PathBuf;

/// A position in (possibly included) source text.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLoc {
    /// Original file, when the source came from disk.
    pub file: Option<PathBuf>,
    /// 1-based line number in that file.
    pub line: usize,
    /// 1-based column.
    pub col: usize,
}

impl SourceLoc {
    #[must_use]
    pub fn new(line: usize, col: usize) -> Self {
        Self {
            file: None,
            line,
            col,
        }
    }

    #[must_use]
    pub fn in_file(file: PathBuf, line: usize, col: usize) -> Self {
        Self {
            file: Some(file),
            line,
            col,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(file) = &self.file {
            write!(f, "{}:", file.display())?;
        }
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// What stage and rule a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    Lex,
    Parse,
    UnclosedConditional,
    DuplicateLabel,
    UndefinedSymbol,
    CircularInclude,
    Encode,
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lex => "lex error",
            Self::Parse => "parse error",
            Self::UnclosedConditional => "unclosed conditional",
            Self::DuplicateLabel => "duplicate label",
            Self::UndefinedSymbol => "undefined symbol",
            Self::CircularInclude => "circular include",
            Self::Encode => "encode error",
        };
        write!(f, "{name}")
    }
}

/// One problem (or warning) found during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub loc: SourceLoc,
    pub message: String,
    /// Warnings (e.g. the deprecated NV condition) don't fail assembly.
    pub warning: bool,
}

impl Diagnostic {
    #[must_use]
    pub fn error(kind: DiagnosticKind, loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            kind,
            loc,
            message: message.into(),
            warning: false,
        }
    }

    #[must_use]
    pub fn warning(kind: DiagnosticKind, loc: SourceLoc, message: impl Into<String>) -> Self {
        Self {
            kind,
            loc,
            message: message.into(),
            warning: true,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = if self.warning { "warning" } else { "error" };
        write!(
            f,
            "{}: {severity}: {}: {}",
            self.loc, self.kind, self.message
        )
    }
}

/// Assembly failed. Holds the collected diagnostic batch (errors and any
/// warnings found before the abort).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsmError {
    pub diagnostics: Vec<Diagnostic>,
}

impl AsmError {
    #[must_use]
    pub fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }

    /// The first hard error in the batch.
    #[must_use]
    pub fn first(&self) -> Option<&Diagnostic> {
        self.diagnostics.iter().find(|d| !d.warning)
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AsmError {}
