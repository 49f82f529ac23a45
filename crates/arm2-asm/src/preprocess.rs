//! Line-level preprocessor.
//!
//! Handles `.ifdef`/`.ifndef`/`.else`/`.endif` conditionals, `.include`
//! splicing with circular-include detection, and `.macro`/`.endm`
//! expansion. Everything else passes through untouched for the parser.
//!
//! Conditionals nest as a stack of `(parent_skipping, my_condition)`
//! pairs: a line is emitted only when no enclosing frame is skipping.
//! "Defined" means the symbol has appeared in an `.equ`/`.set`, as a
//! label, or in the configured predefine list *before* this line; the
//! pass is strictly top-to-bottom.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Diagnostic, DiagnosticKind, SourceLoc};

/// Macro expansion depth cap; a self-invoking macro hits this quickly.
const MAX_MACRO_DEPTH: usize = 32;

/// One preprocessed line, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine {
    pub text: String,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
struct Macro {
    params: Vec<String>,
    body: Vec<SourceLine>,
}

#[derive(Debug, Clone, Copy)]
struct CondFrame {
    parent_skipping: bool,
    my_condition: bool,
    seen_else: bool,
}

impl CondFrame {
    const fn skipping(self) -> bool {
        self.parent_skipping || !self.my_condition
    }
}

/// The preprocessor. One instance per assembly unit.
pub struct Preprocessor {
    defined: HashSet<String>,
    macros: HashMap<String, Macro>,
    cond_stack: Vec<CondFrame>,
    /// Canonical paths of files currently being included.
    include_stack: Vec<PathBuf>,
    /// Extra directories searched by `.include`.
    include_dirs: Vec<PathBuf>,
    /// A `.macro` currently being captured, with its name.
    capturing: Option<(String, Macro)>,
}

impl Preprocessor {
    #[must_use]
    pub fn new(include_dirs: Vec<PathBuf>, predefined: &[String]) -> Self {
        Self {
            defined: predefined.iter().cloned().collect(),
            macros: HashMap::new(),
            cond_stack: Vec::new(),
            include_stack: Vec::new(),
            include_dirs,
            capturing: None,
        }
    }

    /// Preprocess a whole unit. `file` is used for include resolution
    /// and diagnostics; in-memory sources pass `None`.
    pub fn run(
        &mut self,
        text: &str,
        file: Option<&Path>,
    ) -> Result<Vec<SourceLine>, Diagnostic> {
        if let Some(path) = file {
            if let Ok(canonical) = path.canonicalize() {
                self.include_stack.push(canonical);
            }
        }
        let mut out = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let loc = SourceLoc {
                file: file.map(Path::to_path_buf),
                line: idx + 1,
                col: 1,
            };
            self.line(raw, &loc, 0, &mut out)?;
        }
        if file.is_some() {
            self.include_stack.pop();
        }
        // Only the outermost unit checks for dangling state
        if self.include_stack.is_empty() {
            if !self.cond_stack.is_empty() {
                return Err(Diagnostic::error(
                    DiagnosticKind::UnclosedConditional,
                    SourceLoc {
                        file: file.map(Path::to_path_buf),
                        line: text.lines().count(),
                        col: 1,
                    },
                    "conditional not closed by .endif",
                ));
            }
            if let Some((name, _)) = &self.capturing {
                return Err(Diagnostic::error(
                    DiagnosticKind::Parse,
                    SourceLoc {
                        file: file.map(Path::to_path_buf),
                        line: text.lines().count(),
                        col: 1,
                    },
                    format!("macro '{name}' not closed by .endm"),
                ));
            }
        }
        Ok(out)
    }

    fn skipping(&self) -> bool {
        self.cond_stack.last().is_some_and(|f| f.skipping())
    }

    fn line(
        &mut self,
        raw: &str,
        loc: &SourceLoc,
        depth: usize,
        out: &mut Vec<SourceLine>,
    ) -> Result<(), Diagnostic> {
        let trimmed = raw.trim();
        let (word, rest) = split_first_word(trimmed);
        let lowered = word.to_ascii_lowercase();

        // Macro capture swallows every line up to .endm, conditionals
        // included: they are re-evaluated at expansion time
        if self.capturing.is_some() {
            if lowered == ".endm" {
                let (name, mac) = self.capturing.take().expect("capture in progress");
                self.defined.insert(name.clone());
                self.macros.insert(name, mac);
            } else if lowered == ".macro" {
                return Err(Diagnostic::error(
                    DiagnosticKind::Parse,
                    loc.clone(),
                    "macros do not nest",
                ));
            } else if let Some((_, mac)) = &mut self.capturing {
                mac.body.push(SourceLine {
                    text: raw.to_string(),
                    loc: loc.clone(),
                });
            }
            return Ok(());
        }

        // Conditional structure is tracked even while skipping
        match lowered.as_str() {
            ".ifdef" | ".ifndef" => {
                let symbol = rest.trim();
                let defined = self.defined.contains(symbol);
                let my_condition = if lowered == ".ifdef" { defined } else { !defined };
                self.cond_stack.push(CondFrame {
                    parent_skipping: self.skipping(),
                    my_condition,
                    seen_else: false,
                });
                return Ok(());
            }
            ".else" => {
                let Some(frame) = self.cond_stack.last_mut() else {
                    return Err(Diagnostic::error(
                        DiagnosticKind::UnclosedConditional,
                        loc.clone(),
                        ".else without .ifdef/.ifndef",
                    ));
                };
                if frame.seen_else {
                    return Err(Diagnostic::error(
                        DiagnosticKind::UnclosedConditional,
                        loc.clone(),
                        "second .else in one conditional",
                    ));
                }
                frame.seen_else = true;
                // Output stays suppressed if an enclosing frame skips
                if !frame.parent_skipping {
                    frame.my_condition = !frame.my_condition;
                }
                return Ok(());
            }
            ".endif" => {
                if self.cond_stack.pop().is_none() {
                    return Err(Diagnostic::error(
                        DiagnosticKind::UnclosedConditional,
                        loc.clone(),
                        ".endif without .ifdef/.ifndef",
                    ));
                }
                return Ok(());
            }
            _ => {}
        }

        if self.skipping() {
            return Ok(());
        }

        match lowered.as_str() {
            ".macro" => {
                let mut parts = rest.split([' ', '\t', ',']).filter(|s| !s.is_empty());
                let Some(name) = parts.next() else {
                    return Err(Diagnostic::error(
                        DiagnosticKind::Parse,
                        loc.clone(),
                        ".macro needs a name",
                    ));
                };
                self.capturing = Some((
                    name.to_string(),
                    Macro {
                        params: parts.map(str::to_string).collect(),
                        body: Vec::new(),
                    },
                ));
                Ok(())
            }
            ".endm" => Err(Diagnostic::error(
                DiagnosticKind::Parse,
                loc.clone(),
                ".endm without .macro",
            )),
            ".include" => {
                let name = rest.trim().trim_matches('"');
                if name.is_empty() {
                    return Err(Diagnostic::error(
                        DiagnosticKind::Parse,
                        loc.clone(),
                        ".include needs a quoted file name",
                    ));
                }
                self.include(name, loc, depth, out)
            }
            _ => {
                // Track definitions for later .ifdef checks
                if lowered == ".equ" || lowered == ".set" {
                    if let Some(name) = rest.split(',').next() {
                        self.defined.insert(name.trim().to_string());
                    }
                } else if let Some(label) = word.strip_suffix(':') {
                    if !label.is_empty() {
                        self.defined.insert(label.to_string());
                    }
                }

                // Macro invocation?
                if self.macros.contains_key(word) {
                    return self.expand(word, rest, loc, depth, out);
                }

                if !trimmed.is_empty() {
                    out.push(SourceLine {
                        text: raw.to_string(),
                        loc: loc.clone(),
                    });
                }
                Ok(())
            }
        }
    }

    fn include(
        &mut self,
        name: &str,
        loc: &SourceLoc,
        depth: usize,
        out: &mut Vec<SourceLine>,
    ) -> Result<(), Diagnostic> {
        let path = self.resolve_include(name, loc)?;
        let canonical = path.canonicalize().map_err(|e| {
            Diagnostic::error(
                DiagnosticKind::Parse,
                loc.clone(),
                format!("cannot include '{name}': {e}"),
            )
        })?;
        if self.include_stack.contains(&canonical) {
            return Err(Diagnostic::error(
                DiagnosticKind::CircularInclude,
                loc.clone(),
                format!("'{name}' includes itself"),
            ));
        }
        let text = fs::read_to_string(&canonical).map_err(|e| {
            Diagnostic::error(
                DiagnosticKind::Parse,
                loc.clone(),
                format!("cannot read '{name}': {e}"),
            )
        })?;
        self.include_stack.push(canonical.clone());
        for (idx, raw) in text.lines().enumerate() {
            let inner_loc = SourceLoc {
                file: Some(canonical.clone()),
                line: idx + 1,
                col: 1,
            };
            self.line(raw, &inner_loc, depth, out)?;
        }
        self.include_stack.pop();
        Ok(())
    }

    fn resolve_include(&self, name: &str, loc: &SourceLoc) -> Result<PathBuf, Diagnostic> {
        let mut candidates = Vec::new();
        // Relative to the including file first
        if let Some(dir) = self
            .include_stack
            .last()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
        {
            candidates.push(dir.join(name));
        }
        for dir in &self.include_dirs {
            candidates.push(dir.join(name));
        }
        candidates.push(PathBuf::from(name));
        candidates
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                Diagnostic::error(
                    DiagnosticKind::Parse,
                    loc.clone(),
                    format!("include file '{name}' not found"),
                )
            })
    }

    fn expand(
        &mut self,
        name: &str,
        args_text: &str,
        loc: &SourceLoc,
        depth: usize,
        out: &mut Vec<SourceLine>,
    ) -> Result<(), Diagnostic> {
        if depth >= MAX_MACRO_DEPTH {
            return Err(Diagnostic::error(
                DiagnosticKind::Parse,
                loc.clone(),
                format!("macro '{name}' recursion too deep"),
            ));
        }
        let mac = self.macros[name].clone();
        let args: Vec<&str> = if args_text.trim().is_empty() {
            Vec::new()
        } else {
            args_text.split(',').map(str::trim).collect()
        };
        if args.len() != mac.params.len() {
            return Err(Diagnostic::error(
                DiagnosticKind::Parse,
                loc.clone(),
                format!(
                    "macro '{name}' takes {} argument(s), got {}",
                    mac.params.len(),
                    args.len()
                ),
            ));
        }
        for body_line in &mac.body {
            let mut text = body_line.text.clone();
            for (param, arg) in mac.params.iter().zip(&args) {
                text = text.replace(&format!("\\{param}"), arg);
            }
            // Expanded lines report the invocation site
            self.line(&text, loc, depth + 1, out)?;
        }
        Ok(())
    }
}

/// Split off the first whitespace-delimited word.
fn split_first_word(s: &str) -> (&str, &str) {
    match s.find(char::is_whitespace) {
        Some(n) => (&s[..n], &s[n..]),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> Vec<String> {
        Preprocessor::new(Vec::new(), &[])
            .run(text, None)
            .expect("preprocess succeeds")
            .into_iter()
            .map(|l| l.text.trim().to_string())
            .collect()
    }

    #[test]
    fn ifdef_skips_undefined() {
        let lines = run(".ifdef DEBUG\nMOV R0, #1\n.endif\nMOV R1, #2");
        assert_eq!(lines, vec!["MOV R1, #2"]);
    }

    #[test]
    fn ifdef_keeps_defined() {
        let lines = run(".equ DEBUG, 1\n.ifdef DEBUG\nMOV R0, #1\n.endif");
        assert_eq!(lines, vec![".equ DEBUG, 1", "MOV R0, #1"]);
    }

    #[test]
    fn else_flips() {
        let lines = run(".ifdef MISSING\nMOV R0, #1\n.else\nMOV R0, #2\n.endif");
        assert_eq!(lines, vec!["MOV R0, #2"]);
    }

    #[test]
    fn nested_skip_suppresses_else() {
        // The inner .else must not resurrect output while the outer
        // conditional is skipping
        let lines = run(
            ".ifdef MISSING\n.ifdef ALSO_MISSING\nA\n.else\nB\n.endif\n.endif\nC",
        );
        assert_eq!(lines, vec!["C"]);
    }

    #[test]
    fn unclosed_conditional_is_an_error() {
        let err = Preprocessor::new(Vec::new(), &[])
            .run(".ifdef X\nMOV R0, #1", None)
            .expect_err("must fail");
        assert_eq!(err.kind, DiagnosticKind::UnclosedConditional);
    }

    #[test]
    fn labels_count_as_defined() {
        let lines = run("start:\n.ifdef start\nMOV R0, #1\n.endif");
        assert_eq!(lines, vec!["start:", "MOV R0, #1"]);
    }

    #[test]
    fn macro_expands_with_params() {
        let lines = run(
            ".macro inc reg, amount\nADD \\reg, \\reg, #\\amount\n.endm\ninc R0, 4\ninc R1, 8",
        );
        assert_eq!(lines, vec!["ADD R0, R0, #4", "ADD R1, R1, #8"]);
    }

    #[test]
    fn self_recursive_macro_is_capped() {
        let err = Preprocessor::new(Vec::new(), &[])
            .run(".macro spin\nspin\n.endm\nspin", None)
            .expect_err("must fail");
        assert!(err.message.contains("recursion"));
    }

    #[test]
    fn predefines_work() {
        let lines = Preprocessor::new(Vec::new(), &["DEBUG".to_string()])
            .run(".ifdef DEBUG\nMOV R0, #1\n.endif", None)
            .expect("preprocess succeeds")
            .into_iter()
            .map(|l| l.text)
            .collect::<Vec<_>>();
        assert_eq!(lines, vec!["MOV R0, #1"]);
    }
}
