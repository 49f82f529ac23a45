//! ARM2 debugger core.
//!
//! Frontends drive the machine exclusively through [`Debugger`]: the
//! stepping modes, breakpoints and watchpoints, the expression
//! evaluator with `$N` history, and source/symbol maps. Control-flow
//! transitions surface as [`StopReason`] values, never as unwinding.

mod breakpoints;
mod debugger;
mod expr;

pub use breakpoints::{Breakpoint, BreakpointStore, WatchKind, Watchpoint, WatchpointStore};
pub use debugger::{Debugger, StopReason};
pub use expr::{EvalContext, EvalError, evaluate};
