//! Core traits and types for the ARM2 toolchain.
//!
//! The CPU executes against anything that implements [`Bus`]; the VM's
//! segmented memory is one implementation, flat test RAM is another.
//! Faults are values, not panics: every access returns a `Result` so the
//! guest sees segmentation semantics and the debugger can recover.

mod bus;
mod event;
mod fault;

pub use bus::{Bus, FlatBus, MemAccess};
pub use event::ExecEvent;
pub use fault::{AccessKind, AccessWidth, MemFault};
