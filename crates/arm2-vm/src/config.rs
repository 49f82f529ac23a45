//! VM configuration.

use std::path::PathBuf;

/// Tunables for one VM instance. Everything has a spec-default; tests
/// tighten limits and redirect the filesystem root.
pub struct VmConfig {
    /// Instructions executed before `CycleLimit` aborts the run.
    pub cycle_limit: u64,
    /// Wall-clock budget in milliseconds; 0 disables the check.
    pub wall_clock_ms: u64,
    /// Largest sum of live heap allocations the guest may hold.
    pub heap_cap: u32,
    /// WRITE_STRING scans at most this many bytes before `StringTooLong`.
    pub max_string_len: u32,
    /// READ_STRING reads at most this many bytes regardless of R1.
    pub max_input_len: u32,
    /// Root directory guest file operations are confined to.
    pub fs_root: PathBuf,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cycle_limit: 1_000_000,
            wall_clock_ms: 10_000,
            heap_cap: 16 * 1024 * 1024,
            max_string_len: 1024 * 1024,
            max_input_len: 4096,
            fs_root: PathBuf::from("."),
        }
    }
}
