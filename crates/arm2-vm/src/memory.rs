//! Segmented guest memory.
//!
//! A flat table of named, non-overlapping segments, each an exclusively
//! owned byte buffer with read/write/execute permissions. Address
//! resolution scans the table; first match wins. Every access is
//! permission-, alignment-, and overflow-checked before any byte moves,
//! and successful accesses are recorded by value for watchpoints and
//! trace observers.

use std::fmt;

use arm2_core::{AccessKind, AccessWidth, Bus, MemAccess, MemFault};

/// Standard layout bases. Segments must be disjoint, so the code
/// segment spans the 32 KiB between its base and the data base.
pub const CODE_BASE: u32 = 0x0000_8000;
pub const CODE_SIZE: u32 = 0x0000_8000;
pub const DATA_BASE: u32 = 0x0001_0000;
pub const BSS_BASE: u32 = 0x0002_0000;
pub const HEAP_BASE: u32 = 0x0003_0000;
pub const STACK_BASE: u32 = 0x0004_0000;
pub const SEGMENT_SIZE: u32 = 0x0001_0000;
/// Initial SP: one past the top of the stack segment.
pub const STACK_TOP: u32 = STACK_BASE + SEGMENT_SIZE;

/// Segment permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Perm {
    pub r: bool,
    pub w: bool,
    pub x: bool,
}

impl Perm {
    pub const RW: Self = Self {
        r: true,
        w: true,
        x: false,
    };
    pub const RWX: Self = Self {
        r: true,
        w: true,
        x: true,
    };
    pub const RX: Self = Self {
        r: true,
        w: false,
        x: true,
    };

    const fn allows(self, kind: AccessKind) -> bool {
        match kind {
            AccessKind::Read => self.r,
            AccessKind::Write => self.w,
            AccessKind::Execute => self.x,
        }
    }
}

impl fmt::Display for Perm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |set: bool, ch: char| if set { ch } else { '-' };
        write!(f, "{}{}{}", bit(self.r, 'r'), bit(self.w, 'w'), bit(self.x, 'x'))
    }
}

/// One contiguous region of guest memory.
#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub start: u32,
    pub size: u32,
    pub perm: Perm,
    data: Vec<u8>,
}

impl Segment {
    fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr - self.start < self.size
    }

    /// The segment's bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Segment creation failure (not a guest-visible fault).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    Overlap { name: String, other: String },
    ZeroSize { name: String },
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overlap { name, other } => {
                write!(f, "segment '{name}' overlaps '{other}'")
            }
            Self::ZeroSize { name } => write!(f, "segment '{name}' has zero size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// The guest memory map.
pub struct Memory {
    segments: Vec<Segment>,
    /// Accesses since the last drain, in instruction order.
    access_log: Vec<MemAccess>,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    /// An empty map with no segments.
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: Vec::new(),
            access_log: Vec::new(),
        }
    }

    /// The standard five-segment layout. Code is RWX so programs can
    /// interleave data with code; the loader may lock it down afterwards
    /// with [`make_code_read_only`](Self::make_code_read_only).
    #[must_use]
    pub fn with_standard_layout() -> Self {
        let mut mem = Self::new();
        let segments = [
            ("code", CODE_BASE, CODE_SIZE, Perm::RWX),
            ("data", DATA_BASE, SEGMENT_SIZE, Perm::RW),
            ("bss", BSS_BASE, SEGMENT_SIZE, Perm::RW),
            ("heap", HEAP_BASE, SEGMENT_SIZE, Perm::RW),
            ("stack", STACK_BASE, SEGMENT_SIZE, Perm::RW),
        ];
        for (name, start, size, perm) in segments {
            mem.add_segment(name, start, size, perm)
                .expect("standard layout does not overlap");
        }
        mem
    }

    pub fn add_segment(
        &mut self,
        name: &str,
        start: u32,
        size: u32,
        perm: Perm,
    ) -> Result<(), MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize {
                name: name.to_string(),
            });
        }
        let end = u64::from(start) + u64::from(size);
        for other in &self.segments {
            let other_end = u64::from(other.start) + u64::from(other.size);
            if u64::from(start) < other_end && u64::from(other.start) < end {
                return Err(MemoryError::Overlap {
                    name: name.to_string(),
                    other: other.name.clone(),
                });
            }
        }
        self.segments.push(Segment {
            name: name.to_string(),
            start,
            size,
            perm,
            data: vec![0; size as usize],
        });
        Ok(())
    }

    /// Does any segment cover this address?
    #[must_use]
    pub fn is_mapped(&self, addr: u32) -> bool {
        self.segments.iter().any(|s| s.contains(addr))
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Drop write and execute permission on the code segment.
    pub fn make_code_read_only(&mut self) {
        for segment in &mut self.segments {
            if segment.name == "code" {
                segment.perm = Perm::RX;
            }
        }
    }

    /// Take the accesses recorded since the last call.
    pub fn drain_accesses(&mut self) -> Vec<MemAccess> {
        std::mem::take(&mut self.access_log)
    }

    /// Locate the segment for an access of `len` bytes, after overflow
    /// and alignment checks. Every successful access touches exactly one
    /// segment.
    fn resolve(
        &mut self,
        addr: u32,
        len: u32,
        align: u32,
        kind: AccessKind,
    ) -> Result<&mut Segment, MemFault> {
        // Overflow is computed against the pre-addition base
        if addr > u32::MAX - (len - 1) {
            return Err(MemFault::AddressOverflow(addr));
        }
        if align > 1 && addr % align != 0 {
            let width = if align == 2 {
                AccessWidth::Half
            } else {
                AccessWidth::Word
            };
            return Err(MemFault::Misaligned(width, addr));
        }
        let segment = self
            .segments
            .iter_mut()
            .find(|s| s.contains(addr))
            .ok_or(MemFault::Unmapped(addr))?;
        if !segment.contains(addr + len - 1) {
            // Straddling a segment boundary reads as unmapped past it
            return Err(MemFault::Unmapped(segment.start + segment.size));
        }
        if !segment.perm.allows(kind) {
            return Err(MemFault::Permission(kind, addr));
        }
        Ok(segment)
    }

    fn log(&mut self, kind: AccessKind, addr: u32, len: u32, value: u32) {
        self.access_log.push(MemAccess {
            kind,
            addr,
            len,
            value,
        });
    }

    fn read(&mut self, addr: u32, len: u32, align: u32, kind: AccessKind) -> Result<u32, MemFault> {
        let segment = self.resolve(addr, len, align, kind)?;
        let offset = (addr - segment.start) as usize;
        let mut value: u32 = 0;
        for i in (0..len as usize).rev() {
            value = value << 8 | u32::from(segment.data[offset + i]);
        }
        self.log(kind, addr, len, value);
        Ok(value)
    }

    fn write(&mut self, addr: u32, len: u32, align: u32, value: u32) -> Result<(), MemFault> {
        let segment = self.resolve(addr, len, align, AccessKind::Write)?;
        let offset = (addr - segment.start) as usize;
        for i in 0..len as usize {
            segment.data[offset + i] = (value >> (8 * i)) as u8;
        }
        self.log(AccessKind::Write, addr, len, value);
        Ok(())
    }

    /// Read bytes without logging, permission checks, or side effects.
    /// Debugger and diagnostics only.
    #[must_use]
    pub fn peek_bytes(&self, addr: u32, len: u32) -> Option<Vec<u8>> {
        if len == 0 {
            return Some(Vec::new());
        }
        if addr > u32::MAX - (len - 1) {
            return None;
        }
        let segment = self.segments.iter().find(|s| s.contains(addr))?;
        if !segment.contains(addr + len - 1) {
            return None;
        }
        let offset = (addr - segment.start) as usize;
        Some(segment.data[offset..offset + len as usize].to_vec())
    }

    /// Word peek for the debugger's expression evaluator.
    #[must_use]
    pub fn peek_word(&self, addr: u32) -> Option<u32> {
        if addr % 4 != 0 {
            return None;
        }
        let bytes = self.peek_bytes(addr, 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write bytes without logging or permission checks. Loader only.
    pub fn poke_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len() as u32;
        if addr > u32::MAX - (len - 1) {
            return Err(MemFault::AddressOverflow(addr));
        }
        let segment = self
            .segments
            .iter_mut()
            .find(|s| s.contains(addr))
            .ok_or(MemFault::Unmapped(addr))?;
        if !segment.contains(addr + len - 1) {
            return Err(MemFault::Unmapped(segment.start + segment.size));
        }
        let offset = (addr - segment.start) as usize;
        segment.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Logged multi-byte read for syscalls (one segment, byte-aligned).
    pub fn read_bytes(&mut self, addr: u32, len: u32) -> Result<Vec<u8>, MemFault> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let segment = self.resolve(addr, len, 1, AccessKind::Read)?;
        let offset = (addr - segment.start) as usize;
        let bytes = segment.data[offset..offset + len as usize].to_vec();
        self.log(AccessKind::Read, addr, len, 0);
        Ok(bytes)
    }

    /// Logged multi-byte write for syscalls (one segment, byte-aligned).
    pub fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemFault> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = bytes.len() as u32;
        let segment = self.resolve(addr, len, 1, AccessKind::Write)?;
        let offset = (addr - segment.start) as usize;
        segment.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.log(AccessKind::Write, addr, len, 0);
        Ok(())
    }
}

impl Bus for Memory {
    fn read_byte(&mut self, addr: u32) -> Result<u8, MemFault> {
        Ok(self.read(addr, 1, 1, AccessKind::Read)? as u8)
    }

    fn read_half(&mut self, addr: u32) -> Result<u16, MemFault> {
        Ok(self.read(addr, 2, 2, AccessKind::Read)? as u16)
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, MemFault> {
        self.read(addr, 4, 4, AccessKind::Read)
    }

    fn write_byte(&mut self, addr: u32, value: u8) -> Result<(), MemFault> {
        self.write(addr, 1, 1, u32::from(value))
    }

    fn write_half(&mut self, addr: u32, value: u16) -> Result<(), MemFault> {
        self.write(addr, 2, 2, u32::from(value))
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), MemFault> {
        self.write(addr, 4, 4, value)
    }

    fn fetch_word(&mut self, addr: u32) -> Result<u32, MemFault> {
        self.read(addr, 4, 4, AccessKind::Execute)
    }
}
