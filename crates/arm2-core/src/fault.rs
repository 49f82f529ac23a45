//! Memory fault kinds.

use std::fmt;

/// What an access was trying to do when it faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Width of a memory access, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    Byte,
    Half,
    Word,
}

impl AccessWidth {
    /// Size of the access in bytes.
    #[must_use]
    pub const fn len(self) -> u32 {
        match self {
            Self::Byte => 1,
            Self::Half => 2,
            Self::Word => 4,
        }
    }

    /// Required address alignment for this width.
    #[must_use]
    pub const fn alignment(self) -> u32 {
        self.len()
    }
}

/// A failed memory access.
///
/// Fatal for the guest, recoverable from the debugger (inspect, reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemFault {
    /// No segment covers the address.
    Unmapped(u32),
    /// A segment covers the address but forbids this kind of access.
    Permission(AccessKind, u32),
    /// Word or halfword access at an unaligned address.
    Misaligned(AccessWidth, u32),
    /// `address + length` would wrap past the top of the address space.
    AddressOverflow(u32),
}

impl MemFault {
    /// The faulting address.
    #[must_use]
    pub const fn address(&self) -> u32 {
        match self {
            Self::Unmapped(a)
            | Self::Permission(_, a)
            | Self::Misaligned(_, a)
            | Self::AddressOverflow(a) => *a,
        }
    }
}

impl fmt::Display for MemFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unmapped(addr) => write!(f, "unmapped address {addr:#010X}"),
            Self::Permission(kind, addr) => {
                write!(f, "{kind} not permitted at {addr:#010X}")
            }
            Self::Misaligned(width, addr) => write!(
                f,
                "misaligned {}-byte access at {addr:#010X}",
                width.len()
            ),
            Self::AddressOverflow(addr) => {
                write!(f, "address overflow past {addr:#010X}")
            }
        }
    }
}

impl std::error::Error for MemFault {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_reports_address() {
        assert_eq!(MemFault::Unmapped(0x1234).address(), 0x1234);
        assert_eq!(
            MemFault::Misaligned(AccessWidth::Word, 0x8001).address(),
            0x8001
        );
    }

    #[test]
    fn display_mentions_kind() {
        let msg = MemFault::Permission(AccessKind::Write, 0x8000).to_string();
        assert!(msg.contains("write"), "got: {msg}");
    }
}
