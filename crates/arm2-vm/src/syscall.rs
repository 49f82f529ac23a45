//! The syscall surface.
//!
//! SWI numbers dispatch here. Two failure planes exist and never mix:
//! operational failures (file not found, bad fd, sandbox refusal) write
//! `0xFFFFFFFF` to R0 and an errno-style code to a side channel the
//! guest reads with GET_ERROR; VM-integrity failures (faulting argument
//! or buffer addresses, unknown numbers) abort the run.

use std::io::{Read, Seek, SeekFrom, Write};

use acorn_arm2::Registers;

use crate::clock::{Clock, Rng};
use crate::config::VmConfig;
use crate::heap::HeapAllocator;
use crate::io::GuestIo;
use crate::memory::Memory;
use crate::sandbox::{FileTable, OpenMode, Sandbox, SandboxError};
use crate::vm::VmError;

/// Errno-style codes surfaced through GET_ERROR.
pub mod errno {
    pub const NONE: u32 = 0;
    pub const NOT_FOUND: u32 = 1;
    pub const PERMISSION: u32 = 2;
    pub const BAD_FD: u32 = 3;
    pub const SANDBOX: u32 = 4;
    pub const IO: u32 = 5;
    pub const BAD_ARG: u32 = 6;
    pub const END_OF_INPUT: u32 = 7;
    pub const OUT_OF_MEMORY: u32 = 8;
}

/// Syscall numbers.
pub mod numbers {
    pub const EXIT: u32 = 0x00;
    pub const WRITE_CHAR: u32 = 0x01;
    pub const WRITE_STRING: u32 = 0x02;
    pub const WRITE_INT: u32 = 0x03;
    pub const READ_CHAR: u32 = 0x04;
    pub const READ_STRING: u32 = 0x05;
    pub const READ_INT: u32 = 0x06;
    pub const WRITE_NEWLINE: u32 = 0x07;
    pub const OPEN: u32 = 0x10;
    pub const CLOSE: u32 = 0x11;
    pub const READ_FILE: u32 = 0x12;
    pub const WRITE_FILE: u32 = 0x13;
    pub const SEEK: u32 = 0x14;
    pub const TELL: u32 = 0x15;
    pub const FILE_SIZE: u32 = 0x16;
    pub const ALLOCATE: u32 = 0x20;
    pub const FREE: u32 = 0x21;
    pub const REALLOCATE: u32 = 0x22;
    pub const GET_TIME: u32 = 0x30;
    pub const GET_RANDOM: u32 = 0x31;
    pub const GET_ERROR: u32 = 0x32;
    pub const DEBUG_REGS: u32 = 0xF0;
    pub const DEBUG_BREAK: u32 = 0xF1;
    pub const DEBUG_DUMP: u32 = 0xF2;
    pub const ASSERT_EQ: u32 = 0xF3;
    pub const DEBUG_STACK: u32 = 0xF4;
}

/// Operational failure marker returned in R0.
const FAIL: u32 = 0xFFFF_FFFF;

/// What the machine layer should do after a handled syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallOutcome {
    Continue,
    /// EXIT: the guest is done.
    Halt(u8),
    /// DEBUG_BREAK: hand control to the debugger.
    Break,
}

/// Split borrows of the VM a handler may touch.
pub struct SyscallCtx<'a> {
    pub regs: &'a mut Registers,
    pub mem: &'a mut Memory,
    pub heap: &'a mut HeapAllocator,
    pub io: &'a mut GuestIo,
    pub files: &'a mut FileTable,
    pub sandbox: Option<&'a Sandbox>,
    pub clock: &'a dyn Clock,
    pub rng: &'a mut dyn Rng,
    pub config: &'a VmConfig,
    pub last_error: &'a mut u32,
}

impl SyscallCtx<'_> {
    fn fail(&mut self, code: u32) {
        self.regs.set(0, FAIL);
        *self.last_error = code;
    }

    /// Read a NUL-terminated guest string, bounded by the configured
    /// maximum. Faults are integrity errors; over-length is fatal too.
    fn read_c_string(&mut self, addr: u32) -> Result<Vec<u8>, VmError> {
        let mut out = Vec::new();
        let mut cursor = addr;
        loop {
            if out.len() as u32 >= self.config.max_string_len {
                return Err(VmError::StringTooLong { addr });
            }
            let bytes = self.mem.read_bytes(cursor, 1).map_err(VmError::Memory)?;
            if bytes[0] == 0 {
                return Ok(out);
            }
            out.push(bytes[0]);
            cursor = cursor
                .checked_add(1)
                .ok_or(VmError::Memory(arm2_core::MemFault::AddressOverflow(addr)))?;
        }
    }

    /// Read one input line (newline consumed, not returned), bounded.
    fn read_line(&mut self, cap: usize) -> Option<Vec<u8>> {
        let first = self.io.read_byte_blocking()?;
        let mut line = Vec::new();
        let mut byte = first;
        loop {
            if byte == b'\n' {
                return Some(line);
            }
            if byte != b'\r' {
                line.push(byte);
            }
            if line.len() >= cap {
                return Some(line);
            }
            byte = match self.io.read_byte_blocking() {
                Some(b) => b,
                None => return Some(line),
            };
        }
    }
}

/// Dispatch one SWI.
pub fn dispatch(ctx: &mut SyscallCtx<'_>, number: u32) -> Result<SyscallOutcome, VmError> {
    use numbers as n;
    match number {
        n::EXIT => return Ok(SyscallOutcome::Halt(ctx.regs.get(0) as u8)),
        n::WRITE_CHAR => {
            let byte = ctx.regs.get(0) as u8;
            ctx.io.write_stdout(&[byte]);
        }
        n::WRITE_STRING => {
            let bytes = ctx.read_c_string(ctx.regs.get(0))?;
            ctx.io.write_stdout(&bytes);
        }
        n::WRITE_INT => {
            let value = ctx.regs.get(0);
            let text = match ctx.regs.get(1) {
                2 => format!("{value:b}"),
                8 => format!("{value:o}"),
                10 => format!("{}", value as i32),
                16 => format!("{value:X}"),
                _ => {
                    ctx.fail(errno::BAD_ARG);
                    return Ok(SyscallOutcome::Continue);
                }
            };
            ctx.io.write_stdout(text.as_bytes());
        }
        n::READ_CHAR => match ctx.io.read_byte_blocking() {
            Some(byte) => ctx.regs.set(0, u32::from(byte)),
            None => ctx.fail(errno::END_OF_INPUT),
        },
        n::READ_STRING => {
            let buf = ctx.regs.get(0);
            let max = ctx.regs.get(1).min(ctx.config.max_input_len);
            if max == 0 {
                ctx.fail(errno::BAD_ARG);
                return Ok(SyscallOutcome::Continue);
            }
            match ctx.read_line((max - 1) as usize) {
                Some(mut line) => {
                    line.push(0);
                    let len = line.len() as u32 - 1;
                    ctx.mem.write_bytes(buf, &line).map_err(VmError::Memory)?;
                    ctx.regs.set(0, len);
                }
                None => ctx.fail(errno::END_OF_INPUT),
            }
        }
        n::READ_INT => match ctx.read_line(128) {
            Some(line) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                let parsed = if let Some(hex) = text
                    .strip_prefix("0x")
                    .or_else(|| text.strip_prefix("0X"))
                {
                    u32::from_str_radix(hex, 16).map(|v| v as i64)
                } else {
                    text.parse::<i64>()
                };
                match parsed {
                    Ok(value) if i64::from(i32::MIN) <= value && value <= i64::from(u32::MAX) => {
                        ctx.regs.set(0, value as u32);
                    }
                    _ => ctx.fail(errno::BAD_ARG),
                }
            }
            None => ctx.fail(errno::END_OF_INPUT),
        },
        n::WRITE_NEWLINE => ctx.io.write_stdout(b"\n"),
        n::OPEN => open(ctx)?,
        n::CLOSE => {
            let fd = ctx.regs.get(0);
            if ctx.files.close(fd) {
                ctx.regs.set(0, 0);
            } else {
                ctx.fail(errno::BAD_FD);
            }
        }
        n::READ_FILE => read_file(ctx)?,
        n::WRITE_FILE => write_file(ctx)?,
        n::SEEK | n::TELL | n::FILE_SIZE => seek_family(ctx, number),
        n::ALLOCATE => {
            let size = ctx.regs.get(0);
            match ctx.heap.allocate(size) {
                Some(addr) => ctx.regs.set(0, addr),
                None => {
                    *ctx.last_error = errno::OUT_OF_MEMORY;
                    ctx.regs.set(0, 0);
                }
            }
        }
        n::FREE => {
            let addr = ctx.regs.get(0);
            if ctx.heap.free(addr) {
                ctx.regs.set(0, 0);
            } else {
                ctx.fail(errno::BAD_ARG);
            }
        }
        n::REALLOCATE => reallocate(ctx),
        n::GET_TIME => {
            let ms = ctx.clock.now_ms();
            ctx.regs.set(0, ms as u32);
        }
        n::GET_RANDOM => {
            let value = ctx.rng.next_u32();
            ctx.regs.set(0, value);
        }
        n::GET_ERROR => {
            let code = *ctx.last_error;
            *ctx.last_error = errno::NONE;
            ctx.regs.set(0, code);
        }
        n::DEBUG_REGS => debug_regs(ctx),
        n::DEBUG_BREAK => return Ok(SyscallOutcome::Break),
        n::DEBUG_DUMP => debug_dump(ctx),
        n::ASSERT_EQ => {
            let (actual, expected) = (ctx.regs.get(0), ctx.regs.get(1));
            if actual != expected {
                return Err(VmError::AssertionFailed { actual, expected });
            }
        }
        n::DEBUG_STACK => debug_stack(ctx),
        unknown => return Err(VmError::UnknownSyscall(unknown)),
    }
    Ok(SyscallOutcome::Continue)
}

fn open(ctx: &mut SyscallCtx<'_>) -> Result<(), VmError> {
    let path_bytes = ctx.read_c_string(ctx.regs.get(0))?;
    let path = String::from_utf8_lossy(&path_bytes).into_owned();
    let Some(mode) = OpenMode::from_guest(ctx.regs.get(1)) else {
        ctx.fail(errno::BAD_ARG);
        return Ok(());
    };
    let Some(sandbox) = ctx.sandbox else {
        ctx.fail(errno::SANDBOX);
        return Ok(());
    };
    let resolved = match sandbox.resolve(&path) {
        Ok(resolved) => resolved,
        Err(SandboxError::Escape(_)) => {
            ctx.io
                .warn(&format!("sandbox: refusing path '{path}' outside fs root"));
            ctx.fail(errno::SANDBOX);
            return Ok(());
        }
        Err(SandboxError::Io(_)) => {
            ctx.fail(errno::NOT_FOUND);
            return Ok(());
        }
    };
    match ctx.files.open(&resolved, mode) {
        Ok(fd) => ctx.regs.set(0, fd),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ctx.fail(errno::NOT_FOUND),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            ctx.fail(errno::PERMISSION);
        }
        Err(_) => ctx.fail(errno::IO),
    }
    Ok(())
}

/// Largest single file read/write the guest may request.
const MAX_FILE_CHUNK: u32 = 1024 * 1024;

fn read_file(ctx: &mut SyscallCtx<'_>) -> Result<(), VmError> {
    let fd = ctx.regs.get(0);
    let buf = ctx.regs.get(1);
    let len = ctx.regs.get(2).min(MAX_FILE_CHUNK);
    let Some(file) = ctx.files.get(fd) else {
        ctx.fail(errno::BAD_FD);
        return Ok(());
    };
    let mut data = vec![0u8; len as usize];
    match file.read(&mut data) {
        Ok(n) => {
            ctx.mem
                .write_bytes(buf, &data[..n])
                .map_err(VmError::Memory)?;
            ctx.regs.set(0, n as u32);
        }
        Err(_) => ctx.fail(errno::IO),
    }
    Ok(())
}

fn write_file(ctx: &mut SyscallCtx<'_>) -> Result<(), VmError> {
    let fd = ctx.regs.get(0);
    let buf = ctx.regs.get(1);
    let len = ctx.regs.get(2).min(MAX_FILE_CHUNK);
    let data = ctx.mem.read_bytes(buf, len).map_err(VmError::Memory)?;
    let Some(file) = ctx.files.get(fd) else {
        ctx.fail(errno::BAD_FD);
        return Ok(());
    };
    match file.write_all(&data) {
        Ok(()) => ctx.regs.set(0, len),
        Err(_) => ctx.fail(errno::IO),
    }
    Ok(())
}

fn seek_family(ctx: &mut SyscallCtx<'_>, number: u32) {
    let fd = ctx.regs.get(0);
    let offset = ctx.regs.get(1) as i32;
    let whence = ctx.regs.get(2);
    let Some(file) = ctx.files.get(fd) else {
        ctx.fail(errno::BAD_FD);
        return;
    };
    let result = match number {
        numbers::SEEK => {
            let from = match whence {
                0 => SeekFrom::Start(offset.max(0) as u64),
                1 => SeekFrom::Current(i64::from(offset)),
                2 => SeekFrom::End(i64::from(offset)),
                _ => {
                    ctx.fail(errno::BAD_ARG);
                    return;
                }
            };
            file.seek(from)
        }
        numbers::TELL => file.stream_position(),
        _ => file.metadata().map(|m| m.len()),
    };
    match result {
        Ok(value) => ctx.regs.set(0, value as u32),
        Err(_) => ctx.fail(errno::IO),
    }
}

fn reallocate(ctx: &mut SyscallCtx<'_>) {
    let addr = ctx.regs.get(0);
    let new_size = ctx.regs.get(1);
    if addr == 0 {
        let result = ctx.heap.allocate(new_size).unwrap_or(0);
        if result == 0 {
            *ctx.last_error = errno::OUT_OF_MEMORY;
        }
        ctx.regs.set(0, result);
        return;
    }
    let Some(old_size) = ctx.heap.size_of(addr) else {
        *ctx.last_error = errno::BAD_ARG;
        ctx.regs.set(0, 0);
        return;
    };
    let Some(new_addr) = ctx.heap.allocate(new_size) else {
        *ctx.last_error = errno::OUT_OF_MEMORY;
        ctx.regs.set(0, 0);
        return;
    };
    // Copy the surviving prefix; raw pokes keep watchpoints quiet for
    // what is an allocator-internal move
    let keep = old_size.min(new_size);
    if let Some(bytes) = ctx.mem.peek_bytes(addr, keep) {
        let _ = ctx.mem.poke_bytes(new_addr, &bytes);
    }
    ctx.heap.free(addr);
    ctx.regs.set(0, new_addr);
}

fn debug_regs(ctx: &mut SyscallCtx<'_>) {
    let raw = ctx.regs.raw();
    let flags = ctx.regs.cpsr;
    let sink = ctx.io.stderr();
    for (i, chunk) in raw.chunks(4).enumerate() {
        let mut line = String::new();
        for (j, value) in chunk.iter().enumerate() {
            let reg = i * 4 + j;
            line.push_str(&format!("R{reg:<2}={value:08X} "));
        }
        let _ = writeln!(sink, "{line}");
    }
    let _ = writeln!(sink, "flags={flags}");
}

fn debug_dump(ctx: &mut SyscallCtx<'_>) {
    let addr = ctx.regs.get(0) & !0xF;
    let len = ctx.regs.get(1).min(4096);
    match ctx.mem.peek_bytes(addr, len) {
        Some(bytes) => {
            let mut output = String::new();
            for (i, chunk) in bytes.chunks(16).enumerate() {
                output.push_str(&format!("{:08X}: ", addr + 16 * i as u32));
                for byte in chunk {
                    output.push_str(&format!("{byte:02X} "));
                }
                output.push('\n');
            }
            let _ = write!(ctx.io.stderr(), "{output}");
        }
        None => ctx
            .io
            .warn(&format!("debug dump: {addr:#010X}+{len} is not mapped")),
    }
}

fn debug_stack(ctx: &mut SyscallCtx<'_>) {
    let sp = ctx.regs.get(13);
    let mut output = String::new();
    for i in 0..16u32 {
        let addr = sp.wrapping_add(4 * i);
        match ctx.mem.peek_word(addr) {
            Some(word) => output.push_str(&format!("{addr:08X}: {word:08X}\n")),
            None => break,
        }
    }
    let _ = write!(ctx.io.stderr(), "{output}");
}
