//! Guest I/O plumbing.
//!
//! Guest stdin is a single-producer single-consumer byte pipe: the
//! frontend (or a second thread) feeds bytes in, blocking reads take
//! them out directly, and dropping every sender unblocks a waiting read
//! with end-of-input. No lock is held across a blocking read. Stdout and
//! the warning sink are plain byte sinks the frontend drains.

use std::io::{self, Write};
use std::sync::mpsc::{Receiver, Sender, channel};

/// Guest-facing standard streams.
pub struct GuestIo {
    stdin_rx: Receiver<u8>,
    /// The VM's own producer handle; `close_stdin` drops it.
    stdin_tx: Option<Sender<u8>>,
    stdout: Vec<u8>,
    /// Warning sink (sandbox violations, debug helpers). Defaults to
    /// the process stderr.
    stderr: Box<dyn Write + Send>,
}

impl Default for GuestIo {
    fn default() -> Self {
        Self::new()
    }
}

impl GuestIo {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel();
        Self {
            stdin_rx: rx,
            stdin_tx: Some(tx),
            stdout: Vec::new(),
            stderr: Box::new(io::stderr()),
        }
    }

    /// Replace the warning sink (tests capture it).
    pub fn set_stderr(&mut self, sink: Box<dyn Write + Send>) {
        self.stderr = sink;
    }

    /// A producer handle for an external feeder thread. Dropping every
    /// handle (including the VM's own, via [`close_stdin`](Self::close_stdin))
    /// makes blocked reads return end-of-input.
    #[must_use]
    pub fn stdin_sender(&self) -> Option<Sender<u8>> {
        self.stdin_tx.clone()
    }

    /// Queue bytes for the guest to read.
    pub fn send_stdin(&self, bytes: &[u8]) {
        if let Some(tx) = &self.stdin_tx {
            for &b in bytes {
                // A full drop of the receiver can't happen while we own it
                let _ = tx.send(b);
            }
        }
    }

    /// Drop the VM-side producer so reads can see end-of-input.
    pub fn close_stdin(&mut self) {
        self.stdin_tx = None;
    }

    /// Blocking byte read; `None` means the pipe is closed.
    pub fn read_byte_blocking(&mut self) -> Option<u8> {
        self.stdin_rx.recv().ok()
    }

    /// Non-blocking byte read used after the first byte of a line.
    pub fn try_read_byte(&mut self) -> Option<u8> {
        self.stdin_rx.try_recv().ok()
    }

    pub fn write_stdout(&mut self, bytes: &[u8]) {
        self.stdout.extend_from_slice(bytes);
    }

    /// Take everything the guest has written since the last drain.
    pub fn drain_stdout(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdout)
    }

    /// Write a warning line to the stderr sink.
    pub fn warn(&mut self, message: &str) {
        let _ = writeln!(self.stderr, "{message}");
    }

    /// Raw access to the stderr sink for debug helpers.
    pub fn stderr(&mut self) -> &mut dyn Write {
        self.stderr.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_round_trip() {
        let mut io = GuestIo::new();
        io.send_stdin(b"ab");
        assert_eq!(io.read_byte_blocking(), Some(b'a'));
        assert_eq!(io.read_byte_blocking(), Some(b'b'));
        assert_eq!(io.try_read_byte(), None, "pipe is drained");
    }

    #[test]
    fn closing_stdin_unblocks_with_eof() {
        let mut io = GuestIo::new();
        io.send_stdin(b"x");
        io.close_stdin();
        assert_eq!(io.read_byte_blocking(), Some(b'x'), "buffered byte first");
        assert_eq!(io.read_byte_blocking(), None, "then end-of-input");
    }

    #[test]
    fn external_sender_feeds_from_another_thread() {
        let mut io = GuestIo::new();
        let tx = io.stdin_sender().expect("open");
        io.close_stdin();
        let handle = std::thread::spawn(move || {
            tx.send(b'z').expect("receiver alive");
            // Sender drops here, closing the pipe
        });
        assert_eq!(io.read_byte_blocking(), Some(b'z'));
        handle.join().expect("feeder thread");
        assert_eq!(io.read_byte_blocking(), None);
    }

    #[test]
    fn stdout_drains_once() {
        let mut io = GuestIo::new();
        io.write_stdout(b"hello");
        assert_eq!(io.drain_stdout(), b"hello");
        assert!(io.drain_stdout().is_empty());
    }
}
