//! Filesystem sandbox and guest file table.
//!
//! Every guest path resolves relative to a configured root. Canonical
//! forms that escape the root, including through a symbolic link, are
//! violations: the syscall returns the operational failure value and a
//! warning is logged, but execution continues. Sandbox escapes are never
//! VM-integrity errors.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};

/// Why a path was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    /// The canonical path lies outside the root.
    Escape(String),
    /// The underlying filesystem said no.
    Io(String),
}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Escape(path) => write!(f, "path '{path}' escapes the sandbox root"),
            Self::Io(msg) => write!(f, "sandbox i/o error: {msg}"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Path jail rooted at `fs_root`.
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Canonicalises the root once; a missing root is an I/O error at
    /// construction, not at every syscall.
    pub fn new(root: &Path) -> Result<Self, SandboxError> {
        let root = root
            .canonicalize()
            .map_err(|e| SandboxError::Io(format!("{}: {e}", root.display())))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a guest-supplied path to a host path inside the root.
    ///
    /// The target file need not exist (OPEN may create it), so the
    /// parent directory is canonicalised and checked; if the file itself
    /// exists its canonical form is checked too, which catches symlinks
    /// pointing outside the root.
    pub fn resolve(&self, guest_path: &str) -> Result<PathBuf, SandboxError> {
        // Strip any leading root markers; guest paths are always
        // interpreted relative to the sandbox root
        let relative: PathBuf = Path::new(guest_path)
            .components()
            .filter(|c| matches!(c, Component::Normal(_) | Component::ParentDir | Component::CurDir))
            .collect();
        let joined = self.root.join(relative);

        let parent = joined.parent().unwrap_or(&self.root);
        let canonical_parent = parent
            .canonicalize()
            .map_err(|e| SandboxError::Io(format!("{}: {e}", parent.display())))?;
        if !canonical_parent.starts_with(&self.root) {
            return Err(SandboxError::Escape(guest_path.to_string()));
        }

        let file_name = joined
            .file_name()
            .ok_or_else(|| SandboxError::Escape(guest_path.to_string()))?;
        let resolved = canonical_parent.join(file_name);

        // An existing file may itself be a symlink out of the root
        if resolved.exists() {
            let canonical = resolved
                .canonicalize()
                .map_err(|e| SandboxError::Io(format!("{}: {e}", resolved.display())))?;
            if !canonical.starts_with(&self.root) {
                return Err(SandboxError::Escape(guest_path.to_string()));
            }
        }
        Ok(resolved)
    }
}

/// Open mode numbers of the OPEN syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
}

impl OpenMode {
    #[must_use]
    pub const fn from_guest(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Append),
            _ => None,
        }
    }
}

/// Guest file descriptors. 0-2 are reserved for the standard streams,
/// so real files start at 3.
pub struct FileTable {
    files: Vec<Option<File>>,
}

const FIRST_FD: u32 = 3;
/// Cap on simultaneously open guest files.
const MAX_FILES: usize = 32;

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self { files: Vec::new() }
    }

    pub fn open(&mut self, path: &Path, mode: OpenMode) -> std::io::Result<u32> {
        let file = match mode {
            OpenMode::Read => File::open(path)?,
            OpenMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            OpenMode::Append => OpenOptions::new().append(true).create(true).open(path)?,
        };
        if let Some(slot) = self.files.iter().position(Option::is_none) {
            self.files[slot] = Some(file);
            return Ok(slot as u32 + FIRST_FD);
        }
        if self.files.len() >= MAX_FILES {
            return Err(std::io::Error::other("too many open guest files"));
        }
        self.files.push(Some(file));
        Ok(self.files.len() as u32 - 1 + FIRST_FD)
    }

    pub fn get(&mut self, fd: u32) -> Option<&mut File> {
        let index = fd.checked_sub(FIRST_FD)? as usize;
        self.files.get_mut(index)?.as_mut()
    }

    pub fn close(&mut self, fd: u32) -> bool {
        let Some(index) = fd.checked_sub(FIRST_FD).map(|i| i as usize) else {
            return false;
        };
        match self.files.get_mut(index) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}
