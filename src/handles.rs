//! The fixed-capacity handle table: opaque handles for open files and
//! directories, per spec.md §3/§4.4.

use std::ffi::OsString;
use std::fs::{File, Metadata};

/// Number of handle slots. External handle value `i + 1` corresponds to
/// `slots[i]`; value 0 is reserved as "invalid".
pub const MAX_HANDLES: usize = 99;

/// Width of the zero-padded decimal handle string on the wire. Must be
/// wide enough to print `MAX_HANDLES`; widen this alongside `MAX_HANDLES`
/// if it ever grows past two digits.
pub const HANDLE_DIGITS: usize = 2;

/// Buffered directory listing backing an `OPENDIR` handle. The whole
/// directory is read up front into `entries`; `index` is the restartable
/// cursor READDIR advances and can rewind, per spec.md §4.9.
pub struct DirState {
    /// Entry names paired with their (already-fetched) metadata.
    pub entries: Vec<(OsString, Metadata)>,
    /// Index of the next entry READDIR will consider.
    pub index: usize,
}

enum Slot {
    Free,
    File(File),
    Directory(DirState),
}

/// A validated reference to a non-free slot, returned by
/// [`HandleTable::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRef(usize);

/// The fixed-size slot array described in spec.md §3/§4.4.
pub struct HandleTable {
    slots: Vec<Slot>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Builds a table with every slot `Free`.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_HANDLES);
        slots.resize_with(MAX_HANDLES, || Slot::Free);
        Self { slots }
    }

    /// Installs an open file in the first free slot and returns its
    /// zero-padded decimal handle string, or `None` if the table is full
    /// (the caller must then close the fd itself).
    #[must_use]
    pub fn allocate_file(&mut self, file: File) -> Option<String> {
        let idx = self.first_free()?;
        self.slots[idx] = Slot::File(file);
        Some(Self::encode(idx))
    }

    /// Installs a directory listing in the first free slot and returns its
    /// handle string, or `None` if the table is full.
    #[must_use]
    pub fn allocate_dir(&mut self, dir: DirState) -> Option<String> {
        let idx = self.first_free()?;
        self.slots[idx] = Slot::Directory(dir);
        Some(Self::encode(idx))
    }

    fn first_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| matches!(s, Slot::Free))
    }

    fn encode(idx: usize) -> String {
        format!("{:0width$}", idx + 1, width = HANDLE_DIGITS)
    }

    /// Validates a wire handle string: exactly `HANDLE_DIGITS` ASCII
    /// digits, parsing to a value in `[1, MAX_HANDLES]` whose slot is not
    /// `Free`.
    #[must_use]
    pub fn resolve(&self, wire: &[u8]) -> Option<HandleRef> {
        if wire.len() != HANDLE_DIGITS || !wire.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let text = std::str::from_utf8(wire).ok()?;
        let value: usize = text.parse().ok()?;
        if value == 0 || value > MAX_HANDLES {
            return None;
        }
        let idx = value - 1;
        match self.slots.get(idx)? {
            Slot::Free => None,
            _ => Some(HandleRef(idx)),
        }
    }

    /// Borrows the open file at a resolved handle, if that slot holds one.
    #[must_use]
    pub fn file(&self, h: HandleRef) -> Option<&File> {
        match &self.slots[h.0] {
            Slot::File(f) => Some(f),
            Slot::Directory(_) | Slot::Free => None,
        }
    }

    /// Mutably borrows the open file at a resolved handle.
    #[must_use]
    pub fn file_mut(&mut self, h: HandleRef) -> Option<&mut File> {
        match &mut self.slots[h.0] {
            Slot::File(f) => Some(f),
            Slot::Directory(_) | Slot::Free => None,
        }
    }

    /// Mutably borrows the directory state at a resolved handle.
    #[must_use]
    pub fn dir_mut(&mut self, h: HandleRef) -> Option<&mut DirState> {
        match &mut self.slots[h.0] {
            Slot::Directory(d) => Some(d),
            Slot::File(_) | Slot::Free => None,
        }
    }

    /// Releases a slot back to `Free`. Dropping the `File`/`DirState`
    /// closes the underlying descriptor; failures closing the descriptor
    /// are swallowed the same way `std::fs::File`'s `Drop` always does —
    /// the slot becomes `Free` unconditionally, per spec.md §4.4.
    pub fn release(&mut self, h: HandleRef) {
        self.slots[h.0] = Slot::Free;
    }

    /// Number of slots currently in use, for handle-exhaustion tests.
    #[cfg(test)]
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s, Slot::Free))
            .count()
    }
}
