//! SFTP v3 wire constants: opcodes, open flags, and the protocol version.
//!
//! Mirrors draft-ietf-secsh-filexfer-02. No extension packets (`Extended`/
//! `ExtendedReply`) are implemented; an unrecognized opcode is handled by
//! the dispatcher's unknown-opcode path, not by this enum.

/// The only SFTP protocol version this server speaks.
pub const SFTP_VERSION: u32 = 3;

/// Maximum payload bytes this server will accept or emit in one frame.
/// 34,000 is the minimum an SFTP v3 server SHOULD support.
pub const MAX_PACKET: usize = 34_000;

/// SFTP request/response message types.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Initialize the session.
    Init = 1,
    /// Server's version reply.
    Version = 2,
    /// Open a file.
    Open = 3,
    /// Close a handle.
    Close = 4,
    /// Read from a file handle.
    Read = 5,
    /// Write to a file handle.
    Write = 6,
    /// Stat a path without following a trailing symlink.
    Lstat = 7,
    /// Stat a file handle.
    Fstat = 8,
    /// Set attributes on a path.
    Setstat = 9,
    /// Set attributes on a file handle.
    Fsetstat = 10,
    /// Open a directory.
    Opendir = 11,
    /// Read directory entries.
    Readdir = 12,
    /// Remove a file.
    Remove = 13,
    /// Create a directory.
    Mkdir = 14,
    /// Remove a directory.
    Rmdir = 15,
    /// Canonicalize a path.
    Realpath = 16,
    /// Stat a path, following a trailing symlink.
    Stat = 17,
    /// Rename a path.
    Rename = 18,
    /// Read a symlink's target.
    Readlink = 19,
    /// Create a symlink.
    Symlink = 20,
    /// Status reply.
    Status = 101,
    /// Handle reply.
    Handle = 102,
    /// Data reply.
    Data = 103,
    /// Name-list reply.
    Name = 104,
    /// Attributes reply.
    Attrs = 105,
}

impl MessageType {
    /// Looks up the request opcode for a raw byte. Returns `None` for
    /// anything this server doesn't recognize as a request (including the
    /// reply-only codes 101-105) — the dispatcher treats that as an
    /// unknown opcode and replies `OP_UNSUPPORTED`.
    #[must_use]
    pub fn from_request_byte(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            _ => return None,
        })
    }
}

/// `pflags` bits from the OPEN request.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading.
    pub const READ: u32 = 0x0000_0001;
    /// Open for writing.
    pub const WRITE: u32 = 0x0000_0002;
    /// Append on every write.
    pub const APPEND: u32 = 0x0000_0004;
    /// Create the file if it does not exist.
    pub const CREAT: u32 = 0x0000_0008;
    /// Truncate an existing file to zero length.
    pub const TRUNC: u32 = 0x0000_0010;
    /// Fail if the file already exists (with CREAT).
    pub const EXCL: u32 = 0x0000_0020;

    /// Whether `READ` is set.
    #[must_use]
    pub fn has_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    /// Whether `WRITE` is set.
    #[must_use]
    pub fn has_write(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Whether `APPEND` is set.
    #[must_use]
    pub fn has_append(self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// Whether `CREAT` is set.
    #[must_use]
    pub fn has_creat(self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// Whether `TRUNC` is set.
    #[must_use]
    pub fn has_trunc(self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// Whether `EXCL` is set.
    #[must_use]
    pub fn has_excl(self) -> bool {
        self.0 & Self::EXCL != 0
    }

    /// Maps `pflags` to the `OpenOptions` combination described in
    /// spec.md §4.8.
    #[must_use]
    pub fn to_open_options(self) -> std::fs::OpenOptions {
        let mut opts = std::fs::OpenOptions::new();
        match (self.has_read(), self.has_write()) {
            (true, true) => {
                opts.read(true).write(true);
            }
            (true, false) => {
                opts.read(true);
            }
            (false, true) => {
                opts.write(true);
            }
            (false, false) => {}
        }
        if self.has_append() {
            opts.append(true);
        }
        if self.has_creat() {
            opts.create(true);
        }
        if self.has_trunc() {
            opts.truncate(true);
        }
        if self.has_excl() {
            opts.create_new(true);
        }
        opts
    }
}
