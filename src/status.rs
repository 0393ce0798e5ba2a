//! SFTP status codes and the mapping from host OS errors to them.

/// SFTP status codes (draft-ietf-secsh-filexfer-02). `NoConnection` and
/// `ConnectionLost` are part of the wire enum but this server never emits
/// them — there is no transport-level reconnection to report.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Operation succeeded.
    Ok = 0,
    /// Read past the end of a file, or a directory is exhausted.
    Eof = 1,
    /// The requested path does not exist.
    NoSuchFile = 2,
    /// The operation was not permitted.
    PermissionDenied = 3,
    /// Catch-all failure.
    Failure = 4,
    /// A request was malformed.
    BadMessage = 5,
    /// Unused by this server.
    NoConnection = 6,
    /// Unused by this server.
    ConnectionLost = 7,
    /// The opcode is recognized by the wire format but not implemented.
    OpUnsupported = 8,
}

impl StatusCode {
    /// The fixed human-readable message for a status code, per spec.md
    /// §4.3. Anything not in the table reads "Unknown error".
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::OpUnsupported => "Operation unsupported",
            Self::NoConnection | Self::ConnectionLost => "Unknown error",
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// Maps a host I/O error to the SFTP status code it should be reported
/// as, per the table in spec.md §4.3.
#[must_use]
pub fn map_io_error(err: &std::io::Error) -> StatusCode {
    match err.raw_os_error() {
        Some(0) => StatusCode::Ok,
        Some(errno)
            if errno == libc::ENOENT
                || errno == libc::ENOTDIR
                || errno == libc::EBADF
                || errno == libc::ELOOP =>
        {
            StatusCode::NoSuchFile
        }
        Some(errno) if errno == libc::EPERM || errno == libc::EACCES || errno == libc::EFAULT => {
            StatusCode::PermissionDenied
        }
        Some(errno) if errno == libc::ENAMETOOLONG || errno == libc::EINVAL => {
            StatusCode::BadMessage
        }
        _ => StatusCode::Failure,
    }
}
