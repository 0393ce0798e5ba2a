//! Error types for the SFTP engine.
//!
//! Two tiers, per the protocol design: a [`Fatal`] error always ends the
//! process (bad framing, a second INIT, a broken stdio descriptor); every
//! other failure is reported to the peer as a STATUS packet by
//! [`crate::status`] and never surfaces as an `Err` out of a handler.

use thiserror::Error;

/// Result type alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Fatal>;

/// A fatal protocol or I/O violation. The caller (`Engine::run`) logs this
/// to stderr and exits the process with a non-zero status.
#[derive(Error, Debug)]
pub enum Fatal {
    /// Failure reading or writing the stdio descriptors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame announced a length exceeding the buffer capacity.
    #[error("frame length {len} exceeds buffer capacity {capacity}")]
    FrameTooLarge {
        /// Length declared in the frame header.
        len: usize,
        /// Capacity of the frame buffer.
        capacity: usize,
    },

    /// Stream closed mid-frame (after the length header, before all
    /// payload bytes arrived).
    #[error("connection closed mid-frame")]
    TruncatedFrame,

    /// A `get_*`/`put_*` call on the wire codec ran past the end of the
    /// buffer.
    #[error("wire codec bounds violation: {0}")]
    BufferBounds(&'static str),

    /// A second INIT packet arrived on an already-initialized session.
    #[error("duplicate INIT on an initialized session")]
    DuplicateInit,

    /// The first packet of the session was not INIT.
    #[error("first packet was not INIT (opcode {0})")]
    NotInitialized(u8),

    /// The client requested an SFTP version this server cannot speak.
    #[error("client requested unsupported SFTP version {0} (< 3)")]
    UnsupportedVersion(u32),

    /// A `select`(2) call on stdin/stdout failed.
    #[error("readiness wait failed: {0}")]
    Readiness(std::io::Error),
}
