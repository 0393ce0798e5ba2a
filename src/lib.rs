//! A single-process SFTP v3 subsystem server.
//!
//! Speaks draft-ietf-secsh-filexfer-02 over a pair of already-connected
//! file descriptors (stdin for requests, stdout for replies) — the shape
//! an SSH daemon invokes an `sftp-server`-style subsystem binary in.
//! There is no listener, no authentication, and no concurrency: one
//! process handles exactly one client, one request at a time, until the
//! client closes its side of the pipe.

pub mod attrs;
pub mod engine;
pub mod error;
pub mod frame;
pub mod handles;
pub mod protocol;
pub mod status;
pub mod wire;

pub use engine::Engine;
pub use error::{Fatal, Result};
pub use protocol::{MessageType, OpenFlags, SFTP_VERSION};
pub use status::StatusCode;
