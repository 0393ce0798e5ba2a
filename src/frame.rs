//! Length-prefixed frame I/O over the raw stdin/stdout descriptors, per
//! spec.md §4.5.
//!
//! Reads and writes go straight to file descriptors 0 and 1 via `libc`
//! rather than through `std::io::Stdin`/`Stdout`, because those types
//! carry an internal read-ahead buffer that would desynchronize the
//! length-prefixed framing from the readiness-wait-then-read discipline
//! the spec calls for. A `select`(2) readiness wait precedes every
//! underlying read or write syscall, tolerating a descriptor the parent
//! process left non-blocking.

use crate::error::Fatal;
use crate::Result;
use std::os::unix::io::RawFd;

fn wait_ready(fd: RawFd, writing: bool) -> Result<()> {
    loop {
        let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut set);
            libc::FD_SET(fd, &mut set);
        }
        let ret = unsafe {
            if writing {
                libc::select(
                    fd + 1,
                    std::ptr::null_mut(),
                    &mut set,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            } else {
                libc::select(
                    fd + 1,
                    &mut set,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            }
        };
        if ret >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Fatal::Readiness(err));
    }
}

fn raw_read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        wait_ready(fd, false)?;
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(Fatal::Io(err));
    }
}

fn raw_write_all(fd: RawFd, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        wait_ready(fd, true)?;
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(Fatal::Io(err));
        }
        if n == 0 {
            return Err(Fatal::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write(2) returned 0",
            )));
        }
        #[allow(clippy::cast_sign_loss)]
        let n = n as usize;
        buf = &buf[n..];
    }
    Ok(())
}

/// Fills `buf` completely from `fd`. Returns `Ok(false)` only if the
/// stream was already at EOF before a single byte was read (an orderly
/// end-of-stream). EOF after partial consumption is `Fatal::TruncatedFrame`.
fn read_exact_tolerant_eof(fd: RawFd, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = raw_read(fd, &mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Fatal::TruncatedFrame);
        }
        filled += n;
    }
    Ok(true)
}

/// Reads one length-prefixed frame's payload from `fd` into `buf` (which
/// must be at least as large as the largest length this server will
/// accept). Returns `Ok(None)` on an orderly end-of-stream at a frame
/// boundary, `Ok(Some(len))` with the payload length otherwise.
pub fn read_frame_from(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    let mut len_bytes = [0u8; 4];
    if !read_exact_tolerant_eof(fd, &mut len_bytes)? {
        return Ok(None);
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > buf.len() {
        return Err(Fatal::FrameTooLarge {
            len,
            capacity: buf.len(),
        });
    }
    if len > 0 && !read_exact_tolerant_eof(fd, &mut buf[..len])? {
        return Err(Fatal::TruncatedFrame);
    }
    Ok(Some(len))
}

/// Finalizes and sends a reply frame to `fd`. `buf[0..4]` is reserved for
/// the length header; `written` is the total bytes the handler produced
/// (header included). If `written == 4` the handler produced no reply
/// (e.g. a zero-length input packet) and nothing is sent.
pub fn write_frame_to(fd: RawFd, buf: &mut [u8], written: usize) -> Result<()> {
    if written <= 4 {
        return Ok(());
    }
    #[allow(clippy::cast_possible_truncation)]
    let payload_len = (written - 4) as u32;
    buf[0..4].copy_from_slice(&payload_len.to_be_bytes());
    raw_write_all(fd, &buf[..written])
}

/// Reads one frame from stdin. See [`read_frame_from`].
pub fn read_frame(buf: &mut [u8]) -> Result<Option<usize>> {
    read_frame_from(libc::STDIN_FILENO, buf)
}

/// Writes one reply frame to stdout. See [`write_frame_to`].
pub fn write_frame(buf: &mut [u8], written: usize) -> Result<()> {
    write_frame_to(libc::STDOUT_FILENO, buf, written)
}
