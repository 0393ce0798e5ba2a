//! Dispatch, request handlers, and the main read-dispatch-write loop.
//!
//! One `Engine` owns the handle table and the session's initialization
//! state; `run` drives it against the real stdio descriptors until an
//! orderly EOF or a [`Fatal`] error ends the process.

use std::ffi::{CString, OsStr};
use std::fs::{DirBuilder, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{debug, error, info, warn};

use crate::attrs::{self, FileAttrs, MAX_ATTRS_BYTES};
use crate::error::Fatal;
use crate::frame;
use crate::handles::{DirState, HandleTable};
use crate::protocol::{MessageType, OpenFlags, MAX_PACKET, SFTP_VERSION};
use crate::status::{map_io_error, StatusCode};
use crate::wire::{Reader, Writer};
use crate::Result;

/// Extra room beyond `MAX_PACKET` the output buffer carries for its own
/// 4-byte length header.
const OUTPUT_CAPACITY: usize = MAX_PACKET + 4;

/// One SFTP session's state: the handle table and whether INIT has run.
pub struct Engine {
    handles: HandleTable,
    initialized: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// Builds a fresh, uninitialized engine.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handles: HandleTable::new(),
            initialized: false,
        }
    }

    /// Runs the read-dispatch-write loop against stdin/stdout until an
    /// orderly end-of-stream. Any protocol or I/O violation is `Fatal` and
    /// unwinds out of this call.
    ///
    /// # Errors
    ///
    /// Returns the first [`Fatal`] error encountered reading, framing, or
    /// writing on stdio.
    pub fn run(&mut self) -> Result<()> {
        let mut input = vec![0u8; MAX_PACKET];
        let mut output = vec![0u8; OUTPUT_CAPACITY];

        loop {
            let len = match frame::read_frame(&mut input)? {
                None => return Ok(()),
                Some(len) => len,
            };

            let payload_written = self.handle_request(&input[..len], &mut output[4..])?;
            frame::write_frame(&mut output, 4 + payload_written)?;
        }
    }

    /// Processes one already-delimited request payload and writes the
    /// reply (if any — a zero-length request produces none) into `output`
    /// starting at offset 0, with no length header of its own. Returns the
    /// number of bytes written. Exposed so callers can drive the engine
    /// over a transport other than the raw stdio frames [`Engine::run`]
    /// uses, and so tests can exercise one request/reply pair directly.
    ///
    /// # Errors
    ///
    /// Returns a [`Fatal`] error if the payload violates session framing
    /// invariants (e.g. a second INIT), matching [`Engine::run`]'s
    /// behavior.
    pub fn handle_request(&mut self, payload: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut writer = Writer::new(output);
        if !payload.is_empty() {
            let mut reader = Reader::new(payload);
            self.dispatch(&mut reader, &mut writer)?;
        }
        Ok(writer.position())
    }

    fn dispatch(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let opcode = r.get_byte()?;

        if !self.initialized {
            if opcode != MessageType::Init as u8 {
                return Err(Fatal::NotInitialized(opcode));
            }
            return self.handle_init(r, w);
        }
        if opcode == MessageType::Init as u8 {
            return Err(Fatal::DuplicateInit);
        }

        match MessageType::from_request_byte(opcode) {
            Some(MessageType::Open) => self.handle_open(r, w),
            Some(MessageType::Close) => self.handle_close(r, w),
            Some(MessageType::Read) => self.handle_read(r, w),
            Some(MessageType::Write) => self.handle_write(r, w),
            Some(MessageType::Lstat) => self.handle_stat_path(r, w, false),
            Some(MessageType::Stat) => self.handle_stat_path(r, w, true),
            Some(MessageType::Fstat) => self.handle_fstat(r, w),
            Some(MessageType::Setstat) => self.handle_setstat(r, w),
            Some(MessageType::Fsetstat) => self.handle_fsetstat(r, w),
            Some(MessageType::Opendir) => self.handle_opendir(r, w),
            Some(MessageType::Readdir) => self.handle_readdir(r, w),
            Some(MessageType::Remove) => self.handle_remove(r, w),
            Some(MessageType::Mkdir) => self.handle_mkdir(r, w),
            Some(MessageType::Rmdir) => self.handle_rmdir(r, w),
            Some(MessageType::Realpath) => self.handle_realpath(r, w),
            Some(MessageType::Rename) => self.handle_rename(r, w),
            Some(MessageType::Readlink) => self.handle_readlink(r, w),
            Some(MessageType::Symlink) => self.handle_symlink(r, w),
            _ => {
                let id = r.get_u32()?;
                write_status(w, id, StatusCode::OpUnsupported)
            }
        }
    }

    fn handle_init(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let version = r.get_u32()?;
        if version < SFTP_VERSION {
            return Err(Fatal::UnsupportedVersion(version));
        }
        self.initialized = true;
        w.put_byte(MessageType::Version as u8)?;
        w.put_u32(SFTP_VERSION)?;
        Ok(())
    }

    fn handle_open(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let pflags = r.get_u32()?;
        let attrs = FileAttrs::decode(r)?;
        let path = path_from_bytes(path_bytes);

        let mode = attrs.permissions.map_or(0o666, |p| p & 0o777);
        let mut opts = OpenFlags(pflags).to_open_options();
        opts.mode(mode);

        debug!("Opening file: {:?} with flags: {:#x}", path, pflags);
        match opts.open(path) {
            Ok(file) => match self.handles.allocate_file(file) {
                Some(handle) => write_handle(w, id, &handle),
                None => {
                    warn!("Maximum file handles reached");
                    write_status(w, id, StatusCode::Failure)
                }
            },
            Err(e) => {
                debug!("Failed to open file {:?}: {}", path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_close(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;
        debug!("Closing handle");
        match self.handles.resolve(handle_bytes) {
            Some(h) => {
                self.handles.release(h);
                write_status(w, id, StatusCode::Ok)
            }
            None => {
                warn!("Attempt to close invalid handle");
                write_status(w, id, StatusCode::Failure)
            }
        }
    }

    fn handle_read(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;
        let offset = r.get_u64()?;
        let requested = r.get_u32()? as usize;

        debug!("Read request: offset={}, len={}", offset, requested);
        let Some(h) = self.handles.resolve(handle_bytes) else {
            warn!("Read attempt with invalid handle");
            return write_status(w, id, StatusCode::Failure);
        };
        let Some(file) = self.handles.file_mut(h) else {
            warn!("Attempt to read from directory handle");
            return write_status(w, id, StatusCode::Failure);
        };

        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            error!("Seek error at offset {}: {}", offset, e);
            return write_status(w, id, map_io_error(&e));
        }

        const DATA_HEADER: usize = 1 + 4 + 4;
        let cap = w.remaining().saturating_sub(DATA_HEADER).min(requested);

        let header_start = w.save_cursor();
        w.put_byte(MessageType::Data as u8)?;
        w.put_u32(id)?;
        let len_slot = w.save_cursor();
        w.put_u32(0)?;
        let data_start = w.save_cursor();
        let slice = w.reserve_raw(cap)?;

        match file.read(slice) {
            Ok(0) => {
                w.set_position(header_start);
                write_status(w, id, StatusCode::Eof)
            }
            Ok(n) => {
                w.set_position(len_slot);
                #[allow(clippy::cast_possible_truncation)]
                w.put_u32(n as u32)?;
                w.set_position(data_start + n);
                Ok(())
            }
            Err(e) => {
                error!("Read error: {}", e);
                w.set_position(header_start);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_write(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;
        let offset = r.get_u64()?;
        let data = r.get_data()?;

        debug!("Write request: offset={}, len={}", offset, data.len());
        let Some(h) = self.handles.resolve(handle_bytes) else {
            warn!("Write attempt with invalid handle");
            return write_status(w, id, StatusCode::Failure);
        };
        let Some(file) = self.handles.file_mut(h) else {
            warn!("Attempt to write to directory handle");
            return write_status(w, id, StatusCode::Failure);
        };

        if let Err(e) = file.seek(SeekFrom::Start(offset)) {
            error!("Seek error at offset {}: {}", offset, e);
            return write_status(w, id, map_io_error(&e));
        }

        match file.write(data) {
            Ok(n) if n == data.len() => write_status(w, id, StatusCode::Ok),
            Ok(_) => {
                warn!("Short write");
                write_status(w, id, StatusCode::Failure)
            }
            Err(e) => {
                error!("Write error: {}", e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_stat_path(
        &mut self,
        r: &mut Reader<'_>,
        w: &mut Writer<'_>,
        follow_symlink: bool,
    ) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let path = path_from_bytes(path_bytes);

        debug!("Stat request for: {:?}", path);
        let meta = if follow_symlink {
            std::fs::metadata(path)
        } else {
            std::fs::symlink_metadata(path)
        };
        match meta {
            Ok(meta) => write_attrs(w, id, attrs::from_metadata(&meta)),
            Err(e) => {
                debug!("Stat failed for {:?}: {}", path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_fstat(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;
        debug!("Fstat request");
        let Some(h) = self.handles.resolve(handle_bytes) else {
            warn!("Fstat attempt with invalid handle");
            return write_status(w, id, StatusCode::Failure);
        };
        let Some(file) = self.handles.file_mut(h) else {
            warn!("Attempt to fstat directory handle");
            return write_status(w, id, StatusCode::Failure);
        };
        match file.metadata() {
            Ok(meta) => write_attrs(w, id, attrs::from_metadata(&meta)),
            Err(e) => {
                error!("Metadata error: {}", e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_setstat(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let attrs = FileAttrs::decode(r)?;

        let Ok(path_cstr) = CString::new(path_bytes) else {
            return write_status(w, id, StatusCode::BadMessage);
        };
        debug!("Setstat request for: {:?}", path_from_bytes(path_bytes));
        match apply_setstat_by_path(&path_cstr, attrs) {
            Ok(()) => write_status(w, id, StatusCode::Ok),
            Err(e) => {
                debug!("Failed to set attributes for {:?}: {}", path_from_bytes(path_bytes), e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_fsetstat(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;
        let attrs = FileAttrs::decode(r)?;

        debug!("Fsetstat request");
        let Some(h) = self.handles.resolve(handle_bytes) else {
            warn!("Fsetstat attempt with invalid handle");
            return write_status(w, id, StatusCode::Failure);
        };
        let Some(file) = self.handles.file_mut(h) else {
            warn!("Attempt to fsetstat directory handle");
            return write_status(w, id, StatusCode::Failure);
        };
        match apply_fsetstat_by_fd(file, attrs) {
            Ok(()) => write_status(w, id, StatusCode::Ok),
            Err(e) => {
                debug!("Failed to set attributes on handle: {}", e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_opendir(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let path = path_from_bytes(path_bytes);

        debug!("Opening directory: {:?}", path);
        let read_dir = match std::fs::read_dir(path) {
            Ok(rd) => rd,
            Err(e) => {
                debug!("Failed to open directory {:?}: {}", path, e);
                return write_status(w, id, map_io_error(&e));
            }
        };

        let mut entries = Vec::new();
        for entry in read_dir.flatten() {
            if let Ok(meta) = entry.metadata() {
                entries.push((entry.file_name(), meta));
            }
        }

        let dir = DirState { entries, index: 0 };
        match self.handles.allocate_dir(dir) {
            Some(handle) => write_handle(w, id, &handle),
            None => write_status(w, id, StatusCode::Failure),
        }
    }

    fn handle_readdir(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let handle_bytes = r.get_string()?;

        let Some(h) = self.handles.resolve(handle_bytes) else {
            warn!("Readdir attempt with invalid handle");
            return write_status(w, id, StatusCode::Failure);
        };
        let Some(dir) = self.handles.dir_mut(h) else {
            warn!("Attempt to readdir from file handle");
            return write_status(w, id, StatusCode::Failure);
        };

        let header_start = w.save_cursor();
        w.put_byte(MessageType::Name as u8)?;
        w.put_u32(id)?;
        let mut count_slot = w.save_cursor();
        w.put_u32(0)?;
        let mut count: u32 = 0;

        loop {
            if dir.index >= dir.entries.len() {
                break;
            }
            let (name, meta) = &dir.entries[dir.index];
            let name_bytes = name.as_bytes();
            let bound = (4 + name_bytes.len()) * 2 + MAX_ATTRS_BYTES;

            if w.remaining() >= bound {
                w.put_string(name_bytes)?;
                w.put_string(name_bytes)?;
                attrs::from_metadata(meta).encode(w)?;
                count += 1;
                dir.index += 1;
            } else if count > 0 {
                break;
            } else {
                // This single entry can never fit in a full-size buffer;
                // skip it rather than stall the listing forever.
                dir.index += 1;
            }
        }

        if count > 0 {
            w.swap_cursor(&mut count_slot);
            w.put_u32(count)?;
            w.swap_cursor(&mut count_slot);
            Ok(())
        } else {
            w.set_position(header_start);
            write_status(w, id, StatusCode::Eof)
        }
    }

    fn handle_remove(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let path = path_from_bytes(path_bytes);
        debug!("Removing file: {:?}", path);
        match std::fs::remove_file(path) {
            Ok(()) => {
                info!("File removed: {:?}", path);
                write_status(w, id, StatusCode::Ok)
            }
            Err(e) => {
                debug!("Failed to remove file {:?}: {}", path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_mkdir(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let attrs = FileAttrs::decode(r)?;
        let mode = attrs.permissions.map_or(0o777, |p| p & 0o777);
        let path = path_from_bytes(path_bytes);

        debug!("Creating directory: {:?}", path);
        match DirBuilder::new().mode(mode).create(path) {
            Ok(()) => {
                info!("Directory created: {:?}", path);
                write_status(w, id, StatusCode::Ok)
            }
            Err(e) => {
                debug!("Failed to create directory {:?}: {}", path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_rmdir(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        let path = path_from_bytes(path_bytes);
        debug!("Removing directory: {:?}", path);
        match std::fs::remove_dir(path) {
            Ok(()) => {
                info!("Directory removed: {:?}", path);
                write_status(w, id, StatusCode::Ok)
            }
            Err(e) => {
                debug!("Failed to remove directory {:?}: {}", path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_realpath(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;
        debug!("Realpath request for: {:?}", path_from_bytes(path_bytes));
        match std::fs::canonicalize(path_from_bytes(path_bytes)) {
            Ok(canonical) => {
                let bytes = canonical.as_os_str().as_bytes();
                w.put_byte(MessageType::Name as u8)?;
                w.put_u32(id)?;
                w.put_u32(1)?;
                w.put_string(bytes)?;
                w.put_string(bytes)?;
                FileAttrs::default().encode(w)
            }
            Err(e) => write_status(w, id, map_io_error(&e)),
        }
    }

    fn handle_rename(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let old_bytes = r.get_string()?;
        let new_bytes = r.get_string()?;
        let old_path = path_from_bytes(old_bytes);
        let new_path = path_from_bytes(new_bytes);
        debug!("Rename: {:?} -> {:?}", old_path, new_path);
        match std::fs::rename(old_path, new_path) {
            Ok(()) => {
                info!("Renamed {:?} to {:?}", old_path, new_path);
                write_status(w, id, StatusCode::Ok)
            }
            Err(e) => {
                debug!("Failed to rename {:?} to {:?}: {}", old_path, new_path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }

    fn handle_readlink(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let path_bytes = r.get_string()?;

        let Ok(path_cstr) = CString::new(path_bytes) else {
            return write_status(w, id, StatusCode::BadMessage);
        };
        debug!("Readlink request for: {:?}", path_from_bytes(path_bytes));

        let header_start = w.save_cursor();
        w.put_byte(MessageType::Name as u8)?;
        w.put_u32(id)?;
        w.put_u32(1)?;

        // Available room for the target string, sized so two copies of it
        // (name + longname) plus a trailing zero-flags ATTRS block all fit.
        let budget = w.remaining();
        if budget <= MAX_ATTRS_BYTES + 8 {
            w.set_position(header_start);
            return write_status(w, id, StatusCode::Failure);
        }
        let avail = (budget - MAX_ATTRS_BYTES) / 2 - 4;

        let len_slot = w.save_cursor();
        w.put_u32(0)?;
        let data_start = w.save_cursor();
        let buf = w.reserve_raw(avail)?;

        #[allow(clippy::cast_sign_loss)]
        let ret = unsafe { libc::readlink(path_cstr.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            debug!("Failed to read symlink {:?}: {}", path_from_bytes(path_bytes), err);
            w.set_position(header_start);
            return write_status(w, id, map_io_error(&err));
        }
        #[allow(clippy::cast_sign_loss)]
        let n = ret as usize;

        w.set_position(len_slot);
        #[allow(clippy::cast_possible_truncation)]
        w.put_u32(n as u32)?;
        w.set_position(data_start + n);

        w.put_string_copied_from(data_start, n)?;
        w.put_u32(0)?; // ATTRS flags = 0
        Ok(())
    }

    fn handle_symlink(&mut self, r: &mut Reader<'_>, w: &mut Writer<'_>) -> Result<()> {
        let id = r.get_u32()?;
        let link_bytes = r.get_string()?;
        let target_bytes = r.get_string()?;
        let link_path = path_from_bytes(link_bytes);
        let target_path = path_from_bytes(target_bytes);

        debug!("Symlink request: {:?} -> {:?}", link_path, target_path);
        match std::os::unix::fs::symlink(target_path, link_path) {
            Ok(()) => {
                info!("Created symlink: {:?} -> {:?}", link_path, target_path);
                write_status(w, id, StatusCode::Ok)
            }
            Err(e) => {
                debug!("Failed to create symlink {:?} -> {:?}: {}", link_path, target_path, e);
                write_status(w, id, map_io_error(&e))
            }
        }
    }
}

fn path_from_bytes(bytes: &[u8]) -> &Path {
    Path::new(OsStr::from_bytes(bytes))
}

fn apply_setstat_by_path(path: &CString, attrs: FileAttrs) -> std::io::Result<()> {
    if let Some(perm) = attrs.permissions {
        #[allow(clippy::cast_possible_truncation)]
        let mode = (perm & 0o777) as libc::mode_t;
        if unsafe { libc::chmod(path.as_ptr(), mode) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if let Some(times) = attrs.to_timevals() {
        if unsafe { libc::utimes(path.as_ptr(), times.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
        if unsafe { libc::chown(path.as_ptr(), uid, gid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn apply_fsetstat_by_fd(file: &File, attrs: FileAttrs) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    if let Some(perm) = attrs.permissions {
        #[allow(clippy::cast_possible_truncation)]
        let mode = (perm & 0o777) as libc::mode_t;
        if unsafe { libc::fchmod(fd, mode) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if let Some(times) = attrs.to_timevals() {
        if unsafe { libc::futimes(fd, times.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if let (Some(uid), Some(gid)) = (attrs.uid, attrs.gid) {
        if unsafe { libc::fchown(fd, uid, gid) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn write_status(w: &mut Writer<'_>, id: u32, code: StatusCode) -> Result<()> {
    w.put_byte(MessageType::Status as u8)?;
    w.put_u32(id)?;
    w.put_u32(code.into())?;
    w.put_string(code.message().as_bytes())?;
    w.put_string(b"en")?;
    Ok(())
}

fn write_handle(w: &mut Writer<'_>, id: u32, handle: &str) -> Result<()> {
    w.put_byte(MessageType::Handle as u8)?;
    w.put_u32(id)?;
    w.put_string(handle.as_bytes())?;
    Ok(())
}

fn write_attrs(w: &mut Writer<'_>, id: u32, attrs: FileAttrs) -> Result<()> {
    w.put_byte(MessageType::Attrs as u8)?;
    w.put_u32(id)?;
    attrs.encode(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_frame(version: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Init as u8).unwrap();
        w.put_u32(version).unwrap();
        let n = w.position();
        buf.truncate(n);
        buf
    }

    #[test]
    fn init_replies_with_version() {
        let mut engine = Engine::new();
        let frame = init_frame(3);
        let mut out = vec![0u8; 64];
        let mut w = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut w).unwrap();

        let written = w.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Version as u8);
        assert_eq!(reply.get_u32().unwrap(), SFTP_VERSION);
    }

    #[test]
    fn second_init_is_fatal() {
        let mut engine = Engine::new();
        let frame = init_frame(3);
        let mut out = vec![0u8; 64];
        let mut w = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut w).unwrap();

        let frame = init_frame(3);
        let mut out2 = vec![0u8; 64];
        let mut w2 = Writer::new(&mut out2);
        let mut r2 = Reader::new(&frame);
        assert!(matches!(
            engine.dispatch(&mut r2, &mut w2),
            Err(Fatal::DuplicateInit)
        ));
    }

    #[test]
    fn pre_init_non_init_opcode_is_fatal() {
        let mut engine = Engine::new();
        let mut buf = vec![0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Open as u8).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; 64];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        assert!(matches!(
            engine.dispatch(&mut r, &mut wr),
            Err(Fatal::NotInitialized(op)) if op == MessageType::Open as u8
        ));
    }

    fn initialized_engine() -> Engine {
        let mut engine = Engine::new();
        let frame = init_frame(3);
        let mut out = vec![0u8; 64];
        let mut w = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut w).unwrap();
        engine
    }

    #[test]
    fn unknown_opcode_replies_op_unsupported() {
        let mut engine = initialized_engine();
        let mut buf = vec![0u8; 8];
        let mut w = Writer::new(&mut buf);
        w.put_byte(250).unwrap();
        w.put_u32(7).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; 64];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();

        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Status as u8);
        assert_eq!(reply.get_u32().unwrap(), 7);
        assert_eq!(reply.get_u32().unwrap(), StatusCode::OpUnsupported as u32);
    }

    #[test]
    fn open_read_write_close_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        let path_bytes = path.as_os_str().as_bytes();

        let mut engine = initialized_engine();

        // OPEN for write+create+trunc.
        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Open as u8).unwrap();
        w.put_u32(1).unwrap();
        w.put_string(path_bytes).unwrap();
        w.put_u32(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC)
            .unwrap();
        FileAttrs::default().encode(&mut w).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Handle as u8);
        assert_eq!(reply.get_u32().unwrap(), 1);
        let handle = reply.get_string().unwrap().to_vec();

        // WRITE "hello" at offset 0.
        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Write as u8).unwrap();
        w.put_u32(2).unwrap();
        w.put_string(&handle).unwrap();
        w.put_u64(0).unwrap();
        w.put_string(b"hello").unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Status as u8);
        assert_eq!(reply.get_u32().unwrap(), 2);
        assert_eq!(reply.get_u32().unwrap(), StatusCode::Ok as u32);

        // CLOSE.
        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Close as u8).unwrap();
        w.put_u32(3).unwrap();
        w.put_string(&handle).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn readdir_lists_all_entries_then_eofs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let mut engine = initialized_engine();

        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Opendir as u8).unwrap();
        w.put_u32(1).unwrap();
        w.put_string(dir.path().as_os_str().as_bytes()).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Handle as u8);
        reply.get_u32().unwrap();
        let handle = reply.get_string().unwrap().to_vec();

        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Readdir as u8).unwrap();
        w.put_u32(2).unwrap();
        w.put_string(&handle).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Name as u8);
        reply.get_u32().unwrap();
        assert_eq!(reply.get_u32().unwrap(), 2);

        // A second call on the now-exhausted handle returns EOF.
        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Readdir as u8).unwrap();
        w.put_u32(3).unwrap();
        w.put_string(&handle).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Status as u8);
        reply.get_u32().unwrap();
        assert_eq!(reply.get_u32().unwrap(), StatusCode::Eof as u32);
    }

    #[test]
    fn readdir_is_restartable_when_an_entry_does_not_fit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::write(dir.path().join("c"), b"").unwrap();

        let mut engine = initialized_engine();

        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Opendir as u8).unwrap();
        w.put_u32(1).unwrap();
        w.put_string(dir.path().as_os_str().as_bytes()).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();
        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        reply.get_byte().unwrap();
        reply.get_u32().unwrap();
        let handle = reply.get_string().unwrap().to_vec();

        // A tiny output buffer forces at most one entry per READDIR call:
        // header (9 bytes) plus exactly one single-character entry's bound
        // ((4+1)*2 + MAX_ATTRS_BYTES == 42).
        let small_cap = 9 + 42;
        let mut seen = 0;
        loop {
            let mut buf = vec![0u8; MAX_PACKET];
            let mut w = Writer::new(&mut buf);
            w.put_byte(MessageType::Readdir as u8).unwrap();
            w.put_u32(1).unwrap();
            w.put_string(&handle).unwrap();
            let n = w.position();
            let frame = buf[..n].to_vec();

            let mut out = vec![0u8; small_cap];
            let mut wr = Writer::new(&mut out);
            wr.set_position(0);
            let mut r = Reader::new(&frame);
            engine.dispatch(&mut r, &mut wr).unwrap();
            let written = wr.position();
            let mut reply = Reader::new(&out[..written]);
            let opcode = reply.get_byte().unwrap();
            reply.get_u32().unwrap();
            if opcode == MessageType::Status as u8 {
                assert_eq!(reply.get_u32().unwrap(), StatusCode::Eof as u32);
                break;
            }
            let count = reply.get_u32().unwrap();
            seen += count;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn read_caps_the_returned_data_to_what_fits_in_the_output_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, vec![b'x'; 64]).unwrap();

        let mut engine = initialized_engine();

        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Open as u8).unwrap();
        w.put_u32(1).unwrap();
        w.put_string(path.as_os_str().as_bytes()).unwrap();
        w.put_u32(OpenFlags::READ).unwrap();
        FileAttrs::default().encode(&mut w).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let mut out = vec![0u8; MAX_PACKET];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        reply.get_byte().unwrap();
        reply.get_u32().unwrap();
        let handle = reply.get_string().unwrap().to_vec();

        // Request the protocol's maximum read length into an output buffer
        // only big enough for the 9-byte DATA header plus 20 payload bytes,
        // per spec.md §8's READ-capping scenario.
        let mut buf = vec![0u8; MAX_PACKET];
        let mut w = Writer::new(&mut buf);
        w.put_byte(MessageType::Read as u8).unwrap();
        w.put_u32(2).unwrap();
        w.put_string(&handle).unwrap();
        w.put_u64(0).unwrap();
        w.put_u32(65535).unwrap();
        let n = w.position();
        let frame = buf[..n].to_vec();

        let small_cap = 9 + 20;
        let mut out = vec![0u8; small_cap];
        let mut wr = Writer::new(&mut out);
        let mut r = Reader::new(&frame);
        engine.dispatch(&mut r, &mut wr).unwrap();
        let written = wr.position();
        let mut reply = Reader::new(&out[..written]);
        assert_eq!(reply.get_byte().unwrap(), MessageType::Data as u8);
        assert_eq!(reply.get_u32().unwrap(), 2);
        let data = reply.get_string().unwrap();
        assert_eq!(data.len(), 20, "returned length must equal the capacity, not the request");
        assert_eq!(reply.remaining(), 0);
    }
}
