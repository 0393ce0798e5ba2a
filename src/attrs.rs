//! The SFTP `ATTRS` structure: a flags bitmap plus four optional groups.

use crate::wire::{Reader, Writer};
use crate::Result;

const FLAG_SIZE: u32 = 0x0000_0001;
const FLAG_UIDGID: u32 = 0x0000_0002;
const FLAG_PERMISSIONS: u32 = 0x0000_0004;
const FLAG_ACMODTIME: u32 = 0x0000_0008;
const FLAG_EXTENDED: u32 = 0x8000_0000;

/// Worst-case encoded size of an `ATTRS` block: flags (4) + size (8) +
/// uid/gid (8) + permissions (4) + atime/mtime (8).
pub const MAX_ATTRS_BYTES: usize = 32;

/// SFTP file attributes, per spec.md §3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// File size in bytes.
    pub size: Option<u64>,
    /// Owning user id.
    pub uid: Option<u32>,
    /// Owning group id.
    pub gid: Option<u32>,
    /// Unix permission bits.
    pub permissions: Option<u32>,
    /// Last access time, seconds since epoch.
    pub atime: Option<u32>,
    /// Last modification time, seconds since epoch.
    pub mtime: Option<u32>,
}

impl FileAttrs {
    /// Builds attrs carrying only a size.
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    /// Reads an `ATTRS` block. Extension (type, data) string pairs present
    /// under the `0x8000_0000` bit are consumed and discarded.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self> {
        let flags = r.get_u32()?;
        let mut attrs = Self::default();

        if flags & FLAG_SIZE != 0 {
            attrs.size = Some(r.get_u64()?);
        }
        if flags & FLAG_UIDGID != 0 {
            attrs.uid = Some(r.get_u32()?);
            attrs.gid = Some(r.get_u32()?);
        }
        if flags & FLAG_PERMISSIONS != 0 {
            attrs.permissions = Some(r.get_u32()?);
        }
        if flags & FLAG_ACMODTIME != 0 {
            attrs.atime = Some(r.get_u32()?);
            attrs.mtime = Some(r.get_u32()?);
        }
        if flags & FLAG_EXTENDED != 0 {
            let count = r.get_u32()?;
            for _ in 0..count {
                r.get_string()?;
                r.get_string()?;
            }
        }

        Ok(attrs)
    }

    /// Writes an `ATTRS` block. Never emits the extensions bit.
    pub fn encode(self, w: &mut Writer<'_>) -> Result<()> {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= FLAG_ACMODTIME;
        }

        w.put_u32(flags)?;
        if let Some(size) = self.size {
            w.put_u64(size)?;
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            w.put_u32(uid)?;
            w.put_u32(gid)?;
        }
        if let Some(perm) = self.permissions {
            w.put_u32(perm)?;
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            w.put_u32(atime)?;
            w.put_u32(mtime)?;
        }
        Ok(())
    }

    /// Converts `(atime, mtime)` to a pair of `(sec, usec=0)` values
    /// suitable for a `utimes`-style call. Returns `None` if neither is
    /// set.
    #[must_use]
    pub fn to_timevals(self) -> Option<[libc::timeval; 2]> {
        let atime = self.atime?;
        let mtime = self.mtime?;
        Some([
            libc::timeval {
                tv_sec: libc::time_t::from(atime),
                tv_usec: 0,
            },
            libc::timeval {
                tv_sec: libc::time_t::from(mtime),
                tv_usec: 0,
            },
        ])
    }
}

/// Builds the all-populated attrs SFTP uses for a successful STAT/LSTAT/
/// FSTAT reply: `SIZE | UIDGID | PERMISSIONS | ACMODTIME`.
#[must_use]
pub fn from_metadata(meta: &std::fs::Metadata) -> FileAttrs {
    use std::os::unix::fs::MetadataExt;

    FileAttrs {
        size: Some(meta.size()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.mode()),
        atime: Some(u32::try_from(meta.atime().max(0)).unwrap_or(u32::MAX)),
        mtime: Some(u32::try_from(meta.mtime().max(0)).unwrap_or(u32::MAX)),
    }
}
