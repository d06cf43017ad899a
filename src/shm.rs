//! Thin wrapper around POSIX shared memory (`shm_open`/`ftruncate`/`mmap`).
//!
//! Used both by [`crate::hybrid_lock`] (for the atomic counter + waiter
//! state backing a lock) and by [`crate::resource`] (for the RPC channel's
//! request/response buffer). Kept separate from both so the raw-memory
//! plumbing doesn't leak into either's higher-level protocol logic.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use memmap2::MmapRaw;

/// How a named shared-memory region should be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Open if present, otherwise create. Caller learns which happened via
    /// the returned `bool`.
    ConnectOrCreate,
    /// Fail with `ENOENT` if the region does not already exist.
    ConnectExisting,
    /// Unlink any prior region under this name, then create fresh.
    CreateOverwrite,
    /// Fail with `EEXIST` if the region already exists.
    CreateExclusive,
}

/// A mapped, named POSIX shared-memory region.
pub struct SharedRegion {
    name: String,
    map: MmapRaw,
    /// `true` if this call created the region (so the caller should
    /// initialize its contents rather than trust what's already there).
    pub created: bool,
}

fn posix_name(name: &str) -> io::Result<CString> {
    let full = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(full).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn shm_open_raw(cname: &CString, flags: i32, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl SharedRegion {
    /// Open or create `name` sized at least `size` bytes per `mode`.
    pub fn open(name: &str, size: usize, mode: OpenMode) -> io::Result<Self> {
        let cname = posix_name(name)?;
        let (fd, created) = match mode {
            OpenMode::ConnectOrCreate => {
                match shm_open_raw(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) {
                    Ok(fd) => (fd, true),
                    Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                        (shm_open_raw(&cname, libc::O_RDWR, 0o600)?, false)
                    }
                    Err(e) => return Err(e),
                }
            }
            OpenMode::ConnectExisting => (shm_open_raw(&cname, libc::O_RDWR, 0o600)?, false),
            OpenMode::CreateOverwrite => {
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                (
                    shm_open_raw(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)?,
                    true,
                )
            }
            OpenMode::CreateExclusive => (
                shm_open_raw(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600)?,
                true,
            ),
        };

        if created && unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::shm_unlink(cname.as_ptr()) };
            return Err(err);
        }

        let file = std::fs::File::from(fd);
        let map = MmapRaw::map_raw(&file)?;
        if map.len() < size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("shared region '{name}' is {} bytes, need {size}", map.len()),
            ));
        }

        Ok(Self {
            name: name.to_string(),
            map,
            created,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    /// Read-only byte view. Safe because every writer goes through the
    /// paired hybrid lock before touching the buffer (see `channel`).
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len()) }
    }

    /// Mutable byte view, same safety argument as `as_slice`.
    #[allow(clippy::mut_from_ref)]
    pub fn as_slice_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.len()) }
    }

    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = posix_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("shmrpc_test_{tag}_{}", std::process::id())
    }

    #[test]
    fn create_then_connect_existing() {
        let name = unique_name("create_connect");
        let _ = SharedRegion::unlink(&name);

        let a = SharedRegion::open(&name, 64, OpenMode::CreateExclusive).unwrap();
        assert!(a.created);
        a.as_slice_mut()[0] = 42;

        let b = SharedRegion::open(&name, 64, OpenMode::ConnectExisting).unwrap();
        assert!(!b.created);
        assert_eq!(b.as_slice()[0], 42);

        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn create_exclusive_fails_when_present() {
        let name = unique_name("exclusive");
        let _ = SharedRegion::unlink(&name);

        let _a = SharedRegion::open(&name, 64, OpenMode::CreateExclusive).unwrap();
        let b = SharedRegion::open(&name, 64, OpenMode::CreateExclusive);
        assert!(b.is_err());

        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn connect_existing_fails_when_absent() {
        let name = unique_name("absent");
        let _ = SharedRegion::unlink(&name);

        let result = SharedRegion::open(&name, 64, OpenMode::ConnectExisting);
        assert!(result.is_err());
    }

    #[test]
    fn overwrite_replaces_prior_contents() {
        let name = unique_name("overwrite");
        let _ = SharedRegion::unlink(&name);

        let a = SharedRegion::open(&name, 64, OpenMode::CreateExclusive).unwrap();
        a.as_slice_mut()[0] = 7;
        drop(a);

        let b = SharedRegion::open(&name, 64, OpenMode::CreateOverwrite).unwrap();
        assert!(b.created);
        assert_eq!(b.as_slice()[0], 0);

        SharedRegion::unlink(&name).unwrap();
    }
}
