use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::common::error::{LoopError, Result};

/// Raw descriptor wrapper distinguishing owned from borrowed descriptors:
/// owned ones are closed on drop, borrowed ones are left to their owner.
pub struct FileDescriptor {
    fd: RawFd,
    owned: bool,
}

impl FileDescriptor {
    /// Wraps a descriptor without taking ownership.
    pub fn new(fd: RawFd) -> Self {
        Self { fd, owned: false }
    }

    /// Takes ownership; the descriptor is closed on drop.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd, owned: true }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Releases ownership and returns the raw descriptor without closing it.
    pub fn into_raw(mut self) -> RawFd {
        self.owned = false;
        self.fd
    }

    pub fn set_non_blocking(&self) -> Result<()> {
        self.set_flags(libc::O_NONBLOCK)
    }

    /// Sets the given status flags, leaving the others untouched.
    pub fn set_flags(&self, flags: libc::c_int) -> Result<()> {
        let current = self.flags()?;
        let ret = unsafe { libc::fcntl(self.fd, libc::F_SETFL, current | flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Clears the given status flags, leaving the others untouched.
    pub fn clear_flags(&self, flags: libc::c_int) -> Result<()> {
        let current = self.flags()?;
        let ret = unsafe { libc::fcntl(self.fd, libc::F_SETFL, current & !flags) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn flags(&self) -> Result<libc::c_int> {
        let ret = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if ret < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(ret)
    }

    /// One read syscall into `buf`. Returns `Ok(0)` on end of stream; a
    /// would-block condition surfaces as an error for the caller to decide.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// One write syscall from `buf`.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

/// Opens a file with the given flags and returns an owning wrapper.
pub fn open_path(path: &std::path::Path, flags: libc::c_int) -> Result<FileDescriptor> {
    use std::os::unix::ffi::OsStrExt;
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| LoopError::ProtocolError(format!("path contains NUL: {:?}", path)))?;
    let fd = unsafe { libc::open(cpath.as_ptr(), flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(FileDescriptor::from_raw(fd))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_and_clear() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let fd = FileDescriptor::from_raw(fds[0]);
        let _wr = FileDescriptor::from_raw(fds[1]);

        fd.set_non_blocking().unwrap();
        assert_ne!(fd.flags().unwrap() & libc::O_NONBLOCK, 0);
        fd.clear_flags(libc::O_NONBLOCK).unwrap();
        assert_eq!(fd.flags().unwrap() & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let rd = FileDescriptor::from_raw(fds[0]);
        let _wr = FileDescriptor::from_raw(fds[1]);
        rd.set_non_blocking().unwrap();

        let mut buf = [0u8; 4];
        let err = rd.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_borrowed_fd_not_closed_on_drop() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        {
            let borrowed = FileDescriptor::new(fds[0]);
            let _ = borrowed.flags().unwrap();
        }
        // still valid after the borrowed wrapper dropped
        let owned = FileDescriptor::from_raw(fds[0]);
        assert!(owned.flags().is_ok());
        unsafe {
            libc::close(fds[1]);
        }
    }
}
