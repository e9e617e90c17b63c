use log::error;
use std::cell::Cell;
use std::io;
use std::os::unix::io::RawFd;

use crate::common::error::Result;
use crate::core::event::event::Interest;

/// Thin wrapper around an epoll instance: interest management and the wait
/// call. Creation and teardown happen exactly once; `close` is idempotent
/// and also runs on drop.
pub struct Poller {
    epfd: Cell<RawFd>,
}

impl Poller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            let e = io::Error::last_os_error();
            error!("creating epoll instance failed: {}", e);
            return Err(e.into());
        }
        Ok(Self {
            epfd: Cell::new(epfd),
        })
    }

    pub fn is_open(&self) -> bool {
        self.epfd.get() >= 0
    }

    pub fn add(&self, fd: RawFd, interest: Interest, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest.bits(), token)
    }

    pub fn modify(&self, fd: RawFd, interest: Interest, token: u64) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest.bits(), token)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd.get(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            error!("removing fd {} from epoll failed: {}", fd, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd.get(), op, fd, &mut ev) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            error!("epoll_ctl(op={}) for fd {} failed: {}", op, fd, e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Blocks for up to `timeout_ms` milliseconds (-1 indefinitely, 0 none)
    /// and fills `events` with ready descriptors. The OS error is preserved
    /// for the caller; a wait failure is never retried here.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.get(),
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn close(&self) {
        let epfd = self.epfd.replace(-1);
        if epfd >= 0 {
            unsafe {
                libc::close(epfd);
            }
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.close();
    }
}
