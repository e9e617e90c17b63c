use log::{error, warn};
use std::cell::RefCell;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::FileDescriptor;

/// One filesystem notification record.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    /// Name of the entry inside a watched directory, when the kernel
    /// supplies one.
    pub name: Option<OsString>,
}

/// Callback capability of the filesystem watch source.
pub trait WatchReceiver {
    /// Default: fail the loop on an unhandled notification.
    fn event(&mut self, _watch: &mut WatchHandler, event: &WatchEvent) -> Outcome {
        warn!("unhandled watch event, mask = {:#x}", event.mask);
        Outcome::Fail
    }
}

/// Filesystem watch source over an inotify descriptor. A readable
/// notification may carry several records in one read; each record is
/// delivered to the receiver in order, stopping at the first non-Continue
/// outcome.
pub struct WatchHandler {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    receiver: Option<Box<dyn WatchReceiver>>,
}

impl WatchHandler {
    pub fn new(lp: &Rc<EventLoop>, receiver: Box<dyn WatchReceiver>) -> Rc<RefCell<WatchHandler>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<WatchHandler>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(WatchHandler {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                receiver: Some(receiver),
            })
        })
    }

    /// Creates the inotify descriptor and registers it. Benign no-op when
    /// already initialized.
    pub fn init(&mut self) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            let e = io::Error::last_os_error();
            error!("creating inotify descriptor failed: {}", e);
            return Err(e.into());
        }
        let fd = FileDescriptor::from_raw(raw);
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("watch self handle is gone".to_string())
        })?;
        let token = self.lp.register(raw, Interest::READ, &handler)?;
        self.fd = Some(fd);
        self.token = Some(token);
        Ok(())
    }

    /// Deregisters and closes the inotify descriptor. Idempotent.
    pub fn cleanup(&mut self) {
        if let (Some(fd), Some(token)) = (self.fd.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering watch source failed: {}", e);
            }
        }
    }

    /// Starts watching a path for the `libc::IN_*` mask; returns the watch
    /// descriptor used in delivered events.
    pub fn add_watch(&self, path: &Path, mask: u32) -> Result<i32> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            LoopError::ProtocolError("watch source is not initialized".to_string())
        })?;
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| LoopError::ProtocolError(format!("path contains NUL: {:?}", path)))?;
        let wd = unsafe { libc::inotify_add_watch(fd.as_raw_fd(), cpath.as_ptr(), mask) };
        if wd < 0 {
            let e = io::Error::last_os_error();
            error!("adding watch for {:?} failed: {}", path, e);
            return Err(e.into());
        }
        Ok(wd)
    }

    pub fn rm_watch(&self, wd: i32) -> Result<()> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            LoopError::ProtocolError("watch source is not initialized".to_string())
        })?;
        let ret = unsafe { libc::inotify_rm_watch(fd.as_raw_fd(), wd) };
        if ret < 0 {
            let e = io::Error::last_os_error();
            error!("removing watch {} failed: {}", wd, e);
            return Err(e.into());
        }
        Ok(())
    }

    fn drive_events(&mut self) -> Outcome {
        let mut buf = [0u8; 4096];
        let n = match self.fd.as_ref() {
            Some(fd) => match fd.read(&mut buf) {
                Ok(0) => {
                    error!("no data read from inotify descriptor");
                    return Outcome::Fail;
                }
                Ok(n) => n,
                Err(e) => {
                    error!("reading from inotify descriptor failed: {}", e);
                    return Outcome::Fail;
                }
            },
            None => return Outcome::Continue,
        };

        const HEADER: usize = std::mem::size_of::<libc::inotify_event>();
        let mut offset = 0;
        while offset + HEADER <= n {
            let raw: libc::inotify_event =
                unsafe { std::ptr::read_unaligned(buf.as_ptr().add(offset) as *const _) };
            let name_len = raw.len as usize;
            let name_start = offset + HEADER;
            if name_start + name_len > n {
                error!("truncated record read from inotify descriptor");
                return Outcome::Fail;
            }
            let name_bytes = &buf[name_start..name_start + name_len];
            let trimmed: &[u8] = match name_bytes.iter().position(|&b| b == 0) {
                Some(end) => &name_bytes[..end],
                None => name_bytes,
            };
            let event = WatchEvent {
                wd: raw.wd,
                mask: raw.mask,
                cookie: raw.cookie,
                name: if trimmed.is_empty() {
                    None
                } else {
                    Some(OsStr::from_bytes(trimmed).to_os_string())
                },
            };
            offset = name_start + name_len;

            let mut taken = self.receiver.take();
            let out = match taken.as_deref_mut() {
                Some(receiver) => receiver.event(self, &event),
                None => {
                    warn!("unhandled watch event, mask = {:#x}", event.mask);
                    Outcome::Fail
                }
            };
            if self.receiver.is_none() {
                self.receiver = taken;
            }
            if out != Outcome::Continue {
                return out;
            }
        }
        Outcome::Continue
    }
}

impl EventHandler for WatchHandler {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        let mut bits = readiness;
        if bits.contains(Readiness::READ) {
            bits.remove(Readiness::READ);
            let out = self.drive_events();
            if out != Outcome::Continue {
                return out;
            }
        }
        if !bits.is_empty() {
            error!(
                "unexpected readiness on inotify descriptor: {:#x}",
                bits.bits()
            );
            return Outcome::Fail;
        }
        Outcome::Continue
    }
}

impl Drop for WatchHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}
