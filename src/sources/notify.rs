use log::{error, warn};
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};

use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::FileDescriptor;

/// Callback capability of the notification source.
pub trait NotifyReceiver {
    /// The counter was read; `count` aggregates all sends since the last
    /// delivery (or one per delivery in semaphore mode). Default: fail the
    /// loop on an unhandled notification.
    fn notified(&mut self, _notifier: &mut Notifier, count: u64) -> Outcome {
        warn!("unhandled notification, count = {}", count);
        Outcome::Fail
    }
}

/// Wakeup/notification source over an eventfd: `send` adds to the counter
/// from anywhere in the program, the loop delivers the accumulated count.
pub struct Notifier {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    receiver: Option<Box<dyn NotifyReceiver>>,
}

impl Notifier {
    pub fn new(lp: &Rc<EventLoop>, receiver: Box<dyn NotifyReceiver>) -> Rc<RefCell<Notifier>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<Notifier>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(Notifier {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                receiver: Some(receiver),
            })
        })
    }

    /// Creates the event descriptor with an initial counter and extra
    /// flags (e.g. `libc::EFD_SEMAPHORE`) and registers it. Benign no-op
    /// when already initialized.
    pub fn init(&mut self, initial: libc::c_uint, flags: libc::c_int) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let raw = unsafe {
            libc::eventfd(initial, flags | libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)
        };
        if raw < 0 {
            let e = io::Error::last_os_error();
            error!("creating event descriptor failed: {}", e);
            return Err(e.into());
        }
        let fd = FileDescriptor::from_raw(raw);
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("notifier self handle is gone".to_string())
        })?;
        let token = self.lp.register(raw, Interest::READ, &handler)?;
        self.fd = Some(fd);
        self.token = Some(token);
        Ok(())
    }

    /// Deregisters and closes the event descriptor. Idempotent.
    pub fn cleanup(&mut self) {
        if let (Some(fd), Some(token)) = (self.fd.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering notifier failed: {}", e);
            }
        }
    }

    /// Adds to the counter, waking the loop.
    pub fn send(&self, count: u64) -> Result<()> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            LoopError::ProtocolError("notifier is not initialized".to_string())
        })?;
        let n = fd.write(&count.to_ne_bytes())?;
        if n != 8 {
            return Err(LoopError::ProtocolError(
                "mismatched write to event descriptor".to_string(),
            ));
        }
        Ok(())
    }

    fn drive_notify(&mut self) -> Outcome {
        let res = match self.fd.as_ref() {
            Some(fd) => {
                let mut buf = [0u8; 8];
                fd.read(&mut buf).map(|n| (n, buf))
            }
            None => return Outcome::Continue,
        };
        match res {
            Ok((8, buf)) => {
                let count = u64::from_ne_bytes(buf);
                let mut taken = self.receiver.take();
                let out = match taken.as_deref_mut() {
                    Some(receiver) => receiver.notified(self, count),
                    None => {
                        warn!("unhandled notification, count = {}", count);
                        Outcome::Fail
                    }
                };
                if self.receiver.is_none() {
                    self.receiver = taken;
                }
                out
            }
            Ok((n, _)) => {
                error!("mismatched read from event descriptor, len = {}", n);
                Outcome::Fail
            }
            Err(e) => {
                error!("reading from event descriptor failed: {}", e);
                Outcome::Fail
            }
        }
    }
}

impl EventHandler for Notifier {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        let mut bits = readiness;
        if bits.contains(Readiness::READ) {
            bits.remove(Readiness::READ);
            let out = self.drive_notify();
            if out != Outcome::Continue {
                return out;
            }
        }
        if !bits.is_empty() {
            error!(
                "unexpected readiness on event descriptor: {:#x}",
                bits.bits()
            );
            return Outcome::Fail;
        }
        Outcome::Continue
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct RecordCount {
        seen: Rc<Cell<u64>>,
    }

    impl NotifyReceiver for RecordCount {
        fn notified(&mut self, _notifier: &mut Notifier, count: u64) -> Outcome {
            self.seen.set(self.seen.get() + count);
            Outcome::Stop
        }
    }

    #[test]
    fn test_sends_aggregate_into_one_delivery() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let seen = Rc::new(Cell::new(0));
        let notifier = Notifier::new(&lp, Box::new(RecordCount {
            seen: Rc::clone(&seen),
        }));
        notifier.borrow_mut().init(0, 0).unwrap();

        notifier.borrow().send(2).unwrap();
        notifier.borrow().send(3).unwrap();

        lp.set_timeout(2000);
        lp.set_timeout_hook(|_| Outcome::Fail);
        assert!(lp.run().is_ok());
        assert_eq!(seen.get(), 5);
    }

    #[test]
    fn test_send_before_init_is_rejected() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let notifier = Notifier::new(&lp, Box::new(RecordCount {
            seen: Rc::new(Cell::new(0)),
        }));
        assert!(notifier.borrow().send(1).is_err());
    }
}
