use log::{error, warn};
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};

use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::FileDescriptor;

/// Callback capability of the signal source.
pub trait SignalReceiver {
    /// A signal arrived through the descriptor. Default: fail the loop on
    /// an unhandled signal.
    fn signal(
        &mut self,
        _sh: &mut SignalHandler,
        info: &libc::signalfd_siginfo,
    ) -> Outcome {
        warn!("unhandled signal {}", info.ssi_signo);
        Outcome::Fail
    }
}

/// Signal event source over a signalfd. The watched signals must be blocked
/// in the dispatching thread (see `block_signals`) or they are delivered
/// the traditional way instead of through the descriptor.
pub struct SignalHandler {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    receiver: Option<Box<dyn SignalReceiver>>,
}

impl SignalHandler {
    pub fn new(
        lp: &Rc<EventLoop>,
        receiver: Box<dyn SignalReceiver>,
    ) -> Rc<RefCell<SignalHandler>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<SignalHandler>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(SignalHandler {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                receiver: Some(receiver),
            })
        })
    }

    /// Creates the signal descriptor for the given signals and registers
    /// it. Benign no-op when already initialized.
    pub fn init(&mut self, signals: &[libc::c_int]) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let set = build_sigset(signals)?;
        let raw = unsafe {
            libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if raw < 0 {
            let e = io::Error::last_os_error();
            error!("creating signal descriptor failed: {}", e);
            return Err(e.into());
        }
        let fd = FileDescriptor::from_raw(raw);
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("signal self handle is gone".to_string())
        })?;
        let token = self.lp.register(raw, Interest::READ, &handler)?;
        self.fd = Some(fd);
        self.token = Some(token);
        Ok(())
    }

    /// Deregisters and closes the signal descriptor. Idempotent.
    pub fn cleanup(&mut self) {
        if let (Some(fd), Some(token)) = (self.fd.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering signal source failed: {}", e);
            }
        }
    }

    fn drive_signal(&mut self) -> Outcome {
        const INFO_SIZE: usize = std::mem::size_of::<libc::signalfd_siginfo>();
        let res = match self.fd.as_ref() {
            Some(fd) => {
                let mut buf = [0u8; INFO_SIZE];
                fd.read(&mut buf).map(|n| (n, buf))
            }
            None => return Outcome::Continue,
        };
        match res {
            Ok((INFO_SIZE, buf)) => {
                let info: libc::signalfd_siginfo =
                    unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const _) };
                let mut taken = self.receiver.take();
                let out = match taken.as_deref_mut() {
                    Some(receiver) => receiver.signal(self, &info),
                    None => {
                        warn!("unhandled signal {}", info.ssi_signo);
                        Outcome::Fail
                    }
                };
                if self.receiver.is_none() {
                    self.receiver = taken;
                }
                out
            }
            Ok((n, _)) => {
                error!("mismatched read from signal descriptor, len = {}", n);
                Outcome::Fail
            }
            Err(e) => {
                error!("reading from signal descriptor failed: {}", e);
                Outcome::Fail
            }
        }
    }
}

impl EventHandler for SignalHandler {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        let mut bits = readiness;
        if bits.contains(Readiness::READ) {
            bits.remove(Readiness::READ);
            let out = self.drive_signal();
            if out != Outcome::Continue {
                return out;
            }
        }
        if !bits.is_empty() {
            error!(
                "unexpected readiness on signal descriptor: {:#x}",
                bits.bits()
            );
            return Outcome::Fail;
        }
        Outcome::Continue
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Blocks the given signals in the calling thread so a signal descriptor
/// can pick them up.
pub fn block_signals(signals: &[libc::c_int]) -> Result<()> {
    let set = build_sigset(signals)?;
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(io::Error::from_raw_os_error(ret).into());
    }
    Ok(())
}

fn build_sigset(signals: &[libc::c_int]) -> Result<libc::sigset_t> {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    if unsafe { libc::sigemptyset(&mut set) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    for signo in signals {
        if unsafe { libc::sigaddset(&mut set, *signo) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct RecordSignal {
        signo: Rc<Cell<u32>>,
    }

    impl SignalReceiver for RecordSignal {
        fn signal(
            &mut self,
            _sh: &mut SignalHandler,
            info: &libc::signalfd_siginfo,
        ) -> Outcome {
            self.signo.set(info.ssi_signo);
            Outcome::Stop
        }
    }

    #[test]
    fn test_raised_signal_is_delivered() {
        // raise() targets the calling thread, and the signal stays pending
        // for this thread because it is blocked here; the descriptor read
        // happens on the same thread inside the loop.
        block_signals(&[libc::SIGUSR1]).unwrap();

        let lp = Rc::new(EventLoop::new().unwrap());
        let signo = Rc::new(Cell::new(0));
        let sh = SignalHandler::new(&lp, Box::new(RecordSignal {
            signo: Rc::clone(&signo),
        }));
        sh.borrow_mut().init(&[libc::SIGUSR1]).unwrap();

        assert_eq!(unsafe { libc::raise(libc::SIGUSR1) }, 0);

        lp.set_timeout(2000);
        lp.set_timeout_hook(|_| Outcome::Fail);
        assert!(lp.run().is_ok());
        assert_eq!(signo.get(), libc::SIGUSR1 as u32);
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let sh = SignalHandler::new(&lp, Box::new(RecordSignal {
            signo: Rc::new(Cell::new(0)),
        }));
        sh.borrow_mut().init(&[libc::SIGUSR2]).unwrap();
        assert_eq!(lp.registered_count(), 1);
        sh.borrow_mut().cleanup();
        sh.borrow_mut().cleanup();
        assert_eq!(lp.registered_count(), 0);
    }
}
