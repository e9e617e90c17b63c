use log::{error, warn};
use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::FileDescriptor;

/// Callback capability of the timer source.
pub trait TimerReceiver {
    /// The timer fired; `expirations` counts expirations since the last
    /// delivery. Default: fail the loop on an unhandled timer.
    fn expired(&mut self, _timer: &mut TimerHandler, expirations: u64) -> Outcome {
        warn!("unhandled timer expiration, count = {}", expirations);
        Outcome::Fail
    }
}

/// Timer event source over a timerfd: one-shot or periodic expirations
/// delivered through the dispatch loop.
pub struct TimerHandler {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    receiver: Option<Box<dyn TimerReceiver>>,
}

impl TimerHandler {
    pub fn new(lp: &Rc<EventLoop>, receiver: Box<dyn TimerReceiver>) -> Rc<RefCell<TimerHandler>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<TimerHandler>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(TimerHandler {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                receiver: Some(receiver),
            })
        })
    }

    /// Creates the timer descriptor and registers it. `clockid` is
    /// `libc::CLOCK_MONOTONIC` or `libc::CLOCK_REALTIME`. Benign no-op when
    /// already initialized.
    pub fn init(&mut self, clockid: libc::c_int) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let raw = unsafe {
            libc::timerfd_create(clockid, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if raw < 0 {
            let e = io::Error::last_os_error();
            error!("creating timer descriptor failed: {}", e);
            return Err(e.into());
        }
        let fd = FileDescriptor::from_raw(raw);
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("timer self handle is gone".to_string())
        })?;
        let token = self.lp.register(raw, Interest::READ, &handler)?;
        self.fd = Some(fd);
        self.token = Some(token);
        Ok(())
    }

    /// Deregisters and closes the timer descriptor. Idempotent.
    pub fn cleanup(&mut self) {
        if let (Some(fd), Some(token)) = (self.fd.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering timer failed: {}", e);
            }
        }
    }

    /// Arms a single expiration after `delay`, which must be non-zero
    /// (a zero value would silently disarm the timer).
    pub fn arm_oneshot(&mut self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            return Err(LoopError::ProtocolError(
                "timer delay must be non-zero".to_string(),
            ));
        }
        self.settime(libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: duration_to_timespec(delay),
        })
    }

    /// Arms periodic expirations every `interval`; the first one fires
    /// after `initial` when given, otherwise after one interval.
    pub fn arm_periodic(&mut self, interval: Duration, initial: Option<Duration>) -> Result<()> {
        if interval.is_zero() {
            return Err(LoopError::ProtocolError(
                "timer interval must be non-zero".to_string(),
            ));
        }
        let first = match initial {
            Some(d) if !d.is_zero() => d,
            _ => interval,
        };
        self.settime(libc::itimerspec {
            it_interval: duration_to_timespec(interval),
            it_value: duration_to_timespec(first),
        })
    }

    pub fn disarm(&mut self) -> Result<()> {
        self.settime(libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        })
    }

    fn settime(&mut self, spec: libc::itimerspec) -> Result<()> {
        let fd = self.fd.as_ref().ok_or_else(|| {
            LoopError::ProtocolError("timer is not initialized".to_string())
        })?;
        let ret = unsafe {
            libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            error!("setting timer properties failed: {}", e);
            return Err(e.into());
        }
        Ok(())
    }

    fn drive_expire(&mut self) -> Outcome {
        let res = match self.fd.as_ref() {
            Some(fd) => {
                let mut buf = [0u8; 8];
                fd.read(&mut buf).map(|n| (n, buf))
            }
            None => return Outcome::Continue,
        };
        match res {
            Ok((8, buf)) => {
                let expirations = u64::from_ne_bytes(buf);
                let mut taken = self.receiver.take();
                let out = match taken.as_deref_mut() {
                    Some(receiver) => receiver.expired(self, expirations),
                    None => {
                        warn!("unhandled timer expiration, count = {}", expirations);
                        Outcome::Fail
                    }
                };
                if self.receiver.is_none() {
                    self.receiver = taken;
                }
                out
            }
            Ok((n, _)) => {
                error!("mismatched read from timer descriptor, len = {}", n);
                Outcome::Fail
            }
            Err(e) => {
                error!("reading from timer descriptor failed: {}", e);
                Outcome::Fail
            }
        }
    }
}

impl EventHandler for TimerHandler {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        let mut bits = readiness;
        if bits.contains(Readiness::READ) {
            bits.remove(Readiness::READ);
            let out = self.drive_expire();
            if out != Outcome::Continue {
                return out;
            }
        }
        if !bits.is_empty() {
            error!("unexpected readiness on timer descriptor: {:#x}", bits.bits());
            return Outcome::Fail;
        }
        Outcome::Continue
    }
}

impl Drop for TimerHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountThenStop {
        fired: Rc<Cell<u64>>,
        stop_at: u64,
    }

    impl TimerReceiver for CountThenStop {
        fn expired(&mut self, _timer: &mut TimerHandler, expirations: u64) -> Outcome {
            self.fired.set(self.fired.get() + expirations);
            if self.fired.get() >= self.stop_at {
                Outcome::Stop
            } else {
                Outcome::Continue
            }
        }
    }

    #[test]
    fn test_oneshot_fires_once() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let fired = Rc::new(Cell::new(0));
        let timer = TimerHandler::new(
            &lp,
            Box::new(CountThenStop {
                fired: Rc::clone(&fired),
                stop_at: 1,
            }),
        );
        timer.borrow_mut().init(libc::CLOCK_MONOTONIC).unwrap();
        timer
            .borrow_mut()
            .arm_oneshot(Duration::from_millis(5))
            .unwrap();

        lp.set_timeout(2000);
        lp.set_timeout_hook(|_| Outcome::Fail);
        assert!(lp.run().is_ok());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn test_periodic_accumulates_expirations() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let fired = Rc::new(Cell::new(0));
        let timer = TimerHandler::new(
            &lp,
            Box::new(CountThenStop {
                fired: Rc::clone(&fired),
                stop_at: 3,
            }),
        );
        timer.borrow_mut().init(libc::CLOCK_MONOTONIC).unwrap();
        timer
            .borrow_mut()
            .arm_periodic(Duration::from_millis(2), None)
            .unwrap();

        lp.set_timeout(2000);
        lp.set_timeout_hook(|_| Outcome::Fail);
        assert!(lp.run().is_ok());
        assert!(fired.get() >= 3);
    }

    #[test]
    fn test_zero_delay_is_rejected() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let timer = TimerHandler::new(&lp, Box::new(CountThenStop {
            fired: Rc::new(Cell::new(0)),
            stop_at: 1,
        }));
        timer.borrow_mut().init(libc::CLOCK_MONOTONIC).unwrap();
        assert!(timer.borrow_mut().arm_oneshot(Duration::ZERO).is_err());
    }

    #[test]
    fn test_init_is_idempotent() {
        let lp = Rc::new(EventLoop::new().unwrap());
        let timer = TimerHandler::new(&lp, Box::new(CountThenStop {
            fired: Rc::new(Cell::new(0)),
            stop_at: 1,
        }));
        timer.borrow_mut().init(libc::CLOCK_MONOTONIC).unwrap();
        timer.borrow_mut().init(libc::CLOCK_MONOTONIC).unwrap();
        assert_eq!(lp.registered_count(), 1);
        timer.borrow_mut().cleanup();
        timer.borrow_mut().cleanup();
        assert_eq!(lp.registered_count(), 0);
    }
}
