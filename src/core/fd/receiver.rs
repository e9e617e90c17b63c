use log::{debug, warn};
use std::io;

use crate::core::event::event::{Outcome, Readiness};
use crate::core::fd::handler::FdHandler;

/// Callback capability of the stream adapter. Every event kind has an inert
/// default, so an adapter always has *some* behavior; install a receiver to
/// override the kinds that matter. Closures become receivers by wrapping
/// them in a type implementing this trait.
pub trait FdReceiver {
    /// New data landed in the rx buffer (`Ok(n)`), the stream ended
    /// (`Ok(0)`) or the read failed. Default: end of stream leaves the loop
    /// normally, an error fails it, data is discarded.
    fn rx(&mut self, fdh: &mut FdHandler, len: io::Result<usize>) -> Outcome {
        match len {
            Ok(0) => Outcome::Stop,
            Ok(n) => {
                debug!("unhandled rx event, len = {}", n);
                fdh.rx_buffer_mut().clear();
                Outcome::Continue
            }
            Err(_) => Outcome::Fail,
        }
    }

    /// Data left the tx buffer (`Ok(n)`), the descriptor accepted nothing
    /// (`Ok(0)`) or the write failed. Default mirrors `rx` but compacts the
    /// tx buffer instead of clearing it.
    fn tx(&mut self, fdh: &mut FdHandler, len: io::Result<usize>) -> Outcome {
        match len {
            Ok(0) => Outcome::Stop,
            Ok(n) => {
                debug!("unhandled tx event, len = {}", n);
                fdh.tx_buffer_mut().compact();
                Outcome::Continue
            }
            Err(_) => Outcome::Fail,
        }
    }

    /// Urgent data. There is no universal way to consume it, so the default
    /// fails the loop; a collaborator that armed URGENT must override this.
    fn urgent(&mut self, _fdh: &mut FdHandler) -> Outcome {
        warn!("unhandled urgent-data event");
        Outcome::Fail
    }

    fn hangup(&mut self, _fdh: &mut FdHandler) -> Outcome {
        warn!("unhandled hang-up event");
        Outcome::Fail
    }

    fn error(&mut self, _fdh: &mut FdHandler) -> Outcome {
        warn!("unhandled error event");
        Outcome::Fail
    }

    fn unknown(&mut self, _fdh: &mut FdHandler, bits: Readiness) -> Outcome {
        warn!("unhandled unknown event, bits = {:#x}", bits.bits());
        Outcome::Fail
    }

    /// Runs before the readiness bits are decomposed; may clear bits to
    /// suppress the generic handling of an event kind.
    fn enter(&mut self, _fdh: &mut FdHandler, _readiness: &mut Readiness) -> Outcome {
        Outcome::Continue
    }

    /// Runs after decomposition and the auto-policy pass, if nothing
    /// short-circuited and the adapter is still bound.
    fn exit(&mut self, _fdh: &mut FdHandler, _readiness: Readiness) -> Outcome {
        Outcome::Continue
    }
}

/// The always-available inert receiver.
pub struct DefaultReceiver;

impl FdReceiver for DefaultReceiver {}
