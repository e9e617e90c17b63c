use crate::core::event::event::{Outcome, Readiness};
use crate::core::event::event_loop::EventLoop;

/// Capability implemented by everything that can be registered with the
/// event loop. The loop resolves a readiness token back to the handler and
/// calls `ready` with the reported bits.
///
/// A handler may freely mutate its own descriptor, buffers and registration
/// from inside `ready`, including deregistering or dropping itself or any
/// other handler. The loop re-resolves every token immediately before
/// invoking it, so a handler that vanished earlier in the same batch is
/// skipped, never dereferenced.
pub trait EventHandler {
    fn ready(&mut self, lp: &EventLoop, readiness: Readiness) -> Outcome;
}
