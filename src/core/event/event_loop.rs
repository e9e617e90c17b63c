use log::{debug, error};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::common::constants::{DEFAULT_MAX_EVENTS, DEFAULT_POLL_TIMEOUT_MS};
use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, ReadyEvent, Readiness, Token};
use crate::core::event::handler::EventHandler;
use crate::core::event::poller::Poller;

pub type Hook = Box<dyn FnMut(&EventLoop) -> Outcome>;
pub type BatchHook = Box<dyn FnMut(&EventLoop, &mut [ReadyEvent]) -> Outcome>;

/// The dispatch loop: owns the epoll instance, the token registration
/// table, the poll timeout and the loop-control state.
///
/// All mutation is interior so handlers invoked from `run` can call back
/// into the registration surface; consumers share the loop as
/// `Rc<EventLoop>`. Registered handlers are held as weak references: the
/// owner keeps the handler alive, and a handler destroyed or deregistered
/// mid-batch simply stops resolving.
pub struct EventLoop {
    poller: Poller,
    timeout: Cell<i32>,
    control: Cell<Outcome>,
    running: Cell<bool>,
    scratch: RefCell<Vec<libc::epoll_event>>,
    handlers: RefCell<HashMap<u64, Weak<RefCell<dyn EventHandler>>>>,
    next_token: Cell<u64>,
    pre_wait_hook: RefCell<Option<Hook>>,
    post_wait_hook: RefCell<Option<Hook>>,
    timeout_hook: RefCell<Option<Hook>>,
    batch_hook: RefCell<Option<BatchHook>>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// `max_events` bounds the number of events drained per wait call.
    pub fn with_capacity(max_events: usize) -> Result<Self> {
        if max_events == 0 {
            return Err(LoopError::ProtocolError(
                "event capacity must be non-zero".to_string(),
            ));
        }
        let poller = Poller::new()?;
        Ok(Self {
            poller,
            timeout: Cell::new(DEFAULT_POLL_TIMEOUT_MS),
            control: Cell::new(Outcome::Continue),
            running: Cell::new(false),
            scratch: RefCell::new(vec![
                libc::epoll_event { events: 0, u64: 0 };
                max_events
            ]),
            handlers: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            pre_wait_hook: RefCell::new(None),
            post_wait_hook: RefCell::new(None),
            timeout_hook: RefCell::new(None),
            batch_hook: RefCell::new(None),
        })
    }

    /// Poll timeout in milliseconds: -1 blocks indefinitely, 0 returns
    /// immediately, positive values bound the wait.
    pub fn set_timeout(&self, timeout_ms: i32) {
        self.timeout.set(timeout_ms);
    }

    pub fn timeout(&self) -> i32 {
        self.timeout.get()
    }

    /// Adds a descriptor with the given interest; the returned token is the
    /// opaque tag the kernel will report readiness under.
    pub fn register(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: &Rc<RefCell<dyn EventHandler>>,
    ) -> Result<Token> {
        let token = Token(self.next_token.get());
        self.poller.add(fd, interest, token.0)?;
        self.handlers
            .borrow_mut()
            .insert(token.0, Rc::downgrade(handler));
        self.next_token.set(token.0 + 1);
        debug!("registered fd {} as token {}", fd, token.0);
        Ok(token)
    }

    /// Rewrites the armed interest of a registered descriptor.
    pub fn modify(&self, fd: RawFd, token: Token, interest: Interest) -> Result<()> {
        self.poller.modify(fd, interest, token.0)
    }

    /// Removes a descriptor from the kernel context and forgets its token.
    /// The table entry is dropped even when the kernel call fails, since in
    /// every failure mode (closed descriptor, closed context) the kernel no
    /// longer tracks the registration either.
    pub fn deregister(&self, fd: RawFd, token: Token) -> Result<()> {
        self.handlers.borrow_mut().remove(&token.0);
        self.poller.remove(fd)?;
        debug!("deregistered fd {} (token {})", fd, token.0);
        Ok(())
    }

    pub fn registered_count(&self) -> usize {
        self.handlers.borrow().len()
    }

    /// Requests loop termination out of band. Takes effect at the next
    /// checkpoint, not immediately; `Outcome::Continue` is a no-op.
    pub fn exit(&self, outcome: Outcome) {
        self.absorb(outcome);
    }

    pub fn set_pre_wait_hook<F>(&self, hook: F)
    where
        F: FnMut(&EventLoop) -> Outcome + 'static,
    {
        *self.pre_wait_hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn set_post_wait_hook<F>(&self, hook: F)
    where
        F: FnMut(&EventLoop) -> Outcome + 'static,
    {
        *self.post_wait_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Hook invoked when a wait expires with no events.
    pub fn set_timeout_hook<F>(&self, hook: F)
    where
        F: FnMut(&EventLoop) -> Outcome + 'static,
    {
        *self.timeout_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Hook invoked with the raw batch before dispatch; clearing a slot's
    /// readiness suppresses its dispatch.
    pub fn set_batch_hook<F>(&self, hook: F)
    where
        F: FnMut(&EventLoop, &mut [ReadyEvent]) -> Outcome + 'static,
    {
        *self.batch_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// Runs the wait/dispatch loop until a hook or handler leaves it.
    /// Returns `Ok(())` for a normal exit, an error for a wait failure, an
    /// unresolvable token or an error exit requested by a hook or handler.
    pub fn run(&self) -> Result<()> {
        if self.running.replace(true) {
            return Err(LoopError::ProtocolError(
                "event loop is already running".to_string(),
            ));
        }
        let result = self.run_cycles();
        self.running.set(false);
        result
    }

    fn run_cycles(&self) -> Result<()> {
        self.control.set(Outcome::Continue);
        loop {
            let out = self.call_hook(&self.pre_wait_hook);
            self.absorb(out);
            if let Some(exit) = self.checkpoint("pre-wait hook") {
                return exit;
            }

            // The wait result is inspected only after the post-wait hook has
            // had its turn.
            let (waited, mut batch) = self.wait_batch();

            let out = self.call_hook(&self.post_wait_hook);
            self.absorb(out);
            if let Some(exit) = self.checkpoint("post-wait hook") {
                return exit;
            }

            let n = match waited {
                Ok(n) => n,
                Err(e) => {
                    error!("epoll wait failed: {}", e);
                    return Err(e.into());
                }
            };

            if n == 0 {
                let out = self.call_hook(&self.timeout_hook);
                self.absorb(out);
                if let Some(exit) = self.checkpoint("timeout hook") {
                    return exit;
                }
                continue;
            }

            let out = self.call_batch_hook(&mut batch);
            self.absorb(out);
            if let Some(exit) = self.checkpoint("batch hook") {
                return exit;
            }

            self.verify_batch(&batch)?;
            self.dispatch_batch(&batch);
            if let Some(exit) = self.checkpoint("event handler") {
                return exit;
            }
        }
    }

    fn wait_batch(&self) -> (std::io::Result<usize>, Vec<ReadyEvent>) {
        let mut scratch = self.scratch.borrow_mut();
        match self.poller.wait(&mut scratch, self.timeout.get()) {
            Ok(n) => {
                let batch = scratch[..n]
                    .iter()
                    .map(|ev| ReadyEvent {
                        token: Token({ ev.u64 }),
                        readiness: Readiness::from_bits_retain(ev.events),
                    })
                    .collect();
                (Ok(n), batch)
            }
            Err(e) => (Err(e), Vec::new()),
        }
    }

    /// Arm phase: every reported token must resolve to a table entry. The
    /// kernel never reports descriptors the loop does not own, so a miss is
    /// a protocol error, fatal to the loop.
    fn verify_batch(&self, batch: &[ReadyEvent]) -> Result<()> {
        let handlers = self.handlers.borrow();
        for ev in batch {
            if !handlers.contains_key(&ev.token.0) {
                error!("readiness reported for unknown token {}", ev.token.0);
                return Err(LoopError::ProtocolError(format!(
                    "unknown readiness token {}",
                    ev.token.0
                )));
            }
        }
        Ok(())
    }

    /// Dispatch phase: tokens are re-resolved immediately before each
    /// invocation, so a handler deregistered or destroyed by an earlier
    /// callback in the same batch is skipped. The first non-Continue
    /// outcome ends the batch.
    fn dispatch_batch(&self, batch: &[ReadyEvent]) {
        for ev in batch {
            if self.control.get() != Outcome::Continue {
                break;
            }
            if ev.readiness.is_empty() {
                continue;
            }
            let resolved = self
                .handlers
                .borrow()
                .get(&ev.token.0)
                .and_then(Weak::upgrade);
            let handler = match resolved {
                Some(handler) => handler,
                None => continue,
            };
            let out = handler.borrow_mut().ready(self, ev.readiness);
            self.absorb(out);
        }
    }

    fn call_hook(&self, slot: &RefCell<Option<Hook>>) -> Outcome {
        let mut slot = slot.borrow_mut();
        match slot.as_mut() {
            Some(hook) => hook(self),
            None => Outcome::Continue,
        }
    }

    fn call_batch_hook(&self, batch: &mut [ReadyEvent]) -> Outcome {
        let mut slot = self.batch_hook.borrow_mut();
        match slot.as_mut() {
            Some(hook) => hook(self, batch),
            None => Outcome::Continue,
        }
    }

    /// The first non-Continue outcome wins; later ones in the same
    /// iteration are ignored.
    fn absorb(&self, outcome: Outcome) {
        if outcome != Outcome::Continue && self.control.get() == Outcome::Continue {
            self.control.set(outcome);
        }
    }

    fn checkpoint(&self, who: &str) -> Option<Result<()>> {
        match self.control.get() {
            Outcome::Continue => None,
            Outcome::Stop => Some(Ok(())),
            Outcome::Fail => {
                error!("{} announced exit with error", who);
                Some(Err(LoopError::ExitError(who.to_string())))
            }
        }
    }

    /// Destroys the kernel context. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.poller.close();
    }
}
