use log::{error, warn};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::{Rc, Weak};

use crate::common::buffer::LinearBuffer;
use crate::common::constants::{DEFAULT_RX_CAPACITY, DEFAULT_TX_CAPACITY};
use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::{open_path, FileDescriptor};
use crate::core::fd::receiver::{DefaultReceiver, FdReceiver};

/// Bind parameters for a stream adapter. A zero capacity is legal only when
/// the matching direction's interest stays unarmed.
#[derive(Debug, Clone)]
pub struct FdConfig {
    pub rx_capacity: usize,
    pub tx_capacity: usize,
    pub read_enabled: bool,
    pub write_enabled: bool,
    /// Register with the event loop as part of binding.
    pub register: bool,
}

impl Default for FdConfig {
    fn default() -> Self {
        Self {
            rx_capacity: DEFAULT_RX_CAPACITY,
            tx_capacity: DEFAULT_TX_CAPACITY,
            read_enabled: true,
            write_enabled: false,
            register: true,
        }
    }
}

/// Monotonic per-event-kind counters.
#[derive(Debug, Default, Clone)]
pub struct FdStats {
    pub readable: u64,
    pub writable: u64,
    pub urgent: u64,
    pub hangup: u64,
    pub error: u64,
}

/// Generic descriptor event handle: wraps one descriptor, an rx and a tx
/// buffer, the armed-interest mirror and the byte-level callback receiver.
///
/// Readiness notifications perform the actual non-blocking read/write
/// syscalls against the buffers and hand the byte counts to the receiver.
/// After every dispatch pass the auto-policy reconciles interest with
/// buffer occupancy: read interest follows "rx has free space", write
/// interest follows "tx has pending bytes", each direction gated by its
/// auto-enable/auto-disable flag (all default on).
pub struct FdHandler {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    interest: Interest,
    registered: bool,
    rxbuff: LinearBuffer,
    txbuff: LinearBuffer,
    rx_auto_enable: bool,
    rx_auto_disable: bool,
    tx_auto_enable: bool,
    tx_auto_disable: bool,
    stats: FdStats,
    receiver: Option<Box<dyn FdReceiver>>,
}

impl FdHandler {
    pub fn new(lp: &Rc<EventLoop>) -> Rc<RefCell<FdHandler>> {
        Self::with_receiver(lp, Box::new(DefaultReceiver))
    }

    pub fn with_receiver(
        lp: &Rc<EventLoop>,
        receiver: Box<dyn FdReceiver>,
    ) -> Rc<RefCell<FdHandler>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<FdHandler>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(FdHandler {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                interest: Interest::empty(),
                registered: false,
                rxbuff: LinearBuffer::new(),
                txbuff: LinearBuffer::new(),
                rx_auto_enable: true,
                rx_auto_disable: true,
                tx_auto_enable: true,
                tx_auto_disable: true,
                stats: FdStats::default(),
                receiver: Some(receiver),
            })
        })
    }

    /// Binds a borrowed descriptor; the caller keeps ownership and closes
    /// it itself. Benign no-op when already bound.
    pub fn init(&mut self, fd: RawFd, cfg: &FdConfig) -> Result<()> {
        self.bind(FileDescriptor::new(fd), cfg)
    }

    /// Binds an owned descriptor; it is closed when the adapter unbinds.
    pub fn init_owned(&mut self, fd: RawFd, cfg: &FdConfig) -> Result<()> {
        self.bind(FileDescriptor::from_raw(fd), cfg)
    }

    /// Opens a file (non-blocking is added to the flags) and binds it owned.
    pub fn open(&mut self, path: &Path, flags: libc::c_int, cfg: &FdConfig) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let fd = open_path(path, flags | libc::O_NONBLOCK)?;
        self.bind(fd, cfg)
    }

    fn bind(&mut self, fd: FileDescriptor, cfg: &FdConfig) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        if fd.as_raw_fd() < 0 {
            return Err(LoopError::ProtocolError(
                "invalid file descriptor".to_string(),
            ));
        }
        if cfg.read_enabled && cfg.rx_capacity == 0 {
            return Err(LoopError::ProtocolError(
                "rx capacity must be non-zero when reads are enabled".to_string(),
            ));
        }
        if cfg.write_enabled && cfg.tx_capacity == 0 {
            return Err(LoopError::ProtocolError(
                "tx capacity must be non-zero when writes are enabled".to_string(),
            ));
        }

        self.rxbuff = LinearBuffer::with_capacity(cfg.rx_capacity);
        self.txbuff = LinearBuffer::with_capacity(cfg.tx_capacity);
        self.stats = FdStats::default();
        self.fd = Some(fd);

        if cfg.register {
            let mut interest = Interest::empty();
            if cfg.read_enabled {
                interest |= Interest::READ;
            }
            if cfg.write_enabled {
                interest |= Interest::WRITE;
            }
            if let Err(e) = self.enable(interest) {
                // unwind to the unbound state
                self.fd = None;
                self.rxbuff = LinearBuffer::new();
                self.txbuff = LinearBuffer::new();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Deregisters, drops the buffers and releases the descriptor (closing
    /// it when owned). Idempotent.
    pub fn cleanup(&mut self) {
        if self.fd.is_none() {
            return;
        }
        if self.registered {
            if let Err(e) = self.disable() {
                warn!("deregistering adapter failed: {}", e);
            }
        }
        self.rxbuff = LinearBuffer::new();
        self.txbuff = LinearBuffer::new();
        self.token = None;
        self.fd = None;
    }

    /// Original naming for `cleanup`; whether the descriptor is closed is
    /// decided by its ownership, not by which of the two is called.
    pub fn close(&mut self) {
        self.cleanup();
    }

    /// Adds the descriptor to the kernel context with the given interest.
    /// Benign no-op when already registered.
    pub fn enable(&mut self, interest: Interest) -> Result<()> {
        if self.registered {
            return Ok(());
        }
        let fd = self.bound_raw()?;
        if interest.contains(Interest::READ) && self.rxbuff.capacity() == 0 {
            return Err(LoopError::ProtocolError(
                "cannot arm read interest with a zero-capacity rx buffer".to_string(),
            ));
        }
        if interest.contains(Interest::WRITE) && self.txbuff.capacity() == 0 {
            return Err(LoopError::ProtocolError(
                "cannot arm write interest with a zero-capacity tx buffer".to_string(),
            ));
        }
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("adapter self handle is gone".to_string())
        })?;
        let token = self.lp.register(fd, interest, &handler)?;
        self.token = Some(token);
        self.interest = interest;
        self.registered = true;
        Ok(())
    }

    /// Removes the descriptor from the kernel context. Benign no-op when
    /// not registered.
    pub fn disable(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        self.interest = Interest::empty();
        let token = self.token.take();
        if let (Some(fd), Some(token)) = (self.fd.as_ref(), token) {
            self.lp.deregister(fd.as_raw_fd(), token)?;
        }
        Ok(())
    }

    pub fn enable_read(&mut self) -> Result<()> {
        self.set_interest(Interest::READ, true)
    }

    pub fn disable_read(&mut self) -> Result<()> {
        self.set_interest(Interest::READ, false)
    }

    pub fn enable_write(&mut self) -> Result<()> {
        self.set_interest(Interest::WRITE, true)
    }

    pub fn disable_write(&mut self) -> Result<()> {
        self.set_interest(Interest::WRITE, false)
    }

    pub fn enable_urgent(&mut self) -> Result<()> {
        self.set_interest(Interest::URGENT, true)
    }

    pub fn disable_urgent(&mut self) -> Result<()> {
        self.set_interest(Interest::URGENT, false)
    }

    /// Single-flag reconciliation with the kernel context. The armed mirror
    /// changes only after the kernel accepted the modification, so the two
    /// never drift apart.
    fn set_interest(&mut self, flag: Interest, on: bool) -> Result<()> {
        if !self.registered {
            return Err(LoopError::ProtocolError(
                "adapter is not registered".to_string(),
            ));
        }
        if self.interest.contains(flag) == on {
            return Ok(());
        }
        if on && flag == Interest::READ && self.rxbuff.capacity() == 0 {
            return Err(LoopError::ProtocolError(
                "cannot arm read interest with a zero-capacity rx buffer".to_string(),
            ));
        }
        if on && flag == Interest::WRITE && self.txbuff.capacity() == 0 {
            return Err(LoopError::ProtocolError(
                "cannot arm write interest with a zero-capacity tx buffer".to_string(),
            ));
        }
        let fd = self.bound_raw()?;
        let token = self.token.ok_or_else(|| {
            LoopError::ProtocolError("adapter has no registration token".to_string())
        })?;
        let mut next = self.interest;
        if on {
            next.insert(flag);
        } else {
            next.remove(flag);
        }
        self.lp.modify(fd, token, next)?;
        self.interest = next;
        Ok(())
    }

    /// Byte-stream write: if the tx buffer is empty the bytes go to the
    /// descriptor directly first (would-block means zero accepted, not an
    /// error); whatever the descriptor did not take is buffered, capped at
    /// the tx buffer's free space. When bytes end up pending, write
    /// interest is armed regardless of the auto-disable flag so readiness
    /// events drive the flush. Returns the total bytes accepted.
    pub fn write_stream(&mut self, buf: &[u8]) -> Result<usize> {
        let mut accepted = 0usize;
        {
            let fd = match self.fd.as_ref() {
                Some(fd) => fd,
                None => {
                    return Err(LoopError::ProtocolError(
                        "adapter is not bound".to_string(),
                    ))
                }
            };
            if self.txbuff.to_read() == 0 {
                match fd.write(buf) {
                    Ok(n) => accepted = n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => accepted = 0,
                    Err(e) => {
                        error!("direct write to descriptor failed: {}", e);
                        return Err(e.into());
                    }
                }
            }
        }
        accepted += self.txbuff.write(&buf[accepted..]);
        if self.txbuff.to_read() > 0 && self.registered {
            if let Err(e) = self.enable_write() {
                warn!("arming write interest after buffered write failed: {}", e);
            }
        }
        Ok(accepted)
    }

    /// Message write: accepted in full or not at all. The message must fit
    /// in the tx buffer's free tail (so the buffered remainder of a partial
    /// direct write can never be truncated); otherwise zero bytes are
    /// accepted and nothing changes.
    pub fn write_dgram(&mut self, buf: &[u8]) -> Result<usize> {
        if self.txbuff.to_write() < buf.len() {
            return Ok(0);
        }
        let n = self.write_stream(buf)?;
        if n == buf.len() {
            Ok(n)
        } else {
            Err(LoopError::IoError(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram accepted partially",
            )))
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn rx_buffer(&self) -> &LinearBuffer {
        &self.rxbuff
    }

    pub fn rx_buffer_mut(&mut self) -> &mut LinearBuffer {
        &mut self.rxbuff
    }

    pub fn tx_buffer(&self) -> &LinearBuffer {
        &self.txbuff
    }

    pub fn tx_buffer_mut(&mut self) -> &mut LinearBuffer {
        &mut self.txbuff
    }

    pub fn stats(&self) -> &FdStats {
        &self.stats
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.lp
    }

    pub fn set_receiver(&mut self, receiver: Box<dyn FdReceiver>) {
        self.receiver = Some(receiver);
    }

    pub fn set_rx_auto(&mut self, auto_enable: bool, auto_disable: bool) {
        self.rx_auto_enable = auto_enable;
        self.rx_auto_disable = auto_disable;
    }

    pub fn set_tx_auto(&mut self, auto_enable: bool, auto_disable: bool) {
        self.tx_auto_enable = auto_enable;
        self.tx_auto_disable = auto_disable;
    }

    fn bound_raw(&self) -> Result<RawFd> {
        self.fd
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .ok_or_else(|| LoopError::ProtocolError("adapter is not bound".to_string()))
    }

    /// Runs a receiver callback with the receiver temporarily taken out, so
    /// the callback can mutate the adapter freely. A receiver installed by
    /// the callback itself replaces the taken one.
    fn with_taken_receiver<F>(&mut self, f: F) -> Outcome
    where
        F: FnOnce(&mut dyn FdReceiver, &mut FdHandler) -> Outcome,
    {
        let mut taken = self.receiver.take();
        let out = match taken.as_deref_mut() {
            Some(receiver) => f(receiver, self),
            None => f(&mut DefaultReceiver, self),
        };
        if self.receiver.is_none() {
            self.receiver = taken;
        }
        out
    }

    /// One non-blocking read into the rx buffer's free tail; the byte count
    /// (0 = end of stream) or the error goes to the rx callback.
    fn drive_read(&mut self) -> Outcome {
        let res = match self.fd.as_ref() {
            Some(fd) => fd.read(self.rxbuff.spare_mut()),
            None => return Outcome::Continue,
        };
        match res {
            Ok(n) => {
                self.rxbuff.forward(n);
                self.with_taken_receiver(move |r, me| r.rx(me, Ok(n)))
            }
            Err(e) => {
                error!("reading from descriptor failed: {}", e);
                self.with_taken_receiver(move |r, me| r.rx(me, Err(e)))
            }
        }
    }

    /// One non-blocking write from the tx buffer's unread span; the byte
    /// count or the error goes to the tx callback.
    fn drive_write(&mut self) -> Outcome {
        let res = match self.fd.as_ref() {
            Some(fd) => fd.write(self.txbuff.readable()),
            None => return Outcome::Continue,
        };
        match res {
            Ok(n) => {
                self.txbuff.skip(n);
                self.with_taken_receiver(move |r, me| r.tx(me, Ok(n)))
            }
            Err(e) => {
                error!("writing to descriptor failed: {}", e);
                self.with_taken_receiver(move |r, me| r.tx(me, Err(e)))
            }
        }
    }

    /// Reconciles armed interest with buffer occupancy per the auto flags.
    fn reconcile_auto(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        if self.rxbuff.to_write() > 0 {
            if self.rx_auto_enable {
                self.enable_read()?;
            }
        } else if self.rx_auto_disable {
            self.disable_read()?;
        }
        if self.txbuff.to_read() > 0 {
            if self.tx_auto_enable {
                self.enable_write()?;
            }
        } else if self.tx_auto_disable {
            self.disable_write()?;
        }
        Ok(())
    }
}

impl EventHandler for FdHandler {
    /// Decomposes the readiness bits in fixed precedence order (readable,
    /// writable, urgent, hangup, error, then whatever is left), stopping at
    /// the first non-Continue outcome or as soon as a callback unbound the
    /// adapter. The auto-policy pass and the exit hook run only when the
    /// whole decomposition completed.
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        let mut bits = readiness;

        let out = self.with_taken_receiver(|r, me| r.enter(me, &mut bits));
        if out != Outcome::Continue || self.fd.is_none() {
            return out;
        }

        if bits.contains(Readiness::READ) {
            bits.remove(Readiness::READ);
            self.stats.readable += 1;
            let out = self.drive_read();
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if bits.contains(Readiness::WRITE) {
            bits.remove(Readiness::WRITE);
            self.stats.writable += 1;
            let out = self.drive_write();
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if bits.contains(Readiness::URGENT) {
            bits.remove(Readiness::URGENT);
            self.stats.urgent += 1;
            let out = self.with_taken_receiver(|r, me| r.urgent(me));
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if bits.contains(Readiness::HANGUP) {
            bits.remove(Readiness::HANGUP);
            self.stats.hangup += 1;
            let out = self.with_taken_receiver(|r, me| r.hangup(me));
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if bits.contains(Readiness::ERROR) {
            bits.remove(Readiness::ERROR);
            self.stats.error += 1;
            let out = self.with_taken_receiver(|r, me| r.error(me));
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if !bits.is_empty() {
            let residue = bits;
            let out = self.with_taken_receiver(move |r, me| r.unknown(me, residue));
            if out != Outcome::Continue || self.fd.is_none() {
                return out;
            }
        }

        if self.reconcile_auto().is_err() {
            return Outcome::Fail;
        }

        self.with_taken_receiver(move |r, me| r.exit(me, bits))
    }
}

impl Drop for FdHandler {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn set_nonblocking(fd: RawFd) {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert!(flags >= 0);
        assert!(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } >= 0);
    }

    fn close_fd(fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn write_all(fd: RawFd, data: &[u8]) {
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        assert_eq!(n, data.len() as isize);
    }

    fn new_loop() -> Rc<EventLoop> {
        Rc::new(EventLoop::new().unwrap())
    }

    #[test]
    fn test_init_is_idempotent() {
        let lp = new_loop();
        let (rd, wr) = pipe();
        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 8,
            register: false,
            ..Default::default()
        };
        fdh.borrow_mut().init(rd, &cfg).unwrap();
        // rebinding keeps the existing state
        let cfg2 = FdConfig {
            rx_capacity: 32,
            register: false,
            ..Default::default()
        };
        fdh.borrow_mut().init(rd, &cfg2).unwrap();
        assert_eq!(fdh.borrow().rx_buffer().capacity(), 8);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_bind_rejects_zero_capacity_with_interest() {
        let lp = new_loop();
        let (rd, wr) = pipe();
        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 0,
            read_enabled: true,
            register: false,
            ..Default::default()
        };
        assert!(fdh.borrow_mut().init(rd, &cfg).is_err());
        assert!(fdh.borrow().fd().is_none());
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_interest_mirror_tracks_kernel_state() {
        let lp = new_loop();
        let (rd, wr) = pipe();
        let fdh = FdHandler::new(&lp);
        fdh.borrow_mut().init(rd, &FdConfig::default()).unwrap();

        let mut h = fdh.borrow_mut();
        assert!(h.is_registered());
        assert_eq!(h.interest(), Interest::READ);
        h.enable_write().unwrap();
        assert_eq!(h.interest(), Interest::READ | Interest::WRITE);
        // redundant transitions are no-ops
        h.enable_write().unwrap();
        h.disable_read().unwrap();
        h.disable_read().unwrap();
        assert_eq!(h.interest(), Interest::WRITE);
        h.disable().unwrap();
        assert!(!h.is_registered());
        assert_eq!(h.interest(), Interest::empty());
        h.disable().unwrap();
        drop(h);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_write_stream_direct_when_tx_empty() {
        // Scenario B second half: an empty tx buffer and a willing
        // descriptor mean everything goes out directly.
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(wr);
        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 0,
            tx_capacity: 10,
            read_enabled: false,
            write_enabled: false,
            register: false,
        };
        fdh.borrow_mut().init(wr, &cfg).unwrap();

        let n = fdh.borrow_mut().write_dgram(b"0123456789").unwrap();
        assert_eq!(n, 10);
        assert_eq!(fdh.borrow().tx_buffer().to_read(), 0);

        let mut out = [0u8; 16];
        let got = unsafe { libc::read(rd, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(got, 10);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_write_dgram_rejects_oversized_message() {
        // Scenario B first half: a 10-byte message against an 8-byte tx
        // buffer is rejected whole, nothing changes.
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(wr);
        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 0,
            tx_capacity: 8,
            read_enabled: false,
            write_enabled: false,
            register: false,
        };
        fdh.borrow_mut().init(wr, &cfg).unwrap();

        let n = fdh.borrow_mut().write_dgram(b"0123456789").unwrap();
        assert_eq!(n, 0);
        assert_eq!(fdh.borrow().tx_buffer().to_read(), 0);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_write_stream_conservation_when_kernel_full() {
        // P4: with the pipe full, the direct write would block (0 bytes)
        // and the remainder is buffered, capped at tx free space.
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(wr);
        unsafe {
            libc::fcntl(wr, libc::F_SETPIPE_SZ, 4096);
        }
        // fill the kernel buffer
        let chunk = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::write(wr, chunk.as_ptr() as *const libc::c_void, chunk.len())
            };
            if n < 0 {
                break;
            }
        }

        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 0,
            tx_capacity: 16,
            read_enabled: false,
            write_enabled: false,
            register: false,
        };
        fdh.borrow_mut().init(wr, &cfg).unwrap();

        let payload = b"0123456789ABCDEFGHIJ"; // 20 bytes
        let n = fdh.borrow_mut().write_stream(payload).unwrap();
        assert_eq!(n, 16); // 0 direct + 16 buffered
        assert_eq!(fdh.borrow().tx_buffer().to_read(), 16);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_buffered_write_arms_write_interest() {
        // Arming on pending bytes ignores the auto-disable flag.
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(wr);
        unsafe {
            libc::fcntl(wr, libc::F_SETPIPE_SZ, 4096);
        }
        let chunk = [0u8; 1024];
        loop {
            let n = unsafe {
                libc::write(wr, chunk.as_ptr() as *const libc::c_void, chunk.len())
            };
            if n < 0 {
                break;
            }
        }

        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            rx_capacity: 0,
            tx_capacity: 16,
            read_enabled: false,
            write_enabled: false,
            register: true,
        };
        fdh.borrow_mut().init(wr, &cfg).unwrap();
        fdh.borrow_mut().set_tx_auto(false, false);

        assert_eq!(fdh.borrow().interest(), Interest::empty());
        fdh.borrow_mut().write_stream(b"pending").unwrap();
        assert!(fdh.borrow().interest().contains(Interest::WRITE));
        close_fd(rd);
        close_fd(wr);
    }

    struct Collector {
        chunks: Rc<RefCell<Vec<Vec<u8>>>>,
        eof: Rc<Cell<bool>>,
    }

    impl FdReceiver for Collector {
        fn rx(&mut self, fdh: &mut FdHandler, len: io::Result<usize>) -> Outcome {
            match len {
                Ok(0) => {
                    self.eof.set(true);
                    Outcome::Stop
                }
                Ok(_) => {
                    self.chunks
                        .borrow_mut()
                        .push(fdh.rx_buffer().readable().to_vec());
                    Outcome::Continue
                }
                Err(_) => Outcome::Fail,
            }
        }

        fn hangup(&mut self, _fdh: &mut FdHandler) -> Outcome {
            Outcome::Stop
        }
    }

    #[test]
    fn test_backpressure_cycle_with_auto_policy() {
        // Scenario A: rx capacity 4, six bytes written. First cycle reads
        // four bytes and fills the buffer, so auto-disable clears read
        // interest; the consumer drains and re-arms from the timeout hook;
        // the second cycle delivers the remaining two bytes.
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(rd);
        write_all(wr, b"abcdef");

        let chunks = Rc::new(RefCell::new(Vec::new()));
        let eof = Rc::new(Cell::new(false));
        let fdh = FdHandler::with_receiver(
            &lp,
            Box::new(Collector {
                chunks: Rc::clone(&chunks),
                eof: Rc::clone(&eof),
            }),
        );
        let cfg = FdConfig {
            rx_capacity: 4,
            tx_capacity: 0,
            read_enabled: true,
            write_enabled: false,
            register: true,
        };
        fdh.borrow_mut().init(rd, &cfg).unwrap();

        lp.set_timeout(50);
        let passes = Rc::new(Cell::new(0));
        {
            let fdh = Rc::clone(&fdh);
            let passes = Rc::clone(&passes);
            lp.set_timeout_hook(move |_| {
                passes.set(passes.get() + 1);
                let mut h = fdh.borrow_mut();
                if passes.get() == 1 {
                    // the full buffer disarmed read interest (P5)
                    assert!(!h.interest().contains(Interest::READ));
                    h.rx_buffer_mut().clear();
                    h.enable_read().unwrap();
                    Outcome::Continue
                } else {
                    assert!(h.interest().contains(Interest::READ));
                    Outcome::Stop
                }
            });
        }
        let rounds = Rc::new(Cell::new(0));
        {
            let rounds = Rc::clone(&rounds);
            lp.set_pre_wait_hook(move |_| {
                rounds.set(rounds.get() + 1);
                if rounds.get() > 20 {
                    Outcome::Fail
                } else {
                    Outcome::Continue
                }
            });
        }

        assert!(lp.run().is_ok());
        let got = chunks.borrow();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], b"abcd");
        assert_eq!(got[1], b"ef");
        assert_eq!(fdh.borrow().stats().readable, 2);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_end_of_stream_reaches_rx_callback() {
        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(rd);
        write_all(wr, b"xy");
        close_fd(wr);

        let chunks = Rc::new(RefCell::new(Vec::new()));
        let eof = Rc::new(Cell::new(false));
        let fdh = FdHandler::with_receiver(
            &lp,
            Box::new(Collector {
                chunks: Rc::clone(&chunks),
                eof: Rc::clone(&eof),
            }),
        );
        let cfg = FdConfig {
            rx_capacity: 16,
            tx_capacity: 0,
            read_enabled: true,
            write_enabled: false,
            register: true,
        };
        fdh.borrow_mut().init(rd, &cfg).unwrap();

        // First cycle delivers the data; the receiver leaves it in place,
        // but capacity remains, so read interest stays armed and the next
        // cycle sees end of stream (or the hangup, whichever the kernel
        // reports first) and stops the loop.
        lp.set_timeout(1000);
        lp.set_timeout_hook(|_| Outcome::Fail);
        assert!(lp.run().is_ok());
        assert_eq!(chunks.borrow().len(), 1);
        assert_eq!(chunks.borrow()[0], b"xy");
        close_fd(rd);
    }

    #[test]
    fn test_self_close_inside_callback_is_safe() {
        struct SelfCloser;
        impl FdReceiver for SelfCloser {
            fn rx(&mut self, fdh: &mut FdHandler, _len: io::Result<usize>) -> Outcome {
                fdh.close();
                fdh.event_loop().exit(Outcome::Stop);
                Outcome::Continue
            }
        }

        let lp = new_loop();
        let (rd, wr) = pipe();
        set_nonblocking(rd);
        write_all(wr, b"z");

        let fdh = FdHandler::with_receiver(&lp, Box::new(SelfCloser));
        fdh.borrow_mut().init(rd, &FdConfig::default()).unwrap();

        assert!(lp.run().is_ok());
        assert!(fdh.borrow().fd().is_none());
        assert_eq!(lp.registered_count(), 0);
        close_fd(rd);
        close_fd(wr);
    }

    #[test]
    fn test_open_binds_and_close_releases() {
        let lp = new_loop();
        let fdh = FdHandler::new(&lp);
        let cfg = FdConfig {
            register: false,
            ..Default::default()
        };
        fdh.borrow_mut()
            .open(Path::new("/dev/null"), libc::O_RDONLY, &cfg)
            .unwrap();
        assert!(fdh.borrow().fd().is_some());
        // reopening is a no-op while bound
        fdh.borrow_mut()
            .open(Path::new("/dev/zero"), libc::O_RDONLY, &cfg)
            .unwrap();
        fdh.borrow_mut().close();
        assert!(fdh.borrow().fd().is_none());
        fdh.borrow_mut().close();
    }

    #[test]
    fn test_cleanup_is_idempotent_and_runs_on_drop() {
        let lp = new_loop();
        let (rd, wr) = pipe();
        let fdh = FdHandler::new(&lp);
        fdh.borrow_mut().init(rd, &FdConfig::default()).unwrap();
        assert_eq!(lp.registered_count(), 1);
        fdh.borrow_mut().cleanup();
        fdh.borrow_mut().cleanup();
        assert_eq!(lp.registered_count(), 0);

        let fdh2 = FdHandler::new(&lp);
        fdh2.borrow_mut().init(rd, &FdConfig::default()).unwrap();
        assert_eq!(lp.registered_count(), 1);
        drop(fdh2);
        assert_eq!(lp.registered_count(), 0);
        close_fd(rd);
        close_fd(wr);
    }
}
