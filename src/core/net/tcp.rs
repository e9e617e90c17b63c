use log::{error, warn};
use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::rc::{Rc, Weak};

use crate::common::error::{LoopError, Result};
use crate::core::event::event::{Interest, Outcome, Readiness, Token};
use crate::core::event::event_loop::EventLoop;
use crate::core::event::handler::EventHandler;
use crate::core::fd::fd::FileDescriptor;
use crate::core::net::socket::{fill_sockaddr, so_error};

/// Callback capability of the accept source.
pub trait AcceptReceiver {
    /// A connection was accepted. The stream is already non-blocking;
    /// hand its descriptor to a stream adapter to speak bytes over it.
    /// Default: drop the connection.
    fn accepted(
        &mut self,
        _srv: &mut TcpServer,
        _stream: TcpStream,
        peer: SocketAddr,
    ) -> Outcome {
        warn!("unhandled accepted connection from {}", peer);
        Outcome::Continue
    }
}

/// Listening socket event source: one accept per readable notification,
/// delivered to the receiver. Pending connections beyond the first are
/// re-reported by the next wait.
pub struct TcpServer {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    listener: Option<TcpListener>,
    token: Option<Token>,
    receiver: Option<Box<dyn AcceptReceiver>>,
}

impl TcpServer {
    pub fn new(lp: &Rc<EventLoop>, receiver: Box<dyn AcceptReceiver>) -> Rc<RefCell<TcpServer>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<TcpServer>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(TcpServer {
                lp: Rc::clone(lp),
                self_handle,
                listener: None,
                token: None,
                receiver: Some(receiver),
            })
        })
    }

    /// Binds a non-blocking listener and registers it for readability.
    /// Benign no-op when already listening.
    pub fn listen(&mut self, addr: SocketAddr) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }
        let listener = TcpListener::bind(addr).map_err(|e| {
            error!("binding listener to {} failed: {}", addr, e);
            LoopError::IoError(e)
        })?;
        listener.set_nonblocking(true)?;
        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("server self handle is gone".to_string())
        })?;
        let token = self
            .lp
            .register(listener.as_raw_fd(), Interest::READ, &handler)?;
        self.listener = Some(listener);
        self.token = Some(token);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            LoopError::ProtocolError("server is not listening".to_string())
        })?;
        Ok(listener.local_addr()?)
    }

    /// Deregisters and closes the listener. Idempotent.
    pub fn cleanup(&mut self) {
        if let (Some(listener), Some(token)) = (self.listener.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(listener.as_raw_fd(), token) {
                warn!("deregistering listener failed: {}", e);
            }
        }
    }

    fn drive_accept(&mut self) -> Outcome {
        let accepted = match self.listener.as_ref() {
            Some(listener) => listener.accept(),
            None => return Outcome::Continue,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    error!("setting accepted socket non-blocking failed: {}", e);
                    return Outcome::Fail;
                }
                let mut taken = self.receiver.take();
                let out = match taken.as_deref_mut() {
                    Some(receiver) => receiver.accepted(self, stream, peer),
                    None => {
                        warn!("unhandled accepted connection from {}", peer);
                        Outcome::Continue
                    }
                };
                if self.receiver.is_none() {
                    self.receiver = taken;
                }
                out
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Outcome::Continue,
            Err(e) => {
                error!("accepting on listener failed: {}", e);
                Outcome::Fail
            }
        }
    }
}

impl EventHandler for TcpServer {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        if readiness.is_readable() {
            let out = self.drive_accept();
            if out != Outcome::Continue {
                return out;
            }
        }
        if readiness.is_hangup() || readiness.is_error() {
            error!("unexpected readiness on listener: {:#x}", readiness.bits());
            return Outcome::Fail;
        }
        Outcome::Continue
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Callback capability of the connect source.
pub trait ConnectReceiver {
    /// The non-blocking connect finished, successfully or not. On success
    /// the connected stream is handed over; wire it into a stream adapter
    /// to speak bytes. Default: drop the result.
    fn connected(&mut self, _cli: &mut TcpClient, _stream: io::Result<TcpStream>) -> Outcome {
        warn!("unhandled connect completion");
        Outcome::Continue
    }
}

/// Non-blocking connect event source: issues the connect, waits for
/// writability, probes the socket error and delivers the completed stream.
/// The source deregisters itself once the completion is delivered.
pub struct TcpClient {
    lp: Rc<EventLoop>,
    self_handle: Weak<RefCell<dyn EventHandler>>,
    fd: Option<FileDescriptor>,
    token: Option<Token>,
    connecting: bool,
    receiver: Option<Box<dyn ConnectReceiver>>,
}

impl TcpClient {
    pub fn new(lp: &Rc<EventLoop>, receiver: Box<dyn ConnectReceiver>) -> Rc<RefCell<TcpClient>> {
        Rc::new_cyclic(|weak: &Weak<RefCell<TcpClient>>| {
            let self_handle: Weak<RefCell<dyn EventHandler>> = weak.clone();
            RefCell::new(TcpClient {
                lp: Rc::clone(lp),
                self_handle,
                fd: None,
                token: None,
                connecting: false,
                receiver: Some(receiver),
            })
        })
    }

    /// Starts a non-blocking connect and registers for writability; the
    /// receiver hears about the completion. Benign no-op while a connect is
    /// pending.
    pub fn connect(&mut self, addr: SocketAddr) -> Result<()> {
        if self.fd.is_some() {
            return Ok(());
        }
        let domain = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let raw = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if raw < 0 {
            let e = io::Error::last_os_error();
            error!("creating socket failed: {}", e);
            return Err(e.into());
        }
        let fd = FileDescriptor::from_raw(raw);

        let (storage, len) = fill_sockaddr(&addr);
        let ret = unsafe {
            libc::connect(raw, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() != Some(libc::EINPROGRESS) {
                error!("connecting to {} failed: {}", addr, e);
                return Err(e.into());
            }
        }

        let handler = self.self_handle.upgrade().ok_or_else(|| {
            LoopError::ProtocolError("client self handle is gone".to_string())
        })?;
        let token = self.lp.register(raw, Interest::WRITE, &handler)?;
        self.fd = Some(fd);
        self.token = Some(token);
        self.connecting = true;
        Ok(())
    }

    /// Abandons a pending connect. Idempotent.
    pub fn cleanup(&mut self) {
        self.connecting = false;
        if let (Some(fd), Some(token)) = (self.fd.take(), self.token.take()) {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering client socket failed: {}", e);
            }
        }
    }

    fn complete(&mut self) -> Outcome {
        self.connecting = false;
        let fd = match self.fd.take() {
            Some(fd) => fd,
            None => return Outcome::Continue,
        };
        if let Some(token) = self.token.take() {
            if let Err(e) = self.lp.deregister(fd.as_raw_fd(), token) {
                warn!("deregistering client socket failed: {}", e);
            }
        }
        let result = match so_error(fd.as_raw_fd()) {
            Ok(0) => Ok(unsafe { TcpStream::from_raw_fd(fd.into_raw()) }),
            Ok(code) => Err(io::Error::from_raw_os_error(code)),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e.to_string())),
        };
        if let Err(ref e) = result {
            error!("connect completion failed: {}", e);
        }

        let mut taken = self.receiver.take();
        let out = match taken.as_deref_mut() {
            Some(receiver) => receiver.connected(self, result),
            None => {
                warn!("unhandled connect completion");
                Outcome::Continue
            }
        };
        if self.receiver.is_none() {
            self.receiver = taken;
        }
        out
    }
}

impl EventHandler for TcpClient {
    fn ready(&mut self, _lp: &EventLoop, readiness: Readiness) -> Outcome {
        if self.connecting {
            // Writability reports success; error and hangup bits report a
            // refused or unreachable peer. Either way the socket error
            // probe decides.
            return self.complete();
        }
        error!(
            "unexpected readiness on idle tcp client: {:#x}",
            readiness.bits()
        );
        Outcome::Fail
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.cleanup();
    }
}
