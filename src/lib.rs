//! Readiness-based event dispatch for Linux.
//!
//! A thin polymorphic layer over epoll: handlers implementing
//! [`EventHandler`] register descriptors with the [`EventLoop`] and react
//! to readiness notifications from a single-threaded wait/dispatch cycle.
//! [`FdHandler`] layers a buffered byte-stream/datagram abstraction over
//! any descriptor; the `sources` module wraps timerfd, signalfd, eventfd
//! and inotify as ready-made handlers, and `core::net` adds non-blocking
//! TCP accept and connect sources.

pub mod common;
pub mod config;
pub mod core;
pub mod sources;

pub use crate::common::buffer::LinearBuffer;
pub use crate::common::error::{LoopError, Result};
pub use crate::core::event::{
    EventHandler, EventLoop, Interest, Outcome, Poller, Readiness, ReadyEvent, Token,
};
pub use crate::core::fd::{DefaultReceiver, FdConfig, FdHandler, FdReceiver, FdStats, FileDescriptor};
pub use crate::core::net::{AcceptReceiver, ConnectReceiver, TcpClient, TcpServer};
