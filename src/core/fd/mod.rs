pub mod fd;
pub mod handler;
pub mod receiver;

pub use fd::{open_path, FileDescriptor};
pub use handler::{FdConfig, FdHandler, FdStats};
pub use receiver::{DefaultReceiver, FdReceiver};
