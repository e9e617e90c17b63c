pub mod socket;
pub mod tcp;

pub use socket::{fill_sockaddr, so_error};
pub use tcp::{AcceptReceiver, ConnectReceiver, TcpClient, TcpServer};
