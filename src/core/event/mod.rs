pub mod event;
pub mod event_loop;
pub mod handler;
pub mod poller;

pub use event::{Interest, Outcome, Readiness, ReadyEvent, Token};
pub use event_loop::EventLoop;
pub use handler::EventHandler;
pub use poller::Poller;
