pub mod notify;
pub mod signal;
pub mod timer;
pub mod watch;

pub use notify::{Notifier, NotifyReceiver};
pub use signal::{block_signals, SignalHandler, SignalReceiver};
pub use timer::{TimerHandler, TimerReceiver};
pub use watch::{WatchEvent, WatchHandler, WatchReceiver};
