pub const DEFAULT_RX_CAPACITY: usize = 1024;
pub const DEFAULT_TX_CAPACITY: usize = 1024;

/// Poll timeout in milliseconds; -1 blocks indefinitely, 0 returns immediately.
pub const DEFAULT_POLL_TIMEOUT_MS: i32 = -1;

/// Maximum number of events drained per wait call.
pub const DEFAULT_MAX_EVENTS: usize = 64;

pub const DEFAULT_LISTEN_PORT: u16 = 7777;
