pub mod buffer;
pub mod constants;
pub mod error;
pub mod logger;

pub use buffer::LinearBuffer;
pub use error::{LoopError, Result};
pub use logger::Logger;
